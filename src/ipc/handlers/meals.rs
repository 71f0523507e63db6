use crate::ipc::error::{err, err_with_errors, ok};
use crate::ipc::helpers::{get_required_str, now_stamp, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{
    self, BatchError, BatchRules, Candidate, PeriodRule, ScheduleSlot, ScheduleStore,
};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const MEAL_BATCH_MAX_ITEMS: usize = 500;

#[derive(Debug, Clone)]
struct MealItem {
    dish: String,
    notes: Option<String>,
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn meal_rules() -> BatchRules {
    BatchRules {
        scope_noun: "day",
        category_noun: "meal type",
        allowed_scopes: Some(&schedule::WEEK_DAYS),
        allowed_categories: schedule::MEAL_TYPES.iter().map(|s| s.to_string()).collect(),
        period: PeriodRule::MonthKey,
    }
}

/// Meal-plan persistence, scoped to one class and month.
struct MealPlanStore<'a> {
    conn: &'a Connection,
    class_id: String,
    month: String,
}

impl ScheduleStore for MealPlanStore<'_> {
    type Item = MealItem;

    fn existing_keys(&self) -> anyhow::Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT day, meal_type FROM meal_plans WHERE class_id = ? AND month = ?")
            .context("prepare meal plan key query")?;
        let keys = stmt
            .query_map((&self.class_id, &self.month), |r| {
                let day: String = r.get(0)?;
                let meal_type: String = r.get(1)?;
                Ok(schedule::build_key(&ScheduleSlot::new(
                    day,
                    self.month.clone(),
                    meal_type,
                )))
            })
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
            .context("read meal plan keys")?;
        Ok(keys)
    }

    fn insert_many(&mut self, items: &[Candidate<MealItem>]) -> anyhow::Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("begin meal plan insert")?;
        for cand in items {
            let plan_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO meal_plans(id, class_id, month, day, meal_type, dish, notes, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &plan_id,
                    &self.class_id,
                    &cand.slot.period,
                    &cand.slot.scope,
                    &cand.slot.category,
                    &cand.payload.dish,
                    &cand.payload.notes,
                    now_stamp(),
                ),
            )
            .context("insert meal plan row")?;
        }
        tx.commit().context("commit meal plan insert")?;
        Ok(items.len())
    }

    fn project(&self) -> anyhow::Result<serde_json::Value> {
        project_month(self.conn, &self.class_id, &self.month)
    }
}

/// Week grid for one month: every school day crossed with every meal
/// type, unplanned slots as null.
fn project_month(
    conn: &Connection,
    class_id: &str,
    month: &str,
) -> anyhow::Result<serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT id, day, meal_type, dish, notes
             FROM meal_plans
             WHERE class_id = ? AND month = ?",
        )
        .context("prepare meal plan grid query")?;
    let rows = stmt
        .query_map((class_id, month), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("read meal plan grid")?;

    let days: Vec<serde_json::Value> = schedule::WEEK_DAYS
        .iter()
        .map(|day| {
            let mut meals = serde_json::Map::new();
            for meal_type in schedule::MEAL_TYPES {
                let planned = rows
                    .iter()
                    .find(|(_, d, t, _, _)| d == day && t == meal_type)
                    .map(|(id, _, _, dish, notes)| {
                        json!({ "id": id, "dish": dish, "notes": notes })
                    })
                    .unwrap_or(serde_json::Value::Null);
                meals.insert(meal_type.to_string(), planned);
            }
            json!({ "day": day, "meals": meals })
        })
        .collect();

    Ok(json!({ "month": month, "days": days }))
}

fn meals_month_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month = get_required_str(params, "month")?;
    if schedule::parse_month_key(&month).is_none() {
        return Err(HandlerErr::bad_params("month must be YYYY-MM"));
    }
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    project_month(conn, &class_id, &month).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_meals_month_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match meals_month_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_meals_generate_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let month = match req.params.get("month").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing month", None),
    };
    let Some(items_arr) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items[]", None);
    };
    if items_arr.len() > MEAL_BATCH_MAX_ITEMS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "batch exceeds max items: {} > {}",
                items_arr.len(),
                MEAL_BATCH_MAX_ITEMS
            ),
            None,
        );
    }

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut candidates: Vec<Candidate<MealItem>> = Vec::with_capacity(items_arr.len());
    for (i, item) in items_arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("item at index {} must be an object", i),
                None,
            );
        };

        let mut missing: Vec<&'static str> = Vec::new();
        let day = match obj.get("day").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("day");
                String::new()
            }
        };
        let meal_type = match obj.get("mealType").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("mealType");
                String::new()
            }
        };
        let dish = match obj.get("dish").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("dish");
                String::new()
            }
        };
        let notes = obj
            .get("notes")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        candidates.push(Candidate {
            slot: ScheduleSlot::new(day, month.clone(), meal_type),
            payload: MealItem { dish, notes },
            missing,
        });
    }

    let mut store = MealPlanStore {
        conn,
        class_id,
        month,
    };
    match schedule::run_batch(&mut store, candidates, &meal_rules(), Vec::new()) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "inserted": outcome.inserted,
                "projection": outcome.projection
            }),
        ),
        Err(BatchError::Empty) => err(&req.id, "empty_batch", "batch must be non-empty", None),
        Err(BatchError::Invalid(errors)) => err_with_errors(
            &req.id,
            "invalid_batch",
            "cannot add meals: batch failed validation, nothing was inserted",
            errors,
        ),
        Err(BatchError::Duplicates(errors)) => err_with_errors(
            &req.id,
            "duplicate_items",
            "cannot add meals: batch contains duplicates, nothing was inserted",
            errors,
        ),
        Err(BatchError::Store(e)) => err(&req.id, "db_insert_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "meals.monthOpen" => Some(handle_meals_month_open(state, req)),
        "meals.generateBatch" => Some(handle_meals_generate_batch(state, req)),
        _ => None,
    }
}
