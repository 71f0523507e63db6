use crate::ipc::error::{err, err_with_errors, ok};
use crate::ipc::helpers::{get_required_str, now_stamp, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{
    self, BatchError, BatchRules, Candidate, PeriodRule, ScheduleSlot, ScheduleStore,
};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const FEE_BATCH_MAX_ITEMS: usize = 5000;

const FEE_STATUSES: [&str; 2] = ["due", "paid"];

#[derive(Debug, Clone)]
struct FeeItem {
    title: String,
    amount: f64,
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn fee_group_names(conn: &Connection, class_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT name FROM fee_groups WHERE class_id = ? ORDER BY sort_order")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn fee_rules(allowed_groups: Vec<String>) -> BatchRules {
    BatchRules {
        scope_noun: "student",
        category_noun: "fee group",
        // Students live in the database, so scope membership is checked
        // by the call site against the roster.
        allowed_scopes: None,
        allowed_categories: allowed_groups,
        period: PeriodRule::Tokens(&schedule::MONTH_NAMES),
    }
}

/// Fee-item persistence, scoped to one class and month.
struct FeeItemStore<'a> {
    conn: &'a Connection,
    class_id: String,
    month: String,
}

impl ScheduleStore for FeeItemStore<'_> {
    type Item = FeeItem;

    fn existing_keys(&self) -> anyhow::Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id, fee_group FROM fee_items WHERE class_id = ? AND month = ?")
            .context("prepare fee item key query")?;
        let keys = stmt
            .query_map((&self.class_id, &self.month), |r| {
                let student_id: String = r.get(0)?;
                let fee_group: String = r.get(1)?;
                Ok(schedule::build_key(&ScheduleSlot::new(
                    student_id,
                    self.month.clone(),
                    fee_group,
                )))
            })
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
            .context("read fee item keys")?;
        Ok(keys)
    }

    fn insert_many(&mut self, items: &[Candidate<FeeItem>]) -> anyhow::Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("begin fee item insert")?;
        for cand in items {
            let fee_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO fee_items(id, class_id, student_id, month, fee_group, title, amount, status, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 'due', ?)",
                (
                    &fee_id,
                    &self.class_id,
                    &cand.slot.scope,
                    &cand.slot.period,
                    &cand.slot.category,
                    &cand.payload.title,
                    cand.payload.amount,
                    now_stamp(),
                ),
            )
            .context("insert fee item row")?;
        }
        tx.commit().context("commit fee item insert")?;
        Ok(items.len())
    }

    fn project(&self) -> anyhow::Result<serde_json::Value> {
        project_month(self.conn, &self.class_id, &self.month)
    }
}

/// Per-student fee view for one month: every student in roster order
/// with their items and a running total.
fn project_month(
    conn: &Connection,
    class_id: &str,
    month: &str,
) -> anyhow::Result<serde_json::Value> {
    let mut student_stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .context("prepare student roster query")?;
    let students = student_stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                format!("{}, {}", last, first),
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("read student roster")?;

    let mut item_stmt = conn
        .prepare(
            "SELECT id, student_id, fee_group, title, amount, status
             FROM fee_items
             WHERE class_id = ? AND month = ?
             ORDER BY fee_group",
        )
        .context("prepare fee item query")?;
    let mut by_student: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    let mut totals: HashMap<String, f64> = HashMap::new();
    let rows = item_stmt
        .query_map((class_id, month), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("read fee items")?;
    for (id, student_id, fee_group, title, amount, status) in rows {
        *totals.entry(student_id.clone()).or_insert(0.0) += amount;
        by_student.entry(student_id).or_default().push(json!({
            "id": id,
            "feeGroup": fee_group,
            "title": title,
            "amount": amount,
            "status": status
        }));
    }

    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, display_name, active)| {
            json!({
                "studentId": id,
                "displayName": display_name,
                "active": active,
                "items": by_student.get(id).cloned().unwrap_or_default(),
                "total": totals.get(id).copied().unwrap_or(0.0)
            })
        })
        .collect();

    Ok(json!({ "month": month, "students": rows_json }))
}

fn fees_groups_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    let mut stmt = conn
        .prepare("SELECT id, name, sort_order FROM fee_groups WHERE class_id = ? ORDER BY sort_order")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let groups = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let sort_order: i64 = r.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "groups": groups }))
}

fn fees_group_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    // The composite schedule key reserves '|'.
    if name.contains('|') {
        return Err(HandlerErr::bad_params("name must not contain '|'"));
    }
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM fee_groups WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_groups(id, class_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (&group_id, &class_id, &name, next_sort),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "groupId": group_id, "name": name, "sortOrder": next_sort }))
}

fn fees_month_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month = get_required_str(params, "month")?;
    if !schedule::MONTH_NAMES.contains(&month.as_str()) {
        return Err(HandlerErr::bad_params("month must be a month name"));
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

fn fees_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let fee_item_id = get_required_str(params, "feeItemId")?;
    let status = get_required_str(params, "status")?;
    if !FEE_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params("status must be one of: due, paid"));
    }

    let changed = conn
        .execute(
            "UPDATE fee_items SET status = ?, updated_at = ? WHERE class_id = ? AND id = ?",
            (&status, now_stamp(), &class_id, &fee_item_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "fee item not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn fees_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month = get_required_str(params, "month")?;
    if !schedule::MONTH_NAMES.contains(&month.as_str()) {
        return Err(HandlerErr::bad_params("month must be a month name"));
    }

    let mut group_stmt = conn
        .prepare(
            "SELECT fee_group,
                    COUNT(*),
                    SUM(amount),
                    SUM(CASE WHEN status = 'paid' THEN amount ELSE 0 END)
             FROM fee_items
             WHERE class_id = ? AND month = ?
             GROUP BY fee_group
             ORDER BY fee_group",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let by_group = group_stmt
        .query_map((&class_id, &month), |r| {
            let fee_group: String = r.get(0)?;
            let item_count: i64 = r.get(1)?;
            let total: f64 = r.get(2)?;
            let paid: f64 = r.get(3)?;
            Ok(json!({
                "feeGroup": fee_group,
                "itemCount": item_count,
                "total": total,
                "paid": paid,
                "outstanding": total - paid
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut student_stmt = conn
        .prepare(
            "SELECT s.id,
                    s.last_name,
                    s.first_name,
                    COUNT(f.id),
                    COALESCE(SUM(f.amount), 0),
                    COALESCE(SUM(CASE WHEN f.status = 'paid' THEN f.amount ELSE 0 END), 0)
             FROM students s
             LEFT JOIN fee_items f
               ON f.student_id = s.id AND f.class_id = s.class_id AND f.month = ?
             WHERE s.class_id = ?
             GROUP BY s.id
             ORDER BY s.sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let by_student = student_stmt
        .query_map((&month, &class_id), |r| {
            let student_id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let item_count: i64 = r.get(3)?;
            let total: f64 = r.get(4)?;
            let paid: f64 = r.get(5)?;
            Ok(json!({
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "itemCount": item_count,
                "total": total,
                "paid": paid,
                "outstanding": total - paid
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let (total, paid): (f64, f64) = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0),
                    COALESCE(SUM(CASE WHEN status = 'paid' THEN amount ELSE 0 END), 0)
             FROM fee_items
             WHERE class_id = ? AND month = ?",
            (&class_id, &month),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "month": month,
        "byGroup": by_group,
        "byStudent": by_student,
        "total": total,
        "paid": paid,
        "outstanding": total - paid
    }))
}

fn handle_fees_generate_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if items_arr.len() > FEE_BATCH_MAX_ITEMS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "batch exceeds max items: {} > {}",
                items_arr.len(),
                FEE_BATCH_MAX_ITEMS
            ),
            None,
        );
    }

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return e.response(&req.id),
    }

    let allowed_groups = match fee_group_names(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let roster: HashSet<String> = {
        let mut stmt = match conn.prepare("SELECT id FROM students WHERE class_id = ?") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut candidates: Vec<Candidate<FeeItem>> = Vec::with_capacity(items_arr.len());
    let mut extra_errors: Vec<String> = Vec::new();
    for (i, item) in items_arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("item at index {} must be an object", i),
                None,
            );
        };

        let n = i + 1;
        let mut missing: Vec<&'static str> = Vec::new();
        let student_id = match obj.get("studentId").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("studentId");
                String::new()
            }
        };
        let fee_group = match obj.get("feeGroup").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("feeGroup");
                String::new()
            }
        };
        let title = match obj.get("title").and_then(|v| v.as_str()).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push("title");
                String::new()
            }
        };
        let amount = match obj.get("amount").and_then(|v| v.as_f64()) {
            Some(v) => {
                if v <= 0.0 {
                    extra_errors.push(format!("item {}: amount must be > 0", n));
                }
                v
            }
            None => {
                missing.push("amount");
                0.0
            }
        };
        if !student_id.is_empty() && !roster.contains(&student_id) {
            extra_errors.push(format!("item {}: student not found in class", n));
        }

        candidates.push(Candidate {
            slot: ScheduleSlot::new(student_id, month.clone(), fee_group),
            payload: FeeItem { title, amount },
            missing,
        });
    }

    let mut store = FeeItemStore {
        conn,
        class_id,
        month,
    };
    match schedule::run_batch(&mut store, candidates, &fee_rules(allowed_groups), extra_errors) {
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
            "cannot generate fees: batch failed validation, nothing was inserted",
            errors,
        ),
        Err(BatchError::Duplicates(errors)) => err_with_errors(
            &req.id,
            "duplicate_items",
            "cannot generate fees: batch contains duplicates, nothing was inserted",
            errors,
        ),
        Err(BatchError::Store(e)) => err(&req.id, "db_insert_failed", format!("{e:#}"), None),
    }
}

fn handle_fees_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match fees_groups_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_fees_group_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match fees_group_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_fees_month_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match fees_month_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_fees_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match fees_set_status(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_fees_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match fees_summary(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.groupsList" => Some(handle_fees_groups_list(state, req)),
        "fees.groupCreate" => Some(handle_fees_group_create(state, req)),
        "fees.monthOpen" => Some(handle_fees_month_open(state, req)),
        "fees.generateBatch" => Some(handle_fees_generate_batch(state, req)),
        "fees.setStatus" => Some(handle_fees_set_status(state, req)),
        "fees.summary" => Some(handle_fees_summary(state, req)),
        _ => None,
    }
}
