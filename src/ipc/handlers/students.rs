use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, now_stamp, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn students_list(
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
        .prepare(
            "SELECT id, last_name, first_name, student_no, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let student_no: Option<String> = r.get(3)?;
            let active: i64 = r.get(4)?;
            let sort_order: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "studentNo": student_no,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "students": students }))
}

fn students_enroll(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params("name fields must not be empty"));
    }
    let student_no = get_optional_str(params, "studentNo");

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    // Enrolled students go to the end of the class list.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &student_no,
            next_sort,
            now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn students_set_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing active"))?;

    let changed = conn
        .execute(
            "UPDATE students SET active = ?, updated_at = ? WHERE class_id = ? AND id = ?",
            (active as i64, now_stamp(), &class_id, &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_enroll(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_set_active(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.setActive" => Some(handle_students_set_active(state, req)),
        _ => None,
    }
}
