use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Batch rejection envelope: one string per collected problem under
/// details.errors. Structural failures use plain err() instead so the
/// client can tell "nothing to inspect" from "here is the full list".
pub fn err_with_errors(
    id: &str,
    code: &str,
    message: impl Into<String>,
    errors: Vec<String>,
) -> serde_json::Value {
    err(id, code, message, Some(json!({ "errors": errors })))
}
