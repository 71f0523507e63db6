use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_workspace_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    match backup::export_workspace_bundle(workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "outPath": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_workspace_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let bundle_path = match req.params.get("bundlePath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing bundlePath", None),
    };
    let workspace_path = match req.params.get("path").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing path", None),
    };

    // Drop any open connection before the database file is replaced.
    if state.workspace.as_deref() == Some(workspace_path.as_path()) {
        state.db = None;
    }

    let summary = match backup::import_workspace_bundle(&bundle_path, &workspace_path) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "import_failed", format!("{e:#}"), None),
    };

    // The imported workspace becomes the active one.
    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": summary.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workspace.export" => Some(handle_workspace_export(state, req)),
        "workspace.import" => Some(handle_workspace_import(state, req)),
        _ => None,
    }
}
