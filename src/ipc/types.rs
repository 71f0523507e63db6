use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line from the portal front end.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Session state: at most one workspace (and its database) is open at a
/// time, and it lives for the rest of the process unless replaced.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
