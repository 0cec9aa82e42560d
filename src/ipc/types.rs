use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::accounts::AccountsMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Elevated credential from config; `None` means admin calls can never succeed.
    pub service_key: Option<String>,
    pub elevated: bool,
    pub accounts_mode: AccountsMode,
}

impl AppState {
    pub fn new(service_key: Option<String>) -> Self {
        AppState {
            workspace: None,
            db: None,
            service_key,
            elevated: false,
            accounts_mode: AccountsMode::Admin,
        }
    }
}
