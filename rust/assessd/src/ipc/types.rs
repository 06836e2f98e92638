use crate::config::Settings;
use crate::workbook::WorkspacePaths;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::PathBuf;

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
    pub paths: Option<WorkspacePaths>,
    pub settings: Settings,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            paths: None,
            settings: Settings::standard(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
