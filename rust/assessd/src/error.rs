use crate::ipc::error::err;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("{entity} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{0}")]
    Permission(String),
    #[error("{path} is open in another program; close it and try again")]
    ResourceLocked { path: String },
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        AppError::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        AppError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Permission(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "bad_params",
            AppError::NotFound { .. } => "not_found",
            AppError::Permission(_) => "forbidden",
            AppError::ResourceLocked { .. } => "resource_locked",
            AppError::NoWorkspace => "no_workspace",
            AppError::Db(_) => "db_query_failed",
            AppError::Io(_) => "io_failed",
            AppError::Spreadsheet(_) => "spreadsheet_failed",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Validation { details, .. } => details.clone(),
            AppError::NotFound { key, .. } => Some(json!({ "key": key })),
            AppError::ResourceLocked { path } => Some(json!({ "path": path })),
            _ => None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let code = self.code();
        let details = self.details();
        err(id, code, self.to_string(), details)
    }
}

/// Attached to an otherwise successful batch export when rows had to be
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityWarning {
    pub capacity: u32,
    pub dropped: usize,
}

impl CapacityWarning {
    pub fn to_json(self) -> serde_json::Value {
        json!({
            "code": "capacity_exceeded",
            "message": format!(
                "template holds {} students; {} were not exported",
                self.capacity, self.dropped
            ),
            "capacity": self.capacity,
            "dropped": self.dropped,
        })
    }
}
