use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

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
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            workspace: None,
            db: None,
        }
    }

    pub fn conn(&self) -> AppResult<&Connection> {
        self.db
            .as_ref()
            .ok_or_else(|| AppError::validation("select a workspace first"))
    }
}
