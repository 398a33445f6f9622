use crate::directory;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{actor_with, respond};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;

fn handle_import(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ImportDirectory)?;
    let conn = state.conn()?;
    let Some(document) = req.params.get("document").filter(|v| v.is_object()) else {
        return Err(AppError::validation("missing document"));
    };
    let doc = directory::parse_document(document)?;
    directory::import_directory(conn, &doc)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "directory.import" => handle_import(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
