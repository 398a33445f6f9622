use crate::archive;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{actor_with, optional_id, required_id, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;
use crate::roster;
use serde_json::json;

fn handle_list(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ViewRosters)?;
    let conn = state.conn()?;
    let year = optional_id(&req.params, "academic_year_id")?;
    let grade = optional_id(&req.params, "grade_id")?;
    let items = roster::list_rosters(conn, year.as_deref(), grade.as_deref())?;
    Ok(json!({ "items": items }))
}

fn handle_get(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ViewRosters)?;
    let conn = state.conn()?;
    let roster_id = required_id(&req.params, "roster_id")?;
    roster::get_roster(conn, &roster_id)
}

fn handle_export(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    actor_with(req, Capability::ViewRosters)?;
    let conn = state.conn()?;
    let workspace = state
        .workspace
        .as_deref()
        .ok_or_else(|| AppError::validation("select a workspace first"))?;
    let out_path = archive::export_path(workspace, &required_str(&req.params, "file_name")?)?;
    let year = optional_id(&req.params, "academic_year_id")?;
    let summary = archive::export_rosters(conn, &out_path, year.as_deref())
        .map_err(|e| AppError::Internal(format!("roster export failed: {e:#}")))?;
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "archiveFormat": summary.archive_format,
        "rosterCount": summary.roster_count,
        "entryCount": summary.entry_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "rosters.list" => handle_list(state, req),
        "rosters.get" => handle_get(state, req),
        "rosters.exportArchive" => handle_export(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
