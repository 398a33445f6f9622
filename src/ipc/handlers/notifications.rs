use crate::error::AppResult;
use crate::ipc::helpers::{actor_with, respond};
use crate::ipc::types::{AppState, Request};
use crate::roles::Capability;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
struct Notification {
    id: String,
    kind: String,
    ref_key: String,
    message: String,
    created_at: String,
}

fn handle_list(state: &mut AppState, req: &Request) -> AppResult<serde_json::Value> {
    let actor = actor_with(req, Capability::ViewNotifications)?;
    let conn = state.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, kind, ref_key, message, created_at
         FROM notifications
         WHERE recipient_id = ?
         ORDER BY created_at DESC, kind, id",
    )?;
    let items = stmt
        .query_map([&actor.user_id], |r| {
            Ok(Notification {
                id: r.get(0)?,
                kind: r.get(1)?,
                ref_key: r.get(2)?,
                message: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => handle_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
