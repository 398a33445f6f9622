use super::handlers;
use super::types::{AppState, Request};
use crate::error::ErrorCode;
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _guard = span.enter();

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::directory::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::marks::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::grading::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::store_house::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::notifications::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        ErrorCode::NotFound.as_str(),
        format!("unknown method: {}", req.method),
        None,
    )
}
