use crate::error::{AppError, AppResult};
use crate::ipc::error::{app_err, ok};
use crate::ipc::types::Request;
use crate::roles::{Actor, Capability};

/// Render a handler outcome as the response envelope.
pub fn respond(req: &Request, result: AppResult<serde_json::Value>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => app_err(&req.id, &req.method, &e),
    }
}

/// Ids arrive as strings over stdio and as strings or numbers from JSON bodies.
pub fn optional_id(params: &serde_json::Value, key: &str) -> AppResult<Option<String>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
        Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        Some(_) => Err(AppError::validation(format!("{key} must be a string or integer id"))),
    }
}

pub fn required_id(params: &serde_json::Value, key: &str) -> AppResult<String> {
    optional_id(params, key)?.ok_or_else(|| AppError::validation(format!("missing {key}")))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> AppResult<String> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| AppError::validation(format!("missing {key}")))?;
    if s.is_empty() {
        return Err(AppError::validation(format!("{key} must not be empty")));
    }
    Ok(s)
}

pub fn optional_f64(params: &serde_json::Value, key: &str) -> AppResult<Option<f64>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| AppError::validation(format!("{key} must be a finite number"))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| AppError::validation(format!("{key} must be a number"))),
        Some(_) => Err(AppError::validation(format!("{key} must be a number"))),
    }
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> AppResult<f64> {
    optional_f64(params, key)?.ok_or_else(|| AppError::validation(format!("missing {key}")))
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> AppResult<bool> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(false),
        Some(serde_json::Value::Bool(b)) => Ok(*b),
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(AppError::validation(format!("{key} must be a boolean"))),
        },
        Some(_) => Err(AppError::validation(format!("{key} must be a boolean"))),
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// The request's actor, checked for one capability.
pub fn actor_with(req: &Request, cap: Capability) -> AppResult<Actor> {
    let actor = Actor::from_params(&req.params)?;
    actor.require(cap)?;
    Ok(actor)
}
