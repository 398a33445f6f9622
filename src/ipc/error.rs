use serde_json::json;

use crate::error::AppError;

pub fn ok(id: &str, data: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "success": true,
        "data": data,
        "error": null,
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "success": false,
        "data": null,
        "error": error,
    })
}

pub fn app_err(id: &str, method: &str, e: &AppError) -> serde_json::Value {
    match e {
        AppError::Database(_) | AppError::Internal(_) => {
            tracing::error!(request_id = id, method, error = %e, "request failed");
        }
        _ => tracing::debug!(request_id = id, method, error = %e, "request rejected"),
    }
    err(id, e.code().as_str(), e.client_message(), e.details().cloned())
}
