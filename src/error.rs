use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Closed error taxonomy shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Forbidden,
    Conflict,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "VALIDATION_ERROR" => Some(ErrorCode::ValidationError),
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "FORBIDDEN" => Some(ErrorCode::Forbidden),
            "CONFLICT" => Some(ErrorCode::Conflict),
            "INTERNAL_ERROR" => Some(ErrorCode::InternalError),
            _ => None,
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    Conflict {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Forbidden(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: serde_json::Value) -> Self {
        match self {
            AppError::Validation { message, .. } => AppError::Validation {
                message,
                details: Some(details),
            },
            AppError::Conflict { message, .. } => AppError::Conflict {
                message,
                details: Some(details),
            },
            other => other,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Forbidden(_) => ErrorCode::Forbidden,
            AppError::Conflict { .. } => ErrorCode::Conflict,
            AppError::Database(_) | AppError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to hand to a client. Internal failures stay generic.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        match self {
            AppError::Validation { details, .. } | AppError::Conflict { details, .. } => {
                details.as_ref()
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{e:#}"))
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Turn uniqueness / foreign-key failures into CONFLICT, keep the rest internal.
pub fn conflict_on_constraint(e: rusqlite::Error, message: &str) -> AppError {
    if is_constraint_violation(&e) {
        AppError::conflict(message)
    } else {
        AppError::Database(e)
    }
}
