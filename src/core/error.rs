use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Sub-codes carried by [`DomainError::Conversion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversionErrorCode {
    /// The entity class has no record mapping registered.
    MapMissing,
    /// Anything else that went wrong while walking the object graph.
    ConversionError,
}

impl ConversionErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MapMissing => "0001",
            Self::ConversionError => "0002",
        }
    }
}

impl fmt::Display for ConversionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapMissing => write!(f, "ENTITY_TO_DB_CONVERSION_MAP_MISSING"),
            Self::ConversionError => write!(f, "CONVERSION_ERROR"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        description: Option<String>,
        extra_payload: Option<serde_json::Value>,
    },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Aggregate '{entity}' not found for ids {ids:?}")]
    AggregateNotFound { entity: String, ids: Vec<String> },

    #[error("Outdated version for '{entity}:{id}': current version is {current}")]
    OutdatedVersion {
        entity: String,
        id: String,
        current: i64,
    },

    #[error("Conversion error ({code}): {message}")]
    Conversion {
        code: ConversionErrorCode,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not authorised: {0}")]
    Authorization(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            description: None,
            extra_payload: None,
        }
    }

    /// Validation failure with a longer human readable description.
    pub fn validation_with(message: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            description: Some(description.into()),
            extra_payload: None,
        }
    }

    pub fn conversion(code: ConversionErrorCode, message: impl Into<String>) -> Self {
        Self::Conversion {
            code,
            message: message.into(),
        }
    }

    /// Attaches a structured payload. Only validation errors carry one; other
    /// variants are returned untouched.
    pub fn with_extra(self, extra: serde_json::Value) -> Self {
        match self {
            Self::Validation {
                message,
                description,
                ..
            } => Self::Validation {
                message,
                description,
                extra_payload: Some(extra),
            },
            other => other,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "0002",
            Self::Database(_) | Self::Lock(_) => "0003",
            Self::ResourceNotFound(_) => "0004",
            Self::OutdatedVersion { .. } => "0005",
            Self::AggregateNotFound { .. } => "0007",
            Self::Authorization(_) => "0008",
            Self::InvalidState(_) => "0016",
            Self::Conversion { .. } => "0016",
            Self::Configuration(_) => "0020",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ResourceNotFound(_) | Self::AggregateNotFound { .. }
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let (description, extra_payload) = match self {
            Self::Validation {
                description,
                extra_payload,
                ..
            } => (description.clone(), extra_payload.clone()),
            Self::Conversion { code, .. } => (
                Some(code.to_string()),
                Some(serde_json::json!({ "code": code.code() })),
            ),
            Self::AggregateNotFound { ids, .. } => {
                (None, Some(serde_json::json!({ "missing_ids": ids })))
            }
            _ => (None, None),
        };
        ErrorPayload {
            error_id: Uuid::new_v4(),
            error_code: self.error_code(),
            message: self.to_string(),
            description,
            extra_payload,
        }
    }
}

/// Transport-neutral rendering of an error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error_id: Uuid,
    pub error_code: &'static str,
    pub message: String,
    pub description: Option<String>,
    pub extra_payload: Option<serde_json::Value>,
}

impl<T> From<std::sync::PoisonError<T>> for DomainError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::conversion(ConversionErrorCode::ConversionError, err.to_string())
    }
}
