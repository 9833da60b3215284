//! Unified error handling for the bucket loader
//!
//! Every core operation returns [`Result`]. Failures fall into three groups:
//!
//! - transient store errors, reported by [`Error::is_recoverable`] so the
//!   calling loop can retry them
//! - [`PreconditionViolation`]s, which signal a coordination bug and are
//!   never retried
//! - everything else (configuration, local I/O, malformed input)
//!
//! Constraint conflicts on insert-if-absent paths are not errors at all; they
//! come back as ordinary result values.

use std::io;
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::models::{BundleId, InstanceId};

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Shared store connectivity and query errors
    Storage,
    /// Ownership and lifecycle precondition failures
    Coordination,
    /// Configuration and validation errors
    Config,
    /// Local file and payload errors
    Processing,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Coordination => "coordination",
            Self::Config => "config",
            Self::Processing => "processing",
            Self::Other => "other",
        }
    }
}

/// An operation was attempted on a bundle or instance in the wrong state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    #[error("bundle {0} does not exist")]
    UnknownBundle(BundleId),

    #[error("instance {0} is not registered")]
    UnknownInstance(InstanceId),

    #[error("bundle {bundle} is not owned by instance {instance}")]
    NotOwner {
        bundle: BundleId,
        instance: InstanceId,
    },

    #[error("bundle {0} has already been completed")]
    AlreadyCompleted(BundleId),

    #[error("unknown record kind: {0}")]
    UnknownRecordKind(String),
}

/// Unified error type for the bucket loader
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// PostgreSQL errors
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Failure checking a connection out of the pool
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Failure building the connection pool
    #[error("Connection pool setup error: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    /// Coordination precondition failures
    #[error("Precondition violated: {0}")]
    Precondition(#[from] PreconditionViolation),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Postgres(e) => is_transient_postgres(e),
            Self::Pool(_) => true,
            Self::CreatePool(_) => false,
            Self::Precondition(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) | Self::Toml(_) | Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Database(_) | Self::Postgres(_) | Self::Pool(_) => ErrorCategory::Storage,
            Self::Precondition(_) => ErrorCategory::Coordination,
            Self::CreatePool(_) | Self::Toml(_) | Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) => ErrorCategory::Processing,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// The precondition violation carried by this error, if any
    pub fn precondition(&self) -> Option<&PreconditionViolation> {
        match self {
            Self::Precondition(v) => Some(v),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

fn is_transient_postgres(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(code) => [
            SqlState::T_R_SERIALIZATION_FAILURE,
            SqlState::T_R_DEADLOCK_DETECTED,
            SqlState::ADMIN_SHUTDOWN,
            SqlState::CANNOT_CONNECT_NOW,
            SqlState::QUERY_CANCELED,
        ]
        .contains(code),
        // No SQLSTATE means the failure happened below the protocol layer
        None => err.as_db_error().is_none() && std::error::Error::source(err).is_some(),
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
