//! Error types for the record stores and session layer.

use thiserror::Error;

use crate::migration::{MigrationReport, MigrationStep};

/// Result type alias for store and session operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// PostgREST code for "single row requested, zero rows returned".
pub const NO_ROWS_CODE: &str = "PGRST116";

/// A failure reported by the remote data or auth backend.
///
/// Carried through unchanged so callers can inspect the backend's own code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub code: Option<String>,
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The error a single-row read produces when nothing matched.
    pub fn no_rows() -> Self {
        Self::new("JSON object requested, multiple (or no) rows returned").with_code(NO_ROWS_CODE)
    }

    #[must_use]
    pub fn is_no_rows(&self) -> bool {
        self.code.as_deref() == Some(NO_ROWS_CODE)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Authentication requires a configured backend")]
    Configuration,

    #[error("User must be authenticated")]
    Unauthenticated,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Migration failed during {step} ({report})")]
    Migration {
        step: MigrationStep,
        report: MigrationReport,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Local storage error: {0}")]
    Local(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the remote backend reported that a single-row read matched nothing.
    #[must_use]
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_no_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rows_detection() {
        assert!(BackendError::no_rows().is_no_rows());
        assert!(StoreError::Backend(BackendError::no_rows()).is_no_rows());
        assert!(!StoreError::Backend(BackendError::new("boom")).is_no_rows());
        assert!(!StoreError::Configuration.is_no_rows());
    }
}
