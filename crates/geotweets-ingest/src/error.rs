//! Ingestion error taxonomy
//!
//! Errors split into two scopes. Record-scoped errors are caught at the
//! per-record boundary and the offending line is quarantined. Shard-fatal
//! errors unwind out of the shard loop and are reported to the coordinator.

use thiserror::Error;

use crate::geometry::GeometryError;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A required field is missing or has the wrong shape
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),

    /// The store rejected one write (constraint, bad value, ...)
    #[error("store rejected write: {0}")]
    StoreWrite(String),

    /// The store chose this write as a deadlock or serialization victim
    #[error("store contention: {0}")]
    StoreContention(String),

    /// Rows derived from one record do not reference each other correctly
    #[error("inconsistent record: {0}")]
    Inconsistent(String),

    /// Connection-class store failure; continuing would quarantine everything
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("shard {shard} aborted: {reason}")]
    ShardFatal { shard: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] geotweets_common::CommonError),
}

impl IngestError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }

    pub fn shard_fatal(shard: usize, reason: impl std::fmt::Display) -> Self {
        Self::ShardFatal {
            shard,
            reason: reason.to_string(),
        }
    }

    /// True when the error concerns a single record and the shard may continue
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedRecord(_)
                | IngestError::Geometry(_)
                | IngestError::StoreWrite(_)
                | IngestError::StoreContention(_)
                | IngestError::Inconsistent(_)
        )
    }

    /// True when the same record may succeed if applied again
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StoreContention(_))
    }

    /// Short machine-friendly tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MalformedRecord(_) => "malformed_record",
            IngestError::Geometry(_) => "geometry",
            IngestError::StoreWrite(_) => "store_write",
            IngestError::StoreContention(_) => "store_contention",
            IngestError::Inconsistent(_) => "inconsistent",
            IngestError::StoreUnavailable(_) => "store_unavailable",
            IngestError::ShardFatal { .. } => "shard_fatal",
            IngestError::Io(_) => "io",
            IngestError::Common(_) => "common",
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::MalformedRecord(format!("invalid JSON: {}", err))
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => IngestError::StoreUnavailable(err.to_string()),
            // deadlock_detected, serialization_failure
            sqlx::Error::Database(ref db)
                if matches!(db.code().as_deref(), Some("40P01" | "40001")) =>
            {
                IngestError::StoreContention(err.to_string())
            },
            other => IngestError::StoreWrite(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_scoped_errors() {
        assert!(IngestError::malformed("no user").is_record_scoped());
        assert!(IngestError::Geometry(GeometryError::Missing).is_record_scoped());
        assert!(IngestError::StoreWrite("check violation".into()).is_record_scoped());
        assert!(IngestError::Inconsistent("actor".into()).is_record_scoped());
        assert!(IngestError::StoreContention("deadlock".into()).is_record_scoped());
    }

    #[test]
    fn test_only_contention_is_retryable() {
        assert!(IngestError::StoreContention("deadlock detected".into()).is_retryable());
        assert!(!IngestError::StoreWrite("check violation".into()).is_retryable());
        assert!(!IngestError::StoreUnavailable("reset".into()).is_retryable());
    }

    #[test]
    fn test_shard_fatal_errors() {
        assert!(!IngestError::StoreUnavailable("reset".into()).is_record_scoped());
        assert!(!IngestError::shard_fatal(2, "no such file").is_record_scoped());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!IngestError::from(io).is_record_scoped());
    }

    #[test]
    fn test_sqlx_classification() {
        assert!(matches!(
            IngestError::from(sqlx::Error::PoolTimedOut),
            IngestError::StoreUnavailable(_)
        ));
        assert!(matches!(
            IngestError::from(sqlx::Error::RowNotFound),
            IngestError::StoreWrite(_)
        ));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err: IngestError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.kind(), "malformed_record");
    }
}
