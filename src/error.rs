use thiserror::Error;

/// Error type for all storage-core operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Bad argument: {0}")]
    BadArg(String),

    #[error("Bad data: {0}")]
    BadData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("Query parsing error: {msg}")]
    QueryParsingError { msg: String },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<u64>,
        timestamp: Option<u64>,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable error code string surfaced over the wire protocols.
    pub fn wire_code(&self) -> &'static str {
        match self {
            DbError::BadArg(_) => "BadArg",
            DbError::BadData(_) => "BadData",
            DbError::NotFound(_) => "NotFound",
            DbError::Overflow(_) => "Overflow",
            DbError::QueryParsingError { .. } => "QueryParsingError",
            DbError::Cancelled => "Cancelled",
            _ => "DBError",
        }
    }

    pub fn query_parsing<S: Into<String>>(msg: S) -> Self {
        DbError::QueryParsingError { msg: msg.into() }
    }

    pub fn corruption<S: Into<String>>(details: S) -> Self {
        DbError::Corruption {
            details: details.into(),
            series: None,
            timestamp: None,
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(DbError::BadArg("x".into()).wire_code(), "BadArg");
        assert_eq!(DbError::BadData("x".into()).wire_code(), "BadData");
        assert_eq!(DbError::NotFound("x".into()).wire_code(), "NotFound");
        assert_eq!(DbError::Overflow("x".into()).wire_code(), "Overflow");
        assert_eq!(DbError::Cancelled.wire_code(), "Cancelled");
        assert_eq!(
            DbError::query_parsing("bad select").wire_code(),
            "QueryParsingError"
        );
        assert_eq!(DbError::corruption("crc").wire_code(), "DBError");
    }
}
