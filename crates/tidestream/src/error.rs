//! Error types for the streamer
//!
//! One error enum for the whole pipeline, with classification into
//! retriable and fatal kinds so the replication channel can decide
//! between reconnecting and terminating.

use thiserror::Error;

/// Error categories for logging and rate-limited diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Database connectivity (side channel or replication connection)
    Connection,
    /// Replication protocol and WAL decoding
    Replication,
    /// Catalog and schema discovery
    Catalog,
    /// Configuration
    Configuration,
    /// State storage
    State,
    /// Sink delivery
    Sink,
    /// Other/unknown
    Other,
}

/// Streamer errors
#[derive(Error, Debug)]
pub enum StreamerError {
    /// Invalid or missing configuration (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient connection failure; the caller may reconnect
    #[error("connection error: {0}")]
    Connect(String),

    /// Authentication or authorization failure (fatal)
    #[error("authentication error: {0}")]
    Auth(String),

    /// Catalog query or DDL handling failure
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Per-row value decoding failure; the event is degraded, not dropped
    #[error("decode error at {context}: {message}")]
    Decode { context: String, message: String },

    /// State storage failure (retried, eventually fatal)
    #[error("state storage error: {0}")]
    StateStore(String),

    /// Sink reported a permanent delivery failure (fatal)
    #[error("sink error: {0}")]
    Sink(String),

    /// Unknown type or relation; the event is skipped with a diagnostic
    #[error("resolve error: {0}")]
    Resolve(String),

    /// Replication protocol violation
    #[error("replication error: {0}")]
    Replication(String),

    /// Cooperative shutdown in progress (flow control, not a failure)
    #[error("cancelled")]
    Cancelled,

    /// Submission after the dispatcher drained and closed
    #[error("dispatcher closed")]
    DispatcherClosed,

    /// The TimescaleDB extension is not installed in the target database
    #[error("TimescaleDB extension not found")]
    ExtensionMissing,

    /// PostgreSQL error from the side channel
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error on the replication connection
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn decode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }

    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Retriable errors cause the replication channel to reconnect with
    /// backoff; everything else terminates the streamer.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Postgres(e) => is_transient_pg_error(e),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::BrokenPipe
                        | ErrorKind::TimedOut
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::Interrupted
                )
            }
            Self::Replication(msg) => {
                msg.contains("connection reset") || msg.contains("connection lost")
            }
            Self::StateStore(_) => true,
            _ => false,
        }
    }

    /// Get the error category for diagnostics.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Connect(_) | Self::Io(_) => ErrorCategory::Connection,
            Self::Auth(_) => ErrorCategory::Connection,
            Self::Catalog(_) | Self::Resolve(_) | Self::ExtensionMissing => ErrorCategory::Catalog,
            Self::Decode { .. } | Self::Replication(_) => ErrorCategory::Replication,
            Self::StateStore(_) => ErrorCategory::State,
            Self::Sink(_) => ErrorCategory::Sink,
            Self::Postgres(_) => ErrorCategory::Connection,
            Self::Json(_) | Self::Cancelled | Self::DispatcherClosed => ErrorCategory::Other,
        }
    }

    /// Wrap a resolver-level error with the WAL position and relation id
    /// it occurred at.
    pub fn at_relation(self, lsn: crate::pgtypes::Lsn, relation_id: u32) -> Self {
        Self::Resolve(format!("{self} (lsn {lsn}, relation {relation_id})"))
    }
}

/// Check if a PostgreSQL error is transient.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for streamer operations
pub type Result<T> = std::result::Result<T, StreamerError>;

/// Rate limiter for non-fatal diagnostics: at most one log per
/// `(category, identity)` within the window.
pub struct ErrorLog {
    window: std::time::Duration,
    seen: parking_lot::Mutex<std::collections::HashMap<(ErrorCategory, String), std::time::Instant>>,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(30))
    }
}

impl ErrorLog {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            seen: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// True when this occurrence should be logged at full level; callers
    /// demote repeats within the window to debug.
    pub fn should_log(&self, category: ErrorCategory, identity: &str) -> bool {
        let now = std::time::Instant::now();
        let mut seen = self.seen.lock();
        match seen.get(&(category, identity.to_string())) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                seen.insert((category, identity.to_string()), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamerError::replication("unexpected message");
        assert!(err.to_string().contains("replication error"));
        assert!(err.to_string().contains("unexpected message"));
    }

    #[test]
    fn test_decode_error_carries_context() {
        let err = StreamerError::decode("column ts", "bad timestamp literal");
        let text = err.to_string();
        assert!(text.contains("column ts"));
        assert!(text.contains("bad timestamp literal"));
    }

    #[test]
    fn test_is_retriable() {
        assert!(StreamerError::connect("refused").is_retriable());
        assert!(StreamerError::state_store("flush failed").is_retriable());
        assert!(StreamerError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_retriable());

        assert!(!StreamerError::config("missing connection").is_retriable());
        assert!(!StreamerError::auth("bad password").is_retriable());
        assert!(!StreamerError::sink("broker gone").is_retriable());
        assert!(!StreamerError::Cancelled.is_retriable());
    }

    #[test]
    fn test_category() {
        assert_eq!(
            StreamerError::config("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            StreamerError::connect("x").category(),
            ErrorCategory::Connection
        );
        assert_eq!(StreamerError::sink("x").category(), ErrorCategory::Sink);
        assert_eq!(
            StreamerError::catalog("x").category(),
            ErrorCategory::Catalog
        );
    }

    #[test]
    fn test_error_log_window() {
        let log = ErrorLog::new(std::time::Duration::from_millis(50));
        assert!(log.should_log(ErrorCategory::Catalog, "relation:42"));
        assert!(!log.should_log(ErrorCategory::Catalog, "relation:42"));
        // distinct identity or category logs independently
        assert!(log.should_log(ErrorCategory::Catalog, "relation:43"));
        assert!(log.should_log(ErrorCategory::Replication, "relation:42"));

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(log.should_log(ErrorCategory::Catalog, "relation:42"));
    }

    #[test]
    fn test_at_relation_wraps_position() {
        let err = StreamerError::resolve("unknown oid 12345")
            .at_relation(crate::pgtypes::Lsn(0x1_0000_0000), 99);
        let text = err.to_string();
        assert!(text.contains("1/0"));
        assert!(text.contains("relation 99"));
    }
}
