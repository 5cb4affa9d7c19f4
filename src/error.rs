//! Error types for the driver.
//!
//! Every fallible operation returns [`PgResult`]. Errors that leave the
//! physical connection in an unknown protocol position report
//! [`PgError::is_fatal`], and the connector that produced them is marked
//! broken and never reused.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for driver operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while talking to PostgreSQL or managing pools.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (unexpected message, invalid frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an ErrorResponse.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// The server closed the connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connector was broken by an earlier failure.
    #[error("Connector is broken and cannot be used")]
    ConnectorBroken,

    /// Waited for a pooled connector longer than the configured timeout.
    #[error(
        "The connection pool has been exhausted, either raise max_pool_size (currently {max}) \
         or timeout (currently {} seconds)",
        .timeout.as_secs_f64()
    )]
    PoolExhausted { max: usize, timeout: Duration },

    /// Timeout waiting for the server.
    #[error("Operation timed out")]
    Timeout,

    /// A previous operation on the connector never finished.
    #[error("An operation is already in progress: {0}")]
    OperationInProgress(String),

    /// Invalid connection settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// API misuse, such as mixing transactions across connections.
    #[error("Usage error: {0}")]
    Usage(String),

    /// A blocking call was made without a runtime to drive it.
    #[error("No tokio runtime is available to drive the operation")]
    NoRuntime,
}

impl PgError {
    /// Whether the connector that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        match self {
            PgError::Io(_)
            | PgError::Protocol(_)
            | PgError::ConnectionClosed
            | PgError::ConnectorBroken
            | PgError::Timeout
            | PgError::OperationInProgress(_) => true,
            PgError::Server(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        PgError::Protocol(msg.into())
    }
}

/// Fields of an ErrorResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
}

impl ServerError {
    /// Build from the raw (field code -> value) map of an ErrorResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the non-localized severity, present since 9.6
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_message_is_actionable() {
        let err = PgError::PoolExhausted {
            max: 1,
            timeout: Duration::from_millis(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("max_pool_size (currently 1)"));
        assert!(msg.contains("timeout (currently 0.1 seconds)"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_server_error_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERREUR".to_string());
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', "42P01".to_string());
        fields.insert(b'M', "relation \"nope\" does not exist".to_string());
        fields.insert(b'P', "15".to_string());

        let err = ServerError::from_fields(&fields);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.position, Some(15));
        assert!(!err.is_fatal());

        let err = PgError::from(err);
        assert_eq!(err.code(), Some("42P01"));
        assert!(err.to_string().starts_with("ERROR: relation"));
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = ServerError {
            severity: "FATAL".to_string(),
            code: "57P01".to_string(),
            ..Default::default()
        };
        assert!(PgError::from(fatal).is_fatal());
        assert!(PgError::protocol("desync").is_fatal());
        assert!(PgError::Timeout.is_fatal());
        assert!(!PgError::Usage("x".to_string()).is_fatal());
    }
}
