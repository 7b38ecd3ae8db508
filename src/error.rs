//! Error types for meshlink

use std::fmt;

/// Result type alias for meshlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for meshlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No binding exists for the requested token/service pair
    NotFound,
    /// The balancer has no live node for the service
    Empty,
    /// The topic, channel or cache has been shut down
    Exiting,
    /// A shared-store or broker round trip exceeded its deadline
    Timeout,
    /// Shared key-value store failure
    Store(String),
    /// Cluster broker failure
    Broker(String),
    /// Configuration errors
    Config(String),
    /// Serialization errors
    Serialization(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the failure came from infrastructure and is safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::Store(_) | Error::Broker(_))
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "No link found"),
            Error::Empty => write!(f, "No node available"),
            Error::Exiting => write!(f, "Component is exiting"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Store(msg) => write!(f, "Store error: {}", msg),
            Error::Broker(msg) => write!(f, "Broker error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::Store("connection reset".to_string()).is_transient());
        assert!(Error::Broker("nsqd unreachable".to_string()).is_transient());
        assert!(!Error::NotFound.is_transient());
        assert!(!Error::Exiting.is_transient());
        assert!(!Error::Config("missing".to_string()).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Empty.to_string(), "No node available");
        assert_eq!(
            Error::Store("boom".to_string()).to_string(),
            "Store error: boom"
        );
    }
}
