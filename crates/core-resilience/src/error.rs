//! Error types for the resilience primitives

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of failure kinds used by retry and stop policies.
///
/// Callers tag their own errors with a kind through [`Classify`] so that a
/// [`RetryPolicy`](crate::retry::RetryPolicy) can decide what to do without
/// inspecting concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Temporary failure of the downstream dependency
    Transient,
    /// Deadline exceeded
    Timeout,
    /// Downstream or local rate limit hit
    RateLimited,
    /// Connection could not be established or broke mid-call
    Connection,
    /// Pool acquisition timed out
    PoolTimeout,
    /// Pool already shut down
    PoolClosed,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Failure that will not go away by retrying
    Permanent,
    /// Caller supplied something invalid
    InvalidInput,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Transient,
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::Connection,
        ErrorKind::PoolTimeout,
        ErrorKind::PoolClosed,
        ErrorKind::CircuitOpen,
        ErrorKind::Permanent,
        ErrorKind::InvalidInput,
    ];

    /// Stable snake_case name, used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Connection => "connection",
            ErrorKind::PoolTimeout => "pool_timeout",
            ErrorKind::PoolClosed => "pool_closed",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Permanent => "permanent",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }

    /// Parse a snake_case kind name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Whether a failure of this kind says something about the health of
    /// the downstream dependency (and so should count against a breaker)
    pub fn trips_breaker(&self) -> bool {
        !matches!(
            self,
            ErrorKind::CircuitOpen | ErrorKind::PoolTimeout | ErrorKind::PoolClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can report its [`ErrorKind`]
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Errors produced by the resilience primitives
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// No resource became available within the acquire timeout
    #[error("Resource pool acquire timed out after {0:?}")]
    PoolTimeout(Duration),

    /// Pool was closed
    #[error("Resource pool is closed")]
    PoolClosed,

    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker '{name}' is open, rejecting requests")]
    CircuitOpen { name: String },

    /// Deadline exceeded
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after cooldown")]
    RateLimitExceeded,

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Resource creation failed
    #[error("Failed to create resource: {0}")]
    ConnectionCreation(String),

    /// Resource failed its health check
    #[error("Resource is unhealthy: {0}")]
    UnhealthyConnection(String),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Classify for ResilienceError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::PoolTimeout(_) => ErrorKind::PoolTimeout,
            ResilienceError::PoolClosed => ErrorKind::PoolClosed,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::Timeout(_) => ErrorKind::Timeout,
            ResilienceError::RateLimitExceeded => ErrorKind::RateLimited,
            ResilienceError::Transient(_) => ErrorKind::Transient,
            ResilienceError::Permanent(_) => ErrorKind::Permanent,
            ResilienceError::ConnectionCreation(_) | ResilienceError::UnhealthyConnection(_) => {
                ErrorKind::Connection
            }
            ResilienceError::InvalidConfig(_) => ErrorKind::InvalidInput,
        }
    }
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient
                | ErrorKind::RateLimited
                | ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::PoolTimeout
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Permanent
                | ErrorKind::CircuitOpen
                | ErrorKind::PoolClosed
                | ErrorKind::InvalidInput
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        self.kind().trips_breaker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Transient("network error".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
        assert!(transient.should_trip_breaker());

        let permanent = ResilienceError::Permanent("auth failed".to_string());
        assert!(!permanent.is_transient());
        assert!(permanent.is_permanent());
        assert!(permanent.should_trip_breaker());

        let circuit_open = ResilienceError::CircuitOpen {
            name: "llm-api".to_string(),
        };
        assert!(!circuit_open.is_transient());
        assert!(circuit_open.is_permanent());
        assert!(!circuit_open.should_trip_breaker());

        assert!(!ResilienceError::PoolClosed.should_trip_breaker());
        assert!(!ResilienceError::PoolTimeout(Duration::from_secs(1)).should_trip_breaker());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_connection_errors_share_kind() {
        assert_eq!(
            ResilienceError::ConnectionCreation("refused".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            ResilienceError::UnhealthyConnection("stale".into()).kind(),
            ErrorKind::Connection
        );
    }
}
