//! Error types shared across the harness crates.
//!
//! [`HarnessError`] is the top-level error surfaced to test code. Domain
//! crates (coordination, broker) define their own richer enums and provide
//! `From<DomainError> for HarnessError` so `?` works across layers.

/// Boxed domain error carried by [`HarnessError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level harness error.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A readiness predicate did not become true within its window.
    #[error("precondition timeout after {waited_ms}ms: {message}")]
    PreconditionTimeout { message: String, waited_ms: u64 },

    /// An operation that requires a running harness was invoked while stopped.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Coordination service or client error, kept intact for downcasting
    #[error("coordination error: {0}")]
    Coordination(#[source] BoxError),

    /// Broker, admin or client-session error, kept intact for downcasting
    #[error("broker error: {0}")]
    Broker(#[source] BoxError),

    /// Record (de)serialization error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Shorthand for [`HarnessError::IllegalState`].
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    /// The domain error behind a `Coordination` or `Broker` variant.
    pub fn domain_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Coordination(inner) | Self::Broker(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns `true` if this error is a readiness timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PreconditionTimeout { .. })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds an invalid value
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Record encoding/decoding errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload is not valid UTF-8 for a string format
    #[error("invalid utf-8 payload: {0}")]
    InvalidUtf8(String),

    /// Payload is not valid JSON for the json format
    #[error("invalid json payload: {0}")]
    InvalidJson(String),
}

/// One cleanup step that failed during shutdown.
///
/// Shutdown never returns these as an `Err`; they are logged and collected
/// into a report instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("shutdown step '{step}' failed: {reason}")]
pub struct ShutdownFailure {
    /// Name of the cleanup step (e.g. `"broker"`)
    pub step: &'static str,
    /// Rendered error
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_timeout_message_includes_caller_text() {
        let err = HarnessError::PreconditionTimeout {
            message: "Zookeeper must be started before proceeding".to_owned(),
            waited_ms: 5000,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("Zookeeper must be started"));
        assert!(rendered.contains("5000ms"));
        assert!(err.is_timeout());
    }

    #[test]
    fn config_error_converts_into_harness_error() {
        let err: HarnessError = ConfigError::InvalidValue {
            field: "broker.port".to_owned(),
            reason: "out of range".to_owned(),
        }
        .into();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(!err.is_timeout());
    }

    #[test]
    fn domain_error_can_be_recovered() {
        let err = HarnessError::Broker(Box::new(ConfigError::FileNotFound {
            path: "x".to_owned(),
        }));
        assert!(err.domain_error::<ConfigError>().is_some());
        assert!(err.domain_error::<CodecError>().is_none());
        assert!(err.to_string().starts_with("broker error: config file not found"));
    }

    #[test]
    fn shutdown_failure_display() {
        let failure = ShutdownFailure {
            step: "broker",
            reason: "listener already closed".to_owned(),
        };
        assert_eq!(
            failure.to_string(),
            "shutdown step 'broker' failed: listener already closed"
        );
    }
}
