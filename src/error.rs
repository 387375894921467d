//! Error types for model loading, generation and session control

use std::error::Error as StdError;
use std::path::PathBuf;

use crate::types::{QueryId, QueryPhase};

/// Result type used throughout the session layer
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors raised by a [`GenerationEngine`](crate::engine::GenerationEngine) while loading a model.
///
/// A failed load never disturbs a model that was loaded earlier.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// No file at the given path
    #[error("model file not found: {}", path.display())]
    NotFound {
        /// Path that was looked up
        path: PathBuf,
    },

    /// The file exists but cannot be used as a model
    #[error("model file {} is corrupt: {message}", path.display())]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// What is wrong with it
        message: String,
    },

    /// The requested configuration exceeds available resources
    #[error("insufficient resources: {message}")]
    InsufficientResources {
        /// What was requested and what is available
        message: String,
    },

    /// A model option is out of range
    #[error("invalid model option {parameter}: {message}")]
    InvalidOptions {
        /// Option name
        parameter: String,
        /// Why the value was rejected
        message: String,
    },
}

/// Error raised by an engine's token stream mid-generation
#[derive(Debug, thiserror::Error)]
#[error("generation failed: {message}")]
pub struct GenerationError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl GenerationError {
    /// Error without an underlying cause
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Error wrapping the engine-level cause
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Description without the "generation failed" prefix
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors surfaced by a [`QuerySession`](crate::QuerySession)
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// `load_model` failed
    #[error("failed to load model: {0}")]
    Load(#[from] LoadError),

    /// The engine failed mid-stream; text produced before the failure is kept
    #[error("query {query_id} failed after {} bytes of output: {source}", partial_text.len())]
    Generation {
        /// Query that failed
        query_id: QueryId,
        /// Text accumulated before the failure
        partial_text: String,
        /// Engine error
        #[source]
        source: GenerationError,
    },

    /// `query` was called before a successful `load_model`
    #[error("no model loaded")]
    ModelNotLoaded,

    /// The session state machine refused a transition
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Phase the session was in
        from: QueryPhase,
        /// Phase that was requested
        to: QueryPhase,
    },

    /// Invalid configuration value
    #[error("configuration error for {parameter}: {message}")]
    Configuration {
        /// Setting name
        parameter: String,
        /// Why it was rejected
        message: String,
    },

    /// A background task panicked or could not be started
    #[error("background task failed: {message}")]
    TaskFailed {
        /// Join or spawn error
        message: String,
    },
}

impl ServiceError {
    /// Whether the caller can retry after fixing inputs or simply issuing a new query
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServiceError::Load(_)
                | ServiceError::Generation { .. }
                | ServiceError::ModelNotLoaded
                | ServiceError::Configuration { .. }
        )
    }

    /// Text accumulated before a mid-stream failure
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            ServiceError::Generation { partial_text, .. } => Some(partial_text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        let error = ServiceError::Load(LoadError::NotFound {
            path: PathBuf::from("/models/13q4.gguf"),
        });
        assert_eq!(
            error.to_string(),
            "failed to load model: model file not found: /models/13q4.gguf"
        );
    }

    #[test]
    fn test_generation_error_keeps_partial_text() {
        let error = ServiceError::Generation {
            query_id: QueryId::new(3),
            partial_text: "Hello wor".to_string(),
            source: GenerationError::new("context exhausted"),
        };
        assert_eq!(error.partial_text(), Some("Hello wor"));
        assert_eq!(
            error.to_string(),
            "query #3 failed after 9 bytes of output: generation failed: context exhausted"
        );
        assert!(error.source().is_some());
    }

    #[test]
    fn test_generation_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "device lost");
        let error = GenerationError::with_source("decode step failed", io);

        assert_eq!(error.message(), "decode step failed");
        assert_eq!(error.source().unwrap().to_string(), "device lost");
        assert!(GenerationError::new("plain").source().is_none());
    }

    #[test]
    fn test_error_recovery_classification() {
        assert!(ServiceError::ModelNotLoaded.is_recoverable());
        assert!(!ServiceError::TaskFailed {
            message: "panicked".to_string()
        }
        .is_recoverable());
        assert!(!ServiceError::InvalidTransition {
            from: QueryPhase::Running,
            to: QueryPhase::Running,
        }
        .is_recoverable());
    }
}
