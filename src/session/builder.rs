use std::path::PathBuf;

use crate::{config::SessionConfig, engine::GenerationEngine, error::Result};

use super::QuerySession;

/// Builder for constructing a [`QuerySession`] around an engine
pub struct SessionBuilder<E> {
    engine: E,
    config: Option<SessionConfig>,
}

impl<E: GenerationEngine> SessionBuilder<E> {
    /// Start from the default configuration
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            config: None,
        }
    }

    /// Set the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Resolve relative model paths against `dir`
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.get_or_insert_with(SessionConfig::default).model_dir = Some(dir.into());
        self
    }

    /// Validate the configuration and start the presentation dispatcher
    pub fn build(self) -> Result<QuerySession<E>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        QuerySession::new(self.engine, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedEngine;

    #[test]
    fn test_builder_default() {
        let session = SessionBuilder::new(ScriptedEngine::new(["a"])).build();
        assert!(session.is_ok());
    }

    #[test]
    fn test_builder_validation() {
        let mut config = SessionConfig::default();
        config.publish.channel_capacity = 0;

        let result = SessionBuilder::new(ScriptedEngine::new(["a"]))
            .with_config(config)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_model_dir() {
        let session = SessionBuilder::new(ScriptedEngine::new(["a"]))
            .with_model_dir("/storage/Models")
            .build()
            .unwrap();
        assert_eq!(
            session.config().model_dir,
            Some(PathBuf::from("/storage/Models"))
        );
    }
}
