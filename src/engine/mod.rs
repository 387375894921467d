//! Contract between the session layer and a token-generating inference engine
//!
//! The engine owns model loading, tokenization and sampling. The session only
//! needs three capabilities: load a model once, create cheap per-query
//! generation sessions from it, and pull a lazy token sequence that honours a
//! cancellation signal.

pub mod scripted;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    config::{GenerateOptions, ModelOptions},
    error::{GenerationError, LoadError},
};

/// Lazy, finite, non-restartable sequence of token strings.
///
/// Each `next` call may block for one token's worth of CPU/GPU work, so the
/// sequence is always drained on the blocking thread pool.
pub type TokenStream = Box<dyn Iterator<Item = Result<String, GenerationError>> + Send>;

/// An inference engine able to load models and create generation sessions
pub trait GenerationEngine: Send + Sync + 'static {
    /// Loaded model resource
    type Model: Send + Sync + 'static;

    /// Per-query generation session
    type Session: GenerationSession;

    /// Load a model. Called once per handle; failures leave earlier handles untouched.
    fn load(&self, path: &Path, options: &ModelOptions) -> Result<Self::Model, LoadError>;

    /// Create a fresh session. Must be cheap; called once per query.
    fn create_session(
        &self,
        model: &ModelHandle<Self::Model>,
        options: &GenerateOptions,
    ) -> Self::Session;
}

/// One query's worth of generation
pub trait GenerationSession: Send + 'static {
    /// Start producing tokens for `prompt`.
    ///
    /// Implementations check `cancel` between tokens and end the sequence
    /// promptly once it is set.
    fn generate(self, prompt: &str, cancel: CancellationToken) -> TokenStream;
}

/// A loaded model together with the options it was loaded with
pub struct ModelHandle<M> {
    model: Arc<M>,
    path: PathBuf,
    options: ModelOptions,
    load_time: Duration,
}

impl<M> ModelHandle<M> {
    pub(crate) fn new(model: M, path: PathBuf, options: ModelOptions, load_time: Duration) -> Self {
        Self {
            model: Arc::new(model),
            path,
            options,
            load_time,
        }
    }

    /// The engine's model resource
    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Resolved path the model was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options the model was loaded with
    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Wall-clock time the engine spent in `load`
    pub fn load_time(&self) -> Duration {
        self.load_time
    }
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            path: self.path.clone(),
            options: self.options.clone(),
            load_time: self.load_time,
        }
    }
}

impl<M> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("load_time", &self.load_time)
            .finish()
    }
}
