//! Deterministic in-process engine that replays a fixed token script.
//!
//! Useful for tests, benchmarks and demos: tokens can be paced, held back
//! behind a [`TokenGate`], or cut short by an injected failure, and the
//! engine counts how many token streams are alive at once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{GenerationEngine, GenerationSession, ModelHandle, TokenStream};
use crate::{
    config::{GenerateOptions, ModelOptions},
    error::{GenerationError, LoadError},
};

/// How quickly scripted tokens are produced
#[derive(Debug, Clone)]
pub enum Pacing {
    /// Produce every token as soon as it is pulled
    Immediate,
    /// Sleep this long before every token
    Fixed(Duration),
    /// Produce a token only when the gate hands out a permit
    Gated(TokenGate),
}

/// Hands out permits for scripted tokens one at a time
#[derive(Debug, Clone)]
pub struct TokenGate {
    permits: Arc<Semaphore>,
}

impl TokenGate {
    /// Create a closed gate with no permits
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Allow `count` more tokens through
    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    /// Let every remaining token through
    pub fn open(&self) {
        // A closed semaphore fails every acquire immediately, which reads as "open".
        self.permits.close();
    }

    /// Block until a permit arrives or, when honoured, `cancel` fires
    fn wait(&self, cancel: &CancellationToken, honour_cancellation: bool) -> bool {
        futures::executor::block_on(async {
            let acquired = if honour_cancellation {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    acquired = self.permits.acquire() => acquired,
                }
            } else {
                self.permits.acquire().await
            };

            if let Ok(permit) = acquired {
                permit.forget();
            }
            true
        })
    }
}

impl Default for TokenGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Live/peak stream accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Streams created so far
    pub started: usize,
    /// Streams not yet dropped
    pub active: usize,
    /// Highest number of streams ever alive at the same time
    pub peak_active: usize,
}

#[derive(Debug, Default)]
struct StreamCounters {
    started: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

#[derive(Debug, Clone)]
struct Failure {
    after_tokens: usize,
    message: String,
}

/// Engine that replays the same token script for every query
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Arc<[String]>,
    pacing: Pacing,
    failure: Option<Failure>,
    honour_cancellation: bool,
    max_gpu_layers: Option<usize>,
    load_delay: Duration,
    counters: Arc<StreamCounters>,
}

impl ScriptedEngine {
    /// Engine that yields `tokens` in order for every query
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: tokens.into_iter().map(Into::into).collect(),
            pacing: Pacing::Immediate,
            failure: None,
            honour_cancellation: true,
            max_gpu_layers: None,
            load_delay: Duration::ZERO,
            counters: Arc::new(StreamCounters::default()),
        }
    }

    /// Split text on whitespace into word tokens, keeping the separating space
    pub fn from_text(text: &str) -> Self {
        let tokens = text
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {}", word) });
        Self::new(tokens)
    }

    /// Control how quickly tokens are produced
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Raise a [`GenerationError`] instead of the token at index `after_tokens`
    pub fn fail_after(mut self, after_tokens: usize, message: impl Into<String>) -> Self {
        self.failure = Some(Failure {
            after_tokens,
            message: message.into(),
        });
        self
    }

    /// Keep producing tokens after cancellation, like an engine that never
    /// looks at the signal
    pub fn ignoring_cancellation(mut self) -> Self {
        self.honour_cancellation = false;
        self
    }

    /// Refuse loads that ask for more GPU layers than this
    pub fn with_gpu_layer_limit(mut self, limit: usize) -> Self {
        self.max_gpu_layers = Some(limit);
        self
    }

    /// Sleep this long inside every `load`, like reading weights from disk
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Tokens replayed by every query
    pub fn script(&self) -> &[String] {
        &self.script
    }

    /// Snapshot of the live/peak token stream counters
    pub fn stream_stats(&self) -> StreamStats {
        StreamStats {
            started: self.counters.started.load(Ordering::Acquire),
            active: self.counters.active.load(Ordering::Acquire),
            peak_active: self.counters.peak_active.load(Ordering::Acquire),
        }
    }
}

/// Model "loaded" by [`ScriptedEngine`]
#[derive(Debug)]
pub struct ScriptedModel {
    /// File the model was "loaded" from
    pub path: PathBuf,
    /// Size of that file
    pub size_bytes: u64,
}

impl GenerationEngine for ScriptedEngine {
    type Model = ScriptedModel;
    type Session = ScriptedSession;

    fn load(&self, path: &Path, options: &ModelOptions) -> Result<Self::Model, LoadError> {
        if options.context_size == 0 {
            return Err(LoadError::InvalidOptions {
                parameter: "context_size".to_string(),
                message: "context size must be positive".to_string(),
            });
        }

        if let Some(limit) = self.max_gpu_layers {
            if options.gpu_layers > limit {
                return Err(LoadError::InsufficientResources {
                    message: format!(
                        "{} GPU layers requested, {} available",
                        options.gpu_layers, limit
                    ),
                });
            }
        }

        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound {
                path: path.to_path_buf(),
            },
            _ => LoadError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            },
        })?;

        if !metadata.is_file() || metadata.len() == 0 {
            return Err(LoadError::Corrupt {
                path: path.to_path_buf(),
                message: "not a non-empty model file".to_string(),
            });
        }

        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }

        Ok(ScriptedModel {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
        })
    }

    fn create_session(
        &self,
        _model: &ModelHandle<Self::Model>,
        _options: &GenerateOptions,
    ) -> Self::Session {
        ScriptedSession {
            engine: self.clone(),
        }
    }
}

/// Session created by [`ScriptedEngine`]
#[derive(Debug)]
pub struct ScriptedSession {
    engine: ScriptedEngine,
}

impl GenerationSession for ScriptedSession {
    fn generate(self, _prompt: &str, cancel: CancellationToken) -> TokenStream {
        let counters = Arc::clone(&self.engine.counters);
        counters.started.fetch_add(1, Ordering::AcqRel);
        let active = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active.fetch_max(active, Ordering::AcqRel);

        Box::new(ScriptedTokens {
            engine: self.engine,
            cancel,
            position: 0,
            finished: false,
            counters,
        })
    }
}

struct ScriptedTokens {
    engine: ScriptedEngine,
    cancel: CancellationToken,
    position: usize,
    finished: bool,
    counters: Arc<StreamCounters>,
}

impl ScriptedTokens {
    fn wait_for_turn(&self) -> bool {
        match &self.engine.pacing {
            Pacing::Immediate => true,
            Pacing::Fixed(delay) => {
                std::thread::sleep(*delay);
                true
            }
            Pacing::Gated(gate) => gate.wait(&self.cancel, self.engine.honour_cancellation),
        }
    }

    fn failure_due(&self) -> Option<&Failure> {
        self.engine
            .failure
            .as_ref()
            .filter(|f| f.after_tokens == self.position)
    }
}

impl Iterator for ScriptedTokens {
    type Item = Result<String, GenerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.position >= self.engine.script.len() && self.failure_due().is_none() {
            self.finished = true;
            return None;
        }
        if self.engine.honour_cancellation && self.cancel.is_cancelled() {
            self.finished = true;
            return None;
        }
        if !self.wait_for_turn() {
            self.finished = true;
            return None;
        }

        if let Some(message) = self.failure_due().map(|f| f.message.clone()) {
            self.finished = true;
            return Some(Err(GenerationError::new(message)));
        }

        let token = self.engine.script[self.position].clone();
        self.position += 1;
        Some(Ok(token))
    }
}

impl Drop for ScriptedTokens {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file
    }

    fn handle(engine: &ScriptedEngine, path: &Path) -> ModelHandle<ScriptedModel> {
        let options = ModelOptions::default();
        let model = engine.load(path, &options).unwrap();
        ModelHandle::new(model, path.to_path_buf(), options, Duration::ZERO)
    }

    fn collect(engine: &ScriptedEngine, cancel: CancellationToken) -> Vec<Result<String, GenerationError>> {
        let file = model_file();
        let handle = handle(engine, file.path());
        engine
            .create_session(&handle, &GenerateOptions::default())
            .generate("prompt", cancel)
            .collect()
    }

    #[test]
    fn test_replays_script() {
        let engine = ScriptedEngine::from_text("Hello there world");
        let tokens: Vec<String> = collect(&engine, CancellationToken::new())
            .into_iter()
            .map(|t| t.unwrap())
            .collect();
        assert_eq!(tokens, vec!["Hello", " there", " world"]);
        assert_eq!(engine.script(), tokens.as_slice());

        let stats = engine.stream_stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak_active, 1);
    }

    #[test]
    fn test_failure_injection() {
        let engine = ScriptedEngine::new(["a", "b", "c"]).fail_after(2, "device lost");
        let items = collect(&engine, CancellationToken::new());
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert_eq!(items[2].as_ref().unwrap_err().message(), "device lost");
    }

    #[test]
    fn test_stops_on_cancellation() {
        let engine = ScriptedEngine::new(["a", "b"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(collect(&engine, cancel).is_empty());

        let stubborn = ScriptedEngine::new(["a", "b"]).ignoring_cancellation();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(collect(&stubborn, cancel).len(), 2);
    }

    #[test]
    fn test_gate_releases_permits() {
        let gate = TokenGate::new();
        let engine = ScriptedEngine::new(["a", "b", "c"]).with_pacing(Pacing::Gated(gate.clone()));
        let file = model_file();
        let handle = handle(&engine, file.path());
        let cancel = CancellationToken::new();
        let mut stream = engine
            .create_session(&handle, &GenerateOptions::default())
            .generate("prompt", cancel.clone());

        gate.release(1);
        assert_eq!(stream.next().unwrap().unwrap(), "a");

        cancel.cancel();
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_gate_wakes_on_cancellation() {
        let gate = TokenGate::new();
        let engine = ScriptedEngine::new(["a", "b"]).with_pacing(Pacing::Gated(gate));
        let file = model_file();
        let handle = handle(&engine, file.path());
        let cancel = CancellationToken::new();
        let mut stream = engine
            .create_session(&handle, &GenerateOptions::default())
            .generate("prompt", cancel.clone());

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });

        // Blocks inside the gate until the other thread cancels.
        assert!(stream.next().is_none());
        canceller.join().unwrap();
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_open_gate_lets_everything_through() {
        let gate = TokenGate::new();
        let engine = ScriptedEngine::new(["a", "b", "c"])
            .with_pacing(Pacing::Gated(gate.clone()))
            .ignoring_cancellation();

        gate.release(1);
        gate.open();
        let tokens: Vec<String> = collect(&engine, CancellationToken::new())
            .into_iter()
            .map(|t| t.unwrap())
            .collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_load_delay() {
        let engine = ScriptedEngine::new(["a"]).with_load_delay(Duration::from_millis(15));
        let file = model_file();

        let started = std::time::Instant::now();
        engine.load(file.path(), &ModelOptions::default()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_load_errors() {
        let engine = ScriptedEngine::new(["a"]).with_gpu_layer_limit(8);

        let missing = engine.load(Path::new("/nonexistent/13q4.gguf"), &ModelOptions {
            gpu_layers: 0,
            ..Default::default()
        });
        assert!(matches!(missing, Err(LoadError::NotFound { .. })));

        let file = model_file();
        let too_many = engine.load(file.path(), &ModelOptions::default());
        assert!(matches!(too_many, Err(LoadError::InsufficientResources { .. })));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let corrupt = engine.load(empty.path(), &ModelOptions {
            gpu_layers: 4,
            ..Default::default()
        });
        assert!(matches!(corrupt, Err(LoadError::Corrupt { .. })));

        let ok = engine.load(file.path(), &ModelOptions {
            gpu_layers: 8,
            ..Default::default()
        });
        assert_eq!(ok.unwrap().size_bytes, 4);
    }
}
