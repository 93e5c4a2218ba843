//! Seam to the on-device inference engine.
//!
//! The engine itself is an external collaborator: something constructed from
//! a model file that streams a reply through a token/done callback and can
//! be released. Tandem only defines the contract; a concrete runtime is
//! linked by the embedding application. The callback may fire on any thread
//! and must stay cheap; implementations hand tokens straight to a channel.

use std::error::Error as StdError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Invoked by the engine with `(partial_text, is_done)`. May be called zero
/// or more times; generation completes when `is_done` is true.
pub type TokenCallback = Box<dyn FnMut(&str, bool) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalEngineError {
    message: String,
}

impl LocalEngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LocalEngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for LocalEngineError {}

pub trait LocalEngine: Send + Sync {
    /// Start generating a reply to `prompt`, delivering output through
    /// `on_token`. May block until generation finishes or return while the
    /// callback keeps firing from an engine thread; both shapes are
    /// bridged the same way.
    fn generate(&self, prompt: &str, on_token: TokenCallback) -> Result<(), LocalEngineError>;

    /// Release the model resources. Idempotent.
    fn release(&self);
}

pub trait LocalEngineLoader: Send + Sync {
    fn load(
        &self,
        model_path: &Path,
        config: &EngineConfig,
    ) -> Result<Arc<dyn LocalEngine>, LocalEngineError>;
}

/// Loader used when no local runtime is linked in. Every load fails with a
/// clear message, which flows into the setup summary like any other
/// backend failure.
pub struct UnavailableEngineLoader;

impl LocalEngineLoader for UnavailableEngineLoader {
    fn load(
        &self,
        model_path: &Path,
        _config: &EngineConfig,
    ) -> Result<Arc<dyn LocalEngine>, LocalEngineError> {
        Err(LocalEngineError::new(format!(
            "no local inference runtime is linked in this build (model at {})",
            model_path.display()
        )))
    }
}
