//! Boundary to the native generation engine.
//!
//! An engine is single-threaded and blocking: it evaluates one prompt, then streams
//! tokens to a callback until it hits a stop condition, and always finishes a stream
//! with [`EOS_SENTINEL`]. [`crate::handle::GenerationHandle`] owns one engine and
//! decides which thread drives it.

mod candle;
#[cfg(test)]
pub(crate) mod scripted;
mod tokenizer;
mod weights;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use self::candle::CandleEngine;

/// Marker emitted once, after the last token of every stream.
pub const EOS_SENTINEL: &str = "[EOS]";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not multimodal")]
    NotMultimodal,
    #[error("prompt evaluation failed: {0}")]
    Eval(String),
    #[error("generation failed: {0}")]
    Generate(String),
    #[error("sampler re-initialization failed: {0}")]
    Sampler(String),
    #[error("context reset failed: {0}")]
    Reset(String),
}

/// Token counts of the most recent prompt and generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub prompt_n: usize,
    pub predicted_n: usize,
}

/// What an engine is initialized from.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub model_file: PathBuf,
    pub projector_file: Option<PathBuf>,
    pub overrides: BTreeMap<String, Value>,
}

pub trait NativeEngine: Send {
    /// Feeds a prompt into the context. `add_bos` starts a new conversation.
    fn eval_prompt(&mut self, text: &str, images: &[Vec<u8>], add_bos: bool) -> Result<(), EngineError>;

    /// Generates up to `n_predict` tokens, invoking `on_token` for each one and
    /// finally with [`EOS_SENTINEL`].
    fn stream(
        &mut self,
        n_predict: usize,
        stop: &[String],
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError>;

    fn generate(&mut self, n_predict: usize, stop: &[String]) -> Result<String, EngineError> {
        let mut out = String::new();
        self.stream(n_predict, stop, &mut |token| {
            if token != EOS_SENTINEL {
                out.push_str(token);
            }
        })?;
        Ok(out)
    }

    fn reinit_sampler(&mut self, overrides: &BTreeMap<String, Value>) -> Result<(), EngineError>;

    /// Sampler values currently in effect, keyed like request overrides.
    fn sampler_overrides(&self) -> BTreeMap<String, Value>;

    fn reset(&mut self) -> Result<(), EngineError>;

    /// Flag polled between tokens; setting it ends the current stream early.
    fn interrupt_flag(&self) -> Arc<AtomicBool>;

    fn is_multimodal(&self) -> bool;

    fn status(&self) -> EngineStatus;
}

pub fn load_engine(options: &EngineOptions) -> anyhow::Result<Box<dyn NativeEngine>> {
    Ok(Box::new(CandleEngine::load(options)?))
}
