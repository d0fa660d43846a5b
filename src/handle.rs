//! Synchronous facade over one loaded engine.
//!
//! At most one generation runs per handle. A second submission while one is in
//! flight fails with [`GenerationError::Busy`]; it is never queued behind the first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bridge::{self, TokenSender, TokenStream};
use crate::engine::{EngineError, NativeEngine};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation already in progress")]
    Busy,
    #[error("engine not multimodal")]
    NotMultimodal,
    #[error(transparent)]
    Engine(EngineError),
    #[error("failed to spawn generation thread: {0}")]
    Spawn(String),
}

impl From<EngineError> for GenerationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotMultimodal => GenerationError::NotMultimodal,
            other => GenerationError::Engine(other),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub text: String,
    pub images: Vec<Vec<u8>>,
    pub reset_conversation: bool,
    pub add_bos: bool,
    pub stop: Vec<String>,
    pub sampler_overrides: BTreeMap<String, Value>,
    pub streaming: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    pub prompt_n: usize,
    pub predicted_n: usize,
    pub prompt_ms: f64,
    pub predicted_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub stats: GenerationStats,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Completed(Completion),
    Streaming(TokenStream),
}

#[derive(Debug, Clone, Copy)]
pub struct HandleOptions {
    pub n_predict: usize,
    pub bridge_capacity: usize,
    pub handoff_timeout: Duration,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            n_predict: relay_control_models::DEFAULT_N_PREDICT,
            bridge_capacity: bridge::DEFAULT_CAPACITY,
            handoff_timeout: bridge::DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

struct HandleInner {
    engine: Mutex<Box<dyn NativeEngine>>,
    interrupt: Arc<AtomicBool>,
    generating: AtomicBool,
    multimodal: bool,
    active_sampler: Mutex<BTreeMap<String, Value>>,
    next_request_id: AtomicU64,
    options: HandleOptions,
}

#[derive(Clone)]
pub struct GenerationHandle {
    inner: Arc<HandleInner>,
}

/// Releases the generating flag when the owning generation ends.
struct GeneratingGuard {
    inner: Arc<HandleInner>,
}

impl Drop for GeneratingGuard {
    fn drop(&mut self) {
        self.inner.generating.store(false, Ordering::Release);
    }
}

impl GenerationHandle {
    pub fn new(engine: Box<dyn NativeEngine>, options: HandleOptions) -> Self {
        let interrupt = engine.interrupt_flag();
        let multimodal = engine.is_multimodal();
        let active_sampler = engine.sampler_overrides();
        Self {
            inner: Arc::new(HandleInner {
                engine: Mutex::new(engine),
                interrupt,
                generating: AtomicBool::new(false),
                multimodal,
                active_sampler: Mutex::new(active_sampler),
                next_request_id: AtomicU64::new(1),
                options,
            }),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.inner.generating.load(Ordering::Acquire)
    }

    /// Asks the running generation to stop early. No-op when idle.
    pub fn interrupt(&self) {
        if self.is_generating() {
            info!("interrupt requested");
            self.inner.interrupt.store(true, Ordering::Release);
        }
    }

    /// Clears conversation state. Refused while a generation is running.
    pub fn reset(&self) -> Result<(), GenerationError> {
        let _guard = self.claim()?;
        lock(&self.inner.engine).reset()?;
        debug!("conversation context reset");
        Ok(())
    }

    /// Streaming submissions return at once with a [`TokenStream`]; the rest block
    /// until generation finishes.
    pub fn submit(&self, submission: Submission) -> Result<SubmitOutcome, GenerationError> {
        let guard = self.claim()?;
        if !submission.images.is_empty() && !self.inner.multimodal {
            return Err(GenerationError::NotMultimodal);
        }
        self.inner.interrupt.store(false, Ordering::Release);
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);

        if !submission.streaming {
            let completion = self.run_blocking(request_id, &submission)?;
            drop(guard);
            return Ok(SubmitOutcome::Completed(completion));
        }

        let (mut sender, stream) = bridge::channel(
            request_id,
            self.inner.options.bridge_capacity,
            self.inner.options.handoff_timeout,
        );
        let handle = self.clone();
        thread::Builder::new()
            .name(format!("relay_generation_{}", request_id))
            .spawn(move || {
                let _guard = guard;
                if let Err(err) = handle.run_streaming(&submission, &mut sender) {
                    warn!(request_id, error = %err, "streaming generation failed");
                    if sender.fail(err.to_string()).is_err() {
                        error!(request_id, "could not report generation failure to consumer");
                    }
                }
            })
            .map_err(|e| GenerationError::Spawn(e.to_string()))?;

        Ok(SubmitOutcome::Streaming(stream))
    }

    fn claim(&self) -> Result<GeneratingGuard, GenerationError> {
        self.inner
            .generating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GenerationError::Busy)?;
        Ok(GeneratingGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    fn prepare(
        &self,
        engine: &mut Box<dyn NativeEngine>,
        submission: &Submission,
    ) -> Result<(), GenerationError> {
        if submission.reset_conversation {
            engine.reset()?;
        }
        let mut active = lock(&self.inner.active_sampler);
        if let Some(merged) = changed_sampler(&active, &submission.sampler_overrides) {
            debug!(overrides = ?submission.sampler_overrides, "sampler settings changed");
            engine.reinit_sampler(&merged)?;
            *active = merged;
        }
        Ok(())
    }

    fn run_blocking(&self, request_id: u64, submission: &Submission) -> Result<Completion, GenerationError> {
        let mut engine = lock(&self.inner.engine);
        self.prepare(&mut engine, submission)?;

        let add_bos = submission.add_bos || submission.reset_conversation;
        let started = Instant::now();
        engine.eval_prompt(&submission.text, &submission.images, add_bos)?;
        let prompt_done = Instant::now();
        let text = engine.generate(self.inner.options.n_predict, &submission.stop)?;
        let finished = Instant::now();

        let status = engine.status();
        let stats = GenerationStats {
            prompt_n: status.prompt_n,
            predicted_n: status.predicted_n,
            prompt_ms: prompt_done.duration_since(started).as_secs_f64() * 1000.0,
            predicted_ms: finished.duration_since(prompt_done).as_secs_f64() * 1000.0,
        };
        info!(request_id, prompt_n = stats.prompt_n, predicted_n = stats.predicted_n, "completion finished");
        Ok(Completion { text, stats })
    }

    fn run_streaming(&self, submission: &Submission, sender: &mut TokenSender) -> Result<(), GenerationError> {
        let request_id = sender.request_id();
        let mut engine = lock(&self.inner.engine);
        self.prepare(&mut engine, submission)?;

        let add_bos = submission.add_bos || submission.reset_conversation;
        engine.eval_prompt(&submission.text, &submission.images, add_bos)?;

        let interrupt = Arc::clone(&self.inner.interrupt);
        let mut abandoned = false;
        engine.stream(self.inner.options.n_predict, &submission.stop, &mut |token| {
            let delivered = sender.push(token);
            if (delivered.is_err() || sender.is_discarding()) && !abandoned {
                // Nobody reads the rest; stop the engine at its next token.
                abandoned = true;
                interrupt.store(true, Ordering::Release);
            }
        })?;

        let status = engine.status();
        info!(request_id, predicted_n = status.predicted_n, abandoned, "stream finished");
        Ok(())
    }
}

/// Merged sampler map when `overrides` changes any active value, `None` otherwise.
fn changed_sampler(
    active: &BTreeMap<String, Value>,
    overrides: &BTreeMap<String, Value>,
) -> Option<BTreeMap<String, Value>> {
    let changed = overrides
        .iter()
        .any(|(k, v)| !active.get(k).is_some_and(|current| same_value(current, v)));
    if !changed {
        return None;
    }
    let mut merged = active.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    Some(merged)
}

/// Numbers compare by value so `40` and `40.0` count as the same setting.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
