use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::{EngineError, EngineStatus, NativeEngine, EOS_SENTINEL};

/// Observable side effects of a [`ScriptedEngine`], shared with the test.
#[derive(Debug, Default)]
pub struct ScriptLog {
    pub prompts: Vec<(String, usize, bool)>,
    pub sampler_inits: Vec<BTreeMap<String, Value>>,
    pub resets: usize,
}

/// Deterministic engine: echoes a fixed token script after every prompt.
pub struct ScriptedEngine {
    tokens: Vec<String>,
    multimodal: bool,
    token_delay: Duration,
    fail_generation: bool,
    fail_reset: bool,
    sampler: BTreeMap<String, Value>,
    interrupt: Arc<AtomicBool>,
    status: EngineStatus,
    pub log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedEngine {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            multimodal: false,
            token_delay: Duration::ZERO,
            fail_generation: false,
            fail_reset: false,
            sampler: BTreeMap::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            status: EngineStatus::default(),
            log: Arc::new(Mutex::new(ScriptLog::default())),
        }
    }

    pub fn multimodal(mut self) -> Self {
        self.multimodal = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    pub fn with_sampler(mut self, sampler: BTreeMap<String, Value>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn failing_reset(mut self) -> Self {
        self.fail_reset = true;
        self
    }
}

impl NativeEngine for ScriptedEngine {
    fn eval_prompt(&mut self, text: &str, images: &[Vec<u8>], add_bos: bool) -> Result<(), EngineError> {
        if !images.is_empty() && !self.multimodal {
            return Err(EngineError::NotMultimodal);
        }
        self.log
            .lock()
            .expect("script log")
            .prompts
            .push((text.to_string(), images.len(), add_bos));
        self.status = EngineStatus {
            prompt_n: text.split_whitespace().count() + images.len(),
            predicted_n: 0,
        };
        Ok(())
    }

    fn stream(
        &mut self,
        n_predict: usize,
        stop: &[String],
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        if self.fail_generation {
            return Err(EngineError::Generate("native status -1".to_string()));
        }
        for token in self.tokens.iter().take(n_predict) {
            if self.interrupt.load(Ordering::Acquire) || stop.iter().any(|s| s == token) {
                break;
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            on_token(token);
            self.status.predicted_n += 1;
        }
        on_token(EOS_SENTINEL);
        Ok(())
    }

    fn reinit_sampler(&mut self, overrides: &BTreeMap<String, Value>) -> Result<(), EngineError> {
        self.log.lock().expect("script log").sampler_inits.push(overrides.clone());
        self.sampler.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn sampler_overrides(&self) -> BTreeMap<String, Value> {
        self.sampler.clone()
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        if self.fail_reset {
            return Err(EngineError::Reset("native status 1".to_string()));
        }
        self.log.lock().expect("script log").resets += 1;
        self.status = EngineStatus::default();
        Ok(())
    }

    fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn is_multimodal(&self) -> bool {
        self.multimodal
    }

    fn status(&self) -> EngineStatus {
        self.status
    }
}
