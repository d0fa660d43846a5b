use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::model_catalog::infer_family_from_filename;
use crate::prompting::{should_stop_on_text, PromptFamily, SamplerSettings, TurnFormatter};

use super::tokenizer::{load_tokenizer, resolve_special_tokens};
use super::weights::RuntimeModel;
use super::{EngineError, EngineOptions, EngineStatus, NativeEngine, EOS_SENTINEL};

const DEFAULT_N_CTX: usize = 4096;

/// Quantized GGUF model driven on the calling thread.
pub struct CandleEngine {
    model: RuntimeModel,
    tokenizer: Tokenizer,
    device: Device,
    family: PromptFamily,
    formatter: TurnFormatter,
    sampler: SamplerSettings,
    logits_processor: LogitsProcessor,
    eos_token_id: u32,
    eot_token_id: u32,
    n_ctx: usize,
    index_pos: usize,
    next_logits: Option<Tensor>,
    interrupt: Arc<AtomicBool>,
    status: EngineStatus,
}

impl CandleEngine {
    pub fn load(options: &EngineOptions) -> Result<Self> {
        let model_file = options.model_file.as_path();
        let file_name = model_file
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| E::msg(format!("Invalid model path {}", model_file.display())))?;
        let family = infer_family_from_filename(file_name);
        let overrides = &options.overrides;

        let device = select_device(overrides.get("device"))?;
        info!(model = %model_file.display(), ?family, ?device, "loading model weights");
        let model = RuntimeModel::load_from_gguf(model_file, family, &device)?;

        let hint = overrides.get("tokenizer").and_then(Value::as_str).map(Path::new);
        let hub_repo = overrides.get("tokenizer_repo").and_then(Value::as_str);
        let tokenizer = load_tokenizer(model_file, hint, hub_repo, family)?;
        let (eos_token_id, eot_token_id) = resolve_special_tokens(&tokenizer, family).map_err(E::msg)?;
        debug!(eos_token_id, eot_token_id, "special tokens identified");

        if let Some(projector) = &options.projector_file {
            warn!(
                projector = %projector.display(),
                "image projector configured but this engine is text-only; image prompts will be rejected"
            );
        }

        let n_ctx = overrides
            .get("n_ctx")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_N_CTX);

        let mut sampler = SamplerSettings::default();
        let ignored = sampler.apply_overrides(&sampler_keys_only(overrides));
        debug!(?ignored, "sampler overrides not applied");
        let logits_processor = build_logits_processor(&sampler).map_err(E::msg)?;

        info!(n_ctx, "model and tokenizer ready");

        Ok(Self {
            model,
            tokenizer,
            device,
            family,
            formatter: TurnFormatter::new(family)?,
            sampler,
            logits_processor,
            eos_token_id,
            eot_token_id,
            n_ctx,
            index_pos: 0,
            next_logits: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            status: EngineStatus::default(),
        })
    }

    fn forward_tokens(&mut self, tokens: &[u32]) -> candle_core::Result<Tensor> {
        // The quantized models only build a causal mask for the current chunk, so a
        // continuation is fed one token at a time.
        if self.index_pos == 0 {
            let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, 0).map_err(candle_error)?;
            self.index_pos = tokens.len();
            return logits.squeeze(0);
        }

        let mut last = None;
        for &token in tokens {
            let input = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
            last = Some(self.model.forward(&input, self.index_pos).map_err(candle_error)?);
            self.index_pos += 1;
        }
        match last {
            Some(logits) => logits.squeeze(0),
            None => Err(candle_core::Error::Msg("empty token sequence".to_string())),
        }
    }

    fn sample(&mut self, logits: &Tensor) -> candle_core::Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.sampler.min_p.is_none() && self.sampler.top_n_sigma.is_none() {
            return self.logits_processor.sample(&logits);
        }
        let mut values = logits.to_vec1::<f32>()?;
        filter_logits(&mut values, self.sampler.min_p, self.sampler.top_n_sigma);
        let len = values.len();
        let filtered = Tensor::from_vec(values, len, &self.device)?;
        self.logits_processor.sample(&filtered)
    }
}

fn candle_error(err: E) -> candle_core::Error {
    candle_core::Error::Msg(err.to_string())
}

impl NativeEngine for CandleEngine {
    fn eval_prompt(&mut self, text: &str, images: &[Vec<u8>], add_bos: bool) -> Result<(), EngineError> {
        if !images.is_empty() {
            return Err(EngineError::NotMultimodal);
        }
        if add_bos {
            self.index_pos = 0;
            self.next_logits = None;
        }

        let prompt = self
            .formatter
            .render(text, add_bos)
            .map_err(|e| EngineError::Eval(e.to_string()))?;
        let tokens = self
            .tokenizer
            .encode(prompt.as_str(), false)
            .map_err(|e| EngineError::Eval(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            return Err(EngineError::Eval("prompt encodes to zero tokens".to_string()));
        }
        if self.index_pos + tokens.len() > self.n_ctx {
            return Err(EngineError::Eval(format!(
                "context window exceeded: {} + {} tokens > n_ctx {}",
                self.index_pos,
                tokens.len(),
                self.n_ctx
            )));
        }

        let logits = self
            .forward_tokens(&tokens)
            .map_err(|e| EngineError::Eval(e.to_string()))?;
        self.next_logits = Some(logits);
        self.status = EngineStatus {
            prompt_n: tokens.len(),
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
        let mut generated: Vec<u32> = Vec::new();
        let mut text = String::new();
        let mut emitted = 0usize;

        while generated.len() < n_predict && self.index_pos < self.n_ctx {
            if self.interrupt.load(Ordering::Acquire) {
                debug!(predicted = generated.len(), "generation interrupted");
                break;
            }
            let logits = self
                .next_logits
                .take()
                .ok_or_else(|| EngineError::Generate("no evaluated prompt to continue from".to_string()))?;
            let next_token = self
                .sample(&logits)
                .map_err(|e| EngineError::Generate(e.to_string()))?;

            if next_token == self.eos_token_id || next_token == self.eot_token_id {
                break;
            }
            generated.push(next_token);
            self.status.predicted_n = generated.len();

            text = self
                .tokenizer
                .decode(&generated, true)
                .map_err(|e| EngineError::Generate(e.to_string()))?;

            let step = advance(&text, emitted, self.family, stop);
            if !step.emit.is_empty() {
                on_token(step.emit);
                emitted += step.emit.len();
            }

            // The stopping token still goes into the KV cache so a follow-up turn sees it.
            let logits = self
                .forward_tokens(&[next_token])
                .map_err(|e| EngineError::Generate(e.to_string()))?;
            if step.stopped {
                return finish(on_token);
            }
            self.next_logits = Some(logits);
        }

        let rest = flush(&text, emitted);
        if !rest.is_empty() {
            on_token(rest);
        }
        finish(on_token)
    }

    fn reinit_sampler(&mut self, overrides: &BTreeMap<String, Value>) -> Result<(), EngineError> {
        let mut sampler = self.sampler;
        let ignored = sampler.apply_overrides(overrides);
        if !ignored.is_empty() {
            warn!(?ignored, "unknown sampler keys ignored");
        }
        self.logits_processor = build_logits_processor(&sampler).map_err(EngineError::Sampler)?;
        self.sampler = sampler;
        debug!(?sampler, "sampler re-initialized");
        Ok(())
    }

    fn sampler_overrides(&self) -> BTreeMap<String, Value> {
        self.sampler.to_overrides()
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.index_pos = 0;
        self.next_logits = None;
        self.status = EngineStatus::default();
        Ok(())
    }

    fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn is_multimodal(&self) -> bool {
        false
    }

    fn status(&self) -> EngineStatus {
        self.status
    }
}

const SAMPLER_OVERRIDE_KEYS: [&str; 7] =
    ["temp", "temperature", "top_k", "top_p", "min_p", "top_n_sigma", "seed"];

fn sampler_keys_only(overrides: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    overrides
        .iter()
        .filter(|(k, _)| SAMPLER_OVERRIDE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn select_device(raw: Option<&Value>) -> Result<Device> {
    let Some(name) = raw.and_then(Value::as_str) else {
        return Ok(Device::Cpu);
    };
    let lowered = name.trim().to_lowercase();
    if lowered == "cpu" {
        return Ok(Device::Cpu);
    }
    if let Some(index) = lowered.strip_prefix("cuda") {
        let ordinal = if index.is_empty() { 0 } else { index.parse::<usize>()? };
        if !candle_core::utils::cuda_is_available() {
            warn!(device = %name, "built without CUDA support, running on CPU");
            return Ok(Device::Cpu);
        }
        return Ok(Device::new_cuda(ordinal)?);
    }
    if let Some(index) = lowered.strip_prefix("metal") {
        let ordinal = if index.is_empty() { 0 } else { index.parse::<usize>()? };
        if !candle_core::utils::metal_is_available() {
            warn!(device = %name, "built without Metal support, running on CPU");
            return Ok(Device::Cpu);
        }
        return Ok(Device::new_metal(ordinal)?);
    }
    Err(E::msg(format!("Unsupported device '{}'", name)))
}

fn build_logits_processor(settings: &SamplerSettings) -> Result<LogitsProcessor, String> {
    let seed = match settings.seed {
        Some(seed) => seed,
        None => {
            let mut buf = [0u8; 8];
            getrandom::getrandom(&mut buf).map_err(|e| format!("seed generation failed: {}", e))?;
            u64::from_le_bytes(buf)
        }
    };

    let temperature = settings.temperature;
    let sampling = if temperature <= 0.0 {
        Sampling::ArgMax
    } else {
        match (settings.top_k, settings.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    };
    Ok(LogitsProcessor::from_sampling(seed, sampling))
}

/// Masks logits outside the min-p and top-n-sigma windows with `-inf`.
pub(crate) fn filter_logits(values: &mut [f32], min_p: Option<f64>, top_n_sigma: Option<f64>) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }

    if let Some(n) = top_n_sigma {
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = finite.iter().sum::<f32>() / finite.len() as f32;
        let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / finite.len() as f32;
        let threshold = max - n as f32 * variance.sqrt();
        for v in values.iter_mut() {
            if *v < threshold {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    if let Some(p) = min_p {
        // p(x) >= p * p(max)  <=>  logit(x) >= logit(max) + ln(p)
        let threshold = max + (p as f32).ln();
        for v in values.iter_mut() {
            if *v < threshold {
                *v = f32::NEG_INFINITY;
            }
        }
    }
}

fn finish(on_token: &mut dyn FnMut(&str)) -> Result<(), EngineError> {
    on_token(EOS_SENTINEL);
    Ok(())
}

/// Outcome of one incremental decode step.
#[derive(Debug, PartialEq)]
pub(crate) struct Step<'a> {
    pub emit: &'a str,
    pub stopped: bool,
}

/// Decides what part of the decoded `text` past `emitted` can go to the client.
///
/// Text is cut at the earliest stop marker or stop string. A trailing partial
/// UTF-8 sequence (decoded as U+FFFD) and any suffix that could still grow into a
/// stop string are held back for the next step.
pub(crate) fn advance<'a>(text: &'a str, emitted: usize, family: PromptFamily, stop: &[String]) -> Step<'a> {
    let Some(fresh) = text.get(emitted..) else {
        return Step { emit: "", stopped: false };
    };
    let stops: Vec<&str> = family
        .stop_markers()
        .iter()
        .copied()
        .chain(stop.iter().map(String::as_str))
        .filter(|s| !s.is_empty())
        .collect();

    let longest = stops.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut window = emitted.saturating_sub(longest.saturating_sub(1));
    while !text.is_char_boundary(window) {
        window -= 1;
    }
    if should_stop_on_text(family, &text[window..], stop) {
        let cut = earliest_stop(text, window, &stops).max(emitted);
        return Step {
            emit: &text[emitted..cut],
            stopped: true,
        };
    }

    let ready = fresh.trim_end_matches('\u{FFFD}');
    let held = stops
        .iter()
        .map(|s| partial_stop_len(ready, s))
        .max()
        .unwrap_or(0);
    Step {
        emit: &ready[..ready.len() - held],
        stopped: false,
    }
}

/// Whatever is still held back once generation ends without a stop.
fn flush(text: &str, emitted: usize) -> &str {
    text.get(emitted..).unwrap_or_default().trim_end_matches('\u{FFFD}')
}

/// Length of the longest suffix of `text` that is a proper prefix of `stop`.
fn partial_stop_len(text: &str, stop: &str) -> usize {
    (1..stop.len())
        .rev()
        .filter(|&n| stop.is_char_boundary(n) && n <= text.len())
        .find(|&n| text.is_char_boundary(text.len() - n) && text.ends_with(&stop[..n]))
        .unwrap_or(0)
}

fn earliest_stop(text: &str, from: usize, stops: &[&str]) -> usize {
    let Some(tail) = text.get(from..) else {
        return from;
    };
    stops
        .iter()
        .filter_map(|s| tail.find(s))
        .min()
        .map(|i| from + i)
        .unwrap_or(from)
}
