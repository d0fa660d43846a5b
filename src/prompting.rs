use std::collections::BTreeMap;

use minijinja::{context, Environment};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama,
    Qwen,
    Gemma,
    Unknown,
}

const LLAMA_TURN: &str = "{% if add_bos %}<|begin_of_text|>{% else %}<|eot_id|>{% endif %}\
<|start_header_id|>user<|end_header_id|>\n\n{{ text }}<|eot_id|>\
<|start_header_id|>assistant<|end_header_id|>\n\n";

const QWEN_TURN: &str = "{% if not add_bos %}<|im_end|>\n{% endif %}\
<|im_start|>user\n{{ text }}<|im_end|>\n<|im_start|>assistant\n";

const GEMMA_TURN: &str = "{% if add_bos %}<bos>{% else %}<end_of_turn>\n{% endif %}\
<start_of_turn>user\n{{ text }}<end_of_turn>\n<start_of_turn>model\n";

const PLAIN_TURN: &str = "{% if not add_bos %}\n{% endif %}[user]\n{{ text }}\n[/user]\n";

impl PromptFamily {
    fn turn_template(self) -> &'static str {
        match self {
            PromptFamily::Llama => LLAMA_TURN,
            PromptFamily::Qwen => QWEN_TURN,
            PromptFamily::Gemma => GEMMA_TURN,
            PromptFamily::Unknown => PLAIN_TURN,
        }
    }

    pub fn stop_markers(self) -> &'static [&'static str] {
        match self {
            PromptFamily::Llama => &["<|eot_id|>", "<|end_of_text|>"],
            PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>"],
            PromptFamily::Gemma => &["<end_of_turn>", "<eos>"],
            PromptFamily::Unknown => &[],
        }
    }
}

/// Renders one user turn in the chat markup of a model family.
pub struct TurnFormatter {
    env: Environment<'static>,
}

impl TurnFormatter {
    pub fn new(family: PromptFamily) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template("turn", family.turn_template())?;
        Ok(Self { env })
    }

    /// `add_bos` opens a fresh conversation; otherwise the previous assistant turn is closed first.
    pub fn render(&self, text: &str, add_bos: bool) -> Result<String, minijinja::Error> {
        self.env
            .get_template("turn")?
            .render(context!(text => text, add_bos => add_bos))
    }
}

pub fn should_stop_on_text(family: PromptFamily, text: &str, stop: &[String]) -> bool {
    family.stop_markers().iter().any(|marker| text.contains(marker))
        || stop.iter().any(|s| !s.is_empty() && text.contains(s.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub min_p: Option<f64>,
    pub top_n_sigma: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            top_p: Some(0.9),
            min_p: None,
            top_n_sigma: None,
            seed: None,
        }
    }
}

impl SamplerSettings {
    /// Applies engine-style override keys (`temp`, `top_k`, ...) on top of `self`.
    ///
    /// Returns the keys that were not understood.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (key, value) in overrides {
            let number = value.as_f64();
            match key.as_str() {
                "temp" | "temperature" => {
                    if let Some(t) = number {
                        self.temperature = t;
                    }
                }
                "top_k" => self.top_k = number.filter(|k| *k > 0.0).map(|k| k as usize),
                "top_p" => self.top_p = number.filter(|p| *p > 0.0 && *p < 1.0),
                "min_p" => self.min_p = number.filter(|p| *p > 0.0),
                "top_n_sigma" => self.top_n_sigma = number.filter(|s| *s > 0.0),
                "seed" => self.seed = value.as_u64(),
                _ => unknown.push(key.clone()),
            }
        }
        unknown
    }

    /// Inverse of [`SamplerSettings::apply_overrides`] for the values that are set.
    pub fn to_overrides(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        out.insert("temp".to_string(), json_number(self.temperature));
        if let Some(k) = self.top_k {
            out.insert("top_k".to_string(), Value::from(k));
        }
        for (key, value) in [("top_p", self.top_p), ("min_p", self.min_p), ("top_n_sigma", self.top_n_sigma)] {
            if let Some(v) = value {
                out.insert(key.to_string(), json_number(v));
            }
        }
        if let Some(seed) = self.seed {
            out.insert("seed".to_string(), Value::from(seed));
        }
        out
    }
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}
