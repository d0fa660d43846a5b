use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use crate::prompting::PromptFamily;

/// Quantized weights for the model families the candle engine can run.
pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &Path, family: PromptFamily, device: &Device) -> Result<Self> {
        match family {
            PromptFamily::Llama | PromptFamily::Qwen => {}
            PromptFamily::Gemma => {
                return Err(E::msg(format!(
                    "{}: gemma weights need engine = \"llama-server\"",
                    path.display()
                )))
            }
            PromptFamily::Unknown => {
                return Err(E::msg(format!(
                    "{}: file name does not identify a llama or qwen model",
                    path.display()
                )))
            }
        }

        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("cannot open {}: {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| E::msg(format!("{} is not a readable GGUF file: {}", path.display(), e)))?;

        if family == PromptFamily::Qwen {
            return quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device)
                .map(Self::Qwen2)
                .map_err(|e| explain_load_error(path, e));
        }
        Ok(Self::Llama(quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?))
    }

    /// Logits for the last position of `input`. Position 0 drops the KV cache.
    pub fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }
}

/// A GGUF without the final norm tensor is one part of a split download.
fn explain_load_error(path: &Path, err: candle_core::Error) -> E {
    let text = err.to_string();
    if text.contains("output_norm.weight") {
        E::msg(format!(
            "{} lacks output_norm.weight; it looks like one shard of a split model, merge the parts before loading",
            path.display()
        ))
    } else {
        E::msg(text)
    }
}
