use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use tokenizers::Tokenizer;
use tracing::info;

use crate::prompting::PromptFamily;

/// Looks for `tokenizer.json` next to the model, then in the model root.
pub(super) fn resolve_tokenizer_path(model_file: &Path, hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
    }

    let parent_dir = model_file.parent().unwrap_or(Path::new("."));
    let local = parent_dir.join("tokenizer.json");
    if local.exists() {
        return Some(local);
    }

    let stem = model_file.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let named = parent_dir.join(format!("{}.tokenizer.json", stem));
    if named.exists() {
        return Some(named);
    }

    None
}

fn default_hub_repo(family: PromptFamily) -> Option<&'static str> {
    match family {
        PromptFamily::Llama => Some("meta-llama/Meta-Llama-3-8B-Instruct"),
        PromptFamily::Qwen => Some("Qwen/Qwen2.5-7B-Instruct"),
        PromptFamily::Gemma | PromptFamily::Unknown => None,
    }
}

pub(super) fn load_tokenizer(
    model_file: &Path,
    hint: Option<&Path>,
    hub_repo: Option<&str>,
    family: PromptFamily,
) -> Result<Tokenizer> {
    if let Some(path) = resolve_tokenizer_path(model_file, hint) {
        info!(path = %path.display(), "using local tokenizer");
        return Tokenizer::from_file(path).map_err(E::msg);
    }

    let repo = hub_repo
        .or_else(|| default_hub_repo(family))
        .ok_or_else(|| E::msg("Tokenizer not found next to the model and no hub repo known for it."))?;
    info!(repo, "tokenizer.json not found locally, fetching from the hub");
    let api = hf_hub::api::sync::Api::new()?;
    let path = api.model(repo.to_string()).get("tokenizer.json")?;
    Tokenizer::from_file(path).map_err(E::msg)
}

pub(super) fn resolve_special_tokens(
    tokenizer: &Tokenizer,
    family: PromptFamily,
) -> Result<(u32, u32), String> {
    match family {
        PromptFamily::Llama => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| "Llama tokenizer lacks <|end_of_text|> and </s>.".to_string())?;
            let eot = tokenizer
                .token_to_id("<|eot_id|>")
                .ok_or_else(|| "Llama turn template requires <|eot_id|>.".to_string())?;
            if tokenizer.token_to_id("<|start_header_id|>").is_none() {
                return Err("Llama tokenizer lacks chat header tokens.".to_string());
            }
            Ok((eos, eot))
        }
        PromptFamily::Qwen => {
            let eos = tokenizer
                .token_to_id("<|endoftext|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| "Qwen tokenizer lacks <|endoftext|> and </s>.".to_string())?;
            let eot = tokenizer
                .token_to_id("<|im_end|>")
                .ok_or_else(|| "Qwen turn template requires <|im_end|>.".to_string())?;
            Ok((eos, eot))
        }
        PromptFamily::Gemma => {
            let eos = tokenizer
                .token_to_id("<eos>")
                .ok_or_else(|| "Gemma tokenizer lacks <eos>.".to_string())?;
            let eot = tokenizer.token_to_id("<end_of_turn>").unwrap_or(eos);
            Ok((eos, eot))
        }
        PromptFamily::Unknown => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
                .unwrap_or(2);
            Ok((eos, eos))
        }
    }
}
