use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use relay_control_models::PROJECTOR_PREFIX;

use crate::prompting::PromptFamily;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub family: PromptFamily,
}

/// Flat listing of the GGUF models living directly under one model root.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub models_dir: PathBuf,
    pub entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn discover(models_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let models_dir = models_dir.into();
        let mut entries = Vec::new();

        for entry in fs::read_dir(&models_dir)? {
            let path = entry?.path();
            if !path.is_file() || !is_gguf(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if is_projector(file_name) {
                continue;
            }

            entries.push(ModelEntry {
                file_name: file_name.to_string(),
                family: infer_family_from_filename(file_name),
                path: path.clone(),
            });
        }

        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        Ok(Self {
            models_dir,
            entries,
        })
    }

    pub fn file_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.file_name.clone()).collect()
    }

    /// Case-insensitive substring match; the first entry in sorted order wins.
    pub fn resolve_model_name(&self, name: &str) -> Option<&ModelEntry> {
        resolve_in(&self.entries, name)
    }

    pub fn format_list(&self) -> String {
        if self.entries.is_empty() {
            return format!("No GGUF models found in {}", self.models_dir.display());
        }

        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        lines.push(format!("Models ({})", self.entries.len()));
        for entry in &self.entries {
            lines.push(format!("- {} family={:?}", entry.file_name, entry.family));
        }
        lines.join("\n")
    }
}

fn resolve_in<'a>(entries: &'a [ModelEntry], name: &str) -> Option<&'a ModelEntry> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    entries
        .iter()
        .find(|e| e.file_name.to_lowercase().contains(&needle))
}

pub fn is_projector(file_name: &str) -> bool {
    file_name.to_lowercase().starts_with(PROJECTOR_PREFIX)
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
}

pub fn infer_family_from_filename(name: &str) -> PromptFamily {
    let lowered = name.to_lowercase();
    if lowered.contains("llama") {
        PromptFamily::Llama
    } else if lowered.contains("qwen") {
        PromptFamily::Qwen
    } else if lowered.contains("gemma") {
        PromptFamily::Gemma
    } else {
        PromptFamily::Unknown
    }
}

#[cfg(test)]
pub(crate) fn mk_temp_dir(prefix: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time ok")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}
