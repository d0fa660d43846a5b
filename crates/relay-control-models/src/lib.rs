//! Control-plane types shared by the routing proxy and the backend supervisor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const DEFAULT_N_PREDICT: usize = 1024;

/// Prefix of auxiliary projector files living next to the models.
pub const PROJECTOR_PREFIX: &str = "mmproj";

/// One accelerator slot, or the single default slot of a one-backend deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotId {
    Default,
    Device(u32),
}

impl SlotId {
    pub fn device_index(&self) -> Option<u32> {
        match self {
            SlotId::Default => None,
            SlotId::Device(i) => Some(*i),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Default => f.write_str("default"),
            SlotId::Device(i) => write!(f, "{}", i),
        }
    }
}

impl FromStr for SlotId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("default") {
            return Ok(SlotId::Default);
        }
        trimmed
            .parse::<u32>()
            .map(SlotId::Device)
            .map_err(|_| format!("Invalid slot id '{}': expected 'default' or a device index", raw))
    }
}

impl Serialize for SlotId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Index(i) => Ok(SlotId::Device(i)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Which backend program hosts the model for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineVariant {
    /// Our own backend service; exposes an `/interrupt` endpoint.
    #[default]
    Native,
    /// An external llama-server binary; interrupted with SIGINT.
    LlamaServer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub model_root: PathBuf,
    pub model_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<String>,
    #[serde(default = "default_n_predict")]
    pub n_predict: usize,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineVariant,
}

fn default_n_predict() -> usize {
    DEFAULT_N_PREDICT
}

impl SlotConfig {
    pub fn model_file(&self) -> PathBuf {
        self.model_root.join(&self.model_path)
    }

    pub fn projector_file(&self) -> Option<PathBuf> {
        self.mmproj_path
            .as_ref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| self.model_root.join(p))
    }

    /// Top-level merge: fields present in the patch replace ours, the rest stay.
    pub fn apply(&mut self, patch: &SlotConfigPatch) {
        if let Some(root) = &patch.model_root {
            self.model_root = root.clone();
        }
        if let Some(path) = &patch.model_path {
            self.model_path = path.clone();
        }
        if let Some(mmproj) = &patch.mmproj_path {
            self.mmproj_path = mmproj.clone();
        }
        if let Some(n) = patch.n_predict {
            self.n_predict = n;
        }
        if let Some(overrides) = &patch.overrides {
            self.overrides = overrides.clone();
        }
        if let Some(launcher) = &patch.launcher {
            self.launcher = Some(launcher.clone());
        }
        if let Some(engine) = patch.engine {
            self.engine = engine;
        }
    }
}

/// Partial slot configuration as sent to `/switch_model`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfigPatch {
    #[serde(default, alias = "gpu", skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotId>,
    /// Fuzzy model reference, resolved against the model directory listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    /// `Some(None)` clears the projector.
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub mmproj_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineVariant>,
}

// Keeps an explicit `null` apart from an absent key.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl SlotConfigPatch {
    pub fn has_model_reference(&self) -> bool {
        self.model_name.as_deref().is_some_and(|n| !n.trim().is_empty())
            || self.model_path.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}
