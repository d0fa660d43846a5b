use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_control_models::{SlotConfig, SlotId};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no slots configured")]
    NoSlots,
    #[error("slot 'default' cannot be combined with numbered slots")]
    MixedSlots,
    #[error("{0}")]
    InvalidSlot(String),
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("a slot id is required when more than one slot is configured")]
    SlotRequired,
    #[error("Bad params: model_name or model_path is required")]
    MissingModelReference,
    #[error("no model matching '{name}' in {}", root.display())]
    UnresolvedModelName { name: String, root: PathBuf },
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("cannot list models in {}: {source}", root.display())]
    Catalog {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Routing proxy settings, read from `relay.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub slots: BTreeMap<String, SlotConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_base() -> u16 {
    8001
}

fn default_control_timeout_ms() -> u64 {
    2000
}

fn default_ready_timeout_secs() -> u64 {
    300
}

fn default_stop_timeout_secs() -> u64 {
    30
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Slot tables keyed by parsed id; rejects empty and mixed layouts.
    pub fn slot_table(&self) -> Result<BTreeMap<SlotId, SlotConfig>, ConfigError> {
        let mut table = BTreeMap::new();
        for (key, cfg) in &self.slots {
            let id: SlotId = key.parse().map_err(ConfigError::InvalidSlot)?;
            table.insert(id, cfg.clone());
        }
        validate_layout(table.keys())?;
        Ok(table)
    }

    pub fn port_for(&self, slot: SlotId) -> Result<u16, ConfigError> {
        let offset = slot.device_index().unwrap_or(0);
        u16::try_from(offset)
            .ok()
            .and_then(|o| self.port_base.checked_add(o))
            .ok_or_else(|| ConfigError::InvalidSlot(format!("slot {} overflows the port range", slot)))
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

pub(crate) fn validate_layout<'a>(ids: impl Iterator<Item = &'a SlotId>) -> Result<(), ConfigError> {
    let mut has_default = false;
    let mut has_device = false;
    for id in ids {
        match id {
            SlotId::Default => has_default = true,
            SlotId::Device(_) => has_device = true,
        }
    }
    match (has_default, has_device) {
        (false, false) => Err(ConfigError::NoSlots),
        (true, true) => Err(ConfigError::MixedSlots),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_control_models::EngineVariant;
    use serde_json::json;

    const TWO_GPUS: &str = r#"
        listen = "127.0.0.1:9000"
        port_base = 9100

        [slots.0]
        model_root = "/models"
        model_path = "gemma-3-4b.gguf"
        mmproj_path = "mmproj-gemma.gguf"

        [slots.0.overrides]
        n_gpu_layers = 100
        flash_attn = true

        [slots.1]
        model_root = "/models"
        model_path = "qwen2.5-7b.gguf"
        engine = "llama-server"
        n_predict = 256
    "#;

    #[test]
    fn parses_slots_with_defaults() {
        let cfg = ProxyConfig::parse(TWO_GPUS).expect("parse config");
        assert_eq!(cfg.listen, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(cfg.backend_host, "127.0.0.1");
        assert_eq!(cfg.control_timeout(), Duration::from_secs(2));

        let table = cfg.slot_table().expect("slot table");
        let gpu0 = &table[&SlotId::Device(0)];
        assert_eq!(gpu0.n_predict, 1024);
        assert_eq!(gpu0.engine, EngineVariant::Native);
        assert_eq!(gpu0.overrides.get("flash_attn"), Some(&json!(true)));
        let gpu1 = &table[&SlotId::Device(1)];
        assert_eq!(gpu1.engine, EngineVariant::LlamaServer);
        assert_eq!(gpu1.n_predict, 256);

        assert_eq!(cfg.port_for(SlotId::Device(1)).expect("port"), 9101);
    }

    #[test]
    fn default_slot_uses_the_base_port() {
        let cfg = ProxyConfig::parse(
            "[slots.default]\nmodel_root = \"/m\"\nmodel_path = \"a.gguf\"\n",
        )
        .expect("parse config");
        assert_eq!(cfg.port_for(SlotId::Default).expect("port"), 8001);
        assert_eq!(cfg.listen.port(), 8000);
    }

    #[test]
    fn rejects_bad_layouts() {
        let empty = ProxyConfig::parse("").expect("parse empty");
        assert!(matches!(empty.slot_table(), Err(ConfigError::NoSlots)));

        let mixed = ProxyConfig::parse(
            "[slots.default]\nmodel_root = \"/m\"\nmodel_path = \"a.gguf\"\n\
             [slots.2]\nmodel_root = \"/m\"\nmodel_path = \"b.gguf\"\n",
        )
        .expect("parse mixed");
        assert!(matches!(mixed.slot_table(), Err(ConfigError::MixedSlots)));

        let bad_key = ProxyConfig::parse("[slots.gpu]\nmodel_root = \"/m\"\nmodel_path = \"a.gguf\"\n")
            .expect("parse bad key");
        assert!(matches!(bad_key.slot_table(), Err(ConfigError::InvalidSlot(_))));

        assert!(ProxyConfig::parse("listen_port = 1").is_err());
    }
}
