use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use relay_control_models::{SlotConfig, SlotConfigPatch, SlotId};
use tracing::info;

use crate::config::{validate_layout, ConfigError};
use crate::model_catalog::ModelCatalog;

/// Desired configuration per slot: the startup snapshot and the live copy.
#[derive(Debug)]
pub struct SlotRegistry {
    startup: BTreeMap<SlotId, SlotConfig>,
    live: RwLock<BTreeMap<SlotId, SlotConfig>>,
}

impl SlotRegistry {
    pub fn new(startup: BTreeMap<SlotId, SlotConfig>) -> Result<Self, ConfigError> {
        validate_layout(startup.keys())?;
        for cfg in startup.values() {
            validate(cfg)?;
        }
        Ok(Self {
            live: RwLock::new(startup.clone()),
            startup,
        })
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.startup.keys().copied().collect()
    }

    pub fn is_multi_slot(&self) -> bool {
        self.startup.len() > 1
    }

    /// Lowest configured slot; requests without a slot id land here.
    pub fn default_slot(&self) -> SlotId {
        self.startup.keys().next().copied().unwrap_or(SlotId::Default)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.startup.contains_key(&id)
    }

    pub fn resolve_slot(&self, requested: Option<SlotId>) -> Result<SlotId, ConfigError> {
        match requested {
            None => Ok(self.default_slot()),
            Some(id) if self.contains(id) => Ok(id),
            Some(id) => Err(ConfigError::UnknownSlot(id)),
        }
    }

    pub fn startup(&self, id: SlotId) -> Option<&SlotConfig> {
        self.startup.get(&id)
    }

    pub fn live(&self, id: SlotId) -> Option<SlotConfig> {
        self.read().get(&id).cloned()
    }

    pub fn all_live(&self) -> BTreeMap<SlotId, SlotConfig> {
        self.read().clone()
    }

    pub fn list_models(&self, id: SlotId) -> Result<Vec<String>, ConfigError> {
        let cfg = self.live(id).ok_or(ConfigError::UnknownSlot(id))?;
        Ok(catalog_for(&cfg)?.file_names())
    }

    pub fn resolve_model_name(&self, id: SlotId, name: &str) -> Result<Option<String>, ConfigError> {
        let cfg = self.live(id).ok_or(ConfigError::UnknownSlot(id))?;
        Ok(catalog_for(&cfg)?
            .resolve_model_name(name)
            .map(|entry| entry.file_name.clone()))
    }

    /// Validates a model switch without committing it.
    ///
    /// A missing slot id is only accepted in single-slot deployments. The model
    /// name, when given, is resolved against the patched model root.
    pub fn prepare_switch(&self, patch: &SlotConfigPatch) -> Result<(SlotId, SlotConfig), ConfigError> {
        let id = match patch.slot {
            Some(id) => self.resolve_slot(Some(id))?,
            None if self.is_multi_slot() => return Err(ConfigError::SlotRequired),
            None => self.default_slot(),
        };
        if !patch.has_model_reference() {
            return Err(ConfigError::MissingModelReference);
        }

        let mut candidate = self.live(id).ok_or(ConfigError::UnknownSlot(id))?;
        candidate.apply(patch);

        if let Some(name) = patch.model_name.as_deref().filter(|n| !n.trim().is_empty()) {
            let catalog = catalog_for(&candidate)?;
            let entry = catalog
                .resolve_model_name(name)
                .ok_or_else(|| ConfigError::UnresolvedModelName {
                    name: name.to_string(),
                    root: candidate.model_root.clone(),
                })?;
            candidate.model_path = entry.file_name.clone();
        }

        validate(&candidate)?;
        Ok((id, candidate))
    }

    pub fn commit(&self, id: SlotId, config: SlotConfig) {
        info!(slot = %id, model = %config.model_path, "slot configuration updated");
        self.write().insert(id, config);
    }

    /// Restores the startup configuration of one slot and returns it.
    pub fn reset(&self, id: SlotId) -> Result<SlotConfig, ConfigError> {
        let initial = self.startup(id).cloned().ok_or(ConfigError::UnknownSlot(id))?;
        self.write().insert(id, initial.clone());
        info!(slot = %id, "slot configuration reset to startup value");
        Ok(initial)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SlotId, SlotConfig>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SlotId, SlotConfig>> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn catalog_for(cfg: &SlotConfig) -> Result<ModelCatalog, ConfigError> {
    ModelCatalog::discover(&cfg.model_root).map_err(|source| ConfigError::Catalog {
        root: cfg.model_root.clone(),
        source,
    })
}

fn validate(cfg: &SlotConfig) -> Result<(), ConfigError> {
    let model_file = cfg.model_file();
    if cfg.model_path.trim().is_empty() || !model_file.is_file() {
        return Err(ConfigError::ModelNotFound(model_file));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model_catalog::mk_temp_dir;
    use relay_control_models::EngineVariant;
    use serde_json::json;
    use std::fs;
    use std::path::{Path, PathBuf};

    pub(crate) fn model_dir(files: &[&str]) -> PathBuf {
        let dir = mk_temp_dir("relay_registry");
        for f in files {
            fs::write(dir.join(f), b"stub").expect("write model stub");
        }
        dir
    }

    pub(crate) fn slot(root: &Path, model: &str) -> SlotConfig {
        SlotConfig {
            model_root: root.to_path_buf(),
            model_path: model.to_string(),
            mmproj_path: None,
            n_predict: 128,
            overrides: BTreeMap::new(),
            launcher: None,
            engine: EngineVariant::Native,
        }
    }

    fn patch(body: serde_json::Value) -> SlotConfigPatch {
        serde_json::from_value(body).expect("valid patch")
    }

    #[test]
    fn switch_by_name_resolves_and_reset_restores() {
        let dir = model_dir(&["gemma-3-4b.gguf", "mmproj-model.gguf", "qwen2.5-7b.gguf"]);
        let registry =
            SlotRegistry::new(BTreeMap::from([(SlotId::Default, slot(&dir, "qwen2.5-7b.gguf"))]))
                .expect("registry");

        let (id, cfg) = registry
            .prepare_switch(&patch(json!({"model_name": "gemma"})))
            .expect("switch resolves");
        assert_eq!(id, SlotId::Default);
        assert_eq!(cfg.model_path, "gemma-3-4b.gguf");
        assert_eq!(registry.live(id).expect("live").model_path, "qwen2.5-7b.gguf");

        registry.commit(id, cfg);
        assert_eq!(registry.live(id).expect("live").model_path, "gemma-3-4b.gguf");

        let restored = registry.reset(id).expect("reset");
        assert_eq!(restored.model_path, "qwen2.5-7b.gguf");
        assert_eq!(registry.live(id), registry.startup(id).cloned());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bad_switches_are_rejected_without_touching_live_state() {
        let dir = model_dir(&["gemma-3-4b.gguf"]);
        let registry = SlotRegistry::new(BTreeMap::from([
            (SlotId::Device(0), slot(&dir, "gemma-3-4b.gguf")),
            (SlotId::Device(1), slot(&dir, "gemma-3-4b.gguf")),
        ]))
        .expect("registry");

        assert!(matches!(
            registry.prepare_switch(&patch(json!({"model_name": "gemma"}))),
            Err(ConfigError::SlotRequired)
        ));
        assert!(matches!(
            registry.prepare_switch(&patch(json!({"gpu": 1, "model_name": "qwen"}))),
            Err(ConfigError::UnresolvedModelName { .. })
        ));
        assert!(matches!(
            registry.prepare_switch(&patch(json!({"gpu": 1, "model_path": "missing.gguf"}))),
            Err(ConfigError::ModelNotFound(_))
        ));
        assert!(matches!(
            registry.prepare_switch(&patch(json!({"gpu": 1, "n_predict": 5}))),
            Err(ConfigError::MissingModelReference)
        ));
        assert!(matches!(
            registry.prepare_switch(&patch(json!({"gpu": 7, "model_name": "gemma"}))),
            Err(ConfigError::UnknownSlot(SlotId::Device(7)))
        ));
        assert_eq!(registry.all_live(), registry.startup.clone());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn slot_resolution_defaults_to_the_lowest_slot() {
        let dir = model_dir(&["a.gguf"]);
        let registry = SlotRegistry::new(BTreeMap::from([
            (SlotId::Device(3), slot(&dir, "a.gguf")),
            (SlotId::Device(1), slot(&dir, "a.gguf")),
        ]))
        .expect("registry");
        assert_eq!(registry.resolve_slot(None).expect("default"), SlotId::Device(1));
        assert!(registry.is_multi_slot());
        assert_eq!(registry.list_models(SlotId::Device(3)).expect("list"), vec!["a.gguf"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn startup_config_must_point_at_a_model_file() {
        let dir = model_dir(&[]);
        let err = SlotRegistry::new(BTreeMap::from([(SlotId::Default, slot(&dir, "none.gguf"))]))
            .expect_err("missing model");
        assert!(matches!(err, ConfigError::ModelNotFound(_)));
        let _ = fs::remove_dir_all(dir);
    }
}
