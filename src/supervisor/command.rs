use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use relay_control_models::{EngineVariant, SlotConfig, SlotId};
use serde_json::Value;

use crate::overrides::to_flags;

const LLAMA_SERVER_BIN: &str = "llama-server";

/// Program and arguments for one backend launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn for_slot(slot: SlotId, cfg: &SlotConfig, host: &str, port: u16) -> std::io::Result<Self> {
        match cfg.engine {
            EngineVariant::Native => native(slot, cfg, host, port),
            EngineVariant::LlamaServer => Ok(llama_server(slot, cfg, host, port)),
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

fn native(slot: SlotId, cfg: &SlotConfig, host: &str, port: u16) -> std::io::Result<LaunchCommand> {
    let program = match &cfg.launcher {
        Some(path) => path.clone().into_os_string(),
        None => std::env::current_exe()?.into_os_string(),
    };

    let mut args = vec![
        "backend".to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--model-root".to_string(),
        cfg.model_root.display().to_string(),
        "--model-path".to_string(),
        cfg.model_path.clone(),
        "--n-predict".to_string(),
        cfg.n_predict.to_string(),
    ];
    if let Some(mmproj) = cfg.mmproj_path.as_deref().filter(|p| !p.trim().is_empty()) {
        args.push("--mmproj-path".to_string());
        args.push(mmproj.to_string());
    }

    let mut overrides = cfg.overrides.clone();
    if let Some(device) = slot_device(slot) {
        overrides
            .entry("device".to_string())
            .or_insert(Value::String(device));
    }
    let flags = to_flags(&overrides);
    if !flags.is_empty() {
        args.push("--".to_string());
        args.extend(flags);
    }

    Ok(LaunchCommand { program, args })
}

fn llama_server(slot: SlotId, cfg: &SlotConfig, host: &str, port: u16) -> LaunchCommand {
    let program = cfg
        .launcher
        .clone()
        .unwrap_or_else(|| PathBuf::from(LLAMA_SERVER_BIN))
        .into_os_string();

    let mut args = vec![
        "--model".to_string(),
        cfg.model_file().display().to_string(),
        "--n-predict".to_string(),
        cfg.n_predict.to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    if let Some(projector) = cfg.projector_file() {
        args.push("--mmproj".to_string());
        args.push(projector.display().to_string());
    }
    args.extend(to_flags(&cfg.overrides));
    if let Some(device) = slot_device(slot).filter(|_| !cfg.overrides.contains_key("device")) {
        args.push("--device".to_string());
        args.push(device);
    }

    LaunchCommand { program, args }
}

fn slot_device(slot: SlotId) -> Option<String> {
    slot.device_index().map(|i| format!("CUDA{}", i))
}
