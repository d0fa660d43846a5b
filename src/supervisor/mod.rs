//! One backend child process per slot, with an explicit lifecycle state machine.
//!
//! Every public method blocks (process waits, joins); async callers go through
//! `spawn_blocking`. Model loading itself never blocks a caller: `start` returns once
//! the process is spawned and a watcher thread promotes the slot to `Running` when
//! the backend answers its health probe.

mod command;
mod process;

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use relay_control_models::{SlotConfig, SlotId};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::command::LaunchCommand;
pub use self::process::OUTPUT_TARGET;
use self::process::{BackendProcess, Signal};
use crate::registry::SlotRegistry;

const READY_POLL: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("slot {0} has no port assigned")]
    MissingPort(SlotId),
    #[error("slot {slot}: cannot launch backend: {source}")]
    Launch {
        slot: SlotId,
        #[source]
        source: io::Error,
    },
    #[error("slot {0}: no backend process running")]
    NotRunning(SlotId),
    #[error("slot {slot}: cannot signal backend: {source}")]
    Signal {
        slot: SlotId,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub backend_host: String,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            backend_host: "127.0.0.1".to_string(),
            ready_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

struct SlotRuntime {
    state: SlotState,
    /// Bumped on every launch and stop so a stale readiness watcher can tell it lost.
    epoch: u64,
    process: Option<BackendProcess>,
}

struct SlotEntry {
    port: u16,
    /// Held across whole transitions so a restart never interleaves with a stop.
    lifecycle: Mutex<()>,
    runtime: Arc<Mutex<SlotRuntime>>,
}

pub struct Supervisor {
    registry: Arc<SlotRegistry>,
    slots: BTreeMap<SlotId, SlotEntry>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(
        registry: Arc<SlotRegistry>,
        ports: &BTreeMap<SlotId, u16>,
        options: SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        let mut slots = BTreeMap::new();
        for id in registry.slot_ids() {
            let port = *ports.get(&id).ok_or(SupervisorError::MissingPort(id))?;
            slots.insert(
                id,
                SlotEntry {
                    port,
                    lifecycle: Mutex::new(()),
                    runtime: Arc::new(Mutex::new(SlotRuntime {
                        state: SlotState::Stopped,
                        epoch: 0,
                        process: None,
                    })),
                },
            );
        }
        Ok(Self {
            registry,
            slots,
            options,
        })
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn port(&self, id: SlotId) -> Result<u16, SupervisorError> {
        Ok(self.entry(id)?.port)
    }

    pub fn backend_url(&self, id: SlotId) -> Result<String, SupervisorError> {
        Ok(format!("http://{}:{}", self.options.backend_host, self.port(id)?))
    }

    pub fn state(&self, id: SlotId) -> Result<SlotState, SupervisorError> {
        Ok(lock(&self.entry(id)?.runtime).state)
    }

    /// Launches the slot's backend unless one is already alive.
    pub fn start(&self, id: SlotId) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let _transition = lock(&entry.lifecycle);
        self.start_locked(id, entry)
    }

    /// Stops the slot's backend. No-op when nothing runs.
    pub fn stop(&self, id: SlotId) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let _transition = lock(&entry.lifecycle);
        self.stop_locked(id, entry);
        Ok(())
    }

    pub fn is_alive(&self, id: SlotId) -> Result<bool, SupervisorError> {
        let mut runtime = lock(&self.entry(id)?.runtime);
        Ok(runtime.process.as_mut().is_some_and(|p| !p.has_exited()))
    }

    pub fn liveness(&self) -> BTreeMap<SlotId, bool> {
        self.slots
            .keys()
            .map(|id| (*id, self.is_alive(*id).unwrap_or(false)))
            .collect()
    }

    /// Commits an already merged and validated configuration, then stops and starts the slot.
    pub fn restart_for_new_config(&self, id: SlotId, config: SlotConfig) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        let _transition = lock(&entry.lifecycle);
        self.stop_locked(id, entry);
        self.registry.commit(id, config);
        self.start_locked(id, entry)
    }

    /// Process-level SIGINT, for engines without an interrupt endpoint.
    pub fn signal_interrupt(&self, id: SlotId) -> Result<(), SupervisorError> {
        let mut runtime = lock(&self.entry(id)?.runtime);
        let process = runtime.process.as_mut().ok_or(SupervisorError::NotRunning(id))?;
        if process.has_exited() {
            return Err(SupervisorError::NotRunning(id));
        }
        info!(slot = %id, pid = process.pid(), "sending SIGINT to backend");
        process
            .signal(Signal::Interrupt)
            .map_err(|source| SupervisorError::Signal { slot: id, source })
    }

    pub fn start_all(&self) -> Result<(), SupervisorError> {
        for id in self.slots.keys() {
            self.start(*id)?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for (id, entry) in &self.slots {
            let _transition = lock(&entry.lifecycle);
            self.stop_locked(*id, entry);
        }
    }

    fn entry(&self, id: SlotId) -> Result<&SlotEntry, SupervisorError> {
        self.slots.get(&id).ok_or(SupervisorError::UnknownSlot(id))
    }

    fn start_locked(&self, id: SlotId, entry: &SlotEntry) -> Result<(), SupervisorError> {
        let cfg = self.registry.live(id).ok_or(SupervisorError::UnknownSlot(id))?;
        let mut runtime = lock(&entry.runtime);

        if let Some(process) = runtime.process.as_mut() {
            if !process.has_exited() {
                debug!(slot = %id, "backend already running");
                return Ok(());
            }
        }
        if let Some(stale) = runtime.process.take() {
            stale.shutdown(Duration::ZERO);
        }

        let launch = LaunchCommand::for_slot(id, &cfg, &self.options.backend_host, entry.port)
            .map_err(|source| SupervisorError::Launch { slot: id, source })?;
        info!(slot = %id, port = entry.port, command = %launch.display(), "launching backend");
        let process =
            BackendProcess::spawn(id, &launch).map_err(|source| SupervisorError::Launch { slot: id, source })?;

        runtime.epoch += 1;
        runtime.state = SlotState::Starting;
        runtime.process = Some(process);
        let epoch = runtime.epoch;
        drop(runtime);

        self.watch_readiness(id, entry, epoch);
        Ok(())
    }

    fn stop_locked(&self, id: SlotId, entry: &SlotEntry) {
        let process = {
            let mut runtime = lock(&entry.runtime);
            runtime.epoch += 1;
            match runtime.process.take() {
                Some(process) => {
                    runtime.state = SlotState::Stopping;
                    process
                }
                None => {
                    runtime.state = SlotState::Stopped;
                    return;
                }
            }
        };

        info!(slot = %id, pid = process.pid(), "stopping backend");
        let status = process.shutdown(self.options.stop_timeout);
        lock(&entry.runtime).state = SlotState::Stopped;
        info!(slot = %id, status = ?status, "backend stopped");
    }

    fn watch_readiness(&self, id: SlotId, entry: &SlotEntry, epoch: u64) {
        let runtime = Arc::clone(&entry.runtime);
        let url = format!("http://{}:{}/health", self.options.backend_host, entry.port);
        let ready_timeout = self.options.ready_timeout;

        let spawned = thread::Builder::new()
            .name(format!("relay_ready_{}", id))
            .spawn(move || {
                let agent = ureq::AgentBuilder::new().timeout(PROBE_TIMEOUT).build();
                let started = Instant::now();
                loop {
                    {
                        let mut rt = lock(&runtime);
                        if rt.epoch != epoch || rt.state != SlotState::Starting {
                            return;
                        }
                        let alive = rt.process.as_mut().is_some_and(|p| !p.has_exited());
                        if !alive {
                            warn!(slot = %id, "backend exited before becoming ready");
                            rt.state = SlotState::Stopped;
                            return;
                        }
                    }

                    if agent.get(&url).call().is_ok() {
                        let mut rt = lock(&runtime);
                        if rt.epoch == epoch && rt.state == SlotState::Starting {
                            rt.state = SlotState::Running;
                            info!(slot = %id, elapsed_ms = started.elapsed().as_millis() as u64, "backend ready");
                        }
                        return;
                    }
                    if started.elapsed() >= ready_timeout {
                        warn!(slot = %id, timeout_s = ready_timeout.as_secs(), "backend not ready in time");
                        return;
                    }
                    thread::sleep(READY_POLL);
                }
            });

        if let Err(err) = spawned {
            warn!(slot = %id, error = %err, "cannot spawn readiness watcher");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model_catalog::mk_temp_dir;
    use crate::registry::tests::{model_dir, slot};
    use relay_control_models::EngineVariant;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn script(body: &str) -> PathBuf {
        let dir = mk_temp_dir("relay_launcher");
        let path = dir.join("launcher.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write launcher");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod launcher");
        path
    }

    fn supervisor_with(launcher: &Path, engine: EngineVariant, port: u16, stop_timeout: Duration) -> Supervisor {
        let dir = model_dir(&["a.gguf", "b.gguf"]);
        let mut cfg = slot(&dir, "a.gguf");
        cfg.launcher = Some(launcher.to_path_buf());
        cfg.engine = engine;
        let registry = Arc::new(SlotRegistry::new(BTreeMap::from([(SlotId::Device(0), cfg)])).expect("registry"));
        Supervisor::new(
            registry,
            &BTreeMap::from([(SlotId::Device(0), port)]),
            SupervisorOptions {
                backend_host: "127.0.0.1".to_string(),
                ready_timeout: Duration::from_millis(400),
                stop_timeout,
            },
        )
        .expect("supervisor")
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn unused_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port")
    }

    #[test]
    fn start_stop_cycle_tracks_liveness() {
        let launcher = script("echo \"launched $*\"\nexec sleep 30");
        let sup = supervisor_with(&launcher, EngineVariant::Native, unused_port(), Duration::from_secs(2));
        let id = SlotId::Device(0);

        assert!(!sup.is_alive(id).expect("alive"));
        sup.stop(id).expect("stop while stopped is a no-op");

        sup.start(id).expect("start");
        assert!(sup.is_alive(id).expect("alive"));
        assert_eq!(sup.state(id).expect("state"), SlotState::Starting);
        sup.start(id).expect("second start is a no-op");

        sup.stop(id).expect("stop");
        assert!(!sup.is_alive(id).expect("alive"));
        assert_eq!(sup.state(id).expect("state"), SlotState::Stopped);
        assert_eq!(sup.liveness(), BTreeMap::from([(id, false)]));
    }

    #[test]
    fn restart_commits_config_and_relaunches() {
        let launcher = script("exec sleep 30");
        let sup = supervisor_with(&launcher, EngineVariant::Native, unused_port(), Duration::from_secs(2));
        let id = SlotId::Device(0);
        sup.start(id).expect("start");
        let first_pid = lock(&sup.entry(id).expect("entry").runtime)
            .process
            .as_ref()
            .map(|p| p.pid())
            .expect("pid");

        let mut cfg = sup.registry().live(id).expect("live");
        cfg.model_path = "b.gguf".to_string();
        sup.restart_for_new_config(id, cfg).expect("restart");

        assert_eq!(sup.registry().live(id).expect("live").model_path, "b.gguf");
        assert!(sup.is_alive(id).expect("alive"));
        let second_pid = lock(&sup.entry(id).expect("entry").runtime)
            .process
            .as_ref()
            .map(|p| p.pid())
            .expect("pid");
        assert_ne!(first_pid, second_pid);
        sup.stop_all();
        assert!(!sup.is_alive(id).expect("alive"));
    }

    #[test]
    fn unexpected_exit_is_reported_not_restarted() {
        let launcher = script("echo boom >&2\nexit 3");
        let sup = supervisor_with(&launcher, EngineVariant::Native, unused_port(), Duration::from_secs(2));
        let id = SlotId::Device(0);
        sup.start(id).expect("start");
        assert!(wait_until(|| !sup.is_alive(id).expect("alive")));
        assert!(wait_until(|| sup.state(id).expect("state") == SlotState::Stopped));
        assert!(!sup.is_alive(id).expect("alive"));
    }

    #[test]
    fn health_probe_promotes_slot_to_running() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"status\":\"ok\"}",
                );
            }
        });

        let launcher = script("exec sleep 30");
        let sup = supervisor_with(&launcher, EngineVariant::Native, port, Duration::from_secs(2));
        let id = SlotId::Device(0);
        sup.start(id).expect("start");
        assert!(wait_until(|| sup.state(id).expect("state") == SlotState::Running));
        sup.stop(id).expect("stop");
    }

    #[test]
    fn stubborn_backend_is_killed_after_grace_period() {
        let launcher = script("trap '' TERM\nwhile true; do sleep 0.05; done");
        let sup = supervisor_with(&launcher, EngineVariant::Native, unused_port(), Duration::from_millis(200));
        let id = SlotId::Device(0);
        sup.start(id).expect("start");
        thread::sleep(Duration::from_millis(100));
        sup.stop(id).expect("stop");
        assert!(!sup.is_alive(id).expect("alive"));
    }

    #[test]
    fn sigint_reaches_llama_server_backends() {
        let launcher = script("trap 'exit 0' INT\nwhile true; do sleep 0.05; done");
        let sup = supervisor_with(&launcher, EngineVariant::LlamaServer, unused_port(), Duration::from_secs(2));
        let id = SlotId::Device(0);
        assert!(matches!(sup.signal_interrupt(id), Err(SupervisorError::NotRunning(_))));

        sup.start(id).expect("start");
        thread::sleep(Duration::from_millis(100));
        sup.signal_interrupt(id).expect("sigint");
        assert!(wait_until(|| !sup.is_alive(id).expect("alive")));
        sup.stop(id).expect("stop after exit");
    }

    #[test]
    fn unknown_slots_are_errors() {
        let launcher = script("exec sleep 30");
        let sup = supervisor_with(&launcher, EngineVariant::Native, unused_port(), Duration::from_secs(1));
        assert!(matches!(sup.start(SlotId::Device(9)), Err(SupervisorError::UnknownSlot(_))));
        assert!(matches!(sup.is_alive(SlotId::Default), Err(SupervisorError::UnknownSlot(_))));
    }
}
