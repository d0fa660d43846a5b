use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ExitStatus};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use relay_control_models::SlotId;
use tracing::{debug, info, warn};

use super::command::LaunchCommand;

/// Log target for lines captured from backend stdout/stderr.
pub const OUTPUT_TARGET: &str = "llama_relay::backend_output";

const EXIT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// A running backend child plus the threads draining its output.
pub struct BackendProcess {
    slot: SlotId,
    child: Child,
    readers: Vec<JoinHandle<()>>,
    exited: Option<ExitStatus>,
}

impl BackendProcess {
    pub fn spawn(slot: SlotId, launch: &LaunchCommand) -> io::Result<Self> {
        let mut child = launch.to_command().spawn()?;
        let mut readers = Vec::with_capacity(2);

        let attached = attach_readers(slot, &mut child, &mut readers);

        if let Err(err) = attached {
            let _ = child.kill();
            let _ = child.wait();
            for reader in readers {
                let _ = reader.join();
            }
            return Err(err);
        }

        debug!(slot = %slot, pid = child.id(), "backend process spawned");
        Ok(Self {
            slot,
            child,
            readers,
            exited: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Polls the child without blocking. Once an exit is seen it is remembered.
    pub fn has_exited(&mut self) -> bool {
        if self.exited.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(slot = %self.slot, %status, "backend process exited");
                self.exited = Some(status);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(slot = %self.slot, error = %err, "cannot poll backend process");
                false
            }
        }
    }

    pub fn signal(&mut self, signal: Signal) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        send_signal(&mut self.child, signal)
    }

    /// Terminates the child, escalating to a kill after `grace`, then joins the readers.
    pub fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Err(err) = self.signal(Signal::Terminate) {
            warn!(slot = %self.slot, error = %err, "SIGTERM failed");
        }

        let deadline = Instant::now() + grace;
        let status = loop {
            if let Some(status) = self.exited {
                break Some(status);
            }
            match self.child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => {
                    warn!(slot = %self.slot, grace_ms = grace.as_millis() as u64, "backend ignored SIGTERM, killing");
                    let _ = self.child.kill();
                    break self.child.wait().ok();
                }
                Err(err) => {
                    warn!(slot = %self.slot, error = %err, "cannot wait for backend process");
                    break None;
                }
            }
        };

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                warn!(slot = %self.slot, "output reader panicked");
            }
        }
        status
    }
}

fn attach_readers(slot: SlotId, child: &mut Child, readers: &mut Vec<JoinHandle<()>>) -> io::Result<()> {
    if let Some(pipe) = child.stdout.take() {
        readers.push(drain_output(slot, "stdout", pipe)?);
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(drain_output(slot, "stderr", pipe)?);
    }
    Ok(())
}

fn drain_output<R: Read + Send + 'static>(
    slot: SlotId,
    stream: &'static str,
    pipe: R,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("relay_slot_{}_{}", slot, stream))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        info!(target: OUTPUT_TARGET, slot = %slot, stream, "{}", line.trim_end());
                    }
                    Err(err) => {
                        debug!(slot = %slot, stream, error = %err, "backend output closed");
                        break;
                    }
                }
            }
        })
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) -> io::Result<()> {
    let signo = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to a child we have not reaped.
    let rc = unsafe { libc::kill(pid, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, signal: Signal) -> io::Result<()> {
    match signal {
        Signal::Terminate => child.kill(),
        Signal::Interrupt => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process interrupts need a unix platform",
        )),
    }
}
