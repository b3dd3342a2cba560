//! Spawning and terminating server processes.
//!
//! Each spawned child is owned by a monitor task that waits on it and
//! publishes the exit on a watch channel. Everything else talks to the
//! process through a [`ProcessHandle`].

use crate::core::config::ServerSpec;
use crate::mcp::ChildIo;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub detail: String,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

pub type ExitWatch = watch::Receiver<Option<ExitOutcome>>;

pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub io: ChildIo,
}

pub struct ProcessHandle {
    pid: Option<u32>,
    exit: ExitWatch,
    kill: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
}

/// Spawns `spec` with piped stdio. The child inherits the process
/// environment, then `file_env`, then `spec.env`, later entries winning.
pub fn spawn(spec: &ServerSpec, file_env: &BTreeMap<String, String>) -> io::Result<SpawnedProcess> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(file_env)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    // Own process group so signals reach wrapper scripts' children too.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("Unable to retrieve stdin."))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("Unable to retrieve stdout."))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("Unable to retrieve stderr."))?;

    let pid = child.id();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let server = spec.name.clone();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                force_kill_group(pid);
                if let Err(err) = child.start_kill() {
                    debug!(server = %server, error = %err, "Kill failed; process may have exited");
                }
                child.wait().await
            }
        };
        // The leader is gone; take down anything it left in its group.
        force_kill_group(pid);
        let outcome = match status {
            Ok(status) => ExitOutcome {
                code: status.code(),
                detail: status.to_string(),
            },
            Err(err) => ExitOutcome {
                code: None,
                detail: format!("wait failed: {err}"),
            },
        };
        debug!(server = %server, pid = ?pid, outcome = %outcome, "Server process exited");
        let _ = exit_tx.send(Some(outcome));
    });

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            pid,
            exit: exit_rx,
            kill: Some(kill_tx),
            stop_requested: Arc::new(AtomicBool::new(false)),
        },
        io: ChildIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        },
    })
}

/// Resolves once the process has exited. `None` only if the monitor task
/// went away without reporting.
pub async fn wait_exit(exit: &mut ExitWatch) -> Option<ExitOutcome> {
    exit.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|outcome| outcome.clone())
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    /// Asks the process to stop, then kills it if it is still alive after
    /// `grace`. Marks the exit as requested before signalling.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitOutcome> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(outcome) = self.exit.borrow().clone() {
            return Some(outcome);
        }

        let mut exit = self.exit.clone();
        if request_graceful_stop(self.pid) {
            if let Ok(outcome) = tokio::time::timeout(grace, wait_exit(&mut exit)).await {
                return outcome;
            }
            warn!(
                pid = ?self.pid,
                grace_ms = grace.as_millis(),
                "Process ignored termination request; killing"
            );
        }

        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        wait_exit(&mut exit).await
    }
}

#[cfg(unix)]
fn request_graceful_stop(pid: Option<u32>) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, error = %err, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(_pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn force_kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill_group(_pid: Option<u32>) {}
