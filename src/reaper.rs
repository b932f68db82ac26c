//! Child-exit collection and registry retirement.
//!
//! The reaper translates child-exit notifications into state
//! transitions. It never restarts anything: restart policy is applied
//! centrally by the supervisor's health scan.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info};

use crate::audit::{AuditLog, Level};
use crate::registry::{Registry, ServiceState};

/// Termination status of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: u32,
    /// Exit code if the child exited normally
    pub code: Option<i32>,
    /// Signal number if the child was killed by a signal
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code recorded in the registry; signal deaths use the shell
    /// convention of 128 + signo.
    pub fn registry_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

/// Drain every ready child without blocking.
pub fn reap_pending() -> Vec<ExitStatus> {
    let mut reaped = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                reaped.push(ExitStatus {
                    pid: pid.as_raw() as u32,
                    code: Some(code),
                    signal: None,
                });
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                reaped.push(ExitStatus {
                    pid: pid.as_raw() as u32,
                    code: None,
                    signal: Some(signal as i32),
                });
            }
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "waitpid failed");
                break;
            }
        }
    }

    reaped
}

/// Apply a child exit to the registry.
///
/// Unknown pids are dropped silently: they belong to orphans the
/// supervisor inherited or to records already replaced.
pub fn handle_exit(registry: &mut Registry, audit: &AuditLog, status: &ExitStatus) {
    let command = match registry.by_pid(status.pid) {
        Some(command) => command.to_string(),
        None => {
            debug!(pid = status.pid, "reaped unknown child");
            return;
        }
    };

    let code = status.registry_code();
    match registry.set_state(&command, ServiceState::Exited(code)) {
        Ok(()) => {
            info!(service = %command, pid = status.pid, code = code, "service exited");
            audit.emit(
                Level::Info,
                &format!("{} (pid {}) exited with code {}", command, status.pid, code),
            );
        }
        Err(e) => {
            error!(service = %command, pid = status.pid, error = %e, "could not retire pid");
        }
    }
}
