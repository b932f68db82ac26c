//! Service spawning.
//!
//! Fork/exec of declared services with dependency gating and bounded
//! retry. Children are detached into their own session so a terminal
//! signal aimed at the supervisor is never broadcast to the whole
//! service set. Resource caps are applied before the record is
//! committed as running.

use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit::{AuditLog, Level};
use crate::cgroup::CgroupController;
use crate::config::ServiceDecl;
use crate::error::{Error, Result};
use crate::registry::{Registry, ServiceState};
use crate::resolver;
use crate::RETRY_BACKOFF;

/// Spawns services into the registry.
pub struct Spawner {
    cgroups: CgroupController,
    audit: Arc<AuditLog>,
    retry_backoff: Duration,
}

impl Spawner {
    pub fn new(cgroups: CgroupController, audit: Arc<AuditLog>) -> Self {
        Self {
            cgroups,
            audit,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    /// Override the delay between dependency retries.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Start one service.
    ///
    /// Checks dependencies, reserves a registry slot, spawns the command
    /// with no arguments, applies resource caps, then commits the record
    /// as running. Fork-level failures roll the reservation back; exec
    /// failures leave the record failed.
    pub fn start(&self, registry: &mut Registry, decl: &ServiceDecl) -> Result<u32> {
        if let Some(pid) = registry.lookup(&decl.command).and_then(|r| r.pid()) {
            info!(service = %decl.command, pid = pid, "service is already running");
            return Ok(pid);
        }

        if let Some(dep) = resolver::first_unmet(registry, &decl.dependencies) {
            warn!(service = %decl.command, dependency = %dep, "dependencies not satisfied");
            return Err(Error::DependenciesUnmet(decl.command.clone()));
        }

        if registry.lookup(&decl.command).is_none() {
            registry.insert(decl.clone())?;
        }
        registry.set_state(&decl.command, ServiceState::Starting)?;

        let mut command = Command::new(&decl.command);
        command.stdin(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                self.cgroups
                    .apply(pid, decl.memory_limit_bytes, decl.cpu_quota_percent);
                registry.set_state(&decl.command, ServiceState::Running(pid))?;

                info!(
                    service = %decl.command,
                    pid = pid,
                    runlevel = decl.runlevel,
                    "started service"
                );
                self.audit.emit(
                    Level::Info,
                    &format!(
                        "Started {} (pid {}) at runlevel {}",
                        decl.command, pid, decl.runlevel
                    ),
                );
                Ok(pid)
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                registry.set_state(&decl.command, ServiceState::Failed(e.to_string()))?;
                error!(service = %decl.command, error = %e, "exec failed");
                self.audit.emit(
                    Level::Error,
                    &format!("Failed to exec {}: {}", decl.command, e),
                );
                Err(Error::ExecFailed {
                    command: decl.command.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                // Release the reservation so a later attempt starts clean.
                registry.set_state(&decl.command, ServiceState::Stopped)?;
                error!(service = %decl.command, error = %e, "fork failed");
                self.audit.emit(
                    Level::Error,
                    &format!("Failed to fork for {}: {}", decl.command, e),
                );
                Err(Error::ForkFailed {
                    command: decl.command.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Start with bounded retries for unsatisfied dependencies.
    ///
    /// Only `DependenciesUnmet` is retried: it is the one failure that
    /// can become satisfiable by waiting. Each retry backs off for a
    /// fixed interval, so `max_retries` keeps event latency bounded.
    pub async fn start_with_retry(
        &self,
        registry: &mut Registry,
        decl: &ServiceDecl,
        max_retries: u32,
    ) -> Result<u32> {
        let mut attempt = 1;
        loop {
            match self.start(registry, decl) {
                Err(Error::DependenciesUnmet(command)) => {
                    if attempt >= max_retries {
                        error!(
                            service = %command,
                            attempts = attempt,
                            "giving up: dependencies still unsatisfied"
                        );
                        self.audit.emit(
                            Level::Error,
                            &format!(
                                "Giving up on {} after {} attempts: dependencies unsatisfied",
                                command, attempt
                            ),
                        );
                        return Err(Error::DependenciesUnmet(command));
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry_backoff).await;
                }
                other => return other,
            }
        }
    }
}
