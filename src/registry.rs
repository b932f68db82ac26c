//! In-memory service table and per-record state machine.
//!
//! The registry is the single source of truth for the process table.
//! Only the supervisor loop mutates it, so every invariant (unique
//! commands, unique live pids, legal transitions) holds between events.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::config::ServiceDecl;
use crate::error::{Error, Result};
use crate::MAX_PROCESSES;

/// Lifecycle state of one service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered but not running
    Stopped,
    /// Slot reserved between fork and the registry commit
    Starting,
    /// Alive with the given pid
    Running(u32),
    /// Kill issued, waiting for the reaper
    Stopping(u32),
    /// Reaped with the given exit code
    Exited(i32),
    /// Could not be started
    Failed(String),
}

impl ServiceState {
    /// The pid owned by this state, if any.
    pub fn pid(&self) -> Option<u32> {
        match self {
            ServiceState::Running(pid) | ServiceState::Stopping(pid) => Some(*pid),
            _ => None,
        }
    }

    /// Whether the state references a live process.
    pub fn is_live(&self) -> bool {
        matches!(self, ServiceState::Running(_) | ServiceState::Stopping(_))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running(pid) => write!(f, "running (pid {})", pid),
            ServiceState::Stopping(pid) => write!(f, "stopping (pid {})", pid),
            ServiceState::Exited(code) => write!(f, "exited (code {})", code),
            ServiceState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// A registered service: its declaration plus runtime state.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub decl: ServiceDecl,
    pub state: ServiceState,
    /// Set by an operator stop; suppresses the health-scan respawn
    pub held: bool,
}

impl ServiceRecord {
    fn new(decl: ServiceDecl) -> Self {
        Self {
            decl,
            state: ServiceState::Stopped,
            held: false,
        }
    }

    pub fn command(&self) -> &str {
        &self.decl.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.pid()
    }
}

/// Bounded table of services keyed by command, plus the current runlevel.
#[derive(Debug)]
pub struct Registry {
    services: HashMap<String, ServiceRecord>,
    current_runlevel: u8,
    capacity: usize,
}

impl Registry {
    /// Empty registry at the given runlevel with the default capacity.
    pub fn new(runlevel: u8) -> Self {
        Self::with_capacity(runlevel, MAX_PROCESSES)
    }

    /// Empty registry with an explicit capacity bound.
    pub fn with_capacity(runlevel: u8, capacity: usize) -> Self {
        Self {
            services: HashMap::new(),
            current_runlevel: runlevel,
            capacity,
        }
    }

    /// Register a declaration as a stopped record.
    pub fn insert(&mut self, decl: ServiceDecl) -> Result<()> {
        if self.services.len() >= self.capacity {
            return Err(Error::CapacityExceeded(self.capacity));
        }
        if self.services.contains_key(&decl.command) {
            return Err(Error::DuplicateService(decl.command));
        }
        self.services
            .insert(decl.command.clone(), ServiceRecord::new(decl));
        Ok(())
    }

    pub fn lookup(&self, command: &str) -> Option<&ServiceRecord> {
        self.services.get(command)
    }

    pub fn lookup_mut(&mut self, command: &str) -> Option<&mut ServiceRecord> {
        self.services.get_mut(command)
    }

    /// Resolve a service by full command or by executable basename, the
    /// form operators and dependency lists use.
    pub fn resolve(&self, name: &str) -> Option<&ServiceRecord> {
        if let Some(record) = self.services.get(name) {
            return Some(record);
        }
        self.services
            .values()
            .find(|record| Path::new(record.command()).file_name().and_then(|f| f.to_str()) == Some(name))
    }

    /// The command owning a live pid.
    pub fn by_pid(&self, pid: u32) -> Option<&str> {
        self.services
            .values()
            .find(|record| record.pid() == Some(pid))
            .map(|record| record.command())
    }

    /// Apply a state transition, enforcing the per-record state machine.
    ///
    /// Illegal transitions abort in test builds and surface as an error
    /// for the caller to log in production.
    pub fn set_state(&mut self, command: &str, new_state: ServiceState) -> Result<()> {
        let record = self
            .services
            .get_mut(command)
            .ok_or_else(|| Error::ServiceNotFound(command.to_string()))?;

        if !transition_allowed(&record.state, &new_state) {
            debug_assert!(
                false,
                "illegal transition for {}: {} -> {}",
                command, record.state, new_state
            );
            return Err(Error::IllegalTransition {
                service: command.to_string(),
                from: record.state.to_string(),
                to: new_state.to_string(),
            });
        }

        record.state = new_state;
        Ok(())
    }

    /// Mark every live record as stopping and return its (command, pid)
    /// pair. Used by runlevel switches and shutdown.
    pub fn drain_live(&mut self) -> Vec<(String, u32)> {
        let mut live = Vec::new();
        for record in self.services.values_mut() {
            if let ServiceState::Running(pid) = record.state {
                record.state = ServiceState::Stopping(pid);
                live.push((record.decl.command.clone(), pid));
            } else if let ServiceState::Stopping(pid) = record.state {
                live.push((record.decl.command.clone(), pid));
            }
        }
        live
    }

    pub fn remove(&mut self, command: &str) -> Option<ServiceRecord> {
        self.services.remove(command)
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }

    pub fn current_runlevel(&self) -> u8 {
        self.current_runlevel
    }

    /// Only the runlevel-switch transition may call this.
    pub(crate) fn set_current_runlevel(&mut self, runlevel: u8) {
        self.current_runlevel = runlevel;
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }

    pub fn commands(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// The legal transition matrix.
fn transition_allowed(from: &ServiceState, to: &ServiceState) -> bool {
    use ServiceState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Exited(_), Starting)
            | (Failed(_), Starting)
            | (Starting, Running(_))
            | (Starting, Failed(_))
            | (Starting, Stopped)
            | (Running(_), Stopping(_))
            | (Running(_), Exited(_))
            | (Stopping(_), Exited(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;

    fn decl(command: &str) -> ServiceDecl {
        ServiceDecl {
            command: command.to_string(),
            runlevel: 3,
            dependencies: Vec::new(),
            memory_limit_bytes: 0,
            cpu_quota_percent: 0,
            restart_policy: RestartPolicy::Always,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/bin/a")).unwrap();

        let record = registry.lookup("/bin/a").unwrap();
        assert_eq!(record.state, ServiceState::Stopped);
        assert!(!record.held);
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/bin/a")).unwrap();

        match registry.insert(decl("/bin/a")) {
            Err(Error::DuplicateService(name)) => assert_eq!(name, "/bin/a"),
            other => panic!("expected DuplicateService, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut registry = Registry::with_capacity(3, 2);
        registry.insert(decl("/bin/a")).unwrap();
        registry.insert(decl("/bin/b")).unwrap();

        match registry.insert(decl("/bin/c")) {
            Err(Error::CapacityExceeded(cap)) => assert_eq!(cap, 2),
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/bin/a")).unwrap();

        registry.set_state("/bin/a", ServiceState::Starting).unwrap();
        registry.set_state("/bin/a", ServiceState::Running(10)).unwrap();
        assert_eq!(registry.by_pid(10), Some("/bin/a"));

        registry.set_state("/bin/a", ServiceState::Exited(0)).unwrap();
        assert_eq!(registry.by_pid(10), None);

        // Restart path.
        registry.set_state("/bin/a", ServiceState::Starting).unwrap();
        registry.set_state("/bin/a", ServiceState::Running(11)).unwrap();
        assert_eq!(registry.by_pid(11), Some("/bin/a"));
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_aborts_in_test_builds() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/bin/a")).unwrap();
        let _ = registry.set_state("/bin/a", ServiceState::Exited(0));
    }

    #[test]
    fn test_drain_live_marks_stopping() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/bin/a")).unwrap();
        registry.insert(decl("/bin/b")).unwrap();
        registry.set_state("/bin/a", ServiceState::Starting).unwrap();
        registry.set_state("/bin/a", ServiceState::Running(20)).unwrap();

        let mut live = registry.drain_live();
        live.sort();
        assert_eq!(live, vec![("/bin/a".to_string(), 20)]);
        assert_eq!(
            registry.lookup("/bin/a").unwrap().state,
            ServiceState::Stopping(20)
        );
        assert_eq!(registry.lookup("/bin/b").unwrap().state, ServiceState::Stopped);
    }

    #[test]
    fn test_resolve_by_basename() {
        let mut registry = Registry::new(3);
        registry.insert(decl("/usr/sbin/syslogd")).unwrap();

        assert!(registry.resolve("/usr/sbin/syslogd").is_some());
        assert!(registry.resolve("syslogd").is_some());
        assert!(registry.resolve("sshd").is_none());
    }
}
