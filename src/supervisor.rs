//! Supervisor core: the single task that owns the service registry.
//!
//! All registry mutations happen here. Signal listeners, the health-tick
//! interval and the control socket are producers that enqueue events;
//! the loop drains them in FIFO order, so a child exit delivered before
//! a health tick is always applied first and a restart can never race a
//! stale running state. Events that arrive while a drain is in progress
//! are deferred and replayed afterwards in their original order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, Level};
use crate::cgroup::CgroupController;
use crate::config::{self, ServiceDecl};
use crate::control::{ControlCommand, ControlRequest, ControlResponse, ControlServer};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::reaper::{self, ExitStatus};
use crate::registry::{Registry, ServiceState};
use crate::spawn::Spawner;
use crate::{
    CGROUP_ROOT, CONFIG_FILE, CONTROL_SOCKET, EVENT_QUEUE_CAPACITY, HEALTH_CHECK_INTERVAL,
    LOG_FILE, MAX_LOG_SIZE, MAX_PROCESSES, MAX_RUNLEVELS, MAX_START_RETRIES, RETRY_BACKOFF,
    STOP_GRACE_PERIOD,
};

/// Tunable supervisor parameters. The defaults are the production
/// constants; tests shrink the timing knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Inittab path
    pub inittab: PathBuf,
    /// Audit log path
    pub audit_log: PathBuf,
    /// Control socket path
    pub control_socket: PathBuf,
    /// Cgroup filesystem root
    pub cgroup_root: PathBuf,
    /// Initial runlevel
    pub runlevel: u8,
    /// Registry capacity
    pub max_processes: usize,
    /// Audit log rotation threshold
    pub max_log_size: u64,
    /// Period between health scans
    pub health_interval: Duration,
    /// SIGTERM to SIGKILL grace during stops and drains
    pub stop_grace: Duration,
    /// Delay between dependency retries
    pub retry_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            inittab: PathBuf::from(CONFIG_FILE),
            audit_log: PathBuf::from(LOG_FILE),
            control_socket: PathBuf::from(CONTROL_SOCKET),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            runlevel: 0,
            max_processes: MAX_PROCESSES,
            max_log_size: MAX_LOG_SIZE,
            health_interval: HEALTH_CHECK_INTERVAL,
            stop_grace: STOP_GRACE_PERIOD,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

/// The supervisor: registry owner and event consumer.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Registry,
    spawner: Spawner,
    audit: Arc<AuditLog>,
    events: mpsc::Receiver<Event>,
    handle: mpsc::Sender<Event>,
    /// Events that arrived while a drain was consuming the queue
    deferred: VecDeque<Event>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let audit = Arc::new(AuditLog::with_max_size(
            &config.audit_log,
            config.max_log_size,
        ));
        let registry = Registry::with_capacity(config.runlevel, config.max_processes);
        let spawner = Spawner::new(
            CgroupController::with_root(&config.cgroup_root),
            Arc::clone(&audit),
        )
        .with_backoff(config.retry_backoff);
        let (handle, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Self {
            config,
            registry,
            spawner,
            audit,
            events,
            handle,
            deferred: VecDeque::new(),
        }
    }

    /// Sender half of the event queue, for producers and tests.
    pub fn handle(&self) -> mpsc::Sender<Event> {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run as the supervisor: seed the initial runlevel, install the
    /// producers, then dispatch events until shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(runlevel = self.config.runlevel, "init starting");
        self.audit.emit(
            Level::Info,
            &format!("Starting init at runlevel {}", self.config.runlevel),
        );

        self.install_signal_producers()?;
        self.install_tick_producer();
        self.install_control_server();

        self.seed().await;
        self.event_loop().await;

        info!("init exiting");
        self.audit
            .emit(Level::Info, "All services terminated, exiting");
        Ok(())
    }

    fn install_signal_producers(&self) -> Result<()> {
        let tx = self.handle.clone();
        let mut sigchld = signal(SignalKind::child())?;
        tokio::spawn(async move {
            while sigchld.recv().await.is_some() {
                for status in reaper::reap_pending() {
                    if tx.send(Event::ChildExit(status)).await.is_err() {
                        return;
                    }
                }
            }
        });

        let tx = self.handle.clone();
        let mut sighup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                if tx.send(Event::Reload).await.is_err() {
                    return;
                }
            }
        });

        let tx = self.handle.clone();
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                if tx.send(Event::Shutdown).await.is_err() {
                    return;
                }
            }
        });

        // Everything else is ignored; installing a handler keeps the
        // default disposition from killing the supervisor.
        for kind in [SignalKind::interrupt(), SignalKind::quit()] {
            let mut stream = signal(kind)?;
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!("ignoring signal");
                }
            });
        }

        Ok(())
    }

    fn install_tick_producer(&self) {
        let tx = self.handle.clone();
        let period = self.config.health_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the scan starts one
            // full period after boot.
            tick.tick().await;
            loop {
                tick.tick().await;
                if tx.send(Event::HealthTick).await.is_err() {
                    return;
                }
            }
        });
    }

    fn install_control_server(&self) {
        match ControlServer::bind(&self.config.control_socket) {
            Ok(server) => {
                let tx = self.handle.clone();
                tokio::spawn(server.serve(tx));
            }
            Err(e) => {
                warn!(
                    path = %self.config.control_socket.display(),
                    error = %e,
                    "control socket unavailable, operator commands disabled"
                );
            }
        }
    }

    /// Install and start every declaration for the current runlevel.
    pub async fn seed(&mut self) {
        let decls = match config::load_inittab(&self.config.inittab) {
            Ok(decls) => decls,
            Err(e) => {
                error!(path = %self.config.inittab.display(), error = %e, "could not read inittab");
                self.audit
                    .emit(Level::Error, "Could not open configuration file");
                return;
            }
        };
        self.install_and_start(decls).await;
    }

    async fn install_and_start(&mut self, decls: Vec<ServiceDecl>) {
        let level = self.registry.current_runlevel();
        let mut to_start = Vec::new();

        for decl in decls {
            if decl.runlevel != level {
                continue;
            }
            match self.registry.insert(decl.clone()) {
                Ok(()) => to_start.push(decl),
                Err(e @ Error::CapacityExceeded(_)) => {
                    error!(service = %decl.command, error = %e, "cannot register service");
                    self.audit.emit(
                        Level::Error,
                        &format!("Cannot register {}: {}", decl.command, e),
                    );
                }
                Err(e) => {
                    warn!(service = %decl.command, error = %e, "skipping declaration");
                }
            }
        }

        for decl in to_start {
            let _ = self
                .spawner
                .start_with_retry(&mut self.registry, &decl, MAX_START_RETRIES)
                .await;
        }
    }

    /// Dispatch events until shutdown or queue closure.
    async fn event_loop(&mut self) {
        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => match self.events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.dispatch(event).await {
                break;
            }
        }
    }

    /// Handle one event. Returns true when the supervisor should exit.
    pub async fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::ChildExit(status) => {
                reaper::handle_exit(&mut self.registry, &self.audit, &status);
                false
            }
            Event::HealthTick => {
                self.health_scan().await;
                false
            }
            Event::Reload => {
                self.reload().await;
                false
            }
            Event::RunlevelSwitch(level) => {
                let _ = self.switch_runlevel(level).await;
                false
            }
            Event::ManageStart(name) => {
                let _ = self.manage_start(&name).await;
                false
            }
            Event::ManageStop(name) => {
                let _ = self.manage_stop(&name).await;
                false
            }
            Event::Shutdown => {
                self.shutdown().await;
                true
            }
            Event::Control(request) => {
                self.handle_control(request).await;
                false
            }
        }
    }

    /// Restart scan: respawn every matching record that is down and not
    /// held, respecting the restart policy.
    async fn health_scan(&mut self) {
        let level = self.registry.current_runlevel();
        let candidates: Vec<ServiceDecl> = self
            .registry
            .iter()
            .filter(|record| {
                record.decl.runlevel == level
                    && record.decl.restart_policy == crate::config::RestartPolicy::Always
                    && !record.held
                    && !record.state.is_live()
                    && record.state != ServiceState::Starting
            })
            .map(|record| record.decl.clone())
            .collect();

        for decl in candidates {
            info!(service = %decl.command, "restarting service");
            self.audit
                .emit(Level::Info, &format!("Restarting {}", decl.command));
            let _ = self
                .spawner
                .start_with_retry(&mut self.registry, &decl, MAX_START_RETRIES)
                .await;
        }
    }

    /// Re-read the inittab and reconcile the registry with it: remove
    /// services no longer declared, install new ones, refresh attributes
    /// of survivors. A running pid with an unchanged declaration is left
    /// alone, so an unchanged config is a no-op.
    async fn reload(&mut self) {
        info!(path = %self.config.inittab.display(), "reloading configuration");
        self.audit.emit(Level::Info, "Reloading configuration");

        let decls = match config::load_inittab(&self.config.inittab) {
            Ok(decls) => decls,
            Err(e) => {
                error!(path = %self.config.inittab.display(), error = %e, "reload failed");
                self.audit
                    .emit(Level::Error, "Could not open configuration file");
                return;
            }
        };

        let level = self.registry.current_runlevel();
        let wanted: Vec<ServiceDecl> = decls
            .into_iter()
            .filter(|decl| decl.runlevel == level)
            .collect();
        let wanted_commands: HashSet<&str> =
            wanted.iter().map(|decl| decl.command.as_str()).collect();

        // Stop and remove services that disappeared from the config.
        let stale: Vec<String> = self
            .registry
            .commands()
            .into_iter()
            .filter(|command| !wanted_commands.contains(command.as_str()))
            .collect();
        for command in stale {
            if let Some(pid) = self.registry.lookup(&command).and_then(|r| r.pid()) {
                let _ = self
                    .registry
                    .set_state(&command, ServiceState::Stopping(pid));
                self.terminate_and_wait(vec![(command.clone(), pid)]).await;
            }
            self.registry.remove(&command);
            info!(service = %command, "removed service");
            self.audit
                .emit(Level::Info, &format!("Removed {}", command));
        }

        // Install new declarations; refresh attributes of survivors.
        let mut fresh = Vec::new();
        for decl in wanted {
            if let Some(record) = self.registry.lookup_mut(&decl.command) {
                if record.decl != decl {
                    info!(service = %decl.command, "updated service attributes");
                    record.decl = decl;
                }
                continue;
            }
            match self.registry.insert(decl.clone()) {
                Ok(()) => fresh.push(decl),
                Err(e) => {
                    error!(service = %decl.command, error = %e, "cannot register service");
                    self.audit.emit(
                        Level::Error,
                        &format!("Cannot register {}: {}", decl.command, e),
                    );
                }
            }
        }
        for decl in fresh {
            let _ = self
                .spawner
                .start_with_retry(&mut self.registry, &decl, MAX_START_RETRIES)
                .await;
        }
    }

    /// Drain every live service, clear the registry, then seed the new
    /// runlevel from the config.
    pub async fn switch_runlevel(&mut self, level: u8) -> Result<()> {
        if level >= MAX_RUNLEVELS {
            warn!(runlevel = level, "ignoring switch to invalid runlevel");
            self.audit
                .emit(Level::Warn, &format!("Invalid runlevel {}", level));
            return Err(Error::InvalidRunlevel(level));
        }

        let from = self.registry.current_runlevel();
        info!(from = from, to = level, "switching runlevel");
        self.audit.emit(
            Level::Info,
            &format!("Switching from runlevel {} to {}", from, level),
        );

        self.drain_all().await;
        self.registry.clear();
        self.registry.set_current_runlevel(level);
        self.seed().await;
        Ok(())
    }

    /// Stop everything and leave the loop.
    async fn shutdown(&mut self) {
        info!("shutting down");
        self.audit.emit(Level::Info, "Shutting down init");

        // Discard queued work that would start services we are about to
        // stop; child exits are still applied.
        let mut deferred = std::mem::take(&mut self.deferred);
        while let Ok(event) = self.events.try_recv() {
            deferred.push_back(event);
        }
        for event in deferred {
            match event {
                Event::ChildExit(status) => {
                    reaper::handle_exit(&mut self.registry, &self.audit, &status);
                }
                Event::Control(request) => {
                    let _ = request.reply.send(ControlResponse::Error {
                        message: "supervisor is shutting down".to_string(),
                    });
                }
                _ => {}
            }
        }

        self.drain_all().await;

        // Flush filesystem buffers before the process goes away.
        unsafe {
            libc::sync();
        }
    }

    /// Operator start: clear any hold, then start with retries.
    pub async fn manage_start(&mut self, name: &str) -> Result<u32> {
        let record = self
            .registry
            .resolve(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        let decl = record.decl.clone();

        if let Some(record) = self.registry.lookup_mut(&decl.command) {
            record.held = false;
        }

        self.spawner
            .start_with_retry(&mut self.registry, &decl, MAX_START_RETRIES)
            .await
    }

    /// Operator stop: hold the service so the health scan does not
    /// respawn it, then terminate the process if one is running.
    pub async fn manage_stop(&mut self, name: &str) -> Result<()> {
        let record = self
            .registry
            .resolve(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        let command = record.command().to_string();
        let pid = record.pid();

        if let Some(record) = self.registry.lookup_mut(&command) {
            record.held = true;
        }

        let Some(pid) = pid else {
            info!(service = %command, "service is not running");
            return Ok(());
        };

        info!(service = %command, pid = pid, "stopping service");
        self.audit
            .emit(Level::Info, &format!("Stopping {} (pid {})", command, pid));
        self.registry
            .set_state(&command, ServiceState::Stopping(pid))?;
        self.terminate_and_wait(vec![(command, pid)]).await;
        Ok(())
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        let ControlRequest { command, reply } = request;

        let response = match command {
            ControlCommand::Ping => ControlResponse::Pong,
            ControlCommand::SwitchRunlevel { level } => {
                match self.switch_runlevel(level).await {
                    Ok(()) => ControlResponse::Ok {
                        message: format!("switched to runlevel {}", level),
                    },
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            ControlCommand::StartService { name } => match self.manage_start(&name).await {
                Ok(pid) => ControlResponse::Ok {
                    message: format!("started {} (pid {})", name, pid),
                },
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            },
            ControlCommand::StopService { name } => match self.manage_stop(&name).await {
                Ok(()) => ControlResponse::Ok {
                    message: format!("stopped {}", name),
                },
                Err(e) => ControlResponse::Error {
                    message: e.to_string(),
                },
            },
            ControlCommand::ServiceStatus { name } => match self.registry.resolve(&name) {
                Some(record) => ControlResponse::Status {
                    name,
                    state: if matches!(record.state, ServiceState::Running(_)) {
                        "running".to_string()
                    } else {
                        "stopped".to_string()
                    },
                    pid: record.pid(),
                },
                None => ControlResponse::Error {
                    message: format!("not found: {}", name),
                },
            },
        };

        if reply.send(response).is_err() {
            debug!("control client went away before the reply");
        }
    }

    /// Drain every live record: SIGTERM, wait out the grace period, then
    /// SIGKILL the survivors.
    async fn drain_all(&mut self) {
        let targets = self.registry.drain_live();
        self.terminate_and_wait(targets).await;
    }

    /// Terminate the given (command, pid) pairs and wait for the reaper.
    ///
    /// Exits are consumed from the event queue so the registry stays
    /// consistent; any other event arriving mid-drain is deferred and
    /// replayed by the main loop afterwards. Children that outlive the
    /// grace period are killed and reaped directly.
    async fn terminate_and_wait(&mut self, targets: Vec<(String, u32)>) {
        if targets.is_empty() {
            return;
        }

        for (command, pid) in &targets {
            match kill(Pid::from_raw(*pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(service = %command, pid = pid, "sent SIGTERM"),
                Err(e) => debug!(service = %command, pid = pid, error = %e, "SIGTERM failed"),
            }
        }

        let mut pending: HashMap<u32, String> =
            targets.into_iter().map(|(command, pid)| (pid, command)).collect();
        let deadline = Instant::now() + self.config.stop_grace;

        while !pending.is_empty() {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(Event::ChildExit(status))) => {
                    pending.remove(&status.pid);
                    reaper::handle_exit(&mut self.registry, &self.audit, &status);
                }
                Ok(Some(other)) => self.deferred.push_back(other),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        for (pid, command) in pending {
            // The exit may have been reaped by the signal producer while
            // we were waiting; a direct poll settles it either way.
            if let Some(status) = poll_exit(pid, Duration::from_millis(200)).await {
                reaper::handle_exit(&mut self.registry, &self.audit, &status);
                continue;
            }

            warn!(service = %command, pid = pid, "grace period expired, sending SIGKILL");
            self.audit.emit(
                Level::Warn,
                &format!("{} (pid {}) ignored SIGTERM, killing", command, pid),
            );
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);

            match poll_exit(pid, Duration::from_secs(2)).await {
                Some(status) => reaper::handle_exit(&mut self.registry, &self.audit, &status),
                None => error!(service = %command, pid = pid, "pid survived SIGKILL"),
            }
        }
    }
}

/// Poll for a specific child's exit without blocking the runtime.
///
/// `ECHILD` counts as reaped: it means another waiter (the signal
/// producer) already collected the status, and the queued exit event
/// will be dropped as unknown once the record is retired.
async fn poll_exit(pid: u32, limit: Duration) -> Option<ExitStatus> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    let deadline = Instant::now() + limit;
    loop {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Some(ExitStatus {
                    pid,
                    code: Some(code),
                    signal: None,
                })
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Some(ExitStatus {
                    pid,
                    code: None,
                    signal: Some(signal as i32),
                })
            }
            Err(nix::Error::ECHILD) => {
                return Some(ExitStatus {
                    pid,
                    code: None,
                    signal: None,
                })
            }
            Ok(_) => {}
            Err(e) => {
                debug!(pid = pid, error = %e, "waitpid failed");
                return None;
            }
        }

        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
