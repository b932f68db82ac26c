//! Runlevel-based init supervisor.
//!
//! This crate provides a small UNIX init supervisor: it launches the
//! services declared for a runlevel in `/etc/inittab`, monitors and
//! restarts them, enforces per-service resource caps through the cgroup
//! filesystem, and coordinates runlevel transitions and shutdown.
//!
//! # Architecture
//!
//! The supervisor is a single task that owns the service registry and
//! consumes a bounded FIFO event queue. Everything asynchronous — signal
//! listeners, the health-tick interval, control-socket connections — is
//! a producer that enqueues events and never touches the registry:
//!
//! - **[`registry::Registry`]**: the authoritative process table
//! - **[`spawn::Spawner`]**: dependency-gated fork/exec with bounded retry
//! - **[`reaper`]**: child-exit collection and retirement
//! - **[`supervisor::Supervisor`]**: the event loop that ties it together
//! - **[`control`]**: Unix-socket surface for the one-shot CLI commands
//!
//! # Example
//!
//! ```no_run
//! use initd::supervisor::{Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = Supervisor::new(SupervisorConfig::default());
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

pub mod audit;
pub mod cgroup;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod spawn;
pub mod supervisor;

pub use audit::{AuditLog, Level};
pub use config::{RestartPolicy, ServiceDecl};
pub use error::{Error, Result};
pub use event::Event;
pub use registry::{Registry, ServiceRecord, ServiceState};
pub use supervisor::{Supervisor, SupervisorConfig};

/// Registry capacity.
pub const MAX_PROCESSES: usize = 10;

/// Valid runlevels are `0..MAX_RUNLEVELS`.
pub const MAX_RUNLEVELS: u8 = 5;

/// Period between health scans.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Audit log rotation threshold.
pub const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Grace between SIGTERM and SIGKILL during stops and drains.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Fixed back-off between dependency retries.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry count for unsatisfied dependencies.
pub const MAX_START_RETRIES: u32 = 3;

/// Pending-event queue bound.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Default inittab path.
pub const CONFIG_FILE: &str = "/etc/inittab";

/// Default audit log path.
pub const LOG_FILE: &str = "/var/log/init.log";

/// Default control socket path.
pub const CONTROL_SOCKET: &str = "/run/init.ctl";

/// Cgroup filesystem root.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
