//! Supervisor event types.
//!
//! Asynchronous sources (signal listeners, the health-tick interval, the
//! control socket) are producers only: they enqueue events on a bounded
//! FIFO channel that the supervisor loop drains. No producer ever
//! touches the registry.

use crate::control::ControlRequest;
use crate::reaper::ExitStatus;

/// One unit of work for the supervisor loop.
#[derive(Debug)]
pub enum Event {
    /// A child was reaped with the given status
    ChildExit(ExitStatus),
    /// Periodic restart scan
    HealthTick,
    /// Re-read the inittab and diff it against the registry
    Reload,
    /// Drain everything and exit
    Shutdown,
    /// Drain everything, then seed the new runlevel
    RunlevelSwitch(u8),
    /// Operator request to start a service
    ManageStart(String),
    /// Operator request to stop a service
    ManageStop(String),
    /// A control-socket request carrying its reply channel
    Control(ControlRequest),
}
