//! Error types for the init supervisor.

use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the supervisor.
///
/// None of these unwind across the event boundary: each event handler
/// catches and logs, and the supervisor exits only on an explicit
/// shutdown request.
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found in the registry
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Service already registered under the same command
    #[error("service already registered: {0}")]
    DuplicateService(String),

    /// Process table is full
    #[error("process table full ({0} services)")]
    CapacityExceeded(usize),

    /// Declared prerequisites are not running
    #[error("dependencies not satisfied for {0}")]
    DependenciesUnmet(String),

    /// Fork-level spawn failure
    #[error("failed to fork for {command}: {reason}")]
    ForkFailed { command: String, reason: String },

    /// The command could not be executed
    #[error("failed to exec {command}: {reason}")]
    ExecFailed { command: String, reason: String },

    /// A state change the per-record state machine forbids
    #[error("illegal state transition for {service}: {from} -> {to}")]
    IllegalTransition {
        service: String,
        from: String,
        to: String,
    },

    /// Runlevel outside the configured range
    #[error("invalid runlevel: {0}")]
    InvalidRunlevel(u8),

    /// Malformed inittab line
    #[error("malformed inittab line {line}: {reason}")]
    ConfigMalformed { line: usize, reason: String },

    /// No supervisor is listening on the control socket
    #[error("control socket unavailable at {0}")]
    ControlUnavailable(String),

    /// Control protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Nix error
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
}
