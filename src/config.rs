//! Inittab configuration loader.
//!
//! Parses the line-oriented inittab schema into service declarations:
//!
//! ```text
//! <runlevel> <command> <deps,comma-list|-> <mem_bytes> <cpu_pct> [respawn|once]
//! ```
//!
//! Lines starting with `#` and blank lines are ignored; malformed lines
//! are skipped with a warning. The loader never touches the registry:
//! the supervisor decides what to install.

use std::path::Path;
use tracing::warn;

use crate::error::Result;
use crate::MAX_RUNLEVELS;

/// What to do with a service that is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Respawn whenever the health scan finds it down
    #[default]
    Always,
    /// Run once; a clean exit is final
    Never,
}

/// One parsed inittab entry. Services are identified by `command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDecl {
    /// Absolute path of the executable, also the identity key
    pub command: String,
    /// Runlevel at which the service should be active
    pub runlevel: u8,
    /// Commands that must be running before this service may start
    pub dependencies: Vec<String>,
    /// Memory cap in bytes, 0 for uncapped
    pub memory_limit_bytes: u64,
    /// CPU quota as a percentage, 0 for uncapped
    pub cpu_quota_percent: u8,
    /// Fixed at declaration time
    pub restart_policy: RestartPolicy,
}

/// Load and parse an inittab file.
pub fn load_inittab(path: &Path) -> Result<Vec<ServiceDecl>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_inittab(&content))
}

/// Parse inittab content, skipping malformed lines with a warning.
pub fn parse_inittab(content: &str) -> Vec<ServiceDecl> {
    let mut decls = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Ok(decl) => decls.push(decl),
            Err(reason) => {
                warn!(line = index + 1, reason = %reason, "skipping malformed inittab line");
            }
        }
    }

    decls
}

fn parse_line(line: &str) -> std::result::Result<ServiceDecl, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(format!("expected at least 5 fields, got {}", fields.len()));
    }
    if fields.len() > 6 {
        return Err(format!("unexpected trailing fields after {:?}", fields[5]));
    }

    let runlevel: u8 = fields[0]
        .parse()
        .map_err(|_| format!("invalid runlevel {:?}", fields[0]))?;
    if runlevel >= MAX_RUNLEVELS {
        return Err(format!(
            "runlevel {} outside 0..{}",
            runlevel, MAX_RUNLEVELS
        ));
    }

    let command = fields[1];
    if !command.starts_with('/') {
        return Err(format!("command must be an absolute path: {:?}", command));
    }

    let dependencies = if fields[2] == "-" {
        Vec::new()
    } else {
        fields[2]
            .split(',')
            .filter(|dep| !dep.is_empty())
            .map(str::to_string)
            .collect()
    };

    let memory_limit_bytes: u64 = fields[3]
        .parse()
        .map_err(|_| format!("invalid memory limit {:?}", fields[3]))?;

    let cpu_quota_percent: u8 = fields[4]
        .parse()
        .map_err(|_| format!("invalid cpu quota {:?}", fields[4]))?;
    if cpu_quota_percent > 100 {
        return Err(format!("cpu quota {}% outside 0..=100", cpu_quota_percent));
    }

    let restart_policy = match fields.get(5) {
        None => RestartPolicy::default(),
        Some(&"respawn") => RestartPolicy::Always,
        Some(&"once") => RestartPolicy::Never,
        Some(other) => return Err(format!("unknown restart policy {:?}", other)),
    };

    Ok(ServiceDecl {
        command: command.to_string(),
        runlevel,
        dependencies,
        memory_limit_bytes,
        cpu_quota_percent,
        restart_policy,
    })
}
