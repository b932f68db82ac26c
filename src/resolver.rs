//! Dependency satisfaction checks.
//!
//! Dependencies are evaluated in declaration order against the registry.
//! There is no topological sort: the inittab is assumed to list
//! prerequisites before their dependents, so a dependency cycle shows up
//! as a service whose prerequisites never become satisfiable.

use crate::config::RestartPolicy;
use crate::registry::{Registry, ServiceState};

/// Whether every listed prerequisite is satisfied.
pub fn deps_satisfied(registry: &Registry, dependencies: &[String]) -> bool {
    first_unmet(registry, dependencies).is_none()
}

/// The first prerequisite, in declaration order, that is not satisfied.
pub fn first_unmet<'a>(registry: &Registry, dependencies: &'a [String]) -> Option<&'a str> {
    dependencies
        .iter()
        .find(|dep| !dep_satisfied(registry, dep))
        .map(String::as_str)
}

fn dep_satisfied(registry: &Registry, dep: &str) -> bool {
    let record = match registry.resolve(dep) {
        Some(record) => record,
        None => return false,
    };

    match &record.state {
        ServiceState::Running(_) => true,
        // A one-shot prerequisite that ran to a clean exit stays satisfied.
        ServiceState::Exited(0) => record.decl.restart_policy == RestartPolicy::Never,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDecl;

    fn decl(command: &str, deps: &[&str], policy: RestartPolicy) -> ServiceDecl {
        ServiceDecl {
            command: command.to_string(),
            runlevel: 3,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            memory_limit_bytes: 0,
            cpu_quota_percent: 0,
            restart_policy: policy,
        }
    }

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_no_dependencies_always_satisfied() {
        let registry = Registry::new(3);
        assert!(deps_satisfied(&registry, &[]));
    }

    #[test]
    fn test_unknown_dependency_unsatisfied() {
        let registry = Registry::new(3);
        assert_eq!(first_unmet(&registry, &deps(&["ghost"])), Some("ghost"));
    }

    #[test]
    fn test_running_dependency_satisfies() {
        let mut registry = Registry::new(3);
        registry
            .insert(decl("/usr/sbin/syslogd", &[], RestartPolicy::Always))
            .unwrap();
        registry
            .set_state("/usr/sbin/syslogd", ServiceState::Starting)
            .unwrap();
        registry
            .set_state("/usr/sbin/syslogd", ServiceState::Running(7))
            .unwrap();

        // Both the full command and the basename forms resolve.
        assert!(deps_satisfied(&registry, &deps(&["/usr/sbin/syslogd"])));
        assert!(deps_satisfied(&registry, &deps(&["syslogd"])));
    }

    #[test]
    fn test_stopped_dependency_unsatisfied() {
        let mut registry = Registry::new(3);
        registry
            .insert(decl("/bin/dep", &[], RestartPolicy::Always))
            .unwrap();

        assert_eq!(first_unmet(&registry, &deps(&["dep"])), Some("dep"));
    }

    #[test]
    fn test_oneshot_clean_exit_satisfies() {
        let mut registry = Registry::new(3);
        registry
            .insert(decl("/sbin/fsck", &[], RestartPolicy::Never))
            .unwrap();
        registry.set_state("/sbin/fsck", ServiceState::Starting).unwrap();
        registry.set_state("/sbin/fsck", ServiceState::Running(9)).unwrap();
        registry.set_state("/sbin/fsck", ServiceState::Exited(0)).unwrap();

        assert!(deps_satisfied(&registry, &deps(&["fsck"])));
    }

    #[test]
    fn test_respawning_exit_does_not_satisfy() {
        let mut registry = Registry::new(3);
        registry
            .insert(decl("/bin/daemon", &[], RestartPolicy::Always))
            .unwrap();
        registry.set_state("/bin/daemon", ServiceState::Starting).unwrap();
        registry.set_state("/bin/daemon", ServiceState::Running(9)).unwrap();
        registry.set_state("/bin/daemon", ServiceState::Exited(0)).unwrap();

        assert_eq!(first_unmet(&registry, &deps(&["daemon"])), Some("daemon"));
    }

    #[test]
    fn test_cycle_never_satisfied() {
        let mut registry = Registry::new(3);
        registry
            .insert(decl("/bin/a", &["b"], RestartPolicy::Always))
            .unwrap();
        registry
            .insert(decl("/bin/b", &["a"], RestartPolicy::Always))
            .unwrap();

        let a = registry.lookup("/bin/a").unwrap().decl.dependencies.clone();
        let b = registry.lookup("/bin/b").unwrap().decl.dependencies.clone();
        assert!(!deps_satisfied(&registry, &a));
        assert!(!deps_satisfied(&registry, &b));
    }

    #[test]
    fn test_first_unmet_respects_declaration_order() {
        let registry = Registry::new(3);
        assert_eq!(
            first_unmet(&registry, &deps(&["first", "second"])),
            Some("first")
        );
    }
}
