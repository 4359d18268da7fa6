//! Runtime configuration.
//!
//! Options come from three layers, later layers winning:
//! built-in defaults, an optional JSON options file, and CLI flags.
//! `VMLET_HOME` overrides the default home directory.

use crate::errors::{VmletError, VmletResult};
use crate::monitor::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const VMLET_HOME_ENV: &str = "VMLET_HOME";

/// Which systemd instance owns the VM units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorScope {
    /// Per-user manager (`systemctl --user`).
    #[default]
    User,
    /// System manager.
    System,
}

impl SupervisorScope {
    /// Default unit directory for this scope.
    pub fn default_unit_dir(self) -> PathBuf {
        match self {
            SupervisorScope::User => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("systemd")
                .join("user"),
            SupervisorScope::System => PathBuf::from("/etc/systemd/system"),
        }
    }
}

/// Control socket readiness settings, in milliseconds for the options file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOptions {
    pub grace_ms: u64,
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            grace_ms: policy.grace.as_millis() as u64,
            interval_ms: policy.interval.as_millis() as u64,
            max_attempts: policy.max_attempts,
            attempt_timeout_ms: policy.attempt_timeout.as_millis() as u64,
        }
    }
}

impl MonitorOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            grace: Duration::from_millis(self.grace_ms),
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

/// Options shared by every VM provisioned from this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmletOptions {
    /// Base directory; each VM gets `<home_dir>/<name>/`.
    pub home_dir: PathBuf,
    pub scope: SupervisorScope,
    /// Where unit files are written. Defaults per scope.
    pub unit_dir: Option<PathBuf>,
    pub qemu_binary: PathBuf,
    /// Template for the writable primary disk.
    pub backing_image: PathBuf,
    /// Template for the seed (cloud-init) image.
    pub seed_image: PathBuf,
    pub cpus: u32,
    pub memory_mb: u32,
    pub cpu_model: String,
    pub machine: String,
    pub monitor: MonitorOptions,
}

impl Default for VmletOptions {
    fn default() -> Self {
        let home_dir = std::env::var_os(VMLET_HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("vmlet")
            });

        Self {
            home_dir,
            scope: SupervisorScope::User,
            unit_dir: None,
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            backing_image: PathBuf::from("/var/lib/vmlet/images/base.qcow2"),
            seed_image: PathBuf::from("/var/lib/vmlet/images/seed.img"),
            cpus: 2,
            memory_mb: 2048,
            cpu_model: "host".to_string(),
            machine: "type=q35,accel=kvm".to_string(),
            monitor: MonitorOptions::default(),
        }
    }
}

impl VmletOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> VmletResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VmletError::Config(format!("cannot read options file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            VmletError::Config(format!("invalid options file {}: {}", path.display(), e))
        })
    }

    pub fn unit_dir(&self) -> PathBuf {
        self.unit_dir
            .clone()
            .unwrap_or_else(|| self.scope.default_unit_dir())
    }

    /// Reject options no VM could be built from.
    pub fn sanitize(&self) -> VmletResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(VmletError::Config(format!(
                "home_dir must be absolute: {}",
                self.home_dir.display()
            )));
        }
        // Unit files cannot carry these in a path-valued directive
        let home = self.home_dir.to_string_lossy();
        if home.contains(char::is_control) || home.ends_with(char::is_whitespace) {
            return Err(VmletError::Config(format!(
                "home_dir cannot be written to a unit file: {:?}",
                self.home_dir
            )));
        }
        if self.monitor.max_attempts == 0 {
            return Err(VmletError::Config(
                "monitor.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_options_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmlet.json");
        std::fs::write(
            &path,
            r#"{"home_dir": "/srv/vms", "cpus": 4, "scope": "system", "monitor": {"max_attempts": 5}}"#,
        )
        .unwrap();

        let options = VmletOptions::from_file(&path).unwrap();
        assert_eq!(options.home_dir, PathBuf::from("/srv/vms"));
        assert_eq!(options.cpus, 4);
        assert_eq!(options.memory_mb, 2048);
        assert_eq!(options.scope, SupervisorScope::System);
        assert_eq!(options.unit_dir(), PathBuf::from("/etc/systemd/system"));
        assert_eq!(options.monitor.max_attempts, 5);
        assert_eq!(options.monitor.interval_ms, 500);
    }

    #[test]
    fn test_invalid_options_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmlet.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = VmletOptions::from_file(&path).unwrap_err();
        assert!(matches!(err, VmletError::Config(_)));
    }

    #[test]
    fn test_sanitize_rejects_relative_home() {
        let options = VmletOptions {
            home_dir: PathBuf::from("vms"),
            ..VmletOptions::default()
        };
        assert!(options.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_home_unfit_for_unit_file() {
        for home in ["/srv/vms\nExecStartPre=/bin/true", "/srv/vms "] {
            let options = VmletOptions {
                home_dir: PathBuf::from(home),
                ..VmletOptions::default()
            };
            assert!(
                matches!(options.sanitize(), Err(VmletError::Config(_))),
                "{home:?} accepted"
            );
        }
    }
}
