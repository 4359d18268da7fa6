//! Host process supervisor (init system) interface.
//!
//! The orchestrator only needs to persist a unit, make the supervisor reload
//! its configuration, and ask for the unit to be started. Stopping and state
//! queries back the `stop`/`status` CLI commands.
//!
//! `start_unit` returns once the supervisor has accepted the start job, not
//! once the VM process is ready; readiness is the monitor client's concern.

mod systemctl;

pub use systemctl::SystemctlSupervisor;

use crate::errors::{VmletError, VmletResult};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// How a new job interacts with queued jobs for the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobMode {
    /// Supersede any conflicting pending job.
    #[default]
    Replace,
    /// Fail if a conflicting job is queued.
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Replace => "replace",
            JobMode::Fail => "fail",
            JobMode::Isolate => "isolate",
            JobMode::IgnoreDependencies => "ignore-dependencies",
            JobMode::IgnoreRequirements => "ignore-requirements",
        }
    }
}

impl FromStr for JobMode {
    type Err = VmletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(JobMode::Replace),
            "fail" => Ok(JobMode::Fail),
            "isolate" => Ok(JobMode::Isolate),
            "ignore-dependencies" => Ok(JobMode::IgnoreDependencies),
            "ignore-requirements" => Ok(JobMode::IgnoreRequirements),
            other => Err(VmletError::Config(format!("unknown job mode: {}", other))),
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of persisting a unit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitWrite {
    Created,
    Updated,
    /// Existing file already had identical contents.
    Unchanged,
}

/// Unit activity as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitActiveState {
    Active,
    Reloading,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Other(String),
}

impl UnitActiveState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => UnitActiveState::Active,
            "reloading" => UnitActiveState::Reloading,
            "inactive" => UnitActiveState::Inactive,
            "failed" => UnitActiveState::Failed,
            "activating" => UnitActiveState::Activating,
            "deactivating" => UnitActiveState::Deactivating,
            other => UnitActiveState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for UnitActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitActiveState::Active => "active",
            UnitActiveState::Reloading => "reloading",
            UnitActiveState::Inactive => "inactive",
            UnitActiveState::Failed => "failed",
            UnitActiveState::Activating => "activating",
            UnitActiveState::Deactivating => "deactivating",
            UnitActiveState::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Operations the orchestrator needs from the init system.
///
/// `name` is always the full unit name (e.g. `vm3.service`). Failures are
/// fatal to the current run; implementations do not retry.
#[async_trait]
pub trait InitSystem: Send + Sync {
    /// Persist the unit file, overwriting any existing one.
    async fn write_unit(&self, name: &str, contents: &[u8]) -> VmletResult<UnitWrite>;

    /// Make the supervisor pick up new or changed unit files.
    async fn reload(&self) -> VmletResult<()>;

    /// Enqueue a start job. Returns once the job is accepted.
    async fn start_unit(&self, name: &str, mode: JobMode) -> VmletResult<()>;

    async fn stop_unit(&self, name: &str, mode: JobMode) -> VmletResult<()>;

    async fn unit_state(&self, name: &str) -> VmletResult<UnitActiveState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_active_state() {
        assert_eq!(UnitActiveState::parse("active\n"), UnitActiveState::Active);
        assert_eq!(UnitActiveState::parse("failed"), UnitActiveState::Failed);
        assert_eq!(
            UnitActiveState::parse("maintenance"),
            UnitActiveState::Other("maintenance".into())
        );
    }

    #[test]
    fn test_job_mode_default_is_replace() {
        assert_eq!(JobMode::default().as_str(), "replace");
    }

    #[test]
    fn test_job_mode_parses_its_own_names() {
        for mode in [
            JobMode::Replace,
            JobMode::Fail,
            JobMode::Isolate,
            JobMode::IgnoreDependencies,
            JobMode::IgnoreRequirements,
        ] {
            assert_eq!(mode.as_str().parse::<JobMode>().unwrap(), mode);
        }
        assert!("sideways".parse::<JobMode>().is_err());
    }
}
