//! `InitSystem` backed by the `systemctl` CLI.

use super::{InitSystem, JobMode, UnitActiveState, UnitWrite};
use crate::errors::{VmletError, VmletResult};
use crate::runtime::SupervisorScope;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;

const SYSTEMCTL: &str = "systemctl";

/// Drives systemd through `systemctl`, in user or system scope.
///
/// Child processes are killed if the calling future is dropped, so callers
/// can cancel any operation by racing it against a cancellation token.
#[derive(Debug, Clone)]
pub struct SystemctlSupervisor {
    unit_dir: PathBuf,
    scope: SupervisorScope,
    program: PathBuf,
}

impl SystemctlSupervisor {
    pub fn new(unit_dir: impl Into<PathBuf>, scope: SupervisorScope) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            scope,
            program: PathBuf::from(SYSTEMCTL),
        }
    }

    /// Use a different `systemctl` binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(name)
    }

    /// Full argument list for one systemctl invocation.
    fn args<'a>(&self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 1);
        if self.scope == SupervisorScope::User {
            full.push("--user");
        }
        full.extend_from_slice(args);
        full
    }

    async fn systemctl(&self, unit: &str, operation: &str, args: &[&str]) -> VmletResult<Output> {
        let args = self.args(args);
        tracing::debug!(program = %self.program.display(), args = ?args, "Running systemctl");

        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VmletError::Supervisor {
                unit: unit.to_string(),
                operation: operation.to_string(),
                message: format!("failed to run {}: {}", self.program.display(), e),
            })
    }

    /// Run and require a zero exit status.
    async fn systemctl_ok(&self, unit: &str, operation: &str, args: &[&str]) -> VmletResult<()> {
        let output = self.systemctl(unit, operation, args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(VmletError::Supervisor {
            unit: unit.to_string(),
            operation: operation.to_string(),
            message: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[async_trait]
impl InitSystem for SystemctlSupervisor {
    async fn write_unit(&self, name: &str, contents: &[u8]) -> VmletResult<UnitWrite> {
        let descriptor_err = |message: String| VmletError::Descriptor {
            unit: name.to_string(),
            message,
        };

        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| {
                descriptor_err(format!(
                    "cannot create unit directory {}: {}",
                    self.unit_dir.display(),
                    e
                ))
            })?;

        let path = self.unit_path(name);
        let outcome = match tokio::fs::read(&path).await {
            Ok(existing) if existing == contents => return Ok(UnitWrite::Unchanged),
            Ok(_) => UnitWrite::Updated,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UnitWrite::Created,
            Err(e) => {
                return Err(descriptor_err(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        // Write beside the target and rename so systemd never reads a torn file
        let tmp = self.unit_dir.join(format!(".{}.tmp", name));
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| descriptor_err(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| descriptor_err(format!("cannot install {}: {}", path.display(), e)))?;

        Ok(outcome)
    }

    async fn reload(&self) -> VmletResult<()> {
        self.systemctl_ok("*", "daemon-reload", &["daemon-reload"])
            .await
    }

    async fn start_unit(&self, name: &str, mode: JobMode) -> VmletResult<()> {
        let job_mode = format!("--job-mode={}", mode);
        self.systemctl_ok(name, "start", &["start", "--no-block", &job_mode, name])
            .await
    }

    async fn stop_unit(&self, name: &str, mode: JobMode) -> VmletResult<()> {
        let job_mode = format!("--job-mode={}", mode);
        self.systemctl_ok(name, "stop", &["stop", "--no-block", &job_mode, name])
            .await
    }

    async fn unit_state(&self, name: &str) -> VmletResult<UnitActiveState> {
        // is-active exits non-zero for anything but "active"; stdout still has the state
        let output = self.systemctl(name, "is-active", &["is-active", name]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(VmletError::Supervisor {
                unit: name.to_string(),
                operation: "is-active".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(UnitActiveState::parse(&stdout))
    }
}
