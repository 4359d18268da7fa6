//! Shared state for one provisioning run.

use crate::disk::StagedDisk;
use crate::errors::VmletResult;
use crate::monitor::{MonitorConnection, RetryPolicy};
use crate::supervisor::{InitSystem, JobMode, UnitWrite};
use crate::vmm::{VmLifecycle, VmPhase, VmSpec};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Which template a disk copy materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    /// Writable qcow2 disk copied from the backing image.
    Primary,
    /// Raw cloud-init seed image.
    Seed,
}

/// Inputs, outputs and lifecycle of one run, shared by all tasks.
pub struct ProvisionContext {
    pub spec: VmSpec,
    pub run_id: Ulid,
    pub supervisor: Arc<dyn InitSystem>,
    pub retry: RetryPolicy,
    pub job_mode: JobMode,
    pub cancel: CancellationToken,
    pub lifecycle: VmLifecycle,
    pub primary_disk: Option<StagedDisk>,
    pub seed_disk: Option<StagedDisk>,
    pub unit_write: Option<UnitWrite>,
    pub connection: Option<MonitorConnection>,
    /// Reply to `query-status` right after the handshake.
    pub vm_status: Option<Value>,
}

impl ProvisionContext {
    pub fn new(
        spec: VmSpec,
        supervisor: Arc<dyn InitSystem>,
        retry: RetryPolicy,
        job_mode: JobMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            run_id: Ulid::new(),
            supervisor,
            retry,
            job_mode,
            cancel,
            lifecycle: VmLifecycle::new(),
            primary_disk: None,
            seed_disk: None,
            unit_write: None,
            connection: None,
            vm_status: None,
        }
    }

    /// Record a staged disk; enter `Staged` once both are present.
    pub fn set_disk(&mut self, role: DiskRole, disk: StagedDisk) -> VmletResult<()> {
        match role {
            DiskRole::Primary => self.primary_disk = Some(disk),
            DiskRole::Seed => self.seed_disk = Some(disk),
        }
        if self.primary_disk.is_some() && self.seed_disk.is_some() {
            self.lifecycle.advance(VmPhase::Staged)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskFormat;
    use crate::errors::VmletError;
    use crate::runtime::VmletOptions;
    use crate::supervisor::UnitActiveState;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Unreachable;

    #[async_trait]
    impl InitSystem for Unreachable {
        async fn write_unit(&self, _: &str, _: &[u8]) -> VmletResult<UnitWrite> {
            Err(VmletError::Internal("unused".into()))
        }
        async fn reload(&self) -> VmletResult<()> {
            Err(VmletError::Internal("unused".into()))
        }
        async fn start_unit(&self, _: &str, _: JobMode) -> VmletResult<()> {
            Err(VmletError::Internal("unused".into()))
        }
        async fn stop_unit(&self, _: &str, _: JobMode) -> VmletResult<()> {
            Err(VmletError::Internal("unused".into()))
        }
        async fn unit_state(&self, _: &str) -> VmletResult<UnitActiveState> {
            Err(VmletError::Internal("unused".into()))
        }
    }

    fn disk(path: &str, format: DiskFormat) -> StagedDisk {
        StagedDisk {
            path: PathBuf::from(path),
            format,
            size_bytes: 1,
        }
    }

    #[test]
    fn test_staged_only_after_both_disks() {
        let options = VmletOptions {
            home_dir: PathBuf::from("/srv/vmlet"),
            ..VmletOptions::default()
        };
        let mut ctx = ProvisionContext::new(
            VmSpec::new("vm3", &options).unwrap(),
            Arc::new(Unreachable),
            RetryPolicy::default(),
            JobMode::Replace,
            CancellationToken::new(),
        );

        ctx.set_disk(DiskRole::Seed, disk("/srv/vmlet/vm3/seed.img", DiskFormat::Raw))
            .unwrap();
        assert_eq!(ctx.lifecycle.phase(), VmPhase::Pending);

        ctx.set_disk(
            DiskRole::Primary,
            disk("/srv/vmlet/vm3/vm3.qcow2", DiskFormat::Qcow2),
        )
        .unwrap();
        assert_eq!(ctx.lifecycle.phase(), VmPhase::Staged);
    }
}
