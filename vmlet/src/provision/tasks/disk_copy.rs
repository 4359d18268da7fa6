//! Task: copy one disk template into the working directory.
//!
//! The primary and seed copies run as two instances of this task in a
//! parallel stage.

use super::{ProvisionCtx, log_task_error, task_start};
use crate::disk::{DiskFormat, copy_disk};
use crate::errors::{VmletError, VmletResult};
use crate::pipeline::PipelineTask;
use crate::provision::types::DiskRole;
use async_trait::async_trait;

pub struct DiskCopyTask {
    role: DiskRole,
}

impl DiskCopyTask {
    pub fn primary() -> Self {
        Self {
            role: DiskRole::Primary,
        }
    }

    pub fn seed() -> Self {
        Self {
            role: DiskRole::Seed,
        }
    }
}

#[async_trait]
impl PipelineTask<ProvisionCtx> for DiskCopyTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;

        let (source, dest, format) = {
            let ctx = ctx.lock().await;
            let layout = ctx.spec.layout();
            match self.role {
                DiskRole::Primary => (
                    ctx.spec.backing_image_source().to_path_buf(),
                    layout.primary_disk_path(),
                    DiskFormat::Qcow2,
                ),
                DiskRole::Seed => (
                    ctx.spec.seed_image_source().to_path_buf(),
                    layout.seed_disk_path(),
                    DiskFormat::Raw,
                ),
            }
        };

        // The blocking copy watches this token; dropping the task stops it too
        let copy_cancel = cancel.child_token();
        let _stop_copy = copy_cancel.clone().drop_guard();

        // Awaited to completion so no copy outlives the run
        let staged = tokio::task::spawn_blocking(move || {
            copy_disk(&source, &dest, format, &copy_cancel)
        })
        .await
        .map_err(|e| VmletError::Internal(format!("disk copy task failed: {}", e)))
        .and_then(|result| {
            result.map_err(|e| match e {
                VmletError::Cancelled(_) => VmletError::Cancelled(task_name.to_string()),
                other => other,
            })
        })
        .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        tracing::info!(
            vm = %vm,
            disk = %staged.path.display(),
            format = staged.format.as_str(),
            size_mb = staged.size_bytes / (1024 * 1024),
            "Disk staged"
        );

        ctx.lock().await.set_disk(self.role, staged)
    }

    fn name(&self) -> &str {
        match self.role {
            DiskRole::Primary => "primary_disk_copy",
            DiskRole::Seed => "seed_disk_copy",
        }
    }
}
