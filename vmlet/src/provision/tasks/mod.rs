//! Provisioning pipeline tasks.

mod disk_copy;
mod monitor_connect;
mod unit_register;
mod unit_start;
mod unit_write;
mod workdir;

pub use disk_copy::DiskCopyTask;
pub use monitor_connect::MonitorConnectTask;
pub use unit_register::UnitRegisterTask;
pub use unit_start::UnitStartTask;
pub use unit_write::UnitWriteTask;
pub use workdir::WorkdirTask;

use super::types::ProvisionContext;
use crate::errors::{VmletError, VmletResult};
use crate::vmm::VmPhase;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type ProvisionCtx = Arc<Mutex<ProvisionContext>>;

/// Log the task start and bail out if the run was cancelled.
///
/// Returns the VM name and the run's cancellation token.
async fn task_start(ctx: &ProvisionCtx, task_name: &str) -> VmletResult<(String, CancellationToken)> {
    let ctx = ctx.lock().await;
    let vm = ctx.spec.name().to_string();
    if ctx.cancel.is_cancelled() {
        return Err(VmletError::Cancelled(task_name.to_string()));
    }
    tracing::debug!(vm = %vm, run_id = %ctx.run_id, task = task_name, "Task starting");
    Ok((vm, ctx.cancel.clone()))
}

fn log_task_error(vm: &str, task_name: &str, error: &VmletError) {
    tracing::error!(
        vm = %vm,
        task = task_name,
        stage = error.stage(),
        error = %error,
        "Task failed"
    );
}

async fn advance(ctx: &ProvisionCtx, phase: VmPhase) -> VmletResult<()> {
    ctx.lock().await.lifecycle.advance(phase)
}

/// Run `fut` unless `cancel` fires first. The future is dropped on cancel.
async fn cancellable<T>(
    cancel: &CancellationToken,
    task_name: &str,
    fut: impl Future<Output = VmletResult<T>>,
) -> VmletResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(VmletError::Cancelled(task_name.to_string())),
        result = fut => result,
    }
}
