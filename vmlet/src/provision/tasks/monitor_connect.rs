//! Task: wait for the control socket, negotiate, and query VM status.

use super::{ProvisionCtx, cancellable, log_task_error, task_start};
use crate::errors::{VmletError, VmletResult};
use crate::monitor::MonitorConnection;
use crate::pipeline::PipelineTask;
use crate::vmm::VmPhase;
use async_trait::async_trait;

const STATUS_COMMAND: &str = "query-status";

pub struct MonitorConnectTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for MonitorConnectTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;

        let (socket, retry) = {
            let ctx = ctx.lock().await;
            (ctx.spec.control_socket_path(), ctx.retry.clone())
        };

        let mut connection = MonitorConnection::connect(&socket, &retry, &cancel)
            .await
            .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        tracing::info!(
            vm = %vm,
            socket = %socket.display(),
            qemu = %connection.greeting().version.qemu,
            "Monitor connected"
        );

        // Status is informational; a failure here does not fail the run
        let reply = cancellable(&cancel, task_name, connection.execute(STATUS_COMMAND, None)).await;
        let status = match reply {
            Err(e @ VmletError::Cancelled(_)) => {
                connection.close().await;
                log_task_error(&vm, task_name, &e);
                return Err(e);
            }
            Ok(status) => {
                tracing::info!(
                    vm = %vm,
                    status = %status.get("status").and_then(|s| s.as_str()).unwrap_or("unknown"),
                    running = status.get("running").and_then(|r| r.as_bool()).unwrap_or(false),
                    "VM status"
                );
                Some(status)
            }
            Err(e) => {
                tracing::warn!(vm = %vm, error = %e, "Could not query VM status");
                None
            }
        };

        let mut ctx = ctx.lock().await;
        ctx.connection = Some(connection);
        ctx.vm_status = status;
        ctx.lifecycle.advance(VmPhase::MonitorConnected)
    }

    fn name(&self) -> &str {
        "monitor_connect"
    }
}
