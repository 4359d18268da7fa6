//! Task: render the unit descriptor and persist it.

use super::{ProvisionCtx, advance, cancellable, log_task_error, task_start};
use crate::errors::VmletResult;
use crate::pipeline::PipelineTask;
use crate::supervisor::UnitWrite;
use crate::unit::build_unit;
use crate::vmm::VmPhase;
use async_trait::async_trait;

pub struct UnitWriteTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for UnitWriteTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;

        let (unit_name, contents, supervisor) = {
            let ctx = ctx.lock().await;
            (
                ctx.spec.unit_name(),
                build_unit(&ctx.spec).to_bytes(),
                ctx.supervisor.clone(),
            )
        };

        let outcome = cancellable(&cancel, task_name, supervisor.write_unit(&unit_name, &contents))
            .await
            .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        match outcome {
            UnitWrite::Unchanged => {
                tracing::info!(vm = %vm, unit = %unit_name, "Unit unchanged, redeploying as is")
            }
            UnitWrite::Created | UnitWrite::Updated => {
                tracing::info!(vm = %vm, unit = %unit_name, outcome = ?outcome, "Unit written")
            }
        }

        ctx.lock().await.unit_write = Some(outcome);
        advance(&ctx, VmPhase::DescriptorWritten).await
    }

    fn name(&self) -> &str {
        "unit_write"
    }
}
