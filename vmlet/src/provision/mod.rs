//! VM provisioning orchestration.
//!
//! ```text
//! 1. WorkdirTask           (create <home>/<name>/)
//! 2. DiskCopyTask primary ─┬─ (copy backing image → <name>.qcow2)
//!    DiskCopyTask seed    ─┘  (copy seed image → seed.img)
//! 3. UnitWriteTask         (render + persist <name>.service)
//! 4. UnitRegisterTask      (daemon-reload)
//! 5. UnitStartTask         (start job accepted)
//! 6. MonitorConnectTask    (wait for socket, handshake, query-status)
//! ```
//!
//! After the pipeline the caller owns a [`ProvisionedVm`] holding the live
//! monitor connection and drives the event stream from it.

mod tasks;
mod types;

pub use types::{DiskRole, ProvisionContext};

use crate::errors::{VmletError, VmletResult};
use crate::monitor::{
    EventConsumer, EventHandler, MonitorConnection, RetryPolicy, StreamSummary,
};
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, PipelineMetrics, Stage};
use crate::supervisor::{InitSystem, JobMode, UnitWrite};
use crate::vmm::{VmLifecycle, VmPhase, VmSpec};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use tasks::{
    DiskCopyTask, MonitorConnectTask, ProvisionCtx, UnitRegisterTask, UnitStartTask,
    UnitWriteTask, WorkdirTask,
};

fn execution_plan() -> ExecutionPlan<ProvisionCtx> {
    let stages: Vec<Stage<BoxedTask<ProvisionCtx>>> = vec![
        Stage::sequential("workdir", vec![Box::new(WorkdirTask)]),
        Stage::parallel(
            "disk_staging",
            vec![Box::new(DiskCopyTask::primary()), Box::new(DiskCopyTask::seed())],
        ),
        Stage::sequential("unit_write", vec![Box::new(UnitWriteTask)]),
        // reload must finish before start
        Stage::sequential("supervisor", vec![Box::new(UnitRegisterTask), Box::new(UnitStartTask)]),
        Stage::sequential("monitor_connect", vec![Box::new(MonitorConnectTask)]),
    ];
    ExecutionPlan::new(stages)
}

/// Runs the provisioning pipeline for one VM at a time.
///
/// Runs for the same VM name must not overlap; the caller serializes them.
pub struct Provisioner {
    supervisor: Arc<dyn InitSystem>,
    retry: RetryPolicy,
    job_mode: JobMode,
}

impl Provisioner {
    pub fn new(supervisor: Arc<dyn InitSystem>, retry: RetryPolicy) -> Self {
        Self {
            supervisor,
            retry,
            job_mode: JobMode::default(),
        }
    }

    pub fn with_job_mode(mut self, job_mode: JobMode) -> Self {
        self.job_mode = job_mode;
        self
    }

    /// Stage, register and start the VM, then connect to its monitor.
    ///
    /// On failure the run is marked failed and a structured error naming the
    /// failing stage is logged before the error is returned.
    pub async fn provision(
        &self,
        spec: VmSpec,
        cancel: CancellationToken,
    ) -> VmletResult<ProvisionedVm> {
        let start = Instant::now();
        let ctx = ProvisionContext::new(
            spec,
            Arc::clone(&self.supervisor),
            self.retry.clone(),
            self.job_mode,
            cancel,
        );
        let run_id = ctx.run_id;
        let vm = ctx.spec.name().to_string();
        let ctx: ProvisionCtx = Arc::new(Mutex::new(ctx));

        tracing::info!(vm = %vm, run_id = %run_id, "Provisioning VM");

        let result = PipelineExecutor::execute(execution_plan(), Arc::clone(&ctx)).await;

        let mut ctx = ctx.lock().await;
        let metrics = match result {
            Ok(metrics) => metrics,
            Err(e) => {
                if let Err(state_err) = ctx.lifecycle.fail() {
                    tracing::warn!(vm = %vm, error = %state_err, "Could not mark run failed");
                }
                tracing::error!(
                    vm = %vm,
                    run_id = %run_id,
                    stage = e.stage(),
                    phase = %ctx.lifecycle.phase(),
                    error = %e,
                    "Provisioning failed"
                );
                return Err(e);
            }
        };

        metrics.log_summary(&run_id.to_string());

        let connection = ctx
            .connection
            .take()
            .ok_or_else(|| VmletError::Internal("monitor_connect task must run first".into()))?;

        tracing::info!(
            vm = %vm,
            run_id = %run_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM provisioned"
        );

        Ok(ProvisionedVm {
            spec: ctx.spec.clone(),
            run_id,
            lifecycle: std::mem::take(&mut ctx.lifecycle),
            unit_write: ctx.unit_write,
            vm_status: ctx.vm_status.take(),
            metrics,
            connection,
            cancel: ctx.cancel.clone(),
        })
    }

    /// Provision the VM and consume its events until the stream ends.
    pub async fn run<H: EventHandler + ?Sized>(
        &self,
        spec: VmSpec,
        cancel: CancellationToken,
        handler: &mut H,
    ) -> VmletResult<RunReport> {
        let vm = self.provision(spec, cancel).await?;
        vm.stream(handler).await
    }
}

/// A started VM with a negotiated monitor connection.
pub struct ProvisionedVm {
    spec: VmSpec,
    run_id: Ulid,
    lifecycle: VmLifecycle,
    unit_write: Option<UnitWrite>,
    vm_status: Option<Value>,
    metrics: PipelineMetrics,
    connection: MonitorConnection,
    cancel: CancellationToken,
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Ulid,
    pub phases: Vec<VmPhase>,
    pub summary: StreamSummary,
}

impl ProvisionedVm {
    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    pub fn phase(&self) -> VmPhase {
        self.lifecycle.phase()
    }

    pub fn unit_write(&self) -> Option<UnitWrite> {
        self.unit_write
    }

    pub fn vm_status(&self) -> Option<&Value> {
        self.vm_status.as_ref()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn connection(&mut self) -> &mut MonitorConnection {
        &mut self.connection
    }

    /// Consume events until peer close, cancellation, or transport failure.
    pub async fn stream<H: EventHandler + ?Sized>(self, handler: &mut H) -> VmletResult<RunReport> {
        let ProvisionedVm {
            spec,
            run_id,
            mut lifecycle,
            connection,
            cancel,
            ..
        } = self;

        lifecycle.advance(VmPhase::Streaming)?;
        tracing::info!(vm = %spec.name(), run_id = %run_id, "Streaming monitor events");

        let events = connection.into_events(cancel.clone());
        match EventConsumer::consume(events, &cancel, handler).await {
            Ok(summary) => {
                lifecycle.advance(VmPhase::Terminated)?;
                Ok(RunReport {
                    run_id,
                    phases: lifecycle.history().to_vec(),
                    summary,
                })
            }
            Err(e) => {
                lifecycle.fail()?;
                tracing::error!(
                    vm = %spec.name(),
                    run_id = %run_id,
                    stage = e.stage(),
                    error = %e,
                    "Event stream failed"
                );
                Err(e)
            }
        }
    }
}
