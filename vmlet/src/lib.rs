//! vmlet: run a QEMU virtual machine as a systemd unit and follow its QMP
//! event stream.
//!
//! A run stages the VM's disks, writes and starts its unit, waits for the
//! control socket to come up, negotiates QMP, and then consumes events until
//! the VM goes away or the run is cancelled.

pub mod disk;
pub mod errors;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod provision;
pub mod runtime;
pub mod supervisor;
pub mod unit;
pub mod vmm;

pub use errors::{VmletError, VmletResult};
pub use logging::init_logging_for;
pub use monitor::{
    EventConsumer, EventHandler, LoggingHandler, MonitorConnection, MonitorEvent, RetryPolicy,
    StreamEnd, StreamSummary,
};
pub use provision::{ProvisionedVm, Provisioner, RunReport};
pub use runtime::{FilesystemLayout, SupervisorScope, VmletOptions};
pub use supervisor::{InitSystem, JobMode, SystemctlSupervisor, UnitActiveState, UnitWrite};
pub use unit::{UnitDescriptor, build_unit};
pub use vmm::{VmPhase, VmSpec};
