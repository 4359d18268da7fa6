//! Lifecycle state of one provisioning run.
//!
//! Held only in memory for the duration of a run:
//!
//! ```text
//! Pending → Staged → DescriptorWritten → Registered → Started
//!         → MonitorConnected → Streaming → Terminated
//!
//! any non-terminal ──→ Failed
//! ```

use crate::errors::{VmletError, VmletResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VmPhase {
    /// Run created, nothing on disk yet.
    Pending,
    /// Working directory and both disks are in place.
    Staged,
    /// Unit file written.
    DescriptorWritten,
    /// Init system reloaded and aware of the unit.
    Registered,
    /// Start job accepted by the init system.
    Started,
    /// Control socket connected and handshake completed.
    MonitorConnected,
    /// Events are being consumed.
    Streaming,
    /// Event stream ended.
    Terminated,
    Failed,
}

impl VmPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmPhase::Terminated | VmPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmPhase::Pending => "pending",
            VmPhase::Staged => "staged",
            VmPhase::DescriptorWritten => "descriptor_written",
            VmPhase::Registered => "registered",
            VmPhase::Started => "started",
            VmPhase::MonitorConnected => "monitor_connected",
            VmPhase::Streaming => "streaming",
            VmPhase::Terminated => "terminated",
            VmPhase::Failed => "failed",
        }
    }

    fn next(self) -> Option<VmPhase> {
        match self {
            VmPhase::Pending => Some(VmPhase::Staged),
            VmPhase::Staged => Some(VmPhase::DescriptorWritten),
            VmPhase::DescriptorWritten => Some(VmPhase::Registered),
            VmPhase::Registered => Some(VmPhase::Started),
            VmPhase::Started => Some(VmPhase::MonitorConnected),
            VmPhase::MonitorConnected => Some(VmPhase::Streaming),
            VmPhase::Streaming => Some(VmPhase::Terminated),
            VmPhase::Terminated | VmPhase::Failed => None,
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-only state machine over [`VmPhase`].
#[derive(Debug, Clone)]
pub struct VmLifecycle {
    phase: VmPhase,
    history: Vec<VmPhase>,
}

impl Default for VmLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl VmLifecycle {
    pub fn new() -> Self {
        Self {
            phase: VmPhase::Pending,
            history: vec![VmPhase::Pending],
        }
    }

    pub fn phase(&self) -> VmPhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[VmPhase] {
        &self.history
    }

    /// Move to the next phase. Skipping or going back is an error.
    pub fn advance(&mut self, to: VmPhase) -> VmletResult<()> {
        if to == VmPhase::Failed {
            return self.fail();
        }
        match self.phase.next() {
            Some(next) if next == to => {
                self.enter(to);
                Ok(())
            }
            _ => Err(VmletError::InvalidState(format!(
                "illegal transition {} -> {}",
                self.phase, to
            ))),
        }
    }

    /// Mark the run failed. Failing a terminal run is an error.
    pub fn fail(&mut self) -> VmletResult<()> {
        if self.phase.is_terminal() {
            return Err(VmletError::InvalidState(format!(
                "cannot fail a run in terminal phase {}",
                self.phase
            )));
        }
        self.enter(VmPhase::Failed);
        Ok(())
    }

    fn enter(&mut self, phase: VmPhase) {
        tracing::debug!(from = %self.phase, to = %phase, "VM phase transition");
        self.phase = phase;
        self.history.push(phase);
    }
}
