//! Error types for vmlet.
//!
//! Every variant carries the resource it failed on (path, unit name, socket
//! path) so a single log line is enough to locate the failure.

use std::io;
use std::path::PathBuf;

pub type VmletResult<T> = Result<T, VmletError>;

#[derive(Debug, thiserror::Error)]
pub enum VmletError {
    /// Invalid user-supplied configuration (VM name, sizes, options file).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation not permitted in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filesystem I/O while preparing the working directory or disks.
    #[error("staging {operation} failed ({}): {source}", .path.display())]
    Staging {
        operation: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing or serializing the unit descriptor failed.
    #[error("unit descriptor {unit}: {message}")]
    Descriptor { unit: String, message: String },

    /// The init system rejected a request.
    #[error("supervisor {operation} for {unit} failed: {message}")]
    Supervisor {
        unit: String,
        operation: String,
        message: String,
    },

    /// The control socket is not accepting connections yet.
    #[error("control socket {} not ready: {source}", .path.display())]
    ConnectTransient {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The control socket never became ready within the retry bound.
    #[error("control socket {} not ready after {attempts} attempts", .path.display())]
    ConnectExhausted { path: PathBuf, attempts: u32 },

    /// Connecting failed for a reason retrying will not fix.
    #[error("cannot connect to control socket {}: {source}", .path.display())]
    ConnectFatal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The monitor greeting or capability negotiation failed.
    #[error("monitor handshake on {} failed: {reason}", .path.display())]
    Handshake { path: PathBuf, reason: String },

    /// A monitor command returned an error reply.
    #[error("monitor command {command} on {} failed: {reason}", .path.display())]
    Command {
        path: PathBuf,
        command: String,
        reason: String,
    },

    /// A single message on the event stream could not be decoded.
    #[error("undecodable monitor message on {}: {reason}", .path.display())]
    EventDecode { path: PathBuf, reason: String },

    /// The event stream transport failed mid-stream.
    #[error("monitor stream on {} failed: {reason}", .path.display())]
    Stream { path: PathBuf, reason: String },

    /// The run was cancelled while in the named stage.
    #[error("cancelled during {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmletError {
    /// Name of the orchestration stage that produces this kind of error.
    pub fn stage(&self) -> &str {
        match self {
            VmletError::Config(_) => "config",
            VmletError::InvalidState(_) | VmletError::Internal(_) => "orchestrator",
            VmletError::Staging { .. } => "disk_staging",
            VmletError::Descriptor { .. } => "unit_write",
            VmletError::Supervisor { .. } => "supervisor",
            VmletError::ConnectTransient { .. }
            | VmletError::ConnectExhausted { .. }
            | VmletError::ConnectFatal { .. } => "monitor_connect",
            VmletError::Handshake { .. } => "monitor_handshake",
            VmletError::Command { .. } => "monitor_command",
            VmletError::EventDecode { .. } | VmletError::Stream { .. } => "event_stream",
            VmletError::Cancelled(stage) => stage,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VmletError::ConnectTransient { .. })
    }

    /// Process exit status for a run that ended with this error.
    ///
    /// 1 = provisioning failure, 2 = monitor failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmletError::ConnectTransient { .. }
            | VmletError::ConnectExhausted { .. }
            | VmletError::ConnectFatal { .. }
            | VmletError::Handshake { .. }
            | VmletError::Command { .. }
            | VmletError::EventDecode { .. }
            | VmletError::Stream { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn staging(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        VmletError::Staging {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_split_provisioning_and_monitor() {
        let staging = VmletError::staging(
            "copy",
            "/tmp/x",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(staging.exit_code(), 1);

        let exhausted = VmletError::ConnectExhausted {
            path: PathBuf::from("/tmp/vm.socket"),
            attempts: 3,
        };
        assert_eq!(exhausted.exit_code(), 2);
        assert_eq!(exhausted.stage(), "monitor_connect");
    }

    #[test]
    fn test_only_connect_transient_is_retryable() {
        let transient = VmletError::ConnectTransient {
            path: PathBuf::from("/tmp/vm.socket"),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(transient.is_transient());

        let fatal = VmletError::ConnectFatal {
            path: PathBuf::from("/tmp/vm.socket"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_error_message_names_resource() {
        let err = VmletError::Supervisor {
            unit: "vm3.service".into(),
            operation: "start".into(),
            message: "unit not found".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vm3.service"));
        assert!(msg.contains("start"));
    }
}
