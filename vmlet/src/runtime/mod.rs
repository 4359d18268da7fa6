//! Host-level runtime: options and filesystem layout.

pub mod layout;
pub mod options;

pub use layout::{FilesystemLayout, VmLayout};
pub use options::{MonitorOptions, SupervisorScope, VmletOptions};
