//! VM description and per-run lifecycle state.

pub mod spec;
pub mod state;

pub use spec::{VmSpec, validate_name};
pub use state::{VmLifecycle, VmPhase};
