//! QMP control socket: readiness retry, session, event stream.

mod client;
mod consumer;
pub mod protocol;
mod retry;

pub use client::{EventStream, MonitorConnection};
pub use consumer::{EventConsumer, EventHandler, LoggingHandler, StreamEnd, StreamSummary};
pub use protocol::{Greeting, MonitorEvent};
pub use retry::{RetryPolicy, connect_with_retry, retry_transient};

#[cfg(test)]
pub(crate) use client::tests::serve_script;
