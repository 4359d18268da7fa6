//! Draining the event stream.

use super::client::EventStream;
use super::protocol::MonitorEvent;
use crate::errors::{VmletError, VmletResult};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// Events that announce the guest going away.
const SHUTDOWN_EVENTS: &[&str] = &["SHUTDOWN", "POWERDOWN"];

/// Why a stream stopped producing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    PeerClosed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub events: u64,
    pub decode_errors: u64,
    pub end: StreamEnd,
}

/// Receives events in arrival order.
pub trait EventHandler: Send {
    fn on_event(&mut self, event: &MonitorEvent);

    /// Called for each line that could not be decoded. The stream continues.
    fn on_decode_error(&mut self, error: &VmletError) {
        tracing::warn!(error = %error, "Skipping undecodable monitor message");
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    vm: String,
}

impl LoggingHandler {
    pub fn new(vm: impl Into<String>) -> Self {
        Self { vm: vm.into() }
    }
}

impl EventHandler for LoggingHandler {
    fn on_event(&mut self, event: &MonitorEvent) {
        if SHUTDOWN_EVENTS.contains(&event.name.as_str()) {
            tracing::info!(
                vm = %self.vm,
                event = %event.name,
                timestamp = %event.timestamp,
                data = %event.data,
                "VM is going down"
            );
        } else {
            tracing::info!(
                vm = %self.vm,
                event = %event.name,
                timestamp = %event.timestamp,
                data = %event.data,
                "EVENT"
            );
        }
    }
}

pub struct EventConsumer;

impl EventConsumer {
    /// Drain `stream` until it ends or `cancel` fires.
    ///
    /// Returns `Stream` if the transport failed mid-stream.
    pub async fn consume<H: EventHandler + ?Sized>(
        mut stream: EventStream,
        cancel: &CancellationToken,
        handler: &mut H,
    ) -> VmletResult<StreamSummary> {
        let mut events = 0u64;
        let mut decode_errors = 0u64;

        let end = loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    events += 1;
                    handler.on_event(&event);
                }
                Some(Err(e @ VmletError::EventDecode { .. })) => {
                    decode_errors += 1;
                    handler.on_decode_error(&e);
                }
                Some(Err(e)) => return Err(e),
                // The stream also ends itself on cancellation
                None if cancel.is_cancelled() => break StreamEnd::Cancelled,
                None => break StreamEnd::PeerClosed,
            }
        };

        // Dropping the stream closes the connection if it is still open
        drop(stream);

        tracing::info!(events, decode_errors, end = ?end, "Event stream ended");
        Ok(StreamSummary {
            events,
            decode_errors,
            end,
        })
    }
}
