//! QMP session over the control socket.

use super::protocol::{
    CAPABILITIES_COMMAND, Greeting, MonitorEvent, ServerMessage, encode_command,
};
use super::retry::{RetryPolicy, connect_with_retry};
use crate::errors::{VmletError, VmletResult};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Longest accepted line. Larger messages are reported as undecodable.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Live events from one connection, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = VmletResult<MonitorEvent>> + Send>>;

enum Inbound {
    Message(ServerMessage),
    Undecodable(String),
    Closed,
}

/// A connected, negotiated QMP session.
///
/// Construction succeeds only after a valid greeting and a successful
/// capabilities exchange. The socket is shut down exactly once: by
/// [`close`](Self::close), at the end of the event stream, or on drop.
pub struct MonitorConnection {
    path: PathBuf,
    greeting: Greeting,
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: Option<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    /// Events received while waiting for a command reply.
    pending: VecDeque<MonitorEvent>,
    reply_timeout: Duration,
}

impl MonitorConnection {
    /// Wait for the control socket per `policy`, then negotiate.
    pub async fn connect(
        path: &Path,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> VmletResult<Self> {
        let stream = connect_with_retry(path, policy, cancel).await?;
        Self::handshake(path, stream, policy.attempt_timeout, cancel).await
    }

    /// Negotiate on an already connected stream.
    ///
    /// `reply_timeout` bounds the wait for the greeting and for each reply.
    pub async fn handshake(
        path: &Path,
        stream: UnixStream,
        reply_timeout: Duration,
        cancel: &CancellationToken,
    ) -> VmletResult<Self> {
        let (read_half, write_half) = stream.into_split();
        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let handshake_err = |reason: String| VmletError::Handshake {
            path: path.to_path_buf(),
            reason,
        };

        let first = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(VmletError::Cancelled("monitor_handshake".to_string()));
            }
            first = tokio::time::timeout(reply_timeout, reader.next()) => first,
        };

        let greeting = match first {
            Err(_) => {
                return Err(handshake_err(format!(
                    "no greeting within {:?}",
                    reply_timeout
                )));
            }
            Ok(None) => return Err(handshake_err("connection closed before greeting".into())),
            Ok(Some(Err(e))) => return Err(handshake_err(format!("reading greeting: {}", e))),
            Ok(Some(Ok(line))) => match ServerMessage::decode(&line) {
                Ok(ServerMessage::Greeting(greeting)) => greeting,
                Ok(other) => {
                    return Err(handshake_err(format!(
                        "expected greeting, got {} message",
                        other.kind()
                    )));
                }
                Err(reason) => return Err(handshake_err(format!("malformed greeting: {}", reason))),
            },
        };

        tracing::debug!(
            socket = %path.display(),
            qemu = %greeting.version.qemu,
            package = %greeting.version.package,
            "Monitor greeting received"
        );

        let mut conn = Self {
            path: path.to_path_buf(),
            greeting,
            reader,
            writer: Some(FramedWrite::new(write_half, LinesCodec::new())),
            pending: VecDeque::new(),
            reply_timeout,
        };

        let negotiated = tokio::select! {
            _ = cancel.cancelled() => Err(VmletError::Cancelled("monitor_handshake".to_string())),
            result = conn.execute(CAPABILITIES_COMMAND, None) => result,
        };
        if let Err(e) = negotiated {
            conn.shutdown().await;
            return Err(match e {
                VmletError::Command { reason, .. } | VmletError::Stream { reason, .. } => {
                    handshake_err(format!("capabilities negotiation failed: {}", reason))
                }
                other => other,
            });
        }

        Ok(conn)
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a command and wait for its reply.
    ///
    /// Events that arrive first are queued for the event stream.
    pub async fn execute(&mut self, command: &str, arguments: Option<&Value>) -> VmletResult<Value> {
        let path = self.path.clone();
        let stream_err = |reason: String| VmletError::Stream {
            path: path.clone(),
            reason,
        };

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| stream_err("connection already closed".into()))?;
        writer
            .send(encode_command(command, arguments))
            .await
            .map_err(|e| stream_err(format!("sending {}: {}", command, e)))?;

        let reply_timeout = self.reply_timeout;
        let wait = async {
            loop {
                match self.recv().await {
                    Ok(Inbound::Message(ServerMessage::Return(value))) => return Ok(value),
                    Ok(Inbound::Message(ServerMessage::Error(reply))) => {
                        return Err(VmletError::Command {
                            path: self.path.clone(),
                            command: command.to_string(),
                            reason: reply.to_string(),
                        });
                    }
                    Ok(Inbound::Message(ServerMessage::Event(event))) => {
                        self.pending.push_back(event);
                    }
                    Ok(Inbound::Message(ServerMessage::Greeting(_))) => {
                        tracing::debug!(socket = %self.path.display(), "Ignoring repeated greeting");
                    }
                    Ok(Inbound::Undecodable(reason)) => {
                        tracing::warn!(socket = %self.path.display(), %reason, "Undecodable message while awaiting reply");
                    }
                    Ok(Inbound::Closed) => {
                        return Err(stream_err(format!(
                            "connection closed while awaiting reply to {}",
                            command
                        )));
                    }
                    Err(e) => return Err(stream_err(e.to_string())),
                }
            }
        };

        match tokio::time::timeout(reply_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(VmletError::Command {
                path: self.path.clone(),
                command: command.to_string(),
                reason: format!("no reply within {:?}", reply_timeout),
            }),
        }
    }

    /// Turn the session into its event stream.
    ///
    /// Queued events come first. An undecodable line yields `EventDecode` and
    /// the stream continues; a transport failure yields one `Stream` error
    /// and ends it. Cancellation or peer close end it silently. The socket is
    /// closed when the stream ends.
    pub fn into_events(self, cancel: CancellationToken) -> EventStream {
        let mut conn = self;
        Box::pin(async_stream::stream! {
            while let Some(event) = conn.pending.pop_front() {
                yield Ok(event);
            }

            loop {
                let inbound = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(socket = %conn.path.display(), "Event stream cancelled");
                        break;
                    }
                    inbound = conn.recv() => inbound,
                };

                match inbound {
                    Ok(Inbound::Message(ServerMessage::Event(event))) => yield Ok(event),
                    Ok(Inbound::Message(other)) => {
                        tracing::debug!(socket = %conn.path.display(), kind = other.kind(), "Ignoring non-event message");
                    }
                    Ok(Inbound::Undecodable(reason)) => {
                        yield Err(VmletError::EventDecode { path: conn.path.clone(), reason });
                    }
                    Ok(Inbound::Closed) => {
                        tracing::debug!(socket = %conn.path.display(), "Monitor peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        yield Err(VmletError::Stream { path: conn.path.clone(), reason: e.to_string() });
                        break;
                    }
                }
            }

            conn.shutdown().await;
        })
    }

    /// Shut the socket down. Errors are logged.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = SinkExt::<String>::close(&mut writer).await {
                tracing::warn!(socket = %self.path.display(), error = %e, "Failed to close monitor connection");
            } else {
                tracing::debug!(socket = %self.path.display(), "Monitor connection closed");
            }
        }
    }

    async fn recv(&mut self) -> Result<Inbound, std::io::Error> {
        match self.reader.next().await {
            None => Ok(Inbound::Closed),
            Some(Ok(line)) if line.trim().is_empty() => Ok(Inbound::Undecodable("empty line".into())),
            Some(Ok(line)) => Ok(match ServerMessage::decode(&line) {
                Ok(message) => Inbound::Message(message),
                Err(reason) => Inbound::Undecodable(reason),
            }),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Ok(Inbound::Undecodable(format!(
                "line longer than {} bytes",
                MAX_LINE_LENGTH
            ))),
            Some(Err(LinesCodecError::Io(e))) => Err(e),
        }
    }
}

impl Drop for MonitorConnection {
    fn drop(&mut self) {
        if self.writer.is_some() {
            tracing::debug!(socket = %self.path.display(), "Monitor connection dropped without close");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": []}}"#;

    /// Accept one client, send the greeting, answer `qmp_capabilities`, then
    /// write `script` line by line and close.
    pub(crate) async fn serve_script(listener: UnixListener, script: Vec<String>) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();

        write_half
            .write_all(format!("{}\n", GREETING).as_bytes())
            .await
            .unwrap();
        let command = lines.next_line().await.unwrap().unwrap();
        received.push(command);
        write_half.write_all(b"{\"return\": {}}\n").await.unwrap();

        for line in script {
            if let Some(expect) = line.strip_prefix("<<") {
                let command = lines.next_line().await.unwrap().unwrap();
                assert!(command.contains(expect), "{command} does not contain {expect}");
                received.push(command);
            } else {
                write_half
                    .write_all(format!("{}\n", line).as_bytes())
                    .await
                    .unwrap();
            }
        }
        received
    }

    fn event_line(name: &str, seconds: i64) -> String {
        format!(
            r#"{{"event": "{}", "data": {{"n": {}}}, "timestamp": {{"seconds": {}, "microseconds": 0}}}}"#,
            name, seconds, seconds
        )
    }

    async fn connected(script: Vec<String>) -> (MonitorConnection, tokio::task::JoinHandle<Vec<String>>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm3.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_script(listener, script));
        let stream = UnixStream::connect(&path).await.unwrap();
        let conn = MonitorConnection::handshake(
            &path,
            stream,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        (conn, server, tmp)
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_until_peer_close() {
        let script = vec![event_line("STOP", 1), event_line("RESUME", 2), event_line("SHUTDOWN", 3)];
        let (conn, server, _tmp) = connected(script).await;
        assert_eq!(conn.greeting().version.qemu.to_string(), "8.2.0");

        let events: Vec<MonitorEvent> = conn
            .into_events(CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["STOP", "RESUME", "SHUTDOWN"]);
        assert_eq!(events[2].data["n"], 3);

        let received = server.await.unwrap();
        assert_eq!(received, [r#"{"execute":"qmp_capabilities"}"#]);
    }

    #[tokio::test]
    async fn test_undecodable_line_does_not_end_stream() {
        let script = vec![event_line("STOP", 1), "garbage".to_string(), event_line("RESUME", 2)];
        let (conn, _server, _tmp) = connected(script).await;

        let items: Vec<VmletResult<MonitorEvent>> =
            conn.into_events(CancellationToken::new()).collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().name, "STOP");
        assert!(matches!(items[1], Err(VmletError::EventDecode { .. })));
        assert_eq!(items[2].as_ref().unwrap().name, "RESUME");
    }

    #[tokio::test]
    async fn test_events_during_command_are_delivered_first() {
        let script = vec![
            "<<query-status".to_string(),
            event_line("STOP", 1),
            r#"{"return": {"status": "paused", "running": false}}"#.to_string(),
            event_line("RESUME", 2),
        ];
        let (mut conn, _server, _tmp) = connected(script).await;

        let status = conn.execute("query-status", None).await.unwrap();
        assert_eq!(status["status"], "paused");

        let names: Vec<String> = conn
            .into_events(CancellationToken::new())
            .map(|r| r.unwrap().name)
            .collect()
            .await;
        assert_eq!(names, ["STOP", "RESUME"]);
    }

    #[tokio::test]
    async fn test_error_reply_is_command_error() {
        let script = vec![
            "<<bogus".to_string(),
            r#"{"error": {"class": "CommandNotFound", "desc": "The command bogus has not been found"}}"#.to_string(),
        ];
        let (mut conn, _server, _tmp) = connected(script).await;

        let err = conn.execute("bogus", None).await.unwrap_err();
        match err {
            VmletError::Command { command, reason, .. } => {
                assert_eq!(command, "bogus");
                assert!(reason.contains("CommandNotFound"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_closes_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm3.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(format!("{}\n", GREETING).as_bytes()).await.unwrap();
            let mut buf = [0u8; 256];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await.unwrap();
            stream.write_all(b"{\"return\": {}}\n").await.unwrap();
            // Returns only once the client side has shut the socket down
            let mut rest = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut rest)
                .await
                .unwrap();
            rest.len()
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let cancel = CancellationToken::new();
        let conn = MonitorConnection::handshake(&path, stream, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        let mut events = conn.into_events(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        assert!(events.next().await.is_none());

        // The stream is still alive here, so EOF must come from the shutdown
        let sent_after_handshake = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server never saw EOF after cancel")
            .unwrap();
        assert_eq!(sent_after_handshake, 0);
        drop(events);
    }

    async fn handshake_with_server_bytes(greeting: &'static [u8]) -> (VmletError, usize) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm3.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(greeting).await.unwrap();
            stream.shutdown().await.unwrap();
            // Count bytes the client sent after the bad greeting
            let mut rest = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut rest)
                .await
                .unwrap();
            rest.len()
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let err = MonitorConnection::handshake(
            &path,
            stream,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        (err, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_malformed_greeting_sends_nothing() {
        let (err, sent) = handshake_with_server_bytes(b"{\"hello\": \"world\"}\n").await;
        assert!(matches!(err, VmletError::Handshake { .. }));
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_event_before_greeting_is_rejected() {
        let (err, sent) = handshake_with_server_bytes(
            b"{\"event\": \"STOP\", \"timestamp\": {\"seconds\": 1, \"microseconds\": 0}}\n",
        )
        .await;
        assert!(matches!(err, VmletError::Handshake { ref reason, .. } if reason.contains("event")));
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_eof_before_greeting() {
        let (err, _) = handshake_with_server_bytes(b"").await;
        assert!(matches!(err, VmletError::Handshake { ref reason, .. } if reason.contains("closed")));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm3.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let err = MonitorConnection::handshake(
            &path,
            stream,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, VmletError::Handshake { ref reason, .. } if reason.contains("no greeting")));
    }

    #[tokio::test]
    async fn test_rejected_capabilities_is_handshake_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vm3.socket");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            write_half.write_all(format!("{}\n", GREETING).as_bytes()).await.unwrap();
            let _ = lines.next_line().await.unwrap();
            write_half
                .write_all(b"{\"error\": {\"class\": \"GenericError\", \"desc\": \"no\"}}\n")
                .await
                .unwrap();
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let err = MonitorConnection::handshake(
            &path,
            stream,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, VmletError::Handshake { ref reason, .. } if reason.contains("GenericError")));
    }
}
