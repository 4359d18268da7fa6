//! QMP wire messages.
//!
//! Every message is one JSON object per line. Server messages are told apart
//! by their top-level key: `QMP` (greeting), `return`, `error`, or `event`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Command sent once after the greeting to leave negotiation mode.
pub const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

/// QEMU version as reported in the greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub qemu: QemuVersion,
    #[serde(default)]
    pub package: String,
}

/// Body of the `{"QMP": ...}` greeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub version: VersionInfo,
    pub capabilities: Vec<Value>,
}

/// `{"error": {"class": ..., "desc": ...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// An asynchronous notification from the VM process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Event payload; `Value::Null` when the event carries none.
    pub data: Value,
}

/// One decoded server line.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Greeting(Greeting),
    Return(Value),
    Error(ErrorReply),
    Event(MonitorEvent),
}

#[derive(Deserialize)]
struct RawTimestamp {
    seconds: i64,
    microseconds: i64,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "QMP")]
    greeting: Option<Greeting>,
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<ErrorReply>,
    event: Option<String>,
    data: Option<Value>,
    timestamp: Option<RawTimestamp>,
}

#[derive(Serialize)]
struct CommandMessage<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

impl ServerMessage {
    /// Decode one line. The error string describes what was wrong with it.
    pub fn decode(line: &str) -> Result<Self, String> {
        let raw: RawMessage =
            serde_json::from_str(line.trim()).map_err(|e| format!("invalid JSON: {}", e))?;

        if let Some(greeting) = raw.greeting {
            return Ok(ServerMessage::Greeting(greeting));
        }
        if let Some(error) = raw.error {
            return Ok(ServerMessage::Error(error));
        }
        if let Some(ret) = raw.ret {
            return Ok(ServerMessage::Return(ret));
        }
        if let Some(name) = raw.event {
            return Ok(ServerMessage::Event(MonitorEvent {
                name,
                timestamp: raw
                    .timestamp
                    .map(|ts| event_time(ts.seconds, ts.microseconds))
                    .unwrap_or_else(Utc::now),
                data: raw.data.unwrap_or(Value::Null),
            }));
        }

        Err("message has none of QMP, return, error, event".to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Greeting(_) => "greeting",
            ServerMessage::Return(_) => "return",
            ServerMessage::Error(_) => "error",
            ServerMessage::Event(_) => "event",
        }
    }
}

/// Encode a command as a single line without the trailing newline.
pub fn encode_command(command: &str, arguments: Option<&Value>) -> String {
    let message = CommandMessage {
        execute: command,
        arguments,
    };
    // Serializing a struct of &str and Value cannot fail
    serde_json::to_string(&message).unwrap_or_else(|_| format!(r#"{{"execute":"{}"}}"#, command))
}

/// Event time from QMP's split seconds/microseconds; falls back to now when
/// the server reports no clock (negative values) or an out-of-range time.
fn event_time(seconds: i64, microseconds: i64) -> DateTime<Utc> {
    if seconds < 0 || !(0..1_000_000).contains(&microseconds) {
        return Utc::now();
    }
    Utc.timestamp_opt(seconds, (microseconds * 1000) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 2, "major": 8}, "package": "Debian 1:8.2.1"}, "capabilities": ["oob"]}}"#;

    #[test]
    fn test_decode_greeting() {
        match ServerMessage::decode(GREETING).unwrap() {
            ServerMessage::Greeting(g) => {
                assert_eq!(g.version.qemu.to_string(), "8.2.1");
                assert_eq!(g.version.package, "Debian 1:8.2.1");
                assert_eq!(g.capabilities, vec![json!("oob")]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_greeting_without_version_is_rejected() {
        assert!(ServerMessage::decode(r#"{"QMP": {"capabilities": []}}"#).is_err());
    }

    #[test]
    fn test_decode_event_with_timestamp() {
        let line = r#"{"timestamp": {"seconds": 1700000000, "microseconds": 250000}, "event": "SHUTDOWN", "data": {"guest": true, "reason": "guest-shutdown"}}"#;
        match ServerMessage::decode(line).unwrap() {
            ServerMessage::Event(event) => {
                assert_eq!(event.name, "SHUTDOWN");
                assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
                assert_eq!(event.timestamp.timestamp_subsec_micros(), 250_000);
                assert_eq!(event.data["reason"], "guest-shutdown");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_event_without_data_has_null_payload() {
        let line = r#"{"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 0}}"#;
        let ServerMessage::Event(event) = ServerMessage::decode(line).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.data, Value::Null);
    }

    #[test]
    fn test_decode_return_and_error() {
        assert_eq!(
            ServerMessage::decode(r#"{"return": {}}"#).unwrap(),
            ServerMessage::Return(json!({}))
        );
        let err = ServerMessage::decode(
            r#"{"error": {"class": "CommandNotFound", "desc": "The command foo has not been found"}}"#,
        )
        .unwrap();
        assert_eq!(err.kind(), "error");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ServerMessage::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"hello": 1}"#).is_err());
        assert!(ServerMessage::decode("[1, 2]").is_err());
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(CAPABILITIES_COMMAND, None),
            r#"{"execute":"qmp_capabilities"}"#
        );
        let args = json!({"device": "virtio0"});
        assert_eq!(
            encode_command("query-block", Some(&args)),
            r#"{"execute":"query-block","arguments":{"device":"virtio0"}}"#
        );
    }

    #[test]
    fn test_missing_clock_falls_back_to_now() {
        let before = Utc::now();
        let t = event_time(-1, -1);
        assert!(t >= before);
    }
}
