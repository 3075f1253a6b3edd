use std::{fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::clock::Timestamp;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Opaque identifier a client registers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        id: ClientId,
    },
    Heartbeat {
        id: ClientId,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    Release {
        id: ClientId,
    },
    Disconnect {
        id: ClientId,
    },
    CheckOwnership {
        id: ClientId,
    },
}

impl ClientMessage {
    /// Validates one inbound payload.
    ///
    /// Clients are loosely typed, so decoding goes through an untyped shape
    /// first: numeric ids are accepted, and a heartbeat timestamp that is
    /// not a number is treated as absent rather than rejecting the message.
    /// Negative timestamps clamp to zero.
    pub fn decode(line: &str) -> Result<Self, MalformedMessage> {
        let raw: RawClientMessage = serde_json::from_str(line)
            .map_err(|err| MalformedMessage::InvalidJson(err.to_string()))?;
        let kind = raw.kind.ok_or(MalformedMessage::MissingKind)?;
        let id = raw.id.as_ref();

        match kind.as_str() {
            "register" => Ok(ClientMessage::Register {
                id: required_id(id, &kind)?,
            }),
            "heartbeat" => Ok(ClientMessage::Heartbeat {
                id: required_id(id, &kind)?,
                timestamp: raw.timestamp.as_ref().and_then(timestamp_from_value),
            }),
            "release" => Ok(ClientMessage::Release {
                id: required_id(id, &kind)?,
            }),
            "disconnect" => Ok(ClientMessage::Disconnect {
                id: required_id(id, &kind)?,
            }),
            "check-ownership" => Ok(ClientMessage::CheckOwnership {
                id: required_id(id, &kind)?,
            }),
            other => Err(MalformedMessage::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<Value>,
    timestamp: Option<Value>,
}

fn required_id(value: Option<&Value>, kind: &str) -> Result<ClientId, MalformedMessage> {
    let id = match value {
        Some(Value::String(id)) if !id.is_empty() => Some(ClientId::new(id.as_str())),
        Some(Value::Number(id)) => Some(ClientId::new(id.to_string())),
        _ => None,
    };
    id.ok_or_else(|| MalformedMessage::MissingId {
        kind: kind.to_string(),
    })
}

fn timestamp_from_value(value: &Value) -> Option<Timestamp> {
    let Value::Number(number) = value else {
        return None;
    };
    // Anything before the epoch clamps to it, which can never move
    // `last_seen` forward.
    number
        .as_u64()
        .or_else(|| number.as_f64().map(|millis| millis.max(0.0) as Timestamp))
}

/// Why an inbound payload was dropped at the boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("payload is not a JSON message: {0}")]
    InvalidJson(String),
    #[error("message has no type")]
    MissingKind,
    #[error("unrecognized message type '{0}'")]
    UnknownKind(String),
    #[error("'{kind}' message has no client id")]
    MissingId { kind: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    OwnershipGranted { is_owner: bool, owner_id: ClientId },
    #[serde(rename_all = "camelCase")]
    OwnershipDenied { is_owner: bool, owner_id: ClientId },
    #[serde(rename_all = "camelCase")]
    OwnershipStatus {
        is_owner: bool,
        owner_id: Option<ClientId>,
    },
    HeartbeatRequest,
}

impl ServerMessage {
    pub fn granted(owner: &ClientId) -> Self {
        ServerMessage::OwnershipGranted {
            is_owner: true,
            owner_id: owner.clone(),
        }
    }

    pub fn denied(owner: &ClientId) -> Self {
        ServerMessage::OwnershipDenied {
            is_owner: false,
            owner_id: owner.clone(),
        }
    }

    /// Ownership status as seen by `recipient`.
    pub fn status(recipient: &ClientId, owner: Option<&ClientId>) -> Self {
        ServerMessage::OwnershipStatus {
            is_owner: owner == Some(recipient),
            owner_id: owner.cloned(),
        }
    }
}

/// Line-delimited reader for one side of a link.
///
/// Partial lines stay buffered between calls, so [`FrameReader::next_frame`]
/// can be raced against other branches in a `select!` without losing data.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Next non-blank line without its line ending, or `None` at end of
    /// stream. Invalid UTF-8 is replaced rather than failing the link; the
    /// line then simply fails to decode.
    pub async fn next_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            let bytes = self.reader.read_until(b'\n', &mut self.buffer).await?;
            if bytes == 0 && self.buffer.is_empty() {
                return Ok(None);
            }

            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim_end_matches(LINE_ENDINGS);
            if trimmed.trim().is_empty() {
                continue;
            }

            return Ok(Some(trimmed.to_string()));
        }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_heartbeat_with_timestamp() {
        let message = ClientMessage::decode(r#"{"type":"heartbeat","id":"tab-1","timestamp":1700000000000}"#)
            .expect("valid heartbeat");
        assert_eq!(
            message,
            ClientMessage::Heartbeat {
                id: "tab-1".into(),
                timestamp: Some(1_700_000_000_000),
            }
        );
    }

    #[test]
    fn non_numeric_timestamp_is_treated_as_absent() {
        let message = ClientMessage::decode(r#"{"type":"heartbeat","id":"a","timestamp":"soon"}"#)
            .expect("heartbeat still accepted");
        assert_eq!(
            message,
            ClientMessage::Heartbeat {
                id: "a".into(),
                timestamp: None,
            }
        );
    }

    #[test]
    fn negative_and_fractional_timestamps_clamp() {
        let negative = ClientMessage::decode(r#"{"type":"heartbeat","id":"a","timestamp":-250}"#)
            .expect("heartbeat still accepted");
        assert_eq!(
            negative,
            ClientMessage::Heartbeat {
                id: "a".into(),
                timestamp: Some(0),
            }
        );

        let fractional = ClientMessage::decode(r#"{"type":"heartbeat","id":"a","timestamp":1500.7}"#)
            .expect("heartbeat still accepted");
        assert_eq!(
            fractional,
            ClientMessage::Heartbeat {
                id: "a".into(),
                timestamp: Some(1_500),
            }
        );
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let message = ClientMessage::decode(r#"{"type":"register","id":7}"#).expect("register");
        assert_eq!(message, ClientMessage::Register { id: "7".into() });
    }

    #[test]
    fn rejects_missing_or_empty_id() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"release"}"#),
            Err(MalformedMessage::MissingId {
                kind: "release".into()
            })
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"register","id":""}"#),
            Err(MalformedMessage::MissingId {
                kind: "register".into()
            })
        );
    }

    #[test]
    fn rejects_unknown_kind_before_checking_id() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"takeover"}"#),
            Err(MalformedMessage::UnknownKind("takeover".into()))
        );
        assert_eq!(
            ClientMessage::decode(r#"{"id":"a"}"#),
            Err(MalformedMessage::MissingKind)
        );
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(MalformedMessage::InvalidJson(_))
        ));
    }

    #[test]
    fn server_messages_use_camel_case_fields() {
        let granted = serde_json::to_value(ServerMessage::granted(&"a".into())).expect("encode");
        assert_eq!(
            granted,
            serde_json::json!({"type": "ownership-granted", "isOwner": true, "ownerId": "a"})
        );

        let leaderless = serde_json::to_value(ServerMessage::status(&"a".into(), None)).expect("encode");
        assert_eq!(
            leaderless,
            serde_json::json!({"type": "ownership-status", "isOwner": false, "ownerId": null})
        );

        let probe = serde_json::to_value(ServerMessage::HeartbeatRequest).expect("encode");
        assert_eq!(probe, serde_json::json!({"type": "heartbeat-request"}));
    }

    #[tokio::test]
    async fn client_messages_survive_line_framing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut frames = FrameReader::new(tokio::io::BufReader::new(reader));
        let message = ClientMessage::CheckOwnership { id: "tab-9".into() };

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        let line = frames
            .next_frame()
            .await
            .expect("read frame")
            .expect("expected a frame");

        assert_eq!(ClientMessage::decode(&line), Ok(message));
    }

    #[tokio::test]
    async fn partial_line_survives_a_cancelled_read() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut frames = FrameReader::new(tokio::io::BufReader::new(reader));

        writer.write_all(b"\r\n{\"type\":\"rel").await.expect("write");
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), frames.next_frame()).await;
        assert!(pending.is_err(), "half a line is not a frame");

        writer.write_all(b"ease\",\"id\":\"a\"}\n").await.expect("write");
        let line = frames
            .next_frame()
            .await
            .expect("read frame")
            .expect("expected a frame");
        assert_eq!(line, r#"{"type":"release","id":"a"}"#);

        drop(writer);
        assert_eq!(frames.next_frame().await.expect("read frame"), None);
    }
}
