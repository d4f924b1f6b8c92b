//! Wire events exchanged between a terminal client and the berth server.
//!
//! A connection carries two kinds of frames:
//!
//! - **Text frames** hold JSON control events shaped as
//!   `{"event": "<name>", "data": <payload>}`.
//! - **Binary frames** hold raw terminal bytes. Client binary frames are
//!   keystrokes (`stdin`); server binary frames are pty output (`stdout`).
//!
//! Raw output is only ever sent as binary frames and status narration only
//! ever as `stdinfo` text frames, so clients can tell terminal content apart
//! from system messages without inspecting payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The text frame was not a recognised JSON event.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Identity carried by `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub uid: String,
}

/// Payload of the `init` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub user: UserRef,
    /// Lesson path, e.g. `intro`.
    pub path: String,
    /// Explicit lesson type. When absent the server resolves it from the path.
    #[serde(default, rename = "lessonType", skip_serializing_if = "Option::is_none")]
    pub lesson_type: Option<String>,
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Bind the connection to a user and lesson.
    Init(InitPayload),
    /// Ask the server to provision and attach a terminal.
    Ready,
    /// Keystrokes for the pty, verbatim.
    Stdin(Bytes),
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ClientEventJson {
    Init(InitPayload),
    Ready,
    Stdin(String),
}

impl ClientEvent {
    /// Decode a client frame.
    pub fn decode(frame: Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Binary(bytes) => Ok(ClientEvent::Stdin(bytes)),
            Frame::Text(text) => {
                let event = match serde_json::from_str::<ClientEventJson>(&text)? {
                    ClientEventJson::Init(payload) => ClientEvent::Init(payload),
                    ClientEventJson::Ready => ClientEvent::Ready,
                    ClientEventJson::Stdin(data) => ClientEvent::Stdin(Bytes::from(data)),
                };
                Ok(event)
            }
        }
    }

    /// Encode a client event. Keystrokes are sent as a binary frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        let json = match self {
            ClientEvent::Stdin(bytes) => return Ok(Frame::Binary(bytes.clone())),
            ClientEvent::Init(payload) => ClientEventJson::Init(payload.clone()),
            ClientEvent::Ready => ClientEventJson::Ready,
        };
        Ok(Frame::Text(serde_json::to_string(&json)?))
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A formatted lifecycle status line.
    Stdinfo(String),
    /// Raw pty output, verbatim.
    Stdout(Bytes),
    /// This connection has been superseded by a newer one for the same user.
    NewSession { notice: String },
    /// A connection-scoped error.
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ServerEventJson {
    Stdinfo(String),
    NewSession { notice: String },
    Error { message: String },
}

impl ServerEvent {
    /// Build a status line event. Lines are terminated with `\r\n` so they
    /// render on their own row in a raw-mode terminal.
    pub fn status(message: impl AsRef<str>) -> Self {
        ServerEvent::Stdinfo(format!("{}\r\n", message.as_ref()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Encode a server event. `stdout` is always a binary frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        let json = match self {
            ServerEvent::Stdout(bytes) => return Ok(Frame::Binary(bytes.clone())),
            ServerEvent::Stdinfo(line) => ServerEventJson::Stdinfo(line.clone()),
            ServerEvent::NewSession { notice } => ServerEventJson::NewSession {
                notice: notice.clone(),
            },
            ServerEvent::Error { message } => ServerEventJson::Error {
                message: message.clone(),
            },
        };
        Ok(Frame::Text(serde_json::to_string(&json)?))
    }

    /// Decode a server frame (used by clients and tests).
    pub fn decode(frame: Frame) -> Result<Self, ProtocolError> {
        match frame {
            Frame::Binary(bytes) => Ok(ServerEvent::Stdout(bytes)),
            Frame::Text(text) => {
                let event = match serde_json::from_str::<ServerEventJson>(&text)? {
                    ServerEventJson::Stdinfo(line) => ServerEvent::Stdinfo(line),
                    ServerEventJson::NewSession { notice } => ServerEvent::NewSession { notice },
                    ServerEventJson::Error { message } => ServerEvent::Error { message },
                };
                Ok(event)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_init_with_lesson_type() {
        let frame = Frame::Text(
            r#"{"event":"init","data":{"user":{"uid":"u1"},"path":"intro","lessonType":"nodejs"}}"#
                .to_string(),
        );
        let event = ClientEvent::decode(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::Init(InitPayload {
                user: UserRef {
                    uid: "u1".to_string()
                },
                path: "intro".to_string(),
                lesson_type: Some("nodejs".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_init_without_lesson_type() {
        let frame =
            Frame::Text(r#"{"event":"init","data":{"user":{"uid":"u1"},"path":"intro"}}"#.into());
        match ClientEvent::decode(frame).unwrap() {
            ClientEvent::Init(payload) => assert!(payload.lesson_type.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_ready() {
        let event = ClientEvent::decode(Frame::Text(r#"{"event":"ready"}"#.into())).unwrap();
        assert_eq!(event, ClientEvent::Ready);
    }

    #[test]
    fn test_binary_frames_are_stdin() {
        let raw = Bytes::from_static(b"\x1b[A\x00\xff");
        let event = ClientEvent::decode(Frame::Binary(raw.clone())).unwrap();
        assert_eq!(event, ClientEvent::Stdin(raw));
    }

    #[test]
    fn test_text_stdin_is_accepted() {
        let event =
            ClientEvent::decode(Frame::Text(r#"{"event":"stdin","data":"ls\r"}"#.into())).unwrap();
        assert_eq!(event, ClientEvent::Stdin(Bytes::from_static(b"ls\r")));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = ClientEvent::decode(Frame::Text(r#"{"event":"reboot"}"#.into()));
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_stdout_never_encodes_as_text() {
        let frame = ServerEvent::Stdout(Bytes::from_static(b"{\"event\":\"stdinfo\"}"))
            .encode()
            .unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
    }

    #[test]
    fn test_status_line_format() {
        let frame = ServerEvent::status("Connected.").encode().unwrap();
        assert_eq!(
            frame,
            Frame::Text(r#"{"event":"stdinfo","data":"Connected.\r\n"}"#.to_string())
        );
    }

    #[test]
    fn test_new_session_event_name() {
        let frame = ServerEvent::NewSession {
            notice: "superseded".to_string(),
        }
        .encode()
        .unwrap();
        match frame {
            Frame::Text(text) => assert!(text.contains(r#""event":"new-session""#)),
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }
}
