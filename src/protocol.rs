// ABOUTME: Wire protocol definitions for the console WebSocket channels
// JSON frames with a discriminating `type` field, shared by every channel kind

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectionError;

// ============================================
// Frames
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    // Bidirectional handshake
    Auth { payload: AuthPayload },
    Subscribe { payload: SubscribePayload },

    // Server → client streams
    Data { payload: Value },
    Logs { payload: Value },
    Event { payload: Value },
    Output { payload: OutputPayload },
    Complete { payload: CompletePayload },
    Error { payload: ErrorPayload },

    // Client → server terminal traffic
    Input { data: String },
    Resize { payload: ResizePayload },

    // Liveness
    Ping,
    Pong,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Sub-channel filter on the events socket (`vm-events`, `container-events`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

// ============================================
// Frame kinds (router filters)
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Auth,
    Subscribe,
    Data,
    Logs,
    Event,
    Output,
    Complete,
    Error,
    Input,
    Resize,
    Ping,
    Pong,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Auth { .. } => FrameKind::Auth,
            Frame::Subscribe { .. } => FrameKind::Subscribe,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Logs { .. } => FrameKind::Logs,
            Frame::Event { .. } => FrameKind::Event,
            Frame::Output { .. } => FrameKind::Output,
            Frame::Complete { .. } => FrameKind::Complete,
            Frame::Error { .. } => FrameKind::Error,
            Frame::Input { .. } => FrameKind::Input,
            Frame::Resize { .. } => FrameKind::Resize,
            Frame::Ping => FrameKind::Ping,
            Frame::Pong => FrameKind::Pong,
        }
    }
}

// ============================================
// Parsing
// ============================================

impl Frame {
    /// Parse a raw text frame.
    ///
    /// Error frames appear on the wire in two legacy shapes,
    /// `{"type":"error","error":"..."}` and
    /// `{"type":"error","payload":{"message":"..."}}`. Both are accepted here
    /// and mapped into the canonical `Frame::Error`; nothing downstream sees
    /// the legacy field.
    pub fn parse(text: &str) -> Result<Frame, ConnectionError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        if value.get("type").and_then(Value::as_str) == Some("error") {
            let message = value
                .get("payload")
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .or_else(|| value.get("error").and_then(Value::as_str))
                .unwrap_or("unknown error")
                .to_string();
            return Ok(Frame::error(message));
        }

        serde_json::from_value(value).map_err(|e| ConnectionError::Protocol(e.to_string()))
    }

    pub fn to_text(&self) -> String {
        // Serialization of these shapes cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================
// Constructor helpers
// ============================================

impl Frame {
    /// Client-side auth frame carrying the session token.
    pub fn auth_token(token: impl Into<String>) -> Self {
        Frame::Auth {
            payload: AuthPayload {
                token: Some(token.into()),
                ..AuthPayload::default()
            },
        }
    }

    /// Bare subscribe frame (shared channels with no filter).
    pub fn subscribe() -> Self {
        Frame::Subscribe {
            payload: SubscribePayload::default(),
        }
    }

    /// Subscribe frame filtered to one events sub-channel.
    pub fn subscribe_channel(channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            payload: SubscribePayload {
                channel: Some(channel.into()),
                ..SubscribePayload::default()
            },
        }
    }

    /// Terminal subscribe handshake carrying the initial geometry.
    pub fn subscribe_terminal(cols: u16, rows: u16, shell: impl Into<String>) -> Self {
        Frame::Subscribe {
            payload: SubscribePayload {
                cols: Some(cols),
                rows: Some(rows),
                shell: Some(shell.into()),
                ..SubscribePayload::default()
            },
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Frame::Input { data: data.into() }
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        Frame::Resize {
            payload: ResizePayload { cols, rows },
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Frame::Output {
            payload: OutputPayload { data: data.into() },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }
}

// Type guards for pattern matching
impl Frame {
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Frame::Output { .. })
    }

    /// Server auth verdict, if this frame carries one.
    pub fn auth_verdict(&self) -> Option<bool> {
        match self {
            Frame::Auth { payload } => payload.authenticated,
            _ => None,
        }
    }
}
