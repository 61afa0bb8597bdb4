use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::seeds::KnowledgeSeed;

/// Wire shape of one frame: `{"tag": "...", "content": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFrame {
    pub tag: String,
    #[serde(default)]
    pub content: Value,
}

/// One decoded unit of the query protocol.
///
/// The backend uses the `final` tag for two different things: an
/// incremental delta on the streaming endpoint and the whole answer on the
/// non-streaming one. They are separate variants so the dispatcher can never
/// confuse append with replace.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// The backend is locating sources.
    Searching,
    /// Replaces the session's citation list.
    Seeds(Vec<KnowledgeSeed>),
    /// Streaming `final`: appended to the response.
    AnswerDelta(String),
    /// Non-streaming `final`: replaces the response.
    AnswerComplete(String),
    /// Any tag this client does not know. Matched and ignored.
    Unknown { tag: String },
}

impl Frame {
    /// Interpret a frame read from the streaming endpoint.
    pub fn from_stream_value(value: Value) -> Result<Self, ProtocolError> {
        let raw = parse_raw(value)?;
        match raw.tag.as_str() {
            "searching" => Ok(Self::Searching),
            "seeds" => parse_seeds(raw.content).map(Self::Seeds),
            "final" => expect_text("final", raw.content).map(Self::AnswerDelta),
            _ => Ok(Self::Unknown { tag: raw.tag }),
        }
    }

    /// Interpret the single object returned by the non-streaming endpoint.
    pub fn from_complete_value(value: Value) -> Result<Self, ProtocolError> {
        let raw = parse_raw(value)?;
        match raw.tag.as_str() {
            "final" => expect_text("final", raw.content).map(Self::AnswerComplete),
            _ => Err(ProtocolError::UnexpectedTag(raw.tag)),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Searching => "searching",
            Self::Seeds(_) => "seeds",
            Self::AnswerDelta(_) | Self::AnswerComplete(_) => "final",
            Self::Unknown { tag } => tag,
        }
    }
}

fn parse_raw(value: Value) -> Result<RawFrame, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

fn parse_seeds(content: Value) -> Result<Vec<KnowledgeSeed>, ProtocolError> {
    if content.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(content).map_err(|e| ProtocolError::InvalidPayload {
        tag: "seeds".into(),
        reason: e.to_string(),
    })
}

fn expect_text(tag: &str, content: Value) -> Result<String, ProtocolError> {
    match content {
        Value::String(text) => Ok(text),
        Value::Null => Ok(String::new()),
        other => Err(ProtocolError::InvalidPayload {
            tag: tag.into(),
            reason: format!("expected a string, got {other}"),
        }),
    }
}
