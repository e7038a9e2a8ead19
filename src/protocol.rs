//! Converse wire protocol
//!
//! Requests and responses travel as JSON text frames with camelCase keys. Byte
//! payloads (audio, continuation tokens) are base64 encoded.

use crate::audio::AudioFrame;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Serde adapter for base64-encoded byte fields
mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Audio encoding; only LINEAR16 is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    Linear16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hertz: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hertz: u32,
    pub volume_percentage: u8,
}

/// Context marker returned by a previous turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseState {
    #[serde(with = "b64")]
    pub conversation_state: Vec<u8>,
}

/// The first request of every turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseConfig {
    pub audio_in_config: AudioInConfig,
    pub audio_out_config: AudioOutConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converse_state: Option<ConverseState>,
}

/// Client -> service messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Config(ConverseConfig),
    AudioChunk(AudioFrame),
}

impl OutboundMessage {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Wire representation of this message.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Config(config) => json!({ "config": config }),
            Self::AudioChunk(frame) => json!({
                "audioIn": general_purpose::STANDARD.encode(&frame.data)
            }),
        }
    }
}

/// Summary without audio payload, for logs
impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(config) => write!(
                f,
                "config (in {} Hz, out {} Hz @ {}%, continuation: {})",
                config.audio_in_config.sample_rate_hertz,
                config.audio_out_config.sample_rate_hertz,
                config.audio_out_config.volume_percentage,
                config
                    .converse_state
                    .as_ref()
                    .map_or(0, |s| s.conversation_state.len())
            ),
            Self::AudioChunk(frame) => write!(f, "audio_in ({} bytes)", frame.len()),
        }
    }
}

/// gRPC-style status codes carried in the response error field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Code {
    #[default]
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    /// A code this client does not know about
    Other(i32),
}

impl From<i32> for Code {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            other => Self::Other(other),
        }
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> Self {
        match code {
            Code::Ok => 0,
            Code::Cancelled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
            Code::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EndOfUtterance,
    #[default]
    #[serde(other)]
    EventTypeUnspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicrophoneMode {
    CloseMicrophone,
    DialogFollowOn,
    /// Also stands in for modes this client does not know
    #[default]
    #[serde(other)]
    MicrophoneModeUnspecified,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioOut {
    #[serde(with = "b64")]
    pub audio_data: Vec<u8>,
}

/// Recognition and dialog results for the turn
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConverseResult {
    pub spoken_request_text: String,
    pub spoken_response_text: String,
    #[serde(with = "b64")]
    pub conversation_state: Vec<u8>,
    pub microphone_mode: MicrophoneMode,
    pub volume_percentage: i32,
}

/// Service -> client message; every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_out: Option<AudioOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConverseResult>,
}

impl InboundMessage {
    pub fn end_of_utterance() -> Self {
        Self {
            event_type: EventType::EndOfUtterance,
            ..Default::default()
        }
    }

    pub fn audio(data: impl Into<Vec<u8>>) -> Self {
        Self {
            audio_out: Some(AudioOut {
                audio_data: data.into(),
            }),
            ..Default::default()
        }
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self {
            error: Some(Status {
                code,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn result(result: ConverseResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    /// The error status, if it is not OK
    pub fn failure(&self) -> Option<&Status> {
        self.error.as_ref().filter(|status| !status.is_ok())
    }

    pub fn audio_data(&self) -> &[u8] {
        self.audio_out
            .as_ref()
            .map_or(&[][..], |a| a.audio_data.as_slice())
    }

    pub fn spoken_request_text(&self) -> Option<&str> {
        self.result
            .as_ref()
            .map(|r| r.spoken_request_text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn spoken_response_text(&self) -> Option<&str> {
        self.result
            .as_ref()
            .map(|r| r.spoken_response_text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn conversation_state(&self) -> Option<&[u8]> {
        self.result
            .as_ref()
            .map(|r| r.conversation_state.as_slice())
            .filter(|t| !t.is_empty())
    }

    /// Requested volume clamped to 1..=100; zero or negative means no change
    pub fn volume_percentage(&self) -> Option<u8> {
        self.result
            .as_ref()
            .map(|r| r.volume_percentage)
            .filter(|v| *v > 0)
            .map(|v| v.min(100) as u8)
    }

    pub fn microphone_mode(&self) -> MicrophoneMode {
        self.result
            .as_ref()
            .map_or(MicrophoneMode::MicrophoneModeUnspecified, |r| r.microphone_mode)
    }
}

/// Summary without audio payload, for logs
impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(status) = &self.error {
            parts.push(format!("error {:?}: {}", status.code, status.message));
        }
        if self.event_type != EventType::EventTypeUnspecified {
            parts.push(format!("event {:?}", self.event_type));
        }
        if let Some(text) = self.spoken_request_text() {
            parts.push(format!("request {:?}", text));
        }
        if let Some(text) = self.spoken_response_text() {
            parts.push(format!("response {:?}", text));
        }
        if let Some(token) = self.conversation_state() {
            parts.push(format!("conversation_state ({} bytes)", token.len()));
        }
        if let Some(volume) = self.volume_percentage() {
            parts.push(format!("volume {}%", volume));
        }
        if self.microphone_mode() != MicrophoneMode::MicrophoneModeUnspecified {
            parts.push(format!("microphone {:?}", self.microphone_mode()));
        }
        if !self.audio_data().is_empty() {
            parts.push(format!("audio_data ({} bytes)", self.audio_data().len()));
        }
        if parts.is_empty() {
            write!(f, "(empty)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}
