//! Errors that end a conversation turn

use crate::audio::AudioError;
use crate::protocol::Code;
use crate::transport::TransportError;
use thiserror::Error;

/// Why a turn failed.
///
/// Transport errors never carry an application status; service-side failures
/// arrive as [`SessionError::Application`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Service error {code:?}: {message}")]
    Application { code: Code, message: String },

    #[error("Audio error: {0}")]
    AudioIo(#[from] AudioError),

    #[error("Conversation task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
