//! rhoconverse - voice conversation client
//!
//! Captures microphone audio, streams it to a conversation service over one
//! duplex call per turn, plays the spoken response and keeps the conversation
//! going while the service asks for a follow-on query.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod protocol;
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod recorder;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod wav;
pub mod ws_client;

#[cfg(test)]
mod test_support;

pub use audio::{AudioChannel, AudioError, AudioFormat, AudioFrame, AudioSink, AudioSource};
pub use config::Config;
pub use error::{Result, SessionError};
pub use events::{ConversationEvent, ConversationSummary};
pub use interpreter::{ResponseInterpreter, SideEffect, TurnVerdict};
pub use session::{ConversationSession, TurnReport};
pub use state::ConversationState;
pub use supervisor::SessionSupervisor;
pub use transport::{Transport, TransportError};
pub use ws_client::WsTransport;
