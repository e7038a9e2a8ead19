//! Response interpreter - maps each inbound message to ordered side effects

use crate::protocol::{Code, EventType, InboundMessage, MicrophoneMode};
use crate::state::ConversationState;
use smallvec::SmallVec;
use tracing::{debug, info};

/// Whether the microphone reopens after this turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnVerdict {
    Continue,
    #[default]
    Stop,
}

/// Instructions for the session, in the order they must be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    FatalError { code: Code, message: String },
    StopCapture,
    LogTranscript(String),
    PlayAudio(Vec<u8>),
    LogNoAudibleResponse,
    LogTtsTranscript(String),
}

pub type SideEffects = SmallVec<[SideEffect; 4]>;

/// Per-turn interpreter; create a fresh one for every turn
#[derive(Debug, Default)]
pub struct ResponseInterpreter {
    pending: TurnVerdict,
    halted: bool,
    messages: usize,
}

impl ResponseInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verdict so far: the last non-unspecified microphone mode, else `Stop`
    pub fn verdict(&self) -> TurnVerdict {
        self.pending
    }

    /// True once a fatal error was seen; later messages are ignored
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn messages_seen(&self) -> usize {
        self.messages
    }

    /// Apply one inbound message to the conversation state and return its
    /// side effects.
    pub fn interpret(
        &mut self,
        message: &InboundMessage,
        state: &mut ConversationState,
    ) -> SideEffects {
        let mut effects = SideEffects::new();
        if self.halted {
            debug!("Ignoring message after fatal error: {}", message);
            return effects;
        }
        self.messages += 1;

        if let Some(status) = message.failure() {
            self.halted = true;
            effects.push(SideEffect::FatalError {
                code: status.code,
                message: status.message.clone(),
            });
            return effects;
        }

        if message.event_type == EventType::EndOfUtterance {
            effects.push(SideEffect::StopCapture);
        }

        if let Some(text) = message.spoken_request_text() {
            effects.push(SideEffect::LogTranscript(text.to_string()));
        }

        let audio = message.audio_data();
        if !audio.is_empty() {
            effects.push(SideEffect::PlayAudio(audio.to_vec()));
        } else if !has_signal(message) {
            effects.push(SideEffect::LogNoAudibleResponse);
        }

        if let Some(text) = message.spoken_response_text() {
            effects.push(SideEffect::LogTtsTranscript(text.to_string()));
        }

        if let Some(token) = message.conversation_state() {
            debug!("Updated conversation state ({} bytes)", token.len());
            state.replace_continuation(token.to_vec());
        }

        if let Some(volume) = message.volume_percentage() {
            state.set_volume_percent(volume);
        }

        match message.microphone_mode() {
            MicrophoneMode::DialogFollowOn => {
                info!("Expecting follow-on query from user");
                self.pending = TurnVerdict::Continue;
            }
            MicrophoneMode::CloseMicrophone => {
                self.pending = TurnVerdict::Stop;
            }
            MicrophoneMode::MicrophoneModeUnspecified => {}
        }

        effects
    }
}

/// Whether anything besides audio carries meaning in this message
fn has_signal(message: &InboundMessage) -> bool {
    message.failure().is_some()
        || message.event_type != EventType::EventTypeUnspecified
        || message.spoken_request_text().is_some()
        || message.spoken_response_text().is_some()
        || message.conversation_state().is_some()
        || message.volume_percentage().is_some()
        || message.microphone_mode() != MicrophoneMode::MicrophoneModeUnspecified
}
