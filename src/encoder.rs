//! Request encoder - turns captured audio into the outbound request stream

use crate::audio::{AudioChannel, AudioError, FrameStream};
use crate::protocol::{
    AudioEncoding, AudioInConfig, AudioOutConfig, ConverseConfig, ConverseState,
    OutboundMessage,
};
use crate::state::ConversationState;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::oneshot;
use tracing::debug;

/// Outbound stream handed to the transport
pub type OutboundStream = BoxStream<'static, OutboundMessage>;

/// Resolves once the transport has pulled the last request.
///
/// Carries the number of audio chunks sent, or the capture error that cut the
/// stream short. A dropped sender means the transport abandoned the stream.
pub type Completion = oneshot::Receiver<Result<usize, AudioError>>;

/// One turn's request: the message stream and its drain signal
pub struct EncodedRequest {
    pub messages: OutboundStream,
    pub completion: Completion,
}

/// Builds the request stream for a turn
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestEncoder;

impl RequestEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Build the config message from the channel format and the carried state.
    pub fn config(&self, state: &ConversationState, channel: &AudioChannel) -> ConverseConfig {
        let converse_state = state.has_continuation().then(|| {
            debug!(
                "Sending conversation state ({} bytes)",
                state.continuation_token().len()
            );
            ConverseState {
                conversation_state: state.continuation_token().to_vec(),
            }
        });

        ConverseConfig {
            audio_in_config: AudioInConfig {
                encoding: AudioEncoding::Linear16,
                sample_rate_hertz: channel.sample_rate(),
            },
            audio_out_config: AudioOutConfig {
                encoding: AudioEncoding::Linear16,
                sample_rate_hertz: channel.sample_rate(),
                volume_percentage: channel.volume_percent(),
            },
            converse_state,
        }
    }

    /// Encode one turn: a config message, then one audio chunk per captured frame.
    ///
    /// Capture must already be running. The stream is lazy and ends when the
    /// capture ends; each call takes a fresh set of frames.
    pub fn encode(
        &self,
        state: &ConversationState,
        channel: &AudioChannel,
    ) -> Result<EncodedRequest, AudioError> {
        let config = OutboundMessage::Config(self.config(state, channel));
        let frames = channel.produce_frames()?;
        let (done, completion) = oneshot::channel();

        let audio = stream::unfold(Pump::new(frames, done), |mut pump| async move {
            match pump.frames.next().await {
                Some(Ok(frame)) => {
                    pump.sent += 1;
                    Some((OutboundMessage::AudioChunk(frame), pump))
                }
                Some(Err(e)) => {
                    pump.finish(Err(e));
                    None
                }
                None => {
                    let sent = pump.sent;
                    pump.finish(Ok(sent));
                    None
                }
            }
        });

        Ok(EncodedRequest {
            messages: stream::once(async move { config }).chain(audio).boxed(),
            completion,
        })
    }
}

struct Pump {
    frames: FrameStream,
    done: Option<oneshot::Sender<Result<usize, AudioError>>>,
    sent: usize,
}

impl Pump {
    fn new(frames: FrameStream, done: oneshot::Sender<Result<usize, AudioError>>) -> Self {
        Self {
            frames,
            done: Some(done),
            sent: 0,
        }
    }

    fn finish(&mut self, result: Result<usize, AudioError>) {
        if let Some(done) = self.done.take() {
            debug!("Request stream drained after {} audio chunks", self.sent);
            let _ = done.send(result);
        }
    }
}
