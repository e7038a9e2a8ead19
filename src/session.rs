//! One conversation turn: capture, stream, interpret, play
//!
//! The session drives a single duplex call. Capture starts immediately and the
//! encoder streams frames while responses are interpreted one by one. Audio from
//! the service is held back until the request stream has fully drained, then
//! played in arrival order.
//!
//! ```text
//! Idle -> Recording -> Uttered -> Playing -> Done
//! ```

use crate::audio::{AudioChannel, AudioError, AudioFrame};
use crate::encoder::RequestEncoder;
use crate::error::SessionError;
use crate::interpreter::{ResponseInterpreter, SideEffect, TurnVerdict};
use crate::recorder::TurnRecording;
use crate::state::ConversationState;
use crate::transport::Transport;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Recording,
    Uttered,
    Playing,
    Done,
}

/// Outcome of a completed turn
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub verdict: TurnVerdict,
    /// Side effects in the order they were applied
    pub effects: Vec<SideEffect>,
    pub frames_sent: usize,
}

/// Runs one turn against a transport and an audio channel
pub struct ConversationSession<T: Transport + ?Sized> {
    transport: Arc<T>,
    channel: Arc<AudioChannel>,
    deadline: Duration,
    turn: usize,
    phase: TurnPhase,
    recording: Option<TurnRecording>,
    queued: VecDeque<Vec<u8>>,
    effects: Vec<SideEffect>,
}

/// Stops capture and detaches playback if the turn is dropped mid-flight
struct TeardownGuard {
    channel: Arc<AudioChannel>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.channel.abort();
    }
}

impl<T: Transport + ?Sized> ConversationSession<T> {
    pub fn new(transport: Arc<T>, channel: Arc<AudioChannel>, deadline: Duration) -> Self {
        Self {
            transport,
            channel,
            deadline,
            turn: 1,
            phase: TurnPhase::Idle,
            recording: None,
            queued: VecDeque::new(),
            effects: Vec::new(),
        }
    }

    /// Number used in logs
    pub fn with_turn(mut self, turn: usize) -> Self {
        self.turn = turn;
        self
    }

    pub fn with_recording(mut self, recording: Option<TurnRecording>) -> Self {
        self.recording = recording;
        self
    }

    /// Run the turn to completion, updating `state` in place.
    ///
    /// Capture and playback are always stopped before this returns, on success
    /// and on failure.
    pub async fn run(mut self, state: &mut ConversationState) -> Result<TurnReport, SessionError> {
        let _guard = TeardownGuard {
            channel: self.channel.clone(),
        };

        let result = self.drive(state).await;
        if let Err(e) = &result {
            error!("Turn {} failed: {}", self.turn, e);
            self.teardown().await;
        }
        self.transition(TurnPhase::Done);

        if let Some(recording) = self.recording.take() {
            recording.finish();
        }
        result
    }

    async fn drive(&mut self, state: &mut ConversationState) -> Result<TurnReport, SessionError> {
        self.channel.set_volume_percent(state.volume_percent());
        self.channel.begin_capture()?;
        self.transition(TurnPhase::Recording);

        let request = RequestEncoder::new().encode(state, &self.channel)?;
        let mut messages = request.messages;
        if let Some(recording) = &self.recording {
            messages = messages.inspect(recording.request_tap()).boxed();
        }
        let mut completion = request.completion;
        let mut inbound = self.transport.converse(messages, self.deadline).await?;

        let mut interpreter = ResponseInterpreter::new();
        let mut frames_sent = None;
        loop {
            tokio::select! {
                biased;

                drained = &mut completion, if frames_sent.is_none() => {
                    frames_sent = Some(self.on_drained(drained).await?);
                }

                next = inbound.next() => match next {
                    Some(Ok(message)) => {
                        debug!("Turn {} received {}", self.turn, message);
                        let playing = frames_sent.is_some();
                        for effect in interpreter.interpret(&message, state) {
                            self.apply(effect, playing).await?;
                        }
                        self.channel.set_volume_percent(state.volume_percent());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }
        debug!(
            "Turn {} response stream ended after {} messages",
            self.turn,
            interpreter.messages_seen()
        );

        let frames_sent = match frames_sent {
            Some(frames) => frames,
            None => {
                self.end_capture().await?;
                let drained = completion.await;
                self.on_drained(drained).await?
            }
        };

        self.channel.end_playback().await?;

        let verdict = interpreter.verdict();
        info!("Turn {} finished with verdict {:?}", self.turn, verdict);
        Ok(TurnReport {
            verdict,
            effects: std::mem::take(&mut self.effects),
            frames_sent,
        })
    }

    /// The request stream is exhausted: close the microphone and start playback.
    async fn on_drained(
        &mut self,
        drained: Result<Result<usize, AudioError>, RecvError>,
    ) -> Result<usize, SessionError> {
        let frames = match drained {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!("Turn {} request stream was dropped by the transport", self.turn);
                0
            }
        };
        info!("Turn {} sent {} audio frames", self.turn, frames);

        self.end_capture().await?;
        self.begin_playback().await?;
        Ok(frames)
    }

    async fn apply(&mut self, effect: SideEffect, playing: bool) -> Result<(), SessionError> {
        if let Some(recording) = &mut self.recording {
            recording.on_effect(&effect);
        }
        self.effects.push(effect.clone());

        match effect {
            SideEffect::FatalError { code, message } => {
                return Err(SessionError::Application { code, message });
            }
            SideEffect::StopCapture => {
                info!("End of audio request detected");
                self.end_capture().await?;
            }
            SideEffect::LogTranscript(text) => {
                info!("Transcript of user request: \"{}\"", text);
            }
            SideEffect::PlayAudio(pcm) => {
                if playing {
                    self.play(pcm).await?;
                } else {
                    debug!("Queueing {} bytes until the request stream drains", pcm.len());
                    self.queued.push_back(pcm);
                }
            }
            SideEffect::LogNoAudibleResponse => {
                debug!("Response message carried nothing audible");
            }
            SideEffect::LogTtsTranscript(text) => {
                info!("Assistant response text: \"{}\"", text);
            }
        }
        Ok(())
    }

    async fn end_capture(&mut self) -> Result<(), SessionError> {
        stop_capture(&self.channel).await?;
        if self.phase == TurnPhase::Recording {
            self.transition(TurnPhase::Uttered);
        }
        Ok(())
    }

    async fn begin_playback(&mut self) -> Result<(), SessionError> {
        self.channel.begin_playback()?;
        self.transition(TurnPhase::Playing);
        while let Some(pcm) = self.queued.pop_front() {
            self.play(pcm).await?;
        }
        Ok(())
    }

    async fn play(&self, pcm: Vec<u8>) -> Result<(), SessionError> {
        let frame = AudioFrame::new(pcm, self.channel.format());
        self.channel.play(frame).await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Err(e) = stop_capture(&self.channel).await {
            warn!("Failed to stop capture: {}", e);
        }
        if let Err(e) = self.channel.end_playback().await {
            warn!("Failed to stop playback: {}", e);
        }
        self.queued.clear();
    }

    fn transition(&mut self, to: TurnPhase) {
        if self.phase != to {
            info!("Turn {} state transition: {:?} -> {:?}", self.turn, self.phase, to);
            self.phase = to;
        }
    }
}

/// Stops capture on the blocking pool; the source may be mid-read.
async fn stop_capture(channel: &Arc<AudioChannel>) -> Result<(), SessionError> {
    if !channel.is_recording() {
        return Ok(());
    }
    let channel = channel.clone();
    tokio::task::spawn_blocking(move || channel.end_capture())
        .await
        .map_err(|e| SessionError::Task(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Code, ConverseResult, InboundMessage, MicrophoneMode, OutboundMessage};
    use crate::audio::{MemorySink, MemorySource};
    use crate::test_support::{
        memory_channel, test_channel, FailingSink, FailingSource, PullCountingSink, Script,
        ScriptedTransport,
    };
    use crate::transport::TransportError;
    use std::sync::Mutex;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn token_of(request: &[OutboundMessage]) -> Option<Vec<u8>> {
        match &request[0] {
            OutboundMessage::Config(config) => config
                .converse_state
                .as_ref()
                .map(|s| s.conversation_state.clone()),
            other => panic!("First message was not a config: {}", other),
        }
    }

    #[tokio::test]
    async fn test_end_of_utterance_then_response() {
        let (channel, devices) = memory_channel((0u8..12).collect(), 100);
        let transport = ScriptedTransport::new([Script::RespondAfterDrain(vec![
            Ok(InboundMessage::end_of_utterance()),
            Ok(InboundMessage::audio(b"RESPONSE".to_vec())),
        ])]);
        let mut state = ConversationState::new(100);

        let report = ConversationSession::new(transport.clone(), channel.clone(), DEADLINE)
            .run(&mut state)
            .await
            .unwrap();

        assert_eq!(report.verdict, TurnVerdict::Stop);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(
            report.effects,
            vec![
                SideEffect::StopCapture,
                SideEffect::PlayAudio(b"RESPONSE".to_vec())
            ]
        );
        assert_eq!(*devices.played.lock().unwrap(), b"RESPONSE".to_vec());

        let requests = transport.requests();
        assert_eq!(requests[0].len(), 4);
        assert!(requests[0][0].is_config());
        assert!(!channel.is_recording());
        assert!(!channel.is_playing());
    }

    #[tokio::test]
    async fn test_service_error_ends_turn_and_releases_devices() {
        let (channel, devices) = memory_channel(vec![0; 8], 50);
        let transport = ScriptedTransport::new([Script::Respond(vec![
            Ok(InboundMessage::error(Code::Unavailable, "try again later")),
            Ok(InboundMessage::audio(b"ignored!".to_vec())),
        ])]);
        let mut state = ConversationState::new(50);

        let result = ConversationSession::new(transport, channel.clone(), DEADLINE)
            .run(&mut state)
            .await;

        match result {
            Err(SessionError::Application { code, message }) => {
                assert_eq!(code, Code::Unavailable);
                assert_eq!(message, "try again later");
            }
            other => panic!("Expected an application error, got {:?}", other),
        }
        assert_eq!(devices.source.starts(), 1);
        assert_eq!(devices.source.stops(), 1);
        assert_eq!(devices.sink.starts(), devices.sink.stops());
        assert!(devices.played.lock().unwrap().is_empty());
        assert!(!channel.is_recording());
        assert!(!channel.is_playing());
    }

    #[tokio::test]
    async fn test_transport_failure_releases_capture() {
        let (channel, devices) = memory_channel(vec![0; 8], 50);
        let transport = ScriptedTransport::new([Script::Fail(TransportError::Unavailable(
            "connection refused".into(),
        ))]);

        let result = ConversationSession::new(transport, channel.clone(), DEADLINE)
            .run(&mut ConversationState::new(50))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Unavailable(_)))
        ));
        assert_eq!(devices.source.stops(), 1);
        assert!(!channel.is_recording());
    }

    #[tokio::test]
    async fn test_audio_before_drain_is_queued_in_order() {
        let (channel, devices) = memory_channel(vec![0; 8], 100);
        let transport = ScriptedTransport::new([Script::Respond(vec![
            Ok(InboundMessage::audio(vec![1, 2])),
            Ok(InboundMessage::audio(vec![3, 4])),
        ])]);

        let report = ConversationSession::new(transport, channel, DEADLINE)
            .run(&mut ConversationState::new(100))
            .await
            .unwrap();

        assert_eq!(report.effects.len(), 2);
        assert_eq!(*devices.played.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(devices.sink.starts(), 1);
        assert_eq!(devices.sink.stops(), 1);
    }

    #[tokio::test]
    async fn test_playback_starts_only_after_requests_drain() {
        let transport = ScriptedTransport::new([Script::Respond(vec![Ok(InboundMessage::audio(
            vec![1, 2],
        ))])]);
        let pulled_at_start = Arc::new(Mutex::new(None));
        let source = MemorySource::new(vec![0; 16]).with_frame_delay(Duration::from_millis(10));
        let sink = PullCountingSink {
            transport: transport.clone(),
            pulled_at_start: pulled_at_start.clone(),
        };
        let channel = test_channel(Box::new(source), Box::new(sink), 100);

        let report = ConversationSession::new(transport.clone(), channel, DEADLINE)
            .run(&mut ConversationState::new(100))
            .await
            .unwrap();

        let total = transport.requests()[0].len();
        assert_eq!(total, report.frames_sent + 1);
        assert_eq!(*pulled_at_start.lock().unwrap(), Some(total));
    }

    #[tokio::test]
    async fn test_capture_failure_is_audio_error() {
        let source = FailingSource::default();
        let counters = source.counters.clone();
        let channel = test_channel(Box::new(source), Box::new(MemorySink::new()), 50);
        let transport = ScriptedTransport::new([Script::RespondAfterDrain(vec![Ok(
            InboundMessage::audio(b"ignored!".to_vec()),
        )])]);

        let result = ConversationSession::new(transport, channel.clone(), DEADLINE)
            .run(&mut ConversationState::new(50))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::AudioIo(AudioError::Device(_)))
        ));
        assert_eq!(counters.starts(), 1);
        assert_eq!(counters.stops(), 1);
        assert!(!channel.is_recording());
        assert!(!channel.is_playing());
    }

    #[tokio::test]
    async fn test_playback_failure_is_audio_error() {
        let sink = FailingSink::default();
        let counters = sink.counters.clone();
        let channel = test_channel(Box::new(MemorySource::new(vec![0; 4])), Box::new(sink), 50);
        let transport = ScriptedTransport::new([Script::RespondAfterDrain(vec![Ok(
            InboundMessage::audio(b"RESPONSE".to_vec()),
        )])]);

        let result = ConversationSession::new(transport, channel.clone(), DEADLINE)
            .run(&mut ConversationState::new(50))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::AudioIo(AudioError::Device(_)))
        ));
        assert_eq!(counters.starts(), 1);
        assert_eq!(counters.stops(), 1);
        assert!(!channel.is_recording());
        assert!(!channel.is_playing());
    }

    #[tokio::test]
    async fn test_continuation_token_round_trip() {
        let (channel, _) = memory_channel(vec![0; 4], 50);
        let transport = ScriptedTransport::new([
            Script::RespondAfterDrain(vec![Ok(InboundMessage::result(ConverseResult {
                conversation_state: b"T2".to_vec(),
                microphone_mode: MicrophoneMode::DialogFollowOn,
                ..Default::default()
            }))]),
            Script::RespondAfterDrain(vec![]),
        ]);
        let mut state = ConversationState::new(50);
        state.replace_continuation(b"T1".to_vec());

        let first = ConversationSession::new(transport.clone(), channel.clone(), DEADLINE)
            .run(&mut state)
            .await
            .unwrap();
        assert_eq!(first.verdict, TurnVerdict::Continue);
        assert_eq!(state.continuation_token(), b"T2");

        let second = ConversationSession::new(transport.clone(), channel, DEADLINE)
            .with_turn(2)
            .run(&mut state)
            .await
            .unwrap();
        assert_eq!(second.verdict, TurnVerdict::Stop);

        let requests = transport.requests();
        assert_eq!(token_of(&requests[0]), Some(b"T1".to_vec()));
        assert_eq!(token_of(&requests[1]), Some(b"T2".to_vec()));
    }

    #[tokio::test]
    async fn test_volume_updates_reach_the_channel() {
        let (channel, _) = memory_channel(vec![0; 4], 50);
        let transport = ScriptedTransport::new([
            Script::RespondAfterDrain(vec![Ok(InboundMessage::result(ConverseResult {
                volume_percentage: 0,
                ..Default::default()
            }))]),
            Script::RespondAfterDrain(vec![Ok(InboundMessage::result(ConverseResult {
                volume_percentage: 80,
                ..Default::default()
            }))]),
        ]);
        let mut state = ConversationState::new(50);

        ConversationSession::new(transport.clone(), channel.clone(), DEADLINE)
            .run(&mut state)
            .await
            .unwrap();
        assert_eq!(state.volume_percent(), 50);
        assert_eq!(channel.volume_percent(), 50);

        ConversationSession::new(transport, channel.clone(), DEADLINE)
            .run(&mut state)
            .await
            .unwrap();
        assert_eq!(state.volume_percent(), 80);
        assert_eq!(channel.volume_percent(), 80);
    }

    #[tokio::test]
    async fn test_malformed_response_is_fatal() {
        let (channel, _) = memory_channel(vec![0; 4], 50);
        let codec = serde_json::from_str::<InboundMessage>("{").unwrap_err();
        let transport = ScriptedTransport::new([Script::Respond(vec![Err(codec.into())])]);

        let result = ConversationSession::new(transport, channel, DEADLINE)
            .run(&mut ConversationState::new(50))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Codec(_)))
        ));
    }
}
