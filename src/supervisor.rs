//! Session supervisor - at most one conversation at a time, with follow-on turns

use crate::audio::{lock, AudioChannel};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::events::{ConversationEvent, ConversationSummary};
use crate::interpreter::TurnVerdict;
use crate::recorder::TurnRecorder;
use crate::session::ConversationSession;
use crate::state::ConversationState;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const EVENT_CHANNEL_CAPACITY: usize = 64;

type ConversationHandle = JoinHandle<Result<ConversationSummary>>;

struct Inner<T: Transport + ?Sized> {
    transport: Arc<T>,
    channel: Arc<AudioChannel>,
    deadline: Duration,
    max_follow_on_turns: usize,
    state: Mutex<ConversationState>,
    recorder: Mutex<Option<TurnRecorder>>,
    active: AtomicBool,
    events: broadcast::Sender<ConversationEvent>,
}

/// Clears the active flag when the conversation task ends, even by panic
struct ActiveGuard<T: Transport + ?Sized> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport + ?Sized> Drop for ActiveGuard<T> {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

/// Owns the conversation state and audio channel and runs conversations on demand
pub struct SessionSupervisor<T: Transport + ?Sized> {
    inner: Arc<Inner<T>>,
    handle: Mutex<Option<ConversationHandle>>,
}

impl<T: Transport + ?Sized> SessionSupervisor<T> {
    pub fn new(transport: Arc<T>, channel: Arc<AudioChannel>, config: &Config) -> Self {
        let recorder = config
            .conversation
            .record_dir
            .as_ref()
            .map(|dir| TurnRecorder::new(dir, config.audio.format()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(ConversationState::new(channel.volume_percent())),
                channel,
                deadline: config.transport.deadline(),
                max_follow_on_turns: config.conversation.max_follow_on_turns,
                recorder: Mutex::new(recorder),
                active: AtomicBool::new(false),
                events,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start a conversation unless one is already running.
    ///
    /// Returns immediately; the conversation runs on its own task. Must be
    /// called from within a tokio runtime.
    pub fn start_if_idle(&self) -> bool {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Conversation already active, ignoring trigger");
            return false;
        }

        let guard = ActiveGuard {
            inner: self.inner.clone(),
        };
        let handle = tokio::spawn(async move {
            let result = converse(&guard.inner).await;
            drop(guard);
            result
        });
        *lock(&self.handle) = Some(handle);
        true
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Snapshot of the state carried between turns
    pub fn state(&self) -> ConversationState {
        lock(&self.inner.state).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the most recently started conversation, if it was not joined yet.
    pub async fn join(&self) -> Option<Result<ConversationSummary>> {
        let handle = lock(&self.handle).take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Task(e.to_string())),
        })
    }
}

/// Run turns until the service closes the microphone or a turn fails.
async fn converse<T: Transport + ?Sized>(
    inner: &Inner<T>,
) -> Result<ConversationSummary> {
    let mut state = lock(&inner.state).clone();
    let mut turn = 0;

    loop {
        turn += 1;
        let _ = inner.events.send(ConversationEvent::TurnStarted { turn });
        info!("Starting conversation turn {}", turn);

        let recording = lock(&inner.recorder).as_mut().map(TurnRecorder::begin_turn);
        let result = ConversationSession::new(
            inner.transport.clone(),
            inner.channel.clone(),
            inner.deadline,
        )
        .with_turn(turn)
        .with_recording(recording)
        .run(&mut state)
        .await;

        *lock(&inner.state) = state.clone();

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!("Conversation stopped after turn {}: {}", turn, e);
                let _ = inner.events.send(ConversationEvent::ConversationFailed {
                    turn,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let _ = inner.events.send(ConversationEvent::TurnFinished {
            turn,
            verdict: report.verdict,
        });

        if report.verdict == TurnVerdict::Stop {
            break;
        }
        if inner.max_follow_on_turns > 0 && turn > inner.max_follow_on_turns {
            info!(
                "Follow-on limit of {} turns reached, closing microphone",
                inner.max_follow_on_turns
            );
            let _ = inner.events.send(ConversationEvent::ConversationEnded { turns: turn });
            return Ok(ConversationSummary {
                turns: turn,
                final_verdict: TurnVerdict::Continue,
            });
        }
        info!("Expecting follow-on query from user");
    }

    info!("Conversation finished after {} turn(s)", turn);
    let _ = inner.events.send(ConversationEvent::ConversationEnded { turns: turn });
    Ok(ConversationSummary {
        turns: turn,
        final_verdict: TurnVerdict::Stop,
    })
}
