//! Turn recorder - saves request audio, response audio and transcripts per turn

use crate::audio::{lock, AudioFormat};
use crate::interpreter::SideEffect;
use crate::protocol::OutboundMessage;
use crate::wav::write_wav;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Creates one directory per conversation run and one per turn inside it.
///
/// Failures are logged and never propagate into the turn.
pub struct TurnRecorder {
    base: PathBuf,
    format: AudioFormat,
    turns: usize,
}

impl TurnRecorder {
    pub fn new(root: impl AsRef<Path>, format: AudioFormat) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = root.as_ref().join(ts);

        if let Err(e) = fs::create_dir_all(&base) {
            error!("Failed to create recordings directory: {}", e);
        } else {
            info!("Recording enabled, saving to: {:?}", base);
        }

        Self {
            base,
            format,
            turns: 0,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn begin_turn(&mut self) -> TurnRecording {
        self.turns += 1;
        let dir = self.base.join(format!("turn_{:03}", self.turns));
        let dir = match fs::create_dir_all(&dir) {
            Ok(()) => {
                debug!("Starting recording for turn {} in {:?}", self.turns, dir);
                Some(dir)
            }
            Err(e) => {
                error!("Failed to create turn directory: {}", e);
                None
            }
        };

        TurnRecording {
            dir,
            format: self.format,
            request: Arc::default(),
            response: Vec::new(),
            transcript: Vec::new(),
        }
    }
}

/// Everything captured during one turn, written out by [`TurnRecording::finish`]
pub struct TurnRecording {
    dir: Option<PathBuf>,
    format: AudioFormat,
    request: Arc<Mutex<Vec<u8>>>,
    response: Vec<u8>,
    transcript: Vec<String>,
}

impl TurnRecording {
    /// Observer for the outbound stream; keeps the audio it sees.
    pub fn request_tap(&self) -> impl FnMut(&OutboundMessage) + Send + 'static {
        let request = self.request.clone();
        move |message: &OutboundMessage| {
            if let OutboundMessage::AudioChunk(frame) = message {
                lock(&request).extend_from_slice(&frame.data);
            }
        }
    }

    pub fn on_effect(&mut self, effect: &SideEffect) {
        match effect {
            SideEffect::LogTranscript(text) => self.transcript.push(format!("user: {}", text)),
            SideEffect::LogTtsTranscript(text) => {
                self.transcript.push(format!("assistant: {}", text))
            }
            SideEffect::PlayAudio(pcm) => self.response.extend_from_slice(pcm),
            SideEffect::FatalError { code, message } => {
                self.transcript.push(format!("error: {:?} {}", code, message))
            }
            SideEffect::StopCapture | SideEffect::LogNoAudibleResponse => {}
        }
    }

    pub fn finish(self) {
        let Some(dir) = self.dir else {
            return;
        };

        let request = lock(&self.request);
        if let Err(e) = write_wav(&dir.join("request.wav"), &self.format, &request) {
            error!("Failed to write request audio: {}", e);
        }
        if !self.response.is_empty() {
            if let Err(e) = write_wav(&dir.join("response.wav"), &self.format, &self.response) {
                error!("Failed to write response audio: {}", e);
            }
        }
        if !self.transcript.is_empty() {
            let mut text = self.transcript.join("\n");
            text.push('\n');
            if let Err(e) = fs::write(dir.join("transcript.txt"), text) {
                error!("Failed to write transcript: {}", e);
            }
        }
        debug!("Closed recording in {:?}", dir);
    }
}
