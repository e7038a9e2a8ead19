//! PulseAudio devices over the simple API
//!
//! A connection is opened on `start` and closed on `stop`, so the microphone is
//! only held while a turn is recording.

use crate::audio::{AudioError, AudioFormat, AudioSink, AudioSource};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tracing::{debug, info};

const APP_NAME: &str = "rhoconverse";

fn spec(format: &AudioFormat) -> pulse::sample::Spec {
    pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: 1,
        rate: format.sample_rate,
    }
}

fn connect(
    direction: pulse::stream::Direction,
    device: Option<&str>,
    description: &str,
    format: &AudioFormat,
) -> Result<psimple::Simple, AudioError> {
    psimple::Simple::new(
        None,
        APP_NAME,
        direction,
        device,
        description,
        &spec(format),
        None,
        None,
    )
    .map_err(|e| AudioError::Device(format!("PulseAudio {}: {}", description, e)))
}

/// Microphone capture
pub struct PulseSource {
    format: AudioFormat,
    device: Option<String>,
    stream: Option<psimple::Simple>,
}

impl PulseSource {
    /// `device` of `None` uses the server's default source.
    pub fn new(format: &AudioFormat, device: Option<String>) -> Self {
        Self {
            format: *format,
            device,
            stream: None,
        }
    }
}

impl AudioSource for PulseSource {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.stream.is_none() {
            let stream = connect(
                pulse::stream::Direction::Record,
                self.device.as_deref(),
                "microphone",
                &self.format,
            )?;
            info!("Microphone capture connected");
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let stream = self.stream.as_ref().ok_or(AudioError::NotCapturing)?;
        stream
            .read(buf)
            .map_err(|e| AudioError::Device(format!("PulseAudio read: {}", e)))?;
        Ok(buf.len())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if self.stream.take().is_some() {
            debug!("Microphone capture disconnected");
        }
        Ok(())
    }
}

/// Speaker playback
pub struct PulseSink {
    format: AudioFormat,
    device: Option<String>,
    stream: Option<psimple::Simple>,
}

impl PulseSink {
    pub fn new(format: &AudioFormat, device: Option<String>) -> Self {
        Self {
            format: *format,
            device,
            stream: None,
        }
    }
}

impl AudioSink for PulseSink {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.stream.is_none() {
            let stream = connect(
                pulse::stream::Direction::Playback,
                self.device.as_deref(),
                "speaker",
                &self.format,
            )?;
            info!("Speaker playback connected");
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), AudioError> {
        let stream = self.stream.as_ref().ok_or(AudioError::NotPlaying)?;
        stream
            .write(buf)
            .map_err(|e| AudioError::Device(format!("PulseAudio write: {}", e)))
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        match &self.stream {
            Some(stream) => stream
                .drain()
                .map_err(|e| AudioError::Device(format!("PulseAudio drain: {}", e))),
            None => Ok(()),
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if self.stream.take().is_some() {
            debug!("Speaker playback disconnected");
        }
        Ok(())
    }
}
