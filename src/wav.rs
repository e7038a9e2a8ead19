//! WAV file devices, used when no sound server is available

use crate::audio::{AudioError, AudioFormat, AudioSink, AudioSource};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

fn spec(format: &AudioFormat) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: format.sample_rate,
        bits_per_sample: format.sample_width * 8,
        sample_format: SampleFormat::Int,
    }
}

/// Write 16-bit little-endian PCM to a mono WAV file.
pub fn write_wav(path: &Path, format: &AudioFormat, pcm: &[u8]) -> Result<(), AudioError> {
    let mut writer = WavWriter::create(path, spec(format))?;
    for sample in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a mono 16-bit WAV file matching `format` into PCM bytes.
pub fn read_wav(path: &Path, format: &AudioFormat) -> Result<Vec<u8>, AudioError> {
    let mut reader = WavReader::open(path)?;
    let found = reader.spec();
    if found != spec(format) {
        return Err(AudioError::Device(format!(
            "{} is {} Hz, {} channel(s), {} bit; expected {} Hz mono 16 bit",
            path.display(),
            found.sample_rate,
            found.channels,
            found.bits_per_sample,
            format.sample_rate
        )));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    Ok(pcm)
}

/// Replays a WAV file as microphone input, from the start on every capture
pub struct WavFileSource {
    pcm: Vec<u8>,
    position: usize,
    pace: Option<Duration>,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>, format: &AudioFormat) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let pcm = read_wav(path, format)?;
        info!("Loaded {} bytes of input audio from {}", pcm.len(), path.display());
        Ok(Self {
            pcm,
            position: 0,
            pace: None,
        })
    }

    /// Deliver frames no faster than a live microphone would.
    pub fn paced(mut self, format: &AudioFormat) -> Self {
        let bytes_per_sec = u64::from(format.sample_rate) * u64::from(format.sample_width);
        if bytes_per_sec > 0 {
            let micros = format.frame_size as u64 * 1_000_000 / bytes_per_sec;
            self.pace = Some(Duration::from_micros(micros));
        }
        self
    }
}

impl AudioSource for WavFileSource {
    fn start(&mut self) -> Result<(), AudioError> {
        self.position = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        let remaining = &self.pcm[self.position.min(self.pcm.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        if n > 0 {
            if let Some(pace) = self.pace {
                thread::sleep(pace);
            }
        }
        Ok(n)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Appends everything played to a WAV file
pub struct WavFileSink {
    path: PathBuf,
    format: AudioFormat,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    pub fn new(path: impl Into<PathBuf>, format: &AudioFormat) -> Self {
        Self {
            path: path.into(),
            format: *format,
            writer: None,
        }
    }

    /// Finalize the file header.
    pub fn finish(&mut self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            debug!("Finalized {}", self.path.display());
        }
        Ok(())
    }
}

impl AudioSink for WavFileSink {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.writer.is_none() {
            self.writer = Some(WavWriter::create(&self.path, spec(&self.format))?);
            info!("Writing output audio to {}", self.path.display());
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), AudioError> {
        let writer = self.writer.as_mut().ok_or(AudioError::NotPlaying)?;
        for sample in buf.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.flush()
    }
}
