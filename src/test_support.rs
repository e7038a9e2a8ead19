//! Scripted transport and device helpers for session tests

use crate::audio::{
    lock, AudioChannel, AudioError, AudioFormat, AudioSink, AudioSource, DeviceCounters,
    MemorySink, MemorySource,
};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::transport::{InboundStream, OutboundStream, Transport, TransportError};
use futures_util::future::BoxFuture;
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted call
pub enum Script {
    /// Yield these responses without waiting for the requests
    Respond(Vec<Result<InboundMessage, TransportError>>),
    /// Yield these responses only after every request was pulled
    RespondAfterDrain(Vec<Result<InboundMessage, TransportError>>),
    /// Fail the call before any response
    Fail(TransportError),
}

/// Transport that replays one script per call and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Arc<Mutex<Vec<OutboundMessage>>>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: Mutex::default(),
        })
    }

    /// Requests received so far, one list per call
    pub fn requests(&self) -> Vec<Vec<OutboundMessage>> {
        lock(&self.calls).iter().map(|call| lock(call).clone()).collect()
    }

    pub fn calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl Transport for ScriptedTransport {
    fn converse(
        &self,
        mut requests: OutboundStream,
        _deadline: Duration,
    ) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
        async move {
            let script = lock(&self.scripts)
                .pop_front()
                .unwrap_or_else(|| Script::Respond(Vec::new()));
            let sink = Arc::<Mutex<Vec<OutboundMessage>>>::default();
            lock(&self.calls).push(sink.clone());

            let (responses, after_drain) = match script {
                Script::Fail(e) => return Err(e),
                Script::Respond(responses) => (responses, false),
                Script::RespondAfterDrain(responses) => (responses, true),
            };

            let pump = async move {
                while let Some(message) = requests.next().await {
                    lock(&sink).push(message);
                }
            };

            if after_drain {
                let drained = stream::once(pump)
                    .filter_map(|()| async { None::<Result<InboundMessage, TransportError>> });
                Ok(drained.chain(stream::iter(responses)).boxed())
            } else {
                tokio::spawn(pump);
                Ok(stream::iter(responses).boxed())
            }
        }
        .boxed()
    }
}

/// Handles on the in-memory devices behind a test channel
pub struct TestDevices {
    pub source: Arc<DeviceCounters>,
    pub sink: Arc<DeviceCounters>,
    pub played: Arc<Mutex<Vec<u8>>>,
}

/// Channel over in-memory devices using 4-byte frames.
pub fn memory_channel(pcm: Vec<u8>, volume: u8) -> (Arc<AudioChannel>, TestDevices) {
    let source = MemorySource::new(pcm);
    let sink = MemorySink::new();
    let devices = TestDevices {
        source: source.counters(),
        sink: sink.counters(),
        played: sink.played(),
    };
    (test_channel(Box::new(source), Box::new(sink), volume), devices)
}

/// Channel over arbitrary devices using 4-byte frames.
pub fn test_channel(
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    volume: u8,
) -> Arc<AudioChannel> {
    let format = AudioFormat {
        frame_size: 4,
        ..Default::default()
    };
    AudioChannel::new(format, volume, source, sink)
        .map(Arc::new)
        .unwrap_or_else(|e| panic!("Failed to build test channel: {}", e))
}

/// Source whose reads fail, like an unplugged microphone
#[derive(Default)]
pub struct FailingSource {
    pub counters: Arc<DeviceCounters>,
}

impl AudioSource for FailingSource {
    fn start(&mut self) -> Result<(), AudioError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, AudioError> {
        Err(AudioError::Device("microphone unplugged".into()))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink whose writes fail
#[derive(Default)]
pub struct FailingSink {
    pub counters: Arc<DeviceCounters>,
}

impl AudioSink for FailingSink {
    fn start(&mut self) -> Result<(), AudioError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, _buf: &[u8]) -> Result<(), AudioError> {
        Err(AudioError::Device("speaker unplugged".into()))
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that notes how many requests the transport had pulled when it started
pub struct PullCountingSink {
    pub transport: Arc<ScriptedTransport>,
    pub pulled_at_start: Arc<Mutex<Option<usize>>>,
}

impl AudioSink for PullCountingSink {
    fn start(&mut self) -> Result<(), AudioError> {
        let pulled = self.transport.requests().last().map(Vec::len);
        *lock(&self.pulled_at_start) = pulled;
        Ok(())
    }

    fn write(&mut self, _buf: &[u8]) -> Result<(), AudioError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}
