//! rhoconverse - press Enter to talk, `q` to quit

use anyhow::{Context, Result};
use rhoconverse::audio::{AudioSink, AudioSource};
use rhoconverse::wav::{WavFileSink, WavFileSource};
use rhoconverse::{AudioChannel, Config, ConversationEvent, SessionSupervisor, WsTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting rhoconverse");

    let config = Config::from_env().context("Failed to load configuration")?;
    let format = config.audio.format();
    let (source, sink) = open_devices(&config)?;
    let channel = Arc::new(
        AudioChannel::new(format, config.audio.initial_volume, source, sink)
            .context("Failed to open audio channel")?,
    );
    let transport = Arc::new(WsTransport::new(config.transport.clone()));
    let supervisor = SessionSupervisor::new(transport, channel.clone(), &config);

    tokio::spawn(report_events(supervisor.subscribe()));

    println!("Press Enter to start a conversation, q to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().eq_ignore_ascii_case("q") => break,
                    Some(_) => {
                        if !supervisor.start_if_idle() {
                            info!("Conversation already in progress");
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if supervisor.is_active() {
        info!("Waiting for the current conversation to finish");
        if let Some(Err(e)) = supervisor.join().await {
            warn!("Last conversation failed: {}", e);
        }
    }
    channel.close();
    info!("Shutting down");
    Ok(())
}

async fn report_events(mut events: broadcast::Receiver<ConversationEvent>) {
    loop {
        match events.recv().await {
            Ok(ConversationEvent::TurnStarted { turn }) => println!("[turn {}] listening...", turn),
            Ok(ConversationEvent::TurnFinished { turn, verdict }) => {
                println!("[turn {}] done ({:?})", turn, verdict)
            }
            Ok(ConversationEvent::ConversationEnded { turns }) => {
                println!("Conversation ended after {} turn(s). Press Enter to talk again.", turns)
            }
            Ok(ConversationEvent::ConversationFailed { turn, error }) => {
                error!("Conversation failed in turn {}: {}", turn, error);
                println!("[turn {}] failed: {}", turn, error);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} conversation events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

type Devices = (Box<dyn AudioSource>, Box<dyn AudioSink>);

fn open_devices(config: &Config) -> Result<Devices> {
    let format = config.audio.format();
    match &config.device.input_wav {
        Some(input) => {
            let source: Box<dyn AudioSource> = Box::new(
                WavFileSource::open(input, &format)
                    .with_context(|| format!("Failed to open input {}", input.display()))?
                    .paced(&format),
            );
            let output = config
                .device
                .output_wav
                .clone()
                .unwrap_or_else(|| PathBuf::from("response.wav"));
            info!("Using WAV devices: {} -> {}", input.display(), output.display());
            let sink: Box<dyn AudioSink> = Box::new(WavFileSink::new(output, &format));
            Ok((source, sink))
        }
        None => sound_server(config),
    }
}

#[cfg(feature = "pulse")]
fn sound_server(config: &Config) -> Result<Devices> {
    use rhoconverse::pulse::{PulseSink, PulseSource};
    let format = config.audio.format();
    info!("Using PulseAudio devices");
    let source: Box<dyn AudioSource> = Box::new(PulseSource::new(&format, None));
    let sink: Box<dyn AudioSink> = Box::new(PulseSink::new(&format, None));
    Ok((source, sink))
}

#[cfg(not(feature = "pulse"))]
fn sound_server(_config: &Config) -> Result<Devices> {
    anyhow::bail!("No audio input configured: set CONVERSE_INPUT_WAV or build with the `pulse` feature")
}
