//! Daemon runtime: wires the sink, output device, player, hub and socket together.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use jukebox_player::output::{self, AudioOutput};
use jukebox_player::player::Player;
use jukebox_player::provider::ProviderRegistry;
use jukebox_player::sink::AudioSink;
use tracing_subscriber::EnvFilter;

use crate::config::{PlaybackConfig, ProviderConfig};
use crate::hub::EventHub;
use crate::net::UnixServer;
use crate::providers;

/// Resolved settings for `listen`.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub socket_path: PathBuf,
    pub device: Option<String>,
    pub playback: PlaybackConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over `filter`.
pub fn init_tracing(filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let names = output::list_devices()?;
    if names.is_empty() {
        println!("(no output devices)");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Run the daemon until SIGINT, SIGTERM or SIGHUP.
pub fn run_listen(config: ListenConfig) -> Result<()> {
    let registry =
        providers::registry_from_config(&config.providers, config.playback.resample_chunk_frames)?;
    if registry.is_empty() {
        tracing::warn!("no providers configured; every play request will be rejected");
    }

    let (sink, reader) = AudioSink::new(config.playback.sink_capacity);
    let mut output = AudioOutput::open(config.device.clone(), reader)?;
    tracing::info!(device = %output.device_name(), "output device");

    let daemon = Daemon::start(&config.socket_path, registry, sink, config.playback.clone())?;

    let stop_rx = shutdown_signal()?;
    let _ = stop_rx.recv();
    tracing::info!("shutting down");
    daemon.shutdown();
    output.close();
    Ok(())
}

/// Install the process-wide termination handler. Can only be called once per process.
fn shutdown_signal() -> Result<Receiver<()>> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install signal handler")?;
    Ok(stop_rx)
}

/// Everything except the audio device, so it can run headless.
pub struct Daemon {
    hub: Arc<EventHub>,
    server: UnixServer,
    sink: AudioSink,
    playback: PlaybackConfig,
}

impl Daemon {
    pub fn start(
        socket_path: &Path,
        registry: ProviderRegistry,
        sink: AudioSink,
        playback: PlaybackConfig,
    ) -> Result<Self> {
        tracing::info!(
            providers = registry.len(),
            names = ?registry.names(),
            "starting jukebox"
        );
        let player = Player::new(registry, sink.clone(), playback.clone());
        let hub = Arc::new(EventHub::spawn(player)?);
        let server = UnixServer::bind(socket_path, hub.clone())?;
        Ok(Self {
            hub,
            server,
            sink,
            playback,
        })
    }

    pub fn socket_path(&self) -> &Path {
        self.server.path()
    }

    /// Stop accepting clients, stop playback, let queued audio play out, then close the sink.
    pub fn shutdown(mut self) {
        self.server.close();
        self.hub.close();
        if !self.sink.wait_drained(self.playback.drain_timeout) {
            tracing::warn!(
                queued_batches = self.sink.queued_batches(),
                "queued audio did not drain before shutdown"
            );
        }
        self.sink.close();
        let stats = self.sink.stats();
        tracing::info!(
            played_frames = stats.played_frames,
            underrun_frames = stats.underrun_frames,
            underrun_events = stats.underrun_events,
            "jukebox stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{self, ClientCommand};
    use crate::providers::LocalProvider;
    use jukebox_types::{EventType, StopReason, StoppedPayload, TrackRequest};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn write_silent_wav(path: &Path, frames: usize) {
        let data_len = (frames * 4) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&44_100u32.to_le_bytes());
        out.extend_from_slice(&(44_100u32 * 4).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(out.len() + frames * 4, 0);
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn headless_daemon_serves_commands_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir(&music).unwrap();
        // Longer than the sink can hold, so the track stays active while nobody pulls.
        write_silent_wav(&music.join("song.wav"), 44_100);

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(LocalProvider::new("files", &music, 1024).unwrap()));
        let playback = PlaybackConfig {
            sink_capacity: 2,
            drain_timeout: Duration::from_millis(50),
            ..PlaybackConfig::default()
        };
        let (sink, _reader) = AudioSink::new(playback.sink_capacity);
        let socket = dir.path().join("jukebox.sock");
        let daemon = Daemon::start(&socket, registry, sink, playback).unwrap();

        let play = ClientCommand::play("files", "song.wav", None, None);
        let event = command::run(&socket, &play, TIMEOUT).unwrap();
        let track: TrackRequest = event.payload_as().unwrap();
        assert_eq!(track.provider_track_id, "song.wav");
        assert!(track.playlist_id.is_some());

        let err = command::run(&socket, &ClientCommand::Resume, TIMEOUT).unwrap_err();
        assert_eq!(err.to_string(), "cannot resume");

        assert_eq!(
            command::run(&socket, &ClientCommand::Pause, TIMEOUT).unwrap().kind,
            EventType::Paused
        );
        let stopped = command::run(&socket, &ClientCommand::Stop, TIMEOUT).unwrap();
        assert_eq!(
            stopped.payload_as::<StoppedPayload>().unwrap().reason,
            StopReason::Stopped
        );

        let err = command::run(&socket, &ClientCommand::play("nope", "x", None, None), TIMEOUT)
            .unwrap_err();
        assert!(err.to_string().contains("unknown provider"));

        daemon.shutdown();
        assert!(!socket.exists());
    }

    #[test]
    fn sigterm_requests_shutdown() {
        let stop_rx = shutdown_signal().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        assert!(stop_rx.recv_timeout(TIMEOUT).is_ok());
    }

    #[test]
    fn start_fails_when_socket_path_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _reader) = AudioSink::new(2);
        let result = Daemon::start(
            &dir.path().join("missing-dir/jukebox.sock"),
            ProviderRegistry::new(),
            sink,
            PlaybackConfig::default(),
        );
        assert!(result.is_err());
    }
}
