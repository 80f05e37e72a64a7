//! Process-wide player: at most one playback session, with pause/resume/stop transitions.
//!
//! Every transition emits one [`PlayerSignal`] on the channel returned by
//! [`Player::signals`], in the order the transitions happened.

use crossbeam_channel::{Receiver, Sender};
use jukebox_types::{StopReason, TrackRequest};

use crate::config::PlaybackConfig;
use crate::provider::ProviderRegistry;
use crate::session::{PlaybackSession, SessionEnd};
use crate::sink::AudioSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("player is playing")]
    AlreadyPlaying,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {provider}: {error:#}")]
    Provider {
        provider: String,
        error: anyhow::Error,
    },
    #[error("start playback: {0:#}")]
    Session(anyhow::Error),
    #[error("player is closed")]
    Closed,
}

/// Lifecycle notifications, one per transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayerSignal {
    Playing(TrackRequest),
    Paused,
    Resumed,
    Stopped {
        reason: StopReason,
        error: Option<String>,
    },
}

pub struct Player {
    providers: ProviderRegistry,
    sink: AudioSink,
    config: PlaybackConfig,
    state: PlayerState,
    session: Option<PlaybackSession>,
    current: Option<TrackRequest>,
    signals_tx: Sender<PlayerSignal>,
    signals_rx: Receiver<PlayerSignal>,
    closed: bool,
}

impl Player {
    pub fn new(providers: ProviderRegistry, sink: AudioSink, config: PlaybackConfig) -> Self {
        let (signals_tx, signals_rx) = crossbeam_channel::unbounded();
        Self {
            providers,
            sink,
            config,
            state: PlayerState::Idle,
            session: None,
            current: None,
            signals_tx,
            signals_rx,
            closed: false,
        }
    }

    /// Receiver for lifecycle signals.
    pub fn signals(&self) -> Receiver<PlayerSignal> {
        self.signals_rx.clone()
    }

    /// End signal of the active session, if any.
    pub fn session_end(&self) -> Option<Receiver<SessionEnd>> {
        self.session.as_ref().map(|s| s.end())
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn current_track(&self) -> Option<&TrackRequest> {
        self.current.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start `request`. Only valid while idle.
    pub fn play(&mut self, request: TrackRequest) -> Result<(), PlayerError> {
        if self.closed {
            return Err(PlayerError::Closed);
        }
        self.reap();
        if self.state != PlayerState::Idle {
            return Err(PlayerError::AlreadyPlaying);
        }

        let provider = self
            .providers
            .get(&request.provider_name)
            .ok_or_else(|| PlayerError::UnknownProvider(request.provider_name.clone()))?;
        let stream = provider
            .stream(&request.provider_track_id)
            .map_err(|error| PlayerError::Provider {
                provider: request.provider_name.clone(),
                error,
            })?;

        let label = format!("{}:{}", request.provider_name, request.provider_track_id);
        let session = PlaybackSession::start(label, stream, self.sink.clone(), &self.config)
            .map_err(PlayerError::Session)?;

        tracing::info!(
            provider = %request.provider_name,
            track = %request.provider_track_id,
            playlist = request.playlist_id.as_deref().unwrap_or("-"),
            user = request.user_id.as_deref().unwrap_or("-"),
            "playing"
        );
        self.session = Some(session);
        self.state = PlayerState::Playing;
        self.current = Some(request.clone());
        self.emit(PlayerSignal::Playing(request));
        Ok(())
    }

    /// Pause the active track. Returns `false` unless playing.
    pub fn pause(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.reap();
        if self.state != PlayerState::Playing {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.stop() {
            return false;
        }
        self.state = PlayerState::Paused;
        tracing::info!("paused");
        self.emit(PlayerSignal::Paused);
        true
    }

    /// Resume a paused track. Returns `false` unless paused.
    pub fn resume(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.reap();
        if self.state != PlayerState::Paused {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.resume() {
            return false;
        }
        self.state = PlayerState::Playing;
        tracing::info!("resumed");
        self.emit(PlayerSignal::Resumed);
        true
    }

    /// Stop the active track and wait for its session to exit.
    pub fn stop(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.reap();
        if self.state == PlayerState::Idle {
            return false;
        }
        self.end_session(SessionEnd::Closed);
        true
    }

    /// Handle a session that ended on its own (end of stream or failure).
    ///
    /// Ignored when no session is active.
    pub fn finish_session(&mut self, outcome: SessionEnd) {
        if self.session.is_none() {
            return;
        }
        self.end_session(outcome);
    }

    /// Stop any active track and reject further commands. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reap();
        if self.state != PlayerState::Idle {
            self.end_session(SessionEnd::Closed);
        }
        self.closed = true;
        tracing::debug!("player closed");
    }

    /// Pick up a session that already ended but was not reported yet.
    fn reap(&mut self) {
        let outcome = match &self.session {
            Some(session) if session.is_ended() => session.end().try_recv().ok(),
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.end_session(outcome);
        }
    }

    fn end_session(&mut self, outcome: SessionEnd) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.state = PlayerState::Idle;
        let track = self.current.take();

        let stats = self.sink.stats();
        tracing::info!(
            track = ?track.as_ref().map(|t| t.provider_track_id.as_str()),
            outcome = ?outcome,
            played_frames = stats.played_frames,
            underrun_frames = stats.underrun_frames,
            underrun_events = stats.underrun_events,
            "stopped"
        );

        let (reason, error) = match outcome {
            SessionEnd::Closed => (StopReason::Stopped, None),
            SessionEnd::Finished => (StopReason::Finished, None),
            SessionEnd::Failed(message) => (StopReason::Error, Some(message)),
        };
        self.emit(PlayerSignal::Stopped { reason, error });
    }

    fn emit(&self, signal: PlayerSignal) {
        // The receiver lives in `self`, so this cannot fail.
        let _ = self.signals_tx.send(signal);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}
