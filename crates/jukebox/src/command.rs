//! Command-line client: send one command to the daemon and wait for its outcome.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use jukebox_types::{ErrorPayload, Event, EventType, TrackRequest};

use crate::hub::Client;
use crate::net::UnixClient;

/// How long a command waits for the daemon's answer.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Play(TrackRequest),
    Pause,
    Resume,
    Stop,
}

impl ClientCommand {
    /// Build a play command; a missing playlist id is generated.
    pub fn play(
        provider: impl Into<String>,
        track: impl Into<String>,
        playlist: Option<String>,
        user: Option<String>,
    ) -> Self {
        let mut request = TrackRequest::new(provider, track);
        request.playlist_id =
            Some(playlist.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        request.user_id = user;
        ClientCommand::Play(request)
    }

    pub fn event(&self) -> Result<Event> {
        let event = match self {
            ClientCommand::Play(request) => Event::with_payload(EventType::Play, request)?,
            ClientCommand::Pause => Event::new(EventType::Pause),
            ClientCommand::Resume => Event::new(EventType::Resume),
            ClientCommand::Stop => Event::new(EventType::Stop),
        };
        Ok(event)
    }

    /// Broadcast that confirms the command.
    pub fn expected(&self) -> EventType {
        match self {
            ClientCommand::Play(_) => EventType::Playing,
            ClientCommand::Pause => EventType::Paused,
            ClientCommand::Resume => EventType::Resumed,
            ClientCommand::Stop => EventType::Stopped,
        }
    }
}

/// Connect to the daemon at `socket`, send `command` and wait for its confirmation.
pub fn run(socket: &Path, command: &ClientCommand, timeout: Duration) -> Result<Event> {
    let client = UnixClient::connect(socket)?;
    client
        .set_read_timeout(Some(timeout))
        .context("set read timeout")?;
    let result = exchange(&client, command, Instant::now() + timeout);
    let _ = client.close();
    result
}

/// Send `command` over `client` and read until the matching broadcast or an error.
///
/// Unrelated events (other clients' activity) are skipped.
pub fn exchange(client: &dyn Client, command: &ClientCommand, deadline: Instant) -> Result<Event> {
    let expected = command.expected();
    client
        .write(&command.event()?.to_bytes()?)
        .context("send command")?;

    loop {
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {expected}"));
        }
        let raw = match client.read() {
            Ok(raw) => raw,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(anyhow!("timed out waiting for {expected}"));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(anyhow!("daemon closed the connection"));
            }
            Err(e) => return Err(e).context("read reply"),
        };
        let event = match Event::from_slice(&raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("ignoring undecodable message: {e}");
                continue;
            }
        };
        if event.kind == expected {
            return Ok(event);
        }
        if event.kind == EventType::Error {
            let payload: ErrorPayload = event.payload_as().context("decode error payload")?;
            return Err(anyhow!("{}", payload.error));
        }
        tracing::debug!(kind = %event.kind, "skipping unrelated event");
    }
}
