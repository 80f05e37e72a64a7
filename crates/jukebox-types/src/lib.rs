//! Wire types shared by the jukebox daemon and its clients.
//!
//! Every message on the wire is a JSON [`Event`]:
//! `{"type": "<tag>", "created": "<RFC 3339>", "payload": <optional>}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Event tag carried in the `type` field.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Client command: start a track.
    #[serde(rename = "play")]
    Play,
    /// Client command: pause the active track.
    #[serde(rename = "pause")]
    Pause,
    /// Client command: resume a paused track.
    #[serde(rename = "resume")]
    Resume,
    /// Client command: stop the active track.
    #[serde(rename = "stop")]
    Stop,
    /// Broadcast: a track started playing.
    #[serde(rename = "player:playing")]
    Playing,
    /// Broadcast: playback paused.
    #[serde(rename = "player:paused")]
    Paused,
    /// Broadcast: playback resumed.
    #[serde(rename = "player:resumed")]
    Resumed,
    /// Broadcast: playback ended (stopped, finished, or failed).
    #[serde(rename = "player:stopped")]
    Stopped,
    /// Sent to the originating client only when its command was rejected.
    #[serde(rename = "player:error")]
    Error,
}

impl EventType {
    /// Wire tag for this event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Play => "play",
            EventType::Pause => "pause",
            EventType::Resume => "resume",
            EventType::Stop => "stop",
            EventType::Playing => "player:playing",
            EventType::Paused => "player:paused",
            EventType::Resumed => "player:resumed",
            EventType::Stopped => "player:stopped",
            EventType::Error => "player:error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single wire message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// Create an event without payload, stamped with the current UTC time.
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            created: OffsetDateTime::now_utc(),
            payload: None,
        }
    }

    /// Create an event carrying `payload`.
    pub fn with_payload<T: Serialize>(kind: EventType, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            created: OffsetDateTime::now_utc(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Build a `player:error` event for `message`.
    pub fn error(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            kind: EventType::Error,
            created: OffsetDateTime::now_utc(),
            payload: Some(serde_json::json!({ "error": message })),
        }
    }

    /// Decode the payload as `T`. A missing payload decodes from `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.payload {
            Some(v) => T::deserialize(v),
            None => T::deserialize(serde_json::Value::Null),
        }
    }

    /// Serialize to the JSON wire encoding (no trailing newline).
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse one wire message. Surrounding whitespace (including the line terminator) is ignored.
    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw.trim_ascii())
    }
}

/// Payload of a `play` command; echoed back in `player:playing`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackRequest {
    #[serde(rename = "providerName")]
    pub provider_name: String,
    #[serde(rename = "providerTrackID")]
    pub provider_track_id: String,
    #[serde(rename = "playlistID", default, skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TrackRequest {
    pub fn new(provider_name: impl Into<String>, provider_track_id: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            provider_track_id: provider_track_id.into(),
            playlist_id: None,
            user_id: None,
        }
    }
}

/// Payload of `player:error`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: String,
}

/// Why playback went back to idle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A client (or shutdown) stopped the track.
    Stopped,
    /// The source reached its end.
    Finished,
    /// Reading or rendering the track failed.
    Error,
}

/// Payload of `player:stopped`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoppedPayload {
    pub reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
