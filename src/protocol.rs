//! Channel payloads and bus messages shared by all bridge components.
//!
//! This module defines the snapshot delta received from the application
//! layer, the list/status payloads exchanged with it, and the outbound
//! event envelope carried on the runtime bus.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level envelope for outbound bus traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Transport-control command for the application layer.
    Remote(RemoteCommand),
    /// Local-network capability probe result changed.
    Permission(PermissionStatus),
    /// Head-unit action invocation, fired best-effort.
    Action(PlaybackAction),
}

/// Transport-control command forwarded to the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Play,
    Pause,
    Next,
    Previous,
    ToggleLike,
}

impl RemoteCommand {
    /// Wire name used on the `remoteCommand` event payload.
    pub fn wire_name(self) -> &'static str {
        match self {
            RemoteCommand::Play => "play",
            RemoteCommand::Pause => "pause",
            RemoteCommand::Next => "next",
            RemoteCommand::Previous => "prev",
            RemoteCommand::ToggleLike => "toggleLike",
        }
    }
}

/// Local-network capability probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionStatus::Unknown => "unknown",
            PermissionStatus::Granted => "granted",
            PermissionStatus::Denied => "denied",
        }
    }

    /// Parses a persisted status string, falling back to `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "granted" => PermissionStatus::Granted,
            "denied" => PermissionStatus::Denied,
            _ => PermissionStatus::Unknown,
        }
    }
}

/// Playback action invoked from a head-unit list selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackAction {
    PlayAlbum { album_id: String },
    PlayPlaylist { playlist_id: String },
    PlayLiked,
    StartLibraryShuffle,
    StartLikedShuffle,
    StartCustomShuffle,
}

impl PlaybackAction {
    /// Method name used when invoking the action on the application layer.
    pub fn method_name(&self) -> &'static str {
        match self {
            PlaybackAction::PlayAlbum { .. } => "playAlbum",
            PlaybackAction::PlayPlaylist { .. } => "playPlaylist",
            PlaybackAction::PlayLiked => "playLiked",
            PlaybackAction::StartLibraryShuffle => "startLibraryShuffle",
            PlaybackAction::StartLikedShuffle => "startLikedShuffle",
            PlaybackAction::StartCustomShuffle => "startCustomShuffle",
        }
    }

    /// Arguments payload for the action invocation, if any.
    pub fn arguments(&self) -> Option<Value> {
        match self {
            PlaybackAction::PlayAlbum { album_id } => {
                Some(serde_json::json!({ "albumId": album_id }))
            }
            PlaybackAction::PlayPlaylist { playlist_id } => {
                Some(serde_json::json!({ "playlistId": playlist_id }))
            }
            _ => None,
        }
    }
}

/// Identity of the artwork currently wanted by the now-playing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkRef {
    pub url: String,
    pub token: Option<String>,
}

/// Partial update to the canonical now-playing snapshot.
///
/// Absent fields mean "unchanged". `artworkBytes` travels base64-encoded
/// on the JSON transport and is decoded during deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotDelta {
    pub track_id: Option<String>,
    pub epoch: Option<i64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub is_playing: Option<bool>,
    pub liked: Option<bool>,
    pub duration: Option<f64>,
    pub position: Option<f64>,
    #[serde(deserialize_with = "deserialize_base64_opt")]
    pub artwork_bytes: Option<Vec<u8>>,
    pub artwork_url: Option<String>,
    pub token: Option<String>,
}

fn deserialize_base64_opt<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(text) => base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// One selectable entry in a head-unit list payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Library status payload backing the "Liked Songs" row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibraryStatus {
    pub liked_available: bool,
    pub error: Option<String>,
}

/// Parses a raw list response value into entries and an optional error.
///
/// Entries without an id or title are dropped rather than rendered blank.
pub fn parse_list_response(value: &Value) -> (Vec<ListEntry>, Option<String>) {
    let Some(payload) = value.as_object() else {
        return (Vec::new(), Some("bad_response".to_string()));
    };
    let error = payload
        .get("error")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let entries = payload
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<ListEntry>(item.clone()).ok())
                .filter(|entry| !entry.id.is_empty() && !entry.title.is_empty())
                .collect()
        })
        .unwrap_or_default();
    (entries, error)
}
