//! Payload bodies for the media-control namespace.

use crate::receiver::ReceiverVolume;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type string for a media status push or reply
pub const TYPE_MEDIA_STATUS: &str = "MEDIA_STATUS";
/// Message type string rejecting a command in the current player state
pub const TYPE_INVALID_PLAYER_STATE: &str = "INVALID_PLAYER_STATE";
/// Message type string for a failed load
pub const TYPE_LOAD_FAILED: &str = "LOAD_FAILED";
/// Message type string for a load preempted by another load
pub const TYPE_LOAD_CANCELLED: &str = "LOAD_CANCELLED";
/// Message type string for a malformed media request
pub const TYPE_INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Requests issued on the media-control namespace
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum MediaRequest {
    /// Load new media into the player
    #[serde(rename = "LOAD", rename_all = "camelCase")]
    Load {
        /// Correlation id
        request_id: i64,
        /// Media to load
        media: MediaInformation,
        /// Start playback immediately
        autoplay: bool,
        /// Start position in seconds
        current_time: f64,
        /// Application-defined extra data
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_data: Option<Value>,
    },
    /// Resume playback
    #[serde(rename = "PLAY", rename_all = "camelCase")]
    Play {
        /// Correlation id
        request_id: i64,
        /// Target media session
        media_session_id: i64,
    },
    /// Pause playback
    #[serde(rename = "PAUSE", rename_all = "camelCase")]
    Pause {
        /// Correlation id
        request_id: i64,
        /// Target media session
        media_session_id: i64,
    },
    /// Stop playback and unload the media
    #[serde(rename = "STOP", rename_all = "camelCase")]
    Stop {
        /// Correlation id
        request_id: i64,
        /// Target media session
        media_session_id: i64,
    },
    /// Seek to a stream position
    #[serde(rename = "SEEK", rename_all = "camelCase")]
    Seek {
        /// Correlation id
        request_id: i64,
        /// Target media session
        media_session_id: i64,
        /// Position in seconds
        current_time: f64,
        /// Playback state after the seek completes
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_state: Option<ResumeState>,
    },
    /// Change stream volume
    #[serde(rename = "SET_VOLUME", rename_all = "camelCase")]
    SetVolume {
        /// Correlation id
        request_id: i64,
        /// Target media session
        media_session_id: i64,
        /// Fields to change
        volume: ReceiverVolume,
    },
    /// Request the current media status
    #[serde(rename = "GET_STATUS", rename_all = "camelCase")]
    GetStatus {
        /// Correlation id
        request_id: i64,
        /// Restrict to one media session
        #[serde(skip_serializing_if = "Option::is_none")]
        media_session_id: Option<i64>,
    },
}

/// Playback state after a seek
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResumeState {
    /// Resume playing
    #[serde(rename = "PLAYBACK_START")]
    Start,
    /// Stay paused
    #[serde(rename = "PLAYBACK_PAUSE")]
    Pause,
}

/// Media status push or reply; `status` may report several sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusMessage {
    /// Correlation id of the triggering request, absent for pushes
    #[serde(default)]
    pub request_id: Option<i64>,
    /// Reported media sessions
    #[serde(default)]
    pub status: Vec<MediaStatus>,
}

/// State of one media session
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaStatus {
    /// Receiver-assigned media session id
    pub media_session_id: i64,
    /// Player state
    pub player_state: PlayerState,
    /// Stream position in seconds at the time of the report
    pub current_time: f64,
    /// Playback rate; 0.0 while not advancing
    pub playback_rate: f64,
    /// Stream volume
    pub volume: Option<ReceiverVolume>,
    /// Loaded media; omitted when unchanged from the previous report
    pub media: Option<MediaInformation>,
    /// Reason the player went idle
    pub idle_reason: Option<String>,
    /// Bitmask of commands the receiver supports
    pub supported_media_commands: u64,
}

/// Player state reported by the receiver
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    /// No media loaded or playback finished
    #[default]
    Idle,
    /// Actively playing
    Playing,
    /// Paused by a sender
    Paused,
    /// Stalled waiting for data
    Buffering,
}

/// Description of a loadable media item
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInformation {
    /// Content locator, typically a URL
    pub content_id: String,
    /// Stream delivery type
    pub stream_type: StreamType,
    /// MIME type of the content
    pub content_type: String,
    /// Serialized media metadata (title, images, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Duration in seconds, absent for live streams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Stream delivery type
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    /// Seekable, fully buffered content
    Buffered,
    /// Live content without a fixed duration
    Live,
    /// Unknown delivery type
    None,
}
