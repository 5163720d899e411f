//! Media control channel: playback commands and media status sync.
//!
//! One [`RequestTracker`] per operation. Status replies refresh a
//! single in-memory snapshot of the current media session; an update
//! bitmask records which parts changed and gates the events fired at
//! the owning session. Broad receiver-side errors resolve every
//! outstanding tracker at once.

use crate::channel::{CastChannel, ChannelEvent, MediaEvent, MessageSender};
use crate::status::CastStatus;
use crate::tracker::{RequestTracker, TrackerCallback};
use bitflags::bitflags;
use cast_wire::media::{
    TYPE_INVALID_PLAYER_STATE, TYPE_INVALID_REQUEST, TYPE_LOAD_CANCELLED, TYPE_LOAD_FAILED,
    TYPE_MEDIA_STATUS,
};
use cast_wire::{
    message_type, CastMessage, MediaInformation, MediaRequest, MediaStatus, MediaStatusMessage,
    PlayerState, ReceiverVolume, ResumeState, WireError,
};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

bitflags! {
    /// Which parts of the media status snapshot changed in an update
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MediaUpdateMask: u32 {
        /// The whole status was replaced (new or ended media session)
        const WHOLE_STATUS = 1 << 0;
        /// Position, playback rate, or player state changed
        const POSITION = 1 << 1;
        /// Stream volume or mute changed
        const VOLUME = 1 << 2;
        /// Media information/metadata changed
        const METADATA = 1 << 3;
    }
}

/// Logical operation slots on the media channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOp {
    /// Load new media
    Load,
    /// Resume playback
    Play,
    /// Pause playback
    Pause,
    /// Stop and unload
    Stop,
    /// Seek to a position
    Seek,
    /// Change stream volume
    Volume,
    /// Change stream mute
    Mute,
    /// Request media status
    Status,
}

const ALL_OPS: [MediaOp; 8] = [
    MediaOp::Load,
    MediaOp::Play,
    MediaOp::Pause,
    MediaOp::Stop,
    MediaOp::Seek,
    MediaOp::Volume,
    MediaOp::Mute,
    MediaOp::Status,
];

/// Media control channel
pub struct MediaControlChannel {
    namespace: String,
    request_timeout: Duration,
    sender: Option<MessageSender>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    // Transport endpoint of the connected application; media commands
    // are rejected locally while absent.
    destination: Option<String>,

    load: RequestTracker,
    play: RequestTracker,
    pause: RequestTracker,
    stop: RequestTracker,
    seek: RequestTracker,
    volume: RequestTracker,
    mute: RequestTracker,
    status: RequestTracker,

    current: Option<MediaStatus>,
    status_received_at: Option<Instant>,
}

impl MediaControlChannel {
    /// Create a media control channel
    pub fn new(
        namespace: impl Into<String>,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            request_timeout,
            sender: None,
            events,
            destination: None,
            load: RequestTracker::new(),
            play: RequestTracker::new(),
            pause: RequestTracker::new(),
            stop: RequestTracker::new(),
            seek: RequestTracker::new(),
            volume: RequestTracker::new(),
            mute: RequestTracker::new(),
            status: RequestTracker::new(),
            current: None,
            status_received_at: None,
        }
    }

    /// Bind the sending capability
    pub fn bind(&mut self, sender: MessageSender) {
        self.sender = Some(sender);
    }

    /// Drop the sending capability
    pub fn unbind(&mut self) {
        self.sender = None;
        self.reset();
    }

    /// Point media commands at the connected application's endpoint.
    ///
    /// Clearing the destination resets the channel: the media session
    /// lived inside the application that is now gone.
    pub fn set_destination(&mut self, destination: Option<String>) {
        if destination.is_none() {
            self.reset();
        }
        self.destination = destination;
    }

    /// Current media status snapshot
    pub fn current_status(&self) -> Option<&MediaStatus> {
        self.current.as_ref()
    }

    /// Load new media; returns the issued request id.
    ///
    /// `position_ms` is converted to seconds for the wire. Rejected
    /// locally when no application endpoint is set.
    pub fn load(
        &mut self,
        media: MediaInformation,
        autoplay: bool,
        position_ms: u64,
        custom_data: Option<Value>,
    ) -> Result<i64, CastStatus> {
        if self.destination.is_none() {
            return Err(CastStatus::InvalidRequest);
        }
        let request_id = self.next_request_id();
        self.issue(
            MediaOp::Load,
            &MediaRequest::Load {
                request_id,
                media,
                autoplay,
                current_time: position_ms as f64 / 1000.0,
                custom_data,
            },
            request_id,
        );
        Ok(request_id)
    }

    /// Resume playback of the current media session
    pub fn play(&mut self) {
        if let Some(media_session_id) = self.require_session(MediaOp::Play) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Play,
                &MediaRequest::Play {
                    request_id,
                    media_session_id,
                },
                request_id,
            );
        }
    }

    /// Pause the current media session
    pub fn pause(&mut self) {
        if let Some(media_session_id) = self.require_session(MediaOp::Pause) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Pause,
                &MediaRequest::Pause {
                    request_id,
                    media_session_id,
                },
                request_id,
            );
        }
    }

    /// Stop and unload the current media session
    pub fn stop(&mut self) {
        if let Some(media_session_id) = self.require_session(MediaOp::Stop) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Stop,
                &MediaRequest::Stop {
                    request_id,
                    media_session_id,
                },
                request_id,
            );
        }
    }

    /// Seek the current media session to `position_ms`
    pub fn seek(&mut self, position_ms: u64, resume_state: Option<ResumeState>) {
        if let Some(media_session_id) = self.require_session(MediaOp::Seek) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Seek,
                &MediaRequest::Seek {
                    request_id,
                    media_session_id,
                    current_time: position_ms as f64 / 1000.0,
                    resume_state,
                },
                request_id,
            );
        }
    }

    /// Change the stream volume level
    pub fn set_stream_volume(&mut self, level: f64) {
        if let Some(media_session_id) = self.require_session(MediaOp::Volume) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Volume,
                &MediaRequest::SetVolume {
                    request_id,
                    media_session_id,
                    volume: ReceiverVolume {
                        level: Some(level),
                        muted: None,
                    },
                },
                request_id,
            );
        }
    }

    /// Change the stream mute state
    pub fn set_stream_mute(&mut self, muted: bool) {
        if let Some(media_session_id) = self.require_session(MediaOp::Mute) {
            let request_id = self.next_request_id();
            self.issue(
                MediaOp::Mute,
                &MediaRequest::SetVolume {
                    request_id,
                    media_session_id,
                    volume: ReceiverVolume {
                        level: None,
                        muted: Some(muted),
                    },
                },
                request_id,
            );
        }
    }

    /// Request a media status refresh
    pub fn get_status(&mut self) {
        if self.destination.is_none() {
            self.emit_operation(MediaOp::Status, 0, CastStatus::InvalidRequest);
            return;
        }
        let request_id = self.next_request_id();
        let media_session_id = self.current.as_ref().map(|s| s.media_session_id);
        self.issue(
            MediaOp::Status,
            &MediaRequest::GetStatus {
                request_id,
                media_session_id,
            },
            request_id,
        );
    }

    /// Extrapolate the current stream position at `now`.
    ///
    /// While not playing (or at zero rate) the last reported position
    /// is returned verbatim; otherwise the position advances by
    /// elapsed real time scaled by the playback rate and is clamped to
    /// `[0, duration]`.
    pub fn approximate_stream_position(&self, now: Instant) -> Option<u64> {
        let status = self.current.as_ref()?;
        let last_ms = (status.current_time.max(0.0) * 1000.0).round() as u64;

        if status.playback_rate == 0.0 || status.player_state != PlayerState::Playing {
            return Some(last_ms);
        }
        let received_at = self.status_received_at?;

        let elapsed = now.saturating_duration_since(received_at).as_secs_f64();
        let mut position = status.current_time + elapsed * status.playback_rate;
        position = position.max(0.0);
        if let Some(duration) = status.media.as_ref().and_then(|m| m.duration) {
            position = position.min(duration);
        }
        Some((position * 1000.0).round() as u64)
    }

    /// Resolve every outstanding tracker with the given status
    pub fn complete_all(&mut self, status: CastStatus) {
        for op in ALL_OPS {
            self.tracker_mut(op).complete_outstanding(status, None);
        }
    }

    fn next_request_id(&self) -> i64 {
        self.sender
            .as_ref()
            .map(|s| s.next_request_id())
            .unwrap_or(0)
    }

    fn require_session(&mut self, op: MediaOp) -> Option<i64> {
        let session = self
            .destination
            .as_ref()
            .and(self.current.as_ref())
            .map(|s| s.media_session_id);
        if session.is_none() {
            self.emit_operation(op, 0, CastStatus::InvalidRequest);
        }
        session
    }

    fn operation_callback(&self, op: MediaOp) -> TrackerCallback {
        let events = self.events.clone();
        Box::new(move |request_id, status, _extra| {
            let _ = events.send(ChannelEvent::Media(MediaEvent::Operation {
                op,
                request_id,
                status,
            }));
        })
    }

    fn emit_operation(&self, op: MediaOp, request_id: i64, status: CastStatus) {
        let _ = self.events.send(ChannelEvent::Media(MediaEvent::Operation {
            op,
            request_id,
            status,
        }));
    }

    fn tracker_mut(&mut self, op: MediaOp) -> &mut RequestTracker {
        match op {
            MediaOp::Load => &mut self.load,
            MediaOp::Play => &mut self.play,
            MediaOp::Pause => &mut self.pause,
            MediaOp::Stop => &mut self.stop,
            MediaOp::Seek => &mut self.seek,
            MediaOp::Volume => &mut self.volume,
            MediaOp::Mute => &mut self.mute,
            MediaOp::Status => &mut self.status,
        }
    }

    fn issue(&mut self, op: MediaOp, request: &MediaRequest, request_id: i64) {
        let callback = self.operation_callback(op);
        self.tracker_mut(op).track(request_id, Instant::now(), callback);

        let body = match serde_json::to_string(request) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize {:?} request: {}", op, e);
                self.tracker_mut(op)
                    .complete(request_id, CastStatus::InvalidRequest, None);
                return;
            }
        };

        let send_result = match (&self.sender, &self.destination) {
            (Some(sender), Some(destination)) => {
                sender.send_text(&self.namespace, destination, body)
            }
            _ => {
                self.tracker_mut(op)
                    .complete(request_id, CastStatus::InvalidRequest, None);
                return;
            }
        };

        if let Err(e) = send_result {
            warn!("Failed to queue {:?} request: {}", op, e);
            let status = match e {
                WireError::TooLarge { .. } => CastStatus::MessageTooLarge,
                _ => CastStatus::InvalidRequest,
            };
            self.tracker_mut(op).complete(request_id, status, None);
        }
    }

    fn handle_status(&mut self, message: MediaStatusMessage, now: Instant) {
        if let Some(request_id) = message.request_id {
            for op in ALL_OPS {
                if self.tracker_mut(op).complete(request_id, CastStatus::Ok, None) {
                    break;
                }
            }
        }

        // Prefer the entry for the tracked session, else take the first.
        let tracked_session = self.current.as_ref().map(|s| s.media_session_id);
        let mut statuses = message.status;
        let new = match tracked_session
            .and_then(|id| statuses.iter().position(|s| s.media_session_id == id))
        {
            Some(index) => Some(statuses.swap_remove(index)),
            None => {
                if statuses.is_empty() {
                    None
                } else {
                    Some(statuses.swap_remove(0))
                }
            }
        };

        let Some(mut new) = new else {
            // Empty status list: the media session ended.
            if self.current.take().is_some() {
                self.status_received_at = None;
                let _ = self.events.send(ChannelEvent::Media(MediaEvent::StatusUpdated {
                    mask: MediaUpdateMask::WHOLE_STATUS,
                }));
            }
            return;
        };

        let mut mask = MediaUpdateMask::empty();
        match &self.current {
            None => {
                mask |= MediaUpdateMask::WHOLE_STATUS
                    | MediaUpdateMask::POSITION
                    | MediaUpdateMask::VOLUME;
            }
            Some(old) => {
                if old.media_session_id != new.media_session_id {
                    mask |= MediaUpdateMask::WHOLE_STATUS;
                }
                if old.player_state != new.player_state
                    || old.current_time != new.current_time
                    || old.playback_rate != new.playback_rate
                {
                    mask |= MediaUpdateMask::POSITION;
                }
                if old.volume != new.volume {
                    mask |= MediaUpdateMask::VOLUME;
                }
            }
        }
        if new.media.is_some() {
            mask |= MediaUpdateMask::METADATA;
        }

        // The receiver omits `media` when it is unchanged; keep the
        // previous information in that case.
        if new.media.is_none() {
            if let Some(old) = self.current.take() {
                new.media = old.media;
            }
        }
        self.current = Some(new);
        self.status_received_at = Some(now);

        if mask.intersects(
            MediaUpdateMask::WHOLE_STATUS | MediaUpdateMask::POSITION | MediaUpdateMask::VOLUME,
        ) {
            let _ = self
                .events
                .send(ChannelEvent::Media(MediaEvent::StatusUpdated { mask }));
        }
        if mask.contains(MediaUpdateMask::METADATA) {
            let _ = self
                .events
                .send(ChannelEvent::Media(MediaEvent::MetadataUpdated));
        }
    }
}

impl CastChannel for MediaControlChannel {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn on_text_message(&mut self, message: &CastMessage) {
        let Some(body) = message.body() else {
            return;
        };
        match message_type(body).as_deref() {
            Some(TYPE_MEDIA_STATUS) => match serde_json::from_str::<MediaStatusMessage>(body) {
                Ok(status) => self.handle_status(status, Instant::now()),
                Err(e) => warn!("Malformed media status: {}", e),
            },
            // Receiver-side rejections resolve every outstanding
            // tracker on this channel, not just the matching request.
            Some(TYPE_INVALID_PLAYER_STATE) => {
                self.complete_all(CastStatus::InvalidPlayerState);
            }
            Some(TYPE_LOAD_FAILED) => {
                self.complete_all(CastStatus::LoadFailed);
            }
            Some(TYPE_LOAD_CANCELLED) => {
                self.complete_all(CastStatus::LoadCancelled);
            }
            Some(TYPE_INVALID_REQUEST) => {
                self.complete_all(CastStatus::InvalidRequest);
            }
            other => {
                debug!("Unrecognized media message type {:?}", other);
            }
        }
    }

    fn on_send_failed(&mut self, request_id: i64, status: CastStatus) {
        for op in ALL_OPS {
            if self.tracker_mut(op).complete(request_id, status, None) {
                return;
            }
        }
    }

    fn reset(&mut self) {
        for op in ALL_OPS {
            self.tracker_mut(op).reset();
        }
        self.current = None;
        self.status_received_at = None;
    }

    fn sweep(&mut self, now: Instant) -> bool {
        let timeout = self.request_timeout;
        let mut fired = false;
        for op in ALL_OPS {
            fired |= self.tracker_mut(op).sweep(now, timeout, CastStatus::Timeout);
        }
        fired
    }

    fn has_outstanding(&self) -> bool {
        ALL_OPS.iter().any(|op| match op {
            MediaOp::Load => self.load.is_outstanding(),
            MediaOp::Play => self.play.is_outstanding(),
            MediaOp::Pause => self.pause.is_outstanding(),
            MediaOp::Stop => self.stop.is_outstanding(),
            MediaOp::Seek => self.seek.is_outstanding(),
            MediaOp::Volume => self.volume.is_outstanding(),
            MediaOp::Mute => self.mute.is_outstanding(),
            MediaOp::Status => self.status.is_outstanding(),
        })
    }
}
