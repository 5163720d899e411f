//! Receiver control channel: application lifecycle, volume, and status.
//!
//! Requests go out as JSON bodies on the receiver namespace, one
//! [`RequestTracker`] per operation. Asynchronous status pushes drive
//! application connect/disconnect detection: the channel compares each
//! reported status against the locally desired application and emits
//! the matching events for the owning session to act on.

use crate::channel::{CastChannel, ChannelEvent, MessageSender, ReceiverEvent};
use crate::status::CastStatus;
use crate::tracker::{RequestTracker, TrackerCallback};
use cast_wire::receiver::{
    TYPE_APP_AVAILABILITY, TYPE_INVALID_REQUEST, TYPE_LAUNCH_ERROR, TYPE_RECEIVER_STATUS,
};
use cast_wire::{
    message_type, CastMessage, ErrorResponse, ReceiverRequest, ReceiverStatus,
    ReceiverStatusMessage, ReceiverVolume, WireError,
};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Logical operation slots on the receiver channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverOp {
    /// Launch an application
    Launch,
    /// Join a running application
    Join,
    /// Detach from the connected application
    Leave,
    /// Stop an application session
    Stop,
    /// Request receiver status
    Status,
    /// Change volume level
    Volume,
    /// Change mute state
    Mute,
}

/// Receiver control channel
pub struct ReceiverControlChannel {
    namespace: String,
    destination: String,
    request_timeout: Duration,
    sender: Option<MessageSender>,
    events: mpsc::UnboundedSender<ChannelEvent>,

    launch: RequestTracker,
    join: RequestTracker,
    stop: RequestTracker,
    status: RequestTracker,
    volume: RequestTracker,
    mute: RequestTracker,

    // Application the caller wants to reach, with optional session pin.
    desired_app_id: Option<String>,
    desired_session_id: Option<String>,
    // Launch request to re-issue once a stale session disappears.
    pending_launch: Option<(String, Option<Value>)>,
    launch_retry_allowed: bool,
    // (session_id, transport_id) of the connected application.
    connected_app: Option<(String, String)>,
    last_status: Option<ReceiverStatus>,
}

impl ReceiverControlChannel {
    /// Create a receiver control channel addressing the given endpoint
    pub fn new(
        namespace: impl Into<String>,
        destination: impl Into<String>,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            destination: destination.into(),
            request_timeout,
            sender: None,
            events,
            launch: RequestTracker::new(),
            join: RequestTracker::new(),
            stop: RequestTracker::new(),
            status: RequestTracker::new(),
            volume: RequestTracker::new(),
            mute: RequestTracker::new(),
            desired_app_id: None,
            desired_session_id: None,
            pending_launch: None,
            launch_retry_allowed: false,
            connected_app: None,
            last_status: None,
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

    /// Last status reported by the receiver, if any
    pub fn last_status(&self) -> Option<&ReceiverStatus> {
        self.last_status.as_ref()
    }

    /// (session id, transport id) of the connected application
    pub fn connected_app(&self) -> Option<&(String, String)> {
        self.connected_app.as_ref()
    }

    /// Launch or join an application.
    ///
    /// With `relaunch` the LAUNCH request goes out immediately. Without
    /// it the call is a join attempt first: the current status is
    /// requested and compared, and a launch is only issued when no
    /// application is running. One launch retry is allowed after a
    /// stale session's disappearance is confirmed.
    pub fn launch(&mut self, app_id: &str, params: Option<Value>, relaunch: bool) {
        self.desired_app_id = Some(app_id.to_string());
        self.desired_session_id = None;
        self.pending_launch = Some((app_id.to_string(), params));
        self.launch_retry_allowed = true;

        let status_is_empty = self
            .last_status
            .as_ref()
            .map(|s| s.applications.is_empty())
            .unwrap_or(false);

        if relaunch || status_is_empty {
            self.send_launch();
        } else {
            // Join flow: a fresh status decides between connecting to
            // the running instance and launching a new one.
            let request_id = self.next_request_id();
            self.issue(
                ReceiverOp::Join,
                &ReceiverRequest::GetStatus { request_id },
                request_id,
            );
        }
    }

    /// Join a running application, optionally pinned to a session id
    pub fn join(&mut self, app_id: &str, session_id: Option<String>) {
        self.desired_app_id = Some(app_id.to_string());
        self.desired_session_id = session_id;
        self.pending_launch = None;
        self.launch_retry_allowed = false;

        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Join,
            &ReceiverRequest::GetStatus { request_id },
            request_id,
        );
    }

    /// Detach from the connected application.
    ///
    /// A local no-op reporting "invalid request" when no application is
    /// connected; otherwise the owning session closes the virtual
    /// connection in response to the emitted event.
    pub fn leave(&mut self) {
        match self.connected_app.take() {
            None => {
                self.emit_operation(ReceiverOp::Leave, 0, CastStatus::InvalidRequest);
            }
            Some((_, transport_id)) => {
                self.desired_app_id = None;
                self.desired_session_id = None;
                self.pending_launch = None;
                let _ = self
                    .events
                    .send(ChannelEvent::Receiver(ReceiverEvent::LeaveRequested {
                        transport_id,
                    }));
                self.emit_operation(ReceiverOp::Leave, 0, CastStatus::Ok);
            }
        }
    }

    /// Stop an application session
    pub fn stop(&mut self, session_id: &str) {
        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Stop,
            &ReceiverRequest::Stop {
                request_id,
                session_id: session_id.to_string(),
            },
            request_id,
        );
    }

    /// Request the current receiver status
    pub fn get_status(&mut self) {
        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Status,
            &ReceiverRequest::GetStatus { request_id },
            request_id,
        );
    }

    /// Change the device volume level
    pub fn set_volume(&mut self, level: f64) {
        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Volume,
            &ReceiverRequest::SetVolume {
                request_id,
                volume: ReceiverVolume {
                    level: Some(level),
                    muted: None,
                },
            },
            request_id,
        );
    }

    /// Change the device mute state
    pub fn set_mute(&mut self, muted: bool) {
        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Mute,
            &ReceiverRequest::SetVolume {
                request_id,
                volume: ReceiverVolume {
                    level: None,
                    muted: Some(muted),
                },
            },
            request_id,
        );
    }

    /// Resolve every outstanding tracker with the given status
    pub fn complete_all(&mut self, status: CastStatus) {
        self.launch.complete_outstanding(status, None);
        self.join.complete_outstanding(status, None);
        self.stop.complete_outstanding(status, None);
        self.status.complete_outstanding(status, None);
        self.volume.complete_outstanding(status, None);
        self.mute.complete_outstanding(status, None);
    }

    fn next_request_id(&self) -> i64 {
        self.sender
            .as_ref()
            .map(|s| s.next_request_id())
            .unwrap_or(0)
    }

    fn operation_callback(&self, op: ReceiverOp) -> TrackerCallback {
        let events = self.events.clone();
        Box::new(move |request_id, status, _extra| {
            let _ = events.send(ChannelEvent::Receiver(ReceiverEvent::Operation {
                op,
                request_id,
                status,
            }));
        })
    }

    fn emit_operation(&self, op: ReceiverOp, request_id: i64, status: CastStatus) {
        let _ = self
            .events
            .send(ChannelEvent::Receiver(ReceiverEvent::Operation {
                op,
                request_id,
                status,
            }));
    }

    fn tracker_mut(&mut self, op: ReceiverOp) -> &mut RequestTracker {
        match op {
            ReceiverOp::Launch => &mut self.launch,
            ReceiverOp::Join => &mut self.join,
            ReceiverOp::Stop => &mut self.stop,
            ReceiverOp::Status => &mut self.status,
            ReceiverOp::Volume => &mut self.volume,
            ReceiverOp::Mute => &mut self.mute,
            ReceiverOp::Leave => unreachable!("leave is not tracked"),
        }
    }

    fn issue(&mut self, op: ReceiverOp, request: &ReceiverRequest, request_id: i64) {
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

        let send_result = match &self.sender {
            Some(sender) => sender.send_text(&self.namespace, &self.destination, body),
            None => {
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

    fn send_launch(&mut self) {
        let Some((app_id, params)) = self.pending_launch.clone() else {
            return;
        };
        let request_id = self.next_request_id();
        self.issue(
            ReceiverOp::Launch,
            &ReceiverRequest::Launch {
                request_id,
                app_id,
                app_params: params,
            },
            request_id,
        );
    }

    fn handle_status(&mut self, message: ReceiverStatusMessage) {
        let status = message.status;
        self.last_status = Some(status.clone());
        let _ = self
            .events
            .send(ChannelEvent::Receiver(ReceiverEvent::StatusUpdated {
                status: status.clone(),
            }));

        if let Some(request_id) = message.request_id {
            for op in [
                ReceiverOp::Stop,
                ReceiverOp::Status,
                ReceiverOp::Volume,
                ReceiverOp::Mute,
            ] {
                if self.tracker_mut(op).complete(request_id, CastStatus::Ok, None) {
                    break;
                }
            }
        }

        match self.desired_app_id.clone() {
            Some(desired) => self.evaluate_desired(&desired, &status),
            None => {
                // No pending target; watch for the connected application
                // disappearing from the reported status.
                let gone = match &self.connected_app {
                    Some((session_id, _)) => !status
                        .applications
                        .iter()
                        .any(|app| &app.session_id == session_id),
                    None => false,
                };
                if gone {
                    self.connected_app = None;
                    let _ = self
                        .events
                        .send(ChannelEvent::Receiver(ReceiverEvent::ApplicationGone {
                            status: CastStatus::ApplicationNotRunning,
                        }));
                }
            }
        }
    }

    fn evaluate_desired(&mut self, desired: &str, status: &ReceiverStatus) {
        let candidate = status.application(desired).filter(|app| {
            self.desired_session_id
                .as_ref()
                .map(|pinned| &app.session_id == pinned)
                .unwrap_or(true)
        });

        match candidate {
            Some(app) if app.transport_id.is_some() => {
                let app = app.clone();
                let transport_id = app.transport_id.clone().expect("checked above");
                self.desired_app_id = None;
                self.desired_session_id = None;
                self.pending_launch = None;
                self.launch.complete_outstanding(CastStatus::Ok, None);
                self.join.complete_outstanding(CastStatus::Ok, None);

                let newly_connected = self
                    .connected_app
                    .as_ref()
                    .map(|(session, _)| session != &app.session_id)
                    .unwrap_or(true);
                if newly_connected {
                    self.connected_app = Some((app.session_id.clone(), transport_id));
                    let _ = self.events.send(ChannelEvent::Receiver(
                        ReceiverEvent::ApplicationConnected { app },
                    ));
                }
            }
            Some(_) => {
                // Running but not yet addressable; wait for the next push.
                debug!("Application {} has no transport id yet", desired);
            }
            None if self.pending_launch.is_some() => {
                if !status.applications.is_empty() {
                    // A stale session is still active; its disappearance
                    // will arrive as another status push.
                    debug!("Waiting for stale session to stop before launching {}", desired);
                } else if self.launch_retry_allowed {
                    self.launch_retry_allowed = false;
                    self.send_launch();
                } else {
                    self.desired_app_id = None;
                    self.desired_session_id = None;
                    self.pending_launch = None;
                    self.launch
                        .complete_outstanding(CastStatus::ApplicationNotFound, None);
                    let _ = self
                        .events
                        .send(ChannelEvent::Receiver(ReceiverEvent::ApplicationGone {
                            status: CastStatus::ApplicationNotFound,
                        }));
                }
            }
            None => {
                self.desired_app_id = None;
                self.desired_session_id = None;
                self.join
                    .complete_outstanding(CastStatus::ApplicationNotRunning, None);
                let _ = self
                    .events
                    .send(ChannelEvent::Receiver(ReceiverEvent::ApplicationGone {
                        status: CastStatus::ApplicationNotRunning,
                    }));
            }
        }
    }
}

impl CastChannel for ReceiverControlChannel {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn on_text_message(&mut self, message: &CastMessage) {
        let Some(body) = message.body() else {
            return;
        };
        match message_type(body).as_deref() {
            Some(TYPE_RECEIVER_STATUS) => match serde_json::from_str::<ReceiverStatusMessage>(body)
            {
                Ok(status) => self.handle_status(status),
                Err(e) => warn!("Malformed receiver status: {}", e),
            },
            Some(TYPE_LAUNCH_ERROR) => {
                let reason = serde_json::from_str::<ErrorResponse>(body)
                    .ok()
                    .and_then(|r| r.reason);
                warn!("Launch rejected by receiver: {:?}", reason);
                self.desired_app_id = None;
                self.desired_session_id = None;
                self.pending_launch = None;
                self.launch
                    .complete_outstanding(CastStatus::ApplicationNotFound, None);
                let _ = self
                    .events
                    .send(ChannelEvent::Receiver(ReceiverEvent::ApplicationGone {
                        status: CastStatus::ApplicationNotFound,
                    }));
            }
            Some(TYPE_INVALID_REQUEST) => {
                warn!("Receiver rejected a request as invalid");
                self.complete_all(CastStatus::InvalidRequest);
            }
            Some(TYPE_APP_AVAILABILITY) => {
                debug!("Ignoring app availability reply outside a probe");
            }
            other => {
                debug!("Unrecognized receiver message type {:?}", other);
            }
        }
    }

    fn on_send_failed(&mut self, request_id: i64, status: CastStatus) {
        for op in [
            ReceiverOp::Launch,
            ReceiverOp::Join,
            ReceiverOp::Stop,
            ReceiverOp::Status,
            ReceiverOp::Volume,
            ReceiverOp::Mute,
        ] {
            if self.tracker_mut(op).complete(request_id, status, None) {
                return;
            }
        }
    }

    fn reset(&mut self) {
        self.launch.reset();
        self.join.reset();
        self.stop.reset();
        self.status.reset();
        self.volume.reset();
        self.mute.reset();
        self.desired_app_id = None;
        self.desired_session_id = None;
        self.pending_launch = None;
        self.launch_retry_allowed = false;
        self.connected_app = None;
        self.last_status = None;
    }

    fn sweep(&mut self, now: Instant) -> bool {
        let timeout = self.request_timeout;
        let mut fired = false;
        for op in [
            ReceiverOp::Launch,
            ReceiverOp::Join,
            ReceiverOp::Stop,
            ReceiverOp::Status,
            ReceiverOp::Volume,
            ReceiverOp::Mute,
        ] {
            fired |= self.tracker_mut(op).sweep(now, timeout, CastStatus::Timeout);
        }
        fired
    }

    fn has_outstanding(&self) -> bool {
        self.launch.is_outstanding()
            || self.join.is_outstanding()
            || self.stop.is_outstanding()
            || self.status.is_outstanding()
            || self.volume.is_outstanding()
            || self.mute.is_outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_wire::{ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_RECEIVER};

    fn bound_channel() -> (
        ReceiverControlChannel,
        mpsc::UnboundedReceiver<CastMessage>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut channel = ReceiverControlChannel::new(
            NS_RECEIVER,
            ENDPOINT_RECEIVER,
            Duration::from_secs(10),
            event_tx,
        );
        channel.bind(MessageSender::new(ENDPOINT_SENDER, out_tx));
        (channel, out_rx, event_rx)
    }

    fn status_push(request_id: Option<i64>, body: &str) -> CastMessage {
        let payload = match request_id {
            Some(id) => format!(r#"{{"type":"RECEIVER_STATUS","requestId":{id},"status":{body}}}"#),
            None => format!(r#"{{"type":"RECEIVER_STATUS","status":{body}}}"#),
        };
        CastMessage::text(ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_RECEIVER, payload)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn sent_request_id(message: &CastMessage) -> i64 {
        let body: serde_json::Value = serde_json::from_str(message.body().unwrap()).unwrap();
        body["requestId"].as_i64().unwrap()
    }

    #[test]
    fn test_join_success_connects_once() {
        let (mut channel, mut out_rx, mut events) = bound_channel();

        channel.join("APP-X", Some("S".to_string()));
        let get_status = out_rx.try_recv().unwrap();
        assert!(get_status.body().unwrap().contains("GET_STATUS"));
        let request_id = sent_request_id(&get_status);

        let reply = status_push(
            Some(request_id),
            r#"{"applications":[{"appId":"APP-X","sessionId":"S","transportId":"T123","namespaces":[]}]}"#,
        );
        channel.on_text_message(&reply);
        // A duplicate push must not re-announce the connection.
        channel.on_text_message(&reply);

        let connected: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Receiver(ReceiverEvent::ApplicationConnected { app }) => Some(app),
                _ => None,
            })
            .collect();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].transport_id.as_deref(), Some("T123"));
        assert_eq!(
            channel.connected_app(),
            Some(&("S".to_string(), "T123".to_string()))
        );
    }

    #[test]
    fn test_join_absent_app_reports_not_running() {
        let (mut channel, mut out_rx, mut events) = bound_channel();

        channel.join("APP-X", None);
        let request_id = sent_request_id(&out_rx.try_recv().unwrap());
        channel.on_text_message(&status_push(Some(request_id), r#"{"applications":[]}"#));

        let statuses: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Receiver(ReceiverEvent::ApplicationGone { status }) => Some(status),
                ChannelEvent::Receiver(ReceiverEvent::Operation {
                    op: ReceiverOp::Join,
                    status,
                    ..
                }) => Some(status),
                _ => None,
            })
            .collect();
        assert!(statuses.contains(&CastStatus::ApplicationNotRunning));
        assert!(!channel.has_outstanding());
    }

    #[test]
    fn test_launch_retries_once_after_stale_session() {
        let (mut channel, mut out_rx, mut events) = bound_channel();

        channel.launch("APP-NEW", None, true);
        let first_launch = out_rx.try_recv().unwrap();
        assert!(first_launch.body().unwrap().contains("LAUNCH"));

        // A stale session is still reported; the channel waits.
        channel.on_text_message(&status_push(
            None,
            r#"{"applications":[{"appId":"APP-OLD","sessionId":"old","transportId":"T0","namespaces":[]}]}"#,
        ));
        assert!(out_rx.try_recv().is_err());

        // The stale session disappears: exactly one retry goes out.
        channel.on_text_message(&status_push(None, r#"{"applications":[]}"#));
        let retry = out_rx.try_recv().unwrap();
        assert!(retry.body().unwrap().contains("LAUNCH"));
        assert!(retry.body().unwrap().contains("APP-NEW"));

        // Still absent: the launch gives up instead of retrying again.
        channel.on_text_message(&status_push(None, r#"{"applications":[]}"#));
        assert!(out_rx.try_recv().is_err());

        let gone: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Receiver(ReceiverEvent::ApplicationGone { status }) => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(gone, vec![CastStatus::ApplicationNotFound]);
    }

    #[test]
    fn test_invalid_request_broadcasts_to_all_trackers() {
        let (mut channel, _out_rx, mut events) = bound_channel();

        channel.get_status();
        channel.set_volume(0.5);
        channel.set_mute(true);
        assert!(channel.has_outstanding());

        let rejection = CastMessage::text(
            ENDPOINT_RECEIVER,
            ENDPOINT_SENDER,
            NS_RECEIVER,
            r#"{"type":"INVALID_REQUEST","reason":"BAD"}"#,
        );
        channel.on_text_message(&rejection);

        let failed: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Receiver(ReceiverEvent::Operation { op, status, .. }) => {
                    Some((op, status))
                }
                _ => None,
            })
            .collect();
        assert!(failed.contains(&(ReceiverOp::Status, CastStatus::InvalidRequest)));
        assert!(failed.contains(&(ReceiverOp::Volume, CastStatus::InvalidRequest)));
        assert!(failed.contains(&(ReceiverOp::Mute, CastStatus::InvalidRequest)));
        assert!(!channel.has_outstanding());
    }

    #[test]
    fn test_leave_without_app_is_local_invalid_request() {
        let (mut channel, mut out_rx, mut events) = bound_channel();

        channel.leave();

        assert!(out_rx.try_recv().is_err());
        match events.try_recv().unwrap() {
            ChannelEvent::Receiver(ReceiverEvent::Operation {
                op: ReceiverOp::Leave,
                status,
                ..
            }) => assert_eq!(status, CastStatus::InvalidRequest),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_connected_app_disappearing_is_reported() {
        let (mut channel, mut out_rx, mut events) = bound_channel();

        channel.join("APP-X", None);
        let request_id = sent_request_id(&out_rx.try_recv().unwrap());
        channel.on_text_message(&status_push(
            Some(request_id),
            r#"{"applications":[{"appId":"APP-X","sessionId":"S","transportId":"T1","namespaces":[]}]}"#,
        ));
        drain_events(&mut events);

        channel.on_text_message(&status_push(None, r#"{"applications":[]}"#));
        let gone = drain_events(&mut events).into_iter().any(|e| {
            matches!(
                e,
                ChannelEvent::Receiver(ReceiverEvent::ApplicationGone {
                    status: CastStatus::ApplicationNotRunning,
                })
            )
        });
        assert!(gone);
        assert!(channel.connected_app().is_none());
    }
}
