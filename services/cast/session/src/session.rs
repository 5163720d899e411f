//! Device session: connection state machine, channel mounting, and
//! reconnection.
//!
//! Each session is an actor: one task owns every piece of session
//! state, and all transitions happen on that task. The public
//! [`DeviceSession`] handle posts commands over a queue; the transport
//! read loop runs on its own task and hands decoded messages to the
//! same queue discipline, so no two handlers ever mutate session state
//! concurrently. Outcomes are reported through a [`SessionEvent`]
//! stream, never by blocking the caller.

use crate::channel::{
    CastChannel, ChannelEvent, ConnectionEvent, MediaEvent, MessageSender, ReceiverEvent,
};
use crate::connection::ConnectionChannel;
use crate::heartbeat::{HeartbeatChannel, HEARTBEAT_TICK};
use crate::media::{MediaControlChannel, MediaOp, MediaUpdateMask};
use crate::receiver::{ReceiverControlChannel, ReceiverOp};
use crate::reconnect::ReconnectStrategy;
use crate::reconnect::RetryDecision;
use crate::status::{CastStatus, SessionError};
use crate::transport::{self, SendError};
use bytes::{Bytes, BytesMut};
use cast_wire::{
    ApplicationInfo, CastMessage, FrameDecoder, MediaInformation, Payload, ReceiverStatus,
    ResumeState, SenderInfo, MAX_NAMESPACE_LEN,
};
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

/// Interval of the request-timeout sweep
const SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Wire-format constants the engine is parameterized over.
///
/// Both historical protocol variants differ only in these strings, so
/// one engine serves either by swapping the profile.
#[derive(Clone, Debug)]
pub struct ProtocolProfile {
    /// Namespace of the virtual-connection handshake
    pub connection_namespace: String,
    /// Namespace of the keep-alive channel
    pub heartbeat_namespace: String,
    /// Namespace of receiver control
    pub receiver_namespace: String,
    /// Namespace of media control
    pub media_namespace: String,
    /// Well-known endpoint id of the receiver runtime
    pub receiver_endpoint: String,
    /// Endpoint id used as the source of every message
    pub sender_endpoint: String,
    /// Sender identity carried in CONNECT
    pub sender_info: SenderInfo,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self {
            connection_namespace: cast_wire::NS_CONNECTION.to_string(),
            heartbeat_namespace: cast_wire::NS_HEARTBEAT.to_string(),
            receiver_namespace: cast_wire::NS_RECEIVER.to_string(),
            media_namespace: cast_wire::NS_MEDIA.to_string(),
            receiver_endpoint: cast_wire::ENDPOINT_RECEIVER.to_string(),
            sender_endpoint: cast_wire::ENDPOINT_SENDER.to_string(),
            sender_info: SenderInfo {
                package: "castlink".to_string(),
                platform: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Configuration for a device session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for the transport connect
    pub connect_timeout: Duration,
    /// Silence duration after which the link is considered dead
    pub heartbeat_timeout: Duration,
    /// Deadline for tracked requests
    pub request_timeout: Duration,
    /// Wire-format constants
    pub profile: ProtocolProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            profile: ProtocolProfile::default(),
        }
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport connect in flight (or a reconnect window is active)
    Connecting,
    /// Transport established
    Connected,
    /// Teardown in progress
    Disconnecting,
}

/// Events emitted by a device session
#[derive(Debug)]
pub enum SessionEvent {
    /// The transport is established
    Connected,
    /// The first connect attempt failed terminally
    ConnectFailed {
        /// Why the connect failed
        status: CastStatus,
    },
    /// The session is disconnected (requested, timed out, or the
    /// reconnect window expired)
    Disconnected {
        /// Why the session ended
        status: CastStatus,
    },
    /// The targeted application is running and addressable
    ApplicationConnected {
        /// Application metadata
        app: ApplicationInfo,
    },
    /// The connected application went away
    ApplicationDisconnected {
        /// Why the application is gone
        status: CastStatus,
    },
    /// Joining or launching the targeted application failed
    ApplicationConnectionFailed {
        /// Why the application could not be reached
        status: CastStatus,
    },
    /// Device volume or mute changed
    VolumeChanged {
        /// Volume level in [0.0, 1.0]
        level: f64,
        /// Mute state
        muted: bool,
    },
    /// A message arrived on an ad-hoc subscribed namespace
    MessageReceived {
        /// Namespace the message arrived on
        namespace: String,
        /// UTF-8 payload body
        body: String,
    },
    /// A caller-sent message completed
    SendComplete {
        /// Caller-supplied request id
        request_id: i64,
        /// Outcome
        status: CastStatus,
    },
    /// A receiver control operation completed
    ReceiverOperation {
        /// Which operation completed
        op: ReceiverOp,
        /// Correlation id of the request
        request_id: i64,
        /// Outcome
        status: CastStatus,
    },
    /// A media control operation completed
    MediaOperation {
        /// Which operation completed
        op: MediaOp,
        /// Correlation id of the request
        request_id: i64,
        /// Outcome
        status: CastStatus,
    },
    /// The media status snapshot changed
    MediaStatusUpdated {
        /// Which parts changed
        mask: MediaUpdateMask,
    },
    /// The loaded media's metadata changed
    MediaMetadataUpdated,
}

enum SessionCommand {
    Connect,
    Disconnect,
    Launch {
        app_id: String,
        params: Option<Value>,
        relaunch: bool,
    },
    Join {
        app_id: String,
    },
    StopApplication,
    LeaveApplication,
    RequestStatus,
    SetVolume {
        level: f64,
        mute: bool,
    },
    SendText {
        namespace: String,
        body: String,
        request_id: i64,
    },
    SendBinary {
        namespace: String,
        payload: Bytes,
        request_id: i64,
    },
    Subscribe {
        namespace: String,
    },
    Unsubscribe {
        namespace: String,
    },
    LoadMedia {
        media: MediaInformation,
        autoplay: bool,
        position_ms: u64,
        custom_data: Option<Value>,
        reply: oneshot::Sender<Result<i64, CastStatus>>,
    },
    PlayMedia,
    PauseMedia,
    StopMedia,
    SeekMedia {
        position_ms: u64,
        resume_state: Option<ResumeState>,
    },
    SetStreamVolume {
        level: f64,
    },
    SetStreamMute {
        muted: bool,
    },
    RequestMediaStatus,
    StreamPosition {
        reply: oneshot::Sender<Option<u64>>,
    },
    AddReference,
    ReleaseReference,
}

/// Handle to a running device session.
///
/// Cheap to clone; every clone posts to the same session task. The
/// session is torn down when its reference count reaches zero, not
/// when handles are dropped, so holders must pair [`add_reference`]
/// with [`release_reference`].
///
/// [`add_reference`]: DeviceSession::add_reference
/// [`release_reference`]: DeviceSession::release_reference
#[derive(Clone)]
pub struct DeviceSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl DeviceSession {
    /// Spawn a session actor for the device at `addr`.
    ///
    /// The session starts Disconnected with a reference count of one.
    pub fn spawn(addr: SocketAddr, config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let actor = SessionActor::new(addr, config, command_rx, event_tx);
        tokio::spawn(actor.run());
        (
            Self {
                commands: command_tx,
            },
            event_rx,
        )
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Detached)
    }

    /// Open the transport; a no-op while connecting or connected
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect)
    }

    /// Close the transport and report `Disconnected`
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect)
    }

    /// Launch an application, or join it when `relaunch` is false
    pub fn launch_application(
        &self,
        app_id: impl Into<String>,
        params: Option<Value>,
        relaunch: bool,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Launch {
            app_id: app_id.into(),
            params,
            relaunch,
        })
    }

    /// Join a running application by id
    pub fn join_application(&self, app_id: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Join {
            app_id: app_id.into(),
        })
    }

    /// Stop the current application session
    pub fn stop_application(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopApplication)
    }

    /// Detach from the connected application without stopping it
    pub fn leave_application(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::LeaveApplication)
    }

    /// Request a receiver status refresh
    pub fn request_status(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RequestStatus)
    }

    /// Set device volume and mute state
    pub fn set_volume(&self, level: f64, mute: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetVolume { level, mute })
    }

    /// Send a text message to the connected application.
    ///
    /// Validated before any I/O; the outcome arrives as
    /// [`SessionEvent::SendComplete`] carrying `request_id`.
    pub fn send_text(
        &self,
        namespace: impl Into<String>,
        body: impl Into<String>,
        request_id: i64,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::SendText {
            namespace: namespace.into(),
            body: body.into(),
            request_id,
        })
    }

    /// Send a binary message to the connected application
    pub fn send_binary(
        &self,
        namespace: impl Into<String>,
        payload: Bytes,
        request_id: i64,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::SendBinary {
            namespace: namespace.into(),
            payload,
            request_id,
        })
    }

    /// Subscribe to inbound messages on an ad-hoc namespace
    pub fn set_message_received(
        &self,
        namespace: impl Into<String>,
        present: bool,
    ) -> Result<(), SessionError> {
        let namespace = namespace.into();
        if present {
            self.send(SessionCommand::Subscribe { namespace })
        } else {
            self.send(SessionCommand::Unsubscribe { namespace })
        }
    }

    /// Load media; resolves with the issued request id.
    ///
    /// `position_ms` is the start position in integer milliseconds.
    pub async fn load_media(
        &self,
        media: MediaInformation,
        autoplay: bool,
        position_ms: u64,
        custom_data: Option<Value>,
    ) -> Result<i64, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::LoadMedia {
            media,
            autoplay,
            position_ms,
            custom_data,
            reply,
        })?;
        match response.await {
            Ok(Ok(request_id)) => Ok(request_id),
            Ok(Err(status)) => Err(SessionError::Rejected(status)),
            Err(_) => Err(SessionError::Detached),
        }
    }

    /// Resume media playback
    pub fn play_media(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::PlayMedia)
    }

    /// Pause media playback
    pub fn pause_media(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::PauseMedia)
    }

    /// Stop and unload the media
    pub fn stop_media(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StopMedia)
    }

    /// Seek to a position in integer milliseconds
    pub fn seek_media(
        &self,
        position_ms: u64,
        resume_state: Option<ResumeState>,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::SeekMedia {
            position_ms,
            resume_state,
        })
    }

    /// Set the stream volume level
    pub fn set_stream_volume(&self, level: f64) -> Result<(), SessionError> {
        self.send(SessionCommand::SetStreamVolume { level })
    }

    /// Set the stream mute state
    pub fn set_stream_mute(&self, muted: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetStreamMute { muted })
    }

    /// Request a media status refresh
    pub fn request_media_status(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::RequestMediaStatus)
    }

    /// Extrapolated stream position in milliseconds, if media is loaded
    pub async fn approximate_stream_position(&self) -> Result<Option<u64>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::StreamPosition { reply })?;
        response.await.map_err(|_| SessionError::Detached)
    }

    /// Take an additional reference on the session
    pub fn add_reference(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::AddReference)
    }

    /// Release one reference; the session tears down at zero
    pub fn release_reference(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::ReleaseReference)
    }
}

enum TransportInput {
    Message(CastMessage),
    Closed(Option<io::Error>),
}

enum Internal {
    Connected(io::Result<TcpStream>),
    Transport(TransportInput),
}

struct InternalMsg {
    epoch: u64,
    input: Internal,
}

enum Step {
    Command(SessionCommand),
    HandlesDropped,
    Internal(InternalMsg),
    Outbound(CastMessage),
    Channel(ChannelEvent),
    HeartbeatTick,
    SweepTick,
    ReconnectFire,
}

struct SessionActor {
    addr: SocketAddr,
    config: SessionConfig,
    state: ConnectionState,
    refs: u32,
    // Bumped on every connect attempt and teardown; inputs tagged with
    // an older epoch come from a dead transport and are ignored.
    epoch: u64,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    internal_rx: mpsc::UnboundedReceiver<InternalMsg>,
    outbound_tx: mpsc::UnboundedSender<CastMessage>,
    outbound_rx: mpsc::UnboundedReceiver<CastMessage>,
    channel_events_rx: mpsc::UnboundedReceiver<ChannelEvent>,

    writer: Option<tokio::net::tcp::OwnedWriteHalf>,
    read_task: Option<JoinHandle<()>>,

    connection: ConnectionChannel,
    heartbeat: HeartbeatChannel,
    receiver: ReceiverControlChannel,
    media: MediaControlChannel,
    subscriptions: HashSet<String>,

    app: Option<ApplicationInfo>,
    last_app_id: Option<String>,
    last_session_id: Option<String>,
    volume_level: f64,
    muted: bool,
    first_status: bool,

    reconnect: ReconnectStrategy,
    reconnect_sleep: Option<Pin<Box<Sleep>>>,
    heartbeat_ticker: Option<Interval>,
    sweep_ticker: Option<Interval>,
}

impl SessionActor {
    fn new(
        addr: SocketAddr,
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (channel_events_tx, channel_events_rx) = mpsc::unbounded_channel();

        let profile = &config.profile;
        let connection = ConnectionChannel::new(
            profile.connection_namespace.clone(),
            profile.sender_info.clone(),
            channel_events_tx.clone(),
        );
        let heartbeat = HeartbeatChannel::new(
            profile.heartbeat_namespace.clone(),
            profile.receiver_endpoint.clone(),
        );
        let receiver = ReceiverControlChannel::new(
            profile.receiver_namespace.clone(),
            profile.receiver_endpoint.clone(),
            config.request_timeout,
            channel_events_tx.clone(),
        );
        let media = MediaControlChannel::new(
            profile.media_namespace.clone(),
            config.request_timeout,
            channel_events_tx,
        );

        Self {
            addr,
            config,
            state: ConnectionState::Disconnected,
            refs: 1,
            epoch: 0,
            commands,
            events,
            internal_tx,
            internal_rx,
            outbound_tx,
            outbound_rx,
            channel_events_rx,
            writer: None,
            read_task: None,
            connection,
            heartbeat,
            receiver,
            media,
            subscriptions: HashSet::new(),
            app: None,
            last_app_id: None,
            last_session_id: None,
            volume_level: 0.0,
            muted: false,
            first_status: true,
            reconnect: ReconnectStrategy::new(),
            reconnect_sleep: None,
            heartbeat_ticker: None,
            sweep_ticker: None,
        }
    }

    async fn run(mut self) {
        info!("Starting device session for {}", self.addr);

        loop {
            let step = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::HandlesDropped,
                },

                Some(message) = self.internal_rx.recv() => Step::Internal(message),

                Some(event) = self.channel_events_rx.recv() => Step::Channel(event),

                Some(message) = self.outbound_rx.recv() => Step::Outbound(message),

                _ = Self::tick(&mut self.heartbeat_ticker), if self.heartbeat_ticker.is_some() => {
                    Step::HeartbeatTick
                }

                _ = Self::tick(&mut self.sweep_ticker), if self.sweep_ticker.is_some() => {
                    Step::SweepTick
                }

                _ = Self::sleep(&mut self.reconnect_sleep), if self.reconnect_sleep.is_some() => {
                    Step::ReconnectFire
                }
            };

            let keep_running = match step {
                Step::Command(command) => self.handle_command(command).await,
                Step::HandlesDropped => {
                    debug!("All session handles dropped for {}", self.addr);
                    false
                }
                Step::Internal(message) => {
                    self.handle_internal(message).await;
                    true
                }
                Step::Outbound(message) => {
                    self.write_message(message).await;
                    true
                }
                Step::Channel(event) => {
                    self.handle_channel_event(event).await;
                    true
                }
                Step::HeartbeatTick => {
                    self.on_heartbeat_tick().await;
                    true
                }
                Step::SweepTick => {
                    self.on_sweep_tick();
                    true
                }
                Step::ReconnectFire => {
                    self.on_reconnect_fire();
                    true
                }
            };

            if !keep_running {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn tick(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn sleep(sleep: &mut Option<Pin<Box<Sleep>>>) {
        match sleep {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }

    async fn emit(&self, event: SessionEvent) {
        // The receiver going away is not an error for the session.
        let _ = self.events.send(event).await;
    }

    /// Returns false when the session should tear down.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Connect => self.start_connect(),
            SessionCommand::Disconnect => {
                self.disconnect_terminal(CastStatus::Ok, true).await;
            }
            SessionCommand::Launch {
                app_id,
                params,
                relaunch,
            } => {
                self.receiver.launch(&app_id, params, relaunch);
            }
            SessionCommand::Join { app_id } => {
                self.receiver.join(&app_id, None);
            }
            SessionCommand::StopApplication => {
                let session_id = self
                    .receiver
                    .connected_app()
                    .map(|(session, _)| session.clone())
                    .or_else(|| {
                        self.receiver
                            .last_status()
                            .and_then(|s| s.applications.first())
                            .map(|app| app.session_id.clone())
                    });
                match session_id {
                    Some(session_id) => self.receiver.stop(&session_id),
                    None => {
                        self.emit(SessionEvent::ReceiverOperation {
                            op: ReceiverOp::Stop,
                            request_id: 0,
                            status: CastStatus::InvalidRequest,
                        })
                        .await;
                    }
                }
            }
            SessionCommand::LeaveApplication => {
                self.receiver.leave();
            }
            SessionCommand::RequestStatus => {
                self.receiver.get_status();
            }
            SessionCommand::SetVolume { level, mute } => {
                if !(0.0..=1.0).contains(&level) {
                    self.emit(SessionEvent::ReceiverOperation {
                        op: ReceiverOp::Volume,
                        request_id: 0,
                        status: CastStatus::InvalidRequest,
                    })
                    .await;
                } else {
                    self.receiver.set_volume(level);
                    if mute != self.muted {
                        self.receiver.set_mute(mute);
                    }
                }
            }
            SessionCommand::SendText {
                namespace,
                body,
                request_id,
            } => {
                self.send_user_message(namespace, Payload::Text(body), request_id)
                    .await;
            }
            SessionCommand::SendBinary {
                namespace,
                payload,
                request_id,
            } => {
                self.send_user_message(namespace, Payload::Binary(payload), request_id)
                    .await;
            }
            SessionCommand::Subscribe { namespace } => {
                self.subscriptions.insert(namespace);
            }
            SessionCommand::Unsubscribe { namespace } => {
                self.subscriptions.remove(&namespace);
            }
            SessionCommand::LoadMedia {
                media,
                autoplay,
                position_ms,
                custom_data,
                reply,
            } => {
                let result = self.media.load(media, autoplay, position_ms, custom_data);
                let _ = reply.send(result);
            }
            SessionCommand::PlayMedia => self.media.play(),
            SessionCommand::PauseMedia => self.media.pause(),
            SessionCommand::StopMedia => self.media.stop(),
            SessionCommand::SeekMedia {
                position_ms,
                resume_state,
            } => self.media.seek(position_ms, resume_state),
            SessionCommand::SetStreamVolume { level } => self.media.set_stream_volume(level),
            SessionCommand::SetStreamMute { muted } => self.media.set_stream_mute(muted),
            SessionCommand::RequestMediaStatus => self.media.get_status(),
            SessionCommand::StreamPosition { reply } => {
                let _ = reply.send(self.media.approximate_stream_position(Instant::now()));
            }
            SessionCommand::AddReference => {
                self.refs += 1;
            }
            SessionCommand::ReleaseReference => {
                if self.refs == 0 {
                    warn!("Release with no outstanding references on {}", self.addr);
                } else {
                    self.refs -= 1;
                    if self.refs == 0 {
                        return false;
                    }
                }
            }
        }
        self.ensure_sweep();
        true
    }

    fn start_connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!("Connect ignored in state {:?}", self.state);
            return;
        }
        self.state = ConnectionState::Connecting;
        self.spawn_connect();
    }

    fn spawn_connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let addr = self.addr;
        let timeout = self.config.connect_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport::connect_tcp(addr, timeout).await;
            let _ = tx.send(InternalMsg {
                epoch,
                input: Internal::Connected(result),
            });
        });
    }

    async fn handle_internal(&mut self, message: InternalMsg) {
        if message.epoch != self.epoch {
            return;
        }
        match message.input {
            Internal::Connected(Ok(stream)) => self.on_transport_connected(stream).await,
            Internal::Connected(Err(e)) => self.on_connect_failed(e).await,
            Internal::Transport(TransportInput::Message(message)) => {
                self.on_message(message).await;
            }
            Internal::Transport(TransportInput::Closed(error)) => {
                self.on_transport_lost(error).await;
            }
        }
    }

    async fn on_transport_connected(&mut self, stream: TcpStream) {
        if self.state != ConnectionState::Connecting {
            debug!("Dropping transport established in state {:?}", self.state);
            return;
        }
        info!("Transport established to {}", self.addr);

        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        self.read_task = Some(spawn_read_loop(
            read_half,
            self.epoch,
            self.internal_tx.clone(),
        ));

        let sender = MessageSender::new(
            self.config.profile.sender_endpoint.clone(),
            self.outbound_tx.clone(),
        );
        self.connection.bind(sender.clone());
        self.heartbeat.bind(sender.clone());
        self.receiver.bind(sender.clone());
        self.media.bind(sender);

        self.state = ConnectionState::Connected;
        let mut ticker = tokio::time::interval(HEARTBEAT_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat_ticker = Some(ticker);
        self.heartbeat.note_activity(Instant::now());

        let receiver_endpoint = self.config.profile.receiver_endpoint.clone();
        self.connection.connect_to(&receiver_endpoint);
        self.emit(SessionEvent::Connected).await;

        match (self.last_app_id.clone(), self.last_session_id.clone()) {
            (Some(app_id), Some(session_id)) => {
                debug!("Rejoining remembered application {}", app_id);
                self.receiver.join(&app_id, Some(session_id));
            }
            _ => {
                self.reconnect.end_window();
                self.receiver.get_status();
            }
        }
        self.ensure_sweep();
    }

    async fn on_connect_failed(&mut self, error: io::Error) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        let status = CastStatus::from_transport_error(&error);
        warn!("Connect to {} failed: {}", self.addr, error);

        match self.reconnect.next_delay(Instant::now()) {
            RetryDecision::Retry(delay) => {
                debug!("Retrying connect to {} in {:?}", self.addr, delay);
                self.reconnect_sleep = Some(Box::pin(tokio::time::sleep(delay)));
            }
            RetryDecision::NotReconnecting => {
                self.state = ConnectionState::Disconnected;
                self.emit(SessionEvent::ConnectFailed { status }).await;
            }
            RetryDecision::Expired => {
                self.state = ConnectionState::Disconnected;
                self.emit(SessionEvent::Disconnected { status }).await;
            }
        }
    }

    fn on_reconnect_fire(&mut self) {
        self.reconnect_sleep = None;
        if self.state == ConnectionState::Connecting {
            self.reconnect.mark_attempt(Instant::now());
            self.spawn_connect();
        }
    }

    async fn on_transport_lost(&mut self, error: Option<io::Error>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let status = match &error {
            Some(e) => CastStatus::from_transport_error(e),
            None => CastStatus::NetworkError,
        };
        warn!(
            "Transport to {} lost: {:?}; entering reconnect window",
            self.addr, error
        );

        self.drop_transport();
        if self.app.take().is_some() {
            self.media.set_destination(None);
            self.emit(SessionEvent::ApplicationDisconnected { status })
                .await;
        }
        self.clear_receiver_state();

        // Absorb the failure silently for up to the reconnect window;
        // a terminal Disconnected is only surfaced once it expires.
        let now = Instant::now();
        self.state = ConnectionState::Connecting;
        self.reconnect.begin_window(now);
        self.reconnect.mark_attempt(now);
        self.spawn_connect();
    }

    async fn on_heartbeat_tick(&mut self) {
        let now = Instant::now();
        if self
            .heartbeat
            .is_timeout(now, self.config.heartbeat_timeout)
        {
            warn!("Heartbeat timeout on {}", self.addr);
            self.disconnect_terminal(CastStatus::Timeout, false).await;
        } else {
            self.heartbeat.send_ping();
        }
    }

    fn on_sweep_tick(&mut self) {
        let now = Instant::now();
        self.receiver.sweep(now);
        self.media.sweep(now);
        if !self.receiver.has_outstanding() && !self.media.has_outstanding() {
            self.sweep_ticker = None;
        }
    }

    fn ensure_sweep(&mut self) {
        if self.sweep_ticker.is_none()
            && (self.receiver.has_outstanding() || self.media.has_outstanding())
        {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.sweep_ticker = Some(ticker);
        }
    }

    async fn on_message(&mut self, message: CastMessage) {
        // Any inbound traffic counts as link activity.
        self.heartbeat.note_activity(Instant::now());

        let namespace = message.namespace.clone();
        if self.dispatch_to_channel(&message) {
            // Delivered to a mounted channel.
        } else if self.subscriptions.contains(&namespace) {
            match message.body() {
                Some(body) => {
                    self.emit(SessionEvent::MessageReceived {
                        namespace,
                        body: body.to_string(),
                    })
                    .await;
                }
                None => debug!("Dropping binary message on subscribed {}", namespace),
            }
        } else {
            debug!("Dropping message for unmounted namespace {}", namespace);
        }
        self.ensure_sweep();
    }

    fn dispatch_to_channel(&mut self, message: &CastMessage) -> bool {
        enum Slot {
            Connection,
            Heartbeat,
            Receiver,
            Media,
        }

        let profile = &self.config.profile;
        let namespace = message.namespace.as_str();
        let slot = if namespace == profile.connection_namespace {
            Slot::Connection
        } else if namespace == profile.heartbeat_namespace {
            Slot::Heartbeat
        } else if namespace == profile.receiver_namespace {
            Slot::Receiver
        } else if namespace == profile.media_namespace {
            Slot::Media
        } else {
            return false;
        };

        let channel: &mut dyn CastChannel = match slot {
            Slot::Connection => &mut self.connection,
            Slot::Heartbeat => &mut self.heartbeat,
            Slot::Receiver => &mut self.receiver,
            Slot::Media => &mut self.media,
        };
        match &message.payload {
            Payload::Text(_) => channel.on_text_message(message),
            Payload::Binary(_) => channel.on_binary_message(message),
        }
        true
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connection(ConnectionEvent::PeerClosed { endpoint }) => {
                let matches_app = self
                    .app
                    .as_ref()
                    .and_then(|app| app.transport_id.as_deref())
                    .map(|transport| transport == endpoint)
                    .unwrap_or(false);
                if matches_app {
                    self.app = None;
                    self.last_app_id = None;
                    self.last_session_id = None;
                    self.media.set_destination(None);
                    self.emit(SessionEvent::ApplicationDisconnected {
                        status: CastStatus::ApplicationNotRunning,
                    })
                    .await;
                }
            }
            ChannelEvent::Receiver(ReceiverEvent::StatusUpdated { status }) => {
                self.on_receiver_status(&status).await;
            }
            ChannelEvent::Receiver(ReceiverEvent::ApplicationConnected { app }) => {
                let transport_id = app
                    .transport_id
                    .clone()
                    .expect("connected application carries a transport id");
                self.connection.connect_to(&transport_id);
                self.media.set_destination(Some(transport_id));
                self.last_app_id = Some(app.app_id.clone());
                self.last_session_id = Some(app.session_id.clone());
                self.app = Some(app.clone());
                self.emit(SessionEvent::ApplicationConnected { app }).await;
            }
            ChannelEvent::Receiver(ReceiverEvent::ApplicationGone { status }) => {
                match self.app.take() {
                    Some(app) => {
                        if let Some(transport_id) = &app.transport_id {
                            self.connection.close(transport_id);
                        }
                        self.media.set_destination(None);
                        self.last_app_id = None;
                        self.last_session_id = None;
                        self.emit(SessionEvent::ApplicationDisconnected { status })
                            .await;
                    }
                    None => {
                        self.last_app_id = None;
                        self.last_session_id = None;
                        self.emit(SessionEvent::ApplicationConnectionFailed { status })
                            .await;
                    }
                }
            }
            ChannelEvent::Receiver(ReceiverEvent::LeaveRequested { transport_id }) => {
                self.connection.close(&transport_id);
                self.app = None;
                self.last_app_id = None;
                self.last_session_id = None;
                self.media.set_destination(None);
                self.emit(SessionEvent::ApplicationDisconnected {
                    status: CastStatus::Ok,
                })
                .await;
            }
            ChannelEvent::Receiver(ReceiverEvent::Operation {
                op,
                request_id,
                status,
            }) => {
                self.emit(SessionEvent::ReceiverOperation {
                    op,
                    request_id,
                    status,
                })
                .await;
            }
            ChannelEvent::Media(MediaEvent::StatusUpdated { mask }) => {
                self.emit(SessionEvent::MediaStatusUpdated { mask }).await;
            }
            ChannelEvent::Media(MediaEvent::MetadataUpdated) => {
                self.emit(SessionEvent::MediaMetadataUpdated).await;
            }
            ChannelEvent::Media(MediaEvent::Operation {
                op,
                request_id,
                status,
            }) => {
                self.emit(SessionEvent::MediaOperation {
                    op,
                    request_id,
                    status,
                })
                .await;
            }
        }
    }

    async fn on_receiver_status(&mut self, status: &ReceiverStatus) {
        if let Some(volume) = &status.volume {
            let level = volume.level.unwrap_or(self.volume_level);
            let muted = volume.muted.unwrap_or(self.muted);
            if self.first_status || level != self.volume_level || muted != self.muted {
                self.volume_level = level;
                self.muted = muted;
                self.emit(SessionEvent::VolumeChanged { level, muted }).await;
            }
        }
        self.first_status = false;
    }

    async fn send_user_message(&mut self, namespace: String, payload: Payload, request_id: i64) {
        if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN || payload.is_empty() {
            self.emit(SessionEvent::SendComplete {
                request_id,
                status: CastStatus::InvalidRequest,
            })
            .await;
            return;
        }
        if payload.len() > payload.limit() {
            // Over-limit payloads are reported distinctly and must not
            // close the transport.
            self.emit(SessionEvent::SendComplete {
                request_id,
                status: CastStatus::MessageTooLarge,
            })
            .await;
            return;
        }
        let Some(transport_id) = self
            .app
            .as_ref()
            .and_then(|app| app.transport_id.clone())
        else {
            self.emit(SessionEvent::SendComplete {
                request_id,
                status: CastStatus::InvalidRequest,
            })
            .await;
            return;
        };

        let message = CastMessage {
            protocol_version: cast_wire::PROTOCOL_VERSION,
            source_id: self.config.profile.sender_endpoint.clone(),
            destination_id: transport_id,
            namespace,
            payload,
        };
        let status = if self.write_message(message).await {
            CastStatus::Ok
        } else {
            CastStatus::NetworkError
        };
        self.emit(SessionEvent::SendComplete { request_id, status })
            .await;
    }

    async fn write_message(&mut self, message: CastMessage) -> bool {
        let result = match &mut self.writer {
            Some(writer) => transport::send_message(writer, &message).await,
            None => {
                debug!(
                    "Dropping outbound message on {} while disconnected",
                    message.namespace
                );
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(SendError::Wire(e)) => {
                warn!("Dropping invalid outbound message: {}", e);
                false
            }
            Err(SendError::Io(e)) => {
                self.on_transport_lost(Some(e)).await;
                false
            }
        }
    }

    fn drop_transport(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        self.writer = None;
        self.heartbeat_ticker = None;
        self.sweep_ticker = None;

        // Unbinding resets every channel's trackers without invoking
        // their callbacks.
        self.connection.unbind();
        self.heartbeat.unbind();
        self.receiver.unbind();
        self.media.unbind();
        self.media.set_destination(None);

        // Flush messages queued against the dead connection.
        while self.outbound_rx.try_recv().is_ok() {}
    }

    fn clear_receiver_state(&mut self) {
        self.volume_level = 0.0;
        self.muted = false;
        self.first_status = true;
    }

    async fn disconnect_terminal(&mut self, status: CastStatus, graceful: bool) {
        if self.state == ConnectionState::Disconnected {
            self.reconnect.end_window();
            self.reconnect_sleep = None;
            return;
        }
        self.state = ConnectionState::Disconnecting;

        if graceful && self.writer.is_some() {
            // Best-effort CLOSE for the application and the receiver.
            if let Some(transport_id) = self
                .app
                .as_ref()
                .and_then(|app| app.transport_id.clone())
            {
                self.connection.close(&transport_id);
            }
            let receiver_endpoint = self.config.profile.receiver_endpoint.clone();
            self.connection.close(&receiver_endpoint);
            while let Ok(message) = self.outbound_rx.try_recv() {
                self.write_message(message).await;
            }
        }

        self.drop_transport();
        let had_app = self.app.take().is_some();
        if had_app {
            self.emit(SessionEvent::ApplicationDisconnected { status })
                .await;
        }
        self.last_app_id = None;
        self.last_session_id = None;
        self.clear_receiver_state();
        self.reconnect.end_window();
        self.reconnect_sleep = None;
        self.state = ConnectionState::Disconnected;
        self.emit(SessionEvent::Disconnected { status }).await;
    }

    async fn shutdown(&mut self) {
        info!("Tearing down device session for {}", self.addr);
        if self.state != ConnectionState::Disconnected {
            self.disconnect_terminal(CastStatus::Ok, true).await;
        }
    }
}

fn spawn_read_loop(
    mut read_half: OwnedReadHalf,
    epoch: u64,
    tx: mpsc::UnboundedSender<InternalMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        loop {
            match transport::recv_message(&mut read_half, &mut decoder, &mut buffer).await {
                Ok(Some(message)) => {
                    let sent = tx.send(InternalMsg {
                        epoch,
                        input: Internal::Transport(TransportInput::Message(message)),
                    });
                    if sent.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(InternalMsg {
                        epoch,
                        input: Internal::Transport(TransportInput::Closed(None)),
                    });
                    break;
                }
                Err(e) => {
                    let _ = tx.send(InternalMsg {
                        epoch,
                        input: Internal::Transport(TransportInput::Closed(Some(e))),
                    });
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_wire::NS_RECEIVER;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const EVENT_WAIT: Duration = Duration::from_secs(5);

    struct FakeReceiver {
        stream: TcpStream,
        decoder: FrameDecoder,
        buffer: BytesMut,
    }

    impl FakeReceiver {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            Self {
                stream,
                decoder: FrameDecoder::new(),
                buffer: BytesMut::new(),
            }
        }

        /// Read messages until one on `namespace` with `type_name` arrives.
        async fn expect_message(&mut self, namespace: &str, type_name: &str) -> CastMessage {
            loop {
                let message =
                    transport::recv_message(&mut self.stream, &mut self.decoder, &mut self.buffer)
                        .await
                        .unwrap()
                        .expect("peer closed unexpectedly");
                if message.namespace == namespace {
                    if let Some(body) = message.body() {
                        if cast_wire::message_type(body).as_deref() == Some(type_name) {
                            return message;
                        }
                    }
                }
            }
        }

        async fn send(&mut self, message: &CastMessage) {
            transport::send_message(&mut self.stream, message).await.unwrap();
        }

        async fn send_receiver_status(&mut self, request_id: i64, status_json: &str) {
            let body = format!(
                r#"{{"type":"RECEIVER_STATUS","requestId":{request_id},"status":{status_json}}}"#
            );
            let message = CastMessage::text(
                cast_wire::ENDPOINT_RECEIVER,
                cast_wire::ENDPOINT_SENDER,
                NS_RECEIVER,
                body,
            );
            self.send(&message).await;
        }
    }

    fn request_id_of(message: &CastMessage) -> i64 {
        let body: serde_json::Value = serde_json::from_str(message.body().unwrap()).unwrap();
        body["requestId"].as_i64().unwrap()
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        timeout(EVENT_WAIT, events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event stream closed")
    }

    async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = next_event(events).await;
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_handshake_and_volume() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
        session.connect().unwrap();

        let mut receiver = FakeReceiver::accept(&listener).await;
        // The virtual connection opens before any other traffic.
        let connect = receiver
            .expect_message(cast_wire::NS_CONNECTION, "CONNECT")
            .await;
        assert_eq!(connect.destination_id, cast_wire::ENDPOINT_RECEIVER);

        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected)).await;

        let get_status = receiver.expect_message(NS_RECEIVER, "GET_STATUS").await;
        receiver
            .send_receiver_status(
                request_id_of(&get_status),
                r#"{"applications":[],"volume":{"level":0.25,"muted":false}}"#,
            )
            .await;

        match wait_for(&mut events, |e| {
            matches!(e, SessionEvent::VolumeChanged { .. })
        })
        .await
        {
            SessionEvent::VolumeChanged { level, muted } => {
                assert_eq!(level, 0.25);
                assert!(!muted);
            }
            _ => unreachable!(),
        }

        session.release_reference().unwrap();
    }

    #[tokio::test]
    async fn test_join_connects_application_and_mounts_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
        session.connect().unwrap();

        let mut receiver = FakeReceiver::accept(&listener).await;
        receiver
            .expect_message(cast_wire::NS_CONNECTION, "CONNECT")
            .await;
        let initial = receiver.expect_message(NS_RECEIVER, "GET_STATUS").await;
        receiver
            .send_receiver_status(request_id_of(&initial), r#"{"applications":[]}"#)
            .await;

        session.join_application("APP-X").unwrap();
        let join_status = receiver.expect_message(NS_RECEIVER, "GET_STATUS").await;
        receiver
            .send_receiver_status(
                request_id_of(&join_status),
                r#"{"applications":[{"appId":"APP-X","sessionId":"S","transportId":"T123","namespaces":[{"name":"urn:x-cast:com.google.cast.media"}]}]}"#,
            )
            .await;

        match wait_for(&mut events, |e| {
            matches!(e, SessionEvent::ApplicationConnected { .. })
        })
        .await
        {
            SessionEvent::ApplicationConnected { app } => {
                assert_eq!(app.app_id, "APP-X");
                assert_eq!(app.transport_id.as_deref(), Some("T123"));
            }
            _ => unreachable!(),
        }

        // The application endpoint gets its own virtual connection.
        let app_connect = receiver
            .expect_message(cast_wire::NS_CONNECTION, "CONNECT")
            .await;
        assert_eq!(app_connect.destination_id, "T123");

        session.release_reference().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = SessionConfig {
            heartbeat_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        };
        let (session, mut events) = DeviceSession::spawn(addr, config);
        session.connect().unwrap();

        // Accept but never answer anything.
        let _receiver = FakeReceiver::accept(&listener).await;

        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected)).await;
        match wait_for(&mut events, |e| {
            matches!(e, SessionEvent::Disconnected { .. })
        })
        .await
        {
            SessionEvent::Disconnected { status } => assert_eq!(status, CastStatus::Timeout),
            _ => unreachable!(),
        }

        session.release_reference().unwrap();
    }

    #[tokio::test]
    async fn test_send_text_without_application_is_rejected_locally() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
        session.connect().unwrap();
        let _receiver = FakeReceiver::accept(&listener).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected)).await;

        session
            .send_text("urn:x-cast:com.example.app", "{\"hello\":1}", 42)
            .unwrap();
        match wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SendComplete { .. })
        })
        .await
        {
            SessionEvent::SendComplete { request_id, status } => {
                assert_eq!(request_id, 42);
                assert_eq!(status, CastStatus::InvalidRequest);
            }
            _ => unreachable!(),
        }

        session.release_reference().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_send_reports_too_large_and_keeps_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
        session.connect().unwrap();

        let mut receiver = FakeReceiver::accept(&listener).await;
        receiver
            .expect_message(cast_wire::NS_CONNECTION, "CONNECT")
            .await;
        let initial = receiver.expect_message(NS_RECEIVER, "GET_STATUS").await;
        receiver
            .send_receiver_status(request_id_of(&initial), r#"{"applications":[]}"#)
            .await;

        session.join_application("APP-X").unwrap();
        let join_status = receiver.expect_message(NS_RECEIVER, "GET_STATUS").await;
        receiver
            .send_receiver_status(
                request_id_of(&join_status),
                r#"{"applications":[{"appId":"APP-X","sessionId":"S","transportId":"T1","namespaces":[]}]}"#,
            )
            .await;
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::ApplicationConnected { .. })
        })
        .await;

        let oversized = "x".repeat(cast_wire::MAX_TEXT_PAYLOAD + 1);
        session
            .send_text("urn:x-cast:com.example.app", oversized, 7)
            .unwrap();
        match wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SendComplete { .. })
        })
        .await
        {
            SessionEvent::SendComplete { request_id, status } => {
                assert_eq!(request_id, 7);
                assert_eq!(status, CastStatus::MessageTooLarge);
            }
            _ => unreachable!(),
        }

        // The transport survived: a normal send still goes through.
        session
            .send_text("urn:x-cast:com.example.app", r#"{"type":"APP_PING"}"#, 8)
            .unwrap();
        let delivered = receiver
            .expect_message("urn:x-cast:com.example.app", "APP_PING")
            .await;
        assert_eq!(delivered.destination_id, "T1");

        session.release_reference().unwrap();
    }

    #[tokio::test]
    async fn test_release_reference_tears_down_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (session, mut events) = DeviceSession::spawn(addr, SessionConfig::default());
        session.connect().unwrap();
        let _receiver = FakeReceiver::accept(&listener).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::Connected)).await;

        // An extra holder keeps the session alive through one release.
        session.add_reference().unwrap();
        session.release_reference().unwrap();
        session.request_status().unwrap();

        session.release_reference().unwrap();
        wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::Disconnected {
                    status: CastStatus::Ok
                }
            )
        })
        .await;
    }
}
