//! Cast receiver control binary.
//!
//! Connects a device session to one receiver, optionally launches an
//! application and loads media, and prints session events until the
//! session ends or the process is interrupted.

use anyhow::Result;
use cast_discovery::{CastDevice, DeviceFilter, DiscoveryCriteria, DiscoverySource, FilterConfig, FilterEvent};
use cast_session::{CastStatus, DeviceSession, SessionEvent};
use cast_wire::{MediaInformation, StreamType};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::CastlinkConfig;

/// Cast receiver client
#[derive(Parser, Debug)]
#[command(name = "castlink", version, about = "Control a cast receiver device")]
struct Args {
    /// Device address, e.g. 192.168.1.40:8009
    #[arg(long)]
    device: SocketAddr,

    /// Application id to launch or join after connecting
    #[arg(long)]
    app_id: Option<String>,

    /// Force a fresh launch instead of joining a running instance
    #[arg(long)]
    relaunch: bool,

    /// Media URL to load once the application is connected
    #[arg(long)]
    media: Option<String>,

    /// MIME type for --media
    #[arg(long, default_value = "video/mp4")]
    content_type: String,

    /// Device volume to set after connecting (0.0..=1.0)
    #[arg(long)]
    volume: Option<f64>,

    /// Probe the device against a discovery category first, e.g.
    /// "cast/CC1AD845/urn:x-cast:com.google.cast.media"
    #[arg(long)]
    probe_category: Option<String>,

    /// Heartbeat timeout, e.g. 10s
    #[arg(long, default_value = "10s")]
    heartbeat_timeout: humantime::Duration,

    /// Request timeout, e.g. 10s
    #[arg(long, default_value = "10s")]
    request_timeout: humantime::Duration,

    /// Config file path
    #[arg(long, default_value = "castlink.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file_config = CastlinkConfig::load_from_file(&args.config)?;
    let mut session_config = file_config.session_config();
    session_config.heartbeat_timeout = args.heartbeat_timeout.into();
    session_config.request_timeout = args.request_timeout.into();

    if let Some(category) = &args.probe_category {
        if !probe_device(&args, category, &file_config).await? {
            warn!("Device at {} rejected by the discovery filter", args.device);
            return Ok(());
        }
    }

    info!("Connecting to device at {}", args.device);
    let (session, mut events) = DeviceSession::spawn(args.device, session_config);
    session.connect()?;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; disconnecting");
                session.disconnect()?;
                continue;
            }
        };

        match event {
            SessionEvent::Connected => {
                info!("Connected to {}", args.device);
                if let Some(volume) = args.volume {
                    session.set_volume(volume, false)?;
                }
                if let Some(app_id) = &args.app_id {
                    session.launch_application(app_id.clone(), None, args.relaunch)?;
                }
            }
            SessionEvent::ConnectFailed { status } => {
                warn!("Connection failed: {:?}", status);
                break;
            }
            SessionEvent::ApplicationConnected { app } => {
                info!(
                    "Application {} connected (session {})",
                    app.app_id, app.session_id
                );
                if let Some(url) = &args.media {
                    let media = MediaInformation {
                        content_id: url.clone(),
                        stream_type: StreamType::Buffered,
                        content_type: args.content_type.clone(),
                        metadata: None,
                        duration: None,
                    };
                    let request_id = session.load_media(media, true, 0, None).await?;
                    info!("Load issued (request {})", request_id);
                }
            }
            SessionEvent::ApplicationDisconnected { status } => {
                info!("Application disconnected: {:?}", status);
            }
            SessionEvent::ApplicationConnectionFailed { status } => {
                warn!("Could not reach application: {:?}", status);
            }
            SessionEvent::VolumeChanged { level, muted } => {
                info!("Volume {:.2} (muted: {})", level, muted);
            }
            SessionEvent::MediaStatusUpdated { mask } => {
                info!("Media status updated ({:?})", mask);
                if let Some(position) = session.approximate_stream_position().await? {
                    info!("Approximate position: {} ms", position);
                }
            }
            SessionEvent::MediaOperation {
                op,
                request_id,
                status,
            } if status != CastStatus::Ok => {
                warn!("Media {:?} (request {}) failed: {:?}", op, request_id, status);
            }
            SessionEvent::ReceiverOperation {
                op,
                request_id,
                status,
            } if status != CastStatus::Ok => {
                warn!(
                    "Receiver {:?} (request {}) failed: {:?}",
                    op, request_id, status
                );
            }
            SessionEvent::MessageReceived { namespace, body } => {
                info!("Message on {}: {}", namespace, body);
            }
            SessionEvent::Disconnected { status } => {
                info!("Disconnected: {:?}", status);
                break;
            }
            _ => {}
        }
    }

    session.release_reference().ok();
    Ok(())
}

/// Run the discovery filter once against the target device.
async fn probe_device(args: &Args, category: &str, config: &CastlinkConfig) -> Result<bool> {
    let criteria = DiscoveryCriteria::parse(category)?;
    let filter_config = FilterConfig {
        connect_timeout: Duration::from_secs(config.connect_timeout),
        probe_timeout: Duration::from_secs(config.probe_timeout),
        ..FilterConfig::default()
    };
    let (mut filter, mut events) = DeviceFilter::new(filter_config, vec![criteria]);

    filter.device_online(CastDevice {
        id: args.device.to_string(),
        address: args.device.ip(),
        port: args.device.port(),
        friendly_name: args.device.to_string(),
        model_name: String::new(),
        version: String::new(),
        source: DiscoverySource::Mdns,
    });

    let wait = Duration::from_secs(config.probe_timeout + config.connect_timeout);
    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(FilterEvent::DeviceAccepted { matched, .. })) => {
            info!("Device accepted ({} criteria matched)", matched.len());
            Ok(true)
        }
        _ => Ok(false),
    }
}
