//! Discovery-time device filter.
//!
//! For every online notification the filter opens a throwaway probe
//! connection to the candidate device, asks for just enough state to
//! evaluate the configured criteria, and reports acceptance through an
//! event stream. Rejections are logged only. Probes are invalidated by
//! [`DeviceFilter::reset`] via a generation counter, so results from a
//! superseded criteria set are discarded.

use crate::criteria::DiscoveryCriteria;
use crate::device::CastDevice;
use bytes::BytesMut;
use cast_session::{transport, ProtocolProfile};
use cast_wire::receiver::{TYPE_APP_AVAILABILITY, TYPE_RECEIVER_STATUS};
use cast_wire::{
    message_type, AppAvailabilityResponse, CastMessage, ConnectionControl, FrameDecoder,
    ReceiverRequest, ReceiverStatusMessage,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for probe sessions
#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Deadline for the probe transport connect
    pub connect_timeout: Duration,
    /// Overall deadline for a probe's expected replies
    pub probe_timeout: Duration,
    /// Wire-format constants shared with real sessions
    pub profile: ProtocolProfile,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            profile: ProtocolProfile::default(),
        }
    }
}

/// Events emitted by the filter
#[derive(Debug)]
pub enum FilterEvent {
    /// A probed device satisfied at least one criterion
    DeviceAccepted {
        /// The accepted device
        device: CastDevice,
        /// The criteria it satisfied
        matched: Vec<DiscoveryCriteria>,
    },
    /// A previously accepted device went offline
    DeviceRemoved {
        /// Id of the removed device
        device_id: String,
    },
}

struct FilterShared {
    generation: AtomicU64,
    published: Mutex<HashSet<String>>,
}

/// Probe-based device filter
pub struct DeviceFilter {
    config: FilterConfig,
    criteria: Vec<DiscoveryCriteria>,
    shared: Arc<FilterShared>,
    probes: HashMap<String, JoinHandle<()>>,
    events: mpsc::UnboundedSender<FilterEvent>,
}

impl DeviceFilter {
    /// Create a filter with an initial criteria set
    pub fn new(
        config: FilterConfig,
        criteria: Vec<DiscoveryCriteria>,
    ) -> (Self, mpsc::UnboundedReceiver<FilterEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                criteria,
                shared: Arc::new(FilterShared {
                    generation: AtomicU64::new(0),
                    published: Mutex::new(HashSet::new()),
                }),
                probes: HashMap::new(),
                events,
            },
            event_rx,
        )
    }

    /// Probe a device that came online (or was re-resolved).
    ///
    /// Any probe already running for the same device is replaced.
    pub fn device_online(&mut self, device: CastDevice) {
        if self.criteria.is_empty() {
            debug!("No criteria configured; ignoring {}", device.id);
            return;
        }
        if let Some(task) = self.probes.remove(&device.id) {
            task.abort();
        }

        let device_id = device.id.clone();
        info!("Probing device {} at {}", device_id, device.socket_addr());
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let task = tokio::spawn(run_probe(
            device,
            self.criteria.clone(),
            self.config.clone(),
            self.shared.clone(),
            self.events.clone(),
            generation,
        ));
        self.probes.insert(device_id, task);
    }

    /// Handle a device going offline.
    ///
    /// Aborts any in-flight probe; a published device is removed
    /// immediately.
    pub fn device_offline(&mut self, device_id: &str) {
        if let Some(task) = self.probes.remove(device_id) {
            task.abort();
        }
        let was_published = self
            .shared
            .published
            .lock()
            .expect("published set lock")
            .remove(device_id);
        if was_published {
            let _ = self.events.send(FilterEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            });
        } else {
            debug!("Offline notification for unpublished device {}", device_id);
        }
    }

    /// Handle the discovery source reporting every device offline
    pub fn all_offline(&mut self) {
        for (_, task) in self.probes.drain() {
            task.abort();
        }
        let published: Vec<String> = {
            let mut set = self.shared.published.lock().expect("published set lock");
            set.drain().collect()
        };
        for device_id in published {
            let _ = self.events.send(FilterEvent::DeviceRemoved { device_id });
        }
    }

    /// Replace the criteria set, invalidating all in-flight probes
    pub fn reset(&mut self, criteria: Vec<DiscoveryCriteria>) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        for (_, task) in self.probes.drain() {
            task.abort();
        }
        self.criteria = criteria;
    }

    /// Current criteria set
    pub fn criteria(&self) -> &[DiscoveryCriteria] {
        &self.criteria
    }
}

impl Drop for DeviceFilter {
    fn drop(&mut self) {
        for (_, task) in self.probes.drain() {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
struct ProbeReport {
    namespaces: BTreeSet<String>,
    availability: HashMap<String, String>,
}

/// Acceptance checks namespace subsets only; availability is collected
/// for reporting but does not gate the result.
fn evaluate(criteria: &[DiscoveryCriteria], report: &ProbeReport) -> Vec<DiscoveryCriteria> {
    criteria
        .iter()
        .filter(|criterion| {
            criterion
                .namespaces
                .iter()
                .all(|ns| report.namespaces.contains(ns))
        })
        .cloned()
        .collect()
}

async fn run_probe(
    device: CastDevice,
    criteria: Vec<DiscoveryCriteria>,
    config: FilterConfig,
    shared: Arc<FilterShared>,
    events: mpsc::UnboundedSender<FilterEvent>,
    generation: u64,
) {
    match probe_device(&device, &criteria, &config).await {
        Ok(report) => {
            let matched = evaluate(&criteria, &report);
            if matched.is_empty() {
                debug!(
                    "Device {} rejected (exposed namespaces: {:?}, availability: {:?})",
                    device.id, report.namespaces, report.availability
                );
                return;
            }
            if shared.generation.load(Ordering::SeqCst) != generation {
                debug!("Discarding stale probe result for {}", device.id);
                return;
            }
            info!(
                "Device {} accepted ({} criteria matched)",
                device.id,
                matched.len()
            );
            shared
                .published
                .lock()
                .expect("published set lock")
                .insert(device.id.clone());
            let _ = events.send(FilterEvent::DeviceAccepted { device, matched });
        }
        Err(e) => {
            warn!("Probe of device {} failed: {:#}", device.id, e);
        }
    }
}

async fn probe_device(
    device: &CastDevice,
    criteria: &[DiscoveryCriteria],
    config: &FilterConfig,
) -> anyhow::Result<ProbeReport> {
    let profile = &config.profile;
    let mut stream = transport::connect_tcp(device.socket_addr(), config.connect_timeout).await?;
    let deadline = tokio::time::Instant::now() + config.probe_timeout;

    send_control(&mut stream, profile, &connect_body(profile)?).await?;

    let app_ids: Vec<String> = {
        let mut ids: Vec<String> = criteria
            .iter()
            .filter_map(|criterion| criterion.app_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    };
    let mut awaiting_availability = !app_ids.is_empty();
    if awaiting_availability {
        let request = ReceiverRequest::GetAppAvailability {
            request_id: 1,
            app_id: app_ids,
        };
        send_receiver_request(&mut stream, profile, &request).await?;
    }

    let mut awaiting_status = criteria.iter().any(DiscoveryCriteria::requires_namespaces);
    if awaiting_status {
        let request = ReceiverRequest::GetStatus { request_id: 2 };
        send_receiver_request(&mut stream, profile, &request).await?;
    }

    let mut report = ProbeReport::default();
    let mut decoder = FrameDecoder::new();
    let mut buffer = BytesMut::new();

    while awaiting_availability || awaiting_status {
        let message = tokio::time::timeout_at(
            deadline,
            transport::recv_message(&mut stream, &mut decoder, &mut buffer),
        )
        .await
        .map_err(|_| anyhow::anyhow!("probe deadline exceeded"))??
        .ok_or_else(|| anyhow::anyhow!("device closed the probe connection"))?;

        if message.namespace != profile.receiver_namespace {
            continue;
        }
        let Some(body) = message.body() else {
            continue;
        };
        match message_type(body).as_deref() {
            Some(TYPE_RECEIVER_STATUS) => {
                match serde_json::from_str::<ReceiverStatusMessage>(body) {
                    Ok(status) => {
                        report.namespaces.extend(
                            status
                                .status
                                .exposed_namespaces()
                                .map(str::to_string),
                        );
                    }
                    Err(e) => warn!("Malformed probe status from {}: {}", device.id, e),
                }
                awaiting_status = false;
            }
            Some(TYPE_APP_AVAILABILITY) => {
                match serde_json::from_str::<AppAvailabilityResponse>(body) {
                    Ok(reply) => report.availability.extend(reply.availability),
                    Err(e) => warn!("Malformed availability reply from {}: {}", device.id, e),
                }
                awaiting_availability = false;
            }
            other => {
                debug!("Ignoring probe message type {:?}", other);
            }
        }
    }

    // Best-effort CLOSE before discarding the probe transport.
    if let Ok(body) = serde_json::to_string(&ConnectionControl::Close) {
        let close = CastMessage::text(
            profile.sender_endpoint.as_str(),
            profile.receiver_endpoint.as_str(),
            profile.connection_namespace.as_str(),
            body,
        );
        let _ = transport::send_message(&mut stream, &close).await;
    }

    Ok(report)
}

fn connect_body(profile: &ProtocolProfile) -> anyhow::Result<String> {
    let connect = ConnectionControl::Connect {
        origin: serde_json::json!({}),
        sender_info: profile.sender_info.clone(),
    };
    Ok(serde_json::to_string(&connect)?)
}

async fn send_control(
    stream: &mut tokio::net::TcpStream,
    profile: &ProtocolProfile,
    body: &str,
) -> anyhow::Result<()> {
    let message = CastMessage::text(
        profile.sender_endpoint.as_str(),
        profile.receiver_endpoint.as_str(),
        profile.connection_namespace.as_str(),
        body,
    );
    transport::send_message(stream, &message).await?;
    Ok(())
}

async fn send_receiver_request(
    stream: &mut tokio::net::TcpStream,
    profile: &ProtocolProfile,
    request: &ReceiverRequest,
) -> anyhow::Result<()> {
    let message = CastMessage::text(
        profile.sender_endpoint.as_str(),
        profile.receiver_endpoint.as_str(),
        profile.receiver_namespace.as_str(),
        serde_json::to_string(request)?,
    );
    transport::send_message(stream, &message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DiscoverySource;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn test_device(addr: std::net::SocketAddr) -> CastDevice {
        CastDevice {
            id: "device-1".to_string(),
            address: addr.ip(),
            port: addr.port(),
            friendly_name: "Test".to_string(),
            model_name: "Fake Receiver".to_string(),
            version: "1.0".to_string(),
            source: DiscoverySource::Mdns,
        }
    }

    fn report(namespaces: &[&str]) -> ProbeReport {
        ProbeReport {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            availability: HashMap::new(),
        }
    }

    #[test]
    fn test_evaluate_namespace_subset() {
        let criteria = vec![
            DiscoveryCriteria::parse("BASE/app1/ns.a,ns.b").unwrap(),
            DiscoveryCriteria::parse("BASE/app2/ns.missing").unwrap(),
            DiscoveryCriteria::parse("BASE").unwrap(),
        ];
        let matched = evaluate(&criteria, &report(&["ns.a", "ns.b", "ns.c"]));

        // The empty criterion always matches; the missing namespace
        // rules out the second one.
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().any(|c| c.category == "BASE/app1/ns.a,ns.b"));
        assert!(matched.iter().any(|c| c.category == "BASE"));
    }

    #[test]
    fn test_evaluate_ignores_availability() {
        let criteria = vec![DiscoveryCriteria::parse("BASE/app1/ns.a").unwrap()];
        let mut probed = report(&["ns.a"]);
        probed
            .availability
            .insert("app1".to_string(), "APP_UNAVAILABLE".to_string());

        // Availability is recorded but acceptance only checks the
        // namespace subset.
        assert_eq!(evaluate(&criteria, &probed).len(), 1);
    }

    async fn run_fake_receiver(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();

        loop {
            let message =
                match transport::recv_message(&mut stream, &mut decoder, &mut buffer).await {
                    Ok(Some(message)) => message,
                    _ => return,
                };
            let Some(body) = message.body() else { continue };
            match message_type(body).as_deref() {
                Some("GET_APP_AVAILABILITY") => {
                    let reply = CastMessage::text(
                        cast_wire::ENDPOINT_RECEIVER,
                        cast_wire::ENDPOINT_SENDER,
                        cast_wire::NS_RECEIVER,
                        r#"{"type":"GET_APP_AVAILABILITY","requestId":1,"availability":{"APP1":"APP_AVAILABLE"}}"#,
                    );
                    transport::send_message(&mut stream, &reply).await.unwrap();
                }
                Some("GET_STATUS") => {
                    let reply = CastMessage::text(
                        cast_wire::ENDPOINT_RECEIVER,
                        cast_wire::ENDPOINT_SENDER,
                        cast_wire::NS_RECEIVER,
                        r#"{"type":"RECEIVER_STATUS","requestId":2,"status":{"applications":[{"appId":"APP1","sessionId":"s","transportId":"t","namespaces":[{"name":"urn:x-cast:ns.one"}]}]}}"#,
                    );
                    transport::send_message(&mut stream, &reply).await.unwrap();
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_probe_accepts_matching_device() {
        let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        tokio::spawn(run_fake_receiver(listener));

        let criteria = vec![
            DiscoveryCriteria::parse("BASE/APP1/urn:x-cast:ns.one").unwrap(),
            DiscoveryCriteria::parse("BASE//urn:x-cast:ns.absent").unwrap(),
        ];
        let (mut filter, mut events) = DeviceFilter::new(FilterConfig::default(), criteria);
        filter.device_online(test_device(bound_addr));

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            FilterEvent::DeviceAccepted { device, matched } => {
                assert_eq!(device.id, "device-1");
                assert_eq!(matched.len(), 1);
                assert_eq!(matched[0].category, "BASE/APP1/urn:x-cast:ns.one");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Offline after acceptance removes the published device.
        filter.device_offline("device-1");
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            FilterEvent::DeviceRemoved { device_id } => assert_eq!(device_id, "device-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reset_invalidates_probe() {
        let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        // A receiver that accepts but never answers, so the probe is
        // still in flight when the filter resets.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let criteria = vec![DiscoveryCriteria::parse("BASE/APP1/urn:x-cast:ns.one").unwrap()];
        let (mut filter, mut events) = DeviceFilter::new(FilterConfig::default(), criteria.clone());
        filter.device_online(test_device(bound_addr));

        filter.reset(criteria);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_without_probe_is_quiet() {
        let (mut filter, mut events) = DeviceFilter::new(
            FilterConfig::default(),
            vec![DiscoveryCriteria::parse("BASE").unwrap()],
        );
        filter.device_offline("never-seen");
        assert!(events.try_recv().is_err());
    }
}
