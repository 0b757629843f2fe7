//! Twin transports
//!
//! `MqttTwin` speaks the IoT Edge hub's twin topics over MQTT. `LocalTwin`
//! reads desired properties from a JSON file for running without a hub.

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::ports::{PatchSource, TwinPublisher};
use crate::twin::{ConfigPatch, ReportedStatus, TelemetryMessage};

pub const DESIRED_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const RESPONSE_FILTER: &str = "$iothub/twin/res/#";
const RESPONSE_PREFIX: &str = "$iothub/twin/res/";

/// Inbound patches buffered between the driver and the sync loop.
const PATCH_BUFFER: usize = 32;

/// Configuration for the MQTT twin transport
#[derive(Debug, Clone)]
pub struct MqttTwinConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_id: String,
    pub module_id: String,
    pub keep_alive: Duration,
    pub response_timeout: Duration,
    pub max_connect_failures: u32,
}

impl Default for MqttTwinConfig {
    fn default() -> Self {
        Self {
            broker_host: "edgeHub".to_string(),
            broker_port: 1883,
            client_id: format!("edge-inference-{}", uuid::Uuid::new_v4()),
            username: None,
            password: None,
            device_id: "local-device".to_string(),
            module_id: "inference".to_string(),
            keep_alive: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
            max_connect_failures: 10,
        }
    }
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<TwinResponse>>>>;

#[derive(Debug)]
struct TwinResponse {
    status: u16,
    body: Vec<u8>,
}

/// Check if a topic matches an MQTT filter.
/// Supports both + (single-level) and # (multi-level) wildcards.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Parse `$iothub/twin/res/{status}/?$rid={rid}[&...]` into `(status, rid)`.
pub fn parse_response_topic(topic: &str) -> Option<(u16, u64)> {
    let rest = topic.strip_prefix(RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once('/')?;
    let status = status.parse().ok()?;
    let query = query.strip_prefix('?')?;
    let rid = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?
        .parse()
        .ok()?;
    Some((status, rid))
}

/// Connects to the hub and returns the publishing and patch-receiving halves.
pub struct MqttTwin;

impl MqttTwin {
    pub fn connect(config: MqttTwinConfig) -> (Arc<MqttTwinClient>, MqttPatchStream) {
        let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        // must sit ahead of the first twin GET in the request queue
        if let Err(e) = queue_subscriptions(&client) {
            error!("Failed to queue twin subscriptions: {}", e);
        }
        let (patch_tx, patch_rx) = mpsc::channel(PATCH_BUFFER);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        let driver = Driver {
            client: client.clone(),
            patch_tx,
            pending: pending.clone(),
            max_connect_failures: config.max_connect_failures,
            connected_before: false,
        };
        tokio::spawn(driver.run(eventloop));

        let twin_client = Arc::new(MqttTwinClient {
            client,
            pending,
            next_rid: AtomicU64::new(1),
            telemetry_topic: format!(
                "devices/{}/modules/{}/messages/events/",
                config.device_id, config.module_id
            ),
            response_timeout: config.response_timeout,
        });
        info!(
            host = %config.broker_host,
            port = config.broker_port,
            "Connecting twin transport to MQTT broker"
        );

        let stream = MqttPatchStream {
            patches: patch_rx,
            client: twin_client.clone(),
        };
        (twin_client, stream)
    }
}

/// Owns the rumqttc event loop and routes inbound twin traffic.
struct Driver {
    client: AsyncClient,
    patch_tx: mpsc::Sender<Vec<u8>>,
    pending: PendingRequests,
    max_connect_failures: u32,
    connected_before: bool,
}

/// Subscribe to desired-property patches and twin responses.
fn queue_subscriptions(client: &AsyncClient) -> Result<()> {
    client.try_subscribe(DESIRED_PATCH_FILTER, QoS::AtLeastOnce)?;
    client.try_subscribe(RESPONSE_FILTER, QoS::AtLeastOnce)?;
    Ok(())
}

impl Driver {
    async fn run(mut self, mut eventloop: EventLoop) {
        let mut failures = 0u32;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.route(&publish.topic, publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    failures = 0;
                    // the first session got its subscriptions from connect()
                    if self.connected_before {
                        if let Err(e) = queue_subscriptions(&self.client) {
                            error!("Failed to resubscribe to twin topics: {}", e);
                        }
                    }
                    self.connected_before = true;
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!("Subscribed to twin topics: {:?}", suback);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    error!(failures, "MQTT connection error: {}", e);
                    if failures >= self.max_connect_failures {
                        error!("Giving up on MQTT broker after {} consecutive failures", failures);
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        // dropping patch_tx and the pending senders closes both channels
    }

    /// Never blocks: the event loop must keep polling while the sync loop is
    /// busy acquiring a model.
    fn route(&self, topic: &str, payload: Vec<u8>) {
        if matches_filter(DESIRED_PATCH_FILTER, topic) {
            debug!(size = payload.len(), "Received desired properties patch");
            match self.patch_tx.try_send(payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(buffer = PATCH_BUFFER, "Patch buffer full, discarding patch");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Patch receiver dropped, discarding patch");
                }
            }
        } else if matches_filter(RESPONSE_FILTER, topic) {
            let Some((status, rid)) = parse_response_topic(topic) else {
                warn!(topic, "Unparseable twin response topic");
                return;
            };
            let waiter = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&rid);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(TwinResponse { status, body: payload });
                }
                None => debug!(rid, status, "Twin response with no waiter"),
            }
        } else {
            debug!(topic, "Ignoring message on unexpected topic");
        }
    }
}

/// Publishing half of the MQTT twin.
pub struct MqttTwinClient {
    client: AsyncClient,
    pending: PendingRequests,
    next_rid: AtomicU64,
    telemetry_topic: String,
    response_timeout: Duration,
}

impl MqttTwinClient {
    fn rid(&self) -> u64 {
        self.next_rid.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    /// Fetch the full twin and return its desired section.
    pub async fn request_twin(&self) -> Result<ConfigPatch, TransportError> {
        let rid = self.rid();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(rid, tx);

        self.publish(format!("$iothub/twin/GET/?$rid={}", rid), Vec::new())
            .await?;

        let response = match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::Fatal("MQTT connection closed".into())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&rid);
                return Err(TransportError::Fatal(format!(
                    "no twin response within {}s",
                    self.response_timeout.as_secs()
                )));
            }
        };

        if response.status != 200 {
            return Err(TransportError::Malformed(format!(
                "twin GET returned status {}",
                response.status
            )));
        }

        let twin: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        ConfigPatch::from_value(twin.get("desired").cloned().unwrap_or_default())
    }
}

#[async_trait]
impl TwinPublisher for MqttTwinClient {
    async fn publish_status(&self, status: &ReportedStatus) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(status).map_err(|e| TransportError::Publish(e.to_string()))?;
        let topic = format!("$iothub/twin/PATCH/properties/reported/?$rid={}", self.rid());
        self.publish(topic, payload).await?;
        debug!("Reported status: {:?}", status.current_status);
        Ok(())
    }

    async fn publish_telemetry(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message).map_err(|e| TransportError::Publish(e.to_string()))?;
        self.publish(self.telemetry_topic.clone(), payload).await
    }
}

/// Receiving half of the MQTT twin.
pub struct MqttPatchStream {
    patches: mpsc::Receiver<Vec<u8>>,
    client: Arc<MqttTwinClient>,
}

#[async_trait]
impl PatchSource for MqttPatchStream {
    async fn desired_properties(&mut self) -> Result<ConfigPatch, TransportError> {
        self.client.request_twin().await
    }

    async fn next_patch(&mut self) -> Result<ConfigPatch, TransportError> {
        match self.patches.recv().await {
            Some(payload) => ConfigPatch::from_slice(&payload),
            None => Err(TransportError::Fatal("MQTT connection closed".into())),
        }
    }
}

// ============================================================================
// Local twin
// ============================================================================

/// Desired properties from a JSON file. No live patches arrive.
pub struct LocalTwin {
    path: PathBuf,
}

impl LocalTwin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PatchSource for LocalTwin {
    async fn desired_properties(&mut self) -> Result<ConfigPatch, TransportError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No local desired properties, using defaults");
                return Ok(ConfigPatch::default());
            }
            Err(e) => return Err(TransportError::Malformed(e.to_string())),
        };

        let document: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))?;
        match document.get("desired") {
            Some(desired) => ConfigPatch::from_value(desired.clone()),
            None => ConfigPatch::from_value(document),
        }
    }

    async fn next_patch(&mut self) -> Result<ConfigPatch, TransportError> {
        std::future::pending().await
    }
}

/// Logs what would be reported to a hub.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl TwinPublisher for LogPublisher {
    async fn publish_status(&self, status: &ReportedStatus) -> Result<(), TransportError> {
        info!(
            status = ?status.current_status.status,
            model = %status.current_status.model,
            "Reported status"
        );
        Ok(())
    }

    async fn publish_telemetry(&self, message: &TelemetryMessage) -> Result<(), TransportError> {
        info!(
            total = message.total_detections,
            detected = ?message.counts_by_label,
            "Telemetry"
        );
        Ok(())
    }
}
