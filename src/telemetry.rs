use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::error::PublishError;
use crate::message::{register_reply, NotificationEvent, Properties, DEFAULT_TOKEN};
use crate::session::NotificationHandler;

pub const TELEMETRY_TOPIC_PREFIX: &str = "solarflow-hub/telemetry";

const MQTT_CLIENT_ID: &str = "solarflow-bt";
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(5);
const MQTT_CHANNEL_CAPACITY: usize = 100;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Somewhere telemetry can be published. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError>;
}

/// [`Publisher`] backed by an MQTT connection.
///
/// The rumqttc event loop runs on its own task and reconnects after errors. Publishes
/// are queued on the client without waiting. While the broker is unreachable the queue
/// fills up and further messages are dropped.
pub struct MqttPublisher {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Self {
        info!(host = %settings.host, port = settings.port, "connecting to MQTT broker");
        let mut options = MqttOptions::new(MQTT_CLIENT_ID, settings.host.clone(), settings.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            debug!(%user, "using MQTT authentication");
            options.set_credentials(user.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("connected to MQTT broker");
                        } else {
                            error!(code = ?ack.code, "failed to connect to MQTT");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "MQTT connection error");
                        tokio::time::sleep(MQTT_RETRY_DELAY).await;
                    }
                }
            }
        });

        Self { client, event_loop }
    }

    /// Send DISCONNECT and stop the event loop.
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.try_disconnect() {
            debug!(%err, "MQTT disconnect failed");
        }
        // Give the event loop a moment to flush the queue and the DISCONNECT.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.event_loop.abort();
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        self.client.try_publish(topic, QoS::AtMostOnce, retain, payload)?;
        Ok(())
    }
}

/// Republishes hub notifications as MQTT messages.
///
/// Works without a publisher too, in which case it only logs.
pub struct TelemetrySink {
    publisher: Option<Arc<dyn Publisher>>,
    product_id: String,
    device_id: RwLock<Option<String>>,
}

impl TelemetrySink {
    /// `device_id` names the aggregate state topic. When `None`, the id from the
    /// first info response is used.
    pub fn new(publisher: Option<Arc<dyn Publisher>>, product_id: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            publisher,
            product_id: product_id.into(),
            device_id: RwLock::new(device_id),
        }
    }

    pub fn device_id(&self) -> Option<String> {
        self.device_id.read().ok().and_then(|id| id.clone())
    }

    pub async fn publish(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::InfoResponse { device_id, device_sn } => {
                info!(%device_id, "device ID");
                info!(%device_sn, "device SN");
                if let Ok(mut known) = self.device_id.write() {
                    known.get_or_insert(device_id);
                }
            }
            NotificationEvent::PropertiesUpdate { properties } => self.publish_properties(&properties).await,
            NotificationEvent::PackDataUpdate { packs } => {
                if !packs.is_empty() {
                    info!(count = packs.len(), "battery packs");
                }
                for pack in packs {
                    debug!(sn = %pack.serial, "pack");
                    for (name, value) in &pack.properties {
                        let topic = format!("{TELEMETRY_TOPIC_PREFIX}/batteries/{}/{name}", pack.serial);
                        self.send(&topic, scalar_payload(value), false).await;
                    }
                }
            }
            NotificationEvent::Unrecognized { raw } => {
                debug!(payload = %String::from_utf8_lossy(&raw), "unrecognized notification");
            }
        }
    }

    async fn publish_properties(&self, properties: &Properties) {
        debug!(count = properties.len(), "properties received");
        for (name, value) in properties {
            if value.is_number() {
                debug!("  {name}: {value}");
            }
            self.send(&format!("{TELEMETRY_TOPIC_PREFIX}/{name}"), scalar_payload(value), false)
                .await;
        }

        let Some(device_id) = self.device_id() else {
            warn!("device id unknown, skipping state message");
            return;
        };
        match serde_json::to_string(properties) {
            Ok(state) => {
                self.send(&format!("{}/{device_id}/state", self.product_id), state, false)
                    .await;
            }
            Err(err) => error!(%err, "serializing state failed"),
        }
    }

    /// Publish the retained registration acknowledgment a hub expects after its
    /// endpoint was moved to the local broker.
    pub async fn publish_register_reply(&self, device_id: &str) {
        let topic = format!("iot/{}/{device_id}/register/replay", self.product_id);
        match register_reply(DEFAULT_TOKEN, chrono::Utc::now().timestamp()) {
            Ok(reply) => {
                info!(%topic, "publishing register reply");
                self.send(&topic, reply, true).await;
            }
            Err(err) => error!(%err, "building register reply failed"),
        }
    }

    async fn send(&self, topic: &str, payload: String, retain: bool) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(err) = publisher.publish(topic, payload, retain).await {
            warn!(%err, topic, "publish failed");
        }
    }
}

#[async_trait]
impl NotificationHandler for TelemetrySink {
    async fn handle(&self, event: NotificationEvent) {
        self.publish(event).await;
    }
}

/// MQTT payload for a single property: strings go out bare, everything else as JSON text.
pub fn scalar_payload(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    messages: std::sync::Mutex<Vec<Published>>,
}

#[cfg(test)]
impl RecordingPublisher {
    pub(crate) fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        self.messages.lock().unwrap().push(Published { topic: topic.to_string(), payload, retain });
        Ok(())
    }
}
