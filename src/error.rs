use thiserror::Error;

/// Failure to turn inbound notification bytes into a [`crate::NotificationEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("notification is not valid UTF-8: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),
    #[error("notification is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Errors raised by the BLE transport underneath a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("device {0} has not been seen during a scan")]
    UnknownDevice(String),
    #[error("not connected to a device")]
    NotConnected,
    #[error("notification stream is not available")]
    NotificationsUnavailable,
    #[error("bluetooth: {0}")]
    Ble(#[from] bluest::Error),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("device {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("device {address} does not expose the {missing} characteristic")]
    ProtocolMismatch { address: String, missing: &'static str },
    #[error("subscribing to notifications failed: {0}")]
    Subscribe(#[source] TransportError),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("session is not connected")]
    NotConnected,
    #[error("notifications must be subscribed before sending commands")]
    NotificationsInactive,
    #[error("encoding command failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing command failed: {0}")]
    Transport(#[from] TransportError),
}

impl SendError {
    /// Whether the failure means the session itself is gone, as opposed to a single bad message.
    pub fn is_session_fault(&self) -> bool {
        !matches!(self, SendError::Encode(_))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt request queue full, message dropped")]
    QueueFull,
    #[error("mqtt: {0}")]
    Mqtt(rumqttc::ClientError),
}

impl From<rumqttc::ClientError> for PublishError {
    fn from(err: rumqttc::ClientError) -> Self {
        match err {
            rumqttc::ClientError::TryRequest(_) => PublishError::QueueFull,
            other => PublishError::Mqtt(other),
        }
    }
}

/// A single configuration problem. Validation collects all of them before giving up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("WiFi SSID (-w) is required")]
    MissingSsid,
    #[error("local MQTT broker (-b) is required")]
    MissingBroker,
    #[error("WiFi password for SSID \"{0}\" is required (set WIFI_PWD)")]
    MissingWifiPassword(String),
    #[error("device id is required (set SF_DEVICE_ID)")]
    MissingDeviceId,
    #[error("invalid MQTT broker address \"{0}\", expected HOST[:PORT]")]
    InvalidBroker(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no Solarflow device found")]
    DeviceNotFound,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
}
