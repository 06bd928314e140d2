//! Bridge a Zendure Solarflow hub to a local MQTT broker over Bluetooth Low Energy
//!
//! The hub speaks a small JSON protocol over two GATT characteristics: commands are
//! written to one, and the hub pushes responses and telemetry on the other. This crate
//! finds the hub, keeps a session open, polls it and republishes what it reports.
//!
//! It can also rewrite the MQTT endpoint the hub reports to, which moves a hub off the
//! Zendure cloud onto a local broker and back.
//!
//! Published topics:
//!
//! - `solarflow-hub/telemetry/<property>`
//! - `solarflow-hub/telemetry/batteries/<pack serial>/<property>`
//! - `<product id>/<device id>/state` (all properties as one JSON object)
//! - `iot/<product id>/<device id>/register/replay` (retained, after a disconnect)
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use solarflow_bt_manager::{BluestTransport, DeviceLocator, Session, TelemetrySink};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(BluestTransport::new().await?);
//!     let handle = DeviceLocator::new(transport.as_ref())
//!         .locate("ja72U0ha", Duration::from_secs(20))
//!         .await
//!         .ok_or(anyhow::anyhow!("hub not found"))?;
//!
//!     let mut session = Session::connect(transport, handle, Duration::from_secs(30)).await?;
//!     session.subscribe_notifications(Arc::new(TelemetrySink::new(None, "ja72U0ha", None))).await?;
//!     session.query_info().await?;
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     session.close().await;
//! #   Ok(())
//! # }
//! ```

mod bridge;
pub mod config;
mod error;
mod locator;
pub mod message;
mod profile;
mod session;
mod telemetry;
mod transport;

pub use bridge::Bridge;
pub use error::{BridgeError, ConfigError, ConnectError, DecodeError, PublishError, SendError, TransportError};
pub use locator::DeviceLocator;
pub use message::{CommandEnvelope, NotificationEvent};
pub use profile::{resolve_profile, ProductProfile};
pub use session::{ConnectionState, DeviceHandle, NotificationHandler, Session, SessionState};
pub use telemetry::{MqttPublisher, Publisher, TelemetrySink};
pub use transport::{Advertiser, BluestTransport, Transport};
