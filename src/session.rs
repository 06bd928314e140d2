use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, DecodeError, SendError, TransportError};
use crate::message::{decode_all, CloudToken, CommandEnvelope, NotificationEvent};
use crate::transport::Transport;

/// Cloud broker the hub reports to out of the box.
pub const ZENDURE_CLOUD_BROKER: &str = "mq.zen-iot.com";
pub const ZENDURE_CLOUD_PORT: u16 = 1883;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// The hub as found by the locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub display_name: String,
    pub state: ConnectionState,
}

impl DeviceHandle {
    pub fn discovered(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            state: ConnectionState::Discovered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub handle: DeviceHandle,
    pub notifications_active: bool,
    pub last_poll: Option<DateTime<Utc>>,
}

/// Receives every event decoded from the notify characteristic.
///
/// Called from the dispatcher task, concurrently with commands being sent.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, event: NotificationEvent);
}

/// A connection to one hub.
///
/// `Connecting -> Connected -> Disconnected`. A transport failure moves a connected
/// session straight to `Disconnected`; reconnecting is the caller's decision.
pub struct Session {
    transport: Arc<dyn Transport>,
    state: SessionState,
    dispatcher: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to `handle`, giving up after `timeout`.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        mut handle: DeviceHandle,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        handle.state = ConnectionState::Connecting;
        info!(name = %handle.display_name, address = %handle.address, "connecting");

        match tokio::time::timeout(timeout, transport.connect(&handle.address)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                if let Err(err) = transport.disconnect().await {
                    debug!(%err, "cleanup after connect timeout failed");
                }
                return Err(ConnectError::Unreachable {
                    address: handle.address,
                    reason: format!("no connection within {}s", timeout.as_secs()),
                });
            }
        }

        handle.state = ConnectionState::Connected;
        Ok(Self {
            transport,
            state: SessionState { handle, notifications_active: false, last_poll: None },
            dispatcher: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.state.handle
    }

    pub fn is_connected(&self) -> bool {
        self.state.handle.state == ConnectionState::Connected
    }

    /// Notifications are subscribed and the stream has not ended.
    pub fn notifications_active(&self) -> bool {
        self.state.notifications_active
            && self.dispatcher.as_ref().is_some_and(|dispatcher| !dispatcher.is_finished())
    }

    /// Check the link. A dead link moves the session to `Disconnected`.
    pub async fn is_alive(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.transport.is_connected().await && self.notifications_active() {
            return true;
        }
        warn!(address = %self.state.handle.address, "session lost");
        self.mark_dropped();
        false
    }

    /// Record a transport-level failure.
    pub fn mark_dropped(&mut self) {
        self.state.handle.state = ConnectionState::Disconnected;
        self.state.notifications_active = false;
    }

    pub fn mark_polled(&mut self) {
        self.state.last_poll = Some(Utc::now());
    }

    /// Route every notification through `handler` until the link drops or
    /// [`Session::unsubscribe_notifications`] is called. Delivery order is the transport's.
    pub async fn subscribe_notifications(
        &mut self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(previous) = self.dispatcher.take() {
            previous.abort();
        }

        let mut notifications = self.transport.subscribe().await?;
        self.dispatcher = Some(tokio::spawn(async move {
            while let Some(data) = notifications.recv().await {
                dispatch(handler.as_ref(), &data).await;
            }
            debug!("notification channel closed");
        }));
        self.state.notifications_active = true;
        Ok(())
    }

    pub async fn unsubscribe_notifications(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        if self.state.notifications_active && self.is_connected() {
            if let Err(err) = self.transport.unsubscribe().await {
                warn!(%err, "stopping notifications failed");
            }
        }
        self.state.notifications_active = false;
    }

    /// Write one command. Fire and forget: any answer arrives as a notification.
    pub async fn send_command(&self, command: &CommandEnvelope) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if !self.notifications_active() {
            return Err(SendError::NotificationsInactive);
        }
        let payload = command.encode()?;
        debug!(method = command.method(), "sending command");
        self.transport.write(&payload).await?;
        Ok(())
    }

    pub async fn query_info(&self) -> Result<(), SendError> {
        self.send_command(&CommandEnvelope::GetInfo).await
    }

    pub async fn query_properties(&self) -> Result<(), SendError> {
        self.send_command(&CommandEnvelope::GetAllProperties).await
    }

    /// Point the hub at `token.broker`: token message, then station mode.
    ///
    /// Best effort. Both messages are attempted, each failure is logged, and the first
    /// one is returned.
    pub async fn set_cloud_endpoint(&self, token: CloudToken) -> Result<(), SendError> {
        info!(broker = %token.broker, port = token.port, ssid = %token.ssid, "setting IoT URL");
        let token_result = self.send_command(&CommandEnvelope::SetCloudToken(token)).await;
        if let Err(err) = &token_result {
            error!(%err, "setting reporting URL failed");
        }

        info!("setting WiFi station mode");
        let station_result = self.send_command(&CommandEnvelope::SetStationMode).await;
        if let Err(err) = &station_result {
            error!(%err, "setting WiFi mode failed");
        }

        token_result.and(station_result)
    }

    /// Point the hub back at the Zendure cloud.
    pub async fn clear_cloud_endpoint(
        &self,
        ssid: &str,
        password: Option<String>,
        timezone: &str,
    ) -> Result<(), SendError> {
        let token = CloudToken {
            timezone: timezone.to_string(),
            ..CloudToken::new(ZENDURE_CLOUD_BROKER, ZENDURE_CLOUD_PORT, ssid, password)
        };
        self.set_cloud_endpoint(token).await
    }

    /// Unsubscribe and disconnect. Safe to call any number of times.
    pub async fn close(&mut self) {
        self.unsubscribe_notifications().await;
        if self.state.handle.state == ConnectionState::Disconnected && !self.transport.is_connected().await {
            return;
        }
        if let Err(err) = self.transport.disconnect().await {
            warn!(%err, "disconnect failed");
        }
        self.state.handle.state = ConnectionState::Disconnected;
        info!(address = %self.state.handle.address, "disconnected");
    }
}

async fn dispatch(handler: &dyn NotificationHandler, data: &[u8]) {
    match decode_all(data) {
        Ok(events) => {
            for event in events {
                handler.handle(event).await;
            }
        }
        Err(DecodeError::InvalidJson(err)) => {
            error!(%err, payload = %String::from_utf8_lossy(data), "invalid JSON received");
        }
        Err(err @ DecodeError::InvalidEncoding(_)) => {
            error!(%err, raw = %hex::encode(data), "error handling received data");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::fake::FakeTransport;

    #[derive(Default)]
    struct Collect(Mutex<Vec<NotificationEvent>>);

    #[async_trait]
    impl NotificationHandler for Collect {
        async fn handle(&self, event: NotificationEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn hub_handle() -> DeviceHandle {
        DeviceHandle::discovered("AA:02", "ZenE-1234")
    }

    async fn connected(fake: &Arc<FakeTransport>) -> Session {
        Session::connect(fake.clone(), hub_handle(), Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let fake = Arc::new(FakeTransport::hub());
        let mut session = connected(&fake).await;
        assert_eq!(session.handle().state, ConnectionState::Connected);
        assert!(fake.connected());

        session.close().await;
        assert_eq!(session.handle().state, ConnectionState::Disconnected);
        assert!(!fake.connected());

        // second close is a no-op
        session.close().await;
        assert_eq!(session.handle().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let fake = Arc::new(FakeTransport::hub().unreachable());
        let result = Session::connect(fake, hub_handle(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectError::Unreachable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let fake = Arc::new(FakeTransport::hub().hanging());
        let started = tokio::time::Instant::now();
        let result = Session::connect(fake.clone(), hub_handle(), Duration::from_secs(30)).await;

        let Err(ConnectError::Unreachable { address, reason }) = result else {
            panic!("expected unreachable");
        };
        assert_eq!(address, "AA:02");
        assert!(reason.contains("30s"));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(!fake.connected());
    }

    #[tokio::test]
    async fn test_connect_protocol_mismatch() {
        let fake = Arc::new(FakeTransport::hub().missing_characteristic("notify"));
        let result = Session::connect(fake, hub_handle(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectError::ProtocolMismatch { missing: "notify", .. })));
    }

    #[tokio::test]
    async fn test_send_requires_notifications() {
        let fake = Arc::new(FakeTransport::hub());
        let session = connected(&fake).await;
        let result = session.query_info().await;
        assert!(matches!(result, Err(SendError::NotificationsInactive)));
        assert!(fake.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let fake = Arc::new(FakeTransport::hub());
        let mut session = connected(&fake).await;
        session.subscribe_notifications(Arc::new(Collect::default())).await.unwrap();
        session.close().await;
        assert!(matches!(session.query_info().await, Err(SendError::NotConnected)));
    }

    #[tokio::test]
    async fn test_notifications_are_decoded_and_dispatched() {
        let fake = Arc::new(
            FakeTransport::hub().reply_with(br#"{"method":"getInfo-rsp","deviceId":"dev1","deviceSn":"SN1"}"#),
        );
        let mut session = connected(&fake).await;
        let collect = Arc::new(Collect::default());
        session.subscribe_notifications(collect.clone()).await.unwrap();

        session.query_info().await.unwrap();
        fake.notify(b"{not json");
        fake.notify(br#"{"properties":{"soc":1},"packData":[{"sn":"P","v":2}]}"#);

        for _ in 0..50 {
            if collect.0.lock().unwrap().len() >= 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = collect.0.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            NotificationEvent::InfoResponse { device_id: "dev1".into(), device_sn: "SN1".into() }
        );
        assert!(matches!(events[1], NotificationEvent::PropertiesUpdate { .. }));
        assert!(matches!(events[2], NotificationEvent::PackDataUpdate { .. }));
        assert_eq!(fake.written_methods(), vec!["getInfo"]);
    }

    #[tokio::test]
    async fn test_cloud_endpoint_sequence() {
        let fake = Arc::new(FakeTransport::hub());
        let mut session = connected(&fake).await;
        session.subscribe_notifications(Arc::new(Collect::default())).await.unwrap();

        session.clear_cloud_endpoint("home", None, "GMT+01:00").await.unwrap();
        assert_eq!(fake.written_methods(), vec!["token", "station"]);
        let token: serde_json::Value = serde_json::from_slice(&fake.writes()[0]).unwrap();
        assert_eq!(token["iotUrl"], ZENDURE_CLOUD_BROKER);
        assert_eq!(token["timeZone"], "GMT+01:00");
    }

    #[tokio::test]
    async fn test_cloud_endpoint_continues_after_failed_send() {
        let fake = Arc::new(FakeTransport::hub());
        let mut session = connected(&fake).await;
        session.subscribe_notifications(Arc::new(Collect::default())).await.unwrap();
        fake.fail_next_writes(1);

        let token = CloudToken::new("10.0.0.2", 1883, "home", Some("pw".into()));
        assert!(session.set_cloud_endpoint(token).await.is_err());
        assert_eq!(fake.written_methods(), vec!["station"]);
    }

    #[tokio::test]
    async fn test_drop_is_detected() {
        let fake = Arc::new(FakeTransport::hub());
        let mut session = connected(&fake).await;
        session.subscribe_notifications(Arc::new(Collect::default())).await.unwrap();
        assert!(session.is_alive().await);

        fake.drop_link();
        assert!(!session.is_alive().await);
        assert_eq!(session.handle().state, ConnectionState::Disconnected);
        session.close().await;
    }
}
