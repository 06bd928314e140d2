use std::sync::Arc;

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, RunMode, Timings};
use crate::error::{BridgeError, ConnectError, SendError};
use crate::locator::DeviceLocator;
use crate::message::CloudToken;
use crate::session::{DeviceHandle, Session};
use crate::telemetry::TelemetrySink;
use crate::transport::Transport;

const TROUBLESHOOTING: &str = "
Troubleshooting steps:
  1. Move closer to the hub
  2. Reset your bluetooth connection (sudo systemctl restart bluetooth)
  3. Make sure bluetooth is enabled (bluetoothctl power on)
  4. Restart the Solarflow Hub
  5. Disconnect any mobile Apps currently connected to the hub
  6. Try increasing scan timeout with BT_SCAN_TIMEOUT environment variable
  7. On Ubuntu/Linux systems, ensure you have proper permissions (try with sudo)
  8. Check if btmon shows any BT activity when scanning";

/// Drives one hub through a single run: discovery, connection, then the selected mode.
pub struct Bridge {
    transport: Arc<dyn Transport>,
    sink: Arc<TelemetrySink>,
    mode: RunMode,
    product_id: String,
    timezone: String,
    timings: Timings,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<TelemetrySink>, config: &Config) -> Self {
        Self {
            transport,
            sink,
            mode: config.mode.clone(),
            product_id: config.product_id.clone(),
            timezone: config.timezone.clone(),
            timings: config.timings,
        }
    }

    /// Run until the mode completes, or forever in continuous mode. Cancelling `cancel`
    /// stops the run and makes a best-effort attempt to disconnect.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        let located = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            located = self.locate() => located,
        };
        let Some(handle) = located else {
            error!("no Solarflow device found");
            warn!("{TROUBLESHOOTING}");
            return Err(BridgeError::DeviceNotFound);
        };
        info!(name = %handle.display_name, address = %handle.address, "found device");

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            session = self.open(handle.clone()) => session?,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("interrupted, disconnecting");
                Ok(())
            }
            result = self.run_mode(&mut session, &handle, cancel) => result,
        };
        session.close().await;
        result
    }

    async fn locate(&self) -> Option<DeviceHandle> {
        DeviceLocator::new(self.transport.as_ref())
            .locate(&self.product_id, self.timings.scan_timeout)
            .await
    }

    /// Connect and subscribe the telemetry sink.
    async fn open(&self, handle: DeviceHandle) -> Result<Session, ConnectError> {
        let mut session = Session::connect(self.transport.clone(), handle, self.timings.connect_timeout).await?;
        if let Err(err) = session.subscribe_notifications(self.sink.clone()).await {
            session.close().await;
            return Err(ConnectError::Subscribe(err));
        }
        Ok(session)
    }

    async fn run_mode(
        &self,
        session: &mut Session,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        match &self.mode {
            RunMode::InfoOnly => {
                info!("running in info-only mode");
                // Failures are already logged and the observation window still applies.
                let _ = self.poll(session).await;
                tokio::time::sleep(self.timings.observation_window).await;
                session.unsubscribe_notifications().await;
            }
            RunMode::CloudDisconnect { broker, port, ssid, password, device_id } => {
                info!("setting to disconnect from Zendure cloud");
                let token = CloudToken {
                    timezone: self.timezone.clone(),
                    ..CloudToken::new(broker, *port, ssid, Some(password.clone()))
                };
                // Best effort: the hub's behavior, not the write result, tells whether it worked.
                let _ = session.set_cloud_endpoint(token).await;
                self.sink.publish_register_reply(device_id).await;
                info!("disconnected from Zendure cloud, hub should report to local MQTT now");
                tokio::time::sleep(self.timings.settle).await;
            }
            RunMode::CloudConnect { ssid, password } => {
                info!("setting to reconnect to Zendure cloud");
                let _ = session.clear_cloud_endpoint(ssid, password.clone(), &self.timezone).await;
                info!("reconnected to Zendure cloud");
                tokio::time::sleep(self.timings.settle).await;
            }
            RunMode::Continuous => self.run_continuous(session, handle, cancel).await,
        }
        Ok(())
    }

    /// Poll forever. Failed iterations are logged and retried after a backoff; a lost
    /// link is reconnected and resubscribed before the next poll.
    async fn run_continuous(&self, session: &mut Session, handle: &DeviceHandle, cancel: &CancellationToken) {
        info!(
            interval_s = self.timings.poll_interval.as_secs(),
            "running in continuous polling mode"
        );

        loop {
            let delay = match self.poll_iteration(session, handle).await {
                Ok(()) => self.timings.poll_interval,
                Err(err) => {
                    error!(%err, "error in polling loop");
                    self.timings.backoff
                }
            };
            if !sleep_or_cancel(cancel, delay).await {
                return;
            }
        }
    }

    async fn poll_iteration(&self, session: &mut Session, handle: &DeviceHandle) -> Result<(), BridgeError> {
        if !session.is_alive().await {
            session.close().await;
            info!(address = %handle.address, "reconnecting");
            *session = self.open(handle.clone()).await?;
        }
        if let Err(err) = self.poll(session).await {
            session.mark_dropped();
            return Err(err.into());
        }
        Ok(())
    }

    /// Ask for info and every property. Answers arrive through the notification handler.
    ///
    /// Both requests are always attempted. Returns the first failure that means the
    /// session is gone; single-message failures are only logged.
    async fn poll(&self, session: &mut Session) -> Result<(), SendError> {
        let info = session.query_info().await;
        if let Err(err) = &info {
            error!(%err, "getting device info failed");
        }
        let properties = session.query_properties().await;
        if let Err(err) = &properties {
            error!(%err, "getting device properties failed");
        }
        session.mark_polled();

        [info, properties]
            .into_iter()
            .filter_map(Result::err)
            .find(SendError::is_session_fault)
            .map_or(Ok(()), Err)
    }
}

/// Sleep for `delay`. Returns `false` if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
