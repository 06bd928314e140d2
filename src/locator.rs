//! Finding the hub among everything that advertises nearby.
//!
//! Advertisement delivery is racy and differs per platform: a filtered scan can miss a
//! hub that a plain collecting scan saw a moment earlier, and the other way round. So
//! discovery runs two strategies and takes the first hit:
//!
//! 1. a collecting scan that records every advertiser for the whole timeout,
//! 2. a filtered scan that returns as soon as a matching name shows up,
//! 3. if the filtered scan comes back empty, a linear search of the list from step 1.

use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::profile::{matches_prefix, resolve_profile};
use crate::session::DeviceHandle;
use crate::transport::{Advertiser, Transport};

pub struct DeviceLocator<'a> {
    transport: &'a dyn Transport,
}

impl<'a> DeviceLocator<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    /// Find the hub for `product_id`. Scan errors are logged and count as "not found".
    pub async fn locate(&self, product_id: &str, scan_timeout: Duration) -> Option<DeviceHandle> {
        let prefix = resolve_profile(product_id);
        info!(prefix, timeout_s = scan_timeout.as_secs(), "scanning for Zendure device");

        let advertisers = match self.transport.scan(scan_timeout).await {
            Ok(advertisers) => advertisers,
            Err(err) => {
                error!(%err, "collecting scan failed");
                Vec::new()
            }
        };
        if advertisers.is_empty() {
            warn!("no Bluetooth devices found at all, check your Bluetooth adapter");
        } else {
            debug!(count = advertisers.len(), "found Bluetooth devices");
            for (i, advertiser) in advertisers.iter().enumerate() {
                debug!(
                    "  device {}: {} ({})",
                    i + 1,
                    advertiser.name.as_deref().unwrap_or("Unknown"),
                    advertiser.address
                );
            }
        }

        info!("trying to find device by name filter");
        let predicate = move |advertiser: &Advertiser| matches_prefix(advertiser.name.as_deref(), prefix);
        let filtered = match self.transport.scan_for(&predicate, scan_timeout).await {
            Ok(found) => found,
            Err(err) => {
                error!(%err, "name filter scan failed");
                None
            }
        };

        let found = match filtered {
            Some(found) => Some(found),
            None => {
                info!("trying alternative method to find device");
                let fallback = find_in(&advertisers, prefix).cloned();
                if let Some(found) = &fallback {
                    info!(name = ?found.name, address = %found.address, "found device using alternative method");
                }
                fallback
            }
        };

        found.map(|advertiser| {
            DeviceHandle::discovered(advertiser.address, advertiser.name.unwrap_or_default())
        })
    }
}

/// First advertiser whose name starts with `prefix`, ignoring case.
pub fn find_in<'l>(advertisers: &'l [Advertiser], prefix: &str) -> Option<&'l Advertiser> {
    advertisers
        .iter()
        .find(|advertiser| matches_prefix(advertiser.name.as_deref(), prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionState;
    use crate::transport::fake::FakeTransport;

    #[tokio::test(start_paused = true)]
    async fn test_locate_by_filtered_scan() {
        let transport = FakeTransport::hub();
        let handle = DeviceLocator::new(&transport)
            .locate("ja72U0ha", Duration::from_secs(20))
            .await
            .expect("hub should be found");
        assert_eq!(handle.address, "AA:02");
        assert_eq!(handle.display_name, "ZenE-1234");
        assert_eq!(handle.state, ConnectionState::Discovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_falls_back_to_collected_list() {
        let transport = FakeTransport::hub().with_filtered_scan_miss();
        let handle = DeviceLocator::new(&transport)
            .locate("ja72U0ha", Duration::from_secs(20))
            .await
            .expect("fallback should find the hub");
        assert_eq!(handle.address, "AA:02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_wrong_product_finds_nothing() {
        // 73bkTV resolves to "zenp"
        let transport = FakeTransport::hub();
        let found = DeviceLocator::new(&transport)
            .locate("73bkTV", Duration::from_secs(1))
            .await;
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_unknown_product_uses_generic_prefix() {
        let transport = FakeTransport::hub().with_filtered_scan_miss();
        let found = DeviceLocator::new(&transport)
            .locate("unknown", Duration::from_secs(1))
            .await;
        assert_eq!(found.map(|handle| handle.address), Some("AA:02".to_string()));
    }

    #[test]
    fn test_find_in_skips_unnamed() {
        let advertisers = vec![
            Advertiser { address: "1".into(), name: None },
            Advertiser { address: "2".into(), name: Some("zenh-9".into()) },
        ];
        assert_eq!(find_in(&advertisers, "zenh").map(|a| a.address.as_str()), Some("2"));
        assert!(find_in(&advertisers, "zene").is_none());
    }
}
