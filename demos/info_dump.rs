use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solarflow_bt_manager::{BluestTransport, DeviceLocator, NotificationEvent, NotificationHandler, Session};

struct Print;

#[async_trait]
impl NotificationHandler for Print {
    async fn handle(&self, event: NotificationEvent) {
        println!("{event:?}");
    }
}

#[tokio::main]
pub async fn main() {
    let transport = Arc::new(BluestTransport::new().await.unwrap());
    let handle = DeviceLocator::new(transport.as_ref())
        .locate("ja72U0ha", Duration::from_secs(20))
        .await
        .expect("no hub in range");

    let mut session = Session::connect(transport, handle, Duration::from_secs(30)).await.unwrap();
    session.subscribe_notifications(Arc::new(Print)).await.unwrap();
    loop {
        session.query_info().await.unwrap();
        session.query_properties().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
