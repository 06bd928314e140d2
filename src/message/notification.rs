use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::DecodeError;

/// Property name to value, in the order the hub sent them.
pub type Properties = Map<String, Value>;

/// A battery pack attached to the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Pack {
    pub serial: String,
    /// Pack properties without the `sn` field.
    pub properties: Properties,
}

/// A decoded push from the hub's notify characteristic.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    InfoResponse { device_id: String, device_sn: String },
    PropertiesUpdate { properties: Properties },
    PackDataUpdate { packs: Vec<Pack> },
    Unrecognized { raw: Vec<u8> },
}

const INFO_RESPONSE_METHOD: &str = "getInfo-rsp";
const PACK_SERIAL_FIELD: &str = "sn";

/// Decode one notification into its primary event.
///
/// When a payload carries several shapes at once, see [`decode_all`].
pub fn decode(bytes: &[u8]) -> Result<NotificationEvent, DecodeError> {
    let events = decode_all(bytes)?;
    Ok(events
        .into_iter()
        .next()
        .unwrap_or_else(|| NotificationEvent::Unrecognized { raw: bytes.to_vec() }))
}

/// Decode every event contained in one notification.
///
/// The hub frequently pushes `properties` and `packData` in the same object. Events
/// come out in the order info, properties, packs. Never empty: a payload with no known
/// shape yields a single [`NotificationEvent::Unrecognized`].
pub fn decode_all(bytes: &[u8]) -> Result<Vec<NotificationEvent>, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let value: Value = serde_json::from_str(text)?;

    let Value::Object(mut payload) = value else {
        return Ok(vec![NotificationEvent::Unrecognized { raw: bytes.to_vec() }]);
    };

    let mut events = Vec::new();

    if payload.get("method").and_then(Value::as_str) == Some(INFO_RESPONSE_METHOD) {
        let device_id = payload.get("deviceId").and_then(Value::as_str);
        let device_sn = payload.get("deviceSn").and_then(Value::as_str);
        match (device_id, device_sn) {
            (Some(device_id), Some(device_sn)) => events.push(NotificationEvent::InfoResponse {
                device_id: device_id.to_string(),
                device_sn: device_sn.to_string(),
            }),
            _ => debug!("getInfo response without deviceId/deviceSn"),
        }
    }

    if let Some(Value::Object(properties)) = payload.remove("properties") {
        events.push(NotificationEvent::PropertiesUpdate { properties });
    }

    if let Some(Value::Array(entries)) = payload.remove("packData") {
        let packs = entries.into_iter().filter_map(decode_pack).collect();
        events.push(NotificationEvent::PackDataUpdate { packs });
    }

    if events.is_empty() {
        events.push(NotificationEvent::Unrecognized { raw: bytes.to_vec() });
    }

    Ok(events)
}

fn decode_pack(entry: Value) -> Option<Pack> {
    let Value::Object(mut properties) = entry else {
        warn!("ignoring pack entry that is not an object");
        return None;
    };
    let serial = match properties.shift_remove(PACK_SERIAL_FIELD) {
        Some(Value::String(serial)) => serial,
        Some(Value::Number(serial)) => serial.to_string(),
        _ => {
            warn!(fields = properties.len(), "ignoring pack entry without serial number");
            return None;
        }
    };
    Some(Pack { serial, properties })
}
