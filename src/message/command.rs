use serde::Serialize;

/// Time zone the hub is told it lives in when its cloud endpoint is rewritten.
pub const DEFAULT_TIMEZONE: &str = "GMT+02:00";
/// The hub only checks that the registration reply echoes the token it was given.
pub const DEFAULT_TOKEN: &str = "abcdefgh";

/// An outbound message for the hub's command characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEnvelope {
    GetInfo,
    GetAllProperties,
    SetCloudToken(CloudToken),
    SetStationMode,
}

/// Endpoint and WiFi credentials for [`CommandEnvelope::SetCloudToken`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudToken {
    pub broker: String,
    /// Kept for logging only, the hub protocol has no port field.
    pub port: u16,
    pub ssid: String,
    pub password: Option<String>,
    pub timezone: String,
    pub token: String,
}

impl CloudToken {
    pub fn new(broker: impl Into<String>, port: u16, ssid: impl Into<String>, password: Option<String>) -> Self {
        Self {
            broker: broker.into(),
            port,
            ssid: ssid.into(),
            password,
            timezone: DEFAULT_TIMEZONE.to_string(),
            token: DEFAULT_TOKEN.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetInfoWire<'a> {
    message_id: &'a str,
    method: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadWire<'a> {
    method: &'a str,
    timestamp: String,
    message_id: &'a str,
    properties: [&'a str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenWire<'a> {
    iot_url: &'a str,
    message_id: &'a str,
    method: &'a str,
    password: Option<&'a str>,
    ssid: &'a str,
    time_zone: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StationWire<'a> {
    message_id: &'a str,
    method: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterReplyWire<'a> {
    message_id: u32,
    timestamp: i64,
    params: RegisterParams<'a>,
}

#[derive(Serialize)]
struct RegisterParams<'a> {
    token: &'a str,
    result: u8,
}

impl CommandEnvelope {
    /// The `method` discriminator written on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            CommandEnvelope::GetInfo => "getInfo",
            CommandEnvelope::GetAllProperties => "read",
            CommandEnvelope::SetCloudToken(_) => "token",
            CommandEnvelope::SetStationMode => "station",
        }
    }

    /// Encode the command stamped with the current time.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.encode_at(chrono::Utc::now().timestamp())
    }

    /// Encode the command with an explicit Unix timestamp (seconds).
    ///
    /// Output is byte-identical for equal commands and timestamps. Commands without a
    /// timestamp field ignore `unix_seconds`.
    pub fn encode_at(&self, unix_seconds: i64) -> Result<Vec<u8>, serde_json::Error> {
        let method = self.method();
        match self {
            CommandEnvelope::GetInfo => serde_json::to_vec(&GetInfoWire {
                message_id: "none",
                method,
                timestamp: unix_seconds.to_string(),
            }),
            CommandEnvelope::GetAllProperties => serde_json::to_vec(&ReadWire {
                method,
                timestamp: unix_seconds.to_string(),
                message_id: "none",
                properties: ["getAll"],
            }),
            CommandEnvelope::SetCloudToken(token) => serde_json::to_vec(&TokenWire {
                iot_url: &token.broker,
                message_id: "1002",
                method,
                password: token.password.as_deref(),
                ssid: &token.ssid,
                time_zone: &token.timezone,
                token: &token.token,
            }),
            CommandEnvelope::SetStationMode => serde_json::to_vec(&StationWire {
                message_id: "1003",
                method,
            }),
        }
    }
}

/// The acknowledgment the Zendure cloud would send after the hub registers.
///
/// Published retained on the local broker so a hub switched to local mode finds it.
pub fn register_reply(token: &str, unix_seconds: i64) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RegisterReplyWire {
        message_id: 123,
        timestamp: unix_seconds,
        params: RegisterParams { token, result: 0 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(cmd: &CommandEnvelope, ts: i64) -> String {
        String::from_utf8(cmd.encode_at(ts).unwrap()).unwrap()
    }

    #[test]
    fn test_get_info_shape() {
        assert_eq!(
            text(&CommandEnvelope::GetInfo, 1700000000),
            r#"{"messageId":"none","method":"getInfo","timestamp":"1700000000"}"#
        );
    }

    #[test]
    fn test_get_all_properties_shape() {
        assert_eq!(
            text(&CommandEnvelope::GetAllProperties, 42),
            r#"{"method":"read","timestamp":"42","messageId":"none","properties":["getAll"]}"#
        );
    }

    #[test]
    fn test_set_cloud_token_shape() {
        let cmd = CommandEnvelope::SetCloudToken(CloudToken::new(
            "192.168.1.10",
            1883,
            "home",
            Some("secret".to_string()),
        ));
        assert_eq!(
            text(&cmd, 0),
            r#"{"iotUrl":"192.168.1.10","messageId":"1002","method":"token","password":"secret","ssid":"home","timeZone":"GMT+02:00","token":"abcdefgh"}"#
        );
    }

    #[test]
    fn test_set_cloud_token_without_password() {
        let cmd = CommandEnvelope::SetCloudToken(CloudToken::new("mq.zen-iot.com", 1883, "home", None));
        let value: serde_json::Value = serde_json::from_slice(&cmd.encode_at(0).unwrap()).unwrap();
        assert!(value["password"].is_null());
        assert_eq!(value["iotUrl"], "mq.zen-iot.com");
        assert!(value.get("port").is_none());
    }

    #[test]
    fn test_station_shape() {
        assert_eq!(
            text(&CommandEnvelope::SetStationMode, 99),
            r#"{"messageId":"1003","method":"station"}"#
        );
    }

    #[test]
    fn test_encode_is_deterministic() {
        let cmds = [
            CommandEnvelope::GetInfo,
            CommandEnvelope::GetAllProperties,
            CommandEnvelope::SetStationMode,
            CommandEnvelope::SetCloudToken(CloudToken::new("b", 1, "s", None)),
        ];
        for cmd in &cmds {
            assert_eq!(cmd.encode_at(1234).unwrap(), cmd.encode_at(1234).unwrap());
        }
        assert_ne!(
            CommandEnvelope::GetInfo.encode_at(1).unwrap(),
            CommandEnvelope::GetInfo.encode_at(2).unwrap()
        );
    }

    #[test]
    fn test_encode_stamps_string_timestamp() {
        let value: serde_json::Value =
            serde_json::from_slice(&CommandEnvelope::GetInfo.encode().unwrap()).unwrap();
        let ts: i64 = value["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(ts > 1_600_000_000);
    }

    #[test]
    fn test_register_reply() {
        assert_eq!(
            register_reply(DEFAULT_TOKEN, 1700000000).unwrap(),
            r#"{"messageId":123,"timestamp":1700000000,"params":{"token":"abcdefgh","result":0}}"#
        );
    }
}
