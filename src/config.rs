//! Command line and environment configuration.
//!
//! Everything here is resolved once before the bridge starts and never changes
//! during a run.

use clap::Parser;
use tokio::time::Duration;

use crate::error::ConfigError;
use crate::message::DEFAULT_TIMEZONE;
use crate::profile::DEFAULT_PRODUCT_ID;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

const EXAMPLES: &str = "\
Examples:
  # Just show information about your hub:
  solarflow-bt-manager -i

  # Disconnect from Zendure cloud and report to a local MQTT broker:
  export WIFI_PWD='your_wifi_password'
  export SF_DEVICE_ID='your_device_id'
  solarflow-bt-manager -d -w YourWiFiName -b 192.168.1.100:1883

  # Longer scan with debug logging:
  solarflow-bt-manager -i -t 60 --debug";

#[derive(Debug, Parser)]
#[command(name = "solarflow-bt-manager", version, about = "Solarflow Bluetooth manager", after_help = EXAMPLES)]
pub struct Cli {
    /// Print hub information and exit
    #[arg(short = 'i', long = "info", conflicts_with_all = ["disconnect", "connect"])]
    pub info: bool,

    /// Disconnect the hub from the Zendure cloud and point it at the local broker
    #[arg(short = 'd', long, conflicts_with = "connect")]
    pub disconnect: bool,

    /// Connect the hub back to the Zendure cloud
    #[arg(short = 'c', long)]
    pub connect: bool,

    /// Local MQTT broker address
    #[arg(short = 'b', long = "mqtt-broker", value_name = "HOST[:PORT]")]
    pub mqtt_broker: Option<String>,

    #[arg(short = 'u', long = "mqtt-user", env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    #[arg(short = 'p', long = "mqtt-pwd", env = "MQTT_PWD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// WiFi SSID the hub should join
    #[arg(short = 'w', long = "wifi", env = "WIFI_SSID", value_name = "SSID")]
    pub wifi_ssid: Option<String>,

    #[arg(long = "wifi-pwd", env = "WIFI_PWD", hide_env_values = true)]
    pub wifi_password: Option<String>,

    /// Device id, required for disconnect
    #[arg(long = "device-id", env = "SF_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Product id (73bkTV Hub1200, A8yh63 Hub2000, yWF7hV AIO2400, ja72U0ha Hyper2000)
    #[arg(long = "product-id", env = "SF_PRODUCT_ID", default_value = DEFAULT_PRODUCT_ID)]
    pub product_id: String,

    /// Bluetooth scan timeout in seconds
    #[arg(short = 't', long = "timeout", env = "BT_SCAN_TIMEOUT", default_value_t = 20)]
    pub scan_timeout: u64,

    /// Seconds between property polls in continuous mode
    #[arg(long = "poll-interval", env = "GLOBAL_INFO_POLLING_INTERVAL", default_value_t = 60)]
    pub poll_interval: u64,

    /// Log level
    #[arg(
        short = 'l',
        long = "loglevel",
        default_value = "info",
        ignore_case = true,
        value_parser = ["trace", "debug", "info", "success", "warn", "warning", "error", "critical"],
    )]
    pub log_level: String,

    /// Debug logging, overrides --loglevel
    #[arg(long)]
    pub debug: bool,

    /// Time zone reported to the hub along with the new endpoint
    #[arg(long, default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Query info and properties once, then exit.
    InfoOnly,
    /// Poll forever, republishing telemetry.
    Continuous,
    /// Point the hub at the local broker.
    CloudDisconnect { broker: String, port: u16, ssid: String, password: String, device_id: String },
    /// Point the hub back at the Zendure cloud.
    CloudConnect { ssid: String, password: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub scan_timeout: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// How long to stay connected after reconfiguring the cloud endpoint.
    pub settle: Duration,
    /// How long info-only mode waits for responses.
    pub observation_window: Duration,
    /// Pause after a failed poll iteration.
    pub backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(30),
            observation_window: Duration::from_secs(20),
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,
    pub product_id: String,
    pub device_id: Option<String>,
    pub timezone: String,
    pub mqtt: Option<MqttSettings>,
    pub timings: Timings,
}

impl Cli {
    /// Filter directive for the tracing subscriber.
    pub fn log_filter(&self) -> String {
        if self.debug {
            return "debug".to_string();
        }
        match self.log_level.to_lowercase().as_str() {
            "success" => "info".to_string(),
            "warning" => "warn".to_string(),
            "critical" => "error".to_string(),
            level => level.to_string(),
        }
    }

    /// Validate the arguments, reporting every problem at once.
    pub fn into_config(self) -> Result<Config, Vec<ConfigError>> {
        let mut errors = Vec::new();

        let mqtt = match self.mqtt_broker.as_deref().map(parse_broker) {
            Some(Ok((host, port))) => Some(MqttSettings {
                host,
                port,
                user: self.mqtt_user.clone(),
                password: self.mqtt_password.clone(),
            }),
            Some(Err(err)) => {
                errors.push(err);
                None
            }
            None => None,
        };

        let mode = if self.disconnect {
            if self.wifi_ssid.is_none() {
                errors.push(ConfigError::MissingSsid);
            }
            if self.mqtt_broker.is_none() {
                errors.push(ConfigError::MissingBroker);
            }
            if self.wifi_password.is_none() {
                errors.push(ConfigError::MissingWifiPassword(self.wifi_ssid.clone().unwrap_or_default()));
            }
            if self.device_id.is_none() {
                errors.push(ConfigError::MissingDeviceId);
            }
            match (&mqtt, &self.wifi_ssid, &self.wifi_password, &self.device_id) {
                (Some(mqtt), Some(ssid), Some(password), Some(device_id)) => Some(RunMode::CloudDisconnect {
                    broker: mqtt.host.clone(),
                    port: mqtt.port,
                    ssid: ssid.clone(),
                    password: password.clone(),
                    device_id: device_id.clone(),
                }),
                _ => None,
            }
        } else if self.connect {
            match &self.wifi_ssid {
                Some(ssid) => Some(RunMode::CloudConnect {
                    ssid: ssid.clone(),
                    password: self.wifi_password.clone(),
                }),
                None => {
                    errors.push(ConfigError::MissingSsid);
                    None
                }
            }
        } else if self.info {
            Some(RunMode::InfoOnly)
        } else {
            Some(RunMode::Continuous)
        };

        match mode {
            Some(mode) if errors.is_empty() => Ok(Config {
                mode,
                product_id: self.product_id,
                device_id: self.device_id,
                timezone: self.timezone,
                mqtt,
                timings: Timings {
                    scan_timeout: Duration::from_secs(self.scan_timeout),
                    poll_interval: Duration::from_secs(self.poll_interval),
                    ..Timings::default()
                },
            }),
            _ => Err(errors),
        }
    }
}

/// Split `HOST[:PORT]`, defaulting the port to 1883.
pub fn parse_broker(value: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidBroker(value.to_string());
    let (host, port) = match value.split_once(':') {
        Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
        None => (value, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["solarflow-bt-manager"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(parse_broker("10.0.0.1").unwrap(), ("10.0.0.1".to_string(), 1883));
        assert_eq!(parse_broker("broker:1884").unwrap(), ("broker".to_string(), 1884));
        assert_eq!(parse_broker("broker:x"), Err(ConfigError::InvalidBroker("broker:x".into())));
        assert_eq!(parse_broker(":1883"), Err(ConfigError::InvalidBroker(":1883".into())));
    }

    #[test]
    fn test_info_mode() {
        let config = parse(&["-i", "--product-id", "73bkTV", "-t", "60"]).into_config().unwrap();
        assert_eq!(config.mode, RunMode::InfoOnly);
        assert_eq!(config.product_id, "73bkTV");
        assert_eq!(config.timings.scan_timeout, Duration::from_secs(60));
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn test_default_is_continuous() {
        let config = parse(&["-b", "localhost", "-u", "me", "-p", "pw", "--poll-interval", "10"])
            .into_config()
            .unwrap();
        assert_eq!(config.mode, RunMode::Continuous);
        assert_eq!(config.timings.poll_interval, Duration::from_secs(10));
        assert_eq!(
            config.mqtt,
            Some(MqttSettings {
                host: "localhost".into(),
                port: 1883,
                user: Some("me".into()),
                password: Some("pw".into()),
            })
        );
    }

    #[test]
    fn test_disconnect_reports_every_missing_value() {
        let errors = parse(&["-d"]).into_config().unwrap_err();
        assert!(errors.contains(&ConfigError::MissingSsid));
        assert!(errors.contains(&ConfigError::MissingBroker));
        assert!(errors.contains(&ConfigError::MissingDeviceId));
        assert!(errors.iter().any(|err| matches!(err, ConfigError::MissingWifiPassword(_))));
    }

    #[test]
    fn test_disconnect_mode() {
        let config = parse(&[
            "-d", "-w", "home", "-b", "192.168.1.100:1883", "--wifi-pwd", "secret", "--device-id", "dev1",
        ])
        .into_config()
        .unwrap();
        assert_eq!(
            config.mode,
            RunMode::CloudDisconnect {
                broker: "192.168.1.100".into(),
                port: 1883,
                ssid: "home".into(),
                password: "secret".into(),
                device_id: "dev1".into(),
            }
        );
    }

    #[test]
    fn test_connect_requires_ssid() {
        assert_eq!(parse(&["-c"]).into_config().unwrap_err(), vec![ConfigError::MissingSsid]);
        let config = parse(&["-c", "-w", "home"]).into_config().unwrap();
        assert!(matches!(config.mode, RunMode::CloudConnect { .. }));
    }

    #[test]
    fn test_modes_conflict() {
        assert!(Cli::try_parse_from(["solarflow-bt-manager", "-i", "-d"]).is_err());
        assert!(Cli::try_parse_from(["solarflow-bt-manager", "-c", "-d"]).is_err());
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(parse(&["-l", "WARNING"]).log_filter(), "warn");
        assert_eq!(parse(&["-l", "error", "--debug"]).log_filter(), "debug");
        assert_eq!(parse(&[]).log_filter(), "info");
        assert_eq!(parse(&["-l", "SUCCESS"]).log_filter(), "info");
        assert_eq!(parse(&["-l", "Critical"]).log_filter(), "error");
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        assert!(Cli::try_parse_from(["solarflow-bt-manager", "-l", "verbose"]).is_err());
    }
}
