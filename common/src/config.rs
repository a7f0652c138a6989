use serde::{Deserialize, Serialize};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Stored Wi-Fi credentials. Persisted as its own blob, independent of the
/// MQTT settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub pass: String,
}

impl WifiConfig {
    /// Absent credentials force the provisioning access point at boot.
    pub fn has_credentials(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

/// Stored MQTT settings. `state_topic` left empty means "derive from
/// `cmd_topic`" (see [`crate::topics::MqttTopics`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub cmd_topic: String,
    pub state_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: DEFAULT_MQTT_PORT,
            user: String::new(),
            pass: String::new(),
            cmd_topic: String::new(),
            state_topic: String::new(),
        }
    }
}

impl MqttConfig {
    /// A broker session is only attempted when minimally configured.
    pub fn ready(&self) -> bool {
        self.enabled && !self.host.is_empty() && !self.cmd_topic.is_empty()
    }
}

/// Form-field port parsing: anything outside 1..=65535 falls back to the
/// default broker port.
pub fn parse_port(raw: &str) -> u16 {
    match raw.trim().parse::<i64>() {
        Ok(port) if (1..=65_535).contains(&port) => port as u16,
        _ => DEFAULT_MQTT_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ssid_means_no_credentials() {
        assert!(!WifiConfig::default().has_credentials());
        assert!(!WifiConfig {
            ssid: "   ".to_string(),
            pass: String::new(),
        }
        .has_credentials());
        assert!(WifiConfig {
            ssid: "garage".to_string(),
            pass: String::new(),
        }
        .has_credentials());
    }

    #[test]
    fn mqtt_ready_requires_enable_host_and_cmd_topic() {
        let mut cfg = MqttConfig {
            enabled: true,
            host: "broker.local".to_string(),
            cmd_topic: "relay/garage".to_string(),
            ..MqttConfig::default()
        };
        assert!(cfg.ready());

        cfg.enabled = false;
        assert!(!cfg.ready());

        cfg.enabled = true;
        cfg.host.clear();
        assert!(!cfg.ready());

        cfg.host = "broker.local".to_string();
        cfg.cmd_topic.clear();
        assert!(!cfg.ready());
    }

    #[test]
    fn out_of_range_port_falls_back_to_default() {
        assert_eq!(parse_port("99999"), DEFAULT_MQTT_PORT);
        assert_eq!(parse_port("0"), DEFAULT_MQTT_PORT);
        assert_eq!(parse_port("-1"), DEFAULT_MQTT_PORT);
        assert_eq!(parse_port("not-a-port"), DEFAULT_MQTT_PORT);
        assert_eq!(parse_port(""), DEFAULT_MQTT_PORT);
    }

    #[test]
    fn valid_port_is_kept() {
        assert_eq!(parse_port("1"), 1);
        assert_eq!(parse_port("8883"), 8883);
        assert_eq!(parse_port(" 65535 "), 65_535);
    }
}
