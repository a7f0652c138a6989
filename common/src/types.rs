use serde::Serialize;

use crate::config::MqttConfig;

/// `GET /api/status` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub ok: bool,
    pub ip: String,
    pub mdns: String,
    pub relay: bool,
    /// Closed contact reads as "pressed".
    pub input_pressed: bool,
    pub mqtt_enabled: bool,
    pub mqtt_connected: bool,
    pub cmd_topic: String,
}

/// `GET /api/mqtt` response body. The stored password is never echoed
/// back, only whether one is set.
#[derive(Debug, Clone, Serialize)]
pub struct MqttConfigView {
    pub ok: bool,
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass_set: bool,
    #[serde(rename = "cmdTopic")]
    pub cmd_topic: String,
    #[serde(rename = "stateTopic")]
    pub state_topic: String,
}

impl MqttConfigView {
    pub fn from_config(cfg: &MqttConfig) -> Self {
        Self {
            ok: true,
            enabled: cfg.enabled,
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            pass_set: !cfg.pass.is_empty(),
            cmd_topic: cfg.cmd_topic.clone(),
            state_topic: cfg.state_topic.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mqtt_view_redacts_password_to_flag() {
        let cfg = MqttConfig {
            enabled: true,
            host: "broker.local".to_string(),
            user: "relay".to_string(),
            pass: "secret".to_string(),
            cmd_topic: "relay/garage".to_string(),
            ..MqttConfig::default()
        };

        let view = MqttConfigView::from_config(&cfg);
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["pass_set"], true);
        assert!(json.get("pass").is_none());
        assert_eq!(json["cmdTopic"], "relay/garage");
        assert_eq!(json["stateTopic"], "");
    }

    #[test]
    fn status_payload_wire_names() {
        let status = StatusPayload {
            ok: true,
            ip: "192.168.1.50".to_string(),
            mdns: "relaynode-AB12CD.local".to_string(),
            relay: true,
            input_pressed: false,
            mqtt_enabled: true,
            mqtt_connected: false,
            cmd_topic: "relay/garage".to_string(),
        };

        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["mdns"], "relaynode-AB12CD.local");
        assert_eq!(json["input_pressed"], false);
        assert_eq!(json["mqtt_connected"], false);
        assert_eq!(json["cmd_topic"], "relay/garage");
    }
}
