use crate::config::MqttConfig;

/// Topics in use for the current MQTT settings.
///
/// Recomputed immediately whenever the settings are rewritten, so a
/// reconnect after a config change never publishes to stale topics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqttTopics {
    /// Subscribed for relay commands.
    pub cmd: String,
    /// Retained relay state, `"ON"`/`"OFF"`.
    pub state: String,
    /// Retained debounced input state, `"ON"`/`"OFF"`.
    pub din: String,
}

impl MqttTopics {
    pub fn derive(cfg: &MqttConfig) -> Self {
        let state = if cfg.state_topic.is_empty() {
            format!("{}/state", cfg.cmd_topic)
        } else {
            cfg.state_topic.clone()
        };

        Self {
            cmd: cfg.cmd_topic.clone(),
            state,
            din: format!("{}/din", cfg.cmd_topic),
        }
    }
}

pub fn relay_payload(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Input publish convention: an open contact publishes OFF.
pub fn input_payload(open: bool) -> &'static str {
    if open {
        "OFF"
    } else {
        "ON"
    }
}

/// Command payloads outside the fixed token set are ignored, not errored.
pub fn parse_command(payload: &str) -> Option<bool> {
    let msg = payload.trim();
    if msg.eq_ignore_ascii_case("on") || msg == "1" || msg.eq_ignore_ascii_case("true") {
        Some(true)
    } else if msg.eq_ignore_ascii_case("off") || msg == "0" || msg.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// HTTP form interpretation: only the truthy tokens switch the relay on,
/// anything else is a request for off.
pub fn parse_relay_form(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("on") || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cfg(cmd: &str, state: &str) -> MqttConfig {
        MqttConfig {
            enabled: true,
            host: "broker.local".to_string(),
            cmd_topic: cmd.to_string(),
            state_topic: state.to_string(),
            ..MqttConfig::default()
        }
    }

    #[test]
    fn state_topic_defaults_to_cmd_suffix() {
        let topics = MqttTopics::derive(&cfg("relay/garage", ""));

        assert_eq!(topics.cmd, "relay/garage");
        assert_eq!(topics.state, "relay/garage/state");
        assert_eq!(topics.din, "relay/garage/din");
    }

    #[test]
    fn explicit_state_topic_is_honored() {
        let topics = MqttTopics::derive(&cfg("relay/garage", "home/garage/relay"));

        assert_eq!(topics.state, "home/garage/relay");
        assert_eq!(topics.din, "relay/garage/din");
    }

    #[test]
    fn rederiving_after_rewrite_uses_fresh_cmd_topic() {
        let old = MqttTopics::derive(&cfg("relay/old", ""));
        let new = MqttTopics::derive(&cfg("relay/new", ""));

        assert_eq!(old.state, "relay/old/state");
        assert_eq!(new.state, "relay/new/state");
        assert_eq!(new.din, "relay/new/din");
    }

    #[test]
    fn command_tokens_are_case_insensitive() {
        assert_eq!(parse_command("ON"), Some(true));
        assert_eq!(parse_command("on"), Some(true));
        assert_eq!(parse_command(" 1 "), Some(true));
        assert_eq!(parse_command("True"), Some(true));
        assert_eq!(parse_command("OFF"), Some(false));
        assert_eq!(parse_command("0"), Some(false));
        assert_eq!(parse_command("false"), Some(false));
    }

    #[test]
    fn unrecognized_commands_are_ignored() {
        assert_eq!(parse_command("toggle"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("2"), None);
        assert_eq!(parse_command("{\"state\":true}"), None);
    }

    #[test]
    fn relay_form_treats_unknown_values_as_off() {
        assert!(parse_relay_form("1"));
        assert!(parse_relay_form("ON"));
        assert!(parse_relay_form("true"));
        assert!(!parse_relay_form("0"));
        assert!(!parse_relay_form("off"));
        assert!(!parse_relay_form("banana"));
    }

    #[test]
    fn payload_conventions() {
        assert_eq!(relay_payload(true), "ON");
        assert_eq!(relay_payload(false), "OFF");
        // Open contact publishes OFF, inverted from the raw level.
        assert_eq!(input_payload(true), "OFF");
        assert_eq!(input_payload(false), "ON");
    }
}
