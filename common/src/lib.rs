pub mod config;
pub mod debounce;
pub mod dns;
pub mod identity;
pub mod mode;
pub mod relay;
pub mod topics;
pub mod types;

pub use config::{parse_port, MqttConfig, WifiConfig, DEFAULT_MQTT_PORT};
pub use debounce::{DebouncedInput, InputEdge, DEBOUNCE_MS};
pub use identity::{DeviceIdentity, MacAddress};
pub use mode::{select_boot_mode, ConnectivityMode};
pub use relay::{RelayArbiter, RelaySource};
pub use topics::{input_payload, parse_command, parse_relay_form, relay_payload, MqttTopics};
pub use types::{MqttConfigView, StatusPayload};
