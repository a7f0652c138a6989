use core::fmt::Write as _;

/// Factory-assigned 6-byte hardware address.
pub type MacAddress = [u8; 6];

/// Stable device naming derived once at boot from the hardware address.
///
/// `short_id` is the last 3 MAC bytes in uppercase hex (`AB12CD`); every
/// other name embeds it. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: MacAddress,
    pub device_id: String,
    pub short_id: String,
    pub mdns_host: String,
    pub mdns_fqdn: String,
}

impl DeviceIdentity {
    pub fn from_mac(mac: MacAddress) -> Self {
        let mut short_id = String::with_capacity(6);
        let _ = write!(short_id, "{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]);

        let device_id = format!("esp32-{short_id}");
        let mdns_host = format!("relaynode-{short_id}");
        let mdns_fqdn = format!("{mdns_host}.local");

        Self {
            mac,
            device_id,
            short_id,
            mdns_host,
            mdns_fqdn,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Broker client id: hostname plus the low MAC word, so devices sharing
    /// a firmware image never collide on the broker.
    pub fn mqtt_client_id(&self) -> String {
        let low = u32::from_be_bytes([self.mac[2], self.mac[3], self.mac[4], self.mac[5]]);
        format!("{}-{:x}", self.mdns_host, low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn names_derive_from_mac_tail() {
        let identity = DeviceIdentity::from_mac([0x00, 0x11, 0x22, 0xAB, 0x12, 0xCD]);

        assert_eq!(identity.short_id, "AB12CD");
        assert_eq!(identity.device_id, "esp32-AB12CD");
        assert_eq!(identity.mdns_host, "relaynode-AB12CD");
        assert_eq!(identity.mdns_fqdn, "relaynode-AB12CD.local");
    }

    #[test]
    fn client_id_embeds_low_mac_word() {
        let identity = DeviceIdentity::from_mac([0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]);

        assert_eq!(identity.mqtt_client_id(), "relaynode-EFCAFE-beefcafe");
    }

    #[test]
    fn identical_macs_yield_identical_identity() {
        let mac = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
        assert_eq!(DeviceIdentity::from_mac(mac), DeviceIdentity::from_mac(mac));
    }
}
