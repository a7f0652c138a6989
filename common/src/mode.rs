use crate::config::WifiConfig;

/// The device's network personality, chosen exactly once at boot and never
/// mutated afterwards. Changing mode requires a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityMode {
    AccessPoint,
    Station,
}

impl ConnectivityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessPoint => "access-point",
            Self::Station => "station",
        }
    }
}

/// One-shot boot decision.
///
/// Missing credentials skip the association attempt entirely; otherwise the
/// caller-supplied closure runs the bounded station association and its
/// outcome commits the mode. There is no automatic reversion from
/// AccessPoint back to Station without an operator-triggered restart.
pub fn select_boot_mode(
    wifi: &WifiConfig,
    associate: impl FnOnce() -> bool,
) -> ConnectivityMode {
    if !wifi.has_credentials() {
        return ConnectivityMode::AccessPoint;
    }

    if associate() {
        ConnectivityMode::Station
    } else {
        ConnectivityMode::AccessPoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(ssid: &str) -> WifiConfig {
        WifiConfig {
            ssid: ssid.to_string(),
            pass: "hunter2".to_string(),
        }
    }

    #[test]
    fn empty_ssid_skips_association_entirely() {
        let mode = select_boot_mode(&WifiConfig::default(), || {
            panic!("association must not be attempted without credentials")
        });

        assert_eq!(mode, ConnectivityMode::AccessPoint);
    }

    #[test]
    fn successful_association_commits_station() {
        let mode = select_boot_mode(&credentials("garage"), || true);

        assert_eq!(mode, ConnectivityMode::Station);
    }

    #[test]
    fn association_timeout_falls_back_to_access_point() {
        let mode = select_boot_mode(&credentials("garage"), || false);

        assert_eq!(mode, ConnectivityMode::AccessPoint);
    }
}
