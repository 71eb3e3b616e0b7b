use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{nullable, PartialUpdate};

/// Interface currently carrying traffic, ethernet always wins when connected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveInterface {
    Ethernet,
    Wifi,
    Modem,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    /// percent, as reported by NetworkManager
    pub signal_strength: Option<u8>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EthernetStatus {
    pub connected: bool,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub active_interface: ActiveInterface,
    pub wifi: WifiStatus,
    pub ethernet: EthernetStatus,
    pub modem_data_connected: bool,
    pub failover_active: bool,
    pub primary_ip: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            active_interface: ActiveInterface::None,
            wifi: WifiStatus::default(),
            ethernet: EthernetStatus::default(),
            modem_data_connected: false,
            failover_active: false,
            primary_ip: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiUpdate {
    pub connected: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub ssid: Option<Option<String>>,
    #[serde(deserialize_with = "nullable")]
    pub signal_strength: Option<Option<u8>>,
    #[serde(deserialize_with = "nullable")]
    pub ip: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EthernetUpdate {
    pub connected: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub ip: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkUpdate {
    pub active_interface: Option<ActiveInterface>,
    pub wifi: Option<WifiUpdate>,
    pub ethernet: Option<EthernetUpdate>,
    pub modem_data_connected: Option<bool>,
    pub failover_active: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub primary_ip: Option<Option<String>>,
}

impl From<WifiStatus> for WifiUpdate {
    fn from(status: WifiStatus) -> Self {
        Self {
            connected: Some(status.connected),
            ssid: Some(status.ssid),
            signal_strength: Some(status.signal_strength),
            ip: Some(status.ip),
        }
    }
}

impl From<EthernetStatus> for EthernetUpdate {
    fn from(status: EthernetStatus) -> Self {
        Self {
            connected: Some(status.connected),
            ip: Some(status.ip),
        }
    }
}

impl PartialUpdate for WifiStatus {
    type Update = WifiUpdate;

    fn apply(&mut self, update: WifiUpdate) {
        if let Some(connected) = update.connected {
            self.connected = connected;
        }
        if let Some(ssid) = update.ssid {
            self.ssid = ssid;
        }
        if let Some(signal_strength) = update.signal_strength {
            self.signal_strength = signal_strength;
        }
        if let Some(ip) = update.ip {
            self.ip = ip;
        }
    }
}

impl PartialUpdate for EthernetStatus {
    type Update = EthernetUpdate;

    fn apply(&mut self, update: EthernetUpdate) {
        if let Some(connected) = update.connected {
            self.connected = connected;
        }
        if let Some(ip) = update.ip {
            self.ip = ip;
        }
    }
}

impl PartialUpdate for NetworkStatus {
    type Update = NetworkUpdate;

    fn apply(&mut self, update: NetworkUpdate) {
        if let Some(wifi) = update.wifi {
            self.wifi.apply(wifi);
        }
        if let Some(ethernet) = update.ethernet {
            self.ethernet.apply(ethernet);
        }
        if let Some(active) = update.active_interface {
            self.active_interface = active;
        }
        if let Some(connected) = update.modem_data_connected {
            self.modem_data_connected = connected;
        }
        if let Some(failover) = update.failover_active {
            self.failover_active = failover;
        }
        if let Some(ip) = update.primary_ip {
            self.primary_ip = ip;
        }
        // ethernet has absolute priority, whatever the update said
        if self.ethernet.connected {
            self.active_interface = ActiveInterface::Ethernet;
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_leaves_absent_fields_alone() {
        let mut status = NetworkStatus::default();
        status.apply(NetworkUpdate {
            wifi: Some(WifiUpdate {
                connected: Some(true),
                ssid: Some(Some("garage".into())),
                ip: Some(Some("192.168.1.20".into())),
                ..Default::default()
            }),
            active_interface: Some(ActiveInterface::Wifi),
            ..Default::default()
        });
        status.apply(NetworkUpdate {
            wifi: Some(WifiUpdate {
                signal_strength: Some(Some(71)),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(status.wifi.ssid.as_deref(), Some("garage"));
        assert_eq!(status.wifi.signal_strength, Some(71));
        assert_eq!(status.active_interface, ActiveInterface::Wifi);
    }

    #[test]
    fn ethernet_overrides_active_interface() {
        let mut status = NetworkStatus::default();
        status.apply(NetworkUpdate {
            ethernet: Some(EthernetUpdate {
                connected: Some(true),
                ..Default::default()
            }),
            active_interface: Some(ActiveInterface::Wifi),
            ..Default::default()
        });
        assert_eq!(status.active_interface, ActiveInterface::Ethernet);
    }

    #[test]
    fn explicit_null_clears_and_unknown_fields_fail() {
        let mut status = NetworkStatus::default();
        status.primary_ip = Some("10.0.0.2".into());

        let update: NetworkUpdate = serde_json::from_str(r#"{"primary_ip": null}"#).unwrap();
        status.apply(update);
        assert_eq!(status.primary_ip, None);

        let untouched: NetworkUpdate = serde_json::from_str(r#"{}"#).unwrap();
        assert!(untouched.primary_ip.is_none());

        assert!(serde_json::from_str::<NetworkUpdate>(r#"{"ip": "10.0.0.2"}"#).is_err());
        assert!(serde_json::from_str::<WifiUpdate>(r#"{"bssid": "aa"}"#).is_err());
    }

    #[test]
    fn active_interface_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ActiveInterface::Ethernet).unwrap(),
            serde_json::json!("ethernet")
        );
    }
}
