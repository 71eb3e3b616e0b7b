use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{nullable, PartialUpdate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    /// dBm
    pub rssi: Option<i32>,
    pub rsrp: Option<i32>,
    pub rsrq: Option<i32>,
    pub sinr: Option<i32>,
}

/// Cellular modem identity, registration and signal as last polled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModemStatus {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub imei: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub operator: Option<String>,
    pub registration: Option<String>,
    /// 2G / 3G / 4G / 5G
    pub network_mode: Option<String>,
    pub band: Option<String>,
    pub signal: SignalQuality,
    pub at_port: Option<String>,
    /// AT channel answers
    pub connected: bool,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Identity fields are set-only; `error` can be cleared with an explicit null
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModemUpdate {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub imei: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub operator: Option<String>,
    pub registration: Option<String>,
    pub network_mode: Option<String>,
    pub band: Option<String>,
    pub signal: Option<SignalQuality>,
    pub at_port: Option<String>,
    pub connected: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub error: Option<Option<String>>,
}

impl PartialUpdate for ModemStatus {
    type Update = ModemUpdate;

    fn apply(&mut self, update: ModemUpdate) {
        fn set(field: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *field = value;
            }
        }

        set(&mut self.brand, update.brand);
        set(&mut self.model, update.model);
        set(&mut self.imei, update.imei);
        set(&mut self.iccid, update.iccid);
        set(&mut self.imsi, update.imsi);
        set(&mut self.operator, update.operator);
        set(&mut self.registration, update.registration);
        set(&mut self.network_mode, update.network_mode);
        set(&mut self.band, update.band);
        set(&mut self.at_port, update.at_port);
        if let Some(signal) = update.signal {
            self.signal = signal;
        }
        if let Some(connected) = update.connected {
            self.connected = connected;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        self.updated_at = Some(Utc::now());
    }
}
