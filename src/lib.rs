pub mod bus;
pub mod config;
pub mod state;

// WORKERS
pub mod cloud_sync;
pub mod connectivity;
pub mod gps;
pub mod modem;
pub mod ota;
pub mod system_info;

pub mod auth;
pub mod relay;

// BUS TOPICS

/// Network state snapshot after every status poll
pub const NETWORK_UPDATE: &str = "network_update";
/// Ask the modem data controller to bring up cellular data
pub const MODEM_CONNECT_REQUEST: &str = "modem_connect_request";
/// Ask the modem data controller to drop cellular data
pub const MODEM_DISCONNECT_REQUEST: &str = "modem_disconnect_request";
/// Outcome of a connect or disconnect, `{connected, ip?, interface?}`
pub const MODEM_DATA_CONNECTED: &str = "modem_data_connected";
pub const MODEM_UPDATE: &str = "modem_update";
pub const OTA_STATUS: &str = "ota_status";
/// Config file saved, re-read your section
pub const CONFIG_CHANGED: &str = "config_changed";
pub const GPS_UPDATE: &str = "gps_update";
pub const SYSTEM_UPDATE: &str = "system_update";
pub const CLOUD_UPLOAD: &str = "cloud_upload";
/// Server command for the OBD poller, `{action}`
pub const OBD_COMMAND: &str = "obd_command";
