use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{bus::EventBus, CONFIG_CHANGED};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ada_pi/config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Runtime settings persisted as JSON, sections other components care about.
/// Unknown sections in the file are ignored so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_id: String,
    pub jwt_secret: Option<String>,
    pub network: NetworkSettings,
    pub modem: ModemSettings,
    pub cloud: CloudSettings,
    pub ota: OtaSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: "ADA-PI-UNKNOWN".to_string(),
            jwt_secret: None,
            network: NetworkSettings::default(),
            modem: ModemSettings::default(),
            cloud: CloudSettings::default(),
            ota: OtaSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub failover_enabled: bool,
    /// consecutive failed checks before cellular is requested
    pub failure_threshold: u32,
    /// minimum gap between two modem connect requests
    pub retry_delay_secs: u64,
    pub status_interval_secs: u64,
    pub failover_interval_secs: u64,
    pub probe_targets: Vec<String>,
    pub probe_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            failure_threshold: 2,
            retry_delay_secs: 60,
            status_interval_secs: 3,
            failover_interval_secs: 30,
            probe_targets: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            probe_timeout_secs: 2,
        }
    }
}

impl NetworkSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemSettings {
    /// AT port, autodetected over /dev/ttyUSB0..9 when unset
    pub port: Option<String>,
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// only sent along with a username
    pub auth: ModemAuth,
    /// network interface the data session comes up on
    pub data_interface: String,
    pub connect_timeout_secs: u64,
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self {
            port: None,
            apn: None,
            username: None,
            password: None,
            auth: ModemAuth::Pap,
            data_interface: "wwan0".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl ModemSettings {
    /// APN if one is configured and not blank
    pub fn apn(&self) -> Option<&str> {
        self.apn.as_deref().map(str::trim).filter(|apn| !apn.is_empty())
    }
}

/// PDP context authentication, as numbered by AT+CGAUTH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemAuth {
    Pap,
    Chap,
}

impl ModemAuth {
    pub fn code(self) -> u8 {
        match self {
            ModemAuth::Pap => 1,
            ModemAuth::Chap => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub upload_url: String,
    pub logs_url: String,
    pub interval_secs: u64,
    pub log_interval_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            upload_url: String::new(),
            logs_url: String::new(),
            interval_secs: 15,
            log_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaSettings {
    pub chunk_size: usize,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
        }
    }
}

/// File-backed settings with a cached copy, shared by every component that reads config
pub struct ConfigStore {
    path: PathBuf,
    bus: EventBus,
    cached: RwLock<Settings>,
}

impl ConfigStore {
    /// Load `path` (writing defaults if it does not exist yet)
    pub fn open(path: impl Into<PathBuf>, bus: EventBus) -> Arc<Self> {
        let path = path.into();
        let settings = load(&path);
        Arc::new(Self {
            path,
            bus,
            cached: RwLock::new(settings),
        })
    }

    /// Store that never touches disk
    pub fn in_memory(settings: Settings, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::new(),
            bus,
            cached: RwLock::new(settings),
        })
    }

    /// Current settings
    pub fn load(&self) -> Settings {
        self.cached.read().clone()
    }

    /// Persist `settings` and tell everyone to re-read their section
    pub fn save(&self, settings: Settings) -> Result<(), ConfigError> {
        if !self.path.as_os_str().is_empty() {
            write(&self.path, &settings)?;
        }
        *self.cached.write() = settings;
        info!("Configuration saved");
        self.bus.publish(CONFIG_CHANGED, json!({}));
        Ok(())
    }

    /// Re-read the file, for edits made outside the daemon
    pub fn reload(&self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        *self.cached.write() = load(&self.path);
        info!("Configuration reloaded");
        self.bus.publish(CONFIG_CHANGED, json!({}));
    }
}

fn load(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(settings) => {
                info!("Loaded configuration from {:?}", path);
                settings
            }
            Err(err) => {
                warn!("Invalid config {:?}, using defaults: {}", path, err);
                Settings::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let settings = Settings::default();
            if let Err(err) = write(path, &settings) {
                warn!("Could not write default config: {}", err);
            }
            settings
        }
        Err(err) => {
            warn!("Could not read config {:?}, using defaults: {}", path, err);
            Settings::default()
        }
    }
}

fn write(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    fs::write(path, content).map_err(io_err)
}
