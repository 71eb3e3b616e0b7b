use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PartialUpdate;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// percent across all cores
    pub cpu_usage: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    /// celsius
    pub cpu_temperature: Option<f32>,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemUpdate {
    pub cpu_usage: Option<f32>,
    pub memory_used: Option<u64>,
    pub memory_total: Option<u64>,
    pub cpu_temperature: Option<f32>,
    pub disk_used: Option<u64>,
    pub disk_total: Option<u64>,
    pub uptime_secs: Option<u64>,
}

impl PartialUpdate for SystemStatus {
    type Update = SystemUpdate;

    fn apply(&mut self, update: SystemUpdate) {
        self.cpu_usage = update.cpu_usage.unwrap_or(self.cpu_usage);
        self.memory_used = update.memory_used.unwrap_or(self.memory_used);
        self.memory_total = update.memory_total.unwrap_or(self.memory_total);
        self.cpu_temperature = update.cpu_temperature.or(self.cpu_temperature);
        self.disk_used = update.disk_used.unwrap_or(self.disk_used);
        self.disk_total = update.disk_total.unwrap_or(self.disk_total);
        self.uptime_secs = update.uptime_secs.unwrap_or(self.uptime_secs);
        self.updated_at = Some(Utc::now());
    }
}
