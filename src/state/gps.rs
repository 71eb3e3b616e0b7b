use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PartialUpdate;

/// Last known position, kept when the fix is lost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsStatus {
    pub fix: bool,
    /// satellites used in the solution
    pub satellites: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// meters
    pub altitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    /// degrees from true north
    pub heading: Option<f64>,
    /// receiver time of the fix
    pub timestamp: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpsUpdate {
    pub fix: Option<bool>,
    pub satellites: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: Option<String>,
}

impl PartialUpdate for GpsStatus {
    type Update = GpsUpdate;

    fn apply(&mut self, update: GpsUpdate) {
        if let Some(fix) = update.fix {
            self.fix = fix;
        }
        self.satellites = update.satellites.or(self.satellites);
        self.latitude = update.latitude.or(self.latitude);
        self.longitude = update.longitude.or(self.longitude);
        self.altitude = update.altitude.or(self.altitude);
        self.speed_kmh = update.speed_kmh.or(self.speed_kmh);
        self.heading = update.heading.or(self.heading);
        if update.timestamp.is_some() {
            self.timestamp = update.timestamp;
        }
        self.updated_at = Some(Utc::now());
    }
}
