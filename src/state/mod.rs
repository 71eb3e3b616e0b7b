//! Per-domain state holders.
//!
//! Each state has exactly one writer (the poller that owns the
//! [`StateWriter`]) and any number of readers taking snapshots.  Writers
//! change state through a typed partial update, every field of which is
//! optional; absent fields are left untouched.

use serde::{Deserialize, Deserializer};
use tokio::sync::watch;

pub mod gps;
pub mod modem;
pub mod network;
pub mod system;

pub use gps::{GpsStatus, GpsUpdate};
pub use modem::{ModemStatus, ModemUpdate, SignalQuality};
pub use network::{
    ActiveInterface, EthernetStatus, EthernetUpdate, NetworkStatus, NetworkUpdate, WifiStatus,
    WifiUpdate,
};
pub use system::{SystemStatus, SystemUpdate};

/// A state that can absorb a partial update
pub trait PartialUpdate {
    type Update;

    fn apply(&mut self, update: Self::Update);
}

/// The single writing end of a state cell
pub struct StateWriter<T> {
    tx: watch::Sender<T>,
}

/// A read-only view of a state cell, readers only ever see whole snapshots
#[derive(Clone)]
pub struct StateReader<T> {
    rx: watch::Receiver<T>,
}

/// Create a state cell holding `initial`
pub fn state_cell<T>(initial: T) -> (StateWriter<T>, StateReader<T>) {
    let (tx, rx) = watch::channel(initial);
    (StateWriter { tx }, StateReader { rx })
}

impl<T: Clone> StateWriter<T> {
    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: PartialUpdate + Clone> StateWriter<T> {
    /// Merge `update` and return the resulting snapshot
    pub fn apply(&self, update: T::Update) -> T {
        self.tx.send_modify(|state| state.apply(update));
        self.snapshot()
    }
}

impl<T: Clone> StateReader<T> {
    pub fn snapshot(&self) -> T {
        self.rx.borrow().clone()
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`)
pub(crate) fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Handles to every state cell, the reading side is what consumers get
#[derive(Clone)]
pub struct StateReaders {
    pub network: StateReader<NetworkStatus>,
    pub modem: StateReader<ModemStatus>,
    pub gps: StateReader<GpsStatus>,
    pub system: StateReader<SystemStatus>,
}

/// Writing ends, handed out one per poller at startup
pub struct StateWriters {
    pub network: StateWriter<NetworkStatus>,
    pub modem: StateWriter<ModemStatus>,
    pub gps: StateWriter<GpsStatus>,
    pub system: StateWriter<SystemStatus>,
}

/// Build every state cell with its default contents
pub fn build_states() -> (StateWriters, StateReaders) {
    let (network_w, network_r) = state_cell(NetworkStatus::default());
    let (modem_w, modem_r) = state_cell(ModemStatus::default());
    let (gps_w, gps_r) = state_cell(GpsStatus::default());
    let (system_w, system_r) = state_cell(SystemStatus::default());
    (
        StateWriters {
            network: network_w,
            modem: modem_w,
            gps: gps_w,
            system: system_w,
        },
        StateReaders {
            network: network_r,
            modem: modem_r,
            gps: gps_r,
            system: system_r,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_writer_updates() {
        let (writer, reader) = state_cell(GpsStatus::default());
        let other = reader.clone();

        let merged = writer.apply(GpsUpdate {
            fix: Some(true),
            latitude: Some(51.5),
            ..Default::default()
        });
        writer.apply(GpsUpdate {
            satellites: Some(7),
            ..Default::default()
        });

        assert!(merged.fix);
        assert_eq!(reader.snapshot().latitude, Some(51.5));
        assert_eq!(other.snapshot().satellites, Some(7));
        assert!(other.snapshot().fix);
    }
}
