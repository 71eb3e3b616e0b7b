use std::{error::Error, path::Path, time::Duration};

use sysinfo::{Components, Disks, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    bus::EventBus,
    state::{StateWriter, SystemStatus, SystemUpdate},
    SYSTEM_UPDATE,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Samples host metrics into the system state
pub async fn system_info_poller(
    cancel_token: CancellationToken,
    bus: EventBus,
    system: StateWriter<SystemStatus>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut sys = System::new();
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down system info poller");
                break Ok(());
            },
            _ = tick.tick() => {
                let snapshot = system.apply(sample(&mut sys));
                bus.publish_serialized(SYSTEM_UPDATE, &snapshot);
            }
        }
    }
}

fn sample(sys: &mut System) -> SystemUpdate {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let components = Components::new_with_refreshed_list();
    let cpu_temperature = cpu_temperature(
        components
            .list()
            .iter()
            .map(|c| (c.label(), c.temperature())),
    );

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"));

    SystemUpdate {
        cpu_usage: Some(sys.global_cpu_usage()),
        memory_used: Some(sys.used_memory()),
        memory_total: Some(sys.total_memory()),
        cpu_temperature,
        disk_used: root.map(|d| d.total_space().saturating_sub(d.available_space())),
        disk_total: root.map(|d| d.total_space()),
        uptime_secs: Some(System::uptime()),
    }
}

/// Prefer a sensor that looks like the SoC, fall back to the first reading
fn cpu_temperature<'a>(readings: impl Iterator<Item = (&'a str, Option<f32>)>) -> Option<f32> {
    let readings: Vec<(String, f32)> = readings
        .filter_map(|(label, temp)| Some((label.to_lowercase(), temp?)))
        .filter(|(_, temp)| temp.is_finite())
        .collect();
    readings
        .iter()
        .find(|(label, _)| label.contains("cpu") || label.contains("soc"))
        .or(readings.first())
        .map(|(_, temp)| *temp)
}
