use std::{error::Error, io, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tokio::{
    process::Command,
    time::{interval, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    bus::EventBus,
    config::{ConfigStore, NetworkSettings},
    modem::data::DataConnectedEvent,
    state::{
        ActiveInterface, EthernetStatus, NetworkStatus, NetworkUpdate, StateWriter, WifiStatus,
    },
    CONFIG_CHANGED, MODEM_CONNECT_REQUEST, MODEM_DATA_CONNECTED, MODEM_DISCONNECT_REQUEST,
    NETWORK_UPDATE,
};

/// Where the failover state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    PrimaryOk,
    PrimaryDegraded { consecutive_failures: u32 },
    FailoverActive,
}

/// Intent the monitor emits on the bus, it never touches the modem itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    RequestModemConnect,
    RequestModemDisconnect,
}

impl FailoverAction {
    pub fn topic(self) -> &'static str {
        match self {
            FailoverAction::RequestModemConnect => MODEM_CONNECT_REQUEST,
            FailoverAction::RequestModemDisconnect => MODEM_DISCONNECT_REQUEST,
        }
    }
}

/// Hysteresis and throttling for cellular failover.
///
/// Fed one verdict per failover check.  Cellular is requested once the primary
/// path has failed `threshold` checks in a row, and never more often than
/// once per `retry_delay`.  When the primary path comes back after failover,
/// a single disconnect is requested.
#[derive(Debug)]
pub struct FailoverController {
    state: FailoverState,
    failures: u32,
    threshold: u32,
    retry_delay: Duration,
    enabled: bool,
    last_attempt: Option<Instant>,
    modem_connected: bool,
    disconnect_sent: bool,
}

impl FailoverController {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            state: FailoverState::PrimaryOk,
            failures: 0,
            threshold: settings.failure_threshold.max(1),
            retry_delay: settings.retry_delay(),
            enabled: settings.failover_enabled,
            last_attempt: None,
            modem_connected: false,
            disconnect_sent: false,
        }
    }

    pub fn reconfigure(&mut self, settings: &NetworkSettings) {
        self.threshold = settings.failure_threshold.max(1);
        self.retry_delay = settings.retry_delay();
        self.enabled = settings.failover_enabled;
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Record what the modem data controller last said about its session
    pub fn modem_reported(&mut self, connected: bool) {
        self.modem_connected = connected;
        if connected {
            self.disconnect_sent = false;
            if self.failures > 0 {
                self.state = FailoverState::FailoverActive;
            }
        }
    }

    /// Feed one primary-path verdict taken at `now`
    pub fn evaluate(&mut self, primary_ok: bool, now: Instant) -> Option<FailoverAction> {
        if primary_ok {
            let was_failed_over =
                self.state == FailoverState::FailoverActive || self.modem_connected;
            self.failures = 0;
            self.state = FailoverState::PrimaryOk;
            if was_failed_over && !self.disconnect_sent {
                self.disconnect_sent = true;
                return Some(FailoverAction::RequestModemDisconnect);
            }
            return None;
        }

        self.failures = self.failures.saturating_add(1);
        if self.state != FailoverState::FailoverActive {
            self.state = FailoverState::PrimaryDegraded {
                consecutive_failures: self.failures,
            };
        }

        if !self.enabled || self.modem_connected || self.failures < self.threshold {
            return None;
        }

        let throttled = self
            .last_attempt
            .is_some_and(|last| now.duration_since(last) < self.retry_delay);
        if throttled {
            return None;
        }

        self.last_attempt = Some(now);
        self.disconnect_sent = false;
        self.state = FailoverState::FailoverActive;
        Some(FailoverAction::RequestModemConnect)
    }
}

/// Link state of the primary interfaces
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkState {
    pub wifi: WifiStatus,
    pub ethernet: EthernetStatus,
}

impl LinkState {
    pub fn any_connected(&self) -> bool {
        self.wifi.connected || self.ethernet.connected
    }
}

/// How the monitor learns about the primary network
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn links(&self) -> io::Result<LinkState>;

    /// True if any of `targets` answers within `timeout`
    async fn reachable(&self, targets: &[String], timeout: Duration) -> bool;
}

/// NetworkManager via `nmcli`, addresses via `ip`, reachability via `ping`
pub struct NmcliProbe;

#[async_trait]
impl LinkProbe for NmcliProbe {
    async fn links(&self) -> io::Result<LinkState> {
        let output = Command::new("nmcli")
            .args(["-t", "-f", "DEVICE,TYPE,STATE,CONNECTION", "device", "status"])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "nmcli exited with {}",
                output.status
            )));
        }

        let mut links = LinkState::default();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some(device) = parse_device_line(line) else {
                continue;
            };
            if !device.connected {
                continue;
            }
            match device.kind {
                "ethernet" if !links.ethernet.connected => {
                    links.ethernet = EthernetStatus {
                        connected: true,
                        ip: interface_ipv4(device.name).await,
                    };
                }
                "wifi" if !links.wifi.connected => {
                    links.wifi = WifiStatus {
                        connected: true,
                        ssid: Some(device.connection.to_string()),
                        signal_strength: wifi_signal().await,
                        ip: interface_ipv4(device.name).await,
                    };
                }
                _ => {}
            }
        }
        Ok(links)
    }

    async fn reachable(&self, targets: &[String], timeout: Duration) -> bool {
        let wait = timeout.as_secs().max(1).to_string();
        for target in targets {
            let status = Command::new("ping")
                .args(["-c", "1", "-W", &wait, target])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => return true,
                Ok(_) => trace!("{} did not answer", target),
                Err(err) => warn!("Could not run ping: {}", err),
            }
        }
        false
    }
}

struct DeviceLine<'a> {
    name: &'a str,
    kind: &'a str,
    connected: bool,
    connection: &'a str,
}

fn parse_device_line(line: &str) -> Option<DeviceLine<'_>> {
    let mut fields = line.splitn(4, ':');
    let name = fields.next()?;
    let kind = fields.next()?;
    let state = fields.next()?;
    let connection = fields.next().unwrap_or_default();
    Some(DeviceLine {
        name,
        kind,
        // "connected (externally)" counts too
        connected: state.starts_with("connected"),
        connection,
    })
}

async fn wifi_signal() -> Option<u8> {
    let output = Command::new("nmcli")
        .args(["-t", "-f", "IN-USE,SIGNAL", "device", "wifi", "list", "--rescan", "no"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix("*:")?.trim().parse().ok())
}

/// First IPv4 address on `device`, if it has one
pub async fn interface_ipv4(device: &str) -> Option<String> {
    let output = Command::new("ip")
        .args(["-4", "-o", "addr", "show", "dev", device])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    parse_ipv4(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ipv4(ip_output: &str) -> Option<String> {
    let re = Regex::new(r"inet (\d{1,3}(?:\.\d{1,3}){3})").ok()?;
    re.captures(ip_output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Cellular session as last reported on the bus
#[derive(Debug, Default)]
struct CellularLink {
    connected: bool,
    ip: Option<String>,
}

/// Pick the interface carrying traffic and its address, ethernet > wifi > modem
pub fn derive_active(
    links: &LinkState,
    modem_connected: bool,
    modem_ip: Option<&str>,
) -> (ActiveInterface, Option<String>) {
    if links.ethernet.connected {
        (ActiveInterface::Ethernet, links.ethernet.ip.clone())
    } else if links.wifi.connected {
        (ActiveInterface::Wifi, links.wifi.ip.clone())
    } else if modem_connected {
        (ActiveInterface::Modem, modem_ip.map(str::to_string))
    } else {
        (ActiveInterface::None, None)
    }
}

fn ticker(secs: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Keeps the network state current and drives cellular failover.
/// Takes in the single writer of the network state.
pub async fn connectivity_monitor(
    cancel_token: CancellationToken,
    bus: EventBus,
    config: Arc<ConfigStore>,
    probe: Arc<dyn LinkProbe>,
    network: StateWriter<NetworkStatus>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut settings = config.load().network;
    let mut controller = FailoverController::new(&settings);
    let mut status_tick = ticker(settings.status_interval_secs);
    let mut failover_tick = ticker(settings.failover_interval_secs);
    let mut modem_events = bus.subscribe_channel(MODEM_DATA_CONNECTED);
    let mut config_events = bus.subscribe_channel(CONFIG_CHANGED);
    let mut cellular = CellularLink::default();
    let mut links = LinkState::default();

    info!("Connectivity monitor started");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down connectivity monitor");
                break Ok(());
            },
            _ = status_tick.tick() => {
                match probe.links().await {
                    Ok(current) => {
                        links = current;
                        publish_status(&bus, &network, &links, &cellular);
                    }
                    Err(err) => warn!("Could not read link state: {}", err),
                }
            },
            _ = failover_tick.tick() => {
                let primary_ok = match probe.links().await {
                    Ok(current) => {
                        links = current;
                        links.any_connected()
                            && probe
                                .reachable(&settings.probe_targets, Duration::from_secs(settings.probe_timeout_secs))
                                .await
                    }
                    Err(err) => {
                        warn!("Could not read link state: {}", err);
                        false
                    }
                };
                if !primary_ok {
                    debug!("Primary network check failed ({} in a row)", controller.consecutive_failures() + 1);
                }
                if let Some(action) = controller.evaluate(primary_ok, Instant::now()) {
                    info!("Failover: {:?}", action);
                    bus.publish(action.topic(), json!({}));
                }
            },
            Some(event) = modem_events.recv() => {
                let report: DataConnectedEvent = match serde_json::from_value(event.payload) {
                    Ok(report) => report,
                    Err(err) => {
                        warn!("Unreadable {} payload: {}", MODEM_DATA_CONNECTED, err);
                        continue;
                    }
                };
                controller.modem_reported(report.connected);
                cellular = CellularLink {
                    connected: report.connected,
                    ip: report.ip,
                };
                publish_status(&bus, &network, &links, &cellular);
            },
            Some(_) = config_events.recv() => {
                let fresh = config.load().network;
                if fresh.status_interval_secs != settings.status_interval_secs {
                    status_tick = ticker(fresh.status_interval_secs);
                }
                if fresh.failover_interval_secs != settings.failover_interval_secs {
                    failover_tick = ticker(fresh.failover_interval_secs);
                }
                controller.reconfigure(&fresh);
                settings = fresh;
                info!("Connectivity monitor reloaded configuration");
            },
        }
    }
}

fn publish_status(
    bus: &EventBus,
    network: &StateWriter<NetworkStatus>,
    links: &LinkState,
    cellular: &CellularLink,
) {
    let (active, primary_ip) = derive_active(links, cellular.connected, cellular.ip.as_deref());
    let snapshot = network.apply(NetworkUpdate {
        active_interface: Some(active),
        wifi: Some(links.wifi.clone().into()),
        ethernet: Some(links.ethernet.clone().into()),
        modem_data_connected: Some(cellular.connected),
        failover_active: Some(cellular.connected),
        primary_ip: Some(primary_ip),
    });
    bus.publish_serialized(NETWORK_UPDATE, &snapshot);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{bus::Event, config::Settings, state::state_cell};

    fn controller() -> FailoverController {
        FailoverController::new(&NetworkSettings::default())
    }

    #[test]
    fn single_failure_does_not_request_modem() {
        let mut ctl = controller();
        let now = Instant::now();

        assert_eq!(ctl.evaluate(false, now), None);
        assert_eq!(
            ctl.state(),
            FailoverState::PrimaryDegraded {
                consecutive_failures: 1
            }
        );
        assert_eq!(ctl.evaluate(true, now), None);
        assert_eq!(ctl.evaluate(false, now), None);
    }

    #[test]
    fn second_failure_requests_once_then_throttles() {
        let mut ctl = controller();
        let start = Instant::now();

        assert_eq!(ctl.evaluate(false, start), None);
        assert_eq!(
            ctl.evaluate(false, start + Duration::from_secs(30)),
            Some(FailoverAction::RequestModemConnect)
        );
        assert_eq!(ctl.state(), FailoverState::FailoverActive);
        assert_eq!(ctl.evaluate(false, start + Duration::from_secs(60)), None);
        assert_eq!(ctl.evaluate(false, start + Duration::from_secs(89)), None);
        assert_eq!(
            ctl.evaluate(false, start + Duration::from_secs(90)),
            Some(FailoverAction::RequestModemConnect)
        );
        assert_eq!(ctl.consecutive_failures(), 5);
    }

    #[test]
    fn connected_modem_is_not_requested_again() {
        let mut ctl = controller();
        let start = Instant::now();
        ctl.evaluate(false, start);
        ctl.evaluate(false, start);
        ctl.modem_reported(true);

        assert_eq!(ctl.evaluate(false, start + Duration::from_secs(600)), None);
        assert_eq!(ctl.state(), FailoverState::FailoverActive);
    }

    #[test]
    fn recovery_disconnects_exactly_once() {
        let mut ctl = controller();
        let start = Instant::now();
        ctl.evaluate(false, start);
        ctl.evaluate(false, start);
        ctl.modem_reported(true);

        assert_eq!(
            ctl.evaluate(true, start + Duration::from_secs(30)),
            Some(FailoverAction::RequestModemDisconnect)
        );
        assert_eq!(ctl.consecutive_failures(), 0);
        assert_eq!(ctl.state(), FailoverState::PrimaryOk);
        assert_eq!(ctl.evaluate(true, start + Duration::from_secs(60)), None);
    }

    #[test]
    fn disabled_failover_never_requests() {
        let mut ctl = FailoverController::new(&NetworkSettings {
            failover_enabled: false,
            ..Default::default()
        });
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(ctl.evaluate(false, now), None);
        }
    }

    #[test]
    fn active_interface_priority() {
        let mut links = LinkState {
            wifi: WifiStatus {
                connected: true,
                ip: Some("192.168.4.2".into()),
                ..Default::default()
            },
            ethernet: EthernetStatus {
                connected: true,
                ip: Some("10.0.0.9".into()),
            },
        };
        assert_eq!(
            derive_active(&links, true, Some("100.64.0.1")),
            (ActiveInterface::Ethernet, Some("10.0.0.9".into()))
        );
        links.ethernet.connected = false;
        assert_eq!(
            derive_active(&links, true, Some("100.64.0.1")),
            (ActiveInterface::Wifi, Some("192.168.4.2".into()))
        );
        links.wifi.connected = false;
        assert_eq!(
            derive_active(&links, true, Some("100.64.0.1")),
            (ActiveInterface::Modem, Some("100.64.0.1".into()))
        );
        assert_eq!(derive_active(&links, false, None), (ActiveInterface::None, None));
    }

    #[test]
    fn parses_nmcli_and_ip_output() {
        let device = parse_device_line("wlan0:wifi:connected:Garage Net").unwrap();
        assert_eq!(device.name, "wlan0");
        assert_eq!(device.kind, "wifi");
        assert!(device.connected);
        assert_eq!(device.connection, "Garage Net");
        assert!(!parse_device_line("eth0:ethernet:unavailable:").unwrap().connected);

        let ip = "3: wwan0    inet 100.72.14.3/30 brd 100.72.14.3 scope global wwan0\\       valid_lft forever";
        assert_eq!(parse_ipv4(ip), Some("100.72.14.3".into()));
        assert_eq!(parse_ipv4(""), None);
    }

    struct FakeProbe {
        up: AtomicBool,
    }

    #[async_trait]
    impl LinkProbe for FakeProbe {
        async fn links(&self) -> io::Result<LinkState> {
            Ok(LinkState {
                wifi: WifiStatus {
                    connected: true,
                    ssid: Some("depot".into()),
                    ..Default::default()
                },
                ethernet: EthernetStatus::default(),
            })
        }

        async fn reachable(&self, _targets: &[String], _timeout: Duration) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_fails_over_and_recovers_over_the_bus() {
        let bus = EventBus::new();
        let config = ConfigStore::in_memory(Settings::default(), bus.clone());
        let probe = Arc::new(FakeProbe {
            up: AtomicBool::new(false),
        });
        let (writer, reader) = state_cell(NetworkStatus::default());
        let mut connects = bus.subscribe_channel(MODEM_CONNECT_REQUEST);
        let mut disconnects = bus.subscribe_channel(MODEM_DISCONNECT_REQUEST);
        let token = CancellationToken::new();

        let task = tokio::spawn(connectivity_monitor(
            token.clone(),
            bus.clone(),
            config,
            probe.clone(),
            writer,
        ));

        // checks at t=0 and t=30 fail, the second one requests cellular
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(drain(&mut connects), 1);
        // t=60 is inside the retry delay
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain(&mut connects), 0);

        bus.publish(
            MODEM_DATA_CONNECTED,
            json!({"connected": true, "ip": "100.64.0.7", "interface": "wwan0"}),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reader.snapshot().failover_active);

        probe.up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(drain(&mut disconnects), 1);
        assert_eq!(drain(&mut connects), 0);
        assert_eq!(reader.snapshot().active_interface, ActiveInterface::Wifi);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
