use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::at::{self, AtChannel, ModemError, SharedAtChannel};
use crate::{
    bus::EventBus,
    config::{ConfigStore, ModemSettings},
    connectivity::interface_ipv4,
    MODEM_CONNECT_REQUEST, MODEM_DATA_CONNECTED, MODEM_DISCONNECT_REQUEST,
};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload of `modem_data_connected`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataConnectedEvent {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// The cellular data session, created on the first connect attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModemDataSession {
    pub apn: String,
    pub connected: bool,
    pub interface_name: Option<String>,
    pub assigned_ip: Option<String>,
}

/// Looks up the address the network assigned to the data interface
#[async_trait]
pub trait InterfaceAddress: Send + Sync {
    async fn ipv4(&self, interface: &str) -> Option<String>;
}

/// Reads addresses with `ip addr`
pub struct IpCommand;

#[async_trait]
impl InterfaceAddress for IpCommand {
    async fn ipv4(&self, interface: &str) -> Option<String> {
        interface_ipv4(interface).await
    }
}

/// Owns the cellular data session lifecycle.
///
/// Requests are handled one at a time from the bus, and the AT channel is
/// held for the whole attach or detach sequence.
pub struct ModemDataController {
    bus: EventBus,
    config: Arc<ConfigStore>,
    channel: SharedAtChannel,
    addresses: Arc<dyn InterfaceAddress>,
    session: Option<ModemDataSession>,
    poll_every: Duration,
}

impl ModemDataController {
    pub fn new(
        bus: EventBus,
        config: Arc<ConfigStore>,
        channel: SharedAtChannel,
        addresses: Arc<dyn InterfaceAddress>,
    ) -> Self {
        Self {
            bus,
            config,
            channel,
            addresses,
            session: None,
            poll_every: Duration::from_secs(1),
        }
    }

    pub fn session(&self) -> Option<&ModemDataSession> {
        self.session.as_ref()
    }

    /// Bring up the data session, reporting the outcome on the bus
    pub async fn connect(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.connected) {
            debug!("Modem data already connected");
            return;
        }

        // APN and credentials are re-read on every attempt so config changes apply
        let settings = self.config.load().modem;
        let Some(apn) = settings.apn().map(str::to_string) else {
            warn!("No APN configured, cellular data unavailable");
            self.report(false, None, None);
            return;
        };

        {
            let mut channel = self.channel.lock().await;
            if !at::responsive(&mut **channel).await {
                warn!("Modem unreachable, cannot start data session");
                self.report(false, None, None);
                return;
            }

            self.session = Some(ModemDataSession {
                apn: apn.clone(),
                ..Default::default()
            });

            info!("Starting cellular data session on APN {}", apn);
            if let Err(err) = attach(&mut **channel, &settings, &apn).await {
                warn!("Modem attach failed: {}", err);
                self.report(false, None, None);
                return;
            }
        }

        let interface = settings.data_interface.clone();
        let timeout = Duration::from_secs(settings.connect_timeout_secs);
        match self.wait_for_address(&interface, timeout).await {
            Some(ip) => {
                info!("Cellular data up on {} with {}", interface, ip);
                if let Some(session) = self.session.as_mut() {
                    session.connected = true;
                    session.interface_name = Some(interface.clone());
                    session.assigned_ip = Some(ip.clone());
                }
                self.report(true, Some(ip), Some(interface));
            }
            None => {
                warn!("No address on {} after {:?}", interface, timeout);
                self.report(false, None, None);
            }
        }
    }

    /// Tear down the data session, always reports disconnected
    pub async fn disconnect(&mut self) {
        {
            let mut channel = self.channel.lock().await;
            if let Err(err) = channel.command("AT+CGACT=0,1", ATTACH_TIMEOUT).await {
                warn!("Modem detach failed: {}", err);
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.connected = false;
            session.assigned_ip = None;
        }
        info!("Cellular data session closed");
        self.report(false, None, None);
    }

    async fn wait_for_address(&self, interface: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ip) = self.addresses.ipv4(interface).await {
                return Some(ip);
            }
            if Instant::now() + self.poll_every > deadline {
                return None;
            }
            tokio::time::sleep(self.poll_every).await;
        }
    }

    fn report(&self, connected: bool, ip: Option<String>, interface: Option<String>) {
        self.bus.publish_serialized(
            MODEM_DATA_CONNECTED,
            &DataConnectedEvent {
                connected,
                ip,
                interface,
            },
        );
    }

    /// Serve connect/disconnect requests from the bus until cancelled
    pub async fn run(
        mut self,
        cancel_token: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut connect_rx = self.bus.subscribe_channel(MODEM_CONNECT_REQUEST);
        let mut disconnect_rx = self.bus.subscribe_channel(MODEM_DISCONNECT_REQUEST);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Shutting down modem data controller");
                    break Ok(());
                },
                Some(_) = connect_rx.recv() => self.connect().await,
                Some(_) = disconnect_rx.recv() => self.disconnect().await,
            }
        }
    }
}

async fn attach(
    channel: &mut dyn AtChannel,
    settings: &ModemSettings,
    apn: &str,
) -> Result<(), ModemError> {
    channel
        .command(
            &format!("AT+CGDCONT=1,\"IP\",\"{}\"", quoted(apn)),
            at::DEFAULT_TIMEOUT,
        )
        .await?;

    if let Some(user) = settings.username.as_deref().filter(|u| !u.is_empty()) {
        let password = settings.password.as_deref().unwrap_or_default();
        channel
            .command(
                &format!(
                    "AT+CGAUTH=1,{},\"{}\",\"{}\"",
                    settings.auth.code(),
                    quoted(user),
                    quoted(password)
                ),
                at::DEFAULT_TIMEOUT,
            )
            .await?;
    }

    channel.command("AT+CGACT=1,1", ATTACH_TIMEOUT).await?;
    Ok(())
}

fn quoted(value: &str) -> String {
    value.replace('"', "")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        bus::Event,
        config::{ModemAuth, Settings},
        modem::at::fake::FakeModem,
    };

    /// Hands out an address after `after` lookups
    struct SlowDhcp {
        after: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InterfaceAddress for SlowDhcp {
        async fn ipv4(&self, _interface: &str) -> Option<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (call >= self.after).then(|| "100.64.12.9".to_string())
        }
    }

    fn setup(
        apn: Option<&str>,
        modem: FakeModem,
        after: usize,
    ) -> (ModemDataController, UnboundedReceiver<Event>) {
        let bus = EventBus::new();
        let mut settings = Settings::default();
        settings.modem.apn = apn.map(str::to_string);
        settings.modem.username = Some("web".into());
        settings.modem.password = Some("web".into());
        let config = ConfigStore::in_memory(settings, bus.clone());
        let events = bus.subscribe_channel(MODEM_DATA_CONNECTED);
        let controller = ModemDataController::new(
            bus,
            config,
            at::shared(modem),
            Arc::new(SlowDhcp {
                after,
                calls: AtomicUsize::new(0),
            }),
        );
        (controller, events)
    }

    #[tokio::test]
    async fn missing_apn_fails_fast() {
        let modem = FakeModem::default();
        let (mut controller, mut events) = setup(None, modem.clone(), 0);

        controller.connect().await;

        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
        assert!(modem.sent().is_empty());
        assert!(controller.session().is_none());
    }

    #[tokio::test]
    async fn unreachable_modem_fails_fast() {
        let modem = FakeModem {
            dead: true,
            ..Default::default()
        };
        let (mut controller, mut events) = setup(Some("giffgaff.com"), modem.clone(), 0);

        controller.connect().await;

        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
        assert_eq!(modem.sent(), vec!["AT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_then_report_address() {
        let modem = FakeModem::default();
        let (mut controller, mut events) = setup(Some("giffgaff.com"), modem.clone(), 3);

        controller.connect().await;

        assert_eq!(
            modem.sent(),
            vec![
                "AT".to_string(),
                "AT+CGDCONT=1,\"IP\",\"giffgaff.com\"".to_string(),
                "AT+CGAUTH=1,1,\"web\",\"web\"".to_string(),
                "AT+CGACT=1,1".to_string(),
            ]
        );
        assert_eq!(
            events.recv().await.unwrap().payload,
            json!({"connected": true, "ip": "100.64.12.9", "interface": "wwan0"})
        );
        let session = controller.session().unwrap();
        assert!(session.connected);
        assert_eq!(session.apn, "giffgaff.com");

        // already up, nothing else happens
        controller.connect().await;
        assert_eq!(modem.sent().len(), 4);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn chap_credentials_use_auth_type_two() {
        let mut modem = FakeModem::default();
        let settings = ModemSettings {
            username: Some("ee".into()),
            password: Some("\"data\"".into()),
            auth: ModemAuth::Chap,
            ..Default::default()
        };

        attach(&mut modem, &settings, "everywhere").await.unwrap();

        assert_eq!(
            modem.sent(),
            vec![
                "AT+CGDCONT=1,\"IP\",\"everywhere\"".to_string(),
                "AT+CGAUTH=1,2,\"ee\",\"data\"".to_string(),
                "AT+CGACT=1,1".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn address_timeout_reports_failure() {
        let modem = FakeModem::default();
        let (mut controller, mut events) = setup(Some("giffgaff.com"), modem, usize::MAX);

        controller.connect().await;

        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
        assert!(!controller.session().unwrap().connected);
    }

    #[tokio::test]
    async fn rejected_attach_reports_failure() {
        let modem = FakeModem::default();
        modem.reject("AT+CGACT=1,1");
        let (mut controller, mut events) = setup(Some("giffgaff.com"), modem, 0);

        controller.connect().await;

        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
    }

    #[tokio::test]
    async fn disconnect_always_reports() {
        let modem = FakeModem::default();
        modem.reject("AT+CGACT=0,1");
        let (mut controller, mut events) = setup(Some("giffgaff.com"), modem.clone(), 0);

        controller.disconnect().await;
        controller.disconnect().await;

        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
        assert_eq!(events.recv().await.unwrap().payload, json!({"connected": false}));
        assert_eq!(modem.sent(), vec!["AT+CGACT=0,1", "AT+CGACT=0,1"]);
    }
}
