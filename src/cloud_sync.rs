use std::{error::Error, sync::Arc, time::Duration};

use ada_uploader::{upload_pending, LogStore, Retry};
use chrono::Utc;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::{DeviceToken, TokenError},
    bus::EventBus,
    config::{ConfigStore, Settings},
    state::{ActiveInterface, GpsStatus, ModemStatus, NetworkStatus, StateReaders, SystemStatus},
    CLOUD_UPLOAD, CONFIG_CHANGED, OBD_COMMAND,
};

const TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("could not sign request: {0}")]
    Token(#[from] TokenError),
}

/// Body of a snapshot upload
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// unix seconds
    pub timestamp: i64,
    pub device_id: String,
    pub gps: GpsStatus,
    pub modem: ModemStatus,
    pub network: NetworkStatus,
    pub system: SystemStatus,
}

/// Pushes state snapshots and rotated logs to the cloud and relays the
/// commands the server hands back
pub struct CloudSync {
    bus: EventBus,
    config: Arc<ConfigStore>,
    client: reqwest::Client,
    states: StateReaders,
    logs: Option<Arc<dyn LogStore>>,
    retry: Retry,
    settings: Settings,
    /// server override of the snapshot interval
    interval_override: Option<Duration>,
}

impl CloudSync {
    pub fn new(
        bus: EventBus,
        config: Arc<ConfigStore>,
        client: reqwest::Client,
        states: StateReaders,
        logs: Option<Arc<dyn LogStore>>,
    ) -> Self {
        let settings = config.load();
        Self {
            bus,
            config,
            client,
            states,
            logs,
            retry: Retry::default(),
            settings,
            interval_override: None,
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn snapshot_interval(&self) -> Duration {
        self.interval_override
            .unwrap_or(Duration::from_secs(self.settings.cloud.interval_secs))
            .max(Duration::from_secs(1))
    }

    fn log_interval(&self) -> Duration {
        Duration::from_secs(self.settings.cloud.log_interval_secs.max(1))
    }

    pub async fn run(
        mut self,
        cancel_token: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut config_events = self.bus.subscribe_channel(CONFIG_CHANGED);
        let mut snapshot_tick = ticker(self.snapshot_interval());
        let mut log_tick = ticker(self.log_interval());
        info!(
            "Cloud sync started for {} every {:?}",
            self.settings.device_id,
            self.snapshot_interval()
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Shutting down cloud sync");
                    break Ok(());
                },
                Some(_) = config_events.recv() => {
                    let before = (self.snapshot_interval(), self.log_interval());
                    self.settings = self.config.load();
                    info!("Cloud sync reloaded configuration");
                    if self.snapshot_interval() != before.0 {
                        snapshot_tick = ticker(self.snapshot_interval());
                    }
                    if self.log_interval() != before.1 {
                        log_tick = ticker(self.log_interval());
                    }
                },
                _ = snapshot_tick.tick() => {
                    let before = self.snapshot_interval();
                    self.upload_snapshot().await;
                    if self.snapshot_interval() != before {
                        snapshot_tick = ticker(self.snapshot_interval());
                    }
                },
                _ = log_tick.tick() => self.upload_logs().await,
            }
        }
    }

    fn online(&self) -> bool {
        self.states.modem.snapshot().connected
            || self.states.network.snapshot().active_interface != ActiveInterface::None
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            timestamp: Utc::now().timestamp(),
            device_id: self.settings.device_id.clone(),
            gps: self.states.gps.snapshot(),
            modem: self.states.modem.snapshot(),
            network: self.states.network.snapshot(),
            system: self.states.system.snapshot(),
        }
    }

    fn token(&self) -> Result<String, TokenError> {
        DeviceToken::mint(
            &self.settings.device_id,
            self.settings.jwt_secret.as_deref(),
            TOKEN_TTL,
        )
    }

    /// One snapshot round, retried per the retry policy
    pub async fn upload_snapshot(&mut self) {
        let url = self.settings.cloud.upload_url.trim().to_string();
        if url.is_empty() {
            return;
        }
        if !self.online() {
            warn!("Offline, skipping cloud snapshot");
            return;
        }

        let snapshot = self.snapshot();
        for attempt in 1..=self.retry.attempts {
            match self.post_snapshot(&url, &snapshot).await {
                Ok(reply) => {
                    self.bus.publish(CLOUD_UPLOAD, json!({"status": "ok"}));
                    self.handle_reply(reply);
                    return;
                }
                Err(err) => warn!(
                    "Snapshot upload failed (try {}/{}): {}",
                    attempt, self.retry.attempts, err
                ),
            }
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }
    }

    async fn post_snapshot(&self, url: &str, snapshot: &Snapshot) -> Result<Value, CloudError> {
        let res = self
            .client
            .post(url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(self.token()?)
            .json(snapshot)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(CloudError::Status(res.status()));
        }
        let body = res.bytes().await?;
        Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            debug!("Snapshot reply is not JSON: {}", err);
            Value::Null
        }))
    }

    /// Apply settings and commands carried in a snapshot reply
    fn handle_reply(&mut self, reply: Value) {
        let data = match reply.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => &reply,
        };

        if let Some(secs) = data
            .get("upload_interval")
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
        {
            let interval = Duration::from_secs(secs);
            if interval != self.snapshot_interval() {
                info!("Server set upload interval to {:?}", interval);
                self.interval_override = Some(interval);
            }
        }

        match data.get("pending_command").and_then(Value::as_str) {
            Some(action @ ("read_dtc" | "clear_dtc")) => {
                info!("Server command {}", action);
                self.bus.publish(OBD_COMMAND, json!({ "action": action }));
            }
            Some(other) => warn!("Unknown server command {:?}", other),
            None => {}
        }
    }

    /// Push every pending rotated log file
    pub async fn upload_logs(&self) {
        let Some(store) = &self.logs else {
            return;
        };
        let url = self.settings.cloud.logs_url.trim();
        if url.is_empty() {
            debug!("No logs_url configured");
            return;
        }
        if !self.online() {
            warn!("Offline, skipping log upload");
            return;
        }
        let token = match self.token() {
            Ok(token) => token,
            Err(err) => {
                warn!("Could not sign log upload: {}", err);
                return;
            }
        };

        let sent = upload_pending(&self.client, store.as_ref(), url, Some(&token), self.retry).await;
        if sent > 0 {
            info!("Uploaded {} log files", sent);
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use ada_uploader::{FsLogStore, LogCategory};
    use wiremock::{
        matchers::{header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::state::{build_states, ModemUpdate, StateWriters};

    fn setup(
        server: &MockServer,
        logs: Option<Arc<dyn LogStore>>,
    ) -> (CloudSync, StateWriters, EventBus) {
        let bus = EventBus::new();
        let mut settings = Settings::default();
        settings.device_id = "ADA-7".into();
        settings.jwt_secret = Some("k".into());
        settings.cloud.upload_url = format!("{}/api/upload", server.uri());
        settings.cloud.logs_url = format!("{}/api/logs", server.uri());
        let config = ConfigStore::in_memory(settings, bus.clone());
        let (writers, readers) = build_states();
        let sync = CloudSync::new(bus.clone(), config, reqwest::Client::new(), readers, logs)
            .with_retry(Retry {
                attempts: 3,
                delay: Duration::from_millis(1),
            });
        (sync, writers, bus)
    }

    fn go_online(writers: &StateWriters) {
        writers.modem.apply(ModemUpdate {
            connected: Some(true),
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn offline_skips_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (mut sync, _writers, _bus) = setup(&server, None);

        sync.upload_snapshot().await;
    }

    #[tokio::test]
    async fn snapshot_is_signed_and_reply_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "data": {"upload_interval": 60, "pending_command": "read_dtc"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (mut sync, writers, bus) = setup(&server, None);
        go_online(&writers);
        let mut uploads = bus.subscribe_channel(CLOUD_UPLOAD);
        let mut commands = bus.subscribe_channel(OBD_COMMAND);

        sync.upload_snapshot().await;

        assert_eq!(uploads.recv().await.unwrap().payload, json!({"status": "ok"}));
        assert_eq!(commands.recv().await.unwrap().payload, json!({"action": "read_dtc"}));
        assert_eq!(sync.snapshot_interval(), Duration::from_secs(60));

        let request = &server.received_requests().await.unwrap()[0];
        let token = request.headers["authorization"]
            .to_str()
            .unwrap()
            .strip_prefix("Bearer ")
            .unwrap()
            .to_string();
        assert_eq!(DeviceToken::verify(&token, "k").unwrap().device, "ADA-7");
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["device_id"], json!("ADA-7"));
        assert_eq!(body["modem"]["connected"], json!(true));
        assert!(body["gps"].is_object() && body["system"].is_object());
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let (mut sync, writers, bus) = setup(&server, None);
        go_online(&writers);
        let mut uploads = bus.subscribe_channel(CLOUD_UPLOAD);

        sync.upload_snapshot().await;

        assert!(uploads.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_commands_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"pending_command": "reboot", "upload_interval": 0})),
            )
            .mount(&server)
            .await;
        let (mut sync, writers, bus) = setup(&server, None);
        go_online(&writers);
        let mut commands = bus.subscribe_channel(OBD_COMMAND);

        sync.upload_snapshot().await;

        assert!(commands.try_recv().is_err());
        assert_eq!(sync.snapshot_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn pending_logs_are_uploaded_and_marked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/logs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2025-02-14.csv"), "t\n1\n").unwrap();
        std::fs::write(dir.path().join("month_2025-01.csv"), "t\n1\n").unwrap();
        let store = Arc::new(FsLogStore::open(dir.path()).unwrap());
        let (sync, writers, _bus) = setup(&server, Some(store.clone() as Arc<dyn LogStore>));
        go_online(&writers);

        sync.upload_logs().await;

        assert!(store.is_uploaded(LogCategory::Daily, "2025-02-14.csv"));
        assert!(store.is_uploaded(LogCategory::Monthly, "month_2025-01.csv"));
        assert!(store
            .list_pending_log_files(LogCategory::Daily)
            .unwrap()
            .is_empty());
    }
}
