use std::{
    error::Error,
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ada_pi_daemon::{
    bus::EventBus,
    cloud_sync::CloudSync,
    config::{ConfigStore, DEFAULT_CONFIG_PATH},
    connectivity::{connectivity_monitor, NmcliProbe},
    gps::{gps_manager, DEFAULT_GPSD_ADDR},
    modem::{at, modem_poller, IpCommand, ModemDataController, SerialAtChannel},
    ota::{ota_channel, OtaPaths, SystemHost},
    relay::Relay,
    state::build_states,
    system_info::system_info_poller,
};
use ada_uploader::{FsLogStore, LogStore};
use clap::Parser;
use tokio::signal::{
    self,
    unix::{signal as unix_signal, SignalKind},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// ada-pi-daemon command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct DaemonArgs {
    /// Runtime settings file
    #[arg(
        short = 'c',
        long,
        default_value = DEFAULT_CONFIG_PATH,
        env = "ADA_PI_CONFIG"
    )]
    config: PathBuf,

    /// Data folder (OTA downloads, tachograph logs), no trailing slash
    #[arg(
        short = 'f',
        long,
        default_value = "/opt/ada-pi/data",
        env = "ADA_PI_DATA_DIR"
    )]
    data_dir: PathBuf,

    /// Where the backend package is installed
    #[arg(long, default_value = "/opt/ada-pi/backend", env = "ADA_PI_INSTALL_DIR")]
    install_dir: PathBuf,

    /// Python environment of the backend
    #[arg(long, default_value = "/opt/ada-pi/venv", env = "ADA_PI_VENV_DIR")]
    venv_dir: PathBuf,

    /// systemd unit restarted after an update
    #[arg(long, default_value = "ada-pi-backend", env = "ADA_PI_SERVICE")]
    service: String,

    /// The gpsd address
    #[arg(short = 'g', long, default_value = DEFAULT_GPSD_ADDR, env = "ADA_PI_GPSD_ADDR")]
    gpsd_addr: String,

    /// Modem AT port, overrides the config file
    #[arg(short = 'm', long, env = "ADA_PI_MODEM_PORT")]
    modem_port: Option<String>,

    /// Frames buffered per UI client before it lags
    #[arg(long, default_value_t = 256, env = "ADA_PI_RELAY_CAPACITY")]
    relay_capacity: usize,

    /// How long workers get to stop after Ctrl+C
    #[arg(long, default_value_t = 1, env = "ADA_PI_SHUTDOWN_GRACE_SECS")]
    grace_secs: u64,

    /// Install this package (URL or local path) once the daemon is up
    #[arg(long, env = "ADA_PI_OTA_SOURCE")]
    ota: Option<String>,

    /// Expected SHA-256 of the --ota package
    #[arg(long, env = "ADA_PI_OTA_SHA256", requires = "ota")]
    ota_sha256: Option<String>,

    /// Disable the modem data controller and poller
    #[arg(long, env = "ADA_PI_NO_MODEM")]
    no_modem: bool,

    /// Disable the gpsd client
    #[arg(long, env = "ADA_PI_NO_GPS")]
    no_gps: bool,

    /// Disable snapshot and log uploads
    #[arg(long, env = "ADA_PI_NO_CLOUD")]
    no_cloud: bool,

    /// Disable the OTA worker
    #[arg(long, env = "ADA_PI_NO_OTA")]
    no_ota: bool,
}

/// Folder hierarchy
/// Data folder --> specified by the user --data_dir
///                        |
///                       / \
///  (ota): downloads and staging/       (tacho): daily/weekly/monthly/yearly CSV + upload_status.json
#[tokio::main]
async fn main() {
    let cli = DaemonArgs::parse();

    println!("Initializing ada-pi daemon...");
    println!("Initializing fmt subscriber");
    // if RUST_LOG is not set, defaults to loglevel INFO
    let subscriber = tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_ansi(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Could not init tracing");

    let bus = EventBus::new();
    let (writers, readers) = build_states();
    let config = ConfigStore::open(&cli.config, bus.clone());
    let settings = config.load();
    info!("Device {} using {}", settings.device_id, cli.config.display());

    // no overall timeout, OTA downloads can take a while
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("Could not build HTTP client");

    // kept alive for the UI transport
    let relay = Relay::attach(&bus, cli.relay_capacity);

    let task_tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // TASK SPAWNING

    info!("Running config reloader (SIGHUP)");
    task_tracker.spawn(supervise(
        "config reloader",
        reload_on_hangup(token.clone(), config.clone()),
    ));

    info!("Running connectivity monitor");
    task_tracker.spawn(supervise(
        "connectivity monitor",
        connectivity_monitor(
            token.clone(),
            bus.clone(),
            config.clone(),
            Arc::new(NmcliProbe),
            writers.network,
        ),
    ));

    if cli.no_modem {
        info!("Modem disabled");
    } else {
        info!("Running modem data controller and poller");
        let channel = at::shared(SerialAtChannel::new(
            cli.modem_port.clone().or(settings.modem.port.clone()),
        ));
        let controller = ModemDataController::new(
            bus.clone(),
            config.clone(),
            channel.clone(),
            Arc::new(IpCommand),
        );
        task_tracker.spawn(supervise("modem data controller", controller.run(token.clone())));
        task_tracker.spawn(supervise(
            "modem poller",
            modem_poller(token.clone(), bus.clone(), channel, writers.modem),
        ));
    }

    if cli.no_gps {
        info!("GPS disabled");
    } else {
        info!("Running GPS manager");
        task_tracker.spawn(supervise(
            "gps manager",
            gps_manager(token.clone(), bus.clone(), cli.gpsd_addr.clone(), writers.gps),
        ));
    }

    info!("Running system info poller");
    task_tracker.spawn(supervise(
        "system info poller",
        system_info_poller(token.clone(), bus.clone(), writers.system),
    ));

    if cli.no_cloud {
        info!("Cloud sync disabled");
    } else {
        let logs = match FsLogStore::open(cli.data_dir.join("tacho")) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn LogStore>),
            Err(err) => {
                warn!("Tachograph logs unavailable, only snapshots go up: {}", err);
                None
            }
        };
        let sync = CloudSync::new(
            bus.clone(),
            config.clone(),
            client.clone(),
            readers.clone(),
            logs,
        );
        let cloud_token = token.clone();
        task_tracker.spawn(async move {
            // device tokens carry an expiry, so wait for a sane clock
            if wait_for_clock(&cloud_token).await {
                info!("Running cloud sync");
                supervise("cloud sync", sync.run(cloud_token)).await;
            }
        });
    }

    if cli.no_ota {
        info!("OTA disabled");
    } else {
        info!("Running OTA worker");
        let paths = OtaPaths::new(&cli.data_dir, &cli.install_dir, &cli.venv_dir, &cli.service);
        let (ota, worker) = ota_channel(
            bus.clone(),
            client.clone(),
            Arc::new(SystemHost),
            paths,
            settings.ota.chunk_size,
        );
        task_tracker.spawn(supervise("ota worker", worker.run(token.clone())));
        if let Some(source) = cli.ota.clone() {
            ota.queue_update(source, cli.ota_sha256.clone());
        }
    }

    task_tracker.close();

    info!("Initialization complete, ready...");
    info!("Use Ctrl+C or SIGINT to exit cleanly!");

    signal::ctrl_c()
        .await
        .expect("Could not read cancellation trigger (ctr+c)");
    info!("Received exit signal, shutting down!");
    token.cancel();
    let grace = Duration::from_secs(cli.grace_secs);
    if tokio::time::timeout(grace, task_tracker.wait()).await.is_err() {
        warn!(
            "{} task(s) still running after {:?}, exiting anyway",
            task_tracker.len(),
            grace
        );
    }
    drop(relay);
}

/// Log a worker that gave up instead of dropping its error
async fn supervise<F>(name: &'static str, task: F)
where
    F: Future<Output = Result<(), Box<dyn Error + Send + Sync>>>,
{
    if let Err(err) = task.await {
        error!("{} exited: {}", name, err);
    }
}

/// Re-read the settings file every time the daemon gets SIGHUP
async fn reload_on_hangup(
    token: CancellationToken,
    config: Arc<ConfigStore>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut hangup = unix_signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            received = hangup.recv() => match received {
                Some(()) => {
                    info!("Received SIGHUP, reloading configuration");
                    config.reload();
                }
                None => break Ok(()),
            },
        }
    }
}

/// Time is wrong for a while upon boot. Hold on until it is OK, false if cancelled first
async fn wait_for_clock(token: &CancellationToken) -> bool {
    // 2025-01-01T00:00:00Z
    const SANE_EPOCH: Duration = Duration::from_secs(1_735_689_600);
    loop {
        if SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .is_ok_and(|now| now > SANE_EPOCH)
        {
            return true;
        }
        info!("Waiting for good time");
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {},
        }
    }
}
