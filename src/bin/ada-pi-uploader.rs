use std::time::Duration;

use ada_pi_daemon::auth::DeviceToken;
use ada_uploader::{upload_pending, FsLogStore, Retry};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Push every pending tachograph log once, then exit
#[derive(Parser, Debug)]
#[command(version)]
struct UploaderArgs {
    /// Folder holding the tachograph CSV files and upload_status.json
    #[arg(
        short = 'f',
        long,
        default_value = "/opt/ada-pi/data/tacho",
        env = "ADA_PI_LOG_DIR"
    )]
    log_dir: String,

    /// The log upload endpoint
    #[arg(short = 'u', long, env = "ADA_PI_LOGS_URL")]
    logs_url: String,

    /// Device id the upload token is issued for
    #[arg(short = 'd', long, env = "ADA_PI_DEVICE_ID")]
    device_id: String,

    /// Token signing secret
    #[arg(long, env = "ADA_PI_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Attempts per file
    #[arg(long, default_value_t = 3)]
    attempts: u32,
}

#[tokio::main]
async fn main() {
    let cli = UploaderArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let store = FsLogStore::open(&cli.log_dir).expect("Could not open log folder");
    let token = DeviceToken::mint(
        &cli.device_id,
        cli.jwt_secret.as_deref(),
        Duration::from_secs(15 * 60),
    )
    .expect("Could not sign device token");

    let sent = upload_pending(
        &reqwest::Client::new(),
        &store,
        &cli.logs_url,
        Some(&token),
        Retry {
            attempts: cli.attempts.max(1),
            ..Retry::default()
        },
    )
    .await;

    println!("Done, {} file(s) uploaded from {}", sent, cli.log_dir);
}
