//! Over-the-air updates.
//!
//! Jobs are queued through an [`OtaHandle`] and processed one at a time by
//! the [`OtaOrchestrator`]: download (with range resume), optional sha256
//! verification, extraction into a clean staging directory, directory swap
//! into the install location, dependency environment rebuild and a service
//! restart. Every stage publishes `ota_status` before it starts; the first
//! failure publishes `{state: "error", msg: <reason>}` and ends the job.
//!
//! A failure after the install swap leaves the new files in place. The
//! running service keeps going until it is restarted.

use std::{
    error::Error,
    ffi::OsStr,
    fs as std_fs,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::RANGE, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{bus::EventBus, OTA_STATUS};

/// An update request, immutable once queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaJob {
    /// http(s) URL or a local file path
    pub source: String,
    pub expected_sha256: Option<String>,
}

/// Progress of the job in flight, as published on `ota_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OtaStatus {
    Queued { url: String },
    Downloading { url: String },
    Downloaded { file: String },
    Verifying,
    Verified,
    Extracting,
    InstallingBackend,
    RebuildingEnvironment,
    Restarting,
    Completed,
    Error { msg: &'static str },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unsupported archive format: {0}")]
    Unsupported(String),
    #[error("could not run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("download failed: {0}")]
    Download(#[source] FetchError),
    #[error("could not hash package: {0}")]
    Hash(#[source] io::Error),
    #[error("sha256 mismatch, expected {expected} got {actual}")]
    Sha256Mismatch { expected: String, actual: String },
    #[error("extraction failed: {0}")]
    Extract(#[source] HostError),
    #[error("package has no {0:?} directory")]
    MissingPayload(PathBuf),
    #[error("could not install payload: {0}")]
    Install(#[source] io::Error),
    #[error("environment rebuild failed: {0}")]
    Environment(#[source] HostError),
    #[error("service restart failed: {0}")]
    Restart(#[source] HostError),
}

impl OtaError {
    /// Wire reason code for the `error` status
    pub fn reason_code(&self) -> &'static str {
        match self {
            OtaError::Download(_) => "download_failed",
            OtaError::Hash(_) | OtaError::Sha256Mismatch { .. } => "sha256_mismatch",
            OtaError::Extract(_) => "extract_failed",
            OtaError::MissingPayload(_) | OtaError::Install(_) => "backend_install_failed",
            OtaError::Environment(_) => "venv_failed",
            OtaError::Restart(_) => "restart_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// Decided by file name only
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

/// Host operations the pipeline needs but does not implement itself
#[async_trait]
pub trait PackageHost: Send + Sync {
    /// Unpack `archive` into the existing, empty `dest`
    async fn extract(&self, archive: &Path, kind: ArchiveKind, dest: &Path)
        -> Result<(), HostError>;

    /// Recreate the environment at `env_dir` and install `manifest` into it
    async fn rebuild_environment(&self, env_dir: &Path, manifest: &Path) -> Result<(), HostError>;

    async fn restart_service(&self, service: &str) -> Result<(), HostError>;
}

/// Shells out to tar, unzip, python3 and systemctl
pub struct SystemHost;

impl SystemHost {
    async fn run(program: &str, args: &[&OsStr]) -> Result<(), HostError> {
        debug!("Running {} {:?}", program, args);
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| HostError::Spawn {
                program: program.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(HostError::Failed {
                program: program.to_string(),
                status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PackageHost for SystemHost {
    async fn extract(
        &self,
        archive: &Path,
        kind: ArchiveKind,
        dest: &Path,
    ) -> Result<(), HostError> {
        let (program, args) = match kind {
            ArchiveKind::Zip => (
                "unzip",
                vec![
                    OsStr::new("-q"),
                    OsStr::new("-o"),
                    archive.as_os_str(),
                    OsStr::new("-d"),
                    dest.as_os_str(),
                ],
            ),
            ArchiveKind::TarGz => (
                "tar",
                vec![
                    OsStr::new("-xzf"),
                    archive.as_os_str(),
                    OsStr::new("-C"),
                    dest.as_os_str(),
                ],
            ),
        };
        Self::run(program, &args).await
    }

    async fn rebuild_environment(&self, env_dir: &Path, manifest: &Path) -> Result<(), HostError> {
        remove_dir_if_exists(env_dir).await?;
        Self::run(
            "python3",
            &[OsStr::new("-m"), OsStr::new("venv"), env_dir.as_os_str()],
        )
        .await?;
        let pip = env_dir.join("bin/pip");
        Self::run(
            &pip.to_string_lossy(),
            &[OsStr::new("install"), OsStr::new("-r"), manifest.as_os_str()],
        )
        .await
    }

    async fn restart_service(&self, service: &str) -> Result<(), HostError> {
        Self::run("systemctl", &[OsStr::new("restart"), OsStr::new(service)]).await
    }
}

/// Where the pipeline reads and writes
#[derive(Debug, Clone)]
pub struct OtaPaths {
    /// downloaded packages
    pub ota_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub install_dir: PathBuf,
    pub env_dir: PathBuf,
    pub service: String,
    /// top-level directory of the package that replaces `install_dir`
    pub payload_dir: String,
    /// frozen dependency list, relative to the installed payload
    pub manifest: String,
}

impl OtaPaths {
    pub fn new(
        data_dir: &Path,
        install_dir: impl Into<PathBuf>,
        env_dir: impl Into<PathBuf>,
        service: impl Into<String>,
    ) -> Self {
        let ota_dir = data_dir.join("ota");
        Self {
            staging_dir: ota_dir.join("staging"),
            ota_dir,
            install_dir: install_dir.into(),
            env_dir: env_dir.into(),
            service: service.into(),
            payload_dir: "backend".to_string(),
            manifest: "requirements-frozen.txt".to_string(),
        }
    }
}

/// Cloneable front of the update queue
#[derive(Clone)]
pub struct OtaHandle {
    bus: EventBus,
    jobs: mpsc::UnboundedSender<OtaJob>,
}

impl OtaHandle {
    /// Append a job behind whatever is in flight. Publishes `queued` right away.
    pub fn queue_update(&self, source: impl Into<String>, expected_sha256: Option<String>) {
        let job = OtaJob {
            source: source.into(),
            expected_sha256,
        };
        info!("OTA queued: {}", job.source);
        self.bus.publish_serialized(
            OTA_STATUS,
            &OtaStatus::Queued {
                url: job.source.clone(),
            },
        );
        if let Err(err) = self.jobs.send(job) {
            warn!("OTA worker gone, dropping {}", err.0.source);
        }
    }
}

/// Owns the staging and install directories while a job runs
pub struct OtaOrchestrator {
    bus: EventBus,
    client: reqwest::Client,
    host: Arc<dyn PackageHost>,
    paths: OtaPaths,
    chunk_size: usize,
    jobs: mpsc::UnboundedReceiver<OtaJob>,
}

/// Create the queue, handing back the producer and the worker
pub fn ota_channel(
    bus: EventBus,
    client: reqwest::Client,
    host: Arc<dyn PackageHost>,
    paths: OtaPaths,
    chunk_size: usize,
) -> (OtaHandle, OtaOrchestrator) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        OtaHandle {
            bus: bus.clone(),
            jobs: tx,
        },
        OtaOrchestrator {
            bus,
            client,
            host,
            paths,
            chunk_size: chunk_size.max(4096),
            jobs: rx,
        },
    )
}

impl OtaOrchestrator {
    /// Process queued jobs in order until cancelled. A job in flight is finished first.
    pub async fn run(
        mut self,
        cancel_token: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        info!("OTA worker started");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Shutting down OTA worker");
                    break Ok(());
                },
                job = self.jobs.recv() => match job {
                    Some(job) => self.process(&job).await,
                    None => break Ok(()),
                },
            }
        }
    }

    /// Run one job to `completed` or `error`
    pub async fn process(&self, job: &OtaJob) {
        match self.pipeline(job).await {
            Ok(()) => {
                info!("OTA update applied");
                self.status(OtaStatus::Completed);
            }
            Err(err) => {
                error!("OTA update from {} failed: {}", job.source, err);
                self.status(OtaStatus::Error {
                    msg: err.reason_code(),
                });
            }
        }
    }

    fn status(&self, status: OtaStatus) {
        self.bus.publish_serialized(OTA_STATUS, &status);
    }

    async fn pipeline(&self, job: &OtaJob) -> Result<(), OtaError> {
        self.status(OtaStatus::Downloading {
            url: job.source.clone(),
        });
        let package = self.fetch(&job.source).await.map_err(OtaError::Download)?;
        self.status(OtaStatus::Downloaded {
            file: package.display().to_string(),
        });

        if let Some(expected) = &job.expected_sha256 {
            self.status(OtaStatus::Verifying);
            let actual = sha256_file(&package, self.chunk_size)
                .await
                .map_err(OtaError::Hash)?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                // a kept copy would satisfy the next Range request as already complete
                if let Err(err) = fs::remove_file(&package).await {
                    warn!("Could not remove rejected package {}: {}", package.display(), err);
                }
                return Err(OtaError::Sha256Mismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            self.status(OtaStatus::Verified);
        }

        self.status(OtaStatus::Extracting);
        self.extract(&package).await.map_err(OtaError::Extract)?;

        self.status(OtaStatus::InstallingBackend);
        let payload = self.paths.staging_dir.join(&self.paths.payload_dir);
        if !fs::metadata(&payload).await.is_ok_and(|m| m.is_dir()) {
            return Err(OtaError::MissingPayload(payload));
        }
        swap_in(&payload, &self.paths.install_dir)
            .await
            .map_err(OtaError::Install)?;

        self.status(OtaStatus::RebuildingEnvironment);
        let manifest = self.paths.install_dir.join(&self.paths.manifest);
        self.host
            .rebuild_environment(&self.paths.env_dir, &manifest)
            .await
            .map_err(OtaError::Environment)?;

        self.status(OtaStatus::Restarting);
        self.host
            .restart_service(&self.paths.service)
            .await
            .map_err(OtaError::Restart)?;
        Ok(())
    }

    /// Bring the package into the OTA directory and return where it landed
    async fn fetch(&self, source: &str) -> Result<PathBuf, FetchError> {
        fs::create_dir_all(&self.paths.ota_dir).await?;
        let target = self.paths.ota_dir.join(package_name(source));

        if source.starts_with("http://") || source.starts_with("https://") {
            self.download(source, &target).await?;
        } else if Path::new(source) != target {
            info!("Using local OTA package {}", source);
            fs::copy(source, &target).await?;
        }
        Ok(target)
    }

    async fn download(&self, url: &str, target: &Path) -> Result<(), FetchError> {
        let existing = match fs::metadata(target).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let mut request = self.client.get(url);
        if existing > 0 {
            info!("Resuming OTA download at byte {}", existing);
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = request.send().await?;

        let append = match response.status() {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE if existing > 0 => {
                info!("OTA package already fully downloaded");
                return Ok(());
            }
            status if status.is_success() => false,
            status => return Err(FetchError::Status(status)),
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(target)
            .await?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            writer.write_all(&chunk?).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn extract(&self, package: &Path) -> Result<(), HostError> {
        let kind = ArchiveKind::detect(package)
            .ok_or_else(|| HostError::Unsupported(package.display().to_string()))?;

        let staging = &self.paths.staging_dir;
        remove_dir_if_exists(staging).await?;
        fs::create_dir_all(staging).await?;
        info!("Extracting {} into {}", package.display(), staging.display());
        self.host.extract(package, kind, staging).await
    }
}

/// File name the package is stored under in the OTA directory
fn package_name(source: &str) -> String {
    let path = source.split(&['?', '#'][..]).next().unwrap_or(source);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "package".to_string(),
    }
}

/// Lowercase hex sha256 of a file, read `block` bytes at a time
pub async fn sha256_file(path: &Path, block: usize) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block.max(1)];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `install` with `payload`. The new tree is assembled next to
/// `install` first so the switch itself is two renames.
async fn swap_in(payload: &Path, install: &Path) -> io::Result<()> {
    let incoming = sibling(install, ".incoming");
    let previous = sibling(install, ".previous");
    remove_dir_if_exists(&incoming).await?;
    remove_dir_if_exists(&previous).await?;
    if let Some(parent) = install.parent() {
        fs::create_dir_all(parent).await?;
    }

    if let Err(err) = fs::rename(payload, &incoming).await {
        // staging usually lives on the data partition
        debug!("Rename into place failed ({}), copying", err);
        let (from, to) = (payload.to_path_buf(), incoming.clone());
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(io::Error::other)??;
    }

    let had_install = fs::metadata(install).await.is_ok();
    if had_install {
        fs::rename(install, &previous).await?;
    }
    if let Err(err) = fs::rename(&incoming, install).await {
        if had_install {
            fs::rename(&previous, install).await?;
        }
        return Err(err);
    }
    if had_install {
        if let Err(err) = remove_dir_if_exists(&previous).await {
            warn!("Could not remove previous install {}: {}", previous.display(), err);
        }
    }
    info!("Installed new payload into {}", install.display());
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std_fs::create_dir_all(to)?;
    for entry in std_fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            std_fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
