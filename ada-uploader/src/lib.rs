//! Tachograph log storage and the multipart upload used to push it to the cloud.

use std::{path::Path, time::Duration};

use reqwest::{multipart, StatusCode};
use thiserror::Error;
use tracing::{info, warn};

mod store;

pub use store::{FsLogStore, LogCategory, LogStore};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
}

/// POST `path` as the multipart field `file`
pub async fn upload_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    token: Option<&str>,
) -> Result<(), UploadError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| UploadError::Read {
            path: path.display().to_string(),
            source,
        })?;

    let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name(file_name));
    let mut request = client.post(url).timeout(UPLOAD_TIMEOUT).multipart(form);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let res = request.send().await?;
    if !res.status().is_success() {
        return Err(UploadError::Status(res.status()));
    }
    Ok(())
}

/// Retry policy for [`upload_pending`]
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Upload every pending file of every category, marking each one on success.
/// Returns how many files went up.
pub async fn upload_pending(
    client: &reqwest::Client,
    store: &dyn LogStore,
    url: &str,
    token: Option<&str>,
    retry: Retry,
) -> usize {
    let mut uploaded = 0;
    for category in LogCategory::ALL {
        let files = match store.list_pending_log_files(category) {
            Ok(files) => files,
            Err(err) => {
                warn!("Could not list {} logs: {}", category, err);
                continue;
            }
        };

        for path in files {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for attempt in 1..=retry.attempts {
                match upload_file(client, url, &path, token).await {
                    Ok(()) => {
                        info!("Uploaded {} log {}", category, filename);
                        if let Err(err) = store.mark_uploaded(category, filename) {
                            warn!("Could not record upload of {}: {}", filename, err);
                        }
                        uploaded += 1;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            "Upload of {} failed (try {}/{}): {}",
                            filename, attempt, retry.attempts, err
                        );
                        if attempt < retry.attempts {
                            tokio::time::sleep(retry.delay).await;
                        }
                    }
                }
            }
        }
    }
    uploaded
}
