use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const META_FILE: &str = "upload_status.json";

/// Rotation bucket a log file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::Daily,
        LogCategory::Weekly,
        LogCategory::Monthly,
        LogCategory::Yearly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Daily => "daily",
            LogCategory::Weekly => "weekly",
            LogCategory::Monthly => "monthly",
            LogCategory::Yearly => "yearly",
        }
    }

    /// Rotated files are named `week_*`, `month_*`, `year_*`; plain `.csv` files are daily
    pub fn of(filename: &str) -> Option<Self> {
        if filename.starts_with("week_") {
            Some(LogCategory::Weekly)
        } else if filename.starts_with("month_") {
            Some(LogCategory::Monthly)
        } else if filename.starts_with("year_") {
            Some(LogCategory::Yearly)
        } else if filename.ends_with(".csv") {
            Some(LogCategory::Daily)
        } else {
            None
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where rotated log files live and which of them already reached the cloud
pub trait LogStore: Send + Sync {
    /// Files of `category` not yet uploaded, oldest name first
    fn list_pending_log_files(&self, category: LogCategory) -> io::Result<Vec<PathBuf>>;

    fn mark_uploaded(&self, category: LogCategory, filename: &str) -> io::Result<()>;
}

type UploadMeta = BTreeMap<LogCategory, HashMap<String, bool>>;

/// Log directory with an `upload_status.json` ledger next to the files
pub struct FsLogStore {
    dir: PathBuf,
    meta: Mutex<UploadMeta>,
}

impl FsLogStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let meta = load_meta(&dir.join(META_FILE));
        Ok(Self {
            dir,
            meta: Mutex::new(meta),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_uploaded(&self, category: LogCategory, filename: &str) -> bool {
        self.meta
            .lock()
            .get(&category)
            .and_then(|files| files.get(filename))
            .copied()
            .unwrap_or(false)
    }
}

impl LogStore for FsLogStore {
    fn list_pending_log_files(&self, category: LogCategory) -> io::Result<Vec<PathBuf>> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| LogCategory::of(name) == Some(category))
            .filter(|name| !self.is_uploaded(category, name))
            .collect();
        names.sort();
        Ok(names.into_iter().map(|name| self.dir.join(name)).collect())
    }

    fn mark_uploaded(&self, category: LogCategory, filename: &str) -> io::Result<()> {
        let mut meta = self.meta.lock();
        meta.entry(category)
            .or_default()
            .insert(filename.to_string(), true);
        let content = serde_json::to_string_pretty(&*meta)?;
        fs::write(self.dir.join(META_FILE), content)
    }
}

fn load_meta(path: &Path) -> UploadMeta {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!("Ignoring unreadable upload ledger {:?}: {}", path, err);
            UploadMeta::new()
        }),
        Err(_) => UploadMeta::new(),
    }
}
