use crate::paths::AppPaths;
use crate::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_MAX_BACKUPS: usize = 3;
const LOG_MAX_AGE_DAYS: u64 = 30;
const LOG_TOTAL_CAP_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct LogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

pub fn log_retention_policy() -> LogRetentionPolicy {
    LogRetentionPolicy {
        rotate_bytes: LOG_ROTATE_BYTES,
        max_backups: LOG_MAX_BACKUPS,
        max_age_days: LOG_MAX_AGE_DAYS,
        total_cap_bytes: LOG_TOTAL_CAP_BYTES,
    }
}

/// Append-only JSONL log of conversion requests.
#[derive(Debug, Clone)]
pub struct ConversionLog {
    path: Option<PathBuf>,
}

impl ConversionLog {
    pub fn new(paths: &AppPaths) -> Self {
        Self::at(paths.conversion_log_path())
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(
        &self,
        request_id: &str,
        level: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "request_id": request_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_log_if_needed(path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn rotate_log_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < LOG_ROTATE_BYTES {
        return Ok(());
    }

    rotate_file_backups(path, LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    let backup = |i: usize| path_with_suffix(path, &format!(".{i}"));
    let _ = std::fs::remove_file(backup(max_backups));
    for i in (1..max_backups).rev() {
        let src = backup(i);
        if src.exists() {
            std::fs::rename(&src, backup(i + 1))?;
        }
    }
    if path.exists() {
        std::fs::rename(path, backup(1))?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

#[derive(Debug, Clone)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Everything past the age cutoff, then the oldest of the rest until the
/// remainder fits under the size cap.
fn retention_victims(files: Vec<LogFile>, now: SystemTime) -> Vec<PathBuf> {
    let cutoff = now
        .checked_sub(Duration::from_secs(LOG_MAX_AGE_DAYS * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);
    let (expired, mut kept): (Vec<LogFile>, Vec<LogFile>) =
        files.into_iter().partition(|f| f.modified < cutoff);

    let mut victims: Vec<PathBuf> = expired.into_iter().map(|f| f.path).collect();
    kept.sort_by_key(|f| f.modified);
    let mut total: u64 = kept.iter().map(|f| f.size).sum();
    for file in kept {
        if total <= LOG_TOTAL_CAP_BYTES {
            break;
        }
        total = total.saturating_sub(file.size);
        victims.push(file.path);
    }
    victims
}

/// Applies the retention policy to the logs directory. Returns how many files
/// were removed.
pub fn prune_logs(paths: &AppPaths) -> Result<usize> {
    let dir = paths.logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let files: Vec<LogFile> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(LogFile {
                path: entry.path(),
                modified: meta.modified().unwrap_or(UNIX_EPOCH),
                size: meta.len(),
            })
        })
        .collect();

    let removed = retention_victims(files, SystemTime::now())
        .into_iter()
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count();
    Ok(removed)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
