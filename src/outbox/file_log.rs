//! Durable append-only outbox log.
//!
//! One JSON envelope per line. The active file rotates to
//! `outbox.<timestamp>.log.bak` when it exceeds the size threshold; the most
//! recent rotations are retained, older ones deleted. Replay reads the file
//! line by line, skips anything that does not parse, and truncates the file
//! after a successful load.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::OutboxRecord;

pub const ACTIVE_FILE: &str = "outbox.log";

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub entries: Vec<OutboxRecord>,
    pub skipped: usize,
}

pub struct OutboxLog {
    dir: PathBuf,
    path: PathBuf,
    max_file_size: u64,
    retained_backups: usize,
    // serialises all file access within the process
    lock: Mutex<()>,
}

impl OutboxLog {
    pub fn new(dir: &Path, max_file_size: u64, retained_backups: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create outbox directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            path: dir.join(ACTIVE_FILE),
            max_file_size,
            retained_backups,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one serialised envelope as a line, rotating first when the
    /// active file is already over the size threshold.
    pub fn append(&self, line: &str) -> Result<()> {
        let _guard = self.lock.lock();
        if self.active_size() > self.max_file_size {
            self.rotate()?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Load every parseable envelope, then truncate the active file.
    ///
    /// A grossly oversized file (over twice the rotation threshold) is
    /// rotated aside instead of loaded, capping replay memory; its contents
    /// stay available to operators in the backup.
    pub fn replay(&self) -> Result<ReplayOutcome> {
        let _guard = self.lock.lock();
        let mut outcome = ReplayOutcome::default();

        let size = self.active_size();
        if size > 2 * self.max_file_size {
            warn!(
                size_bytes = size,
                "outbox log oversized, rotating aside instead of replaying"
            );
            self.rotate()?;
            return Ok(outcome);
        }

        if !self.path.exists() {
            return Ok(outcome);
        }

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("failed to read outbox line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OutboxRecord>(&line) {
                Ok(record) => outcome.entries.push(record),
                Err(e) => {
                    outcome.skipped += 1;
                    warn!(line = idx + 1, error = %e, "skipping malformed outbox line");
                }
            }
        }

        File::create(&self.path).context("failed to truncate outbox log after replay")?;
        Ok(outcome)
    }

    fn active_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn rotate(&self) -> Result<()> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%f");
        let backup = self.dir.join(format!("outbox.{stamp}.log.bak"));
        fs::rename(&self.path, &backup)
            .with_context(|| format!("failed to rotate outbox log to {}", backup.display()))?;
        info!(backup = %backup.display(), "rotated outbox log");
        self.prune_backups()
    }

    fn prune_backups(&self) -> Result<()> {
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("outbox.") && n.ends_with(".log.bak"))
                    .unwrap_or(false)
            })
            .collect();

        // fixed-width timestamps: lexicographic order is chronological
        backups.sort();
        while backups.len() > self.retained_backups {
            let oldest = backups.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %e, "failed to prune outbox backup");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn backup_count(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .map(|n| n.starts_with("outbox.") && n.ends_with(".log.bak"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}
