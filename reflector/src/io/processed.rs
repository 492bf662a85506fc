//! Durable processed-task index (`<state>/processed.jsonl`).
//!
//! Append-only JSON Lines, one [`TaskRecord`] per line. A record is only
//! acknowledged after it has been flushed, synced and read back from disk, so
//! the index survives restarts with no loss and no duplication.
//!
//! One writer at a time: opening the index takes `processed.lock` with
//! create-new semantics, and every append checks that the log has not grown
//! behind our back. A lock naming a pid that no longer exists is reclaimed.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::types::{TaskKey, TaskRecord};
use crate::error::ReflectError;

/// Write attempts per record before giving up on read-back verification.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Exclusive handle on the processed index.
#[derive(Debug)]
pub struct ProcessedIndex {
    log_path: PathBuf,
    file: File,
    /// Byte length of the log as last written by us.
    end_offset: u64,
    keys: HashSet<TaskKey>,
    _lock: WriterLock,
}

impl ProcessedIndex {
    /// Acquire the writer lock and load existing records.
    pub fn open(log_path: &Path, lock_path: &Path) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let lock = WriterLock::acquire(lock_path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("open processed index {}", log_path.display()))?;

        let (records, valid_len) = read_log(log_path)?;
        let on_disk = file
            .metadata()
            .with_context(|| format!("stat {}", log_path.display()))?
            .len();
        if valid_len < on_disk {
            warn!(
                path = %log_path.display(),
                discarded_bytes = on_disk - valid_len,
                "discarding torn trailing record"
            );
            file.set_len(valid_len)
                .with_context(|| format!("truncate {}", log_path.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", log_path.display()))?;
        }

        let mut keys = HashSet::with_capacity(records.len());
        for record in records {
            if !keys.insert(record.key.clone()) {
                return Err(anyhow::Error::new(ReflectError::DuplicateKey { key: record.key }))
                    .with_context(|| format!("corrupt processed index {}", log_path.display()));
            }
        }
        info!(path = %log_path.display(), entries = keys.len(), "processed index loaded");

        Ok(Self {
            log_path: log_path.to_path_buf(),
            file,
            end_offset: valid_len,
            keys,
            _lock: lock,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_processed(&self, key: &TaskKey) -> bool {
        self.keys.contains(key)
    }

    /// Durably record a classification.
    ///
    /// Fails with [`ReflectError::DuplicateKey`] if the key is already present
    /// and with [`ReflectError::ConcurrentWriter`] if another process appended
    /// to the log.
    pub fn mark_processed(&mut self, record: &TaskRecord) -> Result<()> {
        if self.keys.contains(&record.key) {
            return Err(ReflectError::DuplicateKey {
                key: record.key.clone(),
            }
            .into());
        }
        self.ensure_sole_writer()?;

        let mut line = serde_json::to_string(record).context("serialize task record")?;
        line.push('\n');

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.append_line(&line)?;
            match self.read_back(&line) {
                Ok(()) => break,
                Err(err) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(key = %record.key, attempt, err = %err, "read-back mismatch, rewriting record");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("persist {} after {attempt} attempts", record.key)
                    });
                }
            }
        }

        self.end_offset += line.len() as u64;
        self.keys.insert(record.key.clone());
        debug!(key = %record.key, status = ?record.status, "marked processed");
        Ok(())
    }

    /// Clear the index. Operator-initiated re-runs only.
    pub fn reset(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .with_context(|| format!("truncate {}", self.log_path.display()))?;
        self.file
            .sync_all()
            .with_context(|| format!("sync {}", self.log_path.display()))?;
        info!(path = %self.log_path.display(), cleared = self.keys.len(), "processed index reset");
        self.end_offset = 0;
        self.keys.clear();
        Ok(())
    }

    fn ensure_sole_writer(&self) -> Result<()> {
        let on_disk = self
            .file
            .metadata()
            .with_context(|| format!("stat {}", self.log_path.display()))?
            .len();
        if on_disk != self.end_offset {
            return Err(ReflectError::ConcurrentWriter {
                lock: self.log_path.clone(),
                holder: format!("unknown (log is {on_disk} bytes, expected {})", self.end_offset),
            }
            .into());
        }
        Ok(())
    }

    /// Truncate any previous partial attempt, then append and sync.
    fn append_line(&mut self, line: &str) -> Result<()> {
        self.file
            .set_len(self.end_offset)
            .with_context(|| format!("truncate {}", self.log_path.display()))?;
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.log_path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("sync {}", self.log_path.display()))
    }

    fn read_back(&self, line: &str) -> Result<()> {
        let mut reader = File::open(&self.log_path)
            .with_context(|| format!("reopen {}", self.log_path.display()))?;
        reader
            .seek(SeekFrom::Start(self.end_offset))
            .context("seek to appended record")?;
        let mut stored = Vec::with_capacity(line.len());
        reader
            .take(line.len() as u64 + 1)
            .read_to_end(&mut stored)
            .context("read appended record")?;
        if stored != line.as_bytes() {
            return Err(anyhow!(
                "read-back mismatch at offset {} ({} bytes stored, {} expected)",
                self.end_offset,
                stored.len(),
                line.len()
            ));
        }
        Ok(())
    }
}

/// Read all records without taking the writer lock (for status reporting).
pub fn read_records(log_path: &Path) -> Result<Vec<TaskRecord>> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let (records, _) = read_log(log_path)?;
    Ok(records)
}

/// Parse complete lines. Returns records plus the byte length they span; a
/// trailing line without a newline is a torn write and is excluded.
fn read_log(log_path: &Path) -> Result<(Vec<TaskRecord>, u64)> {
    let contents = fs::read_to_string(log_path)
        .with_context(|| format!("read processed index {}", log_path.display()))?;
    let complete_len = contents.rfind('\n').map(|idx| idx + 1).unwrap_or(0);

    let mut records = Vec::new();
    for (idx, line) in contents[..complete_len].lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TaskRecord = serde_json::from_str(line).with_context(|| {
            format!("parse {} line {}", log_path.display(), idx + 1)
        })?;
        records.push(record);
    }
    Ok((records, complete_len as u64))
}

/// Lock file held for the lifetime of a [`ProcessedIndex`].
#[derive(Debug)]
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    /// Create the lock file. A lock whose recorded pid no longer exists was
    /// left by a killed run and is taken over.
    fn acquire(path: &Path) -> Result<Self> {
        let mut reclaimed = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    let stale = holder.parse::<u32>().is_ok_and(|pid| !process_alive(pid));
                    if stale && !reclaimed {
                        warn!(lock = %path.display(), holder = %holder, "removing stale lock left by a dead process");
                        fs::remove_file(path)
                            .with_context(|| format!("remove stale lock {}", path.display()))?;
                        reclaimed = true;
                        continue;
                    }
                    return Err(ReflectError::ConcurrentWriter {
                        lock: path.to_path_buf(),
                        holder,
                    }
                    .into());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }
}

/// Sends signal 0. Only a definite "no such process" counts as dead.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    if raw <= 0 {
        return true;
    }
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_: u32) -> bool {
    true
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release processed index lock");
        }
    }
}
