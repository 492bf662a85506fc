//! Job tree scanner and classifier.
//!
//! Every call re-walks `jobs/<job>/<task>/` in sorted order. Tasks already in
//! the processed index are skipped; tasks with a readable numeric marker are
//! classified, marked processed and yielded; everything else is incomplete and
//! left for a later scan.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::locator::{ArtifactLocator, ArtifactPaths};
use crate::core::marker::classify_marker;
use crate::core::types::{TaskKey, TaskRecord, TaskStatus};
use crate::error::ReflectError;
use crate::io::processed::ProcessedIndex;

/// Tree-wide counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTally {
    /// Task directories seen.
    pub total: usize,
    /// Tasks with a final classification (previously or in this scan).
    pub completed: usize,
    pub incomplete: usize,
    /// Classified for the first time in this scan.
    pub newly_classified: usize,
    /// New failures in this scan.
    pub failures: usize,
}

/// Classifies tasks under a jobs root.
#[derive(Debug, Clone)]
pub struct Scanner {
    locator: ArtifactLocator,
    failure_sentinel: i64,
}

impl Scanner {
    pub fn new(locator: ArtifactLocator, failure_sentinel: i64) -> Self {
        Self {
            locator,
            failure_sentinel,
        }
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    /// Start a scan. Records are marked processed as the iterator advances.
    pub fn scan<'a>(&'a self, index: &'a mut ProcessedIndex) -> Result<ScanIter<'a>> {
        let jobs = list_dirs(self.locator.jobs_root())?;
        debug!(jobs_root = %self.locator.jobs_root().display(), jobs = jobs.len(), "scan started");
        Ok(ScanIter {
            scanner: self,
            index,
            jobs: jobs.into_iter(),
            current: None,
            tally: ScanTally::default(),
            done: false,
        })
    }

    /// Read and classify the marker without touching the processed index.
    pub fn classify(&self, key: &TaskKey) -> (TaskStatus, ArtifactPaths) {
        let paths = self.locator.locate(key);
        let status = match fs::read_to_string(&paths.completion_marker) {
            Ok(raw) => classify_marker(&raw, self.failure_sentinel),
            Err(err) if err.kind() == ErrorKind::NotFound => TaskStatus::Incomplete,
            Err(err) => {
                let transient = ReflectError::TransientIo {
                    path: paths.completion_marker.clone(),
                    reason: err.to_string(),
                };
                warn!(job_id = %key.job_id, task_id = %key.task_id, err = %transient, "marker unreadable, will retry");
                TaskStatus::Incomplete
            }
        };
        (status, paths)
    }
}

/// A newly classified task with its artifact paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub record: TaskRecord,
    pub artifacts: ArtifactPaths,
}

/// Lazy scan over the job tree.
///
/// Yields only newly classified success/failure records. The first persistence
/// error is yielded and ends the scan.
pub struct ScanIter<'a> {
    scanner: &'a Scanner,
    index: &'a mut ProcessedIndex,
    jobs: std::vec::IntoIter<String>,
    current: Option<(String, std::vec::IntoIter<String>)>,
    tally: ScanTally,
    done: bool,
}

impl ScanIter<'_> {
    pub fn tally(&self) -> ScanTally {
        self.tally
    }

    fn next_task(&mut self) -> Option<TaskKey> {
        loop {
            if let Some((job_id, tasks)) = &mut self.current
                && let Some(task_id) = tasks.next()
            {
                return Some(TaskKey::new(job_id.clone(), task_id));
            }
            let job_id = self.jobs.next()?;
            let job_dir = self.scanner.locator.jobs_root().join(&job_id);
            match list_dirs(&job_dir) {
                Ok(tasks) => self.current = Some((job_id, tasks.into_iter())),
                Err(err) => {
                    warn!(job_id = %job_id, err = %err, "cannot list job directory, skipping");
                    self.current = None;
                }
            }
        }
    }
}

impl Iterator for ScanIter<'_> {
    type Item = Result<Classified>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(key) = self.next_task() {
            self.tally.total += 1;
            if self.index.is_processed(&key) {
                self.tally.completed += 1;
                continue;
            }

            let (status, artifacts) = self.scanner.classify(&key);
            if status == TaskStatus::Incomplete {
                self.tally.incomplete += 1;
                debug!(job_id = %key.job_id, task_id = %key.task_id, "task incomplete");
                continue;
            }

            let record = TaskRecord::new(key, status, chrono::Utc::now());
            if let Err(err) = self.index.mark_processed(&record) {
                self.done = true;
                return Some(Err(err).with_context(|| format!("mark {} processed", record.key)));
            }
            self.tally.completed += 1;
            self.tally.newly_classified += 1;
            if status == TaskStatus::Failure {
                self.tally.failures += 1;
            }
            debug!(job_id = %record.key.job_id, task_id = %record.key.task_id, ?status, "task classified");
            return Some(Ok(Classified { record, artifacts }));
        }
        self.done = true;
        None
    }
}

/// Sorted names of visible subdirectories. A missing directory is empty.
pub fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && !name.starts_with('.')
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
