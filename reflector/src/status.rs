//! Read-only status report for `reflector status` and the per-pass summary.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::core::locator::ArtifactLocator;
use crate::core::types::{TaskKey, TaskStatus};
use crate::io::config::ReflectorConfig;
use crate::io::init::ReflectorPaths;
use crate::io::loop_state::load_or_default;
use crate::io::processed::read_records;
use crate::io::registry::{Registry, RegistryTarget};
use crate::scan::{Scanner, list_dirs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub completed: usize,
    pub incomplete: usize,
    pub total: usize,
    /// Entries in the processed index.
    pub processed: usize,
    pub batch_seq: u64,
    pub pending_failures: usize,
    pub threshold: usize,
    /// Failed tasks per job, across the whole tree.
    pub failures_by_job: BTreeMap<String, usize>,
    /// Latest revision in the registry.
    pub latest_revision: Option<u64>,
    pub pending_publish: Option<u64>,
}

impl StatusSummary {
    /// Stable `key=value` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("completed={}\n", self.completed));
        out.push_str(&format!("incomplete={}\n", self.incomplete));
        out.push_str(&format!("total={}\n", self.total));
        out.push_str(&format!("processed={}\n", self.processed));
        out.push_str(&format!("batch_seq={}\n", self.batch_seq));
        out.push_str(&format!(
            "pending_failures={}/{}\n",
            self.pending_failures, self.threshold
        ));
        for (job_id, failures) in &self.failures_by_job {
            out.push_str(&format!("job.{job_id}.failures={failures}\n"));
        }
        match self.latest_revision {
            Some(revision) => out.push_str(&format!("latest_revision={revision}\n")),
            None => out.push_str("latest_revision=none\n"),
        }
        if let Some(pending) = self.pending_publish {
            out.push_str(&format!("pending_publish={pending}\n"));
        }
        out
    }
}

/// Summarize the job tree and persisted state without marking, staging or
/// locking anything.
pub fn read_status<R: Registry>(
    paths: &ReflectorPaths,
    config: &ReflectorConfig,
    registry: &R,
) -> Result<StatusSummary> {
    let processed: HashMap<TaskKey, TaskStatus> = read_records(&paths.processed_log_path)?
        .into_iter()
        .map(|record| (record.key, record.status))
        .collect();
    let scanner = Scanner::new(
        ArtifactLocator::new(paths.jobs_dir.clone()),
        config.failure_sentinel,
    );

    let mut completed = 0usize;
    let mut incomplete = 0usize;
    let mut total = 0usize;
    let mut failures_by_job = BTreeMap::new();
    for job_id in list_dirs(&paths.jobs_dir)? {
        for task_id in list_dirs(&paths.jobs_dir.join(&job_id))? {
            total += 1;
            let key = TaskKey::new(job_id.as_str(), task_id);
            let status = match processed.get(&key) {
                Some(status) => *status,
                None => scanner.classify(&key).0,
            };
            match status {
                TaskStatus::Incomplete => incomplete += 1,
                TaskStatus::Success => completed += 1,
                TaskStatus::Failure => {
                    completed += 1;
                    *failures_by_job.entry(job_id.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    let state = load_or_default(&paths.loop_state_path)?;
    let target = RegistryTarget {
        name: config.registry.name.clone(),
        branch: config.registry.branch.clone(),
    };
    Ok(StatusSummary {
        completed,
        incomplete,
        total,
        processed: processed.len(),
        batch_seq: state.batch.seq,
        pending_failures: state.batch.len(),
        threshold: config.failure_threshold,
        failures_by_job,
        latest_revision: registry.latest_revision(&target)?,
        pending_publish: state.pending_publish,
    })
}
