//! One reflection pass: scan, aggregate, and (when a batch is ready) analyze,
//! update and publish.
//!
//! All durable state lives in the processed index and `loop_state.json`; the
//! orchestrator writes loop state after every change so a restart resumes
//! without losing or repeating work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::aggregate::Aggregator;
use crate::analyze::FeedbackInvoker;
use crate::core::batch::BatchState;
use crate::core::locator::{ArtifactLocator, StagingLayout};
use crate::core::types::{HubRevision, TaskStatus};
use crate::error::ReflectError;
use crate::io::config::ReflectorConfig;
use crate::io::init::ReflectorPaths;
use crate::io::loop_state::{LoopState, load_or_default, write_loop_state};
use crate::io::processed::{ProcessedIndex, read_records};
use crate::io::registry::{Registry, RegistryTarget};
use crate::io::spec_store::load_spec;
use crate::io::transform::TextTransform;
use crate::publish::Publisher;
use crate::scan::{ScanTally, Scanner};
use crate::update::SpecUpdater;

/// What the trigger step did in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Published(HubRevision),
    /// Analysis failed; the batch is kept for the next pass.
    AnalysisFailed,
    /// The revised spec was rejected; nothing was published.
    SpecRejected,
    /// The registry push failed; it is retried next pass.
    PublishDeferred,
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub pass: u64,
    /// Tree-wide counts from the final full walk; `newly_classified` and
    /// `failures` cover the whole pass.
    pub tally: ScanTally,
    pub staging_errors: usize,
    /// Trigger steps run in this pass, in order. Empty when no batch was ready
    /// or shutdown was requested.
    pub triggers: Vec<TriggerOutcome>,
    pub batch_len: usize,
    pub threshold: usize,
    pub last_revision: u64,
}

impl PassOutcome {
    /// One-line `key=value` progress report.
    pub fn summary_line(&self) -> String {
        let triggers = if self.triggers.is_empty() {
            "none".to_string()
        } else {
            self.triggers
                .iter()
                .map(|trigger| match trigger {
                    TriggerOutcome::Published(rev) => format!("published:{}", rev.revision),
                    TriggerOutcome::AnalysisFailed => "analysis_failed".to_string(),
                    TriggerOutcome::SpecRejected => "spec_rejected".to_string(),
                    TriggerOutcome::PublishDeferred => "publish_deferred".to_string(),
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "pass={} completed={} incomplete={} total={} new_failures={} batch={}/{} staging_errors={} trigger={} revision={}",
            self.pass,
            self.tally.completed,
            self.tally.incomplete,
            self.tally.total,
            self.tally.failures,
            self.batch_len,
            self.threshold,
            self.staging_errors,
            triggers,
            self.last_revision,
        )
    }
}

pub struct Orchestrator<'a, T: TextTransform, R: Registry> {
    paths: ReflectorPaths,
    config: ReflectorConfig,
    scanner: Scanner,
    index: ProcessedIndex,
    aggregator: Aggregator,
    state: LoopState,
    transform: &'a T,
    publisher: Publisher<'a, R>,
}

impl<'a, T: TextTransform, R: Registry> Orchestrator<'a, T, R> {
    /// Take the processed index lock, restore loop state and connect to the registry.
    pub fn open(
        paths: &ReflectorPaths,
        config: &ReflectorConfig,
        transform: &'a T,
        registry: &'a R,
    ) -> Result<Self> {
        let index = ProcessedIndex::open(&paths.processed_log_path, &paths.processed_lock_path)?;
        let mut state = load_or_default(&paths.loop_state_path)?;
        let locator = ArtifactLocator::new(paths.jobs_dir.clone());
        let aggregator = Aggregator::new(
            BatchState::restore(config.failure_threshold, state.batch.clone()),
            StagingLayout::new(paths.staging_dir.clone()),
        );
        let target = RegistryTarget {
            name: config.registry.name.clone(),
            branch: config.registry.branch.clone(),
        };
        let publisher = Publisher::connect(
            registry,
            target,
            paths.root.clone(),
            config.registry.code_paths.clone(),
            config.registry.commit_message.clone(),
            state.last_revision,
        )?;
        state.last_revision = publisher.last_observed();

        let mut orchestrator = Self {
            paths: paths.clone(),
            config: config.clone(),
            scanner: Scanner::new(locator, config.failure_sentinel),
            index,
            aggregator,
            state,
            transform,
            publisher,
        };
        orchestrator.recover_unbatched()?;
        info!(
            processed = orchestrator.index.len(),
            batch_seq = orchestrator.aggregator.batch().seq,
            pending = orchestrator.aggregator.len(),
            last_revision = orchestrator.state.last_revision,
            "orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn paths(&self) -> &ReflectorPaths {
        &self.paths
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn processed_len(&self) -> usize {
        self.index.len()
    }

    /// Clear the processed index so every task is classified again.
    pub fn reset_processed(&mut self) -> Result<()> {
        self.index.reset()?;
        self.state.accounted = 0;
        self.persist()
    }

    /// Re-ingest failures that were marked processed but never reached the
    /// persisted batch (crash between the two writes).
    fn recover_unbatched(&mut self) -> Result<()> {
        let records = read_records(&self.paths.processed_log_path)?;
        if self.state.accounted > records.len() {
            warn!(
                accounted = self.state.accounted,
                entries = records.len(),
                "processed index shrank since last run"
            );
            self.state.accounted = records.len();
        }
        let mut recovered = 0usize;
        for record in &records[self.state.accounted..] {
            if record.status != TaskStatus::Failure {
                continue;
            }
            let artifacts = self.scanner.locator().locate(&record.key);
            self.aggregator.ingest(record.clone(), &artifacts);
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "re-batched failures recorded before a crash");
        }
        if self.state.accounted != records.len() {
            self.state.accounted = records.len();
            self.persist()?;
        }
        Ok(())
    }

    /// Run one pass over the job tree.
    ///
    /// A deferred publish is retried first. The scan stops as soon as the batch
    /// reaches the threshold, the batch is analyzed, and scanning resumes. Once
    /// `shutdown` is set no new trigger starts; the scan still completes.
    #[instrument(skip_all, fields(pass = self.state.passes + 1))]
    pub fn run_pass(&mut self, shutdown: &AtomicBool) -> Result<PassOutcome> {
        let mut triggers = Vec::new();
        if self.state.pending_publish.is_some() && !shutdown.load(Ordering::SeqCst) {
            triggers.push(self.retry_deferred_publish()?);
        }

        let mut newly_classified = 0usize;
        let mut failures = 0usize;
        let mut staging_errors = 0usize;
        let mut analysis_failed = false;
        let last_walk = loop {
            let allow_trigger = !analysis_failed
                && self.state.pending_publish.is_none()
                && !shutdown.load(Ordering::SeqCst);
            let (tally, errors) = self.scan_and_aggregate(allow_trigger)?;
            newly_classified += tally.newly_classified;
            failures += tally.failures;
            staging_errors += errors;

            if !(allow_trigger && self.aggregator.is_ready()) {
                break tally;
            }
            if shutdown.load(Ordering::SeqCst) {
                debug!("shutdown requested, finishing scan without trigger");
                continue;
            }
            let outcome = self.trigger_batch()?;
            analysis_failed = outcome == TriggerOutcome::AnalysisFailed;
            triggers.push(outcome);
        };

        self.state.passes += 1;
        self.persist()?;
        Ok(PassOutcome {
            pass: self.state.passes,
            tally: ScanTally {
                newly_classified,
                failures,
                ..last_walk
            },
            staging_errors,
            triggers,
            batch_len: self.aggregator.len(),
            threshold: self.aggregator.threshold(),
            last_revision: self.state.last_revision,
        })
    }

    /// Walk the tree, batching new failures. With `stop_when_ready`, returns
    /// early (with a partial tally) once the batch is ready.
    fn scan_and_aggregate(&mut self, stop_when_ready: bool) -> Result<(ScanTally, usize)> {
        let Self {
            paths,
            scanner,
            index,
            aggregator,
            state,
            ..
        } = self;
        let base = index.len();
        let mut staging_errors = 0usize;

        let mut iter = scanner.scan(index)?;
        loop {
            if stop_when_ready && aggregator.is_ready() {
                debug!(batch_len = aggregator.len(), "batch ready, pausing scan");
                break;
            }
            let Some(item) = iter.next() else {
                break;
            };
            let classified = item?;
            if classified.record.status == TaskStatus::Failure {
                let report = aggregator.ingest(classified.record, &classified.artifacts);
                staging_errors += report.staged.errors.len();
                state.accounted = base + iter.tally().newly_classified;
                persist_state(&paths.loop_state_path, state, aggregator)?;
            }
        }
        let tally = iter.tally();
        state.accounted = base + tally.newly_classified;
        persist_state(&paths.loop_state_path, state, aggregator)?;

        if tally.newly_classified > 0 {
            info!(
                new = tally.newly_classified,
                failures = tally.failures,
                incomplete = tally.incomplete,
                "scan classified tasks"
            );
        }
        Ok((tally, staging_errors))
    }

    fn retry_deferred_publish(&mut self) -> Result<TriggerOutcome> {
        let pending = self.state.pending_publish.unwrap_or_default();
        let spec = load_spec(&self.paths.spec_path)?;
        if spec.revision != pending {
            warn!(pending, found = spec.revision, "spec changed since the deferred publish");
        }
        info!(spec_revision = spec.revision, "retrying deferred publish");
        let result = self.publisher.resume(&spec);
        self.settle_publish(result)
    }

    /// Analyze, update and publish the ready batch.
    fn trigger_batch(&mut self) -> Result<TriggerOutcome> {
        let current = load_spec(&self.paths.spec_path)
            .context("load current behavior spec before analysis")?;
        let batch = self.aggregator.batch().clone();
        let invoker = FeedbackInvoker::new(
            self.transform,
            self.aggregator.staging().clone(),
            self.paths.feedback_dir.clone(),
            self.paths.root.clone(),
            Duration::from_secs(self.config.collaborator.analysis_timeout_secs),
            self.config.collaborator.output_limit_bytes,
        );
        let report = match invoker.analyze(&batch) {
            Ok(report) => report,
            Err(err) if is_error(&err, |e| matches!(e, ReflectError::AnalysisFailure { .. })) => {
                return Ok(TriggerOutcome::AnalysisFailed);
            }
            Err(err) => return Err(err),
        };

        // The batch stays pending until the update step settles, so an I/O
        // failure below re-runs the whole batch next pass.
        let updater = SpecUpdater::new(
            self.transform,
            self.paths.spec_path.clone(),
            self.paths.work_dir.clone(),
            self.paths.root.clone(),
            Duration::from_secs(self.config.collaborator.update_timeout_secs),
            self.config.collaborator.output_limit_bytes,
        );
        let next = match updater.apply(&report, &current) {
            Ok(next) => next,
            Err(err) if is_error(&err, |e| matches!(e, ReflectError::InvalidSpec { .. })) => {
                self.aggregator.drain();
                self.persist()?;
                return Ok(TriggerOutcome::SpecRejected);
            }
            Err(err) => {
                warn!(batch_seq = batch.seq, err = %format!("{err:#}"), "spec update failed, batch kept");
                return Err(err);
            }
        };

        self.aggregator.drain();
        self.state.pending_publish = Some(next.revision);
        self.persist()?;
        let result = self.publisher.publish(&next);
        self.settle_publish(result)
    }

    fn settle_publish(&mut self, result: Result<HubRevision>) -> Result<TriggerOutcome> {
        match result {
            Ok(revision) => {
                self.state.last_revision = revision.revision;
                self.state.pending_publish = None;
                self.persist()?;
                Ok(TriggerOutcome::Published(revision))
            }
            Err(err) if is_error(&err, |e| matches!(e, ReflectError::PublishFailed { .. })) => {
                Ok(TriggerOutcome::PublishDeferred)
            }
            Err(err) => Err(err),
        }
    }

    fn persist(&mut self) -> Result<()> {
        persist_state(&self.paths.loop_state_path, &mut self.state, &self.aggregator)
    }
}

fn persist_state(
    path: &std::path::Path,
    state: &mut LoopState,
    aggregator: &Aggregator,
) -> Result<()> {
    state.batch = aggregator.batch().clone();
    write_loop_state(path, state)
}

fn is_error(err: &anyhow::Error, pred: impl Fn(&ReflectError) -> bool) -> bool {
    err.downcast_ref::<ReflectError>().is_some_and(pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::behavior_spec::{default_spec, render_spec};
    use crate::test_support::{
        JobTreeFixture, MemoryRegistry, ScriptedStep, ScriptedTransform, seed_workspace,
    };

    fn revised_spec(note: &str) -> String {
        let mut spec = default_spec();
        spec.instructions.push_str(note);
        render_spec(&spec).expect("render")
    }

    #[test]
    fn pass_below_threshold_only_batches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 3);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        tree.task("job", "a").marker("0").trajectory("t").build();
        tree.task("job", "b").marker("1").build();

        let transform = ScriptedTransform::new(Vec::new());
        let registry = MemoryRegistry::new();
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");

        assert!(outcome.triggers.is_empty());
        assert_eq!(outcome.batch_len, 1);
        assert_eq!(outcome.tally.completed, 2);
        assert!(transform.calls().is_empty());
        assert_eq!(orch.state().accounted, 2);
        assert!(outcome.summary_line().contains("batch=1/3"));
    }

    #[test]
    fn ready_batch_runs_full_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 2);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        tree.task("job", "a").marker("0").trajectory("t").build();
        tree.task("job", "b").marker("0").trajectory("t").build();

        let transform = ScriptedTransform::new(vec![
            ScriptedStep::Reply("# modes\n".to_string()),
            ScriptedStep::Reply(revised_spec(" Re-read files.")),
        ]);
        let registry = MemoryRegistry::new();
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");

        match outcome.triggers.as_slice() {
            [TriggerOutcome::Published(rev)] => {
                assert_eq!(rev.revision, 1);
                assert_eq!(rev.spec_revision, 2);
            }
            other => panic!("unexpected triggers: {other:?}"),
        }
        assert_eq!(outcome.batch_len, 0);
        assert_eq!(orch.state().last_revision, 1);
        assert_eq!(orch.state().pending_publish, None);
        assert_eq!(orch.state().batch.seq, 2);
    }

    #[test]
    fn shutdown_skips_trigger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 1);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        tree.task("job", "a").marker("0").trajectory("t").build();

        let transform = ScriptedTransform::new(Vec::new());
        let registry = MemoryRegistry::new();
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(true)).expect("pass");
        assert!(outcome.triggers.is_empty());
        assert_eq!(outcome.batch_len, 1);
        assert!(transform.calls().is_empty());
    }

    #[test]
    fn deferred_publish_is_retried_before_new_analysis() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 1);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        tree.task("job", "a").marker("0").trajectory("t").build();

        let transform = ScriptedTransform::new(vec![
            ScriptedStep::Reply("# modes\n".to_string()),
            ScriptedStep::Reply(revised_spec(" Check twice.")),
        ]);
        let registry = MemoryRegistry::new();
        registry.fail_next_push("registry offline");
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");

        let first = orch.run_pass(&AtomicBool::new(false)).expect("pass");
        assert_eq!(first.triggers, vec![TriggerOutcome::PublishDeferred]);
        assert_eq!(orch.state().pending_publish, Some(2));

        // The next batch is analyzed only after the deferred publish lands; the
        // script has no steps left, so that analysis fails and the batch stays.
        tree.task("job", "b").marker("0").trajectory("t").build();
        let second = orch.run_pass(&AtomicBool::new(false)).expect("pass");
        match second.triggers.as_slice() {
            [TriggerOutcome::Published(rev), TriggerOutcome::AnalysisFailed] => {
                assert_eq!(rev.spec_revision, 2);
            }
            other => panic!("unexpected triggers: {other:?}"),
        }
        assert_eq!(second.batch_len, 1);
        assert_eq!(orch.state().pending_publish, None);
        assert_eq!(transform.calls().len(), 3);
    }

    #[test]
    fn deferred_publish_that_already_landed_is_not_repeated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 5);
        let registry = MemoryRegistry::new();
        let spec = load_spec(&paths.spec_path).expect("spec");
        let target = RegistryTarget {
            name: config.registry.name.clone(),
            branch: config.registry.branch.clone(),
        };
        // The push went through, then the process died before recording it.
        Publisher::connect(
            &registry,
            target.clone(),
            paths.root.clone(),
            Vec::new(),
            "msg".to_string(),
            0,
        )
        .expect("connect")
        .publish(&spec)
        .expect("publish");
        let mut state = load_or_default(&paths.loop_state_path).expect("load");
        state.pending_publish = Some(spec.revision);
        write_loop_state(&paths.loop_state_path, &state).expect("write");

        let transform = ScriptedTransform::new(Vec::new());
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");

        match outcome.triggers.as_slice() {
            [TriggerOutcome::Published(rev)] => {
                assert_eq!(rev.revision, 1);
                assert_eq!(rev.spec_revision, spec.revision);
            }
            other => panic!("unexpected triggers: {other:?}"),
        }
        assert_eq!(registry.latest_revision(&target).expect("latest"), Some(1));
        assert_eq!(orch.state().pending_publish, None);
        assert_eq!(orch.state().last_revision, 1);
    }

    #[test]
    fn failed_update_keeps_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 1);
        JobTreeFixture::new(paths.jobs_dir.clone())
            .task("job", "a")
            .marker("0")
            .trajectory("t")
            .build();
        // A file where the update scratch directory should be.
        std::fs::remove_dir_all(&paths.work_dir).expect("remove work dir");
        std::fs::write(&paths.work_dir, "not a directory").expect("block work dir");

        let transform = ScriptedTransform::new(vec![ScriptedStep::Reply("# modes\n".to_string())]);
        let registry = MemoryRegistry::new();
        {
            let mut orch =
                Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
            assert!(orch.run_pass(&AtomicBool::new(false)).is_err());
            assert_eq!(orch.state().batch.len(), 1);
        }
        let persisted = load_or_default(&paths.loop_state_path).expect("load");
        assert_eq!(persisted.batch.len(), 1);
        assert_eq!(persisted.batch.seq, 1);
        assert_eq!(persisted.pending_publish, None);

        std::fs::remove_file(&paths.work_dir).expect("unblock work dir");
        transform.push(ScriptedStep::Reply("# modes\n".to_string()));
        transform.push(ScriptedStep::Reply(revised_spec(" Retry the update.")));
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("reopen");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");
        assert!(matches!(
            outcome.triggers.as_slice(),
            [TriggerOutcome::Published(_)]
        ));
        assert_eq!(outcome.batch_len, 0);
    }

    #[test]
    fn batch_triggers_at_threshold_mid_scan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 2);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        for task in ["a", "b", "c"] {
            tree.task("job", task).marker("0").trajectory("t").build();
        }

        let transform = ScriptedTransform::new(vec![
            ScriptedStep::Reply("# modes\n".to_string()),
            ScriptedStep::Reply(revised_spec(" Run the tests.")),
        ]);
        let registry = MemoryRegistry::new();
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");

        assert_eq!(outcome.triggers.len(), 1);
        assert_eq!(outcome.batch_len, 1, "third failure starts the next batch");
        assert_eq!(outcome.tally.failures, 3);
        assert_eq!(outcome.tally.total, 3);
        assert_eq!(outcome.tally.completed, 3);
        let batch = &orch.state().batch;
        assert_eq!(batch.seq, 2);
        assert_eq!(batch.entries[0].key.task_id, "c");
    }

    #[test]
    fn crash_between_mark_and_batch_is_recovered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, config) = seed_workspace(temp.path(), 10);
        let tree = JobTreeFixture::new(paths.jobs_dir.clone());
        tree.task("job", "a").marker("0").trajectory("t").build();
        tree.task("job", "b").marker("0").trajectory("t").build();

        let transform = ScriptedTransform::new(Vec::new());
        let registry = MemoryRegistry::new();
        {
            let mut orch =
                Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
            orch.run_pass(&AtomicBool::new(false)).expect("pass");
        }
        // Simulate losing the last loop state write.
        let mut state = load_or_default(&paths.loop_state_path).expect("load");
        state.batch.entries.pop();
        state.accounted = 1;
        write_loop_state(&paths.loop_state_path, &state).expect("write");

        let orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("reopen");
        assert_eq!(orch.state().accounted, 2);
        assert_eq!(orch.state().batch.len(), 2);
    }
}
