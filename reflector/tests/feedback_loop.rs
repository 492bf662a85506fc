//! End-to-end reflection scenarios driven through the orchestrator.
//!
//! Each test seeds a workspace in a temp dir, writes a job tree the way the
//! benchmark engine does, and runs passes with a scripted collaborator.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use reflector::core::behavior_spec::{default_spec, render_spec};
use reflector::cycle::{Orchestrator, TriggerOutcome};
use reflector::error::ReflectError;
use reflector::io::processed::read_records;
use reflector::io::config::RegistryBackend;
use reflector::io::registry::{DirRegistry, Registry, RegistryTarget, open_registry};
use reflector::io::spec_store::load_spec;
use reflector::looping::{LoopStop, RunMode, run_loop};
use reflector::test_support::{
    JobTreeFixture, MemoryRegistry, ScriptedStep, ScriptedTransform, seed_workspace,
};

fn revised_spec(revision_note: &str) -> String {
    let mut spec = default_spec();
    spec.instructions.push_str(revision_note);
    render_spec(&spec).expect("render")
}

fn target() -> RegistryTarget {
    RegistryTarget {
        name: "nanocode".to_string(),
        branch: "prod".to_string(),
    }
}

/// Two batches through a directory registry:
///
/// 1. Pass 1: failures a, b reach threshold 2 → analyze, update, publish rev 1.
/// 2. Pass 2: failures c, d → publish rev 2.
///
/// The pulled spec matches the canonical spec file byte for byte.
#[test]
fn batches_publish_monotonic_revisions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 2);
    let tree = JobTreeFixture::new(paths.jobs_dir.clone());
    tree.task("job-1", "a")
        .marker("0")
        .trajectory("ran ls")
        .test_output("FAILED test_a")
        .build();
    tree.task("job-1", "b").marker("0").trajectory("ran cat").build();
    tree.task("job-1", "ok").marker("1").build();

    let transform = ScriptedTransform::new(vec![
        ScriptedStep::Reply("# Failure modes\n- skipped tests\n".to_string()),
        ScriptedStep::Reply(revised_spec(" Run the tests before finishing.")),
    ]);
    let registry = DirRegistry::new(paths.registry_dir.clone());
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");

    let first = orch.run_pass(&AtomicBool::new(false)).expect("pass 1");
    let rev1 = match first.triggers.as_slice() {
        [TriggerOutcome::Published(rev)] => rev.clone(),
        other => panic!("unexpected triggers: {other:?}"),
    };
    assert_eq!(rev1.revision, 1);

    let staged = paths.staging_dir.join("job-1").join("a");
    assert_eq!(
        fs::read_to_string(staged.join("trajectory.txt")).expect("trajectory"),
        "ran ls"
    );
    assert_eq!(
        fs::read_to_string(staged.join("test-case-result.txt")).expect("test result"),
        "FAILED test_a"
    );
    assert!(paths.staging_dir.join("job-1").join("FEEDBACK.md").exists());

    let pulled = registry.pull(&target()).expect("pull").expect("revision");
    let on_disk = fs::read_to_string(&paths.spec_path).expect("read spec");
    assert_eq!(pulled.spec_toml, on_disk);
    assert_eq!(pulled.manifest.spec_revision, 2);

    tree.task("job-2", "c").marker("0").trajectory("t").build();
    tree.task("job-2", "d").marker("0").trajectory("t").build();
    transform.push(ScriptedStep::Reply("# More modes\n".to_string()));
    transform.push(ScriptedStep::Reply(revised_spec(" Read errors fully.")));

    let second = orch.run_pass(&AtomicBool::new(false)).expect("pass 2");
    match second.triggers.as_slice() {
        [TriggerOutcome::Published(rev)] => {
            assert_eq!(rev.revision, rev1.revision + 1);
            assert_eq!(rev.spec_revision, 3);
        }
        other => panic!("unexpected triggers: {other:?}"),
    }
    assert_eq!(registry.latest_revision(&target()).expect("latest"), Some(2));
    assert_eq!(load_spec(&paths.spec_path).expect("spec").revision, 3);
}

#[test]
fn restart_classifies_each_task_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 100);
    let tree = JobTreeFixture::new(paths.jobs_dir.clone());
    tree.task("job", "a").marker("0").trajectory("t").build();
    tree.task("job", "b").marker("1").build();
    tree.task("job", "c").build();

    let transform = ScriptedTransform::new(Vec::new());
    let registry = MemoryRegistry::new();
    {
        let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
        let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");
        assert_eq!(outcome.tally.newly_classified, 2);
        assert_eq!(outcome.tally.incomplete, 1);

        let again = orch.run_pass(&AtomicBool::new(false)).expect("second pass");
        assert_eq!(again.tally.newly_classified, 0);
    }

    // Task c finishes while the orchestrator is down.
    tree.task("job", "c").marker("0").trajectory("t").build();

    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("reopen");
    let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");
    assert_eq!(outcome.tally.newly_classified, 1);
    assert_eq!(outcome.batch_len, 2);
    drop(orch);

    let records = read_records(&paths.processed_log_path).expect("records");
    let unique: HashSet<_> = records.iter().map(|r| r.key.clone()).collect();
    assert_eq!(records.len(), 3);
    assert_eq!(unique.len(), 3);
}

#[test]
fn analysis_failure_keeps_batch_for_next_pass() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 1);
    let tree = JobTreeFixture::new(paths.jobs_dir.clone());
    tree.task("job", "a").marker("0").trajectory("t").build();

    let transform = ScriptedTransform::new(vec![ScriptedStep::Fail(
        "collaborator crashed".to_string(),
    )]);
    let registry = MemoryRegistry::new();
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");

    let failed = orch.run_pass(&AtomicBool::new(false)).expect("pass");
    assert_eq!(failed.triggers, vec![TriggerOutcome::AnalysisFailed]);
    assert_eq!(failed.batch_len, 1);
    assert_eq!(orch.state().batch.seq, 1);

    transform.push(ScriptedStep::Reply("# modes\n".to_string()));
    transform.push(ScriptedStep::Reply(revised_spec(" Retry.")));
    let retried = orch.run_pass(&AtomicBool::new(false)).expect("retry");
    assert!(matches!(
        retried.triggers.as_slice(),
        [TriggerOutcome::Published(_)]
    ));
    assert_eq!(retried.batch_len, 0);
    assert!(paths.feedback_dir.join("batch-1.md").exists());
}

#[test]
fn rejected_spec_leaves_file_and_registry_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 1);
    JobTreeFixture::new(paths.jobs_dir.clone())
        .task("job", "a")
        .marker("0")
        .trajectory("t")
        .build();
    let before = fs::read(&paths.spec_path).expect("read spec");

    let mut renamed = default_spec();
    renamed.name = "SomethingElse".to_string();
    let transform = ScriptedTransform::new(vec![
        ScriptedStep::Reply("# modes\n".to_string()),
        ScriptedStep::Reply(render_spec(&renamed).expect("render")),
    ]);
    let registry = MemoryRegistry::new();
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");

    let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");
    assert_eq!(outcome.triggers, vec![TriggerOutcome::SpecRejected]);
    assert_eq!(fs::read(&paths.spec_path).expect("reread"), before);
    assert!(registry.revisions(&target()).is_empty());
    assert_eq!(orch.state().pending_publish, None);
}

#[test]
fn foreign_revision_halts_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 1);
    JobTreeFixture::new(paths.jobs_dir.clone())
        .task("job", "a")
        .marker("0")
        .trajectory("t")
        .build();

    let transform = ScriptedTransform::new(vec![
        ScriptedStep::Reply("# modes\n".to_string()),
        ScriptedStep::Reply(revised_spec(" Be careful.")),
    ]);
    let registry = MemoryRegistry::new();
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
    // Another publisher lands a revision after we connected.
    registry.inject_foreign_push(&target());

    let outcome =
        run_loop(&mut orch, RunMode::OneShot, &AtomicBool::new(false), |_| {}).expect("loop");
    match outcome.stop {
        LoopStop::Halted { reason } => assert!(reason.contains("revision"), "{reason}"),
        other => panic!("expected halt, got {other:?}"),
    }
}

#[test]
fn second_orchestrator_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 5);
    let transform = ScriptedTransform::new(Vec::new());
    let registry = MemoryRegistry::new();

    let _first = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
    let err = match Orchestrator::open(&paths, &config, &transform, &registry) {
        Ok(_) => panic!("second writer must be rejected"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ReflectError>(),
        Some(ReflectError::ConcurrentWriter { .. })
    ));
}

/// Markers `5 0 0 3 0 0 0 0 0 0 abc` with threshold 6: nine failures, one
/// unparseable marker. The first six failures trigger; three start batch 2.
#[test]
fn marker_sequence_batches_at_threshold() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, config) = seed_workspace(temp.path(), 6);
    let tree = JobTreeFixture::new(paths.jobs_dir.clone());
    let markers = ["5", "0", "0", "3", "0", "0", "0", "0", "0", "0", "abc"];
    for (idx, marker) in markers.iter().enumerate() {
        tree.task("job", &format!("task-{idx:02}"))
            .marker(marker)
            .trajectory("t")
            .build();
    }

    let transform = ScriptedTransform::new(vec![
        ScriptedStep::Reply("# modes\n".to_string()),
        ScriptedStep::Reply(revised_spec(" Slow down.")),
    ]);
    let registry = MemoryRegistry::new();
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");
    let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");

    assert_eq!(outcome.triggers.len(), 1);
    assert_eq!(outcome.tally.failures, 9);
    assert_eq!(outcome.tally.incomplete, 1);
    assert_eq!(outcome.batch_len, 3);
    assert_eq!(orch.state().batch.seq, 2);
    let analysis = &transform.calls()[0];
    assert!(analysis.instruction.contains("6 failed task(s)"));
}

/// A hub push that hangs past `publish_timeout_secs` is deferred, not fatal:
/// the accepted spec stays on disk and is published on a later pass.
#[cfg(unix)]
#[test]
fn hung_hub_push_is_deferred() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (paths, mut config) = seed_workspace(temp.path(), 1);
    config.registry.backend = RegistryBackend::Command;
    config.registry.push_command = vec!["sh".into(), "-c".into(), "sleep 8".into()];
    config.registry.pull_command = vec!["true".into()];
    config.registry.publish_timeout_secs = 1;
    JobTreeFixture::new(paths.jobs_dir.clone())
        .task("job", "a")
        .marker("0")
        .trajectory("t")
        .build();

    let transform = ScriptedTransform::new(vec![
        ScriptedStep::Reply("# modes\n".to_string()),
        ScriptedStep::Reply(revised_spec(" Wait for the hub.")),
    ]);
    let registry = open_registry(&paths, &config).expect("registry");
    let mut orch = Orchestrator::open(&paths, &config, &transform, &registry).expect("open");

    let started = Instant::now();
    let outcome = orch.run_pass(&AtomicBool::new(false)).expect("pass");
    assert!(started.elapsed() < Duration::from_secs(6), "{:?}", started.elapsed());
    assert_eq!(outcome.triggers, vec![TriggerOutcome::PublishDeferred]);
    assert_eq!(outcome.batch_len, 0);
    assert_eq!(orch.state().pending_publish, Some(2));
    assert_eq!(load_spec(&paths.spec_path).expect("spec").revision, 2);
}
