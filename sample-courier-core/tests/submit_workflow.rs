use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sample_courier_core::contract::{MockRemoteService, ScanOptions, Session};
use sample_courier_core::dispatch::{
    DispatchConfig, DispatchError, Dispatcher, FailurePolicy, Outcome,
};
use sample_courier_core::identity::hash;
use sample_courier_core::targets::{local_targets, Target};
use sample_courier_core::workflow::{RescanWorkflow, SubmitWorkflow};
use sample_courier_core::{Error, ObjectKey};
use tempfile::tempdir;

fn write_samples(dir: &Path, samples: &[(&str, &str)]) -> Vec<PathBuf> {
    samples
        .iter()
        .map(|(name, body)| {
            let path = dir.join(name);
            std::fs::write(&path, body).expect("write sample");
            path
        })
        .collect()
}

fn sequential() -> Dispatcher {
    Dispatcher::new(DispatchConfig::sequential(Duration::ZERO))
}

/// H1 (a.bin) is already known, H2 (b.bin) is not.
fn remote_knowing(known: ObjectKey) -> MockRemoteService {
    let mut remote = MockRemoteService::new();
    remote
        .expect_exists()
        .returning(move |key| Ok(*key == known));
    remote
}

#[tokio::test]
async fn uploads_only_the_unknown_file_without_force() {
    let dir = tempdir().expect("tempdir");
    write_samples(dir.path(), &[("a.bin", "alpha"), ("b.bin", "bravo")]);

    let mut remote = remote_knowing(hash(b"alpha"));
    remote
        .expect_submit()
        .withf(|path, _, _| path.ends_with("b.bin"))
        .times(1)
        .returning(|_, _, _| Ok("{}".to_string()));
    remote.expect_rescan().never();

    let workflow = SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("token"),
        false,
        ScanOptions::default(),
    );
    let targets = local_targets(dir.path()).expect("targets");
    let report = sequential()
        .run(targets, Arc::new(workflow))
        .await
        .expect("batch should succeed");

    let outcomes: Vec<&Outcome> = report.completed.iter().map(|(_, o)| o).collect();
    assert_eq!(
        outcomes,
        vec![
            &Outcome::Skipped(hash(b"alpha")),
            &Outcome::Uploaded(hash(b"bravo")),
        ]
    );
}

#[tokio::test]
async fn force_rescans_the_known_file_and_uploads_the_other() {
    let dir = tempdir().expect("tempdir");
    write_samples(dir.path(), &[("a.bin", "alpha"), ("b.bin", "bravo")]);

    let h1 = hash(b"alpha");
    let mut remote = remote_knowing(h1.clone());
    remote
        .expect_rescan()
        .withf(move |key, _, _| key.as_str() == h1.as_str())
        .times(1)
        .returning(|_, _, _| Ok(()));
    remote
        .expect_submit()
        .withf(|path, _, _| path.ends_with("b.bin"))
        .times(1)
        .returning(|_, _, _| Ok("{}".to_string()));

    let workflow = SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("token"),
        true,
        ScanOptions::default(),
    );
    let report = sequential()
        .run(local_targets(dir.path()).expect("targets"), Arc::new(workflow))
        .await
        .expect("batch should succeed");

    assert_eq!(report.count(|o| matches!(o, Outcome::Rescanned(_))), 1);
    assert_eq!(report.count(|o| matches!(o, Outcome::Uploaded(_))), 1);
}

#[tokio::test]
async fn submitting_the_same_file_twice_uploads_once() {
    let dir = tempdir().expect("tempdir");
    let paths = write_samples(dir.path(), &[("same.bin", "same bytes")]);

    // Remote remembers what it has been sent.
    let seen: Arc<Mutex<HashSet<ObjectKey>>> = Arc::default();
    let mut remote = MockRemoteService::new();
    let lookup = seen.clone();
    remote
        .expect_exists()
        .returning(move |key| Ok(lookup.lock().unwrap().contains(key)));
    let record = seen.clone();
    remote
        .expect_submit()
        .times(1)
        .returning(move |path, _, _| {
            let body = std::fs::read(path).unwrap();
            record.lock().unwrap().insert(hash(&body));
            Ok("{}".to_string())
        });

    let workflow = Arc::new(SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("token"),
        false,
        ScanOptions::default(),
    ));
    let target = vec![Target::Local(paths[0].clone())];
    let first = sequential()
        .run(target.clone(), workflow.clone())
        .await
        .expect("first run");
    let second = sequential()
        .run(target, workflow)
        .await
        .expect("second run");

    assert_eq!(first.completed[0].1, Outcome::Uploaded(hash(b"same bytes")));
    assert_eq!(second.completed[0].1, Outcome::Skipped(hash(b"same bytes")));
}

#[tokio::test]
async fn known_sample_without_force_makes_no_mutating_calls() {
    let dir = tempdir().expect("tempdir");
    write_samples(dir.path(), &[("known.bin", "known")]);

    let mut remote = remote_knowing(hash(b"known"));
    remote.expect_submit().never();
    remote.expect_rescan().never();
    remote.expect_delete().never();

    let workflow = SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("token"),
        false,
        ScanOptions::default(),
    );
    let report = sequential()
        .run(local_targets(dir.path()).expect("targets"), Arc::new(workflow))
        .await
        .expect("batch should succeed");
    assert!(report.is_success());
    assert_eq!(report.count(|o| matches!(o, Outcome::Skipped(_))), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_batch_drains_every_task() {
    let dir = tempdir().expect("tempdir");
    for i in 0..16 {
        std::fs::write(dir.path().join(format!("{i:02}.bin")), format!("sample {i}"))
            .expect("write sample");
    }

    let mut remote = MockRemoteService::new();
    remote.expect_exists().returning(|_| Ok(false));
    remote
        .expect_submit()
        .times(16)
        .returning(|_, _, _| Ok("{}".to_string()));

    let workflow = SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("token"),
        false,
        ScanOptions::default(),
    );
    let dispatcher = Dispatcher::new(DispatchConfig::parallel(4, Duration::from_millis(5)));
    let report = dispatcher
        .run(local_targets(dir.path()).expect("targets"), Arc::new(workflow))
        .await
        .expect("batch should succeed");

    assert_eq!(report.completed.len(), 16);
    let keys: HashSet<&ObjectKey> = report.completed.iter().map(|(_, o)| o.key()).collect();
    assert_eq!(keys.len(), 16, "every sample is reported exactly once");
}

#[tokio::test]
async fn fail_fast_reports_the_failing_key_and_stops() {
    let good = hash(b"good");
    let bad = hash(b"bad");
    let never = hash(b"never");

    let mut remote = MockRemoteService::new();
    let failing = bad.clone();
    remote.expect_rescan().times(2).returning(move |key, _, _| {
        if *key == failing {
            Err(Error::BackendUnavailable("rescan rejected".into()))
        } else {
            Ok(())
        }
    });

    let workflow = RescanWorkflow::new(Arc::new(remote), Session::new("t"), ScanOptions::default());
    let err = sequential()
        .run(
            vec![good.into(), bad.clone().into(), never.into()],
            Arc::new(workflow),
        )
        .await
        .expect_err("batch should abort");

    match err {
        DispatchError::Item { target, source, .. } => {
            assert_eq!(target, Target::Remote(bad));
            assert!(matches!(source, Error::BackendUnavailable(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collect_policy_reports_every_failure() {
    let keys: Vec<ObjectKey> = (0..6).map(|i| hash(format!("k{i}").as_bytes())).collect();
    let odd: HashSet<ObjectKey> = keys.iter().skip(1).step_by(2).cloned().collect();

    let mut remote = MockRemoteService::new();
    let failing = odd.clone();
    remote.expect_rescan().times(6).returning(move |key, _, _| {
        if failing.contains(key) {
            Err(Error::NotFound(key.to_string()))
        } else {
            Ok(())
        }
    });

    let workflow = RescanWorkflow::new(Arc::new(remote), Session::new("t"), ScanOptions::default());
    let config = DispatchConfig::parallel(3, Duration::ZERO).with_failure_policy(FailurePolicy::Collect);
    let report = Dispatcher::new(config)
        .run(keys.into_iter().map(Target::from).collect(), Arc::new(workflow))
        .await
        .expect("collect never aborts");

    assert_eq!(report.completed.len(), 3);
    assert_eq!(report.failures.len(), 3);
    for failure in &report.failures {
        match &failure.target {
            Target::Remote(key) => assert!(odd.contains(key)),
            other => panic!("unexpected target {other}"),
        }
        assert!(failure.error.is_not_found());
    }
}

#[tokio::test]
async fn unknown_bare_key_cannot_be_submitted() {
    let mut remote = MockRemoteService::new();
    remote.expect_exists().returning(|_| Ok(false));
    remote.expect_submit().never();

    let workflow = SubmitWorkflow::new(
        Arc::new(remote),
        Session::new("t"),
        false,
        ScanOptions::default(),
    );
    let err = sequential()
        .run(vec![hash(b"x").into()], Arc::new(workflow))
        .await
        .expect_err("bare key has no bytes to upload");
    assert!(matches!(
        err,
        DispatchError::Item {
            source: Error::NotFound(_),
            ..
        }
    ));
}
