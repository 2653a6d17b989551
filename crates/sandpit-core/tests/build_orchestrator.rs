#![cfg(unix)]

mod common;

use common::{request, Harness, FAKE_COMPILER};
use futures_util::future::join_all;
use sandpit_core::{BuildError, BuildRequest, EntryState, Fingerprint};
use std::time::{Duration, Instant};

const HELLO: &str = "package main\nfunc main(){}";
const BROKEN: &str = "package main\nfunc main(){ x }";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_share_one_build() {
    let harness = Harness::new(&format!("sleep 0.3; {}", FAKE_COMPILER)).await;

    let calls = (0..8).map(|_| {
        let orchestrator = harness.orchestrator.clone();
        async move {
            orchestrator
                .execute(request(HELLO, Duration::from_secs(10)))
                .await
        }
    });
    let results: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(harness.invocations(), 1);
    assert_eq!(results.iter().filter(|r| !r.from_cache).count(), 1);
    for result in &results {
        assert_eq!(result.exit_status, 0);
        assert_eq!(result.fingerprint, results[0].fingerprint);
        assert_eq!(result.stdout, results[0].stdout);
    }
    assert_eq!(harness.orchestrator.stats().await.builds_spawned, 1);
}

#[tokio::test]
async fn example_scenario() {
    let harness = Harness::new(FAKE_COMPILER).await;
    let orchestrator = &harness.orchestrator;

    let first = orchestrator
        .execute(request(HELLO, Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(first.exit_status, 0);
    assert!(!first.from_cache);

    let second = orchestrator
        .execute(request(HELLO, Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(second.exit_status, 0);
    assert!(second.from_cache);
    assert_eq!(harness.invocations(), 1);

    let failed = orchestrator
        .execute(request(BROKEN, Duration::from_secs(10)))
        .await
        .unwrap();
    assert_ne!(failed.exit_status, 0);
    assert!(failed.stderr.contains("undefined: x"));
    assert!(!failed.from_cache);

    let failed_again = orchestrator
        .execute(request(BROKEN, Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(failed_again.from_cache);
    assert_eq!(failed_again.exit_status, failed.exit_status);
    assert_eq!(failed_again.stderr, failed.stderr);
    assert_eq!(harness.invocations(), 2);

    let stats = orchestrator.stats().await;
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.compile_failures, 1);
    assert_eq!(stats.entries, 2);
}

#[tokio::test]
async fn one_byte_or_toolchain_change_builds_independently() {
    let harness = Harness::with_config(FAKE_COMPILER, |config| {
        let tip = config.toolchains["stable"].clone();
        config.toolchains.insert("tip".to_string(), tip);
    })
    .await;
    let orchestrator = &harness.orchestrator;

    let a = orchestrator
        .execute(request(HELLO, Duration::from_secs(10)))
        .await
        .unwrap();
    let b = orchestrator
        .execute(request(&format!("{} ", HELLO), Duration::from_secs(10)))
        .await
        .unwrap();
    let c = orchestrator
        .execute(BuildRequest::new(HELLO, "tip", Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(!a.from_cache && !b.from_cache && !c.from_cache);
    assert_ne!(a.fingerprint, b.fingerprint);
    assert_ne!(a.fingerprint, c.fingerprint);
    assert_eq!(harness.invocations(), 3);
}

#[tokio::test]
async fn build_past_deadline_times_out_and_is_retried() {
    // Only the first invocation hangs.
    let harness = Harness::new(&format!(
        "if [ \"$(wc -l < \"$COUNT_FILE\")\" -lt 2 ]; then sleep 5; fi; {}",
        FAKE_COMPILER
    ))
    .await;
    let orchestrator = &harness.orchestrator;

    let started = Instant::now();
    let err = orchestrator
        .execute(request(HELLO, Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(3));

    // The owner task kills the child at the same deadline and fails the entry.
    let fingerprint = Fingerprint::compute(HELLO, "stable", &[]);
    let mut settled = false;
    for _ in 0..200 {
        let lease = harness.store().attach(&fingerprint).await.unwrap();
        if lease.state().is_terminal() {
            assert!(matches!(lease.state(), EntryState::Failed(_)));
            settled = true;
            break;
        }
        drop(lease);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled);

    let retried = orchestrator
        .execute(request(HELLO, Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(retried.exit_status, 0);
    assert!(!retried.from_cache);
    assert_eq!(harness.invocations(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_never_sees_partial_output() {
    let harness = Harness::new(&format!("sleep 0.5; {}", FAKE_COMPILER)).await;
    let orchestrator = harness.orchestrator.clone();
    let build = tokio::spawn(async move {
        orchestrator
            .execute(request(HELLO, Duration::from_secs(10)))
            .await
    });

    let fingerprint = Fingerprint::compute(HELLO, "stable", &[]);
    let lease = loop {
        if let Some(lease) = harness.store().attach(&fingerprint).await {
            break lease;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(matches!(lease.state(), EntryState::Reserved));
    assert!(lease.artifact_path().is_none());
    assert!(!harness
        .store()
        .root()
        .join(fingerprint.as_str())
        .join("output")
        .exists());

    build.await.unwrap().unwrap();
    let path = lease.artifact_path().expect("ready after build");
    assert_eq!(std::fs::read_to_string(path).unwrap(), HELLO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_ceiling_is_never_exceeded() {
    let harness = Harness::with_config(&format!("sleep 0.2; {}", FAKE_COMPILER), |config| {
        config.max_concurrent_builds = 2;
    })
    .await;

    let calls = (0..6).map(|i| {
        let orchestrator = harness.orchestrator.clone();
        async move {
            orchestrator
                .execute(request(&format!("{}\n// {}", HELLO, i), Duration::from_secs(20)))
                .await
        }
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap().exit_status, 0);
    }

    let stats = harness.orchestrator.stats().await;
    assert_eq!(stats.builds_spawned, 6);
    assert!(stats.peak_active_builds <= 2);
    assert_eq!(stats.active_builds, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_request_respects_its_deadline() {
    let harness = Harness::with_config(&format!("sleep 2; {}", FAKE_COMPILER), |config| {
        config.max_concurrent_builds = 1;
    })
    .await;

    let orchestrator = harness.orchestrator.clone();
    let long = tokio::spawn(async move {
        orchestrator
            .execute(request(HELLO, Duration::from_secs(20)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let err = harness
        .orchestrator
        .execute(request("package other", Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(long.await.unwrap().unwrap().exit_status, 0);
    assert_eq!(harness.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn impatient_waiter_does_not_cancel_the_build() {
    let harness = Harness::new(&format!("sleep 0.8; {}", FAKE_COMPILER)).await;

    let orchestrator = harness.orchestrator.clone();
    let owner = tokio::spawn(async move {
        orchestrator
            .execute(request(HELLO, Duration::from_secs(20)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let started = Instant::now();
    let err = harness
        .orchestrator
        .execute(request(HELLO, Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(700));

    let built = owner.await.unwrap().unwrap();
    assert_eq!(built.exit_status, 0);
    assert!(!built.from_cache);

    let cached = harness
        .orchestrator
        .execute(request(HELLO, Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.fingerprint, built.fingerprint);
    assert_eq!(harness.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_builds_after_grace() {
    let harness = Harness::new(&format!("sleep 30; {}", FAKE_COMPILER)).await;
    let orchestrator = harness.orchestrator.clone();
    let stuck = tokio::spawn(async move {
        orchestrator
            .execute(request(HELLO, Duration::from_secs(60)))
            .await
    });
    while harness.invocations() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    harness
        .orchestrator
        .shutdown(Duration::from_millis(200))
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = tokio::time::timeout(Duration::from_secs(5), stuck)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(BuildError::Internal)));
    assert!(matches!(
        harness
            .orchestrator
            .execute(request(HELLO, Duration::from_secs(1)))
            .await,
        Err(BuildError::Rejected(_))
    ));
}
