//! Crash recovery and failure-ceiling tests: stale claims must be reclaimed
//! by peers, and pathological issues must stop retrying.

mod test_harness;

use std::time::Duration;

use chrono::Utc;
use overseer::executor::Executor;
use overseer::issue::{ExecutorInstance, InstanceStatus, Status};

use test_harness::*;

/// Simulated crash: an instance registered with an hour-old heartbeat holds
/// a claim. A freshly started executor must reclaim and complete the work.
#[tokio::test]
async fn crashed_peer_claim_is_reclaimed_and_completed() {
    let env = test_env();
    let issue = env.seed_issue("Work orphaned by crash", 2);

    let dead = ExecutorInstance {
        id: "dead-peer".into(),
        hostname: "elsewhere".into(),
        pid: 12345,
        version: "0.1.0".into(),
        started_at: Utc::now() - chrono::Duration::hours(2),
        last_heartbeat: Utc::now() - chrono::Duration::hours(1),
        status: InstanceStatus::Running,
    };
    env.store.register_instance(&dead).expect("register dead peer");
    env.store
        .claim_issue(&issue.id, &dead.id)
        .expect("dead peer claims");

    // The claim is live, so the issue is not ready work yet.
    let ready = env
        .store
        .get_ready_work(&overseer::issue::WorkFilter { limit: 10 })
        .expect("ready work");
    assert!(ready.is_empty());

    // Startup reclamation runs before the new executor's first claim.
    let agent = succeeding_agent(env.dir.path());
    let executor = Executor::new(
        test_config(env.dir.path(), &agent),
        env.store.clone(),
        None,
    )
    .expect("build executor");
    executor.start().await.expect("start");

    let store = env.store.clone();
    let issue_id = issue.id.clone();
    assert_eventually(
        || {
            let store = store.clone();
            let issue_id = issue_id.clone();
            async move {
                store
                    .get_issue(&issue_id)
                    .map(|i| i.status == Status::Closed)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(10),
        "reclaimed issue should complete on the new executor",
    )
    .await;

    stop_with_timeout(&executor, Duration::from_secs(5))
        .await
        .expect("stop");

    let history = env.store.get_execution_history(&issue.id).expect("history");
    assert_eq!(history.len(), 2, "one reclaimed attempt plus one success");
    assert_eq!(history[0].success, Some(false));
    assert!(
        history[0].summary.as_deref().unwrap().contains("stale"),
        "first attempt should record the stale reclamation: {:?}",
        history[0].summary
    );
    assert_eq!(history[1].success, Some(true));

    // The dead peer was reclassified by its peer.
    let active = env.store.get_active_instances().expect("active instances");
    assert!(active.iter().all(|i| i.id != "dead-peer"));
}

/// Three consecutive failures reopen; the fourth release blocks the issue
/// with an explanatory comment instead.
#[tokio::test]
async fn consecutive_failures_block_instead_of_reopening() {
    let env = test_env();
    let issue = env.seed_issue("Pathological failing task", 2);

    let agent = failing_agent(env.dir.path());
    let executor = Executor::new(
        test_config(env.dir.path(), &agent),
        env.store.clone(),
        None,
    )
    .expect("build executor");
    executor.start().await.expect("start");

    let store = env.store.clone();
    let issue_id = issue.id.clone();
    assert_eventually(
        || {
            let store = store.clone();
            let issue_id = issue_id.clone();
            async move {
                store
                    .get_issue(&issue_id)
                    .map(|i| i.status == Status::Blocked)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(15),
        "issue should end up blocked after repeated failures",
    )
    .await;

    stop_with_timeout(&executor, Duration::from_secs(5))
        .await
        .expect("stop");

    let history = env.store.get_execution_history(&issue.id).expect("history");
    assert_eq!(
        history.len(),
        3,
        "three recorded failures before the blocking release"
    );
    assert!(history.iter().all(|a| a.success == Some(false)));

    let comments = env.store.get_comments(&issue.id, 20).expect("comments");
    assert!(
        comments
            .iter()
            .any(|c| c.body.contains("3 consecutive")),
        "blocking comment should mention the failure count: {comments:?}"
    );

    // Blocked issues are not ready work; the executor must not retry.
    let ready = env
        .store
        .get_ready_work(&overseer::issue::WorkFilter { limit: 10 })
        .expect("ready work");
    assert!(ready.is_empty());
}

/// A failure followed by a success resets the consecutive counter.
#[tokio::test]
async fn success_resets_the_failure_counter() {
    let env = test_env();
    let issue = env.seed_issue("Flaky but recoverable", 2);
    env.store
        .register_instance(&ExecutorInstance {
            id: "inst".into(),
            hostname: "host".into(),
            pid: 1,
            version: "0.1.0".into(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Running,
        })
        .expect("register instance");

    // Fail twice via the store-level release path, then succeed.
    for n in 0..2 {
        env.store.claim_issue(&issue.id, "inst").expect("claim");
        env.store
            .release_and_reopen(&issue.id, &format!("failure {n}"))
            .expect("release");
    }
    env.store.claim_issue(&issue.id, "inst").expect("claim");
    env.store
        .complete_and_close(&issue.id, "inst", "finally worked", Some(0))
        .expect("complete");

    let history = env.store.get_execution_history(&issue.id).expect("history");
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].success, Some(true));
}
