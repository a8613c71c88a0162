//! Integration tests for locked consumer sessions.
//!
//! A shared `CallLog` threads through the scripted transport and the
//! in-memory lease store, so tests can assert the exact interleaving of
//! polls, checkpoints and cleanup.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::TryStreamExt;
use lockstep_core::{
    ConsumerSettings, JsonDeserializer, LockError, Lockable, PartitionAssignment, TransportError,
};
use lockstep_runtime::{
    BatchConsumer, ConsumerError, DistributedLock, LockOptions, LockedConsumerSession,
    SessionError,
};
use lockstep_testing::{CallLog, InMemoryLeaseBackend, ScriptedTransport, init_tracing, json_records};
use std::pin::pin;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

type TestSession = LockedConsumerSession<
    ScriptedTransport,
    JsonDeserializer<i64>,
    lockstep_core::SystemClock,
    DistributedLock<InMemoryLeaseBackend>,
>;

const KEY: &str = "orders_partition_0";

fn consumer(
    transport: &ScriptedTransport,
) -> BatchConsumer<ScriptedTransport, JsonDeserializer<i64>> {
    let settings = ConsumerSettings::new("orders", "billing")
        .with_batch_size(10)
        .with_min_batch_fill_ratio(0.5);
    BatchConsumer::new(settings, 0, transport.clone(), JsonDeserializer::new()).unwrap()
}

fn lock(backend: &InMemoryLeaseBackend) -> DistributedLock<InMemoryLeaseBackend> {
    DistributedLock::new(backend.clone(), KEY, LockOptions::new())
}

async fn open(transport: &ScriptedTransport, backend: &InMemoryLeaseBackend) -> Result<TestSession, SessionError> {
    LockedConsumerSession::open(consumer(transport), |key| {
        DistributedLock::new(backend.clone(), key, LockOptions::new())
    })
    .await
}

// ============================================================================
// Entering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn open_derives_the_lock_key_from_the_partition() {
    init_tracing();
    let transport = ScriptedTransport::new();
    let backend = InMemoryLeaseBackend::new();

    let session = open(&transport, &backend).await.unwrap();

    assert_eq!(session.lock().key(), KEY);
    assert_eq!(session.assignment(), &PartitionAssignment::new("orders", 0, "billing"));
    assert_eq!(backend.holder(KEY).as_deref(), Some(session.lock().token()));
    assert_eq!(transport.start_calls(), 1);
    session.exit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_session_for_same_partition_is_contended() {
    let first_transport = ScriptedTransport::new();
    let second_transport = ScriptedTransport::new();
    let backend = InMemoryLeaseBackend::new();

    let (first, second) = tokio::join!(
        open(&first_transport, &backend),
        open(&second_transport, &backend),
    );

    let first = first.unwrap();
    let err = second.err().unwrap();
    assert!(err.is_contention());
    assert_eq!(second_transport.start_calls(), 0, "loser never starts a consumer");

    first.exit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_failure_releases_the_lease() {
    let transport = ScriptedTransport::new()
        .failing_start(TransportError::ConnectionFailed("no brokers".into()));
    let backend = InMemoryLeaseBackend::new();

    let err = open(&transport, &backend).await.err().unwrap();

    assert!(matches!(
        err,
        SessionError::ConsumerStart {
            source: ConsumerError::Transport(TransportError::ConnectionFailed(_)),
            release_error: None,
        }
    ));
    assert_eq!(backend.holder(KEY), None);

    let mut fresh = lock(&backend);
    fresh.acquire().await.unwrap();
    fresh.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_failure_reports_release_failure_too() {
    let transport = ScriptedTransport::new()
        .failing_start(TransportError::ConnectionFailed("no brokers".into()));
    let backend = InMemoryLeaseBackend::new()
        .failing_release(LockError::Backend("connection reset".into()));

    let err = open(&transport, &backend).await.err().unwrap();

    assert!(matches!(
        err,
        SessionError::ConsumerStart { release_error: Some(LockError::Backend(_)), .. }
    ));
}

// ============================================================================
// Batches and checkpoints
// ============================================================================

#[tokio::test(start_paused = true)]
async fn checkpoints_after_every_batch_and_cleans_up_in_order() {
    let log = CallLog::new();
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..13, |i| i))
        .with_call_log(log.clone());
    let backend = InMemoryLeaseBackend::new().with_call_log(log.clone());

    let mut session = open(&transport, &backend).await.unwrap();
    let sizes: Vec<usize> = session
        .get_batches(None)
        .map_ok(|batch| batch.len())
        .try_collect()
        .await
        .unwrap();
    session.exit().await.unwrap();

    assert_eq!(sizes, vec![10, 3]);
    assert_eq!(
        log.calls(),
        vec![
            "start", "poll", "extend", "commit", "poll", "extend", "commit", "stop", "release",
        ]
    );
    let assignment = PartitionAssignment::new("orders", 0, "billing");
    assert_eq!(transport.committed_offset(&assignment), Some(13));
    assert_eq!(backend.holder(KEY), None);
}

#[tokio::test(start_paused = true)]
async fn batch_is_not_committed_until_the_next_one_is_requested() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i));
    let backend = InMemoryLeaseBackend::new();
    let mut session = open(&transport, &backend).await.unwrap();

    {
        let mut batches = pin!(session.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        assert!(transport.commits().is_empty());

        batches.try_next().await.unwrap().unwrap();
        assert_eq!(transport.commits().len(), 1);
    }

    session.exit().await.unwrap();
    let assignment = PartitionAssignment::new("orders", 0, "billing");
    assert_eq!(transport.committed_offset(&assignment), Some(20));
}

#[tokio::test(start_paused = true)]
async fn lost_lease_ends_the_stream_before_committing() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i));
    let backend = InMemoryLeaseBackend::new();
    let mut session = open(&transport, &backend).await.unwrap();

    {
        let mut batches = pin!(session.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        backend.steal(KEY, "someone-else", Duration::from_secs(30));

        let err = batches.try_next().await.unwrap_err();
        assert!(matches!(err, SessionError::Lock(LockError::LeaseLost { .. })));
    }

    assert!(transport.commits().is_empty());
    assert_eq!(transport.poll_count(), 1);
    session.exit().await.unwrap();
    assert_eq!(backend.holder(KEY).as_deref(), Some("someone-else"));
}

#[tokio::test(start_paused = true)]
async fn long_running_session_keeps_the_lease_alive() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i))
        .then_poll(json_records(0, 20..30, |i| i));
    let backend = InMemoryLeaseBackend::new();
    let mut session = open(&transport, &backend).await.unwrap();

    {
        let mut batches = pin!(session.get_batches(None));
        while let Some(_batch) = batches.try_next().await.unwrap() {
            // Each batch takes most of the 10s lease
            tokio::time::advance(Duration::from_secs(8)).await;
        }
    }

    assert_eq!(backend.holder(KEY).as_deref(), Some(session.lock().token()));
    session.exit().await.unwrap();
}

// ============================================================================
// Exit
// ============================================================================

#[tokio::test(start_paused = true)]
async fn exit_leaves_an_unfinished_batch_uncommitted() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..10, |i| i));
    let backend = InMemoryLeaseBackend::new();
    let mut session = open(&transport, &backend).await.unwrap();

    {
        let mut batches = pin!(session.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        // Processing fails here, the next batch is never requested
    }
    session.exit().await.unwrap();

    assert!(transport.commits().is_empty());
    assert_eq!(transport.stop_calls(), 1);
    assert_eq!(backend.holder(KEY), None);
}

#[tokio::test(start_paused = true)]
async fn exit_commits_batches_confirmed_before_a_failed_checkpoint() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i));
    let backend = InMemoryLeaseBackend::new()
        .failing_extend(LockError::Backend("connection reset".into()));
    let mut session = open(&transport, &backend).await.unwrap();

    {
        let mut batches = pin!(session.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        let err = batches.try_next().await.unwrap_err();
        assert!(matches!(err, SessionError::Lock(LockError::Backend(_))));
    }
    assert!(transport.commits().is_empty());
    session.exit().await.unwrap();

    let assignment = PartitionAssignment::new("orders", 0, "billing");
    assert_eq!(transport.committed_offset(&assignment), Some(10));
}

#[tokio::test(start_paused = true)]
async fn exit_releases_the_lease_even_if_commit_and_stop_fail() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .failing_commit(TransportError::CommitFailed("coordinator moved".into()))
        .failing_stop(TransportError::Other("socket already closed".into()));
    let backend = InMemoryLeaseBackend::new()
        .failing_extend(LockError::Backend("connection reset".into()));
    let mut session = open(&transport, &backend).await.unwrap();

    {
        // The first batch is confirmed, then the checkpoint fails on extend
        let mut batches = pin!(session.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        batches.try_next().await.unwrap_err();
    }
    let err = session.exit().await.unwrap_err();

    let SessionError::Cleanup(failures) = err else {
        panic!("expected cleanup error");
    };
    let steps: Vec<&str> = failures.failures().iter().map(|f| f.step.as_str()).collect();
    assert_eq!(steps, vec!["commit", "stop"]);
    assert_eq!(backend.holder(KEY), None);
    assert_eq!(backend.release_calls(), 1);
}

// ============================================================================
// Scoped
// ============================================================================

#[derive(Debug)]
enum JobError {
    Session(SessionError),
    Rejected,
}

impl From<SessionError> for JobError {
    fn from(error: SessionError) -> Self {
        Self::Session(error)
    }
}

#[tokio::test(start_paused = true)]
async fn scoped_runs_body_and_exits() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..4, |i| i));
    let backend = InMemoryLeaseBackend::new();

    let total = LockedConsumerSession::scoped(
        consumer(&transport),
        lock(&backend),
        async |session: &mut TestSession| {
            let mut sum = 0;
            let mut batches = pin!(session.get_batches(None));
            while let Some(batch) = batches.try_next().await? {
                sum += batch.iter().sum::<i64>();
            }
            Ok::<_, JobError>(sum)
        },
    )
    .await
    .unwrap();

    assert_eq!(total, 6);
    assert_eq!(backend.holder(KEY), None);
    assert_eq!(transport.stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scoped_returns_body_error_after_cleanup() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..4, |i| i));
    let backend = InMemoryLeaseBackend::new();

    let result = LockedConsumerSession::scoped(
        consumer(&transport),
        lock(&backend),
        async |_: &mut TestSession| Err::<(), _>(JobError::Rejected),
    )
    .await;

    assert!(matches!(result, Err(JobError::Rejected)));
    assert_eq!(backend.holder(KEY), None);
    assert_eq!(transport.stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scoped_surfaces_contention_without_running_body() {
    let transport = ScriptedTransport::new();
    let backend = InMemoryLeaseBackend::new();
    backend.steal(KEY, "someone-else", Duration::from_secs(30));
    let mut ran = false;

    let result = LockedConsumerSession::scoped(
        consumer(&transport),
        lock(&backend),
        async |_: &mut TestSession| {
            ran = true;
            Ok::<_, JobError>(())
        },
    )
    .await;

    assert!(matches!(result, Err(JobError::Session(ref e)) if e.is_contention()));
    assert!(!ran);
    assert_eq!(transport.start_calls(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancelled_session_releases_its_lease() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..10, |i| i));
    let backend = InMemoryLeaseBackend::new();

    let run = LockedConsumerSession::scoped(
        consumer(&transport),
        lock(&backend),
        async |session: &mut TestSession| {
            let mut batches = pin!(session.get_batches(None));
            batches.try_next().await?;
            std::future::pending::<()>().await;
            Ok::<_, JobError>(())
        },
    );
    let timed_out = tokio::time::timeout(Duration::from_secs(1), run).await;

    assert!(timed_out.is_err());
    assert_eq!(transport.start_calls(), 1);
    assert_eq!(transport.poll_count(), 1);
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(backend.holder(KEY), None);
    assert!(transport.commits().is_empty(), "unfinished batch stays uncommitted");
}
