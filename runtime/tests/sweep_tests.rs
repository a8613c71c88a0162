//! Integration tests for multi-partition sweeps.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use lockstep_core::{Batch, ConsumerSettings, JsonDeserializer, PartitionAssignment, TransportError};
use lockstep_runtime::{DistributedLock, LockOptions, PartitionSweep, SessionError, SweepError, SweepOutcome};
use lockstep_testing::{InMemoryLeaseBackend, ScriptedTransport, init_tracing, json_records};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

fn settings() -> ConsumerSettings {
    ConsumerSettings::new("orders", "billing")
        .with_batch_size(10)
        .with_min_batch_fill_ratio(0.5)
}

fn transports() -> HashMap<i32, ScriptedTransport> {
    HashMap::from([
        (
            0,
            ScriptedTransport::new()
                .then_poll(json_records(0, 0..10, |i| i))
                .then_poll(json_records(0, 10..12, |i| i)),
        ),
        (1, ScriptedTransport::new().then_poll(json_records(1, 0..3, |i| i))),
        (2, ScriptedTransport::new()),
    ])
}

fn sweep<'a>(
    transports: &'a HashMap<i32, ScriptedTransport>,
    backend: &'a InMemoryLeaseBackend,
) -> PartitionSweep<
    JsonDeserializer<i64>,
    impl Fn(i32) -> ScriptedTransport + 'a,
    impl Fn(String) -> DistributedLock<InMemoryLeaseBackend> + 'a,
> {
    PartitionSweep::new(
        settings(),
        [0, 1, 2],
        JsonDeserializer::new(),
        move |partition| transports[&partition].clone(),
        move |key| DistributedLock::new(backend.clone(), key, LockOptions::new()),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn drains_every_partition() {
    init_tracing();
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();
    let mut seen = Vec::new();

    let outcomes = sweep(&transports, &backend)
        .run(async |batch: Batch<i64>| {
            seen.push((batch.partition(), batch.len()));
            Ok::<_, io::Error>(())
        })
        .await;

    let summary: Vec<_> = outcomes
        .iter()
        .map(|(partition, outcome)| match outcome {
            SweepOutcome::Drained { batches, records } => (*partition, *batches, *records),
            other => panic!("partition {partition} not drained: {other:?}"),
        })
        .collect();
    assert_eq!(summary, vec![(0, 2, 12), (1, 1, 3), (2, 0, 0)]);
    assert_eq!(seen, vec![(0, 10), (0, 2), (1, 3)]);

    let committed = transports[&0].committed_offset(&PartitionAssignment::new("orders", 0, "billing"));
    assert_eq!(committed, Some(12));
    for partition in 0..3 {
        assert_eq!(backend.holder(&format!("orders_partition_{partition}")), None);
    }
}

#[tokio::test(start_paused = true)]
async fn partition_owned_elsewhere_is_skipped() {
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();
    backend.steal("orders_partition_1", "other-worker", Duration::from_secs(30));

    let outcomes = sweep(&transports, &backend)
        .run(async |_: Batch<i64>| Ok::<_, io::Error>(()))
        .await;

    assert!(outcomes[0].1.is_drained());
    assert!(matches!(outcomes[1].1, SweepOutcome::Contended));
    assert!(outcomes[2].1.is_drained());
    assert_eq!(transports[&1].start_calls(), 0);
    assert_eq!(backend.holder("orders_partition_1").as_deref(), Some("other-worker"));
}

#[tokio::test(start_paused = true)]
async fn handler_failure_fails_only_that_partition() {
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();

    let outcomes = sweep(&transports, &backend)
        .run(async |batch: Batch<i64>| {
            if batch.partition() == 0 {
                Err(io::Error::other("downstream rejected batch"))
            } else {
                Ok(())
            }
        })
        .await;

    assert!(matches!(outcomes[0].1, SweepOutcome::Failed(SweepError::Handler(_))));
    assert!(outcomes[1].1.is_drained());
    assert_eq!(backend.holder("orders_partition_0"), None, "lease released after failure");
    assert_eq!(transports[&0].stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_batch_is_left_for_redelivery() {
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();
    let assignment = PartitionAssignment::new("orders", 0, "billing");

    let outcomes = sweep(&transports, &backend)
        .run(async |batch: Batch<i64>| {
            if batch.partition() == 0 && batch.first_offset() == 0 {
                Err(io::Error::other("downstream rejected batch"))
            } else {
                Ok(())
            }
        })
        .await;

    assert!(matches!(outcomes[0].1, SweepOutcome::Failed(SweepError::Handler(_))));
    assert_eq!(transports[&0].committed_offset(&assignment), None);
    assert!(transports[&0].commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn batches_before_a_rejected_one_stay_committed() {
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();
    let assignment = PartitionAssignment::new("orders", 0, "billing");

    let outcomes = sweep(&transports, &backend)
        .run(async |batch: Batch<i64>| {
            if batch.partition() == 0 && batch.first_offset() == 10 {
                Err(io::Error::other("downstream rejected batch"))
            } else {
                Ok(())
            }
        })
        .await;

    assert!(matches!(outcomes[0].1, SweepOutcome::Failed(SweepError::Handler(_))));
    assert_eq!(transports[&0].committed_offset(&assignment), Some(10));
}

#[tokio::test(start_paused = true)]
async fn start_failure_is_reported_as_failed() {
    let mut transports = transports();
    transports.insert(
        2,
        ScriptedTransport::new().failing_start(TransportError::ConnectionFailed("no brokers".into())),
    );
    let backend = InMemoryLeaseBackend::new();

    let outcomes = sweep(&transports, &backend)
        .run(async |_: Batch<i64>| Ok::<_, io::Error>(()))
        .await;

    assert!(matches!(
        outcomes[2].1,
        SweepOutcome::Failed(SweepError::Session(SessionError::ConsumerStart { .. }))
    ));
    assert_eq!(backend.holder("orders_partition_2"), None);
}

#[test]
fn invalid_settings_are_rejected_up_front() {
    let transports = transports();
    let backend = InMemoryLeaseBackend::new();
    let result = PartitionSweep::new(
        settings().with_batch_size(0),
        [0],
        JsonDeserializer::<i64>::new(),
        |partition| transports[&partition].clone(),
        |key| DistributedLock::new(backend.clone(), key, LockOptions::new()),
    );
    assert!(result.is_err());
}
