//! Integration tests for the batch consumer against a scripted transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::TimeDelta;
use futures::TryStreamExt;
use lockstep_core::{
    Batch, Clock, ConsumerSettings, DeserializeError, JsonDeserializer, PartitionAssignment, Record,
    TransportError,
};
use lockstep_runtime::{BatchConsumer, ConsumerError};
use lockstep_testing::{FixedClock, ScriptedTransport, init_tracing, json_records, test_clock};
use proptest::prelude::*;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

type TestConsumer = BatchConsumer<ScriptedTransport, JsonDeserializer<i64>, FixedClock>;

fn settings(batch_size: usize, ratio: f64) -> ConsumerSettings {
    ConsumerSettings::new("orders", "billing")
        .with_batch_size(batch_size)
        .with_poll_timeout(Duration::from_millis(250))
        .with_min_batch_fill_ratio(ratio)
}

fn consumer(settings: ConsumerSettings, transport: &ScriptedTransport) -> TestConsumer {
    BatchConsumer::new(settings, 0, transport.clone(), JsonDeserializer::new())
        .unwrap()
        .with_clock(test_clock())
}

fn assignment() -> PartitionAssignment {
    PartitionAssignment::new("orders", 0, "billing")
}

async fn collect(consumer: &mut TestConsumer, threshold: Option<u32>) -> Vec<Batch<i64>> {
    consumer.get_batches(threshold).try_collect().await.unwrap()
}

// ============================================================================
// Fill ratio
// ============================================================================

#[tokio::test]
async fn under_filled_poll_is_the_last_batch() {
    init_tracing();
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i))
        .then_poll(json_records(0, 20..23, |i| i))
        .then_poll(json_records(0, 23..33, |i| i));
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, None).await;

    let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
    assert_eq!(sizes, vec![10, 10, 3]);
    assert_eq!(transport.poll_count(), 3, "no poll after the under-filled one");
    assert_eq!(transport.remaining_polls(), 1);
    assert_eq!(batches[2].first_offset(), 20);
    assert_eq!(batches[2].last_offset(), 22);
}

#[tokio::test]
async fn empty_poll_ends_the_pass_without_a_batch() {
    let transport = ScriptedTransport::new();
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    assert!(collect(&mut consumer, None).await.is_empty());
    assert_eq!(transport.poll_count(), 1);
    assert!(consumer.pending_offsets().is_empty());
}

#[tokio::test]
async fn polls_with_configured_size_and_timeout() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..1, |i| i));
    let mut consumer = consumer(settings(25, 0.1), &transport);
    consumer.start().await.unwrap();

    collect(&mut consumer, None).await;

    assert_eq!(
        transport.poll_requests(),
        vec![(25, Duration::from_millis(250))]
    );
}

#[tokio::test]
async fn each_call_starts_a_new_pass() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..2, |i| i))
        .then_poll(json_records(0, 2..4, |i| i));
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();

    let first = collect(&mut consumer, None).await;
    let second = collect(&mut consumer, None).await;

    assert_eq!(first[0].records(), &[0, 1]);
    assert_eq!(second[0].records(), &[2, 3]);
    assert_eq!(consumer.pending_offsets().get(&assignment()), Some(4));
}

// ============================================================================
// Time threshold
// ============================================================================

#[tokio::test]
async fn threshold_keeps_only_older_records() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .with_time_offset(Some(6));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, Some(30)).await;

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].records(), &[0, 1, 2, 3, 4, 5]);
    assert_eq!(
        transport.time_lookups(),
        vec![test_clock().now() - TimeDelta::minutes(30)]
    );

    consumer.commit().await.unwrap();
    assert_eq!(transport.committed_offset(&assignment()), Some(6));
}

#[tokio::test]
async fn threshold_is_resolved_once_per_pass() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i))
        .with_time_offset(Some(100));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, Some(5)).await;

    assert_eq!(batches.len(), 2);
    assert_eq!(transport.time_lookups().len(), 1);
}

#[tokio::test]
async fn pass_ends_when_every_record_is_too_new() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i))
        .with_time_offset(Some(6));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, Some(30)).await;

    // First poll is partially kept; the second is entirely past the limit
    assert_eq!(batches.len(), 1);
    assert_eq!(transport.poll_count(), 2);
    assert_eq!(consumer.pending_offsets().get(&assignment()), Some(6));
}

#[tokio::test]
async fn no_offset_for_time_means_everything_is_old_enough() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..4, |i| i))
        .with_time_offset(None);
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, Some(60)).await;

    assert_eq!(batches[0].len(), 4);
}

#[tokio::test]
async fn fill_ratio_counts_records_before_filtering() {
    // 10 polled of 10 is a full poll even though only 2 survive the filter
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..12, |i| i))
        .with_time_offset(Some(2));
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();

    let batches = collect(&mut consumer, Some(1)).await;

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(transport.poll_count(), 2);
}

// ============================================================================
// Commit
// ============================================================================

#[tokio::test]
async fn commit_twice_is_a_no_op_the_second_time() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..3, |i| i));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();
    collect(&mut consumer, None).await;

    consumer.commit().await.unwrap();
    consumer.commit().await.unwrap();

    assert_eq!(transport.commits().len(), 1);
    assert_eq!(transport.committed_offset(&assignment()), Some(3));
    assert!(consumer.pending_offsets().is_empty());
}

#[tokio::test]
async fn nothing_is_committed_before_a_batch_is_yielded() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..3, |i| i));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    consumer.commit().await.unwrap();

    assert!(transport.commits().is_empty());
}

#[tokio::test]
async fn abandoned_batch_is_not_committed() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_poll(json_records(0, 10..20, |i| i));
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();

    {
        let mut batches = std::pin::pin!(consumer.get_batches(None));
        batches.try_next().await.unwrap().unwrap();
        batches.try_next().await.unwrap().unwrap();
        // The second batch fails to process; the stream is dropped
    }
    consumer.commit().await.unwrap();

    assert_eq!(transport.committed_offset(&assignment()), Some(10));
}

#[tokio::test]
async fn confirm_makes_the_last_batch_committable() {
    let transport = ScriptedTransport::new().then_poll(json_records(0, 0..10, |i| i));
    let mut consumer = consumer(settings(10, 0.5), &transport);
    consumer.start().await.unwrap();
    let mut pass = lockstep_runtime::BatchPass::new(None);

    consumer.next_batch(&mut pass).await.unwrap().unwrap();
    assert_eq!(pass.unconfirmed(), Some(10));
    assert!(consumer.pending_offsets().is_empty());

    consumer.confirm(&mut pass);
    consumer.confirm(&mut pass);

    assert_eq!(pass.unconfirmed(), None);
    assert_eq!(consumer.pending_offsets().get(&assignment()), Some(10));
}

#[tokio::test]
async fn failed_commit_keeps_offsets_for_retry() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..3, |i| i))
        .failing_commit(TransportError::CommitFailed("coordinator moved".into()));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();
    collect(&mut consumer, None).await;

    let err = consumer.commit().await.unwrap_err();
    assert!(matches!(err, ConsumerError::Transport(TransportError::CommitFailed(_))));
    assert_eq!(consumer.pending_offsets().get(&assignment()), Some(3));

    consumer.commit().await.unwrap();
    assert_eq!(transport.committed_offset(&assignment()), Some(3));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn undecodable_record_fails_without_advancing_the_cursor() {
    let mut records = json_records(0, 0..2, |i| i);
    records.push(Record::new(0, 2, b"not json".to_vec()));
    let transport = ScriptedTransport::new().then_poll(records);
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let err = consumer
        .get_batches(None)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Deserialize { offset: 2, source: DeserializeError::Invalid(_) }
    ));
    assert!(consumer.pending_offsets().is_empty());
}

#[tokio::test]
async fn tombstone_is_an_empty_payload_error() {
    let mut tombstone = Record::new(0, 0, Vec::new());
    tombstone.payload = None;
    let transport = ScriptedTransport::new().then_poll(vec![tombstone]);
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let err = consumer
        .get_batches(None)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Deserialize { offset: 0, source: DeserializeError::EmptyPayload { offset: 0 } }
    ));
}

#[tokio::test]
async fn poll_failure_propagates() {
    let transport = ScriptedTransport::new()
        .then_poll(json_records(0, 0..10, |i| i))
        .then_fail_poll(TransportError::PollFailed("broker unavailable".into()));
    let mut consumer = consumer(settings(10, 0.1), &transport);
    consumer.start().await.unwrap();

    let mut batches = std::pin::pin!(consumer.get_batches(None));
    assert_eq!(batches.try_next().await.unwrap().unwrap().len(), 10);
    assert!(matches!(
        batches.try_next().await,
        Err(ConsumerError::Transport(TransportError::PollFailed(_)))
    ));
}

#[tokio::test]
async fn start_failure_leaves_consumer_created() {
    let transport = ScriptedTransport::new()
        .failing_start(TransportError::ConnectionFailed("no brokers".into()));
    let mut consumer = consumer(settings(10, 0.1), &transport);

    assert!(consumer.start().await.is_err());
    assert_eq!(consumer.state(), lockstep_runtime::ConsumerState::Created);
    assert!(transport.assignment().is_none());
}

// ============================================================================
// Properties
// ============================================================================

/// Batches the consumer should yield for `polls`, and how many polls it makes.
fn expected(batch_size: usize, ratio: f64, polls: &[usize]) -> (Vec<usize>, usize) {
    let mut batches = Vec::new();
    let mut poll_count = 0;
    for &size in polls {
        poll_count += 1;
        if size == 0 {
            return (batches, poll_count);
        }
        batches.push(size);
        #[allow(clippy::cast_precision_loss)]
        let under_filled = (size as f64) < batch_size as f64 * ratio;
        if under_filled {
            return (batches, poll_count);
        }
    }
    // Script exhausted: one more poll comes back empty
    (batches, poll_count + 1)
}

proptest! {
    #[test]
    fn pass_stops_at_first_empty_or_under_filled_poll(
        batch_size in 1usize..20,
        ratio in 0.0f64..=1.0,
        fractions in prop::collection::vec(0.0f64..=1.0, 0..8),
    ) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let polls: Vec<usize> = fractions
            .iter()
            .map(|f| (f * batch_size as f64).round() as usize)
            .collect();

        let mut transport = ScriptedTransport::new();
        let mut next_offset = 0i64;
        for &size in &polls {
            let end = next_offset + i64::try_from(size).unwrap();
            transport = transport.then_poll(json_records(0, next_offset..end, |i| i));
            next_offset = end;
        }

        let (expected_batches, expected_polls) = expected(batch_size, ratio, &polls);
        let mut consumer = consumer(settings(batch_size, ratio), &transport);

        let batches = tokio_test::block_on(async {
            consumer.start().await.unwrap();
            collect(&mut consumer, None).await
        });

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        prop_assert_eq!(sizes, expected_batches);
        prop_assert_eq!(transport.poll_count(), expected_polls);
    }
}
