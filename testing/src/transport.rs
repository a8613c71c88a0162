//! Scripted in-memory partition transport.

use crate::CallLog;
use chrono::{DateTime, Utc};
use lockstep_core::{OffsetCursor, PartitionAssignment, PartitionTransport, Record, TransportError};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build JSON records for `offsets` on `partition`, payloads produced by `payload`.
///
/// # Example
///
/// ```
/// use lockstep_testing::json_records;
///
/// let records = json_records(2, 5..8, |offset| serde_json::json!({ "id": offset }));
/// assert_eq!(records.len(), 3);
/// assert_eq!(records[0].offset, 5);
/// assert_eq!(records[0].partition, 2);
/// ```
pub fn json_records<T, F>(partition: i32, offsets: Range<i64>, payload: F) -> Vec<Record>
where
    T: Serialize,
    F: Fn(i64) -> T,
{
    offsets
        .map(|offset| Record::new(partition, offset, serde_json::to_vec(&payload(offset)).unwrap()))
        .collect()
}

#[derive(Default)]
struct State {
    polls: VecDeque<Result<Vec<Record>, TransportError>>,
    poll_requests: Vec<(usize, Duration)>,
    time_offset: Option<i64>,
    time_lookups: Vec<DateTime<Utc>>,
    commits: Vec<OffsetCursor>,
    assignment: Option<PartitionAssignment>,
    start_calls: usize,
    stop_calls: usize,
    fail_start: Option<TransportError>,
    fail_commit: Option<TransportError>,
    fail_stop: Option<TransportError>,
    call_log: Option<CallLog>,
}

impl State {
    fn log(&self, call: &str) {
        if let Some(log) = &self.call_log {
            log.push(call);
        }
    }
}

/// Transport that replays a fixed script of poll results.
///
/// Once the script is exhausted every poll returns no records. Clones share
/// state, so a test can keep one handle for assertions while a consumer owns
/// another.
///
/// # Example
///
/// ```
/// use lockstep_testing::{ScriptedTransport, json_records};
///
/// let transport = ScriptedTransport::new()
///     .then_poll(json_records(0, 0..10, |i| i))
///     .then_poll(json_records(0, 10..13, |i| i));
/// let handle = transport.clone();
/// assert_eq!(handle.remaining_polls(), 2);
/// assert_eq!(handle.poll_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    /// Create a transport with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a successful poll returning `records`.
    #[must_use]
    pub fn then_poll(self, records: Vec<Record>) -> Self {
        self.state.lock().unwrap().polls.push_back(Ok(records));
        self
    }

    /// Append a failing poll.
    #[must_use]
    pub fn then_fail_poll(self, error: TransportError) -> Self {
        self.state.lock().unwrap().polls.push_back(Err(error));
        self
    }

    /// Answer every time-to-offset lookup with `offset`.
    #[must_use]
    pub fn with_time_offset(self, offset: Option<i64>) -> Self {
        self.state.lock().unwrap().time_offset = offset;
        self
    }

    /// Make every `start` fail with `error`.
    #[must_use]
    pub fn failing_start(self, error: TransportError) -> Self {
        self.state.lock().unwrap().fail_start = Some(error);
        self
    }

    /// Make the next `commit` fail with `error`.
    #[must_use]
    pub fn failing_commit(self, error: TransportError) -> Self {
        self.state.lock().unwrap().fail_commit = Some(error);
        self
    }

    /// Make the next `stop` fail with `error`.
    #[must_use]
    pub fn failing_stop(self, error: TransportError) -> Self {
        self.state.lock().unwrap().fail_stop = Some(error);
        self
    }

    /// Log `start`, `poll`, `commit` and `stop` calls into `log`.
    #[must_use]
    pub fn with_call_log(self, log: CallLog) -> Self {
        self.state.lock().unwrap().call_log = Some(log);
        self
    }

    /// Number of polls performed.
    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().poll_requests.len()
    }

    /// `(max_records, timeout)` of every poll performed.
    #[must_use]
    pub fn poll_requests(&self) -> Vec<(usize, Duration)> {
        self.state.lock().unwrap().poll_requests.clone()
    }

    /// Scripted polls not yet consumed.
    #[must_use]
    pub fn remaining_polls(&self) -> usize {
        self.state.lock().unwrap().polls.len()
    }

    /// Timestamps passed to `offset_for_time`.
    #[must_use]
    pub fn time_lookups(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().unwrap().time_lookups.clone()
    }

    /// Every successful commit, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<OffsetCursor> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Latest committed offset for `assignment`.
    #[must_use]
    pub fn committed_offset(&self, assignment: &PartitionAssignment) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .rev()
            .find_map(|cursor| cursor.get(assignment))
    }

    /// Partition assigned by the last successful `start`.
    #[must_use]
    pub fn assignment(&self) -> Option<PartitionAssignment> {
        self.state.lock().unwrap().assignment.clone()
    }

    /// Number of `start` calls, successful or not.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.state.lock().unwrap().start_calls
    }

    /// Number of `stop` calls, successful or not.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap().stop_calls
    }
}

impl PartitionTransport for ScriptedTransport {
    async fn start(&mut self, assignment: &PartitionAssignment) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.start_calls += 1;
        state.log("start");
        if let Some(error) = state.fail_start.clone() {
            return Err(error);
        }
        state.assignment = Some(assignment.clone());
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.poll_requests.push((max_records, timeout));
        state.log("poll");
        let mut records = state.polls.pop_front().unwrap_or_else(|| Ok(Vec::new()))?;
        records.truncate(max_records);
        Ok(records)
    }

    async fn offset_for_time(
        &mut self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<i64>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.time_lookups.push(timestamp);
        Ok(state.time_offset)
    }

    async fn commit(&mut self, offsets: &OffsetCursor) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.log("commit");
        if let Some(error) = state.fail_commit.take() {
            return Err(error);
        }
        state.commits.push(offsets.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        state.log("stop");
        if let Some(error) = state.fail_stop.take() {
            return Err(error);
        }
        Ok(())
    }
}
