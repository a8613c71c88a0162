//! Raw records as returned by a transport, and typed batches handed to callers.

use chrono::{DateTime, Utc};

/// A single record polled from a partition, still in wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Partition the record was read from
    pub partition: i32,
    /// Position of the record within its partition
    pub offset: i64,
    /// Broker or producer timestamp, when the transport exposes one
    pub timestamp: Option<DateTime<Utc>>,
    /// Message key
    pub key: Option<Vec<u8>>,
    /// Message payload (`None` for tombstones)
    pub payload: Option<Vec<u8>>,
}

impl Record {
    /// Create a record with a payload and no key or timestamp.
    #[must_use]
    pub fn new(partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            timestamp: None,
            key: None,
            payload: Some(payload.into()),
        }
    }

    /// Attach a timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Ordered, immutable sequence of deserialized records from one poll cycle.
///
/// Offsets always describe the records actually contained in the batch, after
/// any time-threshold filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    partition: i32,
    first_offset: i64,
    last_offset: i64,
    records: Vec<T>,
}

impl<T> Batch<T> {
    /// Build a batch. Callers guarantee `records` is non-empty and ordered.
    #[must_use]
    pub const fn new(partition: i32, first_offset: i64, last_offset: i64, records: Vec<T>) -> Self {
        Self {
            partition,
            first_offset,
            last_offset,
            records,
        }
    }

    /// Partition the batch was read from.
    #[must_use]
    pub const fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of the first record.
    #[must_use]
    pub const fn first_offset(&self) -> i64 {
        self.first_offset
    }

    /// Offset of the last record.
    #[must_use]
    pub const fn last_offset(&self) -> i64 {
        self.last_offset
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Borrow the records.
    #[must_use]
    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Iterate the records.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    /// Take ownership of the records.
    #[must_use]
    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
