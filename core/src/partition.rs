//! Partition identity and in-memory offset tracking.

use std::collections::BTreeMap;
use std::fmt;

/// One partition of one topic, read on behalf of one consumer group.
///
/// Immutable for the lifetime of a consumer: a consumer instance binds to
/// exactly one assignment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionAssignment {
    topic: String,
    partition: i32,
    group_id: String,
}

impl PartitionAssignment {
    /// Create an assignment.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            group_id: group_id.into(),
        }
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition number.
    #[must_use]
    pub const fn partition(&self) -> i32 {
        self.partition
    }

    /// Consumer group the offsets are committed for.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Lease key protecting this partition.
    ///
    /// Derived from topic and partition only, so every process targeting the
    /// same partition contends on the same lease regardless of its group.
    ///
    /// ```
    /// use lockstep_core::PartitionAssignment;
    ///
    /// let assignment = PartitionAssignment::new("orders", 3, "billing");
    /// assert_eq!(assignment.lock_key(), "orders_partition_3");
    /// ```
    #[must_use]
    pub fn lock_key(&self) -> String {
        format!("{}_partition_{}", self.topic, self.partition)
    }
}

impl fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.group_id)
    }
}

/// Next offset to read, per partition, for records already handed out.
///
/// Values are "last seen plus one", i.e. the position a restarted reader
/// should resume from. Nothing here is durable until a transport commits it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCursor {
    offsets: BTreeMap<PartitionAssignment, i64>,
}

impl OffsetCursor {
    /// Create an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `next_offset` as the resume position for `assignment`.
    pub fn track(&mut self, assignment: &PartitionAssignment, next_offset: i64) {
        self.offsets.insert(assignment.clone(), next_offset);
    }

    /// Resume position tracked for `assignment`, if any.
    #[must_use]
    pub fn get(&self, assignment: &PartitionAssignment) -> Option<i64> {
        self.offsets.get(assignment).copied()
    }

    /// Whether nothing has been tracked since the last clear.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Forget every tracked position.
    pub fn clear(&mut self) {
        self.offsets.clear();
    }

    /// Iterate tracked positions in assignment order.
    pub fn iter(&self) -> impl Iterator<Item = (&PartitionAssignment, i64)> {
        self.offsets.iter().map(|(assignment, offset)| (assignment, *offset))
    }
}

impl fmt::Display for OffsetCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (assignment, offset)) in self.offsets.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}[{}]: {offset}", assignment.topic, assignment.partition)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_keeps_latest_position() {
        let assignment = PartitionAssignment::new("events", 0, "workers");
        let mut cursor = OffsetCursor::new();
        assert!(cursor.is_empty());

        cursor.track(&assignment, 10);
        cursor.track(&assignment, 21);

        assert_eq!(cursor.get(&assignment), Some(21));
        assert_eq!(cursor.to_string(), "{events[0]: 21}");

        cursor.clear();
        assert!(cursor.is_empty());
        assert_eq!(cursor.to_string(), "{}");
    }

    #[test]
    fn lock_key_ignores_group() {
        let a = PartitionAssignment::new("events", 2, "a");
        let b = PartitionAssignment::new("events", 2, "b");
        assert_eq!(a.lock_key(), b.lock_key());
        assert_ne!(a, b);
    }
}
