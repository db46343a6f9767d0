//! Per-partition identifier generators.
//!
//! Sp-handles encode `(sequence << 14) | partition` and strictly increase on
//! a leader. Unique ids carry a millisecond timestamp so the command log can
//! order and dedupe entries across restarts:
//! `((millis - epoch) << 23) | (intra_ms_counter << 14) | partition`.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Result};

use super::types::{PartitionId, SpHandle, UniqueId};

/// Bits reserved for the partition id in both identifier layouts.
const PARTITION_BITS: u32 = 14;
const PARTITION_MASK: i64 = (1 << PARTITION_BITS) - 1;

/// Bits for the per-millisecond counter inside a unique id.
const COUNTER_BITS: u32 = 9;
const COUNTER_MASK: i64 = (1 << COUNTER_BITS) - 1;
const COUNTER_MAX: i64 = COUNTER_MASK;

const TIME_SHIFT: u32 = PARTITION_BITS + COUNTER_BITS;

/// Epoch for the unique-id timestamp field: 2020-01-01T00:00:00Z.
const UNIQUE_ID_EPOCH_MS: i64 = 1_577_836_800_000;

/// Monotonic sp-handle generator for one partition.
#[derive(Debug)]
pub struct SpHandleAllocator {
    partition: PartitionId,
    sequence: i64,
}

impl SpHandleAllocator {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            sequence: 0,
        }
    }

    pub fn partition_of(handle: SpHandle) -> PartitionId {
        (handle & PARTITION_MASK) as PartitionId
    }

    pub fn sequence_of(handle: SpHandle) -> i64 {
        handle >> PARTITION_BITS
    }

    /// Handle for the most recently issued sequence.
    pub fn current(&self) -> SpHandle {
        (self.sequence << PARTITION_BITS) | i64::from(self.partition)
    }

    /// Issue the next handle.
    pub fn advance(&mut self) -> SpHandle {
        self.sequence += 1;
        self.current()
    }

    /// Fold in a handle stamped elsewhere (replica path, promotion) so the
    /// local sequence never falls behind what the partition has seen.
    pub fn observe(&mut self, handle: SpHandle) {
        let seq = Self::sequence_of(handle);
        if seq > self.sequence {
            self.sequence = seq;
        }
    }
}

/// Timestamp-component unique-id generator for one partition.
#[derive(Debug)]
pub struct UniqueIdAllocator {
    partition: PartitionId,
    last_used_ms: i64,
    counter: i64,
}

impl UniqueIdAllocator {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            last_used_ms: 0,
            counter: 0,
        }
    }

    pub fn partition_of(unique_id: UniqueId) -> PartitionId {
        (unique_id & PARTITION_MASK) as PartitionId
    }

    pub fn millis_of(unique_id: UniqueId) -> i64 {
        (unique_id >> TIME_SHIFT) + UNIQUE_ID_EPOCH_MS
    }

    pub fn from_components(millis: i64, counter: i64, partition: PartitionId) -> UniqueId {
        ((millis - UNIQUE_ID_EPOCH_MS) << TIME_SHIFT)
            | ((counter & COUNTER_MASK) << PARTITION_BITS)
            | i64::from(partition)
    }

    fn wall_clock_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .min(u128::from(u64::MAX)) as i64
    }

    /// Issue the next unique id. Never goes backwards, even when the wall
    /// clock does; bursts past the per-millisecond counter roll into the
    /// next millisecond slot.
    pub fn next(&mut self) -> UniqueId {
        let now = Self::wall_clock_ms().max(self.last_used_ms);
        if now == self.last_used_ms {
            self.counter += 1;
            if self.counter > COUNTER_MAX {
                self.last_used_ms += 1;
                self.counter = 0;
            }
        } else {
            self.last_used_ms = now;
            self.counter = 0;
        }
        Self::from_components(self.last_used_ms, self.counter, self.partition)
    }

    /// Most recently generated (or adopted) unique id.
    pub fn last_unique_id(&self) -> UniqueId {
        Self::from_components(self.last_used_ms, self.counter, self.partition)
    }

    /// Timestamp-only id for read traffic; does not advance the generator.
    pub fn synthetic_now(&self) -> UniqueId {
        let now = Self::wall_clock_ms().max(self.last_used_ms);
        Self::from_components(now, 0, self.partition)
    }

    /// Fold in an id assigned upstream (replay or replica path). Ids minted
    /// for another partition indicate misrouted traffic.
    pub fn adopt(&mut self, unique_id: UniqueId) -> Result<()> {
        ensure!(
            Self::partition_of(unique_id) == self.partition,
            "unique id {unique_id} belongs to partition {}, not {}",
            Self::partition_of(unique_id),
            self.partition,
        );
        let millis = Self::millis_of(unique_id);
        let counter = (unique_id >> PARTITION_BITS) & COUNTER_MASK;
        if (millis, counter) > (self.last_used_ms, self.counter) {
            self.last_used_ms = millis;
            self.counter = counter;
        }
        Ok(())
    }
}
