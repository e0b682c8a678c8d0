use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

/// Operations between two averaged log lines.
pub const STATS_LOG_INTERVAL: u64 = 100_000;

/// Count and cumulative time of codec operations.
#[derive(Default, Debug)]
pub struct SerializationStats {
    /// Number of bodies serialized.
    pub serializations: AtomicU64,
    /// Total nanoseconds spent serializing.
    pub serialize_nanos: AtomicU64,
    /// Number of bodies deserialized.
    pub deserializations: AtomicU64,
    /// Total nanoseconds spent deserializing.
    pub deserialize_nanos: AtomicU64,
}

impl SerializationStats {
    pub(crate) fn record_serialize(&self, elapsed: Duration) {
        let count = self.serializations.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self
            .serialize_nanos
            .fetch_add(nanos(elapsed), Ordering::Relaxed)
            + nanos(elapsed);
        if count % STATS_LOG_INTERVAL == 0 {
            info!(count, avg_nanos = total / count, "codec.serialize.stats");
        }
    }

    pub(crate) fn record_deserialize(&self, elapsed: Duration) {
        let count = self.deserializations.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self
            .deserialize_nanos
            .fetch_add(nanos(elapsed), Ordering::Relaxed)
            + nanos(elapsed);
        if count % STATS_LOG_INTERVAL == 0 {
            info!(count, avg_nanos = total / count, "codec.deserialize.stats");
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            serializations: self.serializations.load(Ordering::Relaxed),
            serialize_nanos: self.serialize_nanos.load(Ordering::Relaxed),
            deserializations: self.deserializations.load(Ordering::Relaxed),
            deserialize_nanos: self.deserialize_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`SerializationStats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    /// Number of bodies serialized.
    pub serializations: u64,
    /// Total nanoseconds spent serializing.
    pub serialize_nanos: u64,
    /// Number of bodies deserialized.
    pub deserializations: u64,
    /// Total nanoseconds spent deserializing.
    pub deserialize_nanos: u64,
}

impl StatsSnapshot {
    /// Mean serialization time, if any were recorded.
    pub fn avg_serialize(&self) -> Option<Duration> {
        average(self.serialize_nanos, self.serializations)
    }

    /// Mean deserialization time, if any were recorded.
    pub fn avg_deserialize(&self) -> Option<Duration> {
        average(self.deserialize_nanos, self.deserializations)
    }
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

fn average(total: u64, count: u64) -> Option<Duration> {
    (count > 0).then(|| Duration::from_nanos(total / count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_track_recorded_durations() {
        let stats = SerializationStats::default();
        assert_eq!(stats.snapshot().avg_serialize(), None);
        stats.record_serialize(Duration::from_nanos(100));
        stats.record_serialize(Duration::from_nanos(300));
        stats.record_deserialize(Duration::from_nanos(50));
        let snap = stats.snapshot();
        assert_eq!(snap.serializations, 2);
        assert_eq!(snap.avg_serialize(), Some(Duration::from_nanos(200)));
        assert_eq!(snap.avg_deserialize(), Some(Duration::from_nanos(50)));
    }
}
