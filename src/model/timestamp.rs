use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// Field order gives the derived ordering seconds-then-nanos.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            seconds: duration.as_secs() as i64,
            nanos: duration.subsec_nanos() as i32,
        }
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

/// Server snapshot time a document or target was last confirmed at.
///
/// `SnapshotVersion::MIN` marks state that has never been confirmed by the
/// backend; versions never regress once persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(pub Timestamp);

impl SnapshotVersion {
    pub const MIN: SnapshotVersion = SnapshotVersion(Timestamp {
        seconds: 0,
        nanos: 0,
    });

    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);
    }

    #[test]
    fn default_snapshot_version_is_unconfirmed() {
        assert!(SnapshotVersion::default().is_min());
    }

    #[test]
    fn snapshot_version_ordering() {
        let earlier = SnapshotVersion::new(Timestamp::new(1, 0));
        let later = SnapshotVersion::new(Timestamp::new(1, 1));
        assert!(earlier < later);
        assert!(SnapshotVersion::MIN < earlier);
        assert!(SnapshotVersion::MIN.is_min());
    }
}
