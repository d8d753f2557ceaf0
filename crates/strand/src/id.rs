use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique strand identifier, lexicographically sortable by creation
/// time.
///
/// Backed by UUIDv7: the leading 48 bits are a unix millisecond timestamp, so
/// string ordering equals creation ordering for ids minted from a monotonic
/// clock. The timestamp is supplied by the caller rather than read from the
/// system clock, which keeps id generation deterministic under an injected
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrandId(Uuid);

impl StrandId {
    /// Mint a new id whose embedded timestamp is `at`.
    pub fn new_at(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp().max(0) as u64;
        let nanos = at.timestamp_subsec_nanos();
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, secs, nanos);
        Self(Uuid::new_v7(ts))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for StrandId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::StrandId;

    #[test]
    fn ids_sort_by_creation_time() {
        let now = Utc::now();
        let earlier = StrandId::new_at(now - Duration::seconds(30));
        let later = StrandId::new_at(now);

        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn id_round_trips_through_string() {
        let id = StrandId::new_at(Utc::now());
        let parsed: StrandId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
