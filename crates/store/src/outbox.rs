//! The transactional outbox: queue semantics over the `outbox` table.
//!
//! Entries are written in the same commit as their strand (see
//! [`crate::StrandStore::append`]); this module owns the delivery-side
//! operations. Items move `pending → processing → completed | failed`;
//! delivery is at-least-once and the pipeline above is idempotent, which
//! together give exactly-effectual processing.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weft_strand::{StrandId, StrandKind};

use crate::store::OUTBOX;
use crate::{Result, StoreError, StrandStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub seq: u64,
    pub strand_id: StrandId,
    pub kind: StrandKind,
    pub state: OutboxState,
    /// Delivery attempts so far; incremented on claim.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the item may be claimed (backoff gate).
    pub not_before: DateTime<Utc>,
    /// When a processing claim lapses and the item becomes claimable again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Park reason once failed (`invalid`, `unsupported`, or the error text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OutboxItem {
    pub(crate) fn pending(
        seq: u64,
        strand_id: StrandId,
        kind: StrandKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            seq,
            strand_id,
            kind,
            state: OutboxState::Pending,
            attempts: 0,
            enqueued_at: now,
            not_before: now,
            claim_deadline: None,
            reason: None,
        }
    }
}

/// Backoff and parking policy for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds; attempt `n` waits
    /// `base * 2^(n-1)` plus up to one base of jitter.
    pub base_delay_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 2,
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential delay before the next delivery of an item that
    /// has been attempted `attempts` times.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(10);
        let base = self.base_delay_secs.max(1);
        let backoff = base.saturating_mul(1_i64 << exp);
        let jitter_ms = rand::thread_rng().gen_range(0..=base * 1000);
        Duration::seconds(backoff) + Duration::milliseconds(jitter_ms)
    }
}

impl StrandStore {
    /// Claim up to `n` deliverable items: pending items past their backoff
    /// gate, plus processing items whose claim deadline lapsed (a worker
    /// died). Claimed items are marked processing with a fresh deadline.
    /// Iteration is in sequence order, which is FIFO per kind.
    pub fn claim(&self, n: usize, visibility: Duration) -> Result<Vec<OutboxItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock().now();
        let txn = self.db().begin_write()?;
        let mut claimed = Vec::new();
        {
            let mut outbox = txn.open_table(OUTBOX)?;
            let mut candidates: Vec<OutboxItem> = Vec::new();
            for row in outbox.iter()? {
                let (_, bytes) = row?;
                let item: OutboxItem = serde_json::from_slice(bytes.value())?;
                let deliverable = match item.state {
                    OutboxState::Pending => item.not_before <= now,
                    OutboxState::Processing => {
                        item.claim_deadline.is_some_and(|deadline| deadline < now)
                    }
                    OutboxState::Completed | OutboxState::Failed => false,
                };
                if deliverable {
                    candidates.push(item);
                    if candidates.len() == n {
                        break;
                    }
                }
            }

            for mut item in candidates {
                item.state = OutboxState::Processing;
                item.attempts += 1;
                item.claim_deadline = Some(now + visibility);
                outbox.insert(item.seq, serde_json::to_vec(&item)?.as_slice())?;
                claimed.push(item);
            }
        }
        txn.commit()?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed outbox items");
        }
        Ok(claimed)
    }

    /// Mark an item completed. Completed items are retained for audit and
    /// replay, not deleted.
    pub fn ack(&self, seq: u64) -> Result<()> {
        self.transition(seq, |item| {
            item.state = OutboxState::Completed;
            item.claim_deadline = None;
        })
    }

    /// Report a failed delivery. Retries with jittered exponential backoff
    /// until the attempt budget is spent, then parks the item with `reason`.
    pub fn nack(&self, seq: u64, reason: &str) -> Result<()> {
        let now = self.clock().now();
        let policy = *self.retry_policy();
        self.transition(seq, |item| {
            if item.attempts >= policy.max_attempts {
                item.state = OutboxState::Failed;
                item.claim_deadline = None;
                item.reason = Some(reason.to_string());
                warn!(seq = item.seq, strand = %item.strand_id, reason, "outbox item parked");
            } else {
                item.state = OutboxState::Pending;
                item.claim_deadline = None;
                item.not_before = now + policy.delay_for(item.attempts);
            }
        })
    }

    /// Park an item immediately, skipping the retry budget. Used for input
    /// errors that can never succeed (`invalid`, `unsupported`).
    pub fn park(&self, seq: u64, reason: &str) -> Result<()> {
        self.transition(seq, |item| {
            item.state = OutboxState::Failed;
            item.claim_deadline = None;
            item.reason = Some(reason.to_string());
            warn!(seq = item.seq, strand = %item.strand_id, reason, "outbox item parked");
        })
    }

    /// Items awaiting or undergoing delivery; the backpressure signal.
    pub fn queue_depth(&self) -> Result<usize> {
        let txn = self.db().begin_read()?;
        let outbox = txn.open_table(OUTBOX)?;
        let mut depth = 0;
        for row in outbox.iter()? {
            let (_, bytes) = row?;
            let item: OutboxItem = serde_json::from_slice(bytes.value())?;
            if matches!(item.state, OutboxState::Pending | OutboxState::Processing) {
                depth += 1;
            }
        }
        Ok(depth)
    }

    /// Every outbox item in sequence order, regardless of state.
    pub fn dump_outbox(&self) -> Result<Vec<OutboxItem>> {
        let txn = self.db().begin_read()?;
        let outbox = txn.open_table(OUTBOX)?;
        let mut out = Vec::new();
        for row in outbox.iter()? {
            let (_, bytes) = row?;
            out.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(out)
    }

    /// Maintenance: return parked items to pending with a fresh attempt
    /// budget. Returns how many were requeued.
    pub fn requeue_failed(&self) -> Result<usize> {
        let now = self.clock().now();
        let txn = self.db().begin_write()?;
        let mut requeued = 0;
        {
            let mut outbox = txn.open_table(OUTBOX)?;
            let mut failed: Vec<OutboxItem> = Vec::new();
            for row in outbox.iter()? {
                let (_, bytes) = row?;
                let item: OutboxItem = serde_json::from_slice(bytes.value())?;
                if item.state == OutboxState::Failed {
                    failed.push(item);
                }
            }
            for mut item in failed {
                item.state = OutboxState::Pending;
                item.attempts = 0;
                item.not_before = now;
                item.reason = None;
                outbox.insert(item.seq, serde_json::to_vec(&item)?.as_slice())?;
                requeued += 1;
            }
        }
        txn.commit()?;
        Ok(requeued)
    }

    /// Requeue one completed item for redelivery. Replay tooling only: the
    /// pipeline is idempotent, so redelivery must not change observable
    /// state.
    pub fn requeue(&self, seq: u64) -> Result<()> {
        let now = self.clock().now();
        self.transition(seq, |item| {
            item.state = OutboxState::Pending;
            item.claim_deadline = None;
            item.not_before = now;
        })
    }

    fn transition(&self, seq: u64, apply: impl FnOnce(&mut OutboxItem)) -> Result<()> {
        let txn = self.db().begin_write()?;
        {
            let mut outbox = txn.open_table(OUTBOX)?;
            let mut item: OutboxItem = match outbox.get(seq)? {
                Some(bytes) => serde_json::from_slice(bytes.value())?,
                None => return Err(StoreError::QueueItemNotFound(seq)),
            };
            apply(&mut item);
            outbox.insert(seq, serde_json::to_vec(&item)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}
