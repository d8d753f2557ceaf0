//! Coefficient and subscription tables plus vocabulary metadata.
//!
//! Coefficients are the only mutable records in the system besides resonance
//! scores. Every outcome strand's updates run through
//! [`StrandStore::with_coefficient_batch`]: one write transaction covering
//! all of the outcome's lever and interaction updates, guarded by the
//! outcome strand's id. Redelivering the outcome finds the guard and applies
//! nothing, and a crash mid-batch rolls the whole batch back, so the table
//! never sees a partial or doubled outcome.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use weft_strand::{BucketVocabulary, StrandId, Subscription};

use crate::store::{COEFFICIENTS, META, OUTCOME_GUARD, SUBSCRIPTIONS};
use crate::{Result, StoreError, StrandStore};

const VOCAB_FINGERPRINT_KEY: &str = "vocab_fingerprint";

/// Identity of one learned weight.
///
/// `key` is either a single lever (`curator=A`) or an interaction pattern
/// (`age=3-7d|cap=1m-2m|chain=base|curator=A|...`, levers sorted). The
/// bucket vocabulary version prefixes the storage key, so a vocabulary
/// change rotates the key space instead of rewriting history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoefficientKey {
    pub module: String,
    pub scope: String,
    pub name: String,
    pub key: String,
}

impl CoefficientKey {
    pub fn new(
        module: impl Into<String>,
        scope: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            scope: scope.into(),
            name: name.into(),
            key: key.into(),
        }
    }

    fn storage_key(&self, vocab_version: u32) -> String {
        format!(
            "v{vocab_version}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.module, self.scope, self.name, self.key
        )
    }
}

/// A learned weight with short and long memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coefficient {
    pub key: CoefficientKey,
    pub weight_short: f64,
    pub weight_long: f64,
    /// Value of `weight_short` before the most recent update.
    pub last_weight: f64,
    pub observation_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Coefficient {
    /// Fresh coefficient at the neutral weight 1.0.
    pub fn neutral(key: CoefficientKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            weight_short: 1.0,
            weight_long: 1.0,
            last_weight: 1.0,
            observation_count: 0,
            updated_at: now,
        }
    }
}

/// In-transaction view of the coefficient table handed to an outcome's
/// update closure.
pub struct CoefficientBatch<'txn> {
    table: redb::Table<'txn, &'static str, &'static [u8]>,
    now: DateTime<Utc>,
}

impl CoefficientBatch<'_> {
    /// Read-modify-write of one coefficient. `apply` receives the stored
    /// record, or a neutral one on first touch.
    pub fn update(
        &mut self,
        key: &CoefficientKey,
        vocab_version: u32,
        apply: impl FnOnce(&mut Coefficient),
    ) -> Result<Coefficient> {
        let storage_key = key.storage_key(vocab_version);
        let mut coefficient = match self.table.get(storage_key.as_str())? {
            Some(bytes) => serde_json::from_slice(bytes.value())?,
            None => Coefficient::neutral(key.clone(), self.now),
        };
        apply(&mut coefficient);
        coefficient.updated_at = self.now;
        self.table
            .insert(storage_key.as_str(), serde_json::to_vec(&coefficient)?.as_slice())?;
        Ok(coefficient)
    }
}

impl StrandStore {
    // ── coefficients ──────────────────────────────────────────────────────

    pub fn get_coefficient(
        &self,
        key: &CoefficientKey,
        vocab_version: u32,
    ) -> Result<Option<Coefficient>> {
        let txn = self.db().begin_read()?;
        let table = txn.open_table(COEFFICIENTS)?;
        let storage_key = key.storage_key(vocab_version);
        match table.get(storage_key.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Apply one outcome's coefficient updates in a single transaction,
    /// guarded by the outcome strand's id. Returns `false` without running
    /// the closure when the outcome was already applied; any error inside
    /// the closure rolls the whole batch back.
    pub fn with_coefficient_batch(
        &self,
        outcome_id: StrandId,
        apply: impl FnOnce(&mut CoefficientBatch<'_>) -> Result<()>,
    ) -> Result<bool> {
        let guard_key = outcome_id.to_string();
        let txn = self.db().begin_write()?;
        {
            let mut guards = txn.open_table(OUTCOME_GUARD)?;
            if guards.get(guard_key.as_str())?.is_some() {
                debug!(outcome = %outcome_id, "outcome already applied");
                return Ok(false);
            }
            guards.insert(guard_key.as_str(), "applied")?;
        }

        let mut batch = CoefficientBatch {
            table: txn.open_table(COEFFICIENTS)?,
            now: self.clock().now(),
        };
        apply(&mut batch)?;
        drop(batch);

        txn.commit()?;
        Ok(true)
    }

    /// All coefficients of one module under the given vocabulary version.
    pub fn coefficients_for_module(
        &self,
        module: &str,
        vocab_version: u32,
    ) -> Result<Vec<Coefficient>> {
        let prefix = format!("v{vocab_version}\u{1f}{module}\u{1f}");
        let txn = self.db().begin_read()?;
        let table = txn.open_table(COEFFICIENTS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, bytes) = row?;
            if key.value().starts_with(&prefix) {
                out.push(serde_json::from_slice(bytes.value())?);
            }
        }
        Ok(out)
    }

    // ── subscriptions ─────────────────────────────────────────────────────

    pub fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let txn = self.db().begin_write()?;
        {
            let mut table = txn.open_table(SUBSCRIPTIONS)?;
            table.insert(
                subscription.consumer_id.as_str(),
                serde_json::to_vec(subscription)?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_subscription(&self, consumer_id: &str) -> Result<Option<Subscription>> {
        let txn = self.db().begin_read()?;
        let table = txn.open_table(SUBSCRIPTIONS)?;
        match table.get(consumer_id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let txn = self.db().begin_read()?;
        let table = txn.open_table(SUBSCRIPTIONS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            out.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(out)
    }

    // ── vocabulary metadata ───────────────────────────────────────────────

    /// Record the active bucket vocabulary's fingerprint, or verify it if
    /// one is already recorded. A mismatch means boundary tables changed
    /// without a version bump, which would corrupt the coefficient key
    /// space; that is refused at startup.
    pub fn ensure_vocabulary(&self, vocab: &BucketVocabulary) -> Result<()> {
        let fingerprint = vocab.fingerprint();
        let meta_key = format!("{VOCAB_FINGERPRINT_KEY}_v{}", vocab.version());

        let txn = self.db().begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            let existing = meta
                .get(meta_key.as_str())?
                .map(|stored| stored.value().to_string());
            match existing {
                Some(stored) if stored != fingerprint => {
                    return Err(StoreError::Invalid(format!(
                        "bucket vocabulary v{} changed without a version bump",
                        vocab.version()
                    )));
                }
                Some(_) => {}
                None => {
                    meta.insert(meta_key.as_str(), fingerprint.as_str())?;
                    info!(version = vocab.version(), "bucket vocabulary registered");
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use weft_strand::{BucketVocabulary, FormatterId, StrandId, StrandKind, Subscription};

    use crate::clock::{Clock, ManualClock};
    use crate::{CoefficientKey, StrandStore};

    fn test_store() -> (tempfile::TempDir, StrandStore, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StrandStore::open(dir.path().join("weft.redb"), clock.clone()).unwrap();
        (dir, store, clock)
    }

    #[test]
    fn coefficient_first_touch_starts_neutral() {
        let (_dir, store, clock) = test_store();
        let key = CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A");

        let outcome = StrandId::new_at(clock.now());
        let applied = store
            .with_coefficient_batch(outcome, |batch| {
                let updated = batch.update(&key, 1, |c| {
                    assert_eq!(c.weight_short, 1.0);
                    c.weight_short = 1.2;
                    c.observation_count += 1;
                })?;
                assert_eq!(updated.weight_short, 1.2);
                Ok(())
            })
            .unwrap();

        assert!(applied);
        let loaded = store.get_coefficient(&key, 1).unwrap().unwrap();
        assert_eq!(loaded.observation_count, 1);
    }

    #[test]
    fn an_outcome_is_applied_at_most_once() {
        let (_dir, store, clock) = test_store();
        let key = CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A");
        let outcome = StrandId::new_at(clock.now());

        for _ in 0..2 {
            store
                .with_coefficient_batch(outcome, |batch| {
                    batch.update(&key, 1, |c| c.observation_count += 1)?;
                    Ok(())
                })
                .unwrap();
        }

        let loaded = store.get_coefficient(&key, 1).unwrap().unwrap();
        assert_eq!(loaded.observation_count, 1, "redelivery must not double-count");
    }

    #[test]
    fn a_failed_batch_rolls_back_entirely_and_can_retry() {
        let (_dir, store, clock) = test_store();
        let key = CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A");
        let outcome = StrandId::new_at(clock.now());

        let err = store.with_coefficient_batch(outcome, |batch| {
            batch.update(&key, 1, |c| c.weight_short = 1.9)?;
            Err(crate::StoreError::Invalid("boom".to_string()))
        });
        assert!(err.is_err());
        assert!(store.get_coefficient(&key, 1).unwrap().is_none());

        // The guard rolled back with the batch, so a retry applies cleanly.
        let applied = store
            .with_coefficient_batch(outcome, |batch| {
                batch.update(&key, 1, |c| c.weight_short = 1.5)?;
                Ok(())
            })
            .unwrap();
        assert!(applied);
        assert_eq!(
            store.get_coefficient(&key, 1).unwrap().unwrap().weight_short,
            1.5
        );
    }

    #[test]
    fn vocabulary_versions_rotate_the_key_space() {
        let (_dir, store, clock) = test_store();
        let key = CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A");

        store
            .with_coefficient_batch(StrandId::new_at(clock.now()), |batch| {
                batch.update(&key, 1, |c| c.weight_short = 1.5)?;
                Ok(())
            })
            .unwrap();

        assert!(store.get_coefficient(&key, 2).unwrap().is_none());
        assert!(store.get_coefficient(&key, 1).unwrap().is_some());
    }

    #[test]
    fn vocabulary_fingerprint_is_accepted_twice() {
        let (_dir, store, _clock) = test_store();
        let vocab = BucketVocabulary::current();
        store.ensure_vocabulary(&vocab).unwrap();
        store.ensure_vocabulary(&vocab).unwrap();
    }

    #[test]
    fn subscriptions_round_trip() {
        let (_dir, store, _clock) = test_store();
        let subscription = Subscription {
            consumer_id: "decision_maker".to_string(),
            kinds: vec![StrandKind::PredictionReview],
            min_braid_level: 2,
            min_score: 0.3,
            max_age_hours: 48,
            max_items: 8,
            formatter: FormatterId::new("standard"),
        };
        store.put_subscription(&subscription).unwrap();

        let loaded = store.get_subscription("decision_maker").unwrap().unwrap();
        assert_eq!(loaded.kinds, vec![StrandKind::PredictionReview]);
        assert_eq!(store.subscriptions().unwrap().len(), 1);
    }
}
