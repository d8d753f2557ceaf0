use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use weft_strand::{ClusterKey, ResonanceScores, Strand, StrandId, StrandKind, ViewId};

use crate::clock::Clock;
use crate::outbox::{OutboxItem, OutboxState, RetryPolicy};
use crate::{Result, StoreError};

// ── redb table definitions ────────────────────────────────────────────────────

/// Strand records: `strand id (str) → JSON strand`.
pub(crate) const STRANDS: TableDefinition<&str, &[u8]> = TableDefinition::new("strands");
/// Kind index: `kind slug → newline-joined id list in append order`.
pub(crate) const KIND_INDEX: TableDefinition<&str, &str> = TableDefinition::new("kind_index");
/// Cluster-key index: `kind␟view␟bucket → newline-joined id list`.
pub(crate) const CLUSTER_INDEX: TableDefinition<&str, &str> = TableDefinition::new("cluster_index");
/// Outbox queue: `sequence (u64) → JSON outbox item`.
pub(crate) const OUTBOX: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");
/// Braid idempotency guard: `cluster identity → braid id`.
pub(crate) const BRAID_GUARD: TableDefinition<&str, &str> = TableDefinition::new("braid_guard");
/// Outcome idempotency guard: `outcome strand id → "applied"`.
pub(crate) const OUTCOME_GUARD: TableDefinition<&str, &str> = TableDefinition::new("outcome_guard");
/// Coefficients: `versioned coefficient key → JSON coefficient`.
pub(crate) const COEFFICIENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("coefficients");
/// Subscriptions: `consumer id → JSON subscription`.
pub(crate) const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");
/// Counters and vocabulary fingerprints.
pub(crate) const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const OUTBOX_SEQ_KEY: &str = "outbox_seq";

/// Separator for composite index keys; never appears in slugs or buckets.
const SEP: char = '\u{1f}';

// ── query/result types ────────────────────────────────────────────────────────

/// Half-open time window `[start, end)` over `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window ending at `now` and reaching back `span`.
    pub fn last(now: DateTime<Utc>, span: Duration) -> Self {
        Self { start: now - span, end: now }
    }

    /// Unbounded window (maintenance scans, tests).
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// One step of a braid's ancestry, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    pub braid_id: StrandId,
    pub level: u32,
    pub parent_ids: Vec<StrandId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub strands_total: usize,
    pub braids_total: usize,
    pub by_kind: std::collections::BTreeMap<String, usize>,
    pub queue: QueueStats,
}

// ── StrandStore ───────────────────────────────────────────────────────────────

/// Durable store over a single redb database.
///
/// All methods take `&self`; redb provides the single-writer/multi-reader
/// discipline, so the store is shared as `Arc<StrandStore>`.
pub struct StrandStore {
    db: Database,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    appended: Notify,
}

impl std::fmt::Debug for StrandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandStore")
            .field("path", &self.path)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StrandStore {
    /// Open or create the database at `path` and ensure all tables exist.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Invalid(format!("creating store dir: {e}")))?;
            }
        }
        let db = Database::create(&path)?;

        {
            let txn = db.begin_write()?;
            txn.open_table(STRANDS)?;
            txn.open_table(KIND_INDEX)?;
            txn.open_table(CLUSTER_INDEX)?;
            txn.open_table(OUTBOX)?;
            txn.open_table(BRAID_GUARD)?;
            txn.open_table(OUTCOME_GUARD)?;
            txn.open_table(COEFFICIENTS)?;
            txn.open_table(SUBSCRIPTIONS)?;
            txn.open_table(META)?;
            txn.commit()?;
        }

        info!(path = %path.display(), "strand store opened");
        Ok(Self {
            db,
            path,
            clock,
            retry: RetryPolicy::default(),
            appended: Notify::new(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves after the next successful append. Used by idle workers so a
    /// fresh strand wakes the pool without polling hot.
    pub async fn wait_for_append(&self) {
        self.appended.notified().await;
    }

    // ── appends ───────────────────────────────────────────────────────────

    /// Append a strand. The strand, its indexes, and its outbox entry commit
    /// in one transaction; duplicate ids are a `Conflict`, lineage violations
    /// are `Invalid`. Never silently drops.
    pub fn append(&self, strand: &Strand) -> Result<StrandId> {
        self.append_with_guard(strand, None)
    }

    /// Append a braid under a cluster-identity guard. A second braid for the
    /// same guard key fails with `AlreadyBraided`, which is what makes
    /// braiding idempotent under at-least-once delivery.
    pub fn append_braid(&self, strand: &Strand, guard_key: &str) -> Result<StrandId> {
        if !strand.is_braid() {
            return Err(StoreError::Invalid(
                "append_braid requires braid_level >= 2".to_string(),
            ));
        }
        self.append_with_guard(strand, Some(guard_key))
    }

    fn append_with_guard(&self, strand: &Strand, guard: Option<&str>) -> Result<StrandId> {
        if strand.braid_level == 0 {
            return Err(StoreError::Invalid("braid_level must be >= 1".to_string()));
        }
        if strand.is_braid() && strand.parent_ids.is_empty() {
            return Err(StoreError::Invalid(format!(
                "braid {} has no parent_ids",
                strand.id
            )));
        }

        let id_str = strand.id.to_string();
        let txn = self.db.begin_write()?;
        {
            let mut strands = txn.open_table(STRANDS)?;
            if strands.get(id_str.as_str())?.is_some() {
                return Err(StoreError::Conflict(strand.id));
            }

            // Lineage: every parent exists at exactly level - 1.
            if strand.is_braid() {
                for parent_id in &strand.parent_ids {
                    let parent_key = parent_id.to_string();
                    let parent_bytes = strands.get(parent_key.as_str())?.ok_or_else(|| {
                        StoreError::Invalid(format!(
                            "braid {} references missing parent {parent_id}",
                            strand.id
                        ))
                    })?;
                    let parent: Strand = serde_json::from_slice(parent_bytes.value())?;
                    if parent.braid_level != strand.braid_level - 1 {
                        return Err(StoreError::Invalid(format!(
                            "braid {} at level {} has parent {parent_id} at level {}",
                            strand.id, strand.braid_level, parent.braid_level
                        )));
                    }
                }
            }

            if let Some(guard_key) = guard {
                let mut guards = txn.open_table(BRAID_GUARD)?;
                if guards.get(guard_key)?.is_some() {
                    return Err(StoreError::AlreadyBraided(guard_key.to_string()));
                }
                guards.insert(guard_key, id_str.as_str())?;
            }

            strands.insert(id_str.as_str(), serde_json::to_vec(strand)?.as_slice())?;

            let mut kinds = txn.open_table(KIND_INDEX)?;
            append_to_list(&mut kinds, strand.kind.slug(), &id_str)?;

            let mut clusters = txn.open_table(CLUSTER_INDEX)?;
            for key in &strand.cluster_keys {
                let index_key = cluster_index_key(&strand.kind, key.view, &key.bucket);
                append_to_list(&mut clusters, &index_key, &id_str)?;
            }

            let seq = next_outbox_seq(&txn)?;
            let mut outbox = txn.open_table(OUTBOX)?;
            let item = OutboxItem::pending(seq, strand.id, strand.kind.clone(), self.clock.now());
            outbox.insert(seq, serde_json::to_vec(&item)?.as_slice())?;
        }
        txn.commit()?;

        debug!(id = %strand.id, kind = %strand.kind, level = strand.braid_level, "strand appended");
        self.appended.notify_waiters();
        Ok(strand.id)
    }

    // ── reads ─────────────────────────────────────────────────────────────

    pub fn get(&self, id: StrandId) -> Result<Strand> {
        let txn = self.db.begin_read()?;
        let strands = txn.open_table(STRANDS)?;
        let key = id.to_string();
        match strands.get(key.as_str())? {
            Some(bytes) => Ok(serde_json::from_slice(bytes.value())?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Ordered scan of one kind, bounded by the kind index. Returns the
    /// matches materialized; the work per call is proportional to the kind's
    /// population, never to the whole table.
    pub fn scan(
        &self,
        kind: &StrandKind,
        window: TimeWindow,
        min_level: u32,
        max_level: u32,
        min_score: f64,
    ) -> Result<Vec<Strand>> {
        let txn = self.db.begin_read()?;
        let kinds = txn.open_table(KIND_INDEX)?;
        let ids = match kinds.get(kind.slug())? {
            Some(list) => split_list(list.value()),
            None => return Ok(Vec::new()),
        };

        let strands = txn.open_table(STRANDS)?;
        let mut out = Vec::new();
        for id in ids {
            let Some(bytes) = strands.get(id.as_str())? else {
                continue;
            };
            let strand: Strand = serde_json::from_slice(bytes.value())?;
            if !window.contains(strand.created_at) {
                continue;
            }
            if strand.braid_level < min_level || strand.braid_level > max_level {
                continue;
            }
            if strand.selection_score() < min_score {
                continue;
            }
            out.push(strand);
        }
        Ok(out)
    }

    /// Strands of `kind` carrying the `(view, bucket)` cluster key.
    pub fn by_cluster_key(
        &self,
        view: ViewId,
        bucket: &str,
        kind: &StrandKind,
    ) -> Result<Vec<Strand>> {
        let txn = self.db.begin_read()?;
        let clusters = txn.open_table(CLUSTER_INDEX)?;
        let index_key = cluster_index_key(kind, view, bucket);
        let ids = match clusters.get(index_key.as_str())? {
            Some(list) => split_list(list.value()),
            None => return Ok(Vec::new()),
        };

        let strands = txn.open_table(STRANDS)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(bytes) = strands.get(id.as_str())? {
                out.push(serde_json::from_slice(bytes.value())?);
            }
        }
        Ok(out)
    }

    /// Braid id previously recorded for a cluster guard key, if any.
    pub fn braid_for_guard(&self, guard_key: &str) -> Result<Option<StrandId>> {
        let txn = self.db.begin_read()?;
        let guards = txn.open_table(BRAID_GUARD)?;
        match guards.get(guard_key)? {
            Some(id) => Ok(Some(id.value().parse().map_err(|_| {
                StoreError::Invalid(format!("corrupt braid guard for {guard_key}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Ancestry closure of a braid: the braid itself plus every ancestor
    /// braid, breadth-first. Leaf parents appear inside `parent_ids` but get
    /// no entry of their own.
    pub fn lineage(&self, id: StrandId) -> Result<Vec<LineageEntry>> {
        let mut out = Vec::new();
        let mut queue = vec![id];
        let mut seen = HashSet::new();

        while let Some(next) = queue.pop() {
            if !seen.insert(next) {
                continue;
            }
            let strand = self.get(next)?;
            if !strand.is_braid() {
                continue;
            }
            queue.extend(strand.parent_ids.iter().copied());
            out.push(LineageEntry {
                braid_id: strand.id,
                level: strand.braid_level,
                parent_ids: strand.parent_ids,
            });
        }
        Ok(out)
    }

    // ── resonance CAS ─────────────────────────────────────────────────────

    /// Compare-and-set update of the resonance scores and the derived
    /// cluster keys. Both are deterministic functions of the strand and its
    /// cohort, so re-applying after a crash converges to the same record.
    /// Everything else on the strand stays immutable.
    pub fn update_scores(
        &self,
        id: StrandId,
        expected_version: u64,
        scores: ResonanceScores,
        cluster_keys: &[ClusterKey],
    ) -> Result<()> {
        let id_str = id.to_string();
        let txn = self.db.begin_write()?;
        {
            let mut strands = txn.open_table(STRANDS)?;
            let mut strand: Strand = match strands.get(id_str.as_str())? {
                Some(bytes) => serde_json::from_slice(bytes.value())?,
                None => return Err(StoreError::NotFound(id)),
            };
            if strand.score_version != expected_version {
                return Err(StoreError::VersionConflict {
                    id,
                    expected: expected_version,
                    actual: strand.score_version,
                });
            }

            strand.resonance = Some(scores);
            strand.cluster_keys = cluster_keys.to_vec();
            strand.score_version += 1;
            strands.insert(id_str.as_str(), serde_json::to_vec(&strand)?.as_slice())?;

            let mut clusters = txn.open_table(CLUSTER_INDEX)?;
            for key in cluster_keys {
                let index_key = cluster_index_key(&strand.kind, key.view, &key.bucket);
                append_to_list(&mut clusters, &index_key, &id_str)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // ── stats ─────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read()?;
        let mut stats = StoreStats::default();

        let strands = txn.open_table(STRANDS)?;
        for row in strands.iter()? {
            let (_, bytes) = row?;
            let strand: Strand = serde_json::from_slice(bytes.value())?;
            stats.strands_total += 1;
            if strand.is_braid() {
                stats.braids_total += 1;
            }
            *stats.by_kind.entry(strand.kind.slug().to_string()).or_default() += 1;
        }

        let outbox = txn.open_table(OUTBOX)?;
        for row in outbox.iter()? {
            let (_, bytes) = row?;
            let item: OutboxItem = serde_json::from_slice(bytes.value())?;
            match item.state {
                OutboxState::Pending => stats.queue.pending += 1,
                OutboxState::Processing => stats.queue.processing += 1,
                OutboxState::Completed => stats.queue.completed += 1,
                OutboxState::Failed => stats.queue.failed += 1,
            }
        }
        Ok(stats)
    }
}

// ── index helpers ─────────────────────────────────────────────────────────────

pub(crate) fn cluster_index_key(kind: &StrandKind, view: ViewId, bucket: &str) -> String {
    format!("{}{SEP}{}{SEP}{}", kind.slug(), view.slug(), bucket)
}

/// Append `id` to a newline-joined list value, skipping if already present
/// (score re-computation re-derives the same cluster keys).
fn append_to_list(
    table: &mut redb::Table<'_, &str, &str>,
    key: &str,
    id: &str,
) -> Result<()> {
    let existing = table.get(key)?.map(|v| v.value().to_string()).unwrap_or_default();
    if existing.lines().any(|line| line == id) {
        return Ok(());
    }
    let updated = if existing.is_empty() {
        id.to_string()
    } else {
        format!("{existing}\n{id}")
    };
    table.insert(key, updated.as_str())?;
    Ok(())
}

fn split_list(list: &str) -> Vec<String> {
    list.lines().filter(|l| !l.is_empty()).map(String::from).collect()
}

fn next_outbox_seq(txn: &redb::WriteTransaction) -> Result<u64> {
    let mut meta = txn.open_table(META)?;
    let next = meta
        .get(OUTBOX_SEQ_KEY)?
        .map(|v| v.value().parse::<u64>().unwrap_or(0))
        .unwrap_or(0);
    let after = (next + 1).to_string();
    meta.insert(OUTBOX_SEQ_KEY, after.as_str())?;
    Ok(next)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use weft_strand::{ClusterKey, ResonanceScores, Strand, StrandId, StrandKind, ViewId};

    use crate::clock::{Clock, ManualClock};
    use crate::{StoreError, StrandStore, TimeWindow};

    fn test_store() -> (tempfile::TempDir, StrandStore, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StrandStore::open(dir.path().join("weft.redb"), clock.clone()).unwrap();
        (dir, store, clock)
    }

    fn pattern_strand(clock: &ManualClock) -> Strand {
        let now = clock.now();
        Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Pattern,
            now,
            json!({"pattern_type": "volume_spike", "confidence": 0.8}),
        )
        .with_symbol("BTC")
        .with_timeframe("1m")
    }

    #[test]
    fn append_then_get_round_trips() {
        let (_dir, store, clock) = test_store();
        let strand = pattern_strand(&clock);
        store.append(&strand).unwrap();

        let loaded = store.get(strand.id).unwrap();
        assert_eq!(loaded.id, strand.id);
        assert_eq!(loaded.kind, StrandKind::Pattern);
        assert_eq!(loaded.symbol.as_deref(), Some("BTC"));
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let (_dir, store, clock) = test_store();
        let strand = pattern_strand(&clock);
        store.append(&strand).unwrap();

        match store.append(&strand) {
            Err(StoreError::Conflict(id)) => assert_eq!(id, strand.id),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn braid_without_parents_is_invalid() {
        let (_dir, store, clock) = test_store();
        let mut strand = pattern_strand(&clock);
        strand.braid_level = 2;

        assert!(matches!(store.append(&strand), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn braid_parent_must_be_one_level_down() {
        let (_dir, store, clock) = test_store();
        let leaf = pattern_strand(&clock);
        store.append(&leaf).unwrap();

        let now = clock.now();
        let mut braid = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Braid,
            now,
            json!({"summary": "s"}),
        );
        braid.braid_level = 3; // parents are level 1, not 2
        braid.parent_ids = vec![leaf.id];

        assert!(matches!(store.append(&braid), Err(StoreError::Invalid(_))));

        braid.braid_level = 2;
        store.append(&braid).unwrap();
    }

    #[test]
    fn append_braid_is_idempotent_per_guard() {
        let (_dir, store, clock) = test_store();
        let leaf = pattern_strand(&clock);
        store.append(&leaf).unwrap();

        let make_braid = |clock: &ManualClock| {
            let now = clock.now();
            let mut braid = Strand::leaf(
                StrandId::new_at(now),
                StrandKind::Braid,
                now,
                json!({"summary": "s"}),
            );
            braid.braid_level = 2;
            braid.parent_ids = vec![leaf.id];
            braid
        };

        let first = make_braid(&clock);
        store.append_braid(&first, "pattern|asset|BTC|w0").unwrap();

        let second = make_braid(&clock);
        match store.append_braid(&second, "pattern|asset|BTC|w0") {
            Err(StoreError::AlreadyBraided(guard)) => assert_eq!(guard, "pattern|asset|BTC|w0"),
            other => panic!("expected AlreadyBraided, got {other:?}"),
        }
        assert_eq!(
            store.braid_for_guard("pattern|asset|BTC|w0").unwrap(),
            Some(first.id)
        );
    }

    #[test]
    fn scan_filters_window_level_and_score() {
        let (_dir, store, clock) = test_store();

        let mut old = pattern_strand(&clock);
        old.created_at -= Duration::days(30);
        old.id = StrandId::new_at(old.created_at);
        store.append(&old).unwrap();

        let fresh = pattern_strand(&clock);
        store.append(&fresh).unwrap();

        let window = TimeWindow::last(clock.now() + Duration::seconds(1), Duration::days(7));
        let hits = store
            .scan(&StrandKind::Pattern, window, 1, 1, 0.0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, fresh.id);

        // min_score excludes unscored strands.
        let none = store
            .scan(&StrandKind::Pattern, TimeWindow::all(), 1, 1, 0.1)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn update_scores_cas_detects_stale_writers() {
        let (_dir, store, clock) = test_store();
        let strand = pattern_strand(&clock);
        store.append(&strand).unwrap();

        let scores = ResonanceScores {
            selection_score: 0.7,
            ..ResonanceScores::neutral()
        };
        let keys = vec![ClusterKey::new(ViewId::Asset, "BTC")];
        store.update_scores(strand.id, 0, scores, &keys).unwrap();

        // Stale writer with the old version loses.
        match store.update_scores(strand.id, 0, scores, &keys) {
            Err(StoreError::VersionConflict { actual, .. }) => assert_eq!(actual, 1),
            other => panic!("expected VersionConflict, got {other:?}"),
        }

        let loaded = store.get(strand.id).unwrap();
        assert_eq!(loaded.score_version, 1);
        assert_eq!(loaded.selection_score(), 0.7);

        // The derived cluster key is queryable.
        let members = store
            .by_cluster_key(ViewId::Asset, "BTC", &StrandKind::Pattern)
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn rescore_does_not_duplicate_index_entries() {
        let (_dir, store, clock) = test_store();
        let strand = pattern_strand(&clock);
        store.append(&strand).unwrap();

        let keys = vec![ClusterKey::new(ViewId::Asset, "BTC")];
        store
            .update_scores(strand.id, 0, ResonanceScores::neutral(), &keys)
            .unwrap();
        store
            .update_scores(strand.id, 1, ResonanceScores::neutral(), &keys)
            .unwrap();

        let members = store
            .by_cluster_key(ViewId::Asset, "BTC", &StrandKind::Pattern)
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn lineage_walks_ancestor_braids() {
        let (_dir, store, clock) = test_store();
        let a = pattern_strand(&clock);
        let b = pattern_strand(&clock);
        store.append(&a).unwrap();
        store.append(&b).unwrap();

        let now = clock.now();
        let mut braid = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Braid,
            now,
            json!({"summary": "s"}),
        );
        braid.braid_level = 2;
        braid.parent_ids = vec![a.id, b.id];
        store.append(&braid).unwrap();

        let lineage = store.lineage(braid.id).unwrap();
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].braid_id, braid.id);
        assert_eq!(lineage[0].parent_ids.len(), 2);
    }
}
