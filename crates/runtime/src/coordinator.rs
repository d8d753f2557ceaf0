use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use weft_braider::{BraidOutcome, Braider, BraiderError};
use weft_cluster::{cluster_keys_for, clusters_for_partition, window_start};
use weft_coeffs::{CoefficientUpdater, DecayParams};
use weft_config::AppConfig;
use weft_context::ContextInjector;
use weft_llm::LlmCapability;
use weft_prompt::PromptRegistry;
use weft_resonance::ResonanceEngine;
use weft_store::{OutboxItem, StoreError, StrandStore, TimeWindow};
use weft_strand::{
    BucketVocabulary, FormatterId, LearningConfig, Strand, StrandKind, StrandPayload, Subscription,
};

use crate::cohort::assemble_cohort;
use crate::events::ProgressEvent;

/// How one queue item's failure is handled.
enum ItemError {
    /// Can never succeed; park immediately with the reason.
    Park(String),
    /// Worth retrying with backoff.
    Transient(String),
}

fn transient(err: impl std::fmt::Display) -> ItemError {
    ItemError::Transient(err.to_string())
}

pub struct Coordinator {
    store: Arc<StrandStore>,
    registry: Arc<PromptRegistry>,
    engine: Arc<ResonanceEngine>,
    braider: Braider,
    coeffs: CoefficientUpdater,
    injector: Arc<ContextInjector>,
    config: AppConfig,
    vocab: BucketVocabulary,
    events: broadcast::Sender<ProgressEvent>,
}

impl Coordinator {
    /// Wire the pipeline around the injected capabilities: the store (which
    /// carries the clock and the queue) and the LLM.
    pub fn new(store: Arc<StrandStore>, llm: Arc<dyn LlmCapability>, config: AppConfig) -> Self {
        let registry = Arc::new(PromptRegistry::with_defaults());
        let injector = Arc::new(ContextInjector::new(
            store.clone(),
            registry.clone(),
            Duration::seconds(config.context.cache_ttl_secs),
            config.context.cache_capacity,
        ));
        let braider = Braider::new(store.clone(), registry.clone(), llm, config.llm.max_retries);
        let coeffs = CoefficientUpdater::new(
            store.clone(),
            DecayParams {
                tau_short_days: config.learning.tau_short_days,
                tau_long_days: config.learning.tau_long_days,
                bleed_beta: config.learning.bleed_beta,
                bleed_threshold: config.learning.bleed_threshold,
            },
        );
        let (events, _) = broadcast::channel(256);

        Self {
            store,
            registry,
            engine: Arc::new(ResonanceEngine::with_default_modules()),
            braider,
            coeffs,
            injector,
            config,
            vocab: BucketVocabulary::current(),
            events,
        }
    }

    /// Startup checks and seeding: verify the bucket vocabulary against the
    /// stored fingerprint and install the configured subscriptions.
    pub fn bootstrap(&self) -> Result<(), StoreError> {
        self.store.ensure_vocabulary(&self.vocab)?;
        for seed in &self.config.subscriptions {
            if seed.consumer_id.is_empty() {
                continue;
            }
            let subscription = Subscription {
                consumer_id: seed.consumer_id.clone(),
                kinds: seed.kinds.iter().map(|s| StrandKind::from_slug(s)).collect(),
                min_braid_level: seed.min_braid_level,
                min_score: seed.min_score,
                max_age_hours: seed.max_age_hours,
                max_items: seed.max_items,
                formatter: FormatterId::new(seed.formatter.clone()),
            };
            self.store.put_subscription(&subscription)?;
        }
        info!(subscriptions = self.config.subscriptions.len(), "coordinator bootstrapped");
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// The module output surface: consumers pull context through here.
    pub fn injector(&self) -> Arc<ContextInjector> {
        self.injector.clone()
    }

    pub fn store(&self) -> Arc<StrandStore> {
        self.store.clone()
    }

    // ── worker loop ───────────────────────────────────────────────────────

    /// Claim one batch and process it. Returns how many items were claimed.
    pub async fn step(&self) -> Result<usize, StoreError> {
        let visibility = Duration::seconds(self.config.queue.visibility_secs);
        let items = self.store.claim(self.config.queue.batch_size, visibility)?;
        let claimed = items.len();

        for item in items {
            match self.process_item(&item).await {
                Ok(()) => {
                    self.store.ack(item.seq)?;
                    let _ = self.events.send(ProgressEvent::Processed {
                        strand_id: item.strand_id,
                        kind: item.kind.clone(),
                    });
                }
                Err(ItemError::Park(reason)) => {
                    self.store.park(item.seq, &reason)?;
                    let _ = self.events.send(ProgressEvent::Parked {
                        seq: item.seq,
                        reason,
                    });
                }
                Err(ItemError::Transient(reason)) => {
                    warn!(seq = item.seq, %reason, "transient failure, nacking");
                    self.store.nack(item.seq, &reason)?;
                }
            }
        }
        Ok(claimed)
    }

    /// Process until the queue is quiet. Braids appended mid-drain enqueue
    /// more work, so this loops until a full pass claims nothing.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let n = self.step().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Run the worker pool until `shutdown` flips to true. Each worker is
    /// single-threaded internally; parallelism comes from the pool.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers = Vec::new();
        for worker_id in 0..self.config.queue.worker_count.max(1) {
            let coordinator = self.clone();
            let mut shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match coordinator.step().await {
                        Ok(0) => {
                            // Idle: wake on the next append, a poll tick, or
                            // shutdown, whichever comes first.
                            tokio::select! {
                                _ = coordinator.store.wait_for_append() => {}
                                _ = tokio::time::sleep(StdDuration::from_millis(500)) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(worker_id, %err, "worker step failed");
                            tokio::time::sleep(StdDuration::from_millis(500)).await;
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    // ── per-item pipeline ─────────────────────────────────────────────────

    #[instrument(skip(self, item), fields(seq = item.seq, strand = %item.strand_id, kind = %item.kind))]
    async fn process_item(&self, item: &OutboxItem) -> Result<(), ItemError> {
        let strand = match self.store.get(item.strand_id) {
            Ok(strand) => strand,
            Err(StoreError::NotFound(id)) => {
                return Err(ItemError::Park(format!("invalid: strand {id} missing")));
            }
            Err(err) => return Err(transient(err)),
        };

        if !strand.kind.is_known() {
            // The strand itself stays recorded; only the pipeline item is
            // parked.
            return Err(ItemError::Park("unsupported".to_string()));
        }

        let payload = StrandPayload::decode(&strand.kind, &strand.content)
            .map_err(|e| ItemError::Park(format!("invalid: {e}")))?;

        let config = self.registry.learning_config(&strand.kind, strand.braid_level);

        // Braids carry their parent-aggregated scores from creation;
        // everything else is scored here, idempotently.
        if strand.kind != StrandKind::Braid && !config.passive {
            self.score_with_cas(&strand, &config, &payload)?;
        }

        if !config.views.is_empty() {
            self.cluster_and_braid(&strand, &config).await?;
        }

        if strand.kind == StrandKind::PositionClosed {
            if let StrandPayload::PositionClosed(content) = &payload {
                let module = target_module(&strand);
                let report = self
                    .coeffs
                    .apply_position_closed(&module, strand.id, content)
                    .map_err(transient)?;
                if report.applied {
                    let _ = self.events.send(ProgressEvent::CoefficientsUpdated {
                        module,
                        trades: report.trades,
                    });
                }
            }
        }

        Ok(())
    }

    /// Score and write back under optimistic concurrency. The computation
    /// is deterministic for a given store state, so losing the CAS race
    /// just means another worker already wrote the same (or a newer) score.
    fn score_with_cas(
        &self,
        strand: &Strand,
        config: &LearningConfig,
        payload: &StrandPayload,
    ) -> Result<(), ItemError> {
        let scorer = self.engine.scorer(config.scorer);
        const CAS_ATTEMPTS: u32 = 3;

        for attempt in 0..CAS_ATTEMPTS {
            let fresh = self.store.get(strand.id).map_err(transient)?;
            let cohort =
                assemble_cohort(&self.store, &fresh, config, scorer).map_err(transient)?;
            let scores = self.engine.score(config.scorer, payload, &cohort);
            let keys = cluster_keys_for(&fresh, payload, &config.views, &self.vocab);

            match self
                .store
                .update_scores(fresh.id, fresh.score_version, scores, &keys)
            {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) if attempt + 1 < CAS_ATTEMPTS => {
                    debug!(id = %strand.id, attempt, "score CAS conflict, refreshing");
                }
                Err(StoreError::VersionConflict { .. }) => {
                    // A newer score is already in place.
                    return Ok(());
                }
                Err(err) => return Err(transient(err)),
            }
        }
        Ok(())
    }

    /// Re-cluster the strand's partition and braid any newly-complete
    /// cluster containing it. Backpressure sheds promotion first, then all
    /// braiding; scoring and coefficients are never shed.
    async fn cluster_and_braid(
        &self,
        strand: &Strand,
        config: &LearningConfig,
    ) -> Result<(), ItemError> {
        let depth = self.store.queue_depth().map_err(transient)?;
        let threshold = self.config.queue.backpressure_threshold;
        let is_promotion = strand.braid_level >= 2;
        if is_promotion && depth > threshold {
            let _ = self.events.send(ProgressEvent::Shed { stage: "promotion" });
            return Ok(());
        }
        if depth > threshold * 2 {
            let _ = self.events.send(ProgressEvent::Shed { stage: "braiding" });
            return Ok(());
        }

        let window = config.recency_window();
        let start = window_start(strand.created_at, window);
        let partition_window = TimeWindow {
            start,
            end: start + window,
        };
        let peers = self
            .store
            .scan(
                &strand.kind,
                partition_window,
                strand.braid_level,
                strand.braid_level,
                0.0,
            )
            .map_err(transient)?;

        let scored: Vec<(Strand, StrandPayload)> = peers
            .into_iter()
            .filter(|peer| peer.resonance.is_some())
            .filter_map(|peer| {
                StrandPayload::decode(&peer.kind, &peer.content)
                    .ok()
                    .map(|payload| (peer, payload))
            })
            .collect();

        let clusters = clusters_for_partition(
            &strand.kind,
            strand.braid_level,
            start,
            &scored,
            config,
            &self.vocab,
        );

        for cluster in clusters {
            if !cluster.members.iter().any(|m| m.id == strand.id) {
                continue;
            }
            match self.braider.braid_cluster(&cluster, config).await {
                Ok(BraidOutcome::Created(braid_id)) => {
                    self.injector.braid_promoted(&cluster.id.kind);
                    let braid_level = cluster.id.braid_level + 1;
                    let _ = self.events.send(ProgressEvent::BraidCreated {
                        braid_id,
                        source_kind: cluster.id.kind.clone(),
                        braid_level,
                    });
                }
                Ok(BraidOutcome::Failed(_)) => {
                    let _ = self.events.send(ProgressEvent::BraidFailed {
                        cluster: cluster.id.guard_key(),
                    });
                }
                Ok(BraidOutcome::AlreadyBraided(_) | BraidOutcome::Skipped(_)) => {}
                Err(BraiderError::Store(err)) => return Err(transient(err)),
                Err(BraiderError::Registry(err)) => {
                    return Err(ItemError::Park(format!("invalid: {err}")));
                }
            }
        }
        Ok(())
    }
}

/// Which module's coefficients an outcome strand feeds: an explicit
/// `module:<name>` tag wins, the decision maker is the default learner.
fn target_module(strand: &Strand) -> String {
    strand
        .tags
        .iter()
        .find_map(|tag| tag.strip_prefix("module:"))
        .unwrap_or("decision_maker")
        .to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use weft_config::AppConfig;
    use weft_context::ContextHint;
    use weft_store::Clock;
    use weft_llm::ScriptedLlm;
    use weft_store::{CoefficientKey, ManualClock, OutboxState, StrandStore};
    use weft_strand::{BucketVocabulary, Strand, StrandId, StrandKind};

    use super::Coordinator;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<StrandStore>,
        clock: Arc<ManualClock>,
        llm: Arc<ScriptedLlm>,
        coordinator: Coordinator,
    }

    fn harness_with(llm: ScriptedLlm, config: AppConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        // Mid-window so second-scale offsets never straddle a window-grid
        // boundary.
        let start = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(
            StrandStore::open(dir.path().join("weft.redb"), clock.clone()).unwrap(),
        );
        let llm = Arc::new(llm);
        let coordinator = Coordinator::new(store.clone(), llm.clone(), config);
        coordinator.bootstrap().unwrap();
        Harness {
            _dir: dir,
            store,
            clock,
            llm,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedLlm::always(braid_reply()), subscribed_config())
    }

    fn subscribed_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.subscriptions.push(weft_config::SubscriptionSeed {
            consumer_id: "decision_maker".to_string(),
            kinds: vec!["prediction_review".to_string(), "pattern".to_string()],
            min_braid_level: 2,
            min_score: 0.1,
            max_age_hours: 24,
            max_items: 8,
            formatter: "standard".to_string(),
        });
        config
    }

    fn braid_reply() -> serde_json::Value {
        json!({
            "summary": "Volume spikes on BTC 1m resolve upward within three bars.",
            "insights": ["Early entries outperform late ones"],
            "recommended_scope": "BTC|1m",
            "confidence": 0.74
        })
    }

    fn append_pattern(h: &Harness, offset_secs: i64) -> StrandId {
        let at = h.clock.now() + Duration::seconds(offset_secs);
        let strand = Strand::leaf(
            StrandId::new_at(at),
            StrandKind::Pattern,
            at,
            json!({
                "pattern_type": "volume_spike",
                "success_rate": 0.7,
                "confidence": 0.8,
                "sample_count": 25,
                "scale_quality": {"1m": 0.7, "5m": 0.72}
            }),
        )
        .with_symbol("BTC")
        .with_timeframe("1m");
        h.store.append(&strand).unwrap()
    }

    #[tokio::test]
    async fn minimal_braid_formation() {
        // Three identical patterns: one cluster, exactly one braid.
        let h = harness();
        let ids: Vec<_> = (0..3).map(|i| append_pattern(&h, i)).collect();

        h.coordinator.drain().await.unwrap();

        let stats = h.store.stats().unwrap();
        assert_eq!(stats.braids_total, 1);

        let braids = h
            .store
            .scan(
                &StrandKind::Braid,
                weft_store::TimeWindow::all(),
                2,
                u32::MAX,
                0.0,
            )
            .unwrap();
        let braid = &braids[0];
        assert_eq!(braid.braid_level, 2);
        assert_eq!(braid.parent_ids.len(), 3);
        for id in &ids {
            assert!(braid.parent_ids.contains(id));
        }
        assert!(!braid.content["summary"].as_str().unwrap().is_empty());
        assert!(braid.selection_score() > 0.0);

        // Every parent got scored with bounded resonance.
        for id in ids {
            let strand = h.store.get(id).unwrap();
            let scores = strand.resonance.unwrap();
            assert!(scores.in_bounds((0.0, 3.0)), "{scores:?}");
        }
    }

    #[tokio::test]
    async fn no_braid_below_the_cluster_threshold() {
        let h = harness();
        append_pattern(&h, 0);
        append_pattern(&h, 1);

        h.coordinator.drain().await.unwrap();

        assert_eq!(h.store.stats().unwrap().braids_total, 0);
        assert_eq!(h.llm.calls(), 0, "no cluster means no model call");

        // The third identical strand completes the cluster.
        append_pattern(&h, 2);
        h.coordinator.drain().await.unwrap();
        assert_eq!(h.store.stats().unwrap().braids_total, 1);
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn outcome_strand_updates_coefficients() {
        let h = harness();
        let at = h.clock.now();
        let strand = Strand::leaf(
            StrandId::new_at(at),
            StrandKind::PositionClosed,
            at,
            json!({
                "entry_context": {
                    "curator": "A",
                    "chain": "base",
                    "mcap_bucket": "1m-2m",
                    "vol_bucket": "250k-500k",
                    "age_bucket": "3-7d"
                },
                "completed_trades": [
                    {"rr": 1.42, "exit_timestamp": at - Duration::days(7)}
                ]
            }),
        );
        h.store.append(&strand).unwrap();

        h.coordinator.drain().await.unwrap();

        let vocab = BucketVocabulary::current();
        let curator = h
            .store
            .get_coefficient(
                &CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A"),
                vocab.version(),
            )
            .unwrap()
            .unwrap();
        // weight_short = (1 - 0.378) * 1.0 + 0.378 * 1.42
        assert!((curator.weight_short - 1.1587).abs() < 1e-3);

        let interaction = h
            .store
            .get_coefficient(
                &CoefficientKey::new(
                    "decision_maker",
                    "allocation",
                    "interaction",
                    "age=3-7d|cap=1m-2m|chain=base|curator=A|vol=250k-500k",
                ),
                vocab.version(),
            )
            .unwrap()
            .unwrap();
        assert!((interaction.weight_short - 1.1587).abs() < 1e-3);
    }

    #[tokio::test]
    async fn context_degrades_then_recovers_when_a_braid_qualifies() {
        let h = harness();
        let injector = h.coordinator.injector();

        let empty = injector.get_context("decision_maker", &ContextHint::default());
        assert!(empty.degraded);
        assert!(empty.insights.is_empty());

        for i in 0..3 {
            append_pattern(&h, i);
        }
        h.coordinator.drain().await.unwrap();

        let payload = injector.get_context("decision_maker", &ContextHint::default());
        assert!(!payload.degraded);
        assert!(!payload.insights.is_empty());
        assert!(!payload.lineage.is_empty());
    }

    #[tokio::test]
    async fn replaying_the_outbox_is_idempotent() {
        let h = harness();
        for i in 0..3 {
            append_pattern(&h, i);
        }
        let at = h.clock.now();
        let outcome = Strand::leaf(
            StrandId::new_at(at),
            StrandKind::PositionClosed,
            at,
            json!({
                "entry_context": {"curator": "A", "chain": "base"},
                "completed_trades": [{"rr": 1.42, "exit_timestamp": at}]
            }),
        );
        h.store.append(&outcome).unwrap();
        h.coordinator.drain().await.unwrap();

        let vocab = BucketVocabulary::current();
        let curator_key =
            CoefficientKey::new("decision_maker", "allocation", "curator", "curator=A");
        let curator_before = h
            .store
            .get_coefficient(&curator_key, vocab.version())
            .unwrap()
            .unwrap();

        let stats_before = h.store.stats().unwrap();
        let scores_before: Vec<_> = h
            .store
            .scan(
                &StrandKind::Pattern,
                weft_store::TimeWindow::all(),
                1,
                1,
                0.0,
            )
            .unwrap()
            .into_iter()
            .map(|s| (s.id, s.resonance.unwrap()))
            .collect();
        let calls_before = h.llm.calls();

        // Replay every completed item through a fresh claim cycle.
        for item in h.store.dump_outbox().unwrap() {
            assert_eq!(item.state, OutboxState::Completed);
            h.store.requeue(item.seq).unwrap();
        }
        h.coordinator.drain().await.unwrap();

        let stats_after = h.store.stats().unwrap();
        assert_eq!(stats_after.braids_total, stats_before.braids_total);
        assert_eq!(stats_after.strands_total, stats_before.strands_total);
        assert_eq!(h.llm.calls(), calls_before, "no new model calls on replay");

        for (id, before) in scores_before {
            let after = h.store.get(id).unwrap().resonance.unwrap();
            assert_eq!(before, after, "scores must replay bit-identically");
        }

        // The outcome guard keeps coefficients from double-counting.
        let curator_after = h
            .store
            .get_coefficient(&curator_key, vocab.version())
            .unwrap()
            .unwrap();
        assert_eq!(curator_before.weight_short, curator_after.weight_short);
        assert_eq!(curator_before.observation_count, curator_after.observation_count);
    }

    #[tokio::test]
    async fn unknown_kind_is_stored_but_parked_as_unsupported() {
        let h = harness();
        let at = h.clock.now();
        let strand = Strand::leaf(
            StrandId::new_at(at),
            StrandKind::Other("sentiment_pulse".to_string()),
            at,
            json!({"anything": true}),
        );
        let id = h.store.append(&strand).unwrap();

        h.coordinator.drain().await.unwrap();

        // Recorded, unscored, and the queue item is parked with a reason.
        assert!(h.store.get(id).is_ok());
        let dump = h.store.dump_outbox().unwrap();
        assert_eq!(dump[0].state, OutboxState::Failed);
        assert_eq!(dump[0].reason.as_deref(), Some("unsupported"));
    }

    #[tokio::test]
    async fn malformed_payload_is_parked_as_invalid() {
        let h = harness();
        let at = h.clock.now();
        let strand = Strand::leaf(
            StrandId::new_at(at),
            StrandKind::PositionClosed,
            at,
            json!({"not": "a position"}),
        );
        h.store.append(&strand).unwrap();

        h.coordinator.drain().await.unwrap();

        let dump = h.store.dump_outbox().unwrap();
        assert_eq!(dump[0].state, OutboxState::Failed);
        assert!(dump[0].reason.as_deref().unwrap().starts_with("invalid"));
    }

    #[tokio::test]
    async fn braids_recluster_into_higher_levels() {
        // Three braids sharing a recommended scope promote to level 3.
        let h = harness();

        // Three separate pattern signatures, each clustering to its own
        // braid with the same recommended scope.
        for (symbol, base) in [("BTC", 0), ("ETH", 10), ("SOL", 20)] {
            for i in 0..3 {
                let at = h.clock.now() + Duration::seconds(base + i);
                let strand = Strand::leaf(
                    StrandId::new_at(at),
                    StrandKind::Pattern,
                    at,
                    json!({
                        "pattern_type": "volume_spike",
                        "success_rate": 0.7,
                        "confidence": 0.8,
                        "sample_count": 25
                    }),
                )
                .with_symbol(symbol)
                .with_timeframe("1m");
                h.store.append(&strand).unwrap();
            }
        }

        h.coordinator.drain().await.unwrap();

        let level2 = h
            .store
            .scan(&StrandKind::Braid, weft_store::TimeWindow::all(), 2, 2, 0.0)
            .unwrap();
        assert_eq!(level2.len(), 3);

        let level3 = h
            .store
            .scan(&StrandKind::Braid, weft_store::TimeWindow::all(), 3, 3, 0.0)
            .unwrap();
        assert_eq!(level3.len(), 1, "shared scope should promote");
        assert_eq!(level3[0].parent_ids.len(), 3);
    }
}
