//! Subscription-driven context injection.
//!
//! `get_context(consumer, hint)` resolves the consumer's subscription, pulls
//! the braids that pass its level, score, and age filters, applies the hint
//! facets, and renders through the consumer's formatter into a
//! [`ContextPayload`]. Payloads are cached per `(consumer, hint)` for a
//! bounded TTL; the coordinator bumps a per-kind generation counter when a
//! new braid lands, which invalidates affected entries lazily. Read failures
//! degrade to an empty payload; the context surface never throws.

mod payload;

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use tracing::{debug, warn};

use weft_prompt::{FormatterSpec, PromptRegistry};
use weft_store::{StrandStore, TimeWindow};
use weft_strand::{BraidContent, Strand, StrandKind, Subscription};

pub use payload::{ContextCaveat, ContextHint, ContextInsight, ContextPayload};

#[derive(Clone)]
struct CachedPayload {
    payload: ContextPayload,
    cached_at: DateTime<Utc>,
    /// Per-kind braid generations observed at render time.
    generations: Vec<(String, u64)>,
}

pub struct ContextInjector {
    store: Arc<StrandStore>,
    registry: Arc<PromptRegistry>,
    cache: Mutex<LruCache<(String, String), CachedPayload>>,
    ttl: Duration,
    /// Bumped per source kind when a braid is promoted into it.
    generations: Mutex<HashMap<String, u64>>,
}

impl ContextInjector {
    pub fn new(
        store: Arc<StrandStore>,
        registry: Arc<PromptRegistry>,
        ttl: Duration,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("capacity is non-zero");
        Self {
            store,
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Invalidate cached payloads that subscribe to `source_kind`. Called by
    /// the coordinator when a new braid for that kind is created.
    pub fn braid_promoted(&self, source_kind: &StrandKind) {
        let mut generations = self.generations.lock().expect("generation lock poisoned");
        *generations.entry(source_kind.slug().to_string()).or_insert(0) += 1;
    }

    /// Assemble (or serve from cache) the context payload for a consumer.
    pub fn get_context(&self, consumer_id: &str, hint: &ContextHint) -> ContextPayload {
        let now = self.store.clock().now();
        let cache_key = (consumer_id.to_string(), hint.cache_key());

        if let Some(cached) = self.cache_lookup(&cache_key, now) {
            debug!(consumer = consumer_id, "context served from cache");
            return cached;
        }

        let payload = match self.assemble(consumer_id, hint, now) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(consumer = consumer_id, %err, "context assembly degraded");
                ContextPayload::empty(consumer_id, now)
            }
        };

        let generations = {
            let generations = self.generations.lock().expect("generation lock poisoned");
            generations.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        self.cache.lock().expect("cache lock poisoned").put(
            cache_key,
            CachedPayload {
                payload: payload.clone(),
                cached_at: now,
                generations,
            },
        );
        payload
    }

    fn cache_lookup(&self, key: &(String, String), now: DateTime<Utc>) -> Option<ContextPayload> {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        let cached = cache.get(key)?.clone();
        if now - cached.cached_at > self.ttl {
            cache.pop(key);
            return None;
        }

        let stale = {
            let generations = self.generations.lock().expect("generation lock poisoned");
            cached
                .generations
                .iter()
                .any(|(kind, seen)| generations.get(kind).copied().unwrap_or(0) != *seen)
                || generations.iter().any(|(kind, generation)| {
                    *generation > 0 && !cached.generations.iter().any(|(k, _)| k == kind)
                })
        };
        if stale {
            cache.pop(key);
            return None;
        }
        Some(cached.payload)
    }

    fn assemble(
        &self,
        consumer_id: &str,
        hint: &ContextHint,
        now: DateTime<Utc>,
    ) -> Result<ContextPayload, weft_store::StoreError> {
        let Some(subscription) = self.store.get_subscription(consumer_id)? else {
            debug!(consumer = consumer_id, "no subscription registered");
            return Ok(ContextPayload::empty(consumer_id, now));
        };

        let mut braids = self.eligible_braids(&subscription, hint, now)?;
        braids.sort_by(|(a, _), (b, _)| {
            b.selection_score()
                .total_cmp(&a.selection_score())
                .then(a.id.cmp(&b.id))
        });
        braids.truncate(subscription.max_items);

        let formatter = self.registry.formatter(subscription.formatter.as_str());
        Ok(self.render(consumer_id, &braids, formatter, now))
    }

    /// Braids summarizing the subscribed kinds that pass every filter:
    /// minimum level, minimum score, maximum age, and the hint facets.
    fn eligible_braids(
        &self,
        subscription: &Subscription,
        hint: &ContextHint,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Strand, BraidContent)>, weft_store::StoreError> {
        // The scan window is half-open at its end; nudge it past `now` so a
        // braid promoted this very instant already qualifies.
        let window = TimeWindow {
            start: now - subscription.max_age(),
            end: now + Duration::seconds(1),
        };
        let candidates = self.store.scan(
            &StrandKind::Braid,
            window,
            subscription.min_braid_level,
            u32::MAX,
            subscription.min_score,
        )?;

        let mut out = Vec::new();
        for braid in candidates {
            let Ok(content) = serde_json::from_value::<BraidContent>(braid.content.clone()) else {
                continue;
            };
            if !subscription.kinds.contains(&content.source_kind) {
                continue;
            }
            if !facet_matches(hint.symbol.as_deref(), braid.symbol.as_deref())
                || !facet_matches(hint.timeframe.as_deref(), braid.timeframe.as_deref())
                || !facet_matches(hint.regime.as_deref(), braid.regime.as_deref())
            {
                continue;
            }
            out.push((braid, content));
        }
        Ok(out)
    }

    fn render(
        &self,
        consumer_id: &str,
        braids: &[(Strand, BraidContent)],
        formatter: FormatterSpec,
        now: DateTime<Utc>,
    ) -> ContextPayload {
        let mut payload = ContextPayload::empty(consumer_id, now);

        let insights_per_braid = match formatter {
            FormatterSpec::Standard => 3,
            FormatterSpec::Compact => 1,
        };

        for (braid, content) in braids {
            let score = braid.selection_score();
            // The summary always leads; the braid's own insights follow.
            payload.insights.push(ContextInsight {
                text: content.summary.clone(),
                source_braid_id: braid.id,
                score,
            });
            for insight in content.insights.iter().take(insights_per_braid) {
                payload.insights.push(ContextInsight {
                    text: insight.clone(),
                    source_braid_id: braid.id,
                    score,
                });
            }

            if content.confidence < 0.5 {
                payload.caveats.push(ContextCaveat {
                    text: format!(
                        "synthesis confidence is only {:.2} for scope {}",
                        content.confidence, content.recommended_scope
                    ),
                    source_braid_id: braid.id,
                });
            }
            if braid.resonance.is_some_and(|r| r.insufficient_history) {
                payload.caveats.push(ContextCaveat {
                    text: "bucket history too short to evaluate improvement rate".to_string(),
                    source_braid_id: braid.id,
                });
            }
        }

        if matches!(formatter, FormatterSpec::Standard) {
            let mut seen = std::collections::HashSet::new();
            for (braid, _) in braids {
                if let Ok(lineage) = self.store.lineage(braid.id) {
                    for entry in lineage {
                        if seen.insert(entry.braid_id) {
                            payload.lineage.push(entry);
                        }
                    }
                }
            }
        }

        payload.quantitative_signals = quantitative_signals(braids);
        payload.degraded = payload.insights.is_empty();
        payload
    }
}

/// Hint facet semantics: an unset hint matches anything; a set hint matches
/// braids carrying the same facet or none (scope-general insights still
/// apply).
fn facet_matches(hint: Option<&str>, braid: Option<&str>) -> bool {
    match (hint, braid) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(h), Some(b)) => h == b,
    }
}

fn quantitative_signals(braids: &[(Strand, BraidContent)]) -> BTreeMap<String, f64> {
    let mut signals = BTreeMap::new();
    if braids.is_empty() {
        return signals;
    }
    let n = braids.len() as f64;
    let scores: Vec<f64> = braids.iter().map(|(b, _)| b.selection_score()).collect();
    signals.insert("braid_count".to_string(), n);
    signals.insert(
        "mean_selection_score".to_string(),
        scores.iter().sum::<f64>() / n,
    );
    signals.insert(
        "max_selection_score".to_string(),
        scores.iter().copied().fold(f64::MIN, f64::max),
    );
    signals.insert(
        "mean_confidence".to_string(),
        braids.iter().map(|(_, c)| c.confidence).sum::<f64>() / n,
    );
    signals
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use weft_prompt::PromptRegistry;
    use weft_store::{Clock, ManualClock, StrandStore};
    use weft_strand::{
        BraidContent, FormatterId, ResonanceScores, Strand, StrandId, StrandKind, Subscription,
        ViewId,
    };

    use super::{ContextHint, ContextInjector};

    fn harness() -> (tempfile::TempDir, Arc<StrandStore>, ContextInjector, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(
            StrandStore::open(dir.path().join("weft.redb"), clock.clone()).unwrap(),
        );
        let injector = ContextInjector::new(
            store.clone(),
            Arc::new(PromptRegistry::with_defaults()),
            Duration::minutes(15),
            64,
        );
        (dir, store, injector, clock)
    }

    fn subscribe(store: &StrandStore, consumer: &str, kind: StrandKind) {
        store
            .put_subscription(&Subscription {
                consumer_id: consumer.to_string(),
                kinds: vec![kind],
                min_braid_level: 2,
                min_score: 0.3,
                max_age_hours: 24,
                max_items: 4,
                formatter: FormatterId::new("standard"),
            })
            .unwrap();
    }

    fn seed_braid(store: &StrandStore, clock: &ManualClock, source_kind: StrandKind, score: f64) -> StrandId {
        let now = clock.now();
        // A leaf parent so lineage has something to walk.
        let parent = Strand::leaf(
            StrandId::new_at(now),
            source_kind.clone(),
            now,
            json!({"method": "breakout", "success": true}),
        );
        store.append(&parent).unwrap();

        let content = BraidContent {
            summary: "Breakout predictions on majors hold up in trending regimes.".to_string(),
            insights: vec!["Skip breakouts in chop".to_string()],
            recommended_scope: "general".to_string(),
            confidence: 0.8,
            source_kind,
            view: ViewId::Method,
            bucket: "breakout".to_string(),
        };
        let mut braid = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Braid,
            now,
            serde_json::to_value(&content).unwrap(),
        );
        braid.braid_level = 2;
        braid.parent_ids = vec![parent.id];
        braid.resonance = Some(ResonanceScores {
            selection_score: score,
            ..ResonanceScores::neutral()
        });
        store.append(&braid).unwrap()
    }

    #[test]
    fn empty_store_degrades_instead_of_failing() {
        let (_dir, store, injector, _clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);

        let payload = injector.get_context("decision_maker", &ContextHint::default());
        assert!(payload.degraded);
        assert!(payload.insights.is_empty());
        assert_eq!(payload.consumer_id, "decision_maker");
    }

    #[test]
    fn qualifying_braid_appears_and_clears_the_degraded_flag() {
        let (_dir, store, injector, clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);

        let braid_id = seed_braid(&store, &clock, StrandKind::PredictionReview, 0.7);
        injector.braid_promoted(&StrandKind::PredictionReview);

        let payload = injector.get_context("decision_maker", &ContextHint::default());
        assert!(!payload.degraded);
        assert!(payload.insights.iter().any(|i| i.source_braid_id == braid_id));
        assert!(!payload.lineage.is_empty());
        assert!(payload.quantitative_signals.contains_key("mean_selection_score"));
    }

    #[test]
    fn filters_enforce_score_age_and_item_cap() {
        let (_dir, store, injector, clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);

        // Below min_score: excluded.
        seed_braid(&store, &clock, StrandKind::PredictionReview, 0.1);
        // Qualifying braids, more than max_items of them.
        for _ in 0..6 {
            clock.advance(Duration::seconds(1));
            seed_braid(&store, &clock, StrandKind::PredictionReview, 0.7);
        }
        injector.braid_promoted(&StrandKind::PredictionReview);

        let payload = injector.get_context("decision_maker", &ContextHint::default());
        let distinct: std::collections::HashSet<_> =
            payload.insights.iter().map(|i| i.source_braid_id).collect();
        assert!(distinct.len() <= 4, "max_items braids expected");
        assert!(payload.insights.iter().all(|i| i.score >= 0.3));
    }

    #[test]
    fn stale_braids_age_out_of_context() {
        let (_dir, store, injector, clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);

        seed_braid(&store, &clock, StrandKind::PredictionReview, 0.7);
        injector.braid_promoted(&StrandKind::PredictionReview);
        clock.advance(Duration::hours(48));

        let payload = injector.get_context("decision_maker", &ContextHint::default());
        assert!(payload.degraded);
        assert!(payload.insights.is_empty());
    }

    #[test]
    fn cache_serves_until_a_new_braid_invalidates() {
        let (_dir, store, injector, clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);
        seed_braid(&store, &clock, StrandKind::PredictionReview, 0.7);
        injector.braid_promoted(&StrandKind::PredictionReview);

        let first = injector.get_context("decision_maker", &ContextHint::default());
        let first_count = first.insights.len();

        // A new braid lands but the cache has not been invalidated: the
        // cached payload is still served inside the TTL.
        clock.advance(Duration::seconds(5));
        seed_braid(&store, &clock, StrandKind::PredictionReview, 0.9);
        let cached = injector.get_context("decision_maker", &ContextHint::default());
        assert_eq!(cached.insights.len(), first_count);

        // Promotion bumps the generation; the next call re-renders.
        injector.braid_promoted(&StrandKind::PredictionReview);
        let fresh = injector.get_context("decision_maker", &ContextHint::default());
        assert!(fresh.insights.len() > first_count);
    }

    #[test]
    fn hint_facets_filter_by_symbol() {
        let (_dir, store, injector, clock) = harness();
        subscribe(&store, "decision_maker", StrandKind::PredictionReview);

        let braid_id = seed_braid(&store, &clock, StrandKind::PredictionReview, 0.7);
        // Stamp the braid's symbol by re-reading and appending a sibling
        // with a different symbol.
        let mut eth = store.get(braid_id).unwrap();
        eth.id = StrandId::new_at(clock.now() + Duration::seconds(2));
        eth.symbol = Some("ETH".to_string());
        eth.created_at = clock.now() + Duration::seconds(2);
        store.append(&eth).unwrap();
        injector.braid_promoted(&StrandKind::PredictionReview);

        let hint = ContextHint {
            symbol: Some("BTC".to_string()),
            ..ContextHint::default()
        };
        let payload = injector.get_context("decision_maker", &hint);
        // The unfaceted braid still applies; the ETH-faceted one is gone.
        assert!(payload.insights.iter().any(|i| i.source_braid_id == braid_id));
        assert!(!payload.insights.iter().any(|i| i.source_braid_id == eth.id));
    }
}
