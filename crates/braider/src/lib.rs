//! LLM braider: deduplicated synthesis of cluster → braid strands.
//!
//! For a complete cluster the braider materializes the kind's braid template
//! with member summaries and aggregate statistics, calls the LLM capability,
//! validates the reply against [`BraidSynthesis`], and appends the braid
//! under the cluster's guard key so the same cluster never braids twice in
//! one window. Schema violations retry with a hardened prompt; transient
//! errors retry with jittered backoff; a spent retry budget parks the
//! cluster and appends a `braid_failed` strand recording the cause.

pub mod promote;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use weft_cluster::{Cluster, cluster_keys_for};
use weft_llm::{LlmCapability, LlmError};
use weft_prompt::{BraidSynthesis, PromptRegistry, RegistryError};
use weft_store::{StoreError, StrandStore};
use weft_strand::{
    BraidContent, BraidFailedContent, BucketVocabulary, LearningConfig, Strand, StrandId,
    StrandKind, StrandPayload,
};

pub use promote::{PromotionPlan, PromotionSkip, plan_promotion};

#[derive(Debug, thiserror::Error)]
pub enum BraiderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to one cluster.
#[derive(Debug)]
pub enum BraidOutcome {
    /// A new braid was appended.
    Created(StrandId),
    /// The cluster already produced a braid in this window.
    AlreadyBraided(StrandId),
    /// Promotion rules skipped the cluster (level cap, mixed levels, no
    /// prompt configured).
    Skipped(String),
    /// The retry budget was spent; a `braid_failed` strand records why.
    Failed(StrandId),
}

pub struct Braider {
    store: Arc<StrandStore>,
    registry: Arc<PromptRegistry>,
    llm: Arc<dyn LlmCapability>,
    vocab: BucketVocabulary,
    max_retries: u32,
    /// Base of the jittered retry backoff, in milliseconds.
    backoff_base_ms: u64,
}

impl Braider {
    pub fn new(
        store: Arc<StrandStore>,
        registry: Arc<PromptRegistry>,
        llm: Arc<dyn LlmCapability>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            registry,
            llm,
            vocab: BucketVocabulary::current(),
            max_retries,
            backoff_base_ms: 200,
        }
    }

    /// Synthesize one cluster. Store failures bubble up for the caller's
    /// retry machinery; LLM failures are consumed here and turn into
    /// [`BraidOutcome::Failed`].
    #[instrument(skip(self, cluster, config), fields(guard = %cluster.id.guard_key(), members = cluster.members.len()))]
    pub async fn braid_cluster(
        &self,
        cluster: &Cluster,
        config: &LearningConfig,
    ) -> Result<BraidOutcome, BraiderError> {
        let guard_key = cluster.id.guard_key();

        if let Some(existing) = self.store.braid_for_guard(&guard_key)? {
            debug!(braid = %existing, "cluster already braided in this window");
            return Ok(BraidOutcome::AlreadyBraided(existing));
        }

        let Some(template_id) = config.braid_prompt.clone() else {
            return Ok(BraidOutcome::Skipped("no braid prompt configured".to_string()));
        };

        let plan = match promote::plan_promotion(cluster, config) {
            Ok(plan) => plan,
            Err(PromotionSkip::MaxLevelReached { level }) => {
                return Ok(BraidOutcome::Skipped(format!("members already at level {level}")));
            }
            Err(PromotionSkip::MixedParentLevels) => {
                warn!("cluster with mixed parent levels reached the braider");
                return Ok(BraidOutcome::Skipped("mixed parent levels".to_string()));
            }
        };

        let variables = self.cluster_variables(cluster);
        let synthesis = match self.call_with_retries(&template_id, &variables).await {
            Ok(synthesis) => synthesis,
            Err(cause) => {
                let failed_id = self.append_braid_failed(&guard_key, &cause)?;
                return Ok(BraidOutcome::Failed(failed_id));
            }
        };

        let braid = self.build_braid(cluster, config, &plan, synthesis);
        match self.store.append_braid(&braid, &guard_key) {
            Ok(id) => {
                info!(braid = %id, level = braid.braid_level, "braid created");
                Ok(BraidOutcome::Created(id))
            }
            // A parallel worker won the race; theirs is the braid of record.
            Err(StoreError::AlreadyBraided(_)) => {
                let existing = self
                    .store
                    .braid_for_guard(&guard_key)?
                    .expect("guard exists after AlreadyBraided");
                Ok(BraidOutcome::AlreadyBraided(existing))
            }
            Err(other) => Err(other.into()),
        }
    }

    // ── prompt assembly ───────────────────────────────────────────────────

    fn cluster_variables(&self, cluster: &Cluster) -> BTreeMap<String, String> {
        let members_block = cluster
            .members
            .iter()
            .map(member_summary)
            .collect::<Vec<_>>()
            .join("\n");

        let count = cluster.members.len() as f64;
        let mean = |f: fn(&Strand) -> f64| -> f64 {
            cluster.members.iter().map(f).sum::<f64>() / count.max(1.0)
        };
        let stats = format!(
            "mean_selection_score: {:.3}\nmean_rho: {:.3}\nmean_phi: {:.3}",
            mean(|m| m.resonance.map(|r| r.selection_score).unwrap_or(0.0)),
            mean(|m| m.resonance.map(|r| r.rho).unwrap_or(1.0)),
            mean(|m| m.resonance.map(|r| r.phi).unwrap_or(0.5)),
        );

        BTreeMap::from([
            ("view".to_string(), cluster.id.view.slug().to_string()),
            ("bucket".to_string(), cluster.id.bucket.clone()),
            ("member_count".to_string(), cluster.members.len().to_string()),
            ("members".to_string(), members_block),
            ("stats".to_string(), stats),
        ])
    }

    async fn call_with_retries(
        &self,
        template_id: &weft_strand::TemplateId,
        variables: &BTreeMap<String, String>,
    ) -> Result<BraidSynthesis, String> {
        let mut harden = false;
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }

            let request = if harden {
                self.registry.materialize_hardened(template_id, None, variables)
            } else {
                self.registry.materialize(template_id, None, variables)
            }
            .map_err(|e| e.to_string())?;

            match self.llm.call(&request).await {
                Ok(value) => match BraidSynthesis::validate(&value) {
                    Ok(synthesis) => return Ok(synthesis),
                    Err(err) => {
                        warn!(attempt, %err, "braid reply failed validation");
                        harden = true;
                        last_error = err.to_string();
                    }
                },
                Err(err @ (LlmError::NotJson(_) | LlmError::MissingContent(_))) => {
                    warn!(attempt, %err, "braid reply was not valid json");
                    harden = true;
                    last_error = err.to_string();
                }
                Err(err) => {
                    warn!(attempt, %err, "transient llm failure");
                    last_error = err.to_string();
                }
            }
        }
        Err(last_error)
    }

    fn backoff(&self, attempt: u32) -> StdDuration {
        let exp = attempt.saturating_sub(1).min(8);
        let base = self.backoff_base_ms.max(1);
        let jitter = rand::thread_rng().gen_range(0..=base);
        StdDuration::from_millis(base * (1 << exp) + jitter)
    }

    // ── strand construction ───────────────────────────────────────────────

    fn build_braid(
        &self,
        cluster: &Cluster,
        config: &LearningConfig,
        plan: &PromotionPlan,
        synthesis: BraidSynthesis,
    ) -> Strand {
        let now = self.store.clock().now();
        let content = BraidContent {
            summary: synthesis.summary,
            insights: synthesis.insights,
            recommended_scope: synthesis.recommended_scope,
            confidence: synthesis.confidence,
            source_kind: cluster.id.kind.clone(),
            view: cluster.id.view,
            bucket: cluster.id.bucket.clone(),
        };

        let mut braid = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Braid,
            now,
            serde_json::to_value(&content).expect("braid content serializes"),
        );
        braid.braid_level = plan.braid_level.min(config.max_braid_level);
        braid.parent_ids = plan.parent_ids.clone();
        braid.resonance = Some(plan.scores);

        // Facets the parents agree on carry up to the braid.
        braid.symbol = uniform(cluster.members.iter().map(|m| m.symbol.clone()));
        braid.timeframe = uniform(cluster.members.iter().map(|m| m.timeframe.clone()));
        braid.regime = uniform(cluster.members.iter().map(|m| m.regime.clone()));

        // Materialize higher-order cluster keys so the promoter can group
        // this braid without re-deriving its payload.
        let braid_config = self.registry.learning_config(&StrandKind::Braid, braid.braid_level);
        let payload = StrandPayload::Braid(content);
        braid.cluster_keys = cluster_keys_for(&braid, &payload, &braid_config.views, &self.vocab);
        braid
    }

    fn append_braid_failed(&self, guard_key: &str, cause: &str) -> Result<StrandId, BraiderError> {
        let now = self.store.clock().now();
        let content = BraidFailedContent {
            cluster: guard_key.to_string(),
            cause: cause.to_string(),
            attempts: self.max_retries + 1,
        };
        let strand = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::BraidFailed,
            now,
            serde_json::to_value(&content).expect("braid_failed content serializes"),
        );
        let id = self.store.append(&strand)?;
        warn!(cluster = guard_key, cause, "cluster parked with braid_failed strand");
        Ok(id)
    }
}

/// `- id | key payload fields | resonance` line for the prompt.
fn member_summary(member: &Strand) -> String {
    let mut content = serde_json::to_string(&member.content)
        .unwrap_or_else(|_| "{}".to_string());
    if content.len() > 200 {
        content.truncate(200);
        content.push('…');
    }
    let resonance = member
        .resonance
        .map(|r| {
            format!(
                "phi={:.2} rho={:.2} theta={:.2} omega={:.2} S={:.2}",
                r.phi, r.rho, r.theta, r.omega, r.selection_score
            )
        })
        .unwrap_or_else(|| "unscored".to_string());
    format!("- {} | {} | {}", member.id, content, resonance)
}

fn uniform<I: Iterator<Item = Option<String>>>(mut values: I) -> Option<String> {
    let first = values.next()??;
    for value in values {
        if value.as_deref() != Some(first.as_str()) {
            return None;
        }
    }
    Some(first)
}
