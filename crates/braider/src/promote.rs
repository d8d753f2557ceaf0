//! Promotion rules for braids.
//!
//! Braids are strands, so clusters of braids at level L feed the same
//! braiding path as leaves; what promotion adds is the level arithmetic, the
//! parent-level invariant, and the parent-weighted score aggregation.

use weft_cluster::Cluster;
use weft_resonance::ResonanceEngine;
use weft_strand::{LearningConfig, ResonanceScores, StrandId};

/// Why a cluster is not promoted. Neither case is an error: the cluster
/// simply stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionSkip {
    /// Every member already sits at the configured maximum level.
    MaxLevelReached { level: u32 },
    /// Members at mixed levels; the partition upstream is expected to
    /// prevent this, so it is surfaced for logging rather than braided
    /// through.
    MixedParentLevels,
}

/// Level and scores a cluster's braid would carry.
#[derive(Debug, Clone)]
pub struct PromotionPlan {
    pub braid_level: u32,
    pub parent_ids: Vec<StrandId>,
    pub scores: ResonanceScores,
}

/// Decide whether and at what level a cluster promotes. Parents contribute
/// to the braid's scores proportionally to their normalized selection
/// scores.
pub fn plan_promotion(
    cluster: &Cluster,
    config: &LearningConfig,
) -> Result<PromotionPlan, PromotionSkip> {
    let first_level = cluster
        .members
        .first()
        .map(|m| m.braid_level)
        .unwrap_or(1);
    if cluster.members.iter().any(|m| m.braid_level != first_level) {
        return Err(PromotionSkip::MixedParentLevels);
    }
    if first_level >= config.max_braid_level {
        return Err(PromotionSkip::MaxLevelReached { level: first_level });
    }

    let parent_scores: Vec<ResonanceScores> = cluster
        .members
        .iter()
        .map(|m| m.resonance.unwrap_or_else(ResonanceScores::neutral))
        .collect();

    Ok(PromotionPlan {
        braid_level: first_level + 1,
        parent_ids: cluster.members.iter().map(|m| m.id).collect(),
        scores: ResonanceEngine::aggregate_parents(&parent_scores),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use weft_cluster::{Cluster, ClusterId};
    use weft_strand::{
        LearningConfig, ResonanceScores, ScorerId, Strand, StrandId, StrandKind, TemplateId, ViewId,
    };

    use super::{PromotionSkip, plan_promotion};

    fn config(max_level: u32) -> LearningConfig {
        LearningConfig {
            views: vec![ViewId::Scope],
            scorer: ScorerId::Braid,
            braid_prompt: Some(TemplateId::new("braid_meta")),
            min_cluster_size: 3,
            max_braid_level: max_level,
            recency_window_hours: 24,
            passive: false,
        }
    }

    fn member(level: u32, selection: f64) -> Strand {
        let now = Utc::now();
        let mut strand = Strand::leaf(
            StrandId::new_at(now),
            StrandKind::Braid,
            now,
            json!({"summary": "s"}),
        );
        strand.braid_level = level;
        strand.resonance = Some(ResonanceScores {
            selection_score: selection,
            ..ResonanceScores::neutral()
        });
        strand
    }

    fn cluster(members: Vec<Strand>) -> Cluster {
        Cluster {
            id: ClusterId {
                kind: StrandKind::Braid,
                braid_level: members.first().map(|m| m.braid_level).unwrap_or(1),
                view: ViewId::Scope,
                bucket: "general".to_string(),
                window_start: Utc::now(),
            },
            members,
        }
    }

    #[test]
    fn promotion_raises_the_level_by_one() {
        let plan = plan_promotion(
            &cluster(vec![member(2, 0.6), member(2, 0.4), member(2, 0.5)]),
            &config(4),
        )
        .unwrap();
        assert_eq!(plan.braid_level, 3);
        assert_eq!(plan.parent_ids.len(), 3);
    }

    #[test]
    fn max_level_caps_promotion() {
        let err = plan_promotion(
            &cluster(vec![member(4, 0.6), member(4, 0.4), member(4, 0.5)]),
            &config(4),
        )
        .unwrap_err();
        assert_eq!(err, PromotionSkip::MaxLevelReached { level: 4 });
    }

    #[test]
    fn mixed_levels_are_refused() {
        let err = plan_promotion(
            &cluster(vec![member(2, 0.6), member(3, 0.4)]),
            &config(4),
        )
        .unwrap_err();
        assert_eq!(err, PromotionSkip::MixedParentLevels);
    }

    #[test]
    fn scores_lean_toward_the_stronger_parent() {
        let mut strong = member(2, 0.9);
        strong.resonance = Some(ResonanceScores {
            phi: 0.9,
            selection_score: 0.9,
            ..ResonanceScores::neutral()
        });
        let weak = member(2, 0.1);

        let plan = plan_promotion(&cluster(vec![strong, weak]), &config(4)).unwrap();
        assert!(plan.scores.phi > 0.8);
    }
}
