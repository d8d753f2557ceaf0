use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use weft_strand::{BucketVocabulary, LearningConfig, Strand, StrandKind, StrandPayload, ViewId};

use crate::bucketer::bucket_for;

/// Identity of a cluster: the unit braiding is deduplicated on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterId {
    pub kind: StrandKind,
    pub braid_level: u32,
    pub view: ViewId,
    pub bucket: String,
    pub window_start: DateTime<Utc>,
}

impl ClusterId {
    /// Stable guard key for the braid idempotency table.
    pub fn guard_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.kind.slug(),
            self.braid_level,
            self.view.slug(),
            self.bucket,
            self.window_start.timestamp()
        )
    }
}

/// A braid candidate: one view bucket that reached the minimum size.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    /// Members ordered by `(created_at, id)`.
    pub members: Vec<Strand>,
}

/// Cluster one `(kind, braid_level)` partition along the config's views.
///
/// `strands` must already be restricted to the partition and window; the
/// caller passes each strand's decoded payload alongside it. Deterministic:
/// the same inputs produce the same clusters in the same order.
pub fn clusters_for_partition(
    kind: &StrandKind,
    braid_level: u32,
    window_start: DateTime<Utc>,
    strands: &[(Strand, StrandPayload)],
    config: &LearningConfig,
    vocab: &BucketVocabulary,
) -> Vec<Cluster> {
    if config.passive || config.views.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for &view in &config.views {
        // BTreeMap keeps bucket emission order stable across runs.
        let mut buckets: BTreeMap<String, Vec<Strand>> = BTreeMap::new();
        for (strand, payload) in strands {
            if strand.kind != *kind || strand.braid_level != braid_level {
                continue;
            }
            match bucket_for(view, strand, payload, vocab) {
                Some(bucket) => buckets.entry(bucket).or_default().push(strand.clone()),
                None => {
                    debug!(id = %strand.id, view = %view, "strand not bucketable for view");
                }
            }
        }

        for (bucket, mut members) in buckets {
            if members.len() < config.min_cluster_size {
                continue;
            }
            members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            out.push(Cluster {
                id: ClusterId {
                    kind: kind.clone(),
                    braid_level,
                    view,
                    bucket,
                    window_start,
                },
                members,
            });
        }
    }
    out
}
