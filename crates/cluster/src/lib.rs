//! Multi-view clustering engine.
//!
//! For one `(kind, braid_level, window)` partition, strands are grouped
//! along the views named by the kind's learning config. Each view is a
//! deterministic bucketer over the strand's typed payload; a strand a view
//! cannot bucket is excluded from that view and nothing else. Buckets below
//! the minimum cluster size are not emitted. Across views the same strand
//! may belong to several clusters; within a module the view set is chosen
//! orthogonal, which [`views_pairwise_orthogonal`] verifies on synthetic
//! samples.

mod bucketer;
mod engine;
mod orthogonality;

pub use bucketer::{bucket_for, cluster_keys_for, window_start};
pub use engine::{Cluster, ClusterId, clusters_for_partition};
pub use orthogonality::{partition_refinement, views_pairwise_orthogonal};
