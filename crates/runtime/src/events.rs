use weft_strand::{StrandId, StrandKind};

/// Structured progress events for observability. Emitted on a broadcast
/// channel; dropped silently when nobody listens.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Processed {
        strand_id: StrandId,
        kind: StrandKind,
    },
    BraidCreated {
        braid_id: StrandId,
        source_kind: StrandKind,
        braid_level: u32,
    },
    BraidFailed {
        cluster: String,
    },
    CoefficientsUpdated {
        module: String,
        trades: usize,
    },
    Parked {
        seq: u64,
        reason: String,
    },
    /// Backpressure shed low-priority work for this item.
    Shed {
        stage: &'static str,
    },
}
