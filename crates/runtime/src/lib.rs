//! The coordinator: the single logical orchestrator of the learning
//! pipeline.
//!
//! Workers drain the store's outbox. For each item the coordinator loads
//! the strand, resolves its learning config, scores it against its cohort,
//! writes the scores back under optimistic concurrency, clusters the
//! affected partition, hands newly-complete clusters to the braider, and
//! fans outcome strands into the coefficient updater. An item is acked only
//! after every side effect is durable; everything before the ack is
//! idempotent, so redelivery after a crash converges to the same store
//! state.

mod cohort;
mod coordinator;
mod events;

pub use coordinator::Coordinator;
pub use events::ProgressEvent;
