//! Shared data model for the weft learning core.
//!
//! Every record the core touches is a [`Strand`]: an immutable event emitted
//! by one of the platform modules (pattern detectors, prediction engines,
//! planners, decision makers, traders) or by the core itself (braids). The
//! store is homogeneous: braids are strands with `braid_level >= 2` whose
//! content is an LLM synthesis of their parents.
//!
//! This crate is dependency-light on purpose: everything above it (store,
//! scoring, clustering, braiding, context) speaks these types.

pub mod id;
pub mod kind;
pub mod learning;
pub mod payload;
pub mod schema;
pub mod vocab;

pub use id::StrandId;
pub use kind::StrandKind;
pub use learning::{FormatterId, LearningConfig, ScorerId, Subscription, TemplateId, ViewId};
pub use payload::{
    BraidContent, BraidFailedContent, CompletedTrade, EntryContext, ExecutionOutcomeContent,
    PatternContent, PayloadError, PositionClosedContent, PredictionReviewContent, StrandPayload,
    TradeOutcomeContent, TradingDecisionContent, TradingPlanContent,
};
pub use schema::{ClusterKey, ResonanceScores, Strand};
pub use vocab::BucketVocabulary;
