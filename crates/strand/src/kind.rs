use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Discriminator for the strand table.
///
/// The named variants are the kinds the learning pipeline understands; any
/// other value a module appends is preserved as [`StrandKind::Other`] and
/// routed to the passive path (stored, never clustered or braided).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StrandKind {
    Pattern,
    PredictionReview,
    ConditionalTradingPlan,
    TradingDecision,
    TradeOutcome,
    ExecutionOutcome,
    PositionClosed,
    Braid,
    BraidFailed,
    Other(String),
}

impl StrandKind {
    /// Stable wire/storage slug. `Other` carries its original value verbatim.
    pub fn slug(&self) -> &str {
        match self {
            StrandKind::Pattern => "pattern",
            StrandKind::PredictionReview => "prediction_review",
            StrandKind::ConditionalTradingPlan => "conditional_trading_plan",
            StrandKind::TradingDecision => "trading_decision",
            StrandKind::TradeOutcome => "trade_outcome",
            StrandKind::ExecutionOutcome => "execution_outcome",
            StrandKind::PositionClosed => "position_closed",
            StrandKind::Braid => "braid",
            StrandKind::BraidFailed => "braid_failed",
            StrandKind::Other(s) => s,
        }
    }

    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "pattern" => StrandKind::Pattern,
            "prediction_review" => StrandKind::PredictionReview,
            "conditional_trading_plan" => StrandKind::ConditionalTradingPlan,
            "trading_decision" => StrandKind::TradingDecision,
            "trade_outcome" => StrandKind::TradeOutcome,
            "execution_outcome" => StrandKind::ExecutionOutcome,
            "position_closed" => StrandKind::PositionClosed,
            "braid" => StrandKind::Braid,
            "braid_failed" => StrandKind::BraidFailed,
            other => StrandKind::Other(other.to_string()),
        }
    }

    /// True for kinds the pipeline has a learning configuration for.
    pub fn is_known(&self) -> bool {
        !matches!(self, StrandKind::Other(_))
    }
}

impl fmt::Display for StrandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl Serialize for StrandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.slug())
    }
}

impl<'de> Deserialize<'de> for StrandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl de::Visitor<'_> for KindVisitor {
            type Value = StrandKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a strand kind slug")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StrandKind, E> {
                Ok(StrandKind::from_slug(v))
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}
