//! Versioned bucket vocabulary.
//!
//! Fixed boundary tables shared by the clustering views and the coefficient
//! updater. Bucketing is a pure function: the same value and vocabulary
//! version always yield the same label. Changing a boundary bumps
//! [`BucketVocabulary::CURRENT_VERSION`], which rotates the coefficient key
//! space; old coefficients are retained for audit, never merged.

use sha2::{Digest, Sha256};

const MCAP_BOUNDS: &[(f64, &str)] = &[
    (250_000.0, "sub-250k"),
    (500_000.0, "250k-500k"),
    (1_000_000.0, "500k-1m"),
    (2_000_000.0, "1m-2m"),
    (5_000_000.0, "2m-5m"),
    (10_000_000.0, "5m-10m"),
];
const MCAP_TOP: &str = "10m-plus";

const VOL_BOUNDS: &[(f64, &str)] = &[
    (50_000.0, "sub-50k"),
    (250_000.0, "50k-250k"),
    (500_000.0, "250k-500k"),
    (1_000_000.0, "500k-1m"),
];
const VOL_TOP: &str = "1m-plus";

const AGE_BOUNDS: &[(f64, &str)] = &[
    (1.0, "0-1d"),
    (3.0, "1-3d"),
    (7.0, "3-7d"),
    (30.0, "7-30d"),
];
const AGE_TOP: &str = "30d-plus";

const RATIO_BOUNDS: &[(f64, &str)] = &[
    (2.0, "ratio-lt-2"),
    (10.0, "ratio-2-10"),
    (50.0, "ratio-10-50"),
];
const RATIO_TOP: &str = "ratio-50-plus";

/// Fixed bucket boundary tables, addressed by version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketVocabulary {
    version: u32,
}

impl BucketVocabulary {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn current() -> Self {
        Self { version: Self::CURRENT_VERSION }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn mcap_bucket(&self, market_cap_usd: f64) -> &'static str {
        bucket_of(market_cap_usd, MCAP_BOUNDS, MCAP_TOP)
    }

    pub fn vol_bucket(&self, volume_24h_usd: f64) -> &'static str {
        bucket_of(volume_24h_usd, VOL_BOUNDS, VOL_TOP)
    }

    pub fn age_bucket(&self, token_age_days: f64) -> &'static str {
        bucket_of(token_age_days, AGE_BOUNDS, AGE_TOP)
    }

    pub fn ratio_bucket(&self, mcap_over_vol: f64) -> &'static str {
        bucket_of(mcap_over_vol, RATIO_BOUNDS, RATIO_TOP)
    }

    pub fn confidence_bucket(&self, confidence: f64) -> &'static str {
        if confidence < 0.33 {
            "low"
        } else if confidence < 0.66 {
            "medium"
        } else {
            "high"
        }
    }

    /// Hex fingerprint of the active boundary tables. Persisted in store
    /// metadata so a silently edited table is caught at startup instead of
    /// corrupting the coefficient key space.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for table in [MCAP_BOUNDS, VOL_BOUNDS, AGE_BOUNDS, RATIO_BOUNDS] {
            for (bound, label) in table {
                hasher.update(bound.to_le_bytes());
                hasher.update(label.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

fn bucket_of(value: f64, bounds: &[(f64, &'static str)], top: &'static str) -> &'static str {
    for (upper, label) in bounds {
        if value < *upper {
            return label;
        }
    }
    top
}
