//! Temporal-decay EWMA primitives.
//!
//! A trade's influence on a coefficient decays with its age: the decay
//! weight `w = exp(-age_days / tau)` becomes the effective smoothing factor
//! `alpha = w / (w + 1)`, clipped to `[0, 0.5]` so no single observation
//! ever moves a weight more than halfway to itself.

/// Exponential decay weight of an observation `age_days` old under time
/// constant `tau_days`.
pub fn decay_weight(age_days: f64, tau_days: f64) -> f64 {
    if tau_days <= 0.0 {
        return 0.0;
    }
    (-age_days.max(0.0) / tau_days).exp()
}

/// Effective EWMA alpha from a decay weight.
pub fn effective_alpha(decay_weight: f64) -> f64 {
    (decay_weight / (decay_weight + 1.0)).clamp(0.0, 0.5)
}

/// One EWMA step: `new = (1 - alpha) * old + alpha * observed`.
pub fn ewma(old: f64, observed: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * old + alpha * observed
}

/// One importance-bleed step toward the neutral weight 1.0:
/// `w <- w + beta * (1 - w)`.
pub fn bleed(weight: f64, beta: f64) -> f64 {
    weight + beta * (1.0 - weight)
}
