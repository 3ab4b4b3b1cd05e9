//! Scalar helpers shared by the aggregator, the policy scorer and the reward.

use rand::Rng;

use crate::constants::PROB_EPSILON;

/// Logistic function, split on sign so large |x| never overflows `exp`.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// softplus(x) = ln(1 + eˣ), always ≥ 0.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Binary entropy in nats. Range: [0, ln 2].
pub fn binary_entropy(p: f64) -> f64 {
    let p = p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
    (-(p * p.ln() + (1.0 - p) * (1.0 - p).ln())).max(0.0)
}

/// Empirical quantile of an ascending slice with linear interpolation
/// between order statistics. Returns NaN for an empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + frac * (sorted[hi] - sorted[lo])
        }
    }
}

/// Standard normal draw via Box-Muller.
pub fn standard_normal(rng: &mut impl Rng) -> f64 {
    // ln(0) guard
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
