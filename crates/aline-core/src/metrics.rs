//! Prediction quality metrics over labeled days.

use serde::{Deserialize, Serialize};

/// ROC-AUC via the rank-sum statistic, with tied scores sharing their mean
/// rank. 0.5 when only one class is present.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> f64 {
    let n = scores.len().min(labels.len());
    let positives = labels[..n].iter().filter(|&&l| l).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their average
        let avg = (i + j + 2) as f64 / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }

    let rank_sum: f64 = (0..n).filter(|&k| labels[k]).map(|k| ranks[k]).sum();
    let p = positives as f64;
    (rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

/// Mean squared error of probabilities against 0/1 outcomes.
pub fn brier_score(probs: &[f64], labels: &[bool]) -> f64 {
    let n = probs.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    probs
        .iter()
        .zip(labels)
        .map(|(p, &y)| {
            let t = if y { 1.0 } else { 0.0 };
            (p - t).powi(2)
        })
        .sum::<f64>()
        / n as f64
}

/// Expected calibration error over `bins` equal-width probability bins.
pub fn expected_calibration_error(probs: &[f64], labels: &[bool], bins: usize) -> f64 {
    let n = probs.len().min(labels.len());
    if n == 0 || bins == 0 {
        return 0.0;
    }
    let mut count = vec![0usize; bins];
    let mut conf = vec![0.0; bins];
    let mut hits = vec![0.0; bins];
    for (p, &y) in probs.iter().zip(labels) {
        let b = ((p.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
        count[b] += 1;
        conf[b] += p;
        if y {
            hits[b] += 1.0;
        }
    }
    (0..bins)
        .filter(|&b| count[b] > 0)
        .map(|b| {
            let c = count[b] as f64;
            (c / n as f64) * (conf[b] / c - hits[b] / c).abs()
        })
        .sum()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    pub n: usize,
    pub auc: f64,
    pub brier: f64,
    pub mean_predicted: f64,
    pub actual_rate: f64,
    /// |mean predicted − actual rate|
    pub calibration_error: f64,
    pub expected_calibration_error: f64,
}

impl PredictionMetrics {
    pub fn compute(probs: &[f64], labels: &[bool]) -> Self {
        let n = probs.len().min(labels.len());
        let mean_predicted = crate::math::mean(&probs[..n]);
        let actual_rate = if n == 0 {
            0.0
        } else {
            labels[..n].iter().filter(|&&l| l).count() as f64 / n as f64
        };
        Self {
            n,
            auc: roc_auc(probs, labels),
            brier: brier_score(probs, labels),
            mean_predicted,
            actual_rate,
            calibration_error: (mean_predicted - actual_rate).abs(),
            expected_calibration_error: expected_calibration_error(probs, labels, 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [false, false, true, true];
        assert_abs_diff_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), 1.0);
        assert_abs_diff_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), 0.0);
    }

    #[test]
    fn test_auc_ties_count_half() {
        assert_abs_diff_eq!(roc_auc(&[0.5, 0.5], &[false, true]), 0.5);
        assert_abs_diff_eq!(roc_auc(&[0.1, 0.5, 0.5], &[false, false, true]), 0.75);
    }

    #[test]
    fn test_auc_single_class() {
        assert_eq!(roc_auc(&[0.1, 0.9], &[true, true]), 0.5);
        assert_eq!(roc_auc(&[], &[]), 0.5);
    }

    #[test]
    fn test_brier() {
        assert_abs_diff_eq!(brier_score(&[1.0, 0.0], &[true, false]), 0.0);
        assert_abs_diff_eq!(brier_score(&[0.5, 0.5], &[true, false]), 0.25);
    }

    #[test]
    fn test_calibration() {
        let m = PredictionMetrics::compute(&[0.2, 0.2, 0.2, 0.2, 0.2], &[true, false, false, false, false]);
        assert_abs_diff_eq!(m.calibration_error, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.expected_calibration_error, 0.0, epsilon = 1e-12);
        assert_eq!(m.n, 5);
    }
}
