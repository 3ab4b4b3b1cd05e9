//! Property tests over random days and contexts.

use aline_core::{
    FeatureSchema, InferenceConfig, InferenceService, ModelConfig, ModelParams, ObservationMask,
    fuse, FusionRule, HourlyPosterior, LogisticLink, RiskAggregator,
};
use proptest::prelude::*;

fn service() -> InferenceService {
    let params =
        ModelParams::initialize(ModelConfig::tiny(20), &FeatureSchema::migraine_default(), 42)
            .unwrap();
    InferenceService::new(&params, None, InferenceConfig::default()).unwrap()
}

fn day_strategy() -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(prop::collection::vec(-3.0f64..3.0, 20), 24)
}

fn mask_strategy() -> impl Strategy<Value = [bool; 24]> {
    prop::array::uniform24(any::<bool>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_posteriors_well_formed(rows in day_strategy(), flags in mask_strategy()) {
        let svc = service();
        let seq = svc.sequence(rows).unwrap();
        let analysis = svc.analyze_day(&seq, ObservationMask::from_flags(flags)).unwrap();
        prop_assert_eq!(analysis.posteriors.len(), 24);
        for (h, p) in analysis.posteriors.iter().enumerate() {
            prop_assert_eq!(p.hour, h);
            prop_assert!(p.mean.iter().all(|m| m.is_finite()));
            prop_assert!(p.std.iter().all(|s| s.is_finite() && *s >= 0.0));
        }
    }

    #[test]
    fn prop_risk_interval_ordered(rows in day_strategy(), flags in mask_strategy()) {
        let svc = service();
        let seq = svc.sequence(rows).unwrap();
        let risk = svc.analyze_day(&seq, ObservationMask::from_flags(flags)).unwrap().risk;
        prop_assert!(0.0 <= risk.lower_bound);
        prop_assert!(risk.lower_bound <= risk.mean_probability);
        prop_assert!(risk.mean_probability <= risk.upper_bound);
        prop_assert!(risk.upper_bound <= 1.0);
    }

    #[test]
    fn prop_top_k_prefix_consistent(
        rows in day_strategy(),
        flags in mask_strategy(),
        k1 in 1i64..12,
        extra in 0i64..12,
    ) {
        let svc = service();
        let seq = svc.sequence(rows).unwrap();
        let mask = ObservationMask::from_flags(flags);
        let analysis = svc.analyze_day(&seq, mask).unwrap();
        let small = analysis.top_k(k1).unwrap();
        let large = analysis.top_k(k1 + extra).unwrap();
        prop_assert_eq!(small.available, mask.query_hours().len());
        prop_assert_eq!(small.selected.len(), (k1 as usize).min(small.available));
        prop_assert_eq!(&large.selected[..small.selected.len()], &small.selected[..]);
        prop_assert!(small.selected.iter().all(|s| !mask.is_observed(s.hour)));
        prop_assert!(small.selected.windows(2).all(|w| w[0].priority_score >= w[1].priority_score));
    }

    #[test]
    fn prop_fusion_tighter_than_any_hour(
        stds in prop::collection::vec(0.05f64..3.0, 1..24),
    ) {
        let posteriors: Vec<HourlyPosterior> = stds
            .iter()
            .enumerate()
            .map(|(hour, &s)| HourlyPosterior { hour, mean: vec![0.2; 4], std: vec![s; 4] })
            .collect();
        let fused = fuse(&posteriors, FusionRule::PrecisionWeighted);
        let min_var = stds.iter().map(|s| s * s).fold(f64::INFINITY, f64::min);
        prop_assert!(fused.var.iter().all(|v| *v <= min_var + 1e-12));

        let link = LogisticLink::new(vec![0.6, 0.5, 0.4, 0.3], -1.8);
        let est = RiskAggregator::new(InferenceConfig::default()).aggregate(&posteriors, &link);
        prop_assert!(est.lower_bound <= est.mean_probability && est.mean_probability <= est.upper_bound);
    }
}
