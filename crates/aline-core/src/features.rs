//! Per-day input: the 24×F feature matrix, the observation mask, and the
//! channel schema that ties channels to interpretable latent axes.

use serde::{Deserialize, Serialize};

use crate::constants::{HOURS_PER_DAY, MISSING_SENTINEL, NORMALIZE_EPSILON};
use crate::error::ValidationError;

/// Interpretable latent health axes, in latent-vector order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatentAxis {
    Stress,
    SleepDebt,
    Hormonal,
    EnvironmentalLoad,
}

impl LatentAxis {
    pub const ALL: [LatentAxis; 4] = [
        LatentAxis::Stress,
        LatentAxis::SleepDebt,
        LatentAxis::Hormonal,
        LatentAxis::EnvironmentalLoad,
    ];

    pub fn index(self) -> usize {
        match self {
            LatentAxis::Stress => 0,
            LatentAxis::SleepDebt => 1,
            LatentAxis::Hormonal => 2,
            LatentAxis::EnvironmentalLoad => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LatentAxis::Stress => "stress",
            LatentAxis::SleepDebt => "sleep_debt",
            LatentAxis::Hormonal => "hormonal",
            LatentAxis::EnvironmentalLoad => "environmental_load",
        }
    }
}

/// One input channel: its name, the latent axis it drives (if any), and the
/// signed gain of that contribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(default)]
    pub axis: Option<LatentAxis>,
    #[serde(default)]
    pub gain: f32,
}

impl ChannelSpec {
    fn new(name: &str, axis: Option<LatentAxis>, gain: f32) -> Self {
        Self {
            name: name.to_string(),
            axis,
            gain,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub channels: Vec<ChannelSpec>,
}

impl FeatureSchema {
    /// The 20-channel migraine schema, in feature-row order.
    pub fn migraine_default() -> Self {
        use LatentAxis::*;
        let channels = vec![
            ChannelSpec::new("sleep_duration", Some(SleepDebt), -1.0),
            ChannelSpec::new("sleep_quality", Some(SleepDebt), -1.0),
            ChannelSpec::new("sleep_consistency", Some(SleepDebt), -1.0),
            ChannelSpec::new("stress_level", Some(Stress), 1.0),
            ChannelSpec::new("work_hours", Some(Stress), 1.0),
            ChannelSpec::new("anxiety_score", Some(Stress), 1.0),
            ChannelSpec::new("caffeine_intake", None, 0.0),
            ChannelSpec::new("water_intake", None, 0.0),
            ChannelSpec::new("meal_regularity", Some(Stress), -1.0),
            ChannelSpec::new("exercise_duration", Some(Stress), -1.0),
            ChannelSpec::new("physical_activity", Some(Stress), -1.0),
            ChannelSpec::new("neck_tension", Some(Stress), 1.0),
            ChannelSpec::new("screen_time", Some(EnvironmentalLoad), 1.0),
            // Low pressure is the trigger, so the level enters negatively.
            ChannelSpec::new("barometric_pressure", Some(EnvironmentalLoad), -1.0),
            ChannelSpec::new("noise_level", Some(EnvironmentalLoad), 1.0),
            ChannelSpec::new("hormone_fluctuation", Some(Hormonal), 1.0),
            ChannelSpec::new("menstrual_cycle_day", None, 0.0),
            ChannelSpec::new("alcohol_units", None, 0.0),
            ChannelSpec::new("smoking", None, 0.0),
            ChannelSpec::new("meditation_time", Some(Stress), -1.0),
        ];
        Self { channels }
    }

    /// Unnamed channels with no axis mapping.
    pub fn generic(width: usize) -> Self {
        Self {
            channels: (0..width)
                .map(|i| ChannelSpec::new(&format!("channel_{i}"), None, 0.0))
                .collect(),
        }
    }

    /// Schema for `width` channels: the migraine schema when the width
    /// matches it, generic otherwise.
    pub fn for_width(width: usize) -> Self {
        let default = Self::migraine_default();
        if default.len() == width {
            default
        } else {
            Self::generic(width)
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }
}

/// Per-channel z-score statistics applied before inference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureStats {
    pub fn identity(width: usize) -> Self {
        Self {
            mean: vec![0.0; width],
            std: vec![1.0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Both vectors cover exactly `width` channels.
    pub fn fits(&self, width: usize) -> bool {
        self.mean.len() == width && self.std.len() == width
    }
}

/// Validated 24×F feature matrix. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSequence {
    rows: Vec<Vec<f64>>,
    width: usize,
}

impl FeatureSequence {
    /// Validate shape and finiteness. Sentinel values pass through untouched.
    pub fn new(rows: Vec<Vec<f64>>, width: usize) -> Result<Self, ValidationError> {
        if rows.len() != HOURS_PER_DAY {
            return Err(ValidationError::RowCount {
                expected: HOURS_PER_DAY,
                got: rows.len(),
            });
        }
        for (hour, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ValidationError::ChannelWidth {
                    hour,
                    expected: width,
                    got: row.len(),
                });
            }
            if let Some(channel) = row.iter().position(|v| !v.is_finite()) {
                return Err(ValidationError::NonFinite { hour, channel });
            }
        }
        Ok(Self { rows, width })
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_missing(value: f64) -> bool {
        value <= MISSING_SENTINEL
    }

    /// Row-major 24·F buffer ready for the encoder. Applies z-score stats when
    /// given; missing channels become 0 (the normalized channel mean).
    pub fn normalized(&self, stats: Option<&FeatureStats>) -> Vec<f32> {
        let mut out = Vec::with_capacity(HOURS_PER_DAY * self.width);
        for row in &self.rows {
            for (c, &v) in row.iter().enumerate() {
                if Self::is_missing(v) {
                    out.push(0.0);
                    continue;
                }
                let z = match stats {
                    Some(s) => (v - s.mean[c]) / (s.std[c] + NORMALIZE_EPSILON),
                    None => v,
                };
                out.push(z as f32);
            }
        }
        out
    }
}

/// Which hours carry confirmed outcome information (the context set).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ObservationMask {
    observed: [bool; HOURS_PER_DAY],
}

impl ObservationMask {
    /// No context: every hour is a query hour.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            observed: [true; HOURS_PER_DAY],
        }
    }

    /// Build from a list of context hours. Duplicates are harmless.
    pub fn from_hours(hours: &[usize]) -> Result<Self, ValidationError> {
        let mut mask = Self::empty();
        for &hour in hours {
            if hour >= HOURS_PER_DAY {
                return Err(ValidationError::HourOutOfRange { hour: hour as i64 });
            }
            mask.observed[hour] = true;
        }
        Ok(mask)
    }

    /// Like [`ObservationMask::from_hours`] for caller-supplied signed hours.
    pub fn from_signed_hours(hours: &[i64]) -> Result<Self, ValidationError> {
        let mut mask = Self::empty();
        for &hour in hours {
            if !(0..HOURS_PER_DAY as i64).contains(&hour) {
                return Err(ValidationError::HourOutOfRange { hour });
            }
            mask.observed[hour as usize] = true;
        }
        Ok(mask)
    }

    pub fn from_flags(observed: [bool; HOURS_PER_DAY]) -> Self {
        Self { observed }
    }

    pub fn is_observed(&self, hour: usize) -> bool {
        self.observed.get(hour).copied().unwrap_or(false)
    }

    /// Copy of this mask with `hour` added to the context set.
    pub fn with_observed(mut self, hour: usize) -> Self {
        if hour < HOURS_PER_DAY {
            self.observed[hour] = true;
        }
        self
    }

    pub fn observed_hours(&self) -> Vec<usize> {
        (0..HOURS_PER_DAY).filter(|&h| self.observed[h]).collect()
    }

    pub fn query_hours(&self) -> Vec<usize> {
        (0..HOURS_PER_DAY).filter(|&h| !self.observed[h]).collect()
    }

    pub fn observed_count(&self) -> usize {
        self.observed.iter().filter(|&&o| o).count()
    }

    pub fn as_f32(&self) -> [f32; HOURS_PER_DAY] {
        self.observed.map(|o| if o { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize, width: usize, value: f64) -> Vec<Vec<f64>> {
        vec![vec![value; width]; n]
    }

    #[test]
    fn test_default_schema_shape() {
        let schema = FeatureSchema::migraine_default();
        assert_eq!(schema.len(), 20);
        assert_eq!(schema.channel_index("stress_level"), Some(3));
        let mapped = schema.channels.iter().filter(|c| c.axis.is_some()).count();
        assert!(mapped >= 4, "every axis should have at least one channel");
        for axis in LatentAxis::ALL {
            assert!(schema.channels.iter().any(|c| c.axis == Some(axis)));
        }
    }

    #[test]
    fn test_for_width_falls_back_to_generic() {
        assert_eq!(FeatureSchema::for_width(20), FeatureSchema::migraine_default());
        let generic = FeatureSchema::for_width(7);
        assert_eq!(generic.len(), 7);
        assert!(generic.channels.iter().all(|c| c.axis.is_none()));
    }

    #[test]
    fn test_rejects_twelve_rows() {
        let err = FeatureSequence::new(rows(12, 20, 0.0), 20).unwrap_err();
        assert_eq!(err, ValidationError::RowCount { expected: 24, got: 12 });
    }

    #[test]
    fn test_rejects_ragged_row() {
        let mut r = rows(24, 20, 0.0);
        r[5].pop();
        let err = FeatureSequence::new(r, 20).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ChannelWidth { hour: 5, expected: 20, got: 19 }
        );
    }

    #[test]
    fn test_rejects_nan() {
        let mut r = rows(24, 3, 0.0);
        r[2][1] = f64::NAN;
        let err = FeatureSequence::new(r, 3).unwrap_err();
        assert_eq!(err, ValidationError::NonFinite { hour: 2, channel: 1 });
    }

    #[test]
    fn test_sentinel_imputed_to_zero() {
        let mut r = rows(24, 2, 5.0);
        r[0][1] = MISSING_SENTINEL;
        let seq = FeatureSequence::new(r, 2).unwrap();
        let stats = FeatureStats {
            mean: vec![4.0, 4.0],
            std: vec![2.0, 2.0],
        };
        let flat = seq.normalized(Some(&stats));
        assert_eq!(flat.len(), 48);
        assert!((flat[0] - 0.5).abs() < 1e-5);
        assert_eq!(flat[1], 0.0);
    }

    #[test]
    fn test_mask_from_hours() {
        let mask = ObservationMask::from_hours(&[0, 3, 3, 23]).unwrap();
        assert_eq!(mask.observed_hours(), vec![0, 3, 23]);
        assert_eq!(mask.query_hours().len(), 21);
        assert_eq!(mask.observed_count(), 3);
        assert!(ObservationMask::from_hours(&[24]).is_err());
    }

    #[test]
    fn test_mask_rejects_negative_hour() {
        assert_eq!(
            ObservationMask::from_signed_hours(&[2, -1]).unwrap_err(),
            ValidationError::HourOutOfRange { hour: -1 }
        );
        assert_eq!(
            ObservationMask::from_signed_hours(&[2, 5]).unwrap().observed_hours(),
            vec![2, 5]
        );
    }

    #[test]
    fn test_mask_with_observed_is_copy() {
        let base = ObservationMask::empty();
        let next = base.with_observed(7);
        assert!(!base.is_observed(7));
        assert!(next.is_observed(7));
        assert_eq!(ObservationMask::full().query_hours(), Vec::<usize>::new());
    }
}
