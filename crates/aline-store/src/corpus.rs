//! Outcome corpus: days users labeled through feedback, reused for
//! fine-tuning and for per-user accuracy.

use std::path::Path;

use aline_core::time::{millis_to_rfc3339, now_unix_millis, parse_day};
use aline_core::wire::{AccuracyResponse, FeedbackHistoryItem, FeedbackRequest};
use aline_core::{Episode, FeatureSequence, FeatureStats, HOURS_PER_DAY};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::schema;

const DAY_MILLIS: u64 = 86_400_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledDay {
    pub id: Uuid,
    pub user_id: String,
    pub day: String,
    pub features: Vec<Vec<f64>>,
    pub outcome: bool,
    pub predicted_risk: Option<f64>,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub days: usize,
    pub users: usize,
    pub positives: usize,
    pub with_prediction: usize,
}

pub struct CorpusStore {
    conn: Connection,
}

impl CorpusStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Write ---

    pub fn record_feedback(&self, req: &FeedbackRequest) -> Result<Uuid> {
        self.record_feedback_at(req, now_unix_millis())
    }

    /// Insert or replace the record for (user, day).
    pub fn record_feedback_at(&self, req: &FeedbackRequest, created_at: u64) -> Result<Uuid> {
        if req.user_id.trim().is_empty() {
            return Err(StoreError::InvalidData("empty user_id".into()));
        }
        if parse_day(&req.day).is_none() {
            return Err(StoreError::InvalidData(format!(
                "day must be YYYY-MM-DD, got {:?}",
                req.day
            )));
        }
        if let Some(p) = req.predicted_risk.filter(|p| !(0.0..=1.0).contains(p)) {
            return Err(StoreError::InvalidData(format!(
                "predicted_risk must be in [0, 1], got {p}"
            )));
        }
        let width = req.features.first().map_or(0, Vec::len);
        FeatureSequence::new(req.features.clone(), width)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let features = serde_json::to_string(&req.features)
            .map_err(|e| StoreError::InvalidData(format!("features: {e}")))?;

        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT OR REPLACE INTO labeled_days
             (id, user_id, day, width, features, outcome, predicted_risk, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                req.user_id,
                req.day,
                width as i64,
                features,
                req.outcome as i32,
                req.predicted_risk,
                created_at as i64,
            ],
        )?;
        tracing::info!(
            "recorded feedback for user {} on {}: outcome={}",
            req.user_id,
            req.day,
            req.outcome
        );
        Ok(id)
    }

    // --- Read ---

    /// Every labeled day, optionally for one user, oldest day first.
    pub fn days(&self, user_id: Option<&str>) -> Result<Vec<LabeledDay>> {
        let sql = "SELECT id, user_id, day, features, outcome, predicted_risk, created_at
                   FROM labeled_days WHERE (?1 IS NULL OR user_id = ?1)
                   ORDER BY day, user_id";
        let mut stmt = self.conn.prepare(sql)?;
        let rows: Vec<(String, String, String, String, bool, Option<f64>, i64)> = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get::<_, i32>(4)? != 0,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, user_id, day, features, outcome, predicted_risk, created_at)| {
                Ok(LabeledDay {
                    id: parse_uuid(&id)?,
                    user_id,
                    day,
                    features: serde_json::from_str(&features).map_err(|e| {
                        StoreError::InvalidData(format!("features of {id}: {e}"))
                    })?,
                    outcome,
                    predicted_risk,
                    created_at: created_at.max(0) as u64,
                })
            })
            .collect()
    }

    /// Labeled days as training episodes for a model of `width` channels.
    /// Days recorded at another width are skipped.
    pub fn episodes(&self, width: usize, stats: Option<&FeatureStats>) -> Result<Vec<Episode>> {
        let mut episodes = Vec::new();
        let mut skipped = 0usize;
        for day in self.days(None)? {
            match FeatureSequence::new(day.features, width) {
                Ok(seq) => episodes.push(Episode::observed(seq.normalized(stats), width, day.outcome)),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("skipped {skipped} labeled days that are not {HOURS_PER_DAY}x{width}");
        }
        Ok(episodes)
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<FeedbackHistoryItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT day, predicted_risk, outcome, created_at FROM labeled_days
             WHERE user_id = ?1 ORDER BY day DESC LIMIT ?2",
        )?;
        let items = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(FeedbackHistoryItem {
                    day: row.get(0)?,
                    predicted_risk: row.get(1)?,
                    outcome: row.get::<_, i32>(2)? != 0,
                    recorded_at: millis_to_rfc3339(row.get::<_, i64>(3)?.max(0) as u64),
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(items)
    }

    pub fn accuracy(&self, user_id: &str, window_days: u32) -> Result<AccuracyResponse> {
        self.accuracy_at(user_id, window_days, now_unix_millis())
    }

    /// Accuracy of stored predictions recorded in the `window_days` before
    /// `now`. A prediction is correct when `(p > 0.5) == outcome`.
    pub fn accuracy_at(&self, user_id: &str, window_days: u32, now: u64) -> Result<AccuracyResponse> {
        let cutoff = now.saturating_sub(u64::from(window_days) * DAY_MILLIS);
        let mut stmt = self.conn.prepare(
            "SELECT predicted_risk, outcome FROM labeled_days
             WHERE user_id = ?1 AND created_at >= ?2 AND predicted_risk IS NOT NULL",
        )?;
        let pairs: Vec<(f64, bool)> = stmt
            .query_map(params![user_id, cutoff as i64], |row| {
                Ok((row.get(0)?, row.get::<_, i32>(1)? != 0))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let total = pairs.len();
        let correct = pairs.iter().filter(|(p, o)| (*p > 0.5) == *o).count();
        let (accuracy, brier) = if total == 0 {
            (0.0, 0.0)
        } else {
            let sq: f64 = pairs
                .iter()
                .map(|(p, o)| (p - if *o { 1.0 } else { 0.0 }).powi(2))
                .sum();
            (correct as f64 / total as f64, sq / total as f64)
        };
        Ok(AccuracyResponse {
            user_id: user_id.to_string(),
            total,
            correct,
            accuracy,
            brier,
            window_days,
        })
    }

    pub fn has_user(&self, user_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM labeled_days WHERE user_id = ?1 LIMIT 1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn stats(&self) -> Result<CorpusStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT user_id), COALESCE(SUM(outcome), 0),
                    COUNT(predicted_risk)
             FROM labeled_days",
            [],
            |row| {
                Ok(CorpusStats {
                    days: row.get::<_, i64>(0)? as usize,
                    users: row.get::<_, i64>(1)? as usize,
                    positives: row.get::<_, i64>(2)? as usize,
                    with_prediction: row.get::<_, i64>(3)? as usize,
                })
            },
        )?;
        Ok(stats)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("bad uuid {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const NOW: u64 = 1_771_632_000_000;

    fn feedback(user: &str, day: &str, outcome: bool, predicted: Option<f64>) -> FeedbackRequest {
        FeedbackRequest {
            user_id: user.into(),
            day: day.into(),
            features: vec![vec![0.2; 20]; 24],
            outcome,
            predicted_risk: predicted,
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let store = CorpusStore::open_in_memory().unwrap();
        let id = store
            .record_feedback_at(&feedback("u1", "2026-02-20", true, Some(0.7)), NOW)
            .unwrap();
        let days = store.days(Some("u1")).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].id, id);
        assert_eq!(days[0].features.len(), 24);
        assert!(days[0].outcome);
        assert_eq!(days[0].created_at, NOW);
    }

    #[test]
    fn test_resubmitting_day_replaces() {
        let store = CorpusStore::open_in_memory().unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-20", false, None), NOW).unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-20", true, None), NOW).unwrap();
        let days = store.days(None).unwrap();
        assert_eq!(days.len(), 1);
        assert!(days[0].outcome);
    }

    #[test]
    fn test_invalid_feedback_rejected() {
        let store = CorpusStore::open_in_memory().unwrap();
        let bad_day = feedback("u1", "20-02-2026", true, None);
        assert!(matches!(store.record_feedback(&bad_day), Err(StoreError::InvalidData(_))));

        let mut short = feedback("u1", "2026-02-20", true, None);
        short.features.truncate(12);
        assert!(store.record_feedback(&short).is_err());

        let risk = feedback("u1", "2026-02-20", true, Some(1.5));
        assert!(store.record_feedback(&risk).is_err());
        assert_eq!(store.stats().unwrap().days, 0);
    }

    #[test]
    fn test_accuracy_counts_predictions_in_window() {
        let store = CorpusStore::open_in_memory().unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-18", true, Some(0.8)), NOW).unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-19", false, Some(0.6)), NOW).unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-20", false, None), NOW).unwrap();
        // recorded 40 days earlier: outside a 30-day window
        store
            .record_feedback_at(&feedback("u1", "2026-01-10", false, Some(0.1)), NOW - 40 * DAY_MILLIS)
            .unwrap();
        store.record_feedback_at(&feedback("u2", "2026-02-20", true, Some(0.9)), NOW).unwrap();

        let acc = store.accuracy_at("u1", 30, NOW).unwrap();
        assert_eq!(acc.total, 2);
        assert_eq!(acc.correct, 1);
        assert_abs_diff_eq!(acc.accuracy, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(acc.brier, (0.04 + 0.36) / 2.0, epsilon = 1e-12);

        let wide = store.accuracy_at("u1", 60, NOW).unwrap();
        assert_eq!(wide.total, 3);
    }

    #[test]
    fn test_accuracy_without_records_is_zero() {
        let store = CorpusStore::open_in_memory().unwrap();
        let acc = store.accuracy("nobody", 30).unwrap();
        assert_eq!(acc.total, 0);
        assert_eq!(acc.accuracy, 0.0);
        assert_eq!(acc.window_days, 30);
    }

    #[test]
    fn test_history_newest_first() {
        let store = CorpusStore::open_in_memory().unwrap();
        for day in ["2026-02-18", "2026-02-20", "2026-02-19"] {
            store.record_feedback_at(&feedback("u1", day, false, None), NOW).unwrap();
        }
        let items = store.history("u1", 2).unwrap();
        let days: Vec<&str> = items.iter().map(|i| i.day.as_str()).collect();
        assert_eq!(days, vec!["2026-02-20", "2026-02-19"]);
        assert_eq!(items[0].recorded_at, "2026-02-21T00:00:00.000Z");
        assert!(store.has_user("u1").unwrap());
        assert!(!store.has_user("u2").unwrap());
    }

    #[test]
    fn test_episodes_skip_other_widths() {
        let store = CorpusStore::open_in_memory().unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-18", true, None), NOW).unwrap();
        let mut narrow = feedback("u1", "2026-02-19", false, None);
        narrow.features = vec![vec![0.0; 5]; 24];
        store.record_feedback_at(&narrow, NOW).unwrap();

        let episodes = store.episodes(20, None).unwrap();
        assert_eq!(episodes.len(), 1);
        assert!(episodes[0].positive());
        assert_eq!(episodes[0].clean.len(), 24 * 20);
    }

    #[test]
    fn test_stats() {
        let store = CorpusStore::open_in_memory().unwrap();
        store.record_feedback_at(&feedback("u1", "2026-02-18", true, Some(0.4)), NOW).unwrap();
        store.record_feedback_at(&feedback("u2", "2026-02-18", false, None), NOW).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(
            stats,
            CorpusStats {
                days: 2,
                users: 2,
                positives: 1,
                with_prediction: 1
            }
        );
    }
}
