//! Weighing repository contract and the in-memory implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weighgate_types::{StationError, Weighing};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for StationError {
    fn from(e: StoreError) -> Self {
        StationError::Persistence(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate over a time window.  `min`, `max` and `average` are `None`
/// when the window holds no weighings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeighingSummary {
    pub count: u64,
    pub total: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub average: Option<f64>,
}

impl WeighingSummary {
    /// Fold a set of weights.
    pub fn from_weights(weights: impl IntoIterator<Item = f64>) -> Self {
        let mut summary = Self::default();
        for w in weights {
            summary.count += 1;
            summary.total += w;
            summary.min = Some(summary.min.map_or(w, |m| m.min(w)));
            summary.max = Some(summary.max.map_or(w, |m| m.max(w)));
        }
        if summary.count > 0 {
            summary.average = Some(summary.total / summary.count as f64);
        }
        summary
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Table of `{Id, Weight, RecordedAt}` rows.
///
/// Calls are synchronous and short; [`RecordStore`](crate::RecordStore)
/// serializes access.
pub trait WeighingRepository: Send {
    /// Insert one row; the repository assigns the id.
    fn insert(&mut self, weight: f64, recorded_at: DateTime<Utc>) -> Result<Weighing, StoreError>;

    /// Remove the row with the highest id, returning it.
    fn delete_last(&mut self) -> Result<Option<Weighing>, StoreError>;

    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<Weighing>, StoreError>;

    /// Aggregate over `from <= recorded_at < to`.
    fn summary_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeighingSummary, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory repository
// ─────────────────────────────────────────────────────────────────────────────

/// Shared toggle that makes an [`InMemoryRepository`] fail every call.
#[derive(Debug, Clone)]
pub struct OutageSwitch(Arc<AtomicBool>);

impl OutageSwitch {
    pub fn set_available(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Repository kept in process memory.  All state belongs to the instance.
#[derive(Debug)]
pub struct InMemoryRepository {
    rows: Vec<Weighing>,
    next_id: i64,
    available: OutageSwitch,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
            available: OutageSwitch(Arc::new(AtomicBool::new(true))),
        }
    }

    pub fn outage_switch(&self) -> OutageSwitch {
        self.available.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }
}

impl WeighingRepository for InMemoryRepository {
    fn insert(&mut self, weight: f64, recorded_at: DateTime<Utc>) -> Result<Weighing, StoreError> {
        self.check()?;
        let weighing = Weighing {
            id: self.next_id,
            weight,
            recorded_at,
        };
        self.next_id += 1;
        self.rows.push(weighing.clone());
        Ok(weighing)
    }

    fn delete_last(&mut self) -> Result<Option<Weighing>, StoreError> {
        self.check()?;
        Ok(self.rows.pop())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Weighing>, StoreError> {
        self.check()?;
        Ok(self.rows.iter().rev().take(limit).cloned().collect())
    }

    fn summary_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeighingSummary, StoreError> {
        self.check()?;
        Ok(WeighingSummary::from_weights(
            self.rows
                .iter()
                .filter(|w| w.recorded_at >= from && w.recorded_at < to)
                .map(|w| w.weight),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let mut repo = InMemoryRepository::new();
        let a = repo.insert(10.0, at(8)).unwrap();
        let b = repo.insert(11.0, at(9)).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        let recent = repo.recent(10).unwrap();
        assert_eq!(recent[0].id, 2);
    }

    #[test]
    fn outage_switch_fails_every_call() {
        let mut repo = InMemoryRepository::new();
        let switch = repo.outage_switch();
        switch.set_available(false);
        assert!(matches!(repo.insert(1.0, at(8)), Err(StoreError::Unavailable(_))));
        assert!(repo.recent(1).is_err());
        switch.set_available(true);
        assert!(repo.insert(1.0, at(8)).is_ok());
    }

    #[test]
    fn summary_respects_half_open_window() {
        let mut repo = InMemoryRepository::new();
        repo.insert(10.0, at(7)).unwrap();
        repo.insert(20.0, at(8)).unwrap();
        repo.insert(40.0, at(9)).unwrap();
        repo.insert(99.0, at(10)).unwrap();

        let s = repo.summary_between(at(8), at(10)).unwrap();
        assert_eq!(s.count, 2);
        assert!((s.total - 60.0).abs() < 1e-9);
        assert_eq!(s.min, Some(20.0));
        assert_eq!(s.max, Some(40.0));
        assert_eq!(s.average, Some(30.0));
    }

    #[test]
    fn empty_summary_has_no_extremes() {
        let s = WeighingSummary::from_weights(std::iter::empty());
        assert_eq!(s.count, 0);
        assert_eq!(s.average, None);
    }

    #[test]
    fn store_error_becomes_persistence_fault() {
        let err: StationError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, StationError::Persistence(msg) if msg.contains("down")));
    }
}
