//! SQLite weighing table.
//!
//! # Storage layout
//!
//! One table, named by configuration (default `Weighings`), created if it
//! does not already exist:
//!
//! | column     | type    | description                                  |
//! |------------|---------|----------------------------------------------|
//! | Id         | INTEGER | generated primary key                        |
//! | Weight     | REAL    | settled weight                               |
//! | RecordedAt | TEXT    | RFC-3339 UTC, millisecond precision, `Z`     |
//!
//! `RecordedAt` uses a fixed-width format so text order equals time order
//! and window queries can compare strings.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use weighgate_types::Weighing;

use crate::repository::{StoreError, WeighingRepository, WeighingSummary};

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
///
/// The table name is spliced into SQL text, so nothing else is accepted.
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let part_ok = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if (1..=2).contains(&parts.len()) && parts.iter().all(|p| part_ok(p)) {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, text: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    text.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(idx, e.to_string(), rusqlite::types::Type::Text)
    })
}

pub struct SqliteRepository {
    conn: Connection,
    table: String,
}

impl SqliteRepository {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &str, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open(path)?;
        let repo = Self {
            conn,
            table: table.to_string(),
        };
        repo.init_schema()?;
        debug!(path, table, "weighing table ready");
        Ok(repo)
    }

    /// Temporary in-memory database.
    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn,
            table: table.to_string(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                Id         INTEGER PRIMARY KEY AUTOINCREMENT,
                Weight     REAL NOT NULL,
                RecordedAt TEXT NOT NULL
            );",
            self.table
        ))?;
        Ok(())
    }

    fn row_to_weighing(row: &rusqlite::Row<'_>) -> Result<Weighing, rusqlite::Error> {
        let recorded_at: String = row.get(2)?;
        Ok(Weighing {
            id: row.get(0)?,
            weight: row.get(1)?,
            recorded_at: parse_ts(2, &recorded_at)?,
        })
    }
}

impl WeighingRepository for SqliteRepository {
    fn insert(&mut self, weight: f64, recorded_at: DateTime<Utc>) -> Result<Weighing, StoreError> {
        self.conn.execute(
            &format!("INSERT INTO {} (Weight, RecordedAt) VALUES (?1, ?2)", self.table),
            params![weight, format_ts(recorded_at)],
        )?;
        Ok(Weighing {
            id: self.conn.last_insert_rowid(),
            weight,
            recorded_at,
        })
    }

    fn delete_last(&mut self) -> Result<Option<Weighing>, StoreError> {
        let tx = self.conn.transaction()?;
        let last = tx
            .query_row(
                &format!(
                    "SELECT Id, Weight, RecordedAt FROM {} ORDER BY Id DESC LIMIT 1",
                    self.table
                ),
                [],
                Self::row_to_weighing,
            )
            .optional()?;
        if let Some(w) = &last {
            tx.execute(
                &format!("DELETE FROM {} WHERE Id = ?1", self.table),
                params![w.id],
            )?;
        }
        tx.commit()?;
        Ok(last)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Weighing>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT Id, Weight, RecordedAt FROM {} ORDER BY Id DESC LIMIT ?1",
            self.table
        ))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_weighing)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn summary_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeighingSummary, StoreError> {
        let summary = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(Weight), 0.0), MIN(Weight), MAX(Weight), AVG(Weight)
                 FROM {}
                 WHERE RecordedAt >= ?1 AND RecordedAt < ?2",
                self.table
            ),
            params![format_ts(from), format_ts(to)],
            |row| {
                let count: i64 = row.get(0)?;
                Ok(WeighingSummary {
                    count: count.max(0) as u64,
                    total: row.get(1)?,
                    min: row.get(2)?,
                    max: row.get(3)?,
                    average: row.get(4)?,
                })
            },
        )?;
        Ok(summary)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn table_names_are_validated() {
        assert!(validate_table_name("Weighings").is_ok());
        assert!(validate_table_name("_w2").is_ok());
        assert!(validate_table_name("main.Weighings").is_ok());
        for bad in ["", "2fast", "a.b.c", "w; DROP TABLE x", "we-ighings", "main."] {
            assert!(
                matches!(validate_table_name(bad), Err(StoreError::InvalidTableName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(SqliteRepository::open_in_memory("bad name").is_err());
    }

    #[test]
    fn insert_and_recent_newest_first() {
        let mut repo = SqliteRepository::open_in_memory("Weighings").unwrap();
        let a = repo.insert(12.5, t0()).unwrap();
        let b = repo.insert(7.25, t0() + Duration::seconds(30)).unwrap();
        assert!(b.id > a.id);

        let recent = repo.recent(5).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], b);
        assert_eq!(recent[1], a);
    }

    #[test]
    fn delete_last_removes_highest_id() {
        let mut repo = SqliteRepository::open_in_memory("Weighings").unwrap();
        repo.insert(1.0, t0()).unwrap();
        let last = repo.insert(2.0, t0()).unwrap();
        assert_eq!(repo.delete_last().unwrap(), Some(last));
        assert_eq!(repo.recent(10).unwrap().len(), 1);
        repo.delete_last().unwrap();
        assert_eq!(repo.delete_last().unwrap(), None);
    }

    #[test]
    fn summary_over_a_day() {
        let mut repo = SqliteRepository::open_in_memory("Weighings").unwrap();
        let day = t0();
        repo.insert(10.0, day - Duration::hours(9)).unwrap(); // previous day
        repo.insert(20.0, day).unwrap();
        repo.insert(30.0, day + Duration::hours(3)).unwrap();

        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let s = repo.summary_between(from, from + Duration::days(1)).unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.min, Some(20.0));
        assert_eq!(s.max, Some(30.0));
        assert_eq!(s.average, Some(25.0));

        let empty = repo
            .summary_between(from + Duration::days(5), from + Duration::days(6))
            .unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(empty.min, None);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.db");
        let path = path.to_str().unwrap();
        {
            let mut repo = SqliteRepository::open(path, "Weighings").unwrap();
            repo.insert(55.5, t0()).unwrap();
        }
        let repo = SqliteRepository::open(path, "Weighings").unwrap();
        let rows = repo.recent(1).unwrap();
        assert_eq!(rows[0].weight, 55.5);
        assert_eq!(rows[0].recorded_at, t0());
    }
}
