//! Outcomes Store
//!
//! Append-only, deduplicated per-property ledger of booking outcomes.
//! Backs the retraining loop and drift monitoring. Writes for a given
//! property serialize behind the connection lock; readers observe a
//! prefix-consistent view thanks to WAL mode.

use crate::models::Outcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Schema tuned for append-heavy per-property workloads.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS outcomes (
    property_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    stay_date TEXT,
    quoted_price REAL NOT NULL,
    accepted INTEGER NOT NULL,
    final_price REAL,
    action_id TEXT,
    context_json TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (property_id, ts, quoted_price)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_outcomes_property_ts
    ON outcomes(property_id, ts DESC);
"#;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppendStats {
    pub stored: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub total_records: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DateRange {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataQuality {
    pub missing_final_price: usize,
    pub missing_context: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub exists: bool,
    pub total_records: usize,
    pub date_range: DateRange,
    pub acceptance_rate: Option<f64>,
    pub avg_quoted_price: Option<f64>,
    pub avg_final_price: Option<f64>,
    pub last_7_days: usize,
    pub acceptance_rate_7d: Option<f64>,
    pub data_quality: DataQuality,
}

pub struct OutcomesStore {
    conn: Arc<Mutex<Connection>>,
}

impl OutcomesStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize outcomes schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn validate(property_id: &str, outcome: &Outcome) -> bool {
        if !outcome.quoted_price.is_finite() || outcome.quoted_price <= 0.0 {
            warn!(
                property_id,
                quoted_price = outcome.quoted_price,
                "Rejected outcome with invalid quoted_price"
            );
            return false;
        }
        if !outcome.property_id.is_empty() && outcome.property_id != property_id {
            warn!(
                property_id,
                outcome_property = %outcome.property_id,
                "Rejected outcome for mismatched property"
            );
            return false;
        }
        true
    }

    /// Append a batch of outcomes. Invalid records are skipped (the
    /// batch continues); duplicates on (property, timestamp, price)
    /// are overwritten so the latest write wins.
    pub fn append(&self, property_id: &str, outcomes: &[Outcome]) -> Result<AppendStats> {
        let mut stats = AppendStats::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for outcome in outcomes {
            if !Self::validate(property_id, outcome) {
                stats.invalid += 1;
                continue;
            }

            let ts = outcome.timestamp.timestamp_millis();
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM outcomes WHERE property_id = ?1 AND ts = ?2 AND quoted_price = ?3",
                    params![property_id, ts, outcome.quoted_price],
                    |row| row.get(0),
                )
                .optional()?;

            let context_json = outcome
                .context
                .as_ref()
                .map(|c| serde_json::to_string(c))
                .transpose()?;

            tx.execute(
                r#"INSERT INTO outcomes
                       (property_id, ts, stay_date, quoted_price, accepted,
                        final_price, action_id, context_json)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                   ON CONFLICT(property_id, ts, quoted_price) DO UPDATE SET
                       stay_date = excluded.stay_date,
                       accepted = excluded.accepted,
                       final_price = excluded.final_price,
                       action_id = excluded.action_id,
                       context_json = excluded.context_json"#,
                params![
                    property_id,
                    ts,
                    outcome.stay_date,
                    outcome.quoted_price,
                    outcome.accepted as i64,
                    outcome.final_price,
                    outcome.action_id,
                    context_json,
                ],
            )?;

            if exists.is_some() {
                stats.duplicates += 1;
            } else {
                stats.stored += 1;
            }
        }

        tx.commit()?;

        stats.total_records = {
            let mut stmt =
                conn.prepare_cached("SELECT COUNT(*) FROM outcomes WHERE property_id = ?1")?;
            stmt.query_row(params![property_id], |row| row.get::<_, i64>(0))? as usize
        };

        info!(
            property_id,
            stored = stats.stored,
            invalid = stats.invalid,
            duplicates = stats.duplicates,
            total = stats.total_records,
            "Stored outcomes"
        );
        Ok(stats)
    }

    /// Time-range query, ascending by timestamp. `limit` keeps the most
    /// recent records.
    pub fn query(
        &self,
        property_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Outcome>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT property_id, ts, stay_date, quoted_price, accepted, final_price, \
             action_id, context_json FROM outcomes WHERE property_id = ?1",
        );
        let mut bindings: Vec<i64> = Vec::new();

        if let Some(start) = start {
            bindings.push(start.timestamp_millis());
            sql.push_str(&format!(" AND ts >= ?{}", bindings.len() + 1));
        }
        if let Some(end) = end {
            bindings.push(end.timestamp_millis());
            sql.push_str(&format!(" AND ts <= ?{}", bindings.len() + 1));
        }

        sql.push_str(" ORDER BY ts DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = match bindings.len() {
            0 => stmt.query(params![property_id])?,
            1 => stmt.query(params![property_id, bindings[0]])?,
            _ => stmt.query(params![property_id, bindings[0], bindings[1]])?,
        };

        let mut outcomes = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(1)?;
            let context_json: Option<String> = row.get(7)?;
            outcomes.push(Outcome {
                property_id: row.get(0)?,
                timestamp: Utc
                    .timestamp_millis_opt(ts)
                    .single()
                    .unwrap_or_else(Utc::now),
                stay_date: row.get(2)?,
                quoted_price: row.get(3)?,
                accepted: row.get::<_, i64>(4)? != 0,
                final_price: row.get(5)?,
                action_id: row.get(6)?,
                context: context_json.and_then(|j| serde_json::from_str(&j).ok()),
            });
        }

        outcomes.reverse();
        Ok(outcomes)
    }

    /// Numeric series for one feature over a time window, used by drift
    /// monitoring. Built-in columns are read directly; anything else is
    /// pulled out of the context snapshot.
    pub fn feature_series(
        &self,
        property_id: &str,
        feature: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<f64>> {
        let outcomes = self.query(property_id, start, end, None)?;
        let values = outcomes
            .iter()
            .filter_map(|o| match feature {
                "quoted_price" => Some(o.quoted_price),
                "final_price" => o.final_price,
                "accepted" => Some(if o.accepted { 1.0 } else { 0.0 }),
                name => o
                    .context
                    .as_ref()
                    .and_then(|c| c.get(name))
                    .and_then(|v| v.as_f64()),
            })
            .filter(|v| v.is_finite())
            .collect();
        Ok(values)
    }

    pub fn stats(&self, property_id: &str) -> Result<StoreStats> {
        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outcomes WHERE property_id = ?1",
            params![property_id],
            |row| row.get(0),
        )?;

        if total == 0 {
            return Ok(StoreStats::default());
        }

        let (min_ts, max_ts, accepted, avg_quoted): (i64, i64, i64, f64) = conn.query_row(
            "SELECT MIN(ts), MAX(ts), SUM(accepted), AVG(quoted_price) \
             FROM outcomes WHERE property_id = ?1",
            params![property_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let avg_final: Option<f64> = conn.query_row(
            "SELECT AVG(final_price) FROM outcomes \
             WHERE property_id = ?1 AND accepted = 1 AND final_price IS NOT NULL",
            params![property_id],
            |row| row.get(0),
        )?;

        let (missing_final, missing_context): (i64, i64) = conn.query_row(
            "SELECT SUM(CASE WHEN final_price IS NULL THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN context_json IS NULL THEN 1 ELSE 0 END) \
             FROM outcomes WHERE property_id = ?1",
            params![property_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let week_ago = (Utc::now() - Duration::days(7)).timestamp_millis();
        let (recent, recent_accepted): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), SUM(accepted) FROM outcomes \
             WHERE property_id = ?1 AND ts >= ?2",
            params![property_id, week_ago],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreStats {
            exists: true,
            total_records: total as usize,
            date_range: DateRange {
                min: Utc.timestamp_millis_opt(min_ts).single(),
                max: Utc.timestamp_millis_opt(max_ts).single(),
            },
            acceptance_rate: Some(accepted as f64 / total as f64),
            avg_quoted_price: Some(avg_quoted),
            avg_final_price: avg_final,
            last_7_days: recent as usize,
            acceptance_rate_7d: if recent > 0 {
                Some(recent_accepted.unwrap_or(0) as f64 / recent as f64)
            } else {
                None
            },
            data_quality: DataQuality {
                missing_final_price: missing_final as usize,
                missing_context: missing_context as usize,
            },
        })
    }

    /// Export outcomes as CSV for training pipelines. Returns the path
    /// written.
    pub fn export(
        &self,
        property_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        output_path: Option<PathBuf>,
    ) -> Result<PathBuf> {
        let outcomes = self.query(property_id, start, end, None)?;
        if outcomes.is_empty() {
            anyhow::bail!("no outcomes found for property {property_id}");
        }

        let path = match output_path {
            Some(path) => path,
            None => {
                let dir = PathBuf::from("./data/training");
                std::fs::create_dir_all(&dir)?;
                dir.join(format!(
                    "{property_id}_outcomes_{}.csv",
                    Utc::now().format("%Y%m%d_%H%M%S")
                ))
            }
        };

        let mut csv = String::from(
            "property_id,timestamp,stay_date,quoted_price,accepted,final_price,action_id\n",
        );
        for o in &outcomes {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                o.property_id,
                o.timestamp.to_rfc3339(),
                o.stay_date.as_deref().unwrap_or(""),
                o.quoted_price,
                o.accepted,
                o.final_price.map(|p| p.to_string()).unwrap_or_default(),
                o.action_id.as_deref().unwrap_or(""),
            ));
        }
        std::fs::write(&path, csv)?;

        info!(
            property_id,
            count = outcomes.len(),
            path = %path.display(),
            "Exported outcomes"
        );
        Ok(path)
    }

    /// Retention sweep: delete a property's outcomes, optionally only
    /// those before a cutoff.
    pub fn delete(&self, property_id: &str, before: Option<DateTime<Utc>>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = match before {
            Some(cutoff) => conn.execute(
                "DELETE FROM outcomes WHERE property_id = ?1 AND ts < ?2",
                params![property_id, cutoff.timestamp_millis()],
            )?,
            None => conn.execute(
                "DELETE FROM outcomes WHERE property_id = ?1",
                params![property_id],
            )?,
        };
        info!(property_id, deleted, "Deleted outcomes");
        Ok(deleted)
    }

    pub fn list_properties(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT property_id FROM outcomes ORDER BY property_id")?;
        let properties = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(ts: &str, price: f64, accepted: bool) -> Outcome {
        Outcome {
            property_id: "p1".to_string(),
            timestamp: ts.parse().unwrap(),
            stay_date: Some("2025-07-19".to_string()),
            quoted_price: price,
            accepted,
            final_price: if accepted { Some(price) } else { None },
            context: Some(json!({"occupancy_rate": 0.85, "lead_time": 7.0})),
            action_id: None,
        }
    }

    #[test]
    fn test_append_and_query() {
        let store = OutcomesStore::in_memory().unwrap();
        let stats = store
            .append(
                "p1",
                &[
                    outcome("2025-07-20T14:00:00Z", 240.0, true),
                    outcome("2025-07-21T09:00:00Z", 180.0, false),
                ],
            )
            .unwrap();

        assert_eq!(stats.stored, 2);
        assert_eq!(stats.invalid, 0);
        assert_eq!(stats.duplicates, 0);

        let outcomes = store.query("p1", None, None, None).unwrap();
        assert_eq!(outcomes.len(), 2);
        // Ascending order.
        assert!(outcomes[0].timestamp < outcomes[1].timestamp);
    }

    #[test]
    fn test_resubmission_is_deduplicated() {
        let store = OutcomesStore::in_memory().unwrap();
        let batch = vec![outcome("2025-07-20T14:00:00Z", 240.0, true)];

        let first = store.append("p1", &batch).unwrap();
        assert_eq!(first.stored, 1);

        let second = store.append("p1", &batch).unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.total_records, 1);
    }

    #[test]
    fn test_latest_write_wins_on_conflict() {
        let store = OutcomesStore::in_memory().unwrap();
        let mut first = outcome("2025-07-20T14:00:00Z", 240.0, false);
        first.final_price = None;
        store.append("p1", &[first]).unwrap();

        let mut second = outcome("2025-07-20T14:00:00Z", 240.0, true);
        second.final_price = Some(240.0);
        store.append("p1", &[second]).unwrap();

        let outcomes = store.query("p1", None, None, None).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].accepted);
        assert_eq!(outcomes[0].final_price, Some(240.0));
    }

    #[test]
    fn test_invalid_outcomes_skipped_batch_continues() {
        let store = OutcomesStore::in_memory().unwrap();
        let mut bad = outcome("2025-07-20T14:00:00Z", -5.0, true);
        bad.quoted_price = -5.0;

        let stats = store
            .append(
                "p1",
                &[bad, outcome("2025-07-21T14:00:00Z", 200.0, true)],
            )
            .unwrap();

        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.stored, 1);
    }

    #[test]
    fn test_range_query_and_limit() {
        let store = OutcomesStore::in_memory().unwrap();
        let outcomes: Vec<Outcome> = (1..=9)
            .map(|d| outcome(&format!("2025-07-0{d}T12:00:00Z"), 100.0 + d as f64, false))
            .collect();
        store.append("p1", &outcomes).unwrap();

        let mid = store
            .query(
                "p1",
                Some("2025-07-03T00:00:00Z".parse().unwrap()),
                Some("2025-07-06T23:59:59Z".parse().unwrap()),
                None,
            )
            .unwrap();
        assert_eq!(mid.len(), 4);

        let recent = store.query("p1", None, None, Some(3)).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].quoted_price, 109.0);
    }

    #[test]
    fn test_stats() {
        let store = OutcomesStore::in_memory().unwrap();
        store
            .append(
                "p1",
                &[
                    outcome("2025-07-20T14:00:00Z", 200.0, true),
                    outcome("2025-07-21T14:00:00Z", 100.0, false),
                ],
            )
            .unwrap();

        let stats = store.stats("p1").unwrap();
        assert!(stats.exists);
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.acceptance_rate, Some(0.5));
        assert_eq!(stats.avg_quoted_price, Some(150.0));
        assert_eq!(stats.avg_final_price, Some(200.0));
        assert_eq!(stats.data_quality.missing_final_price, 1);
    }

    #[test]
    fn test_stats_missing_property() {
        let store = OutcomesStore::in_memory().unwrap();
        let stats = store.stats("absent").unwrap();
        assert!(!stats.exists);
        assert_eq!(stats.total_records, 0);
    }

    #[test]
    fn test_feature_series_from_context() {
        let store = OutcomesStore::in_memory().unwrap();
        store
            .append(
                "p1",
                &[
                    outcome("2025-07-20T14:00:00Z", 200.0, true),
                    outcome("2025-07-21T14:00:00Z", 100.0, false),
                ],
            )
            .unwrap();

        let prices = store.feature_series("p1", "quoted_price", None, None).unwrap();
        assert_eq!(prices, vec![200.0, 100.0]);

        let occupancy = store
            .feature_series("p1", "occupancy_rate", None, None)
            .unwrap();
        assert_eq!(occupancy, vec![0.85, 0.85]);
    }

    #[test]
    fn test_retention_delete() {
        let store = OutcomesStore::in_memory().unwrap();
        store
            .append(
                "p1",
                &[
                    outcome("2025-06-01T12:00:00Z", 100.0, false),
                    outcome("2025-07-20T12:00:00Z", 200.0, true),
                ],
            )
            .unwrap();

        let deleted = store
            .delete("p1", Some("2025-07-01T00:00:00Z".parse().unwrap()))
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.query("p1", None, None, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].quoted_price, 200.0);
    }

    #[test]
    fn test_list_properties() {
        let store = OutcomesStore::in_memory().unwrap();
        let mut other = outcome("2025-07-20T14:00:00Z", 120.0, false);
        other.property_id = "p2".to_string();

        store
            .append("p1", &[outcome("2025-07-20T14:00:00Z", 100.0, false)])
            .unwrap();
        store.append("p2", &[other]).unwrap();

        assert_eq!(store.list_properties().unwrap(), vec!["p1", "p2"]);
    }

    #[test]
    fn test_export_to_csv() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutcomesStore::in_memory().unwrap();
        store
            .append("p1", &[outcome("2025-07-20T14:00:00Z", 200.0, true)])
            .unwrap();

        let path = store
            .export("p1", None, None, Some(dir.path().join("out.csv")))
            .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("property_id,timestamp"));
        assert!(content.contains("p1,"));
        assert!(content.contains("200"));
    }
}
