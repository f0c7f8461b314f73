/*!
Persistent store for measurements and temperatures

SQLite in WAL mode behind a mutex. All calls are synchronous; async callers
go through [`run_blocking`] so the runtime workers never wait on disk.

Both tables are append-only apart from the retention sweep, which deletes
through a single transaction.
*/

use crate::models::{MeasureRecord, TemperatureRecord, TrafficTotals};
use nodepulse_contracts::Sample;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store is closed")]
    Closed,
    #[error("blocking task failed: {0}")]
    Task(String),
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS measure_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id     TEXT    NOT NULL,
    timestamp   INTEGER NOT NULL,
    cpu         REAL    NOT NULL,
    memory      REAL    NOT NULL,
    swap        REAL    NOT NULL,
    disk        REAL    NOT NULL,
    load1       REAL    NOT NULL,
    load5       REAL    NOT NULL,
    load15      REAL    NOT NULL,
    disk_read   INTEGER NOT NULL,
    disk_write  INTEGER NOT NULL,
    net_rx      INTEGER NOT NULL,
    net_tx      INTEGER NOT NULL,
    net_send    INTEGER NOT NULL,
    net_recv    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_measure_node_ts ON measure_records (node_id, timestamp);

CREATE TABLE IF NOT EXISTS temperature_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id     TEXT    NOT NULL,
    timestamp   INTEGER NOT NULL,
    sensor      TEXT    NOT NULL,
    celsius     REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_temperature_node_ts ON temperature_records (node_id, timestamp);
";

/// Read side used by the aggregation layer
pub trait HistoryStore: Send + Sync {
    /// Saturating sum of send/recv per node over every retained row
    fn traffic_totals(&self) -> Result<HashMap<String, TrafficTotals>, StoreError>;

    /// The most recent `limit` rows in `[start, end]`, returned oldest first
    fn load_measures(
        &self,
        node_id: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<MeasureRecord>, StoreError>;

    fn load_temperatures(
        &self,
        node_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<TemperatureRecord>, StoreError>;
}

/// What one retention sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stored node ids that matched no configured node
    pub orphaned: Vec<String>,
    pub measures_deleted: usize,
    pub temperatures_deleted: usize,
}

pub struct MeasureStore {
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for MeasureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasureStore")
            .field("open", &self.conn.lock().is_some())
            .finish()
    }
}

fn to_sql(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

impl MeasureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "measure store opened");
        Ok(Self { conn: Mutex::new(Some(conn)) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(Some(conn)) })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// Persists one measurement plus its temperatures, all or nothing
    pub fn write_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let m = MeasureRecord::from_sample(sample);
        let temps = TemperatureRecord::from_sample(sample);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO measure_records \
                 (node_id, timestamp, cpu, memory, swap, disk, load1, load5, load15, \
                  disk_read, disk_write, net_rx, net_tx, net_send, net_recv) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    m.node_id,
                    m.timestamp,
                    m.cpu,
                    m.memory,
                    m.swap,
                    m.disk,
                    m.load1,
                    m.load5,
                    m.load15,
                    to_sql(m.disk_read),
                    to_sql(m.disk_write),
                    to_sql(m.net_rx),
                    to_sql(m.net_tx),
                    to_sql(m.net_send),
                    to_sql(m.net_recv),
                ],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO temperature_records (node_id, timestamp, sensor, celsius) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for t in &temps {
                    stmt.execute(params![t.node_id, t.timestamp, t.sensor, t.celsius])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Deletes rows of nodes missing from `known_ids` and every row of `reset_ids`
    pub fn sweep(&self, known_ids: &[String], reset_ids: &[String]) -> Result<SweepReport, StoreError> {
        let known: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stored: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT node_id FROM measure_records \
                     UNION SELECT node_id FROM temperature_records",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut report = SweepReport {
                orphaned: stored.into_iter().filter(|id| !known.contains(id.as_str())).collect(),
                ..SweepReport::default()
            };
            for node_id in report.orphaned.iter().chain(reset_ids) {
                report.measures_deleted +=
                    tx.execute("DELETE FROM measure_records WHERE node_id = ?1", params![node_id])?;
                report.temperatures_deleted += tx.execute(
                    "DELETE FROM temperature_records WHERE node_id = ?1",
                    params![node_id],
                )?;
            }
            tx.commit()?;
            debug!(?report, "sweep committed");
            Ok(report)
        })
    }

    pub fn measure_count(&self, node_id: Option<&str>) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = match node_id {
                Some(id) => conn.query_row(
                    "SELECT COUNT(*) FROM measure_records WHERE node_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM measure_records", [], |row| row.get(0))?,
            };
            Ok(from_sql(n))
        })
    }

    #[cfg(test)]
    pub fn temperature_count(&self, node_id: &str) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM temperature_records WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )?;
            Ok(from_sql(n))
        })
    }

    /// Closes the connection; later calls fail with [`StoreError::Closed`]
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        info!("measure store closed");
        Ok(())
    }
}

impl HistoryStore for MeasureStore {
    fn traffic_totals(&self) -> Result<HashMap<String, TrafficTotals>, StoreError> {
        // SQLite SUM errors once a node passes i64::MAX, so sum saturating here
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT node_id, net_send, net_recv FROM measure_records")?;
            let mut rows = stmt.query([])?;
            let mut totals: HashMap<String, TrafficTotals> = HashMap::new();
            while let Some(row) = rows.next()? {
                let entry = totals.entry(row.get(0)?).or_default();
                entry.send = entry.send.saturating_add(from_sql(row.get(1)?));
                entry.recv = entry.recv.saturating_add(from_sql(row.get(2)?));
            }
            Ok(totals)
        })
    }

    fn load_measures(
        &self,
        node_id: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<MeasureRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, timestamp, cpu, memory, swap, disk, load1, load5, load15, \
                        disk_read, disk_write, net_rx, net_tx, net_send, net_recv \
                 FROM measure_records \
                 WHERE node_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
                 ORDER BY timestamp DESC, id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![node_id, start, end, i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok(MeasureRecord {
                        node_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        cpu: row.get(2)?,
                        memory: row.get(3)?,
                        swap: row.get(4)?,
                        disk: row.get(5)?,
                        load1: row.get(6)?,
                        load5: row.get(7)?,
                        load15: row.get(8)?,
                        disk_read: from_sql(row.get(9)?),
                        disk_write: from_sql(row.get(10)?),
                        net_rx: from_sql(row.get(11)?),
                        net_tx: from_sql(row.get(12)?),
                        net_send: from_sql(row.get(13)?),
                        net_recv: from_sql(row.get(14)?),
                    })
                },
            )?;
            let mut records: Vec<MeasureRecord> = rows.collect::<Result<_, _>>()?;
            records.reverse();
            Ok(records)
        })
    }

    fn load_temperatures(
        &self,
        node_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<TemperatureRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, timestamp, sensor, celsius FROM temperature_records \
                 WHERE node_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
                 ORDER BY timestamp, id",
            )?;
            let rows = stmt.query_map(params![node_id, start, end], |row| {
                Ok(TemperatureRecord {
                    node_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    sensor: row.get(2)?,
                    celsius: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

/// Runs a store call on the blocking pool
pub async fn run_blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T, StoreError>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use devkit::{SampleBuilder, TempDatabase};

    fn store() -> MeasureStore {
        MeasureStore::open_in_memory().unwrap()
    }

    #[test]
    fn write_persists_measure_and_temperatures() {
        let s = store();
        let sample = SampleBuilder::new("n1")
            .report_time(100)
            .cpu(12.0)
            .temperature("cpu", 50.0)
            .temperature("nvme", 40.0)
            .build();
        s.write_sample(&sample).unwrap();

        assert_eq!(s.measure_count(Some("n1")).unwrap(), 1);
        assert_eq!(s.temperature_count("n1").unwrap(), 2);
        let rows = s.load_measures("n1", 0, 200, 10).unwrap();
        assert_eq!(rows, vec![MeasureRecord::from_sample(&sample)]);
    }

    #[test]
    fn traffic_totals_sum_per_node() {
        let s = store();
        s.write_sample(&SampleBuilder::new("n1").report_time(100).traffic(100, 10).build()).unwrap();
        s.write_sample(&SampleBuilder::new("n1").report_time(200).traffic(50, 5).build()).unwrap();
        s.write_sample(&SampleBuilder::new("n2").report_time(100).traffic(1, 2).build()).unwrap();

        let totals = s.traffic_totals().unwrap();
        assert_eq!(totals["n1"], TrafficTotals { send: 150, recv: 15 });
        assert_eq!(totals["n2"], TrafficTotals { send: 1, recv: 2 });
        assert!(!totals.contains_key("n3"));
    }

    #[test]
    #[allow(arithmetic_overflow)]
    fn traffic_totals_survive_counters_past_i64() {
        let s = store();
        s.write_sample(&SampleBuilder::new("n1").report_time(100).traffic(u64::MAX, 7).build()).unwrap();
        s.write_sample(&SampleBuilder::new("n1").report_time(200).traffic(1, u64::MAX).build()).unwrap();
        s.write_sample(&SampleBuilder::new("n1").report_time(300).traffic(u64::MAX, u64::MAX).build()).unwrap();

        let totals = s.traffic_totals().unwrap();
        assert_eq!(totals["n1"].send, 2 * i64::MAX as u64 + 1);
        assert_eq!(totals["n1"].recv, 2 * i64::MAX as u64 + 7);
    }

    #[test]
    fn load_keeps_latest_rows_ascending() {
        let s = store();
        for ts in 1..=15 {
            s.write_sample(&SampleBuilder::new("n1").report_time(ts).build()).unwrap();
        }
        s.write_sample(&SampleBuilder::new("n2").report_time(5).build()).unwrap();

        let rows = s.load_measures("n1", 0, 100, 10).unwrap();
        let stamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, (6..=15).collect::<Vec<_>>());

        let window = s.load_measures("n1", 3, 5, 10).unwrap();
        assert_eq!(window.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert!(s.load_measures("n1", 200, 300, 10).unwrap().is_empty());
    }

    #[test]
    fn temperatures_load_in_window() {
        let s = store();
        s.write_sample(&SampleBuilder::new("n1").report_time(10).temperature("cpu", 41.0).build()).unwrap();
        s.write_sample(&SampleBuilder::new("n1").report_time(20).temperature("cpu", 42.0).build()).unwrap();
        let temps = s.load_temperatures("n1", 15, 30).unwrap();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].celsius, 42.0);
    }

    #[test]
    fn sweep_removes_orphans_and_reset_nodes() {
        let s = store();
        for id in ["keep", "reset", "gone"] {
            s.write_sample(&SampleBuilder::new(id).temperature("cpu", 40.0).build()).unwrap();
        }
        let known = vec!["keep".to_string(), "reset".to_string()];
        let report = s.sweep(&known, &["reset".to_string()]).unwrap();

        assert_eq!(report.orphaned, vec!["gone".to_string()]);
        assert_eq!(report.measures_deleted, 2);
        assert_eq!(report.temperatures_deleted, 2);
        assert_eq!(s.measure_count(Some("keep")).unwrap(), 1);
        assert_eq!(s.measure_count(Some("reset")).unwrap(), 0);
        assert_eq!(s.measure_count(Some("gone")).unwrap(), 0);
        assert_eq!(s.temperature_count("gone").unwrap(), 0);
        assert_eq!(s.temperature_count("keep").unwrap(), 1);
    }

    #[test]
    fn sweep_on_empty_store_is_a_noop() {
        let s = store();
        let report = s.sweep(&["a".to_string()], &["a".to_string()]).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn closed_store_rejects_calls() {
        let s = store();
        s.close().unwrap();
        s.close().unwrap();
        let err = s.write_sample(&SampleBuilder::new("n1").build()).unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert!(matches!(s.traffic_totals(), Err(StoreError::Closed)));
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let db = TempDatabase::new();
        {
            let s = MeasureStore::open(db.path()).unwrap();
            s.write_sample(&SampleBuilder::new("n1").build()).unwrap();
            s.close().unwrap();
        }
        let s = MeasureStore::open(db.path()).unwrap();
        assert_eq!(s.measure_count(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_runner_forwards_results() {
        let s = Arc::new(store());
        let sample = SampleBuilder::new("n1").build();
        run_blocking(&s, move |st| st.write_sample(&sample)).await.unwrap();
        let n = run_blocking(&s, |st| st.measure_count(None)).await.unwrap();
        assert_eq!(n, 1);
    }
}
