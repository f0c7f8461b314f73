/*!
Dashboard queries

- `overview`: every configured node with its cached sample, liveness and
  running traffic totals
- `charts`: one node's history reshaped into parallel series

Both are coalesced through [`SingleFlight`], so a burst of identical polls
costs one storage read.
*/

use crate::config::NodeConfig;
use crate::models::{MeasureRecord, TemperatureRecord, TrafficTotals};
use crate::singleflight::{FlightAborted, SingleFlight};
use crate::state::LiveCache;
use crate::store::{run_blocking, HistoryStore, StoreError};
use nodepulse_contracts::Sample;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;

/// Rows kept per chart window; older rows beyond this are dropped
pub const CHART_ROW_LIMIT: usize = 10_000;
pub const DEFAULT_WINDOW_SECS: i64 = 3_600;

const OVERVIEW_KEY: &str = "overview";

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("node id is required")]
    MissingNodeId,
    #[error("start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },
    #[error("storage read failed: {0}")]
    Storage(#[source] Arc<StoreError>),
    #[error(transparent)]
    Aborted(#[from] FlightAborted),
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        Self::Storage(Arc::new(e))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub update_time: i64,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub label: String,
    pub location: String,
    pub alive: bool,
    /// Latest sample with `network.send/recv` replaced by running totals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: i64,
    pub time: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoPoint {
    pub timestamp: i64,
    pub time: String,
    pub read: u64,
    pub write: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetPoint {
    pub timestamp: i64,
    pub time: String,
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficPoint {
    pub timestamp: i64,
    pub time: String,
    pub send: u64,
    pub recv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadPoint {
    pub timestamp: i64,
    pub time: String,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Charts {
    pub node_id: String,
    pub start: i64,
    pub end: i64,
    pub cpu: Vec<Point>,
    pub memory: Vec<Point>,
    pub swap: Vec<Point>,
    pub disk: Vec<Point>,
    pub disk_io: Vec<IoPoint>,
    pub network: Vec<NetPoint>,
    pub traffic: Vec<TrafficPoint>,
    pub load: Vec<LoadPoint>,
    /// One series per sensor name seen in the window
    pub temperature: BTreeMap<String, Vec<Point>>,
}

type ChartsKey = (String, i64, i64);

pub struct Aggregator {
    cache: Arc<LiveCache>,
    history: Arc<dyn HistoryStore>,
    nodes: Arc<[NodeConfig]>,
    alive_timeout_secs: i64,
    overview_flight: SingleFlight<&'static str, Result<Arc<Overview>, QueryError>>,
    charts_flight: SingleFlight<ChartsKey, Result<Arc<Charts>, QueryError>>,
}

impl Aggregator {
    pub fn new(
        cache: Arc<LiveCache>,
        history: Arc<dyn HistoryStore>,
        nodes: Vec<NodeConfig>,
        alive_timeout_secs: i64,
    ) -> Self {
        Self {
            cache,
            history,
            nodes: nodes.into(),
            alive_timeout_secs,
            overview_flight: SingleFlight::new(),
            charts_flight: SingleFlight::new(),
        }
    }

    pub async fn overview(&self) -> Result<Arc<Overview>, QueryError> {
        self.overview_at(unix_now()).await
    }

    pub async fn overview_at(&self, now: i64) -> Result<Arc<Overview>, QueryError> {
        let history = Arc::clone(&self.history);
        let cache = Arc::clone(&self.cache);
        let nodes = Arc::clone(&self.nodes);
        let alive_timeout = self.alive_timeout_secs;

        self.overview_flight
            .run(OVERVIEW_KEY, move || async move {
                let totals = run_blocking(&history, |h| h.traffic_totals()).await?;
                let overview = build_overview(now, &nodes, &cache, &totals, alive_timeout);
                debug!(nodes = overview.nodes.len(), "overview computed");
                Ok::<_, QueryError>(Arc::new(overview))
            })
            .await?
    }

    pub async fn charts(
        &self,
        node_id: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Arc<Charts>, QueryError> {
        self.charts_at(node_id, start, end, unix_now()).await
    }

    pub async fn charts_at(
        &self,
        node_id: &str,
        start: Option<i64>,
        end: Option<i64>,
        now: i64,
    ) -> Result<Arc<Charts>, QueryError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(QueryError::MissingNodeId);
        }
        let (start, end) = resolve_window(start, end, now)?;
        let history = Arc::clone(&self.history);
        let node = node_id.to_string();

        self.charts_flight
            .run((node.clone(), start, end), move || async move {
                let lookup = node.clone();
                let (measures, temps) = run_blocking(&history, move |h| {
                    let measures = h.load_measures(&lookup, start, end, CHART_ROW_LIMIT)?;
                    let temps = match measures.first() {
                        Some(first) => h.load_temperatures(&lookup, first.timestamp, end)?,
                        None => Vec::new(),
                    };
                    Ok((measures, temps))
                })
                .await?;
                debug!(node = %node, rows = measures.len(), "chart window loaded");
                Ok::<_, QueryError>(Arc::new(build_charts(node, start, end, &measures, &temps)))
            })
            .await?
    }
}

/// Fills omitted bounds: `end` defaults to `now`, `start` to an hour before `end`
pub fn resolve_window(start: Option<i64>, end: Option<i64>, now: i64) -> Result<(i64, i64), QueryError> {
    let end = end.unwrap_or(now);
    let start = start.unwrap_or_else(|| end.saturating_sub(DEFAULT_WINDOW_SECS));
    if start > end {
        return Err(QueryError::InvalidRange { start, end });
    }
    Ok((start, end))
}

fn build_overview(
    now: i64,
    nodes: &[NodeConfig],
    cache: &LiveCache,
    totals: &HashMap<String, TrafficTotals>,
    alive_timeout: i64,
) -> Overview {
    let nodes = nodes
        .iter()
        .map(|node| {
            let sample = cache.get(&node.id).map(|mut sample| {
                let traffic = totals.get(&node.id).copied().unwrap_or_default();
                sample.network.send = traffic.send;
                sample.network.recv = traffic.recv;
                sample
            });
            let alive = sample
                .as_ref()
                .is_some_and(|s| now.saturating_sub(s.report_time) < alive_timeout);
            NodeSnapshot {
                id: node.id.clone(),
                label: node.label.clone(),
                location: node.location.clone(),
                alive,
                sample,
            }
        })
        .collect();
    Overview { update_time: now, nodes }
}

fn build_charts(
    node_id: String,
    start: i64,
    end: i64,
    measures: &[MeasureRecord],
    temps: &[TemperatureRecord],
) -> Charts {
    let mut temps_by_ts: BTreeMap<i64, Vec<&TemperatureRecord>> = BTreeMap::new();
    for t in temps {
        temps_by_ts.entry(t.timestamp).or_default().push(t);
    }

    let mut charts = Charts { node_id, start, end, ..Charts::default() };
    for m in measures {
        let ts = m.timestamp;
        let time = format_time(ts);
        let point = |value: f64| Point { timestamp: ts, time: time.clone(), value: truncate2(value) };

        charts.cpu.push(point(m.cpu));
        charts.memory.push(point(m.memory));
        charts.swap.push(point(m.swap));
        charts.disk.push(point(m.disk));
        charts.disk_io.push(IoPoint { timestamp: ts, time: time.clone(), read: m.disk_read, write: m.disk_write });
        charts.network.push(NetPoint { timestamp: ts, time: time.clone(), rx: m.net_rx, tx: m.net_tx });
        charts.traffic.push(TrafficPoint { timestamp: ts, time: time.clone(), send: m.net_send, recv: m.net_recv });
        charts.load.push(LoadPoint {
            timestamp: ts,
            time: time.clone(),
            load1: m.load1,
            load5: m.load5,
            load15: m.load15,
        });

        // rows sharing a timestamp consume the readings once
        if let Some(readings) = temps_by_ts.remove(&ts) {
            for t in readings {
                charts.temperature.entry(t.sensor.clone()).or_default().push(point(t.celsius));
            }
        }
    }
    charts
}

/// Drops everything past the second decimal
pub fn truncate2(value: f64) -> f64 {
    (value * 100.0).trunc() / 100.0
}

/// `YYYY-MM-DD HH:MM:SS` in UTC
pub fn format_time(ts: i64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&format).ok())
        .unwrap_or_else(|| ts.to_string())
}

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
