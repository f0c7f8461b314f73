//! Reporter loop: sample, label, push
//!
//! Each tick takes one sample (the CPU window paces the loop), stamps the
//! node id and POSTs it to the kernel. Failures are logged and the sample is
//! dropped; the next tick starts fresh.

use crate::config::AgentConfig;
use crate::metrics::{HostProbe, Sampler};
use anyhow::{anyhow, Context, Result};
use nodepulse_contracts::Sample;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub struct Reporter<P> {
    sampler: Sampler<P>,
    client: reqwest::Client,
    report_url: Option<String>,
    node_id: Option<String>,
    token: String,
    interval: Duration,
}

impl<P: HostProbe> Reporter<P> {
    pub fn new(config: &AgentConfig, probe: P) -> Self {
        Self {
            sampler: Sampler::new(probe, config.exclude_interfaces.clone(), config.sensors),
            client: reqwest::Client::new(),
            report_url: config.report_url.clone(),
            node_id: config.node_id.clone().filter(|id| !id.trim().is_empty()),
            token: config.token.clone(),
            interval: config.interval(),
        }
    }

    /// Runs until the task is dropped
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            url = self.report_url.as_deref().unwrap_or("<unset>"),
            "reporter loop started"
        );
        loop {
            let started = Instant::now();
            if let Err(e) = self.tick().await {
                error!("report failed: {:#}", e);
                // Keep the cadence when a tick fails before its CPU window
                if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                    tokio::time::sleep(rest).await;
                }
            }
        }
    }

    /// One sample-and-send cycle
    pub async fn tick(&mut self) -> Result<()> {
        let mut sample = self
            .sampler
            .sample(self.interval)
            .await
            .context("measure error")?;
        sample.node_id = resolve_node_id(self.node_id.as_deref(), &sample);

        let body = serde_json::to_vec(&sample).context("failed to serialize sample")?;
        debug!(len = body.len(), body = %String::from_utf8_lossy(&body), "measured");

        let Some(url) = self.report_url.as_deref() else {
            return Err(anyhow!("report url not set"));
        };
        self.send(url, body).await
    }

    async fn send(&self, url: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(url)
            .timeout(self.interval)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await
            .context("report send error")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("report rejected with {}: {}", status, text.trim()));
        }
        debug!("report accepted");
        Ok(())
    }
}

/// Explicit override first, otherwise the measured hostname
pub fn resolve_node_id(explicit: Option<&str>, sample: &Sample) -> String {
    match explicit {
        Some(id) => id.to_string(),
        None => sample.host.hostname.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{DiskCounters, NetCounters, SampleError};
    use devkit::SampleBuilder;
    use nodepulse_contracts::{HostFacts, LoadAverage, UsageStat};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct StaticProbe;

    impl HostProbe for StaticProbe {
        fn begin_cpu_window(&mut self) -> Result<(), SampleError> {
            Ok(())
        }
        fn cpu_percent(&mut self) -> Result<f64, SampleError> {
            Ok(1.0)
        }
        fn unix_time(&self) -> i64 {
            1_000
        }
        fn disk_counters(&mut self) -> Result<DiskCounters, SampleError> {
            Ok(DiskCounters::default())
        }
        fn net_counters(&mut self, _excluded: &[String]) -> Result<NetCounters, SampleError> {
            Ok(NetCounters::default())
        }
        fn load_average(&mut self) -> Result<LoadAverage, SampleError> {
            Ok(LoadAverage::default())
        }
        fn memory(&mut self) -> Result<(UsageStat, UsageStat), SampleError> {
            Ok((UsageStat::default(), UsageStat::default()))
        }
        fn disk_usage(&mut self) -> Result<UsageStat, SampleError> {
            Ok(UsageStat::default())
        }
        fn host_facts(&mut self) -> Result<HostFacts, SampleError> {
            Ok(HostFacts { hostname: "measured-host".into(), ..HostFacts::default() })
        }
    }

    /// Refuses the first CPU window, then behaves like [`StaticProbe`]
    #[derive(Clone, Default)]
    struct FlakyProbe {
        windows: Arc<Mutex<Vec<Instant>>>,
        measured: Arc<AtomicUsize>,
    }

    impl HostProbe for FlakyProbe {
        fn begin_cpu_window(&mut self) -> Result<(), SampleError> {
            let mut windows = self.windows.lock().unwrap();
            windows.push(Instant::now());
            if windows.len() == 1 {
                return Err(SampleError::read("cpu", "stat unavailable"));
            }
            Ok(())
        }
        fn cpu_percent(&mut self) -> Result<f64, SampleError> {
            self.measured.fetch_add(1, Ordering::SeqCst);
            StaticProbe.cpu_percent()
        }
        fn unix_time(&self) -> i64 {
            StaticProbe.unix_time()
        }
        fn disk_counters(&mut self) -> Result<DiskCounters, SampleError> {
            StaticProbe.disk_counters()
        }
        fn net_counters(&mut self, excluded: &[String]) -> Result<NetCounters, SampleError> {
            StaticProbe.net_counters(excluded)
        }
        fn load_average(&mut self) -> Result<LoadAverage, SampleError> {
            StaticProbe.load_average()
        }
        fn memory(&mut self) -> Result<(UsageStat, UsageStat), SampleError> {
            StaticProbe.memory()
        }
        fn disk_usage(&mut self) -> Result<UsageStat, SampleError> {
            StaticProbe.disk_usage()
        }
        fn host_facts(&mut self) -> Result<HostFacts, SampleError> {
            StaticProbe.host_facts()
        }
    }

    /// Accepts one HTTP request, answers with `status_line`, returns the raw request
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/report", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    fn config(url: Option<String>, node_id: Option<&str>) -> AgentConfig {
        AgentConfig {
            report_url: url,
            node_id: node_id.map(str::to_string),
            token: "s3cret".into(),
            interval_secs: 1,
            sensors: false,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn node_id_prefers_override() {
        let sample = SampleBuilder::new("ignored").hostname("box").build();
        assert_eq!(resolve_node_id(Some("edge-7"), &sample), "edge-7");
        assert_eq!(resolve_node_id(None, &sample), "box");
    }

    #[tokio::test]
    async fn tick_posts_sample_with_bearer_token() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let mut reporter = Reporter::new(&config(Some(url), None), StaticProbe);

        reporter.tick().await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/report"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer s3cret"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let sample: Sample = serde_json::from_str(body).unwrap();
        assert_eq!(sample.node_id, "measured-host");
        assert_eq!(sample.report_time, 1_000);
    }

    #[tokio::test]
    async fn rejected_report_is_an_error() {
        let (url, server) = one_shot_server("HTTP/1.1 401 Unauthorized").await;
        let mut reporter = Reporter::new(&config(Some(url), Some("edge-1")), StaticProbe);

        let err = reporter.tick().await.unwrap_err();
        assert!(err.to_string().contains("401"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_url_fails_the_tick() {
        let mut reporter = Reporter::new(&config(None, None), StaticProbe);
        let err = reporter.tick().await.unwrap_err();
        assert!(err.to_string().contains("report url not set"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_cadence_through_failing_ticks() {
        let probe = FlakyProbe::default();
        let mut reporter = Reporter::new(&config(None, None), probe.clone());

        let outcome = tokio::time::timeout(Duration::from_millis(3_500), reporter.run()).await;
        assert!(outcome.is_err(), "run only ends when dropped");

        let windows = probe.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 4);
        for pair in windows.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(1));
        }
        // first window refused, two full samples, the last still measuring
        assert_eq!(probe.measured.load(Ordering::SeqCst), 2);
    }
}
