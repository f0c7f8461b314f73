/*!
Builder for report samples

Keeps tests focused on the fields they care about; everything else gets a
plausible default.
*/

use nodepulse_contracts::{HostFacts, Sample, UsageStat};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct SampleBuilder {
    sample: Sample,
}

impl SampleBuilder {
    pub fn new(node_id: &str) -> Self {
        let mut sample = Sample {
            node_id: node_id.to_string(),
            report_time: 1_000,
            interval: 5,
            host: HostFacts {
                hostname: node_id.to_string(),
                uptime: 3_600,
                platform: "debian".into(),
                version: "12".into(),
                arch: "x86_64".into(),
            },
            ..Sample::default()
        };
        sample.memory = UsageStat { total: 8_000, used: 2_000, free: 6_000 };
        sample.percent.memory = 25.0;
        Self { sample }
    }

    pub fn report_time(mut self, ts: i64) -> Self {
        self.sample.report_time = ts;
        self
    }

    pub fn interval(mut self, secs: u64) -> Self {
        self.sample.interval = secs;
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.sample.host.hostname = hostname.to_string();
        self
    }

    pub fn cpu(mut self, percent: f64) -> Self {
        self.sample.percent.cpu = percent;
        self
    }

    pub fn load(mut self, load1: f64, load5: f64, load15: f64) -> Self {
        self.sample.load.load1 = load1;
        self.sample.load.load5 = load5;
        self.sample.load.load15 = load15;
        self
    }

    pub fn disk_rates(mut self, read: u64, write: u64) -> Self {
        self.sample.disk.read = read;
        self.sample.disk.write = write;
        self
    }

    pub fn net_rates(mut self, rx: u64, tx: u64) -> Self {
        self.sample.network.rx = rx;
        self.sample.network.tx = tx;
        self
    }

    pub fn traffic(mut self, send: u64, recv: u64) -> Self {
        self.sample.network.send = send;
        self.sample.network.recv = recv;
        self
    }

    pub fn temperature(mut self, sensor: &str, celsius: f64) -> Self {
        self.sample
            .temperature
            .get_or_insert_with(BTreeMap::new)
            .insert(sensor.to_string(), celsius);
        self
    }

    pub fn build(self) -> Sample {
        self.sample
    }

    /// JSON body as the agent would POST it
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.sample).expect("sample serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_requested_fields() {
        let sample = SampleBuilder::new("n1")
            .report_time(300)
            .traffic(70, 7)
            .temperature("cpu", 50.5)
            .build();
        assert_eq!(sample.node_id, "n1");
        assert_eq!(sample.report_time, 300);
        assert_eq!(sample.network.send, 70);
        assert_eq!(sample.temperature.unwrap()["cpu"], 50.5);
    }

    #[test]
    fn json_body_decodes_back() {
        let builder = SampleBuilder::new("n2").cpu(12.0);
        let decoded: Sample = serde_json::from_slice(&builder.to_json()).unwrap();
        assert_eq!(decoded, builder.build());
    }
}
