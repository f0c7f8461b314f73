use nodepulse_contracts::Sample;

/// One persisted row per ingested sample
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureRecord {
    pub node_id: String,
    pub timestamp: i64,
    pub cpu: f64,
    pub memory: f64,
    pub swap: f64,
    pub disk: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub net_send: u64,
    pub net_recv: u64,
}

impl MeasureRecord {
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            node_id: sample.node_id.clone(),
            timestamp: sample.report_time,
            cpu: sample.percent.cpu,
            memory: sample.percent.memory,
            swap: sample.percent.swap,
            disk: sample.percent.disk,
            load1: sample.load.load1,
            load5: sample.load.load5,
            load15: sample.load.load15,
            disk_read: sample.disk.read,
            disk_write: sample.disk.write,
            net_rx: sample.network.rx,
            net_tx: sample.network.tx,
            net_send: sample.network.send,
            net_recv: sample.network.recv,
        }
    }
}

/// One persisted row per sensor per sample
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureRecord {
    pub node_id: String,
    pub timestamp: i64,
    pub sensor: String,
    pub celsius: f64,
}

impl TemperatureRecord {
    pub fn from_sample(sample: &Sample) -> Vec<Self> {
        sample
            .temperature
            .iter()
            .flatten()
            .map(|(sensor, celsius)| Self {
                node_id: sample.node_id.clone(),
                timestamp: sample.report_time,
                sensor: sensor.clone(),
                celsius: *celsius,
            })
            .collect()
    }
}

/// Bytes moved per node since its last retention reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub send: u64,
    pub recv: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use devkit::SampleBuilder;

    #[test]
    fn records_mirror_the_sample() {
        let sample = SampleBuilder::new("n1")
            .report_time(42)
            .cpu(12.5)
            .load(0.1, 0.2, 0.3)
            .net_rates(10, 20)
            .traffic(300, 400)
            .temperature("cpu", 50.0)
            .temperature("nvme", 40.0)
            .build();

        let m = MeasureRecord::from_sample(&sample);
        assert_eq!(m.timestamp, 42);
        assert_eq!(m.cpu, 12.5);
        assert_eq!(m.load15, 0.3);
        assert_eq!((m.net_rx, m.net_tx), (10, 20));
        assert_eq!((m.net_send, m.net_recv), (300, 400));

        let temps = TemperatureRecord::from_sample(&sample);
        assert_eq!(temps.len(), 2);
        assert!(temps.iter().all(|t| t.timestamp == 42 && t.node_id == "n1"));
    }

    #[test]
    fn no_temperature_map_gives_no_rows() {
        let sample = SampleBuilder::new("n1").build();
        assert!(TemperatureRecord::from_sample(&sample).is_empty());
    }
}
