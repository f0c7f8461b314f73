//! Temperature lookup through lm-sensors
//!
//! Runs `sensors -j` and keeps, for every chip, the first `tempN_input`
//! value found. Callers treat any error as "no temperatures".

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

const SENSORS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensors command timed out")]
    Timeout,
    #[error("failed to run sensors: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("sensors exited with {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("invalid sensors output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads chip temperatures in degrees Celsius
pub async fn read_temperatures() -> Result<BTreeMap<String, f64>, SensorError> {
    let output = tokio::time::timeout(
        SENSORS_TIMEOUT,
        AsyncCommand::new("sensors")
            .arg("-j")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| SensorError::Timeout)??;

    if !output.status.success() {
        return Err(SensorError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let readings = parse_sensors_output(&output.stdout)?;
    debug!("read {} sensor temperatures", readings.len());
    Ok(readings)
}

/// Extracts one temperature per chip from `sensors -j` JSON
pub fn parse_sensors_output(raw: &[u8]) -> Result<BTreeMap<String, f64>, serde_json::Error> {
    let chips: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(raw)?;
    let mut readings = BTreeMap::new();

    for (chip, features) in &chips {
        let Some(features) = features.as_object() else { continue };

        let reading = features
            .values()
            .filter_map(|feature| feature.as_object())
            .flat_map(|subfeatures| subfeatures.iter())
            .find_map(|(key, value)| if is_temp_input(key) { value.as_f64() } else { None });

        if let Some(celsius) = reading {
            readings.insert(chip.clone(), celsius);
        }
    }
    Ok(readings)
}

/// Matches `temp<digits>_input`
fn is_temp_input(key: &str) -> bool {
    key.strip_prefix("temp")
        .and_then(|rest| rest.strip_suffix("_input"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
