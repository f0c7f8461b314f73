/*!
Test environment helpers

- Temporary on-disk database locations (removed on drop)
- Logging wired to the test writer
- Fixture output of `sensors -j`
*/

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Trimmed `sensors -j` output from a desktop with one CPU and one NVMe drive
pub const SENSORS_JSON: &str = r#"{
   "acpi_fan-virtual-0": {
      "Adapter": "Virtual device",
      "fan1": { "fan1_input": 0.000 }
   },
   "coretemp-isa-0000": {
      "Adapter": "ISA adapter",
      "Package id 0": {
         "temp1_crit": 100.000,
         "temp1_input": 45.000,
         "temp1_max": 80.000
      }
   },
   "nvme-pci-0100": {
      "Adapter": "PCI adapter",
      "Composite": {
         "temp1_alarm": 0.000,
         "temp1_input": 38.850
      }
   }
}"#;

/// A database file path inside a directory deleted on drop
pub struct TempDatabase {
    _dir: TempDir,
    path: PathBuf,
}

impl TempDatabase {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nodepulse-test.db");
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes tracing output through the test harness; safe to call repeatedly
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}
