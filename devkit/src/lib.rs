/*!
# nodepulse devkit - test helpers

Shared by the agent and kernel test suites:
- Fluent builder for report samples
- Canned `sensors -j` output
- Temporary SQLite locations and test logging
*/

pub mod sample_builder;
pub mod test_utils;

pub use sample_builder::SampleBuilder;
pub use test_utils::{init_test_logging, TempDatabase, SENSORS_JSON};
