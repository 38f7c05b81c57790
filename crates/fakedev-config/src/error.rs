//! Error types for device configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal startup errors. Anything recoverable is logged as a warning
/// instead, so partially-mapped identities still produce an exporter.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("unable to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected document.
    #[error("unmarshaling config file '{path}' failed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// More devices requested than the device list provides labels for.
    #[error("device list contains fewer devices than requested ({available} < {requested})")]
    TooFewDevices { requested: usize, available: usize },

    /// A device list entry lacks the 'file' label used to match workload
    /// device file names.
    #[error("device list entry {index} is missing the 'file' label")]
    MissingFileLabel { index: usize },

    /// Identity declares labels for a metric it does not map.
    #[error("identity MetricMap entry missing for MetricLabels metric '{metric}'")]
    UnmappedMetricLabels { metric: String },
}
