//! Exposition text encoding.
//!
//! One line per (device, metric) pair: metric name, brace-enclosed labels
//! (device labels first, then metric labels, each pre-sorted by name), then
//! the value. Label ordering is a strict invariant so output stays
//! reproducible between scrapes.

use std::collections::HashMap;
use std::fmt::Write;

use fakedev_config::DevInfo;

pub const PROJECT: &str = "fakedev-exporter";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renders the exposition body for all devices: header comment first, then
/// every metric in the output allowlist that has a current value.
pub fn render(devinfo: &DevInfo, values: &[HashMap<String, f64>]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {} v{}", PROJECT, VERSION);
    for (dev, metrics) in values.iter().enumerate() {
        for metric in &devinfo.output {
            if let Some(value) = metrics.get(metric) {
                write_metric(&mut out, devinfo, dev, metric, *value);
            }
        }
    }
    out
}

fn write_metric(out: &mut String, devinfo: &DevInfo, dev: usize, metric: &str, value: f64) {
    let metric_labels = devinfo
        .metric_labels
        .get(metric)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let _ = write!(out, "{}{{", metric);
    let mut comma = false;
    for label in devinfo.device_labels[dev].iter().chain(metric_labels) {
        if comma {
            let _ = write!(out, ", {}=\"{}\"", label.name, label.value);
        } else {
            let _ = write!(out, "{}=\"{}\"", label.name, label.value);
            comma = true;
        }
    }
    let _ = writeln!(out, "}} {}", value);
}
