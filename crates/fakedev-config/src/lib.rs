//! # fakedev-config
//!
//! Device and metric identity configuration for the fake device exporter.
//!
//! Three JSON documents describe what the simulated fleet looks like:
//! - **device type**: labels shared by every device plus per-metric limits
//! - **device list**: per-device instance labels (including the `file` label
//!   used to match workload device file names)
//! - **identity**: maps internal label/metric names to the names the
//!   exporter publishes; names without a mapping are not exported
//!
//! Everything is folded into one immutable [`DevInfo`] at startup. Label and
//! limit names are mapped through the identity here; metric values are only
//! filtered against the identity's output allowlist at encoding time, so
//! metric derivation keeps seeing the full limit set.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

mod error;

pub use error::ConfigError;

/// Min and max values for a metric. Min doubles as the metric's baseline
/// value when no workload touches the device.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricLimit {
    pub min: f64,
    pub max: f64,
}

/// One exported label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPair {
    pub name: String,
    pub value: String,
}

/// Device type document: labels common to all devices and metric limits.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DevType {
    #[serde(default)]
    device_labels: HashMap<String, String>,
    #[serde(default)]
    metric_limits: HashMap<String, MetricLimit>,
}

/// Device list document: per-device instance labels.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DevList {
    #[serde(default)]
    device_labels: Vec<HashMap<String, String>>,
}

/// Exporter identity document. A missing name means "do not export";
/// mapped names replace internal ones on output.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Identity {
    #[serde(default)]
    device_label_map: HashMap<String, String>,
    #[serde(default)]
    metric_map: HashMap<String, String>,
    #[serde(default)]
    metric_labels: HashMap<String, HashMap<String, String>>,
}

/// Immutable device/metric identity information, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct DevInfo {
    /// Per-device label sets, sorted by label name. Length = device count.
    pub device_labels: Vec<Vec<LabelPair>>,
    /// Per-metric limits, keyed by *output* metric name. Ordered so that
    /// every simulation pass walks metrics deterministically.
    pub metric_limits: BTreeMap<String, MetricLimit>,
    /// Device file name to device index.
    pub device_map: HashMap<String, usize>,
    /// Metric-specific labels (if any), keyed by output metric name, sorted.
    pub metric_labels: HashMap<String, Vec<LabelPair>>,
    /// Sorted list of metric names to output.
    pub output: Vec<String>,
}

impl DevInfo {
    /// Number of simulated devices.
    pub fn device_count(&self) -> usize {
        self.device_labels.len()
    }

    /// Resolves device file names to device indices. All-or-nothing: any
    /// unknown name fails the whole lookup.
    pub fn resolve_devices(&self, names: &[String]) -> Option<Vec<usize>> {
        let mut devices = Vec::with_capacity(names.len());
        let mut errors = 0;
        for name in names {
            match self.device_map.get(name) {
                Some(&dev) => devices.push(dev),
                None => errors += 1,
            }
        }
        if errors > 0 {
            warn!(
                errors,
                ?names,
                "workload device file names did not match server ones"
            );
            return None;
        }
        devices.sort_unstable();
        devices.dedup();
        Some(devices)
    }

    /// Loads the three identity documents from disk and builds the
    /// [`DevInfo`] for `count` simulated devices.
    pub fn load<P: AsRef<Path>>(
        count: usize,
        typefile: P,
        listfile: P,
        idfile: P,
    ) -> Result<Self, ConfigError> {
        let identity: Identity = read_json(idfile.as_ref())?;
        let devtype: DevType = read_json(typefile.as_ref())?;
        let devlist: DevList = read_json(listfile.as_ref())?;
        Self::from_parts(count, devtype, devlist, identity)
    }

    fn from_parts(
        count: usize,
        devtype: DevType,
        devlist: DevList,
        identity: Identity,
    ) -> Result<Self, ConfigError> {
        if devlist.device_labels.len() < count {
            return Err(ConfigError::TooFewDevices {
                requested: count,
                available: devlist.device_labels.len(),
            });
        }

        let (type_labels, missing) = map_labels(&devtype.device_labels, &identity.device_label_map);
        if !missing.is_empty() {
            warn!(?missing, "no identity mapping for device type labels");
        }

        let mut device_labels = Vec::with_capacity(count);
        let mut device_map = HashMap::with_capacity(count);
        for (dev, instance) in devlist.device_labels.iter().take(count).enumerate() {
            let file = instance
                .get("file")
                .ok_or(ConfigError::MissingFileLabel { index: dev })?;
            device_map.insert(file.clone(), dev);

            let (mut labels, missing) = map_labels(instance, &identity.device_label_map);
            if !missing.is_empty() {
                warn!(dev, ?missing, "no identity mapping for device list labels");
            }
            labels.extend(type_labels.iter().cloned());
            for label in identity.device_label_map.keys() {
                if !instance.contains_key(label) && !devtype.device_labels.contains_key(label) {
                    warn!(dev, label, "device label missing for identity mapping");
                }
            }
            device_labels.push(sort_label_list(labels));
        }

        for metric in identity.metric_map.keys() {
            if !devtype.metric_limits.contains_key(metric) {
                warn!(metric, "no device type metric/limit for identity mapping");
            }
        }
        let mut metric_limits = BTreeMap::new();
        for (metric, limit) in &devtype.metric_limits {
            match identity.metric_map.get(metric) {
                Some(name) => {
                    info!(from = metric, to = name, "metric/limit name identity mapping");
                    metric_limits.insert(name.clone(), *limit);
                }
                None => warn!(metric, "no identity mapping for device metric/limit"),
            }
        }

        let mut metric_labels = HashMap::with_capacity(identity.metric_labels.len());
        for (metric, labels) in &identity.metric_labels {
            let name = identity
                .metric_map
                .get(metric)
                .ok_or_else(|| ConfigError::UnmappedMetricLabels {
                    metric: metric.clone(),
                })?;
            let pairs = labels
                .iter()
                .map(|(name, value)| LabelPair {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect();
            metric_labels.insert(name.clone(), sort_label_list(pairs));
        }

        let mut output: Vec<String> = identity.metric_map.values().cloned().collect();
        output.sort_unstable();
        Ok(DevInfo {
            device_labels,
            metric_limits,
            device_map,
            metric_labels,
            output,
        })
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Maps label names through the identity, dropping labels without a
/// mapping. Returns the mapped pairs and the names left unmapped.
fn map_labels(
    labels: &HashMap<String, String>,
    mapping: &HashMap<String, String>,
) -> (Vec<LabelPair>, Vec<String>) {
    let mut result = Vec::new();
    let mut missing = Vec::new();
    for (label, value) in labels {
        match mapping.get(label) {
            Some(name) => result.push(LabelPair {
                name: name.clone(),
                value: value.clone(),
            }),
            None => missing.push(label.clone()),
        }
    }
    (result, missing)
}

fn sort_label_list(mut labels: Vec<LabelPair>) -> Vec<LabelPair> {
    labels.sort_by(|a, b| a.name.cmp(&b.name));
    labels
}
