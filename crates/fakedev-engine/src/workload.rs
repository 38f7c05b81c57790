//! Workload descriptors, admission validation and the workload store.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use fakedev_config::DevInfo;

use crate::conn::BoxConn;

/// One activity phase as sent on the wire: utilization percents and a
/// duration in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProfileSpec {
    pub load: i64,
    pub fluctuation: i64,
    pub seconds: u64,
}

/// Workload descriptor wire format: one JSON document per connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkloadSpec {
    pub name: String,
    /// How many times the profile runs in total; 0 loops forever.
    pub repeat: u32,
    pub profile: Vec<ProfileSpec>,
    /// Device file names; empty means "use the caller's preset set".
    pub devices: Vec<String>,
    /// Reserved until metric dependencies work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<HashMap<String, f64>>,
}

/// One activity phase after admission: ratios against the device range,
/// an absolute deadline, and the cumulative offset from profile start
/// (used to recompute deadlines when the profile loops).
#[derive(Debug, Clone, Copy)]
pub struct ActivitySegment {
    pub load: f64,
    pub fluctuation: f64,
    pub deadline: Instant,
    pub offset: Duration,
}

/// Stand-in for deadlines too far out to represent as an instant.
const NEVER_SECS: u64 = 100 * 365 * 24 * 3600;

/// Wire durations are unbounded, so cumulative offsets can exceed what an
/// instant can hold. Such deadlines saturate to "never expires" instead of
/// overflowing.
fn deadline_after(now: Instant, offset: Duration) -> Instant {
    now.checked_add(offset)
        .unwrap_or_else(|| now + Duration::from_secs(NEVER_SECS))
}

/// Why a workload submission was rejected.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unmarshaling workload descriptor JSON failed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("workload name is empty")]
    EmptyName,

    #[error("workload '{name}' has no activity profile")]
    EmptyProfile { name: String },

    #[error("activity {index}: {load} load +/- {fluctuation} fluctuation is not within 0-100")]
    InvalidSegment {
        index: usize,
        load: i64,
        fluctuation: i64,
    },

    #[error("workload '{name}' device names have no server mapping")]
    UnmappedDevices { name: String },

    #[error("workload '{name}' has no mapped devices")]
    NoDevices { name: String },
}

/// An admitted workload bound to a set of simulated devices.
pub struct Workload {
    pub name: String,
    /// Present for socket-submitted workloads, absent for baseline ones
    /// loaded from files at startup.
    pub conn: Option<BoxConn>,
    /// Remaining total runs; 0 means forever.
    pub repeat: u32,
    pub profile: Vec<ActivitySegment>,
    /// Cursor into `profile`; always in range outside of `advance`.
    pub activity: usize,
    pub devices: HashSet<usize>,
}

impl Workload {
    /// Validates a raw descriptor and builds the workload, computing the
    /// cumulative segment deadlines from `now`. Admission is all-or-nothing
    /// and atomic; the connection is attached by the caller on success only.
    ///
    /// Segments with a zero or missing duration get the configurable
    /// `fallback` duration instead, so they do not expire (and get skipped)
    /// on the very next tick by accident.
    pub fn from_descriptor(
        devinfo: &DevInfo,
        text: &[u8],
        preset: Option<HashSet<usize>>,
        now: Instant,
        fallback: Duration,
    ) -> Result<Self, AdmissionError> {
        let spec: WorkloadSpec = serde_json::from_slice(text)?;
        if spec.name.is_empty() {
            return Err(AdmissionError::EmptyName);
        }
        if spec.profile.is_empty() {
            return Err(AdmissionError::EmptyProfile { name: spec.name });
        }
        for (index, p) in spec.profile.iter().enumerate() {
            let in_range = (0..=100).contains(&p.load) && (0..=100).contains(&p.fluctuation);
            if !in_range || p.load - p.fluctuation < 0 || p.load + p.fluctuation > 100 {
                return Err(AdmissionError::InvalidSegment {
                    index,
                    load: p.load,
                    fluctuation: p.fluctuation,
                });
            }
        }
        let devices: HashSet<usize> = if spec.devices.is_empty() {
            preset.unwrap_or_default()
        } else {
            match devinfo.resolve_devices(&spec.devices) {
                Some(devices) => devices.into_iter().collect(),
                None => return Err(AdmissionError::UnmappedDevices { name: spec.name }),
            }
        };
        if devices.is_empty() {
            return Err(AdmissionError::NoDevices { name: spec.name });
        }
        if spec.limits.is_some() {
            debug!(name = %spec.name, "ignoring workload limits until metric dependencies work");
        }

        let mut total = Duration::ZERO;
        let mut profile = Vec::with_capacity(spec.profile.len());
        for (index, p) in spec.profile.iter().enumerate() {
            let seconds = if p.seconds > 0 {
                Duration::from_secs(p.seconds)
            } else {
                debug!(index, secs = fallback.as_secs(), "zero activity duration, using fallback");
                fallback
            };
            total = total.saturating_add(seconds);
            profile.push(ActivitySegment {
                load: p.load as f64 / 100.0,
                fluctuation: p.fluctuation as f64 / 100.0,
                deadline: deadline_after(now, total),
                offset: total,
            });
        }
        info!(
            name = %spec.name,
            devices = devices.len(),
            total_secs = total.as_secs(),
            "loaded workload"
        );
        Ok(Workload {
            name: spec.name,
            conn: None,
            repeat: spec.repeat,
            profile,
            activity: 0,
            devices,
        })
    }

    /// The activity segment currently driving this workload's load.
    pub fn current(&self) -> &ActivitySegment {
        &self.profile[self.activity]
    }

    /// Index of the first not-yet-expired activity at or after the cursor.
    /// May run past the end of the profile.
    pub fn next_activity(&self, now: Instant) -> usize {
        let mut activity = self.activity;
        while activity < self.profile.len() {
            if now < self.profile[activity].deadline {
                break;
            }
            activity += 1;
        }
        activity
    }

    /// Restarts the profile: deadlines move to `now` plus each segment's
    /// cumulative offset, cursor back to the first segment.
    pub fn reset_deadlines(&mut self, now: Instant) {
        for segment in &mut self.profile {
            segment.deadline = deadline_after(now, segment.offset);
        }
        self.activity = 0;
    }
}

/// The mutable collection of active workloads.
#[derive(Default)]
pub struct WorkloadStore {
    workloads: Vec<Workload>,
}

impl WorkloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    pub fn push(&mut self, workload: Workload) {
        self.workloads.push(workload);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Workload> {
        self.workloads.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Workload> {
        self.workloads.iter_mut()
    }

    /// Removes the workloads at the given indices via swap-remove and
    /// returns them (so the caller can settle their connections). Store
    /// order is not preserved; nothing relies on it.
    pub fn remove_many(&mut self, mut indices: Vec<usize>) -> Vec<Workload> {
        // Reverse sort so swapped-in tail elements keep their indices valid.
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();
        let mut removed = Vec::with_capacity(indices.len());
        for index in indices {
            info!(workload = index, name = %self.workloads[index].name, "removing workload");
            removed.push(self.workloads.swap_remove(index));
        }
        removed
    }
}
