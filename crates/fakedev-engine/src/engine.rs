//! The per-scrape simulation pass.
//!
//! Every scrape drives one full pass: drain queued workload connections,
//! recompute every device metric from baseline plus workload contributions,
//! advance/loop/remove workloads, then encode the exposition text. The
//! whole pass runs under the caller's lock, so concurrent scrapes serialize
//! completely and never observe partial state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use fakedev_config::DevInfo;

use crate::conn::{BoxConn, ConnReceiver, ExitStatus, Liveness};
use crate::encode;
use crate::workload::{Workload, WorkloadStore};

/// Simulation engine context: the device registry values, the workload
/// store, the admission queue tail and the injected fluctuation randomness.
pub struct SimulationEngine {
    devinfo: Arc<DevInfo>,
    /// Per-device metric values, filled by `aggregate`.
    values: Vec<HashMap<String, f64>>,
    store: WorkloadStore,
    queue: ConnReceiver,
    rng: SmallRng,
    /// Stand-in duration for zero/missing segment durations.
    fallback: Duration,
}

impl SimulationEngine {
    /// Creates the engine for the given device registry. `seed` pins the
    /// fluctuation randomness for reproducible runs; `fallback` substitutes
    /// zero/missing activity segment durations.
    pub fn new(
        devinfo: Arc<DevInfo>,
        queue: ConnReceiver,
        seed: Option<u64>,
        fallback: Duration,
    ) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let values = vec![HashMap::new(); devinfo.device_count()];
        Self {
            devinfo,
            values,
            store: WorkloadStore::new(),
            queue,
            rng,
            fallback,
        }
    }

    pub fn devinfo(&self) -> &DevInfo {
        &self.devinfo
    }

    pub fn workload_count(&self) -> usize {
        self.store.len()
    }

    /// Admits one raw workload descriptor. Baseline workloads loaded from
    /// files pass their preset device set and no connection; socket
    /// submissions pass their connection, which gets the `"1"` status on
    /// rejection.
    pub async fn admit(
        &mut self,
        text: &[u8],
        preset: Option<HashSet<usize>>,
        conn: Option<BoxConn>,
    ) -> bool {
        debug!(descriptor = %String::from_utf8_lossy(text), "workload");
        match Workload::from_descriptor(&self.devinfo, text, preset, Instant::now(), self.fallback)
        {
            Ok(mut workload) => {
                workload.conn = conn;
                self.store.push(workload);
                true
            }
            Err(err) => {
                warn!(%err, "ignoring workload");
                if let Some(mut conn) = conn {
                    conn.send_status(ExitStatus::Error).await;
                }
                false
            }
        }
    }

    /// Runs one full simulation pass and returns the exposition text.
    pub async fn scrape(&mut self) -> String {
        self.drain().await;
        self.aggregate();
        self.advance(Instant::now()).await;
        encode::render(&self.devinfo, &self.values)
    }

    /// Pops all queued workload connections and feeds their descriptors to
    /// admission. No preset device set here: the descriptor's own Devices
    /// field governs.
    async fn drain(&mut self) {
        while let Ok(mut conn) = self.queue.try_recv() {
            match conn.read_descriptor().await {
                Ok(text) => {
                    info!(bytes = text.len(), "new workload connected");
                    self.admit(&text, None, Some(conn)).await;
                }
                Err(err) => {
                    warn!(%err, "zero bytes or error from workload connection read");
                    conn.send_status(ExitStatus::Error).await;
                }
            }
        }
    }

    /// Recomputes every device metric: baseline (min), plus each bound
    /// workload's `scale * (load + fluctuation offset)`, clamped to the
    /// metric limits. Clamping is a diagnostic, not an error.
    fn aggregate(&mut self) {
        for dev in 0..self.values.len() {
            let mut limited: Vec<String> = Vec::new();
            for (metric, limit) in &self.devinfo.metric_limits {
                let scale = limit.max - limit.min;
                let mut value = limit.min;
                for workload in self.store.iter() {
                    if !workload.devices.contains(&dev) {
                        continue;
                    }
                    let segment = workload.current();
                    let offset = (self.rng.random::<f64>() - 0.5) * segment.fluctuation;
                    value += scale * (segment.load + offset);
                }
                // Limits differ between metrics, which helps identify them
                // in the diagnostic.
                if value < limit.min {
                    limited.push(format!("{} < {}", value, limit.min));
                    value = limit.min;
                }
                if value > limit.max {
                    limited.push(format!("{} > {}", value, limit.max));
                    value = limit.max;
                }
                self.values[dev].insert(metric.clone(), value);
            }
            if !limited.is_empty() {
                info!(dev, limited = %limited.join(", "), "device metrics needed limiting");
            }
        }
    }

    /// Advances workload activity cursors past expired segments, loops or
    /// removes finished workloads, and drops disconnected ones.
    async fn advance(&mut self, now: Instant) {
        let mut remove: Vec<usize> = Vec::new();
        for (i, workload) in self.store.iter_mut().enumerate() {
            if let Some(conn) = workload.conn.as_mut() {
                if conn.probe().await == Liveness::Closed {
                    info!(workload = i, name = %workload.name, "workload disconnected");
                    // No status write for a peer that already went away.
                    workload.conn = None;
                    remove.push(i);
                    continue;
                }
            }
            let activity = workload.next_activity(now);
            if activity == workload.activity {
                continue;
            }
            info!(
                workload = i,
                name = %workload.name,
                activity,
                total = workload.profile.len(),
                "activity expired"
            );
            if activity < workload.profile.len() {
                workload.activity = activity;
                continue;
            }
            if workload.repeat == 1 {
                remove.push(i);
                continue;
            }
            if workload.repeat > 0 {
                workload.repeat -= 1;
            }
            workload.reset_deadlines(now);
            info!(workload = i, name = %workload.name, "activity looped");
        }
        self.reap(remove).await;
    }

    /// Removes marked workloads; naturally completed ones get the `"0"`
    /// status byte before their connection closes.
    async fn reap(&mut self, remove: Vec<usize>) {
        for mut workload in self.store.remove_many(remove) {
            if let Some(mut conn) = workload.conn.take() {
                conn.send_status(ExitStatus::Ok).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::FakeConn;
    use crate::conn::{admission_queue, ConnSender};
    use fakedev_config::MetricLimit;
    use std::collections::BTreeMap;

    fn devinfo(count: usize) -> Arc<DevInfo> {
        let mut metric_limits = BTreeMap::new();
        metric_limits.insert("busy".to_string(), MetricLimit { min: 0.0, max: 100.0 });
        metric_limits.insert("power".to_string(), MetricLimit { min: 3.0, max: 80.0 });
        Arc::new(DevInfo {
            device_labels: vec![Vec::new(); count],
            metric_limits,
            device_map: (0..count).map(|i| (format!("card{i}"), i)).collect(),
            metric_labels: Default::default(),
            output: vec!["busy".to_string(), "power".to_string()],
        })
    }

    fn engine(count: usize, fallback_secs: u64) -> (SimulationEngine, ConnSender) {
        let (tx, rx) = admission_queue();
        let engine = SimulationEngine::new(
            devinfo(count),
            rx,
            Some(42),
            Duration::from_secs(fallback_secs),
        );
        (engine, tx)
    }

    #[tokio::test]
    async fn untouched_device_reports_baseline() {
        let (mut engine, _tx) = engine(2, 86400);
        engine.scrape().await;
        assert_eq!(engine.values[0]["busy"], 0.0);
        assert_eq!(engine.values[1]["power"], 3.0);
    }

    #[tokio::test]
    async fn full_load_without_fluctuation_is_exact() {
        let (mut engine, _tx) = engine(2, 86400);
        let ok = engine
            .admit(
                br#"{"Name": "wl", "Repeat": 0,
                    "Profile": [{"Load": 100, "Fluctuation": 0, "Seconds": 60}],
                    "Devices": ["card0"]}"#,
                None,
                None,
            )
            .await;
        assert!(ok);
        for _ in 0..3 {
            engine.scrape().await;
            assert_eq!(engine.values[0]["busy"], 100.0);
            // Device 1 is untouched and stays at baseline.
            assert_eq!(engine.values[1]["busy"], 0.0);
        }
    }

    #[tokio::test]
    async fn fluctuating_load_stays_within_band() {
        let (mut engine, _tx) = engine(1, 86400);
        engine
            .admit(
                br#"{"Name": "wl",
                    "Profile": [{"Load": 50, "Fluctuation": 20, "Seconds": 60}],
                    "Devices": ["card0"]}"#,
                None,
                None,
            )
            .await;
        for _ in 0..50 {
            engine.scrape().await;
            let value = engine.values[0]["busy"];
            assert!((40.0..=60.0).contains(&value), "value {value} out of band");
        }
    }

    #[tokio::test]
    async fn summed_contributions_are_clamped_to_max() {
        let (mut engine, _tx) = engine(1, 86400);
        for name in ["a", "b"] {
            let text = format!(
                r#"{{"Name": "{name}",
                    "Profile": [{{"Load": 60, "Fluctuation": 0, "Seconds": 60}}],
                    "Devices": ["card0"]}}"#
            );
            engine.admit(text.as_bytes(), None, None).await;
        }
        engine.scrape().await;
        assert_eq!(engine.values[0]["busy"], 100.0);
        assert_eq!(engine.values[0]["power"], 80.0);
    }

    #[tokio::test]
    async fn run_once_workload_completes_on_next_tick() {
        // Fallback zero makes a zero-duration segment expire immediately.
        let (mut engine, _tx) = engine(1, 0);
        let (conn, sent) = FakeConn::new(None, Liveness::StillOpen);
        engine
            .admit(
                br#"{"Name": "wl", "Repeat": 1,
                    "Profile": [{"Load": 100, "Fluctuation": 0}],
                    "Devices": ["card0"]}"#,
                None,
                Some(Box::new(conn)),
            )
            .await;
        assert_eq!(engine.workload_count(), 1);
        engine.scrape().await;
        // The expiring activity still contributed to this scrape's values.
        assert_eq!(engine.values[0]["busy"], 100.0);
        assert_eq!(engine.workload_count(), 0);
        assert_eq!(*sent.lock().unwrap(), vec![b'0']);
    }

    #[tokio::test]
    async fn infinite_repeat_loops_instead_of_expiring() {
        let (mut engine, _tx) = engine(1, 0);
        engine
            .admit(
                br#"{"Name": "wl", "Repeat": 0,
                    "Profile": [{"Load": 10, "Fluctuation": 0}],
                    "Devices": ["card0"]}"#,
                None,
                None,
            )
            .await;
        for _ in 0..5 {
            engine.scrape().await;
            assert_eq!(engine.workload_count(), 1);
        }
    }

    #[tokio::test]
    async fn finite_repeat_counts_down() {
        let (mut engine, _tx) = engine(1, 0);
        engine
            .admit(
                br#"{"Name": "wl", "Repeat": 3,
                    "Profile": [{"Load": 10, "Fluctuation": 0}],
                    "Devices": ["card0"]}"#,
                None,
                None,
            )
            .await;
        engine.scrape().await; // 3 -> 2
        engine.scrape().await; // 2 -> 1
        assert_eq!(engine.workload_count(), 1);
        engine.scrape().await; // 1 -> removed
        assert_eq!(engine.workload_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_removes_workload_regardless_of_repeat() {
        let (mut engine, _tx) = engine(1, 86400);
        let (conn, sent) = FakeConn::new(None, Liveness::Closed);
        engine
            .admit(
                br#"{"Name": "wl", "Repeat": 0,
                    "Profile": [{"Load": 100, "Fluctuation": 0, "Seconds": 3600}],
                    "Devices": ["card0"]}"#,
                None,
                Some(Box::new(conn)),
            )
            .await;
        engine.scrape().await;
        assert_eq!(engine.workload_count(), 0);
        // A vanished peer gets no status byte.
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_connection_is_admitted_on_scrape() {
        let (mut engine, tx) = engine(1, 86400);
        let (conn, _sent) = FakeConn::new(
            Some(r#"{"Name": "wl", "Profile": [{"Load": 30, "Seconds": 60}], "Devices": ["card0"]}"#),
            Liveness::StillOpen,
        );
        tx.send(Box::new(conn)).await.unwrap();
        // Nothing happens until a scrape drains the queue.
        assert_eq!(engine.workload_count(), 0);
        engine.scrape().await;
        assert_eq!(engine.workload_count(), 1);
        assert_eq!(engine.values[0]["busy"], 30.0);
    }

    #[tokio::test]
    async fn extreme_duration_descriptor_does_not_abort_the_scrape() {
        let (mut engine, tx) = engine(1, 86400);
        let (conn, _sent) = FakeConn::new(
            Some(
                r#"{"Name": "wl",
                    "Profile": [{"Load": 1, "Seconds": 18446744073709551615}],
                    "Devices": ["card0"]}"#,
            ),
            Liveness::StillOpen,
        );
        tx.send(Box::new(conn)).await.unwrap();
        engine.scrape().await;
        assert_eq!(engine.workload_count(), 1);
    }

    #[tokio::test]
    async fn rejected_connection_gets_error_status() {
        let (mut engine, tx) = engine(1, 86400);
        let (conn, sent) = FakeConn::new(Some("not json"), Liveness::StillOpen);
        tx.send(Box::new(conn)).await.unwrap();
        engine.scrape().await;
        assert_eq!(engine.workload_count(), 0);
        assert_eq!(*sent.lock().unwrap(), vec![b'1']);
    }

    #[tokio::test]
    async fn unreadable_connection_gets_error_status() {
        let (mut engine, tx) = engine(1, 86400);
        let (conn, sent) = FakeConn::new(None, Liveness::StillOpen);
        tx.send(Box::new(conn)).await.unwrap();
        engine.scrape().await;
        assert_eq!(engine.workload_count(), 0);
        assert_eq!(*sent.lock().unwrap(), vec![b'1']);
    }

    #[tokio::test]
    async fn seeded_runs_are_reproducible() {
        let text = r#"{"Name": "wl",
            "Profile": [{"Load": 50, "Fluctuation": 30, "Seconds": 60}],
            "Devices": ["card0"]}"#;
        let mut outputs = Vec::new();
        for _ in 0..2 {
            let (mut engine, _tx) = engine(1, 86400);
            engine.admit(text.as_bytes(), None, None).await;
            engine.scrape().await;
            outputs.push(engine.values[0]["busy"]);
        }
        assert_eq!(outputs[0], outputs[1]);
    }
}
