//! Host hardware metrics
//!
//! [`SystemMonitor`] samples the machine with `sysinfo` on a blocking task and
//! caches the latest [`HardwareSnapshot`]. Readers never block on sampling.

use clawverse_core::{HardwareSnapshot, Mood};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of the latest hardware snapshot
pub trait MetricsSource: Send + Sync {
    /// Latest sample, `None` until the first one is taken
    fn snapshot(&self) -> Option<HardwareSnapshot>;

    /// Mood derived from the latest sample
    fn mood(&self) -> Mood {
        match self.snapshot() {
            Some(snapshot) => Mood::from_cpu(snapshot.cpu_usage),
            None => Mood::Sleeping,
        }
    }
}

/// Fixed snapshot, for tests and hosts without metrics
#[derive(Clone, Debug, Default)]
pub struct StaticMetrics(pub Option<HardwareSnapshot>);

impl MetricsSource for StaticMetrics {
    fn snapshot(&self) -> Option<HardwareSnapshot> {
        self.0.clone()
    }
}

/// Periodic sampler backed by `sysinfo`
#[derive(Debug, Default)]
pub struct SystemMonitor {
    latest: RwLock<Option<HardwareSnapshot>>,
}

impl SystemMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sample every `interval` until cancelled
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut sampler = match tokio::task::spawn_blocking(Sampler::new).await {
                Ok(sampler) => sampler,
                Err(e) => {
                    warn!("Hardware sampler failed to start: {}", e);
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval.max(MINIMUM_CPU_UPDATE_INTERVAL));
            let mut first = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let sampled = tokio::task::spawn_blocking(move || {
                    let snapshot = sampler.sample();
                    (sampler, snapshot)
                })
                .await;
                let snapshot = match sampled {
                    Ok((returned, snapshot)) => {
                        sampler = returned;
                        snapshot
                    }
                    Err(e) => {
                        warn!("Hardware sampling failed: {}", e);
                        return;
                    }
                };

                if first {
                    info!(
                        "Hardware: {} ({} cores), {} on {}, RAM {}GB, disk free {}GB",
                        snapshot.cpu_model,
                        snapshot.cpu_cores,
                        snapshot.platform,
                        snapshot.hostname,
                        snapshot.ram_total,
                        snapshot.disk_free
                    );
                    first = false;
                } else {
                    debug!("CPU: {}%, RAM: {}%", snapshot.cpu_usage, snapshot.ram_usage);
                }
                *monitor.latest.write() = Some(snapshot);
            }

            debug!("Hardware monitor stopped");
        })
    }
}

impl MetricsSource for SystemMonitor {
    fn snapshot(&self) -> Option<HardwareSnapshot> {
        self.latest.read().clone()
    }
}

struct Sampler {
    system: System,
}

impl Sampler {
    /// Takes a baseline CPU reading so the first sample has a usable delta
    fn new() -> Self {
        let mut system = System::new_all();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();
        Self { system }
    }

    fn sample(&mut self) -> HardwareSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory() as f64;
        let ram_usage = if total_memory > 0.0 {
            self.system.used_memory() as f64 / total_memory * 100.0
        } else {
            0.0
        };
        let disk_free: u64 = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|disk| disk.available_space())
            .sum();

        HardwareSnapshot {
            cpu_usage: percent(f64::from(self.system.global_cpu_usage())),
            ram_usage: percent(ram_usage),
            ram_total: (total_memory / BYTES_PER_GB).round(),
            disk_free: (disk_free as f64 / BYTES_PER_GB).round(),
            uptime: System::uptime(),
            platform: std::env::consts::OS.to_string(),
            hostname: System::host_name().unwrap_or_default(),
            cpu_model: self
                .system
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_default(),
            cpu_cores: self.system.cpus().len() as u32,
        }
    }
}

/// Rounded and clamped to 0-100. Non-finite readings become 0.
fn percent(value: f64) -> f64 {
    if value.is_finite() {
        value.round().clamp(0.0, 100.0)
    } else {
        0.0
    }
}
