//! Periodic miner stats
//!
//! Every ~30s (exponentially distributed, capped at 90s) the miner posts host
//! CPU, memory and disk figures together with one section per worker. Taking
//! a worker's stats also enforces its disk quota.

use crate::client::CoordinatorClient;
use crate::transport::TransportError;
use crate::worker::{Worker, WorkerStats};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Mean time between stats uploads
pub const MEAN_PERIOD: Duration = Duration::from_secs(30);

/// Longest gap between stats uploads
pub const MAX_PERIOD: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub brand: String,
    pub cores: usize,
    pub frequency_mhz: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub available: u64,
}

/// Host-level part of `/miner/stats`
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu: CpuInfo,
    /// Usage percent per logical CPU
    pub cpu_usage: Vec<f32>,
    pub memory: MemoryStats,
    /// Root filesystem
    pub disk: DiskStats,
}

/// Body of `/miner/stats`
#[derive(Debug, Clone, Serialize)]
pub struct MinerStats {
    #[serde(flatten)]
    pub system: SystemStats,
    pub workers: Vec<WorkerStats>,
    pub timestamp: i64,
}

/// Total size of the regular files below `path`. Missing paths count as 0.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// [`dir_size`] on the blocking pool, for trees too large to walk on a
/// runtime thread. `None` counts as 0.
pub async fn dir_size_async(path: Option<PathBuf>) -> u64 {
    let Some(path) = path else {
        return 0;
    };
    match tokio::task::spawn_blocking(move || dir_size(&path)).await {
        Ok(size) => size,
        Err(e) => {
            warn!("Directory size walk failed: {}", e);
            0
        }
    }
}

/// Total and available space of the filesystem mounted at `/`.
pub fn root_disk() -> DiskStats {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| DiskStats {
            total: d.total_space(),
            available: d.available_space(),
        })
        .unwrap_or_default()
}

/// Memory the system can still hand out, in bytes.
pub fn available_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Keeps a `System` around so CPU usage is measured between samples
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self { sys }
    }

    pub fn sample(&mut self) -> SystemStats {
        self.sys.refresh_cpu_all();
        self.sys.refresh_memory();

        let cpus = self.sys.cpus();
        let cpu = CpuInfo {
            brand: cpus
                .first()
                .map(|c| c.brand().to_string())
                .unwrap_or_default(),
            cores: cpus.len(),
            frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
        };

        SystemStats {
            cpu,
            cpu_usage: cpus.iter().map(|c| c.cpu_usage()).collect(),
            memory: MemoryStats {
                total: self.sys.total_memory(),
                used: self.sys.used_memory(),
                available: self.sys.available_memory(),
            },
            disk: root_disk(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponentially distributed delay with the given mean, capped at `max`.
pub fn next_delay<R: Rng>(rng: &mut R, mean: Duration, max: Duration) -> Duration {
    // 1 - U lies in (0, 1], keeping ln finite
    let u: f64 = 1.0 - rng.gen::<f64>();
    let secs = -u.ln() * mean.as_secs_f64();
    Duration::from_secs_f64(secs).min(max)
}

/// Collect the stats of every worker, skipping workers whose device failed.
pub async fn collect_workers(workers: &[Arc<Worker>]) -> Vec<WorkerStats> {
    let mut out = Vec::with_capacity(workers.len());
    for worker in workers {
        if worker.is_retired() {
            continue;
        }
        match worker.stats().await {
            Ok(s) => out.push(s),
            Err(e) => warn!("[gpu {}] Stats unavailable: {}", worker.index(), e),
        }
    }
    out
}

/// Upload miner stats at random intervals until cancelled.
pub async fn run_stats_uploader(
    client: CoordinatorClient,
    workers: Vec<Arc<Worker>>,
    cancel: CancellationToken,
) {
    let mut sampler = SystemSampler::new();
    loop {
        let delay = next_delay(&mut rand::thread_rng(), MEAN_PERIOD, MAX_PERIOD);
        debug!("Next stats upload in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let stats = MinerStats {
            system: sampler.sample(),
            workers: collect_workers(&workers).await,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        match client.upload_stats(&cancel, &stats).await {
            Ok(()) => debug!("Uploaded stats for {} workers", stats.workers.len()),
            Err(TransportError::Canceled) => return,
            Err(e) => warn!("Stats upload failed: {}", e),
        }
    }
}
