//! Per-device worker
//!
//! One worker per GPU. It owns the device sensor, the cryptominer toggle and
//! the state of the job currently running on the device.
//!
//! ```text
//!   Idle --bid--> Bidding --won--> Executing --done/err/cancel--> Idle
//!                    |
//!                    +--lost/error--> Idle
//! ```
//!
//! Bidding and execution are serialised per worker by an operation lock.
//! `busy` is derived from the job id, so the two cannot disagree.

use crate::auction::DrainCounters;
use crate::client::{Bid, BidSpecs, CoordinatorClient, JobDescriptor};
use crate::config::DeviceConfig;
use crate::cryptominer::MinerToggle;
use crate::docker::{ContainerRuntime, ContainerUsage};
use crate::gpu::{DeviceSnapshot, GpuError, GpuSensor};
use crate::stats::dir_size_async;
use crate::transport::{RetryPolicy, TransportError};
use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry budget for a single bid on 502
pub const BID_MAX_RETRIES: u32 = 3;

/// Interval between device snapshot uploads
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BidError {
    #[error("bid lost")]
    Lost,

    #[error("already busy with job {0}")]
    Busy(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Services shared by every worker
pub struct WorkerContext {
    pub client: CoordinatorClient,
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Parent of job workspaces (`~/.emrys`)
    pub jobs_root: PathBuf,
    /// Where notebook ssh keys are written (`~/.config/emrys`)
    pub config_dir: PathBuf,
    /// Program used for the notebook reverse tunnel
    pub ssh_program: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Bidding,
    Executing,
}

/// State of the job on this device. Reset as a whole when the job ends.
#[derive(Debug, Default)]
struct JobSlot {
    job_id: Option<String>,
    container_id: Option<String>,
    data_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    ssh_key: Option<Bytes>,
    notebook: bool,
    disk_quota_exceeded: bool,
    /// Fired by the cancel watcher or the disk quota check
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
struct WorkerState {
    phase: Phase,
    job: JobSlot,
}

/// Job handed to the executor after a won bid
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: String,
    /// Private key for the notebook tunnel, notebook jobs only
    pub ssh_key: Option<Bytes>,
}

impl ActiveJob {
    pub fn is_notebook(&self) -> bool {
        self.ssh_key.is_some()
    }
}

/// Disk usage of a running job
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DockerDisk {
    pub size_rw: i64,
    pub size_root_fs: i64,
    pub size_data_dir: i64,
    pub size_output_dir: i64,
}

impl DockerDisk {
    pub fn total(&self) -> i64 {
        self.size_rw + self.size_root_fs + self.size_data_dir + self.size_output_dir
    }
}

/// Per-worker section of `/miner/stats`
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    #[serde(rename = "jobID", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub gpu: DeviceSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_stats: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_disk: Option<DockerDisk>,
}

pub struct Worker {
    config: DeviceConfig,
    sensor: Arc<GpuSensor>,
    miner: Arc<dyn MinerToggle>,
    ctx: Arc<WorkerContext>,
    state: Mutex<WorkerState>,
    op_lock: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl Worker {
    pub fn new(
        config: DeviceConfig,
        sensor: Arc<GpuSensor>,
        miner: Arc<dyn MinerToggle>,
        ctx: Arc<WorkerContext>,
    ) -> Self {
        Self {
            config,
            sensor,
            miner,
            ctx,
            state: Mutex::new(WorkerState {
                phase: Phase::Idle,
                job: JobSlot::default(),
            }),
            op_lock: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.config.index
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn sensor(&self) -> &Arc<GpuSensor> {
        &self.sensor
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub(crate) fn miner(&self) -> &Arc<dyn MinerToggle> {
        &self.miner
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().job.job_id.is_some()
    }

    pub fn job_id(&self) -> Option<String> {
        self.state.lock().job.job_id.clone()
    }

    /// Idle and still fit to take jobs
    pub fn is_idle(&self) -> bool {
        !self.is_retired() && self.phase() == Phase::Idle && !self.is_busy()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Take the worker out of service after a fatal device error.
    pub fn retire(&self, reason: &GpuError) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            error!(
                "[gpu {}] Fatal device error, worker retired: {}",
                self.index(),
                reason
            );
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    fn begin_job(&self, job: &ActiveJob) {
        let mut state = self.state.lock();
        state.phase = Phase::Executing;
        state.job = JobSlot {
            job_id: Some(job.id.clone()),
            ssh_key: job.ssh_key.clone(),
            notebook: job.is_notebook(),
            ..Default::default()
        };
    }

    pub(crate) fn clear_job(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Idle;
        state.job = JobSlot::default();
    }

    pub(crate) fn set_container(&self, id: &str) {
        self.state.lock().job.container_id = Some(id.to_string());
    }

    pub(crate) fn set_dirs(&self, data_dir: &Path, output_dir: &Path) {
        let mut state = self.state.lock();
        state.job.data_dir = Some(data_dir.to_path_buf());
        state.job.output_dir = Some(output_dir.to_path_buf());
    }

    pub(crate) fn register_job_cancel(&self, token: CancellationToken) {
        self.state.lock().job.cancel = Some(token);
    }

    pub fn is_notebook(&self) -> bool {
        self.state.lock().job.notebook
    }

    pub fn ssh_key(&self) -> Option<Bytes> {
        self.state.lock().job.ssh_key.clone()
    }

    pub fn disk_quota_exceeded(&self) -> bool {
        self.state.lock().job.disk_quota_exceeded
    }

    /// Mark the running job as over quota and cancel it.
    pub fn flag_disk_quota(&self) {
        let token = {
            let mut state = self.state.lock();
            state.job.disk_quota_exceeded = true;
            state.job.cancel.clone()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    // ------------------------------------------------------------------------
    // Bidding
    // ------------------------------------------------------------------------

    pub fn make_bid(&self) -> Bid {
        let identity = self.sensor.identity();
        Bid {
            device_id: identity.uuid.clone(),
            specs: BidSpecs {
                rate: self.config.bid_rate,
                gpu: identity.tag.clone(),
                ram: self.config.ram_bytes,
                disk: self.config.disk_bytes,
                pcie: identity.max_pcie_width,
            },
        }
    }

    /// Bid for `job`. On a win, returns the ssh key from the response body,
    /// `None` when the body is empty.
    pub async fn bid(
        &self,
        job: &JobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, BidError> {
        let bid = self.make_bid();
        let mut backoff = RetryPolicy::with_max_retries(BID_MAX_RETRIES).backoff();
        loop {
            if let Some(current) = self.job_id() {
                return Err(BidError::Busy(current));
            }
            match self.ctx.client.bid_once(cancel, &job.id, &bid).await {
                Ok(body) if body.is_empty() => return Ok(None),
                Ok(body) => return Ok(Some(body)),
                Err(TransportError::PaymentRequired { .. }) => return Err(BidError::Lost),
                Err(e) if e.is_transient() => backoff.wait(cancel, e).await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Bid for an auctioned job and, on a win, execute it.
    ///
    /// Skips silently when another operation already holds the worker.
    pub async fn handle_auction(
        self: Arc<Self>,
        job: JobDescriptor,
        counters: Arc<DrainCounters>,
        cancel: CancellationToken,
    ) {
        let Ok(_op) = self.op_lock.try_lock() else {
            debug!("[gpu {}] Busy, skipping job {}", self.index(), job.id);
            return;
        };
        if !self.is_idle() {
            return;
        }

        let outcome = {
            let _bid = counters.track_bid();
            self.set_phase(Phase::Bidding);
            let outcome = self.bid(&job, &cancel).await;
            if outcome.is_err() {
                self.set_phase(Phase::Idle);
            }
            outcome
        };

        let ssh_key = match outcome {
            Ok(key) => key,
            Err(BidError::Lost) => {
                info!("[gpu {}] Lost bid for job {}", self.index(), job.id);
                return;
            }
            Err(BidError::Transport(TransportError::Canceled)) => return,
            Err(e) => {
                warn!("[gpu {}] Bid for job {} failed: {}", self.index(), job.id, e);
                return;
            }
        };

        let active = ActiveJob {
            id: job.id,
            ssh_key,
        };
        info!(
            "[gpu {}] Won job {}{}",
            self.index(),
            active.id,
            if active.is_notebook() { " (notebook)" } else { "" }
        );

        let _job = counters.track_job();
        if let Err(e) = self.execute(&active, &cancel).await {
            error!("[gpu {}] Job {} failed: {:#}", self.index(), active.id, e);
        }
    }

    /// Run a won job. The worker is busy with `job` until it returns, and
    /// its state is cleared whatever the outcome.
    pub async fn execute(&self, job: &ActiveJob, cancel: &CancellationToken) -> Result<()> {
        self.begin_job(job);
        let result = crate::executor::execute(self, job, cancel).await;
        self.clear_job();
        result
    }

    // ------------------------------------------------------------------------
    // Stats and telemetry
    // ------------------------------------------------------------------------

    /// Composite stats for this worker.
    ///
    /// While a container runs, its disk use plus the data and output
    /// directories is checked against the advertised disk; going over
    /// cancels the job.
    pub async fn stats(&self) -> Result<WorkerStats, GpuError> {
        let gpu = match self.sensor.sample().await {
            Ok(s) => s,
            Err(e) => {
                if e.is_fatal() {
                    self.retire(&e);
                }
                return Err(e);
            }
        };

        let (job_id, container_id, data_dir, output_dir) = {
            let state = self.state.lock();
            (
                state.job.job_id.clone(),
                state.job.container_id.clone(),
                state.job.data_dir.clone(),
                state.job.output_dir.clone(),
            )
        };

        let mut stats = WorkerStats {
            job_id,
            gpu,
            docker_stats: None,
            docker_disk: None,
        };
        let Some(container_id) = container_id else {
            return Ok(stats);
        };

        let runtime = &self.ctx.runtime;
        match runtime.container_stats(&container_id).await {
            Ok(s) => stats.docker_stats = Some(s),
            Err(e) => debug!("[gpu {}] Container stats unavailable: {:#}", self.index(), e),
        }
        let usage = match runtime.container_usage(&container_id).await {
            Ok(u) => u,
            Err(e) => {
                debug!("[gpu {}] Container usage unavailable: {:#}", self.index(), e);
                ContainerUsage::default()
            }
        };

        let (data_size, output_size) =
            tokio::join!(dir_size_async(data_dir), dir_size_async(output_dir));
        let disk = DockerDisk {
            size_rw: usage.size_rw,
            size_root_fs: usage.size_root_fs,
            size_data_dir: data_size as i64,
            size_output_dir: output_size as i64,
        };
        if disk.total() > self.config.disk_bytes as i64 && !self.disk_quota_exceeded() {
            warn!(
                "[gpu {}] Job uses {} bytes of {} advertised, canceling",
                self.index(),
                disk.total(),
                self.config.disk_bytes
            );
            self.flag_disk_quota();
        }
        stats.docker_disk = Some(disk);
        Ok(stats)
    }

    /// Upload a device snapshot every `interval` until cancelled or retired.
    pub async fn run_telemetry(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let snapshot = match self.sensor.sample().await {
                Ok(s) => s,
                Err(e) if e.is_fatal() => {
                    self.retire(&e);
                    return;
                }
                Err(e) => {
                    warn!("[gpu {}] Snapshot failed: {}", self.index(), e);
                    continue;
                }
            };

            let job_id = self.job_id();
            if let Err(e) = self
                .ctx
                .client
                .upload_snapshot(&cancel, &snapshot, job_id.as_deref())
                .await
            {
                if matches!(e, TransportError::Canceled) {
                    return;
                }
                warn!("[gpu {}] Snapshot upload failed: {}", self.index(), e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Endpoints;
    use crate::cryptominer::tests::RecordingToggle;
    use crate::docker::tests::FakeRuntime;
    use crate::gpu::tests::FakeGpu;
    use crate::token::TokenHandle;
    use crate::transport::Transport;
    use httpmock::prelude::*;

    pub(crate) struct Harness {
        pub worker: Arc<Worker>,
        pub miner: Arc<RecordingToggle>,
        pub runtime: Arc<FakeRuntime>,
        pub gpu: Arc<FakeGpu>,
        pub home: tempfile::TempDir,
    }

    pub(crate) fn device_config() -> DeviceConfig {
        DeviceConfig {
            index: 0,
            bid_rate: 1.0,
            ram_bytes: 8_000_000_000,
            disk_bytes: 25_000_000_000,
            mining_command: String::new(),
            notebook_port: 8901,
        }
    }

    impl Harness {
        /// Runtime and miner calls, interleaved in the order they happened
        pub(crate) fn sequence(&self) -> Vec<String> {
            self.runtime.sequence.lock().clone()
        }
    }

    pub(crate) async fn harness(base_url: &str, runtime: FakeRuntime) -> Harness {
        harness_with_ssh(base_url, runtime, "true").await
    }

    /// Like [`harness`], with `ssh_program` as the notebook tunnel binary.
    pub(crate) async fn harness_with_ssh(
        base_url: &str,
        runtime: FakeRuntime,
        ssh_program: &str,
    ) -> Harness {
        let home = tempfile::tempdir().unwrap();
        let gpu = Arc::new(FakeGpu::new(1));
        let sensor = Arc::new(GpuSensor::init(gpu.clone(), 0).await.unwrap());
        let miner = Arc::new(RecordingToggle {
            sequence: runtime.sequence.clone(),
            ..Default::default()
        });
        let runtime = Arc::new(runtime);

        let transport = Transport::new(TokenHandle::new("tok".to_string()));
        let ctx = Arc::new(WorkerContext {
            client: CoordinatorClient::new(transport, Endpoints::single(base_url)),
            runtime: runtime.clone(),
            jobs_root: home.path().join(".emrys"),
            config_dir: home.path().join(".config").join("emrys"),
            ssh_program: ssh_program.to_string(),
        });

        let worker = Arc::new(Worker::new(
            device_config(),
            sensor,
            miner.clone(),
            ctx,
        ));
        Harness {
            worker,
            miner,
            runtime,
            gpu,
            home,
        }
    }

    fn job(id: &str) -> JobDescriptor {
        JobDescriptor { id: id.to_string() }
    }

    #[tokio::test]
    async fn test_bid_body_and_specs() {
        let server = MockServer::start();
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let expected = serde_json::to_value(h.worker.make_bid()).unwrap();
        assert_eq!(expected["specs"]["gpu"], "3090");
        assert_eq!(expected["specs"]["ram"], 8_000_000_000u64);
        assert_eq!(
            expected["device_id"],
            "00000000-1111-2222-3333-444455556666"
        );

        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/miner/job/j1/bid")
                .json_body(expected.clone());
            then.status(200);
        });

        let won = h.worker.bid(&job("j1"), &CancellationToken::new()).await;
        assert!(won.unwrap().is_none());
        mock.assert();
    }

    #[tokio::test]
    async fn test_bid_returns_ssh_key() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/miner/job/j1/bid");
            then.status(200).body("-----BEGIN KEY-----");
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let key = h
            .worker
            .bid(&job("j1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(key.unwrap(), Bytes::from_static(b"-----BEGIN KEY-----"));
    }

    #[tokio::test]
    async fn test_bid_lost_on_402() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/miner/job/j1/bid");
            then.status(402).body("outbid");
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let result = h.worker.bid(&job("j1"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BidError::Lost)));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_bid_permanent_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/miner/job/j1/bid");
            then.status(409).body("auction closed");
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let result = h.worker.bid(&job("j1"), &CancellationToken::new()).await;
        match result {
            Err(BidError::Transport(TransportError::Permanent { status, body })) => {
                assert_eq!(status, 409);
                assert_eq!(body, "auction closed");
            }
            other => panic!("unexpected {:?}", other),
        }
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_bid_refused_when_busy() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/miner/job/j2/bid");
            then.status(200);
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        h.worker.begin_job(&ActiveJob {
            id: "j1".to_string(),
            ssh_key: None,
        });
        assert!(h.worker.is_busy());
        assert!(!h.worker.is_idle());

        let result = h.worker.bid(&job("j2"), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BidError::Busy(ref j)) if j == "j1"));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_lost_auction_leaves_worker_untouched() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/miner/job/j1/bid");
            then.status(402);
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let counters = Arc::new(DrainCounters::default());

        h.worker
            .clone()
            .handle_auction(job("j1"), counters.clone(), CancellationToken::new())
            .await;

        assert_eq!(counters.bids_out(), 0);
        assert_eq!(counters.jobs_in_process(), 0);
        assert!(h.worker.is_idle());
        assert!(h.miner.calls.lock().is_empty());
        assert!(!h.home.path().join(".emrys").join("j1").exists());
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_busy_tracks_job_id() {
        let h = harness("http://127.0.0.1:1", FakeRuntime::default()).await;
        assert!(!h.worker.is_busy());
        h.worker.begin_job(&ActiveJob {
            id: "j1".to_string(),
            ssh_key: Some(Bytes::from_static(b"k")),
        });
        assert!(h.worker.is_busy());
        assert_eq!(h.worker.phase(), Phase::Executing);
        h.worker.clear_job();
        assert!(!h.worker.is_busy());
        assert_eq!(h.worker.job_id(), None);
        assert_eq!(h.worker.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_stats_flags_disk_quota() {
        let h = harness("http://127.0.0.1:1", FakeRuntime::default()).await;
        h.worker.begin_job(&ActiveJob {
            id: "j1".to_string(),
            ssh_key: None,
        });
        let token = CancellationToken::new();
        h.worker.register_job_cancel(token.clone());
        h.worker.set_container("c1");
        *h.runtime.usage.lock() = ContainerUsage {
            size_rw: 20_000_000_000,
            size_root_fs: 6_000_000_000,
        };

        let stats = h.worker.stats().await.unwrap();
        assert_eq!(stats.job_id.as_deref(), Some("j1"));
        assert_eq!(stats.docker_disk.unwrap().total(), 26_000_000_000);
        assert!(stats.docker_stats.is_some());
        assert!(h.worker.disk_quota_exceeded());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_stats_idle_worker() {
        let h = harness("http://127.0.0.1:1", FakeRuntime::default()).await;
        let stats = h.worker.stats().await.unwrap();
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("jobID").is_none());
        assert!(json.get("docker_disk").is_none());
        assert_eq!(json["gpu"]["identity"]["tag"], "3090");
    }

    #[tokio::test]
    async fn test_fatal_sample_retires_worker() {
        let h = harness("http://127.0.0.1:1", FakeRuntime::default()).await;
        h.gpu.reading.lock().persistence_mode = false;
        assert!(h.worker.stats().await.is_err());
        assert!(h.worker.is_retired());
        assert!(!h.worker.is_idle());
    }

    #[tokio::test]
    async fn test_telemetry_uploads_with_job_id() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/miner/device_snapshot")
                .query_param("jID", "j1");
            then.status(200);
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        h.worker.begin_job(&ActiveJob {
            id: "j1".to_string(),
            ssh_key: None,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            h.worker
                .clone()
                .run_telemetry(Duration::from_millis(10), cancel.clone()),
        );
        for _ in 0..200 {
            if mock.hits() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(mock.hits() >= 2);
    }
}
