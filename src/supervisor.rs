//! Supplier supervisor
//!
//! Startup checks, worker construction and the lifetime of every background
//! task of `emrys mine`:
//!
//! ```text
//!   root? -> token valid? -> devices resolved -> RAM/disk preflight
//!     -> token refresher, per-worker fan + telemetry, stats uploader, auction
//!     -> SIGINT: stop bidding, drain outstanding bids and jobs
//!     -> second SIGINT: cancel running jobs
//!     -> wait (bounded) for job teardown, stop cryptominers
//! ```

use crate::auction::{run_auction, DrainCounters};
use crate::client::CoordinatorClient;
use crate::config::{DeviceConfig, MinerConfig};
use crate::cryptominer::Cryptominer;
use crate::docker::{ContainerRuntime, DockerRuntime};
use crate::gpu::fan::{run_fan_control, FAN_INTERVAL};
use crate::gpu::{GpuBackend, GpuSensor, NvidiaSmi};
use crate::state::{config_dir, jobs_root, TokenStore};
use crate::stats::{available_memory, root_disk, run_stats_uploader};
use crate::token::{validate, TokenError, TokenHandle, TokenManager};
use crate::transport::Transport;
use crate::worker::{Worker, WorkerContext, TELEMETRY_INTERVAL};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use nix::unistd::Uid;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// How long cryptominers get to die at shutdown
const MINER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// How long canceled jobs get to remove their containers and workspaces
const JOB_TEARDOWN_GRACE: Duration = Duration::from_secs(60);

/// Refuse to start without root.
pub fn require_root() -> Result<()> {
    if !Uid::effective().is_root() {
        bail!("The miner must run as root, try again with sudo");
    }
    Ok(())
}

/// Check that the advertised RAM and disk actually exist on the host.
pub fn preflight(devices: &[DeviceConfig], free_memory: u64, free_disk: u64) -> Result<()> {
    let ram: u64 = devices.iter().map(|d| d.ram_bytes).sum();
    let disk: u64 = devices.iter().map(|d| d.disk_bytes).sum();
    if ram > free_memory {
        bail!(
            "Requested {} bytes of RAM but only {} bytes are available",
            ram,
            free_memory
        );
    }
    if disk > free_disk {
        bail!(
            "Requested {} bytes of disk but only {} bytes are free on /",
            disk,
            free_disk
        );
    }
    Ok(())
}

/// Load the saved token and make sure it outlives the refresh buffer.
pub fn load_token(store: &TokenStore) -> Result<String> {
    let token = store.load().map_err(|e| match e {
        TokenError::Missing => anyhow!("Not logged in, run `emrys login` first"),
        other => anyhow!(other),
    })?;
    validate(&token, Utc::now()).map_err(|e| match e {
        TokenError::Expired(_) => anyhow!("Session expired, run `emrys login` again"),
        other => anyhow!(other),
    })?;
    Ok(token)
}

/// Acquire each configured device and build its worker.
///
/// A device that cannot be acquired or is not accepted is skipped. Each
/// worker gets a cryptominer task, returned alongside the workers.
pub async fn init_workers(
    devices: &[DeviceConfig],
    backend: Arc<dyn GpuBackend>,
    ctx: Arc<WorkerContext>,
    shutdown: &CancellationToken,
) -> (Vec<Arc<Worker>>, Vec<JoinHandle<()>>) {
    let mut workers = Vec::new();
    let mut miners = Vec::new();

    for device in devices {
        let sensor = match GpuSensor::init(backend.clone(), device.index).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("[gpu {}] Device unavailable: {}", device.index, e);
                continue;
            }
        };
        info!(
            "[gpu {}] {} ({}), bidding ${}/hr",
            device.index,
            sensor.identity().name,
            sensor.identity().uuid,
            device.bid_rate
        );

        let (miner, handle) = Cryptominer::spawn(
            device.mining_command.clone(),
            device.index,
            shutdown.clone(),
        );
        miners.push(handle);
        workers.push(Arc::new(Worker::new(
            device.clone(),
            sensor,
            Arc::new(miner),
            ctx.clone(),
        )));
    }

    (workers, miners)
}

/// Run `emrys mine` until interrupted.
pub async fn run(config: MinerConfig, store: TokenStore) -> Result<()> {
    require_root()?;
    let token = load_token(&store)?;
    let handle = TokenHandle::new(token);
    let client = CoordinatorClient::new(Transport::new(handle.clone()), config.endpoints.clone());

    let backend: Arc<dyn GpuBackend> = Arc::new(NvidiaSmi::new());
    let detected = backend
        .device_indices()
        .await
        .context("Failed to list GPUs")?;
    let devices = config.resolve(&detected)?;
    preflight(&devices, available_memory(), root_disk().available)?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
    let ctx = Arc::new(WorkerContext {
        client: client.clone(),
        runtime,
        jobs_root: jobs_root()?,
        config_dir: config_dir()?,
        ssh_program: "ssh".to_string(),
    });

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let shutdown = CancellationToken::new();
    let drain = shutdown.child_token();

    let (workers, miners) = init_workers(&devices, backend, ctx, &shutdown).await;
    if workers.is_empty() {
        shutdown.cancel();
        bail!("No usable GPU");
    }

    tokio::spawn(TokenManager::new(client.clone(), store).run(shutdown.clone(), shutdown.clone()));
    for worker in &workers {
        tokio::spawn(run_worker_fans(
            worker.clone(),
            FAN_INTERVAL,
            shutdown.clone(),
        ));
        tokio::spawn(
            worker
                .clone()
                .run_telemetry(TELEMETRY_INTERVAL, shutdown.clone()),
        );
    }
    tokio::spawn(run_stats_uploader(
        client.clone(),
        workers.clone(),
        shutdown.clone(),
    ));

    let counters = Arc::new(DrainCounters::default());
    let jobs = TaskTracker::new();
    let mut auction = tokio::spawn(run_auction(
        client,
        workers,
        counters.clone(),
        jobs.clone(),
        drain.clone(),
        shutdown.clone(),
    ));

    let mut result = Ok(());
    tokio::select! {
        _ = sigint.recv() => info!("Interrupted, no longer accepting jobs"),
        _ = shutdown.cancelled() => result = Err(anyhow!("Shutting down after a fatal error")),
        joined = &mut auction => {
            result = joined.context("Auction task panicked").and_then(|r| r);
            if let Err(e) = &result {
                error!("Auction loop stopped: {:#}", e);
            }
        }
    }
    drain.cancel();

    drain_outstanding(&counters, &shutdown, async {
        sigint.recv().await;
    })
    .await;

    shutdown.cancel();
    auction.abort();
    // Canceled jobs still upload their output, so the token stays until here
    wait_for_teardown(&jobs, JOB_TEARDOWN_GRACE).await;
    handle.clear();

    let _ = tokio::time::timeout(MINER_EXIT_GRACE, futures::future::join_all(miners)).await;
    info!("Miner stopped");
    result
}

/// Run fan control for `worker`, retiring it only on a fatal device error.
async fn run_worker_fans(worker: Arc<Worker>, interval: Duration, cancel: CancellationToken) {
    match run_fan_control(worker.sensor().clone(), interval, cancel).await {
        Ok(_) => {}
        Err(e) if e.is_fatal() => worker.retire(&e),
        Err(e) => warn!(
            "[gpu {}] Fan control stopped, fans left as they are: {}",
            worker.index(),
            e
        ),
    }
}

/// Wait for bids and jobs to finish. `interrupt` resolving (a second
/// SIGINT) stops waiting.
async fn drain_outstanding<F>(counters: &DrainCounters, shutdown: &CancellationToken, interrupt: F)
where
    F: Future<Output = ()>,
{
    if counters.outstanding() == 0 || shutdown.is_cancelled() {
        return;
    }
    warn!(
        "Waiting for {} bids and {} jobs to finish. Interrupt again to force exit; \
         abandoning a won job is penalised",
        counters.bids_out(),
        counters.jobs_in_process()
    );

    // Polled across iterations so an interrupt is never dropped
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            biased;
            _ = counters.drained() => {
                info!("All jobs finished");
                return;
            }
            _ = &mut interrupt => {
                warn!("Forced exit, canceling {} jobs", counters.jobs_in_process());
                return;
            }
            _ = shutdown.cancelled() => return,
            _ = counters.changed() => info!(
                "Still waiting on {} bids and {} jobs",
                counters.bids_out(),
                counters.jobs_in_process()
            ),
        }
    }
}

/// Close `jobs` and wait up to `grace` for every task to finish its
/// teardown. Returns false when the grace ran out first.
async fn wait_for_teardown(jobs: &TaskTracker, grace: Duration) -> bool {
    jobs.close();
    if jobs.is_empty() {
        return true;
    }
    info!("Waiting for {} job tasks to tear down", jobs.len());
    match tokio::time::timeout(grace, jobs.wait()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                "{} job tasks still tearing down after {:?}, exiting anyway",
                jobs.len(),
                grace
            );
            false
        }
    }
}
