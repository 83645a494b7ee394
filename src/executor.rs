//! Job executor
//!
//! Runs one won job on one device:
//! 1. Stop the cryptominer
//! 2. Create the workspace, write the notebook ssh key
//! 3. Watch for user cancellation
//! 4. Pull the image and fetch the input data in parallel
//! 5. Stage the data and output directories
//! 6. Create and start the sandboxed container, open the notebook tunnel
//! 7. Stream container logs to the coordinator in 4 KiB chunks
//! 8. Close the log stream and upload the output archive
//!
//! Teardown (container, image, dangling images, tunnel, workspace, key)
//! runs whatever the outcome and is not tied to the job's cancellation token.
//! The cryptominer is restarted after teardown.
//!
//! A shutdown while the container runs skips the uploads and goes straight
//! to teardown. A user or disk-quota cancel still closes the log stream and
//! uploads the output, on a token of its own.

use crate::archive::{pack_dir_body, unpack_response};
use crate::client::{is_valid_job_id, since_now, CoordinatorClient, TRANSFER_MAX_RETRIES};
use crate::cryptominer::kill_group;
use crate::docker::{ContainerSpec, LogStream, RegistryAuth};
use crate::state::{create_dir_with_mode, ssh_key_path, write_private_file, KeyRole};
use crate::stats::dir_size_async;
use crate::transport::{RetryPolicy, TransportError};
use crate::worker::{ActiveJob, Worker, WorkerContext};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

/// Last log line of a job canceled by its owner
pub const CANCELED_BY_USER: &str = "JOB CANCELED BY USER.\n";

/// Last log line of a job canceled for using more disk than advertised
pub const CANCELED_DISK_QUOTA: &str = "JOB CANCELED: USER EXCEEDED DISK QUOTA\n";

/// Largest log chunk posted to the coordinator
pub const LOG_CHUNK_SIZE: usize = 4096;

/// Port of the notebook gateway's ssh server
pub const NOTEBOOK_SSH_PORT: u16 = 2222;

/// Registry user; the bearer token is the password
pub const REGISTRY_USER: &str = "miner";

/// How far back the cancel watcher starts looking
const CANCEL_LOOKBACK: Duration = Duration::from_secs(3);

/// Log chunks buffered between the reader and the uploader
const LOG_CHANNEL_DEPTH: usize = 16;

/// Run `job` on `worker`'s device.
pub(crate) async fn execute(
    worker: &Worker,
    job: &ActiveJob,
    cancel: &CancellationToken,
) -> Result<()> {
    // The id becomes a path component below `jobs_root` and `config_dir`
    if !is_valid_job_id(&job.id) {
        bail!("Refusing job with malformed id {:?}", job.id);
    }
    if cancel.is_cancelled() {
        bail!("Job {} canceled before start", job.id);
    }

    worker.miner().stop().await;

    let mut teardown = Teardown::default();
    let result = run(worker, job, cancel, &mut teardown).await;
    teardown.run(worker).await;

    worker.miner().start().await;
    result
}

async fn run(
    worker: &Worker,
    job: &ActiveJob,
    cancel: &CancellationToken,
    teardown: &mut Teardown,
) -> Result<()> {
    let ctx = worker.context();
    let index = worker.index();

    let workspace = ctx.jobs_root.join(&job.id);
    create_dir_with_mode(&workspace, 0o755)?;
    teardown.workspace = Some(workspace.clone());

    let key_path = match &job.ssh_key {
        Some(key) => {
            let path = ssh_key_path(&ctx.config_dir, &job.id, KeyRole::Miner);
            teardown.ssh_key = Some(path.clone());
            write_private_file(&path, key)?;
            Some(path)
        }
        None => None,
    };

    // Fired by the user cancel long-poll or by the disk quota check
    let job_canceled = CancellationToken::new();
    worker.register_job_cancel(job_canceled.clone());
    let finished = cancel.child_token();
    let _finished = finished.clone().drop_guard();
    tokio::spawn(watch_cancel(
        ctx.client.clone(),
        job.id.clone(),
        finished,
        job_canceled.clone(),
    ));

    let image = ctx.client.endpoints().job_image(&job.id);
    teardown.image = Some(image.clone());
    tokio::try_join!(
        fetch_image(ctx, &job.id, &image, cancel),
        fetch_data(ctx, &job.id, &workspace, cancel),
    )?;

    let data_dir = stage_data_dir(&workspace)?;
    let output_dir = workspace.join("output");
    create_dir_with_mode(&output_dir, 0o777)?;
    worker.set_dirs(&data_dir, &output_dir);

    let data_size = dir_size_async(Some(data_dir.clone())).await;
    let spec = container_spec(worker, job, &image, &data_dir, &output_dir, data_size);
    debug!("[gpu {}] Container spec: {:?}", index, spec);
    let container_id = ctx.runtime.create_container(&spec).await?;
    teardown.container_id = Some(container_id.clone());
    worker.set_container(&container_id);
    ctx.runtime.start_container(&container_id).await?;
    info!("[gpu {}] Job {} running in {}", index, job.id, container_id);

    if let Some(key) = &key_path {
        let mut command = forwarder_command(
            &ctx.ssh_program,
            key,
            &job.id,
            worker.config().notebook_port,
            &ctx.client.endpoints().notebook,
        );
        let child = command
            .spawn()
            .with_context(|| format!("Failed to start notebook tunnel for job {}", job.id))?;
        teardown.forwarder = Some(child);
        info!(
            "[gpu {}] Notebook tunnel open on port {}",
            index,
            worker.config().notebook_port
        );
    }

    let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_DEPTH);
    let _producer = AbortOnDropHandle::new(tokio::spawn(produce_logs(
        ctx.runtime.logs(&container_id),
        tx,
        index,
    )));

    let canceled = loop {
        tokio::select! {
            biased;
            _ = job_canceled.cancelled() => break true,
            _ = cancel.cancelled() => {
                info!("[gpu {}] Job {} interrupted by shutdown", index, job.id);
                return Err(TransportError::Canceled.into());
            }
            chunk = rx.recv() => match chunk {
                Some(chunk) => ctx
                    .client
                    .upload_log(cancel, &job.id, chunk)
                    .await
                    .with_context(|| format!("Failed to upload log for job {}", job.id))?,
                None => break false,
            },
        }
    };

    // A canceled job is closed out even if shutdown starts meanwhile
    let closing = if canceled {
        CancellationToken::new()
    } else {
        cancel.clone()
    };

    if canceled {
        let message = if worker.disk_quota_exceeded() {
            CANCELED_DISK_QUOTA
        } else {
            CANCELED_BY_USER
        };
        info!("[gpu {}] Job {}: {}", index, job.id, message.trim_end());
        ctx.client
            .upload_log(&closing, &job.id, Bytes::from_static(message.as_bytes()))
            .await
            .context("Failed to upload cancellation message")?;
    }

    ctx.client
        .upload_log(&closing, &job.id, Bytes::new())
        .await
        .context("Failed to close log stream")?;

    ctx.client
        .upload_output(&closing, &job.id, canceled, || {
            pack_dir_body(output_dir.clone())
        })
        .await
        .with_context(|| format!("Failed to upload output for job {}", job.id))?;

    info!("[gpu {}] Job {} complete", index, job.id);
    Ok(())
}

/// Resources to release once the job is over
#[derive(Default)]
struct Teardown {
    container_id: Option<String>,
    image: Option<String>,
    forwarder: Option<Child>,
    workspace: Option<PathBuf>,
    ssh_key: Option<PathBuf>,
}

impl Teardown {
    async fn run(&mut self, worker: &Worker) {
        let index = worker.index();
        let runtime = &worker.context().runtime;

        if let Some(mut child) = self.forwarder.take() {
            kill_group(&mut child, index).await;
            debug!("[gpu {}] Notebook tunnel closed", index);
        }
        if let Some(id) = self.container_id.take() {
            if let Err(e) = runtime.remove_container(&id).await {
                warn!("[gpu {}] {:#}", index, e);
            }
        }
        if let Some(image) = self.image.take() {
            if let Err(e) = runtime.remove_image(&image).await {
                debug!("[gpu {}] {:#}", index, e);
            }
            if let Err(e) = runtime.prune_dangling_images().await {
                warn!("[gpu {}] {:#}", index, e);
            }
        }
        if let Some(path) = self.workspace.take() {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("[gpu {}] Failed to remove {}: {}", index, path.display(), e);
            }
        }
        if let Some(path) = self.ssh_key.take() {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Long-poll for a user cancel until the job finishes.
async fn watch_cancel(
    client: CoordinatorClient,
    job_id: String,
    finished: CancellationToken,
    job_canceled: CancellationToken,
) {
    let mut since = since_now(CANCEL_LOOKBACK);
    loop {
        match client.poll_cancel(&finished, &job_id, since).await {
            Ok(response) if !response.events.is_empty() => {
                info!("Job {} canceled by user", job_id);
                job_canceled.cancel();
                return;
            }
            Ok(response) => since = response.next_since(since),
            Err(TransportError::Canceled) => return,
            Err(e) => {
                warn!("Cancel watch for job {} stopped: {}", job_id, e);
                return;
            }
        }
    }
}

async fn fetch_image(
    ctx: &WorkerContext,
    job_id: &str,
    image: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut backoff = RetryPolicy::with_max_retries(TRANSFER_MAX_RETRIES).backoff();
    loop {
        // Re-read the token on every attempt so a refresh is picked up
        let auth = RegistryAuth {
            username: REGISTRY_USER.to_string(),
            password: ctx.client.transport().token().get().to_string(),
            server: ctx.client.endpoints().registry.clone(),
        };
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Canceled.into()),
            attempt = ctx.runtime.pull_image(image, &auth) => attempt,
        };
        match attempt {
            Ok(()) => break,
            Err(e) => {
                warn!("Pull of {} failed: {:#}", image, e);
                backoff
                    .wait(cancel, TransportError::Transient(format!("{:#}", e)))
                    .await
                    .with_context(|| format!("Failed to pull {}", image))?;
            }
        }
    }

    ctx.client
        .ack_image(cancel, job_id)
        .await
        .context("Failed to acknowledge image download")
}

/// Download and unpack the input data. A body that breaks off mid-stream
/// is fetched again from scratch.
async fn fetch_data(
    ctx: &WorkerContext,
    job_id: &str,
    workspace: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut backoff = RetryPolicy::with_max_retries(TRANSFER_MAX_RETRIES).backoff();
    loop {
        let response = ctx
            .client
            .fetch_data(cancel, job_id)
            .await
            .context("Failed to fetch job data")?;
        if response.content_length() == Some(0) {
            debug!("Job {} has no input data", job_id);
            return Ok(());
        }

        let unpacked = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Canceled.into()),
            unpacked = unpack_response(response, workspace.to_path_buf()) => unpacked,
        };
        match unpacked {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Unpacking data for job {} failed: {:#}", job_id, e);
                clear_dir(workspace)?;
                backoff
                    .wait(cancel, TransportError::Transient(format!("{:#}", e)))
                    .await
                    .context("Failed to unpack job data")?;
            }
        }
    }
}

/// Remove everything below `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to clear {}", path.display()))?;
    }
    Ok(())
}

/// Pick the host data directory: the first subdirectory of the workspace,
/// else a new `data` directory. An empty data dir gets an empty `data` file
/// so the bind mount has something to show.
fn stage_data_dir(workspace: &Path) -> Result<PathBuf> {
    let mut subdirs: Vec<PathBuf> = fs::read_dir(workspace)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    subdirs.sort();

    let data_dir = subdirs
        .into_iter()
        .next()
        .unwrap_or_else(|| workspace.join("data"));
    create_dir_with_mode(&data_dir, 0o777)?;

    if fs::read_dir(&data_dir)?.next().is_none() {
        fs::File::create(data_dir.join("data"))
            .with_context(|| format!("Failed to populate {}", data_dir.display()))?;
    }
    Ok(data_dir)
}

fn container_spec(
    worker: &Worker,
    job: &ActiveJob,
    image: &str,
    data_dir: &Path,
    output_dir: &Path,
    data_size: u64,
) -> ContainerSpec {
    let config = worker.config();
    let data_name = data_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");

    ContainerSpec {
        name: format!("emrys-{}", job.id),
        image: image.to_string(),
        env: vec![format!("NVIDIA_VISIBLE_DEVICES={}", config.index)],
        binds: vec![
            format!("{}:/home/user/{}:rw", data_dir.display(), data_name),
            format!("{}:/home/user/output:rw", output_dir.display()),
        ],
        disk_quota: config.disk_bytes.saturating_sub(data_size),
        memory: config.ram_bytes,
        notebook_port: job.is_notebook().then_some(config.notebook_port),
    }
}

/// `ssh -R` reverse tunnel from the notebook gateway to the local port,
/// in its own process group.
pub fn forwarder_command(
    program: &str,
    key: &Path,
    job_id: &str,
    port: u16,
    host: &str,
) -> Command {
    let mut command = Command::new(program);
    command
        .arg("-q")
        .arg("-i")
        .arg(key)
        .arg("-N")
        .arg("-R")
        .arg(format!("/home/{}/notebook.sock:127.0.0.1:{}", job_id, port))
        .arg("-p")
        .arg(NOTEBOOK_SSH_PORT.to_string())
        .arg(format!("{}@{}", job_id, host))
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    command
}

/// Split a log message into pieces of at most [`LOG_CHUNK_SIZE`] bytes.
fn split_chunks(message: Bytes) -> impl Iterator<Item = Bytes> {
    let len = message.len();
    (0..len)
        .step_by(LOG_CHUNK_SIZE)
        .map(move |start| message.slice(start..(start + LOG_CHUNK_SIZE).min(len)))
}

async fn produce_logs(mut logs: LogStream, tx: mpsc::Sender<Bytes>, index: u32) {
    while let Some(item) = logs.next().await {
        match item {
            Ok(message) => {
                for chunk in split_chunks(message) {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("[gpu {}] Log stream ended: {:#}", index, e);
                return;
            }
        }
    }
}
