//! Cryptominer toggle
//!
//! Runs a user-supplied mining command between paying jobs. A single task
//! owns the child process and reacts to `start`/`stop` commands:
//!
//! ```text
//!   Stopped --start--> Running --stop--> Killing --exited--> Stopped
//! ```
//!
//! The command runs through `sh -c` in its own process group, so a stop
//! signals the whole group and also reaches any sub-miners the shell forked.
//! An empty command keeps the state machine but never spawns anything.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the device index to the mining command
pub const DEVICE_ENV: &str = "EMRYS_GPU_INDEX";

/// Suspend/resume around paying jobs
#[async_trait]
pub trait MinerToggle: Send + Sync {
    /// Stop mining; returns once the process group is gone.
    async fn stop(&self);

    /// Resume mining.
    async fn start(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Stopped,
    Running,
    Killing,
}

enum MinerCommand {
    Start,
    Stop(oneshot::Sender<()>),
}

/// Handle to a supervised mining process
#[derive(Clone)]
pub struct Cryptominer {
    tx: mpsc::Sender<MinerCommand>,
    state: Arc<Mutex<MinerState>>,
}

impl Cryptominer {
    /// Spawn the supervising task. Mining starts immediately.
    pub fn spawn(
        command: String,
        device_index: u32,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(Mutex::new(MinerState::Stopped));
        let handle = tokio::spawn(supervise(
            command,
            device_index,
            rx,
            state.clone(),
            cancel,
        ));
        (Self { tx, state }, handle)
    }

    pub fn state(&self) -> MinerState {
        *self.state.lock()
    }
}

#[async_trait]
impl MinerToggle for Cryptominer {
    async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(MinerCommand::Stop(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    async fn start(&self) {
        let _ = self.tx.send(MinerCommand::Start).await;
    }
}

fn set_state(state: &Mutex<MinerState>, next: MinerState) {
    *state.lock() = next;
}

async fn supervise(
    command: String,
    device_index: u32,
    mut rx: mpsc::Receiver<MinerCommand>,
    state: Arc<Mutex<MinerState>>,
    cancel: CancellationToken,
) {
    let command = command.trim().to_string();
    if command.is_empty() {
        debug!("[gpu {}] No mining command configured", device_index);
    }

    loop {
        // Running phase
        let mut child = if command.is_empty() {
            None
        } else {
            match launch(&command, device_index) {
                Ok(child) => {
                    info!("[gpu {}] Cryptominer started", device_index);
                    Some(child)
                }
                Err(e) => {
                    error!("[gpu {}] Failed to start cryptominer: {}", device_index, e);
                    None
                }
            }
        };
        set_state(&state, MinerState::Running);

        let ack = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(child) = child.as_mut() {
                        kill_group(child, device_index).await;
                    }
                    set_state(&state, MinerState::Stopped);
                    return;
                }
                status = wait_child(&mut child) => {
                    warn!("[gpu {}] Cryptominer exited on its own: {}", device_index, status);
                    child = None;
                }
                cmd = rx.recv() => match cmd {
                    Some(MinerCommand::Stop(ack)) => break Some(ack),
                    Some(MinerCommand::Start) => {}
                    None => break None,
                },
            }
        };

        set_state(&state, MinerState::Killing);
        if let Some(child) = child.as_mut() {
            kill_group(child, device_index).await;
            info!("[gpu {}] Cryptominer stopped", device_index);
        }
        set_state(&state, MinerState::Stopped);

        let Some(ack) = ack else {
            return;
        };
        let _ = ack.send(());

        // Stopped phase: wait for start, acking redundant stops
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                cmd = rx.recv() => match cmd {
                    Some(MinerCommand::Start) => break,
                    Some(MinerCommand::Stop(ack)) => { let _ = ack.send(()); }
                    None => return,
                },
            }
        }
    }
}

fn launch(command: &str, device_index: u32) -> std::io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(DEVICE_ENV, device_index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
}

/// Waits on the child, or forever when there is none.
async fn wait_child(child: &mut Option<Child>) -> String {
    match child.as_mut() {
        Some(c) => match c.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        },
        None => std::future::pending().await,
    }
}

/// SIGHUP then SIGKILL the child's process group and reap the leader.
pub(crate) async fn kill_group(child: &mut Child, device_index: u32) {
    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        for signal in [Signal::SIGHUP, Signal::SIGKILL] {
            if let Err(e) = killpg(pgid, signal) {
                debug!(
                    "[gpu {}] killpg({}, {:?}) failed: {}",
                    device_index, pid, signal, e
                );
            }
        }
    }
    let _ = child.wait().await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Records every toggle for ordering assertions
    #[derive(Default)]
    pub(crate) struct RecordingToggle {
        pub calls: Mutex<Vec<&'static str>>,
        /// Shared with other fakes as `miner stop` / `miner start`
        pub sequence: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingToggle {
        fn record(&self, call: &'static str) {
            self.sequence.lock().push(format!("miner {}", call));
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl MinerToggle for RecordingToggle {
        async fn stop(&self) {
            self.record("stop");
        }

        async fn start(&self) {
            self.record("start");
        }
    }

    async fn wait_for(miner: &Cryptominer, want: MinerState) {
        for _ in 0..200 {
            if miner.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("miner never reached {:?}, stuck in {:?}", want, miner.state());
    }

    #[tokio::test]
    async fn test_empty_command_is_noop_but_accepts_signals() {
        let cancel = CancellationToken::new();
        let (miner, handle) = Cryptominer::spawn(String::new(), 0, cancel.clone());
        wait_for(&miner, MinerState::Running).await;

        miner.stop().await;
        assert_eq!(miner.state(), MinerState::Stopped);
        miner.stop().await;
        miner.start().await;
        wait_for(&miner, MinerState::Running).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        // The shell forks a background child; both must die on stop
        let command = format!(
            "sleep 30 & while true; do echo $EMRYS_GPU_INDEX > {}; sleep 0.05; done",
            marker.display()
        );

        let cancel = CancellationToken::new();
        let (miner, handle) = Cryptominer::spawn(command, 3, cancel.clone());

        for _ in 0..200 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "3");

        miner.stop().await;
        assert_eq!(miner.state(), MinerState::Stopped);

        std::fs::remove_file(&marker).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists(), "mining loop survived stop");

        miner.start().await;
        for _ in 0..200 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(marker.exists(), "mining did not resume");

        cancel.cancel();
        handle.await.unwrap();
    }
}
