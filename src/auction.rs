//! Auction loop
//!
//! Long-polls `/miner/connect` for auction events and fans each job out to
//! every idle worker, which bids (and executes on a win) in its own task.
//! Transient failures retry forever; a permanent error ends the loop.

use crate::client::{since_now, CoordinatorClient};
use crate::transport::TransportError;
use crate::worker::Worker;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Version of this client
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How far back the first long-poll looks for auctions
pub const CONNECT_LOOKBACK: Duration = Duration::from_secs(3);

// ============================================================================
// DRAIN COUNTERS
// ============================================================================

/// Outstanding bids and jobs, watched by the supervisor during a drain
#[derive(Debug, Default)]
pub struct DrainCounters {
    bids_out: AtomicUsize,
    jobs_in_process: AtomicUsize,
    changed: Notify,
}

/// Decrements its counter when dropped
pub struct InFlight<'a> {
    counter: &'a AtomicUsize,
    changed: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

impl DrainCounters {
    pub fn track_bid(&self) -> InFlight<'_> {
        self.track(&self.bids_out)
    }

    pub fn track_job(&self) -> InFlight<'_> {
        self.track(&self.jobs_in_process)
    }

    fn track<'a>(&'a self, counter: &'a AtomicUsize) -> InFlight<'a> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        InFlight {
            counter,
            changed: &self.changed,
        }
    }

    pub fn bids_out(&self) -> usize {
        self.bids_out.load(Ordering::SeqCst)
    }

    pub fn jobs_in_process(&self) -> usize {
        self.jobs_in_process.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.bids_out() + self.jobs_in_process()
    }

    /// Resolves once no bid or job is outstanding.
    pub async fn drained(&self) {
        loop {
            let changed = self.changed.notified();
            if self.outstanding() == 0 {
                return;
            }
            changed.await;
        }
    }

    /// Resolves on the next change to either counter.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

// ============================================================================
// VERSION CHECK
// ============================================================================

/// `major.minor.patch`, with an optional `v` prefix and pre-release suffix.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.trim().trim_start_matches('v');
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    Some((major, minor, patch))
}

/// Whether `client` is at least `minimum`.
pub fn is_compatible(client: &str, minimum: &str) -> Result<bool> {
    let have = parse_version(client).with_context(|| format!("Invalid version {}", client))?;
    let need = parse_version(minimum).with_context(|| format!("Invalid version {}", minimum))?;
    Ok(have >= need)
}

/// Fail unless the coordinator still accepts this client.
pub async fn check_version(client: &CoordinatorClient, cancel: &CancellationToken) -> Result<()> {
    let info = client
        .miner_version(cancel)
        .await
        .context("Failed to check client version")?;
    if !is_compatible(CLIENT_VERSION, &info.version)? {
        bail!(
            "Client version {} is no longer supported (minimum {}), please update",
            CLIENT_VERSION,
            info.version
        );
    }
    debug!("Client {} compatible with minimum {}", CLIENT_VERSION, info.version);
    Ok(())
}

// ============================================================================
// LOOP
// ============================================================================

/// Run auctions until `drain` fires or a permanent error occurs.
///
/// Bids and jobs run under `shutdown`, so a drain lets them finish. They are
/// spawned on `jobs` so the caller can wait for their teardown.
pub async fn run_auction(
    client: CoordinatorClient,
    workers: Vec<Arc<Worker>>,
    counters: Arc<DrainCounters>,
    jobs: TaskTracker,
    drain: CancellationToken,
    shutdown: CancellationToken,
) -> Result<()> {
    check_version(&client, &drain).await?;

    let mut since = since_now(CONNECT_LOOKBACK);
    info!("Waiting for jobs on {} devices", workers.len());
    loop {
        let response = match client.connect(&drain, since).await {
            Ok(r) => r,
            Err(TransportError::Canceled) => return Ok(()),
            Err(e) => return Err(e).context("Auction long-poll failed"),
        };

        for event in &response.events {
            let Some(job) = event.job() else {
                debug!("Dropping auction event without a usable job: {:?}", event);
                continue;
            };
            info!("Auction for job {}", job.id);
            for worker in workers.iter().filter(|w| w.is_idle()) {
                jobs.spawn(worker.clone().handle_auction(
                    job.clone(),
                    counters.clone(),
                    shutdown.clone(),
                ));
            }
        }
        since = response.next_since(since);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::tests::FakeRuntime;
    use crate::worker::tests::harness;
    use httpmock::prelude::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("v0.10.0"), Some((0, 10, 0)));
        assert_eq!(parse_version("2.1"), Some((2, 1, 0)));
        assert_eq!(parse_version("1.0.0-rc.1"), Some((1, 0, 0)));
        assert_eq!(parse_version("latest"), None);
    }

    #[test]
    fn test_is_compatible() {
        assert!(is_compatible("0.1.0", "0.1.0").unwrap());
        assert!(is_compatible("0.10.0", "0.9.5").unwrap());
        assert!(!is_compatible("0.1.0", "0.2.0").unwrap());
        assert!(!is_compatible("1.2.3", "v1.3").unwrap());
        assert!(is_compatible("0.1.0", "garbage").is_err());
    }

    #[tokio::test]
    async fn test_drain_counters() {
        let counters = Arc::new(DrainCounters::default());
        let bid = counters.track_bid();
        let job = counters.track_job();
        assert_eq!(counters.outstanding(), 2);

        let waiter = {
            let counters = counters.clone();
            tokio::spawn(async move { counters.drained().await })
        };
        drop(bid);
        assert_eq!(counters.bids_out(), 0);
        assert!(!waiter.is_finished());
        drop(job);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_incompatible_version_stops_loop() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/miner/version");
            then.status(200).json_body(serde_json::json!({ "version": "99.0.0" }));
        });
        let connect = server.mock(|when, then| {
            when.method(GET).path("/miner/connect");
            then.status(200).json_body(serde_json::json!({ "events": [] }));
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;

        let result = run_auction(
            h.worker.context().client.clone(),
            vec![h.worker.clone()],
            Arc::new(DrainCounters::default()),
            TaskTracker::new(),
            CancellationToken::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("no longer supported"));
        connect.assert_hits(0);
    }

    #[tokio::test]
    async fn test_permanent_error_ends_loop() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/miner/version");
            then.status(200).json_body(serde_json::json!({ "version": "0.0.1" }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/miner/connect");
            then.status(401).body("token revoked");
        });
        let h = harness(&server.base_url(), FakeRuntime::default()).await;

        let result = run_auction(
            h.worker.context().client.clone(),
            vec![h.worker.clone()],
            Arc::new(DrainCounters::default()),
            TaskTracker::new(),
            CancellationToken::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(format!("{:#}", result.unwrap_err()).contains("token revoked"));
    }

    #[tokio::test]
    async fn test_lost_bid_round_trip() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/miner/version");
            then.status(200).json_body(serde_json::json!({ "version": "0.0.1" }));
        });
        let connect = server.mock(|when, then| {
            when.method(GET)
                .path("/miner/connect")
                .query_param("timeout", "600")
                .query_param_exists("since_time");
            then.status(200)
                .delay(Duration::from_millis(50))
                .json_body(serde_json::json!({
                    "events": [{ "timestamp": 1700000000000i64, "category": "auction", "data": { "id": "j1" } }],
                    "timestamp": 1700000000000i64
                }));
        });
        let bid = server.mock(|when, then| {
            when.method(POST).path("/miner/job/j1/bid");
            then.status(402);
        });

        let h = harness(&server.base_url(), FakeRuntime::default()).await;
        let counters = Arc::new(DrainCounters::default());
        let drain = CancellationToken::new();
        let jobs = TaskTracker::new();
        let auction = tokio::spawn(run_auction(
            h.worker.context().client.clone(),
            vec![h.worker.clone()],
            counters.clone(),
            jobs.clone(),
            drain.clone(),
            CancellationToken::new(),
        ));

        for _ in 0..300 {
            if bid.hits() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drain.cancel();
        auction.await.unwrap().unwrap();
        jobs.close();
        tokio::time::timeout(Duration::from_secs(2), jobs.wait())
            .await
            .unwrap();
        assert!(jobs.is_empty());
        tokio::time::timeout(Duration::from_secs(2), counters.drained())
            .await
            .unwrap();

        assert!(connect.hits() >= 1);
        assert!(bid.hits() >= 1);
        assert_eq!(counters.bids_out(), 0);
        assert!(h.worker.is_idle());
        assert!(h.miner.calls.lock().is_empty());
        assert!(!h.home.path().join(".emrys").join("j1").exists());
    }
}
