//! Emrys supplier client
//!
//! Turns the GPUs of a host into Emrys marketplace suppliers: it bids on
//! auctioned jobs, runs won jobs in locked-down containers, streams their
//! logs and output back to the coordinator, and mines in between.
//!
//! ## Module Structure
//!
//! - `transport`: bearer-authenticated HTTP with retry classification
//! - `token`: shared access token and its refresher
//! - `client`: typed coordinator endpoints
//! - `config`: `.emrys` file, size units, per-device broadcast
//! - `state`: on-disk layout, token file, dataset sync metadata
//! - `gpu`: device sensor, invariants, fan control
//! - `cryptominer`: mining process toggled around paying jobs
//! - `docker`: container runtime for job sandboxes
//! - `archive`: tar+gzip streaming
//! - `worker`: per-device bidding, state and stats
//! - `executor`: job pipeline from workspace to output upload
//! - `auction`: long-poll loop and drain counters
//! - `stats`: periodic miner stats
//! - `supervisor`: startup checks and task lifetimes

// ============================================================================
// PLUMBING
// ============================================================================

/// Resilient HTTP transport
pub mod transport;

/// Access token handling
pub mod token;

/// Coordinator API client
pub mod client;

/// Configuration
pub mod config;

/// Persistent client state
pub mod state;

// ============================================================================
// DEVICES
// ============================================================================

/// GPU sensor and fan control
pub mod gpu;

/// Cryptominer toggle
pub mod cryptominer;

// ============================================================================
// JOBS
// ============================================================================

/// Docker runtime
pub mod docker;

/// Tar+gzip transfers
pub mod archive;

/// Per-device worker
pub mod worker;

/// Job executor
pub mod executor;

/// Auction loop
pub mod auction;

/// Miner stats
pub mod stats;

/// Supplier supervisor
pub mod supervisor;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use auction::{run_auction, DrainCounters, CLIENT_VERSION};
pub use client::{Bid, BidSpecs, CoordinatorClient, JobDescriptor, LongpollEvent, LongpollResponse};
pub use config::{ConfigError, DeviceConfig, Endpoints, FileConfig, MinerConfig};
pub use cryptominer::{Cryptominer, MinerToggle};
pub use docker::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use gpu::{DeviceSnapshot, GpuBackend, GpuError, GpuSensor, NvidiaSmi};
pub use state::{SyncMetadata, TokenStore};
pub use token::{TokenError, TokenHandle, TokenManager};
pub use transport::{RetryPolicy, Transport, TransportError};
pub use worker::{BidError, Worker, WorkerContext};
