//! GPU sensing and control
//!
//! A [`GpuSensor`] owns one device for the lifetime of the miner:
//! - On init it enforces persistence mode and exclusive-process compute mode,
//!   captures the immutable identity and refuses models outside the accepted set
//! - Every [`GpuSensor::sample`] re-checks those settings plus the power
//!   limit; any regression is an [`GpuError::Invariant`], fatal for the worker
//!
//! Device access goes through [`GpuBackend`] so the state machine above it
//! can run against a fake device in tests.

pub mod fan;
pub mod nvidia_smi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use nvidia_smi::NvidiaSmi;

/// Minimum averaging window for power usage
pub const POWER_WINDOW: Duration = Duration::from_secs(1);

/// Minimum averaging window for utilisation
pub const UTILIZATION_WINDOW: Duration = Duration::from_millis(150);

/// Vendor UUID prefix stripped before reporting to the coordinator
const UUID_PREFIX: &str = "gpu-";

/// Accepted models: (substring of the vendor name, tag sent with bids).
/// Longer names first so "3080 Ti" is not matched as "3080".
const ACCEPTED_GPUS: &[(&str, &str)] = &[
    ("GTX 1070 Ti", "1070ti"),
    ("GTX 1070", "1070"),
    ("GTX 1080 Ti", "1080ti"),
    ("GTX 1080", "1080"),
    ("RTX 2070 SUPER", "2070super"),
    ("RTX 2070", "2070"),
    ("RTX 2080 SUPER", "2080super"),
    ("RTX 2080 Ti", "2080ti"),
    ("RTX 2080", "2080"),
    ("TITAN RTX", "titanrtx"),
    ("RTX 3060 Ti", "3060ti"),
    ("RTX 3060", "3060"),
    ("RTX 3070 Ti", "3070ti"),
    ("RTX 3070", "3070"),
    ("RTX 3080 Ti", "3080ti"),
    ("RTX 3080", "3080"),
    ("RTX 3090 Ti", "3090ti"),
    ("RTX 3090", "3090"),
    ("RTX 4080", "4080"),
    ("RTX 4090", "4090"),
    ("Tesla V100", "v100"),
    ("A100", "a100"),
];

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU query failed: {0}")]
    Query(String),
    #[error("GPU {0:?} is not an accepted model")]
    NotAccepted(String),
    #[error("GPU invariant violated: {0}")]
    Invariant(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl GpuError {
    /// Errors that retire the worker for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::Invariant(_) | GpuError::NotAccepted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    Default,
    ExclusiveThread,
    Prohibited,
    ExclusiveProcess,
}

/// Clock triple in MHz
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clocks {
    pub graphics: u32,
    pub sm: u32,
    pub memory: u32,
}

/// Immutable identity captured once at init
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub index: u32,
    /// Vendor UUID with the `gpu-` prefix stripped
    pub uuid: String,
    pub minor_number: Option<u32>,
    pub name: String,
    pub brand: String,
    /// Accepted model tag, empty until validated
    #[serde(default)]
    pub tag: String,
    /// Milliwatts
    pub default_power_limit: u32,
    pub max_clocks: Clocks,
    pub max_pcie_generation: u32,
    pub max_pcie_width: u32,
}

/// Dynamic part of a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub persistence_mode: bool,
    pub compute_mode: ComputeMode,
    /// Milliwatts
    pub power_limit: u32,
    pub performance_state: String,
    pub memory_used: u64,
    /// Percent, averaged over at least [`UTILIZATION_WINDOW`]
    pub gpu_utilization: u32,
    /// Milliwatts, averaged over at least [`POWER_WINDOW`]
    pub power_usage: u32,
    pub clocks: Clocks,
    /// KB/s
    pub pcie_tx_throughput: u32,
    /// KB/s
    pub pcie_rx_throughput: u32,
    pub pcie_generation: u32,
    pub pcie_width: u32,
    /// Degrees C
    pub temperature: u32,
    /// Percent
    pub fan_speed: u32,
}

/// Point-in-time device telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    #[serde(flatten)]
    pub reading: DeviceReading,
    /// ms since the epoch
    pub timestamp: i64,
}

/// Access to the GPU management library
#[async_trait]
pub trait GpuBackend: Send + Sync {
    /// Indices of every device on the host
    async fn device_indices(&self) -> Result<Vec<u32>, GpuError>;

    async fn identity(&self, index: u32) -> Result<DeviceIdentity, GpuError>;

    async fn enable_persistence_mode(&self, index: u32) -> Result<(), GpuError>;

    async fn set_compute_mode(&self, index: u32, mode: ComputeMode) -> Result<(), GpuError>;

    /// Read the dynamic fields; averages cover at least the given windows.
    async fn read(&self, index: u32) -> Result<DeviceReading, GpuError>;

    /// Take manual control of the fans. `Ok(false)` when unsupported.
    async fn enable_fan_control(&self, index: u32) -> Result<bool, GpuError>;

    async fn set_fan_speed(&self, index: u32, percent: u32) -> Result<(), GpuError>;
}

/// Tag for an accepted vendor name.
pub fn accepted_tag(name: &str) -> Option<&'static str> {
    ACCEPTED_GPUS
        .iter()
        .find(|(needle, _)| name.contains(needle))
        .map(|(_, tag)| *tag)
}

/// Strip the vendor `gpu-` prefix (case-insensitive).
pub fn strip_uuid_prefix(uuid: &str) -> String {
    if uuid.len() >= UUID_PREFIX.len() && uuid[..UUID_PREFIX.len()].eq_ignore_ascii_case(UUID_PREFIX)
    {
        uuid[UUID_PREFIX.len()..].to_string()
    } else {
        uuid.to_string()
    }
}

/// One supervised GPU
pub struct GpuSensor {
    backend: Arc<dyn GpuBackend>,
    identity: DeviceIdentity,
}

impl GpuSensor {
    /// Acquire and lock down device `index`.
    pub async fn init(backend: Arc<dyn GpuBackend>, index: u32) -> Result<Self, GpuError> {
        backend.enable_persistence_mode(index).await?;
        backend
            .set_compute_mode(index, ComputeMode::ExclusiveProcess)
            .await?;

        let mut identity = backend.identity(index).await?;
        identity.uuid = strip_uuid_prefix(&identity.uuid);
        identity.tag = accepted_tag(&identity.name)
            .ok_or_else(|| GpuError::NotAccepted(identity.name.clone()))?
            .to_string();

        let sensor = Self { backend, identity };

        // Settings must have taken effect before we advertise the device
        let reading = sensor.backend.read(index).await?;
        sensor.check_invariants(&reading)?;
        Ok(sensor)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn index(&self) -> u32 {
        self.identity.index
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Fresh snapshot; fails with [`GpuError::Invariant`] on any regression.
    pub async fn sample(&self) -> Result<DeviceSnapshot, GpuError> {
        let reading = self.backend.read(self.identity.index).await?;
        self.check_invariants(&reading)?;
        Ok(DeviceSnapshot {
            identity: self.identity.clone(),
            reading,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn check_invariants(&self, reading: &DeviceReading) -> Result<(), GpuError> {
        if !reading.persistence_mode {
            return Err(GpuError::Invariant(format!(
                "persistence mode disabled on GPU {}",
                self.identity.index
            )));
        }
        if reading.compute_mode != ComputeMode::ExclusiveProcess {
            return Err(GpuError::Invariant(format!(
                "compute mode changed to {:?} on GPU {}",
                reading.compute_mode, self.identity.index
            )));
        }
        if reading.power_limit != self.identity.default_power_limit {
            return Err(GpuError::Invariant(format!(
                "power limit {} mW differs from default {} mW on GPU {}",
                reading.power_limit, self.identity.default_power_limit, self.identity.index
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    pub(crate) fn identity_fixture(index: u32) -> DeviceIdentity {
        DeviceIdentity {
            index,
            uuid: format!("GPU-0000000{}-1111-2222-3333-444455556666", index),
            minor_number: Some(index),
            name: "NVIDIA GeForce RTX 3090".to_string(),
            brand: "GeForce".to_string(),
            tag: String::new(),
            default_power_limit: 350_000,
            max_clocks: Clocks {
                graphics: 2100,
                sm: 2100,
                memory: 9751,
            },
            max_pcie_generation: 4,
            max_pcie_width: 16,
        }
    }

    pub(crate) fn reading_fixture() -> DeviceReading {
        DeviceReading {
            persistence_mode: true,
            compute_mode: ComputeMode::ExclusiveProcess,
            power_limit: 350_000,
            performance_state: "P8".to_string(),
            memory_used: 1_048_576,
            gpu_utilization: 3,
            power_usage: 21_337,
            clocks: Clocks {
                graphics: 210,
                sm: 210,
                memory: 405,
            },
            pcie_tx_throughput: 120,
            pcie_rx_throughput: 80,
            pcie_generation: 1,
            pcie_width: 16,
            temperature: 41,
            fan_speed: 30,
        }
    }

    pub(crate) fn snapshot_fixture() -> DeviceSnapshot {
        let mut identity = identity_fixture(0);
        identity.uuid = strip_uuid_prefix(&identity.uuid);
        identity.tag = "3090".to_string();
        DeviceSnapshot {
            identity,
            reading: reading_fixture(),
            timestamp: 1_700_000_000_123,
        }
    }

    /// In-memory device. Readings can be edited to simulate regressions.
    pub(crate) struct FakeGpu {
        pub identities: Vec<DeviceIdentity>,
        pub reading: Mutex<DeviceReading>,
        pub fan_supported: bool,
        pub fan_log: Mutex<Vec<u32>>,
        /// `set_fan_speed` calls left to fail with a query error
        pub fan_failures: Mutex<u32>,
        pub persistence_calls: Mutex<u32>,
    }

    impl FakeGpu {
        pub(crate) fn new(count: u32) -> Self {
            Self {
                identities: (0..count).map(identity_fixture).collect(),
                reading: Mutex::new(reading_fixture()),
                fan_supported: true,
                fan_log: Mutex::new(Vec::new()),
                fan_failures: Mutex::new(0),
                persistence_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl GpuBackend for FakeGpu {
        async fn device_indices(&self) -> Result<Vec<u32>, GpuError> {
            Ok(self.identities.iter().map(|i| i.index).collect())
        }

        async fn identity(&self, index: u32) -> Result<DeviceIdentity, GpuError> {
            self.identities
                .iter()
                .find(|i| i.index == index)
                .cloned()
                .ok_or_else(|| GpuError::Query(format!("no device {}", index)))
        }

        async fn enable_persistence_mode(&self, _index: u32) -> Result<(), GpuError> {
            *self.persistence_calls.lock() += 1;
            Ok(())
        }

        async fn set_compute_mode(&self, _index: u32, _mode: ComputeMode) -> Result<(), GpuError> {
            Ok(())
        }

        async fn read(&self, _index: u32) -> Result<DeviceReading, GpuError> {
            Ok(self.reading.lock().clone())
        }

        async fn enable_fan_control(&self, _index: u32) -> Result<bool, GpuError> {
            Ok(self.fan_supported)
        }

        async fn set_fan_speed(&self, _index: u32, percent: u32) -> Result<(), GpuError> {
            {
                let mut failures = self.fan_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(GpuError::Query(
                        "nvidia-settings: cannot open display".to_string(),
                    ));
                }
            }
            self.fan_log.lock().push(percent);
            self.reading.lock().fan_speed = percent;
            Ok(())
        }
    }

    #[test]
    fn test_accepted_tags() {
        assert_eq!(accepted_tag("NVIDIA GeForce RTX 3090"), Some("3090"));
        assert_eq!(accepted_tag("NVIDIA GeForce RTX 3080 Ti"), Some("3080ti"));
        assert_eq!(accepted_tag("GeForce GTX 1080 Ti"), Some("1080ti"));
        assert_eq!(accepted_tag("NVIDIA A100-SXM4-40GB"), Some("a100"));
        assert_eq!(accepted_tag("NVIDIA GeForce GT 710"), None);
    }

    #[test]
    fn test_strip_uuid_prefix() {
        assert_eq!(strip_uuid_prefix("GPU-abc-123"), "abc-123");
        assert_eq!(strip_uuid_prefix("gpu-abc"), "abc");
        assert_eq!(strip_uuid_prefix("abc"), "abc");
    }

    #[tokio::test]
    async fn test_init_enforces_modes_and_identity() {
        let fake = Arc::new(FakeGpu::new(2));
        let sensor = GpuSensor::init(fake.clone(), 1).await.unwrap();
        assert_eq!(*fake.persistence_calls.lock(), 1);
        assert_eq!(sensor.identity().tag, "3090");
        assert_eq!(
            sensor.identity().uuid,
            "00000001-1111-2222-3333-444455556666"
        );
    }

    #[tokio::test]
    async fn test_init_refuses_unaccepted_model() {
        let mut fake = FakeGpu::new(1);
        fake.identities[0].name = "NVIDIA GeForce GT 710".to_string();
        let result = GpuSensor::init(Arc::new(fake), 0).await;
        assert!(matches!(result, Err(GpuError::NotAccepted(_))));
    }

    #[tokio::test]
    async fn test_sample_detects_regressions() {
        let fake = Arc::new(FakeGpu::new(1));
        let sensor = GpuSensor::init(fake.clone(), 0).await.unwrap();
        let snapshot = sensor.sample().await.unwrap();
        assert!(snapshot.reading.persistence_mode);
        assert_eq!(snapshot.reading.compute_mode, ComputeMode::ExclusiveProcess);
        assert_eq!(
            snapshot.reading.power_limit,
            snapshot.identity.default_power_limit
        );

        fake.reading.lock().persistence_mode = false;
        let err = sensor.sample().await.unwrap_err();
        assert!(err.is_fatal());

        *fake.reading.lock() = reading_fixture();
        fake.reading.lock().compute_mode = ComputeMode::Default;
        assert!(matches!(sensor.sample().await, Err(GpuError::Invariant(_))));

        *fake.reading.lock() = reading_fixture();
        fake.reading.lock().power_limit = 300_000;
        assert!(matches!(sensor.sample().await, Err(GpuError::Invariant(_))));
    }

    #[test]
    fn test_snapshot_json_roundtrip_preserves_numbers() {
        let snapshot = snapshot_fixture();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: DeviceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert!(json.contains("\"compute_mode\":\"exclusive_process\""));
    }
}
