//! [`GpuBackend`] on top of the `nvidia-smi` and `nvidia-settings` tools

use super::{Clocks, ComputeMode, DeviceIdentity, DeviceReading, GpuBackend, GpuError};
use super::{POWER_WINDOW, UTILIZATION_WINDOW};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const IDENTITY_FIELDS: &str = "uuid,name,pci.bus_id,power.default_limit,clocks.max.graphics,\
clocks.max.sm,clocks.max.memory,pcie.link.gen.max,pcie.link.width.max";

const READING_FIELDS: &str = "persistence_mode,compute_mode,power.limit,pstate,memory.used,\
clocks.gr,clocks.sm,clocks.mem,pcie.link.gen.current,pcie.link.width.current,temperature.gpu,\
fan.speed";

const AVERAGED_FIELDS: &str = "utilization.gpu,power.draw";

/// Bytes per MiB, the unit nvidia-smi reports memory in
const MIB: u64 = 1024 * 1024;

/// Devices driven through the NVIDIA command line tools
#[derive(Debug, Default, Clone)]
pub struct NvidiaSmi;

impl NvidiaSmi {
    pub fn new() -> Self {
        Self
    }

    async fn smi(&self, args: &[&str]) -> Result<String, GpuError> {
        run("nvidia-smi", args).await
    }

    async fn query(&self, index: u32, fields: &str) -> Result<Vec<String>, GpuError> {
        let idx = index.to_string();
        let query = format!("--query-gpu={}", fields);
        let out = self
            .smi(&["-i", &idx, &query, "--format=csv,noheader,nounits"])
            .await?;
        let line = out
            .lines()
            .next()
            .ok_or_else(|| GpuError::Query(format!("empty output for GPU {}", index)))?;
        Ok(split_csv(line))
    }

    async fn averaged(&self, index: u32) -> Result<(u32, u32), GpuError> {
        let window = POWER_WINDOW.max(UTILIZATION_WINDOW);
        let step = UTILIZATION_WINDOW;
        let samples = (window.as_millis() / step.as_millis()) as u32 + 1;

        let mut util_sum = 0u64;
        let mut power_sum = 0u64;
        for i in 0..samples {
            if i > 0 {
                tokio::time::sleep(step).await;
            }
            let row = self.query(index, AVERAGED_FIELDS).await?;
            util_sum += parse_u32(field(&row, 0)?) as u64;
            power_sum += parse_watts_as_mw(field(&row, 1)?) as u64;
        }
        Ok((
            (util_sum / samples as u64) as u32,
            (power_sum / samples as u64) as u32,
        ))
    }

    async fn pcie_throughput(&self, index: u32) -> Result<(u32, u32), GpuError> {
        let idx = index.to_string();
        let out = self.smi(&["dmon", "-i", &idx, "-s", "t", "-c", "1"]).await?;
        parse_dmon_throughput(&out)
            .ok_or_else(|| GpuError::Query(format!("unparseable dmon output: {:?}", out)))
    }
}

#[async_trait]
impl GpuBackend for NvidiaSmi {
    async fn device_indices(&self) -> Result<Vec<u32>, GpuError> {
        let out = self
            .smi(&["--query-gpu=index", "--format=csv,noheader,nounits"])
            .await?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                l.trim()
                    .parse()
                    .map_err(|_| GpuError::Query(format!("bad device index {:?}", l)))
            })
            .collect()
    }

    async fn identity(&self, index: u32) -> Result<DeviceIdentity, GpuError> {
        let row = self.query(index, IDENTITY_FIELDS).await?;
        let name = field(&row, 1)?.to_string();
        let bus_id = field(&row, 2)?;
        Ok(DeviceIdentity {
            index,
            uuid: field(&row, 0)?.to_string(),
            minor_number: read_minor_number(bus_id).await,
            brand: brand_from_name(&name).to_string(),
            name,
            tag: String::new(),
            default_power_limit: parse_watts_as_mw(field(&row, 3)?),
            max_clocks: Clocks {
                graphics: parse_u32(field(&row, 4)?),
                sm: parse_u32(field(&row, 5)?),
                memory: parse_u32(field(&row, 6)?),
            },
            max_pcie_generation: parse_u32(field(&row, 7)?),
            max_pcie_width: parse_u32(field(&row, 8)?),
        })
    }

    async fn enable_persistence_mode(&self, index: u32) -> Result<(), GpuError> {
        let idx = index.to_string();
        self.smi(&["-i", &idx, "-pm", "1"]).await.map(|_| ())
    }

    async fn set_compute_mode(&self, index: u32, mode: ComputeMode) -> Result<(), GpuError> {
        let idx = index.to_string();
        let mode = match mode {
            ComputeMode::Default => "DEFAULT",
            ComputeMode::ExclusiveThread => {
                return Err(GpuError::Unsupported(
                    "exclusive-thread compute mode".to_string(),
                ))
            }
            ComputeMode::Prohibited => "PROHIBITED",
            ComputeMode::ExclusiveProcess => "EXCLUSIVE_PROCESS",
        };
        self.smi(&["-i", &idx, "-c", mode]).await.map(|_| ())
    }

    async fn read(&self, index: u32) -> Result<DeviceReading, GpuError> {
        let row = self.query(index, READING_FIELDS).await?;
        let (gpu_utilization, power_usage) = self.averaged(index).await?;
        let (pcie_rx_throughput, pcie_tx_throughput) = match self.pcie_throughput(index).await {
            Ok(t) => t,
            Err(e) => {
                debug!("PCIe throughput unavailable on GPU {}: {}", index, e);
                (0, 0)
            }
        };

        Ok(DeviceReading {
            persistence_mode: field(&row, 0)?.eq_ignore_ascii_case("enabled"),
            compute_mode: parse_compute_mode(field(&row, 1)?)?,
            power_limit: parse_watts_as_mw(field(&row, 2)?),
            performance_state: field(&row, 3)?.to_string(),
            memory_used: parse_u32(field(&row, 4)?) as u64 * MIB,
            gpu_utilization,
            power_usage,
            clocks: Clocks {
                graphics: parse_u32(field(&row, 5)?),
                sm: parse_u32(field(&row, 6)?),
                memory: parse_u32(field(&row, 7)?),
            },
            pcie_tx_throughput,
            pcie_rx_throughput,
            pcie_generation: parse_u32(field(&row, 8)?),
            pcie_width: parse_u32(field(&row, 9)?),
            temperature: parse_u32(field(&row, 10)?),
            fan_speed: parse_u32(field(&row, 11)?),
        })
    }

    async fn enable_fan_control(&self, index: u32) -> Result<bool, GpuError> {
        let attr = format!("[gpu:{}]/GPUFanControlState=1", index);
        match run("nvidia-settings", &["-a", &attr]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Fan control not available on GPU {}: {}", index, e);
                Ok(false)
            }
        }
    }

    async fn set_fan_speed(&self, index: u32, percent: u32) -> Result<(), GpuError> {
        let attr = format!("[fan:{}]/GPUTargetFanSpeed={}", index, percent);
        run("nvidia-settings", &["-a", &attr]).await.map(|_| ())
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String, GpuError> {
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| GpuError::Query(format!("{} timed out", program)))?
    .map_err(|e| GpuError::Query(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(GpuError::Query(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn split_csv(line: &str) -> Vec<String> {
    line.split(',').map(|s| s.trim().to_string()).collect()
}

fn field(row: &[String], i: usize) -> Result<&str, GpuError> {
    row.get(i)
        .map(|s| s.as_str())
        .ok_or_else(|| GpuError::Query(format!("missing column {} in {:?}", i, row)))
}

/// Numeric field; `[N/A]` and `[Not Supported]` read as 0.
fn parse_u32(s: &str) -> u32 {
    s.trim()
        .parse::<f64>()
        .map(|v| v.round() as u32)
        .unwrap_or(0)
}

fn parse_watts_as_mw(s: &str) -> u32 {
    s.trim()
        .parse::<f64>()
        .map(|w| (w * 1000.0).round() as u32)
        .unwrap_or(0)
}

fn parse_compute_mode(s: &str) -> Result<ComputeMode, GpuError> {
    match s.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
        "default" => Ok(ComputeMode::Default),
        "exclusive_thread" => Ok(ComputeMode::ExclusiveThread),
        "prohibited" => Ok(ComputeMode::Prohibited),
        "exclusive_process" => Ok(ComputeMode::ExclusiveProcess),
        other => Err(GpuError::Query(format!("unknown compute mode {:?}", other))),
    }
}

fn brand_from_name(name: &str) -> &'static str {
    ["GeForce", "TITAN", "Quadro", "Tesla", "RTX"]
        .into_iter()
        .find(|b| name.contains(b))
        .unwrap_or("NVIDIA")
}

/// `(rx, tx)` in KB/s from `nvidia-smi dmon -s t` (which reports MB/s).
fn parse_dmon_throughput(out: &str) -> Option<(u32, u32)> {
    let line = out
        .lines()
        .find(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())?;
    let cols: Vec<&str> = line.split_whitespace().collect();
    let rx = cols.get(1)?.parse::<u32>().ok()?;
    let tx = cols.get(2)?.parse::<u32>().ok()?;
    Some((rx * 1000, tx * 1000))
}

/// Minor number from the driver's procfs entry for the device.
async fn read_minor_number(bus_id: &str) -> Option<u32> {
    // nvidia-smi prints an 8-digit domain, procfs uses 4
    let short = bus_id.get(bus_id.len().saturating_sub(12)..)?.to_ascii_lowercase();
    let path = format!("/proc/driver/nvidia/gpus/0000:{}/information", short);
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    parse_minor_number(&contents)
}

fn parse_minor_number(information: &str) -> Option<u32> {
    information
        .lines()
        .find(|l| l.trim_start().starts_with("Device Minor"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_and_numbers() {
        let row = split_csv("Enabled, Exclusive_Process, 350.00, P8, 5, [N/A]");
        assert_eq!(row.len(), 6);
        assert_eq!(parse_watts_as_mw(&row[2]), 350_000);
        assert_eq!(parse_u32(&row[4]), 5);
        assert_eq!(parse_u32(&row[5]), 0);
        assert!(field(&row, 6).is_err());
    }

    #[test]
    fn test_parse_compute_mode() {
        assert_eq!(
            parse_compute_mode("Exclusive_Process").unwrap(),
            ComputeMode::ExclusiveProcess
        );
        assert_eq!(parse_compute_mode("Default").unwrap(), ComputeMode::Default);
        assert_eq!(
            parse_compute_mode("Exclusive Thread").unwrap(),
            ComputeMode::ExclusiveThread
        );
        assert!(parse_compute_mode("Weird").is_err());
    }

    #[test]
    fn test_parse_dmon_throughput() {
        let out = "# gpu  rxpci  txpci\n# Idx   MB/s   MB/s\n    0     12      3\n";
        assert_eq!(parse_dmon_throughput(out), Some((12_000, 3_000)));
        assert_eq!(parse_dmon_throughput("# only headers\n"), None);
    }

    #[test]
    fn test_parse_minor_number() {
        let info = "Model: \t\t NVIDIA GeForce RTX 3090\nIRQ:   \t\t 130\nDevice Minor: \t 2\n";
        assert_eq!(parse_minor_number(info), Some(2));
        assert_eq!(parse_minor_number("nothing"), None);
    }

    #[test]
    fn test_brand_from_name() {
        assert_eq!(brand_from_name("NVIDIA GeForce RTX 3090"), "GeForce");
        assert_eq!(brand_from_name("Tesla V100-SXM2-16GB"), "Tesla");
        assert_eq!(brand_from_name("NVIDIA A100-SXM4-40GB"), "NVIDIA");
    }
}
