//! Adaptive fan control
//!
//! Curve (temperature C -> fan %):
//! - `T > 75`        -> 85
//! - `65 < T <= 75`  -> fan + 5, clamped to [25, 85]
//! - `40 < T <= 65`  -> fan - 5, clamped to [25, 85]
//! - `T <= 40`       -> 25

use super::{GpuError, GpuSensor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MIN_FAN: u32 = 25;
pub const MAX_FAN: u32 = 85;

/// Time between fan adjustments
pub const FAN_INTERVAL: Duration = Duration::from_secs(5);

/// Fan speed to apply for the current temperature and speed.
pub fn target_fan_speed(temperature: u32, fan: u32) -> u32 {
    match temperature {
        t if t > 75 => MAX_FAN,
        t if t > 65 => (fan + 5).clamp(MIN_FAN, MAX_FAN),
        t if t > 40 => fan.saturating_sub(5).clamp(MIN_FAN, MAX_FAN),
        _ => MIN_FAN,
    }
}

/// Drive the fans of one device until cancelled.
///
/// Returns `Ok(false)` straight away when the device refuses manual fan
/// control. Invariant violations seen while sampling or setting the fans are
/// returned as errors; anything else is logged and retried on the next tick.
pub async fn run_fan_control(
    sensor: Arc<GpuSensor>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<bool, GpuError> {
    let index = sensor.index();
    let enabled = sensor.backend().enable_fan_control(index).await?;
    if !enabled {
        warn!("[gpu {}] Manual fan control unavailable, leaving fans on auto", index);
        return Ok(false);
    }
    info!("[gpu {}] Manual fan control enabled", index);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(true),
            _ = ticker.tick() => {}
        }

        let snapshot = match sensor.sample().await {
            Ok(s) => s,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("[gpu {}] Fan control skipped a sample: {}", index, e);
                continue;
            }
        };

        let temperature = snapshot.reading.temperature;
        let current = snapshot.reading.fan_speed;
        // No valid reading yet: wait for the next tick
        if temperature == 0 {
            continue;
        }

        let target = target_fan_speed(temperature, current);
        if target != current {
            match sensor.backend().set_fan_speed(index, target).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("[gpu {}] Failed to set fan to {}%: {}", index, target, e);
                    continue;
                }
            }
        }
        info!(
            "[gpu {}] Temperature {}C, fan {}% -> {}%",
            index, temperature, current, target
        );
    }
}
