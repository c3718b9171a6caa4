use anyhow::{anyhow, Result};
use std::time::Duration;

const DEFAULT_PACING_MS: u64 = 20;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_FRAME_BACKLOG: usize = 1;
const DEFAULT_DEVICE_WIDTH: u32 = 640;
const DEFAULT_DEVICE_HEIGHT: u32 = 480;
const DEFAULT_DEVICE_FPS: u32 = 30;
const MAX_PACING: Duration = Duration::from_secs(60);
const MAX_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables for an acquisition run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Minimum interval between two pulls.
    pub pacing: Duration,
    /// How long `stop()` waits for the loop before detaching from it.
    pub stop_timeout: Duration,
    /// Pending frame events the channel holds before dropping the oldest.
    pub frame_backlog: usize,
    pub device: DeviceSettings,
}

/// Capture format requested from hardware devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_DEVICE_WIDTH,
            height: DEFAULT_DEVICE_HEIGHT,
            target_fps: DEFAULT_DEVICE_FPS,
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(DEFAULT_PACING_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            frame_backlog: DEFAULT_FRAME_BACKLOG,
            device: DeviceSettings::default(),
        }
    }
}

impl AcquisitionSettings {
    /// Defaults overridden by `DASHBOARD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_number::<u64>("DASHBOARD_PACING_MS")? {
            self.pacing = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("DASHBOARD_STOP_TIMEOUT_MS")? {
            self.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(backlog) = env_number::<usize>("DASHBOARD_FRAME_BACKLOG")? {
            self.frame_backlog = backlog;
        }
        if let Some(width) = env_number::<u32>("DASHBOARD_DEVICE_WIDTH")? {
            self.device.width = width;
        }
        if let Some(height) = env_number::<u32>("DASHBOARD_DEVICE_HEIGHT")? {
            self.device.height = height;
        }
        if let Some(fps) = env_number::<u32>("DASHBOARD_DEVICE_FPS")? {
            self.device.target_fps = fps;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pacing < Duration::from_millis(1) {
            return Err(anyhow!("pacing interval must be at least 1ms"));
        }
        if self.pacing > MAX_PACING {
            return Err(anyhow!(
                "pacing interval must be at most {}s",
                MAX_PACING.as_secs()
            ));
        }
        if self.stop_timeout.is_zero() {
            return Err(anyhow!("stop timeout must be greater than zero"));
        }
        if self.stop_timeout > MAX_STOP_TIMEOUT {
            return Err(anyhow!(
                "stop timeout must be at most {}s",
                MAX_STOP_TIMEOUT.as_secs()
            ));
        }
        if self.frame_backlog == 0 {
            return Err(anyhow!("frame backlog must hold at least one frame"));
        }
        if self.device.width == 0 || self.device.height == 0 {
            return Err(anyhow!("device capture size must be non-zero"));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AcquisitionSettings::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.pacing, Duration::from_millis(20));
        assert_eq!(cfg.frame_backlog, 1);
    }

    #[test]
    fn rejects_zero_backlog_and_timeout() {
        let cfg = AcquisitionSettings {
            frame_backlog: 0,
            ..AcquisitionSettings::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AcquisitionSettings {
            stop_timeout: Duration::ZERO,
            ..AcquisitionSettings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sub_millisecond_pacing() {
        let cfg = AcquisitionSettings {
            pacing: Duration::from_micros(200),
            ..AcquisitionSettings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unbounded_pacing_and_timeout() {
        let cfg = AcquisitionSettings {
            pacing: Duration::MAX,
            ..AcquisitionSettings::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AcquisitionSettings {
            stop_timeout: Duration::MAX,
            ..AcquisitionSettings::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AcquisitionSettings {
            pacing: MAX_PACING,
            stop_timeout: MAX_STOP_TIMEOUT,
            ..AcquisitionSettings::default()
        };
        cfg.validate().expect("upper bounds are inclusive");
    }
}
