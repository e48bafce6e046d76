//! Linux sysfs GPIO backend.
//!
//! Drives pins through the legacy `/sys/class/gpio` interface:
//!
//! - open: write the pin number to `export`, then `in`/`out` to
//!   `gpioN/direction`
//! - write: `0`/`1` to `gpioN/value`
//! - read: parse `gpioN/value`
//! - close: write the pin number to `unexport`
//!
//! Every access is a separate file operation on the blocking pool, so this
//! backend is slow (tens of microseconds per edge). That is fine for the
//! MCP3008, which has no minimum clock rate.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::hw_trait::{Gpio, HwError, PinDirection, PinValue, Result};
use crate::tracing::prelude::*;

/// Default sysfs GPIO root
pub const DEFAULT_ROOT: &str = "/sys/class/gpio";

/// After export, udev may need a moment to fix up permissions on the new
/// pin directory.
const EXPORT_SETTLE_ATTEMPTS: usize = 10;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// GPIO controller backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// Use a different sysfs root, e.g. for a chroot or tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    async fn set_direction(&self, pin: u8, direction: PinDirection) -> io::Result<()> {
        let path = self.pin_dir(pin).join("direction");
        let mut attempt = 0;
        loop {
            match tokio::fs::write(&path, direction.to_string()).await {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt + 1 < EXPORT_SETTLE_ATTEMPTS
                        && matches!(
                            e.kind(),
                            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
                        ) =>
                {
                    attempt += 1;
                    tokio::time::sleep(EXPORT_SETTLE_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gpio for SysfsGpio {
    async fn open(&self, pin: u8, direction: PinDirection) -> Result<()> {
        if tokio::fs::try_exists(self.pin_dir(pin)).await? {
            debug!(pin, "Pin already exported");
        } else {
            tokio::fs::write(self.root.join("export"), pin.to_string()).await?;
        }

        self.set_direction(pin, direction).await?;
        trace!(pin, %direction, "Opened pin");
        Ok(())
    }

    async fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        let level = if bool::from(value) { "1" } else { "0" };
        tokio::fs::write(self.pin_dir(pin).join("value"), level).await?;
        Ok(())
    }

    async fn read(&self, pin: u8) -> Result<PinValue> {
        let raw = tokio::fs::read_to_string(self.pin_dir(pin).join("value")).await?;
        match raw.trim() {
            "0" => Ok(PinValue::Low),
            "1" => Ok(PinValue::High),
            other => Err(HwError::Other(format!(
                "unexpected value {other:?} read from pin {pin}"
            ))),
        }
    }

    async fn close(&self, pin: u8) -> Result<()> {
        tokio::fs::write(self.root.join("unexport"), pin.to_string()).await?;
        trace!(pin, "Closed pin");
        Ok(())
    }
}
