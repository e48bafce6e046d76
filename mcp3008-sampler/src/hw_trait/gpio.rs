//! GPIO hardware abstraction trait.
//!
//! Pins are addressed by their physical number. Every operation completes
//! asynchronously and reports failure through [`HwError`](super::HwError);
//! a backend must never fail silently.

use async_trait::async_trait;
use super::Result;

/// GPIO pin value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinValue {
    Low,
    High,
}

impl From<bool> for PinValue {
    fn from(value: bool) -> Self {
        if value { PinValue::High } else { PinValue::Low }
    }
}

impl From<PinValue> for bool {
    fn from(value: PinValue) -> Self {
        matches!(value, PinValue::High)
    }
}

/// GPIO pin direction, fixed when the pin is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PinDirection {
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "out")]
    Out,
}

/// GPIO controller abstraction
///
/// Methods take `&self` so that independent pins can be opened and closed
/// concurrently. Callers that need ordering across pins (the converter's
/// transactions) serialize on their own.
#[async_trait]
pub trait Gpio: Send + Sync {
    /// Claim a pin and configure its direction.
    async fn open(&self, pin: u8, direction: PinDirection) -> Result<()>;

    /// Drive an output pin to a level.
    async fn write(&self, pin: u8, value: PinValue) -> Result<()>;

    /// Read the current level of a pin.
    async fn read(&self, pin: u8) -> Result<PinValue>;

    /// Release a pin.
    async fn close(&self, pin: u8) -> Result<()>;
}
