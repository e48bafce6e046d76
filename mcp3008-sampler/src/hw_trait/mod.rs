//! Hardware abstraction layer traits.
//!
//! This module defines the hardware interface traits (GPIO, ADC) that let the
//! converter driver run against different pin backends, whether Linux sysfs
//! GPIO on a real board or a scripted mock in tests.

pub mod adc;
pub mod gpio;

#[cfg(test)]
pub(crate) mod mock;

// Re-export traits
pub use adc::{Adc, AdcChannel};
pub use gpio::{Gpio, PinDirection, PinValue};

/// Common error type for pin backend operations
#[derive(Debug, thiserror::Error)]
pub enum HwError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for hardware response
    #[error("Hardware timeout")]
    Timeout,

    /// Other hardware-specific error
    #[error("Hardware error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, HwError>;
