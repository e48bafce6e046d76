//! Error types surfaced to the owner of a [`Converter`](crate::converter::Converter).

use thiserror::Error;

use crate::converter::ConverterState;
use crate::hw_trait::HwError;

/// Pin operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PinOp {
    Open,
    Write,
    Read,
    Close,
}

#[derive(Error, Debug)]
pub enum Error {
    /// A pin backend operation failed or timed out. Fatal to the operation
    /// in progress; the bus is left in an unknown state.
    #[error("{op} on pin {pin} failed: {source}")]
    Pin {
        op: PinOp,
        pin: u8,
        #[source]
        source: HwError,
    },

    #[error("Invalid channel {0} (must be 0-7)")]
    InvalidChannel(u8),

    #[error("Cannot {operation} while converter is {state}")]
    InvalidState {
        operation: &'static str,
        state: ConverterState,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
