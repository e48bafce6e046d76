//! Bit-banged MCP3008 analog-to-digital converter driver.
//!
//! The crate is layered strictly downward:
//!
//! - [`sampler`]: per-channel timers that turn raw readings into change
//!   events, gated by a tolerance
//! - [`peripheral::mcp3008`]: the bit-exact command/response transaction,
//!   serialized on a bus gate shared by all channels
//! - [`hw_trait::Gpio`]: the pin backend, e.g. [`transport::SysfsGpio`]
//!
//! [`converter::Converter`] ties these together and owns the lifecycle.

pub mod config;
pub mod converter;
pub mod daemon;
pub mod error;
pub mod hw_trait;
pub mod peripheral;
pub mod sampler;
pub mod tracing;
pub mod transport;

pub use config::ConverterConfig;
pub use converter::{Converter, ConverterEvent, ConverterState};
pub use error::{Error, Result};
