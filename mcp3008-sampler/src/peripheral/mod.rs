//! Drivers for chips attached to the host's GPIO lines.

pub mod mcp3008;

pub use mcp3008::Mcp3008;
