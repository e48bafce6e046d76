//! ADC hardware abstraction trait.

use async_trait::async_trait;

use crate::error::Result;

/// ADC channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdcChannel(pub u8);

impl std::fmt::Display for AdcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ADC abstraction for reading analog values
///
/// Reads take `&self`; implementations that share a bus between channels
/// are responsible for serializing access internally.
#[async_trait]
pub trait Adc: Send + Sync {
    /// Read raw ADC value from a channel.
    async fn read_raw(&self, channel: AdcChannel) -> Result<u16>;

    /// Read voltage from a channel in millivolts.
    async fn read_millivolts(&self, channel: AdcChannel) -> Result<u32>;
}
