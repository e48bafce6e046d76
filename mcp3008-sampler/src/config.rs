//! Converter configuration.
//!
//! Defaults follow the common Raspberry Pi breakout wiring for the MCP3008
//! and can be overridden from environment variables.
//!
//! # Environment Variables
//!
//! - `MCP3008_PIN_CLOCK`, `MCP3008_PIN_MOSI`, `MCP3008_PIN_MISO`,
//!   `MCP3008_PIN_CS`: physical pin numbers (default 18, 24, 23, 25)
//! - `MCP3008_CHANNELS`: comma-separated channel list (default `0`)
//! - `MCP3008_TOLERANCE`: minimum change reported (default 2)
//! - `MCP3008_INTERVAL_MS`: sampling interval (default 300)
//! - `MCP3008_PIN_TIMEOUT_MS`: per pin operation timeout (default 1000)
//! - `MCP3008_VREF_MV`: reference voltage for millivolt readings (default 3300)

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hw_trait::{AdcChannel, PinDirection};
use crate::tracing::prelude::*;

/// Highest channel index on the chip.
pub const MAX_CHANNEL: u8 = 7;

pub const DEFAULT_CLOCK_PIN: u8 = 18;
pub const DEFAULT_MISO_PIN: u8 = 23;
pub const DEFAULT_MOSI_PIN: u8 = 24;
pub const DEFAULT_CS_PIN: u8 = 25;
pub const DEFAULT_TOLERANCE: u16 = 2;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_VREF_MV: u32 = 3300;

/// Logical role of a bus line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PinRole {
    #[strum(serialize = "clock")]
    Clock,
    #[strum(serialize = "mosi")]
    DataOut,
    #[strum(serialize = "miso")]
    DataIn,
    #[strum(serialize = "chip-select")]
    ChipSelect,
}

impl PinRole {
    /// Direction is fixed per role: only data-in is read by the host.
    pub fn direction(self) -> PinDirection {
        match self {
            PinRole::DataIn => PinDirection::In,
            PinRole::Clock | PinRole::DataOut | PinRole::ChipSelect => PinDirection::Out,
        }
    }
}

/// A bus line bound to a physical pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub role: PinRole,
    pub pin: u8,
    pub direction: PinDirection,
}

impl PinAssignment {
    pub fn new(role: PinRole, pin: u8) -> Self {
        Self {
            role,
            pin,
            direction: role.direction(),
        }
    }
}

/// The four pins owned by one converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub clock: PinAssignment,
    pub mosi: PinAssignment,
    pub miso: PinAssignment,
    pub cs: PinAssignment,
}

impl PinMap {
    pub fn new(clock: u8, mosi: u8, miso: u8, cs: u8) -> Self {
        Self {
            clock: PinAssignment::new(PinRole::Clock, clock),
            mosi: PinAssignment::new(PinRole::DataOut, mosi),
            miso: PinAssignment::new(PinRole::DataIn, miso),
            cs: PinAssignment::new(PinRole::ChipSelect, cs),
        }
    }

    pub fn all(&self) -> [PinAssignment; 4] {
        [self.clock, self.mosi, self.miso, self.cs]
    }
}

impl Default for PinMap {
    fn default() -> Self {
        Self::new(DEFAULT_CLOCK_PIN, DEFAULT_MOSI_PIN, DEFAULT_MISO_PIN, DEFAULT_CS_PIN)
    }
}

/// Converter configuration, read-only once the converter is built.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Bus wiring.
    pub pins: PinMap,

    /// Channels sampled periodically, each with its own timer.
    pub channels: Vec<AdcChannel>,

    /// A new sample is reported only when it differs from the last reported
    /// value by strictly more than this.
    pub tolerance: u16,

    /// Period of every channel's sampling timer.
    pub interval: Duration,

    /// Upper bound on any single pin operation. Exceeding it fails the
    /// operation instead of stalling the bus forever.
    pub pin_timeout: Duration,

    /// Reference voltage, used for millivolt readings only.
    pub vref_mv: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            pins: PinMap::default(),
            channels: vec![AdcChannel(0)],
            tolerance: DEFAULT_TOLERANCE,
            interval: DEFAULT_INTERVAL,
            pin_timeout: DEFAULT_PIN_TIMEOUT,
            vref_mv: DEFAULT_VREF_MV,
        }
    }
}

impl ConverterConfig {
    /// Build a configuration from the defaults overlaid with environment
    /// variables. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let pins = &mut config.pins;

        if let Some(pin) = env_parse("MCP3008_PIN_CLOCK") {
            pins.clock = PinAssignment::new(PinRole::Clock, pin);
        }
        if let Some(pin) = env_parse("MCP3008_PIN_MOSI") {
            pins.mosi = PinAssignment::new(PinRole::DataOut, pin);
        }
        if let Some(pin) = env_parse("MCP3008_PIN_MISO") {
            pins.miso = PinAssignment::new(PinRole::DataIn, pin);
        }
        if let Some(pin) = env_parse("MCP3008_PIN_CS") {
            pins.cs = PinAssignment::new(PinRole::ChipSelect, pin);
        }

        if let Ok(list) = std::env::var("MCP3008_CHANNELS") {
            match parse_channels(&list) {
                Ok(channels) => config.channels = channels,
                Err(e) => warn!(value = %list, error = %e, "Invalid MCP3008_CHANNELS, using default"),
            }
        }

        if let Some(tolerance) = env_parse("MCP3008_TOLERANCE") {
            config.tolerance = tolerance;
        }
        if let Some(ms) = env_parse("MCP3008_INTERVAL_MS") {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("MCP3008_PIN_TIMEOUT_MS") {
            config.pin_timeout = Duration::from_millis(ms);
        }
        if let Some(mv) = env_parse("MCP3008_VREF_MV") {
            config.vref_mv = mv;
        }

        config
    }

    /// Check the configuration for values the converter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::Config("no channels configured".into()));
        }

        let mut seen = HashSet::new();
        for &channel in &self.channels {
            if channel.0 > MAX_CHANNEL {
                return Err(Error::InvalidChannel(channel.0));
            }
            if !seen.insert(channel) {
                return Err(Error::Config(format!("channel {channel} listed twice")));
            }
        }

        if self.interval.is_zero() {
            return Err(Error::Config("sampling interval must be non-zero".into()));
        }
        if self.pin_timeout.is_zero() {
            return Err(Error::Config("pin timeout must be non-zero".into()));
        }

        let mut pins = HashSet::new();
        for assignment in self.pins.all() {
            if !pins.insert(assignment.pin) {
                return Err(Error::Config(format!(
                    "pin {} assigned to more than one role ({})",
                    assignment.pin, assignment.role
                )));
            }
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    match val.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %val, "Unparseable value, using default");
            None
        }
    }
}

/// Parse a comma-separated list of channel indices, e.g. `"0, 3,7"`.
pub fn parse_channels(list: &str) -> Result<Vec<AdcChannel>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u8>()
                .map(AdcChannel)
                .map_err(|_| Error::Config(format!("bad channel index {s:?}")))
        })
        .collect()
}
