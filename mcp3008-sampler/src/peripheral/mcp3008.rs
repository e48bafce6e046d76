//! MCP3008 8-channel 10-bit ADC driver over a bit-banged serial bus.
//!
//! The host drives four GPIO lines by hand: clock, data-out (MOSI), data-in
//! (MISO) and chip-select. One transaction selects the chip, shifts a 5-bit
//! command out MSB first, clocks 12 bits back in and deselects.
//!
//! ```text
//! command:  [start=1] [single-ended=1] [D2] [D1] [D0]
//! response: 12 bits, MSB first; the value is the accumulator >> 1
//! ```
//!
//! The chip is clocked exactly when the host toggles the clock line, so every
//! pin operation is awaited before the next one is issued, and a whole
//! transaction holds the bus gate so that no other transaction can slip its
//! pin operations in between.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::{PinAssignment, PinMap, DEFAULT_PIN_TIMEOUT, DEFAULT_VREF_MV, MAX_CHANNEL};
use crate::error::{Error, PinOp, Result};
use crate::hw_trait::{self, Adc, AdcChannel, Gpio, HwError, PinValue};
use crate::tracing::prelude::*;

/// Start bit plus single-ended mode bit, ORed onto the channel index.
const START_SINGLE_ENDED: u8 = 0b11000;

/// Shift that moves the 5 command bits to the top of a byte.
const COMMAND_ALIGN_SHIFT: u8 = 3;

/// Number of command bits clocked out.
const COMMAND_BITS: usize = 5;

/// Number of clocks spent reading the response. Fixed by the chip's
/// response framing; the first clocked bit is dropped by the final shift.
const RESPONSE_CLOCKS: usize = 12;

/// Full-scale raw reading.
pub const FULL_SCALE: u16 = 1023;

/// Command word for `channel`, aligned so the first bit to send is bit 7.
pub fn command_word(channel: AdcChannel) -> u8 {
    (channel.0 | START_SINGLE_ENDED) << COMMAND_ALIGN_SHIFT
}

/// Convert a raw reading to millivolts against a reference voltage.
pub fn raw_to_millivolts(raw: u16, vref_mv: u32) -> u32 {
    (raw as u32).saturating_mul(vref_mv) / FULL_SCALE as u32
}

/// MCP3008 driver
pub struct Mcp3008<G: Gpio> {
    gpio: G,
    pins: PinMap,
    /// Held for the full duration of a transaction.
    bus: Mutex<()>,
    /// Set when a pin operation timed out and may still complete later.
    stale: AtomicBool,
    pin_timeout: Duration,
    vref_mv: u32,
}

impl<G: Gpio> Mcp3008<G> {
    /// Create a new driver on the given pins. Pins are not touched until
    /// [`open`](Self::open) is called.
    pub fn new(gpio: G, pins: PinMap) -> Self {
        Self {
            gpio,
            pins,
            bus: Mutex::new(()),
            stale: AtomicBool::new(false),
            pin_timeout: DEFAULT_PIN_TIMEOUT,
            vref_mv: DEFAULT_VREF_MV,
        }
    }

    /// Bound every pin operation by `timeout`.
    ///
    /// A timeout abandons the operation but cannot recall it: a backend
    /// that hands the work to another thread (sysfs does) may still apply
    /// it afterwards. The next transaction therefore waits one more
    /// `timeout` before touching the bus, which keeps a late write out of
    /// it as long as the backend eventually completes within that window.
    pub fn with_pin_timeout(mut self, timeout: Duration) -> Self {
        self.pin_timeout = timeout;
        self
    }

    /// Set the reference voltage used by millivolt readings.
    pub fn with_vref_mv(mut self, vref_mv: u32) -> Self {
        self.vref_mv = vref_mv;
        self
    }

    /// Open all four pins concurrently.
    ///
    /// Waits for every open to settle, even after one has failed, so that a
    /// following [`close`](Self::close) never races an export still in
    /// progress. The first failure is returned.
    pub async fn open(&self) -> Result<()> {
        let results = join_all(self.pins.all().into_iter().map(|assignment| {
            self.guarded(
                PinOp::Open,
                assignment,
                self.gpio.open(assignment.pin, assignment.direction),
            )
        }))
        .await;
        first_failure(results, "Failed to open pin")?;

        debug!(
            clock = self.pins.clock.pin,
            mosi = self.pins.mosi.pin,
            miso = self.pins.miso.pin,
            cs = self.pins.cs.pin,
            "Pins opened"
        );
        Ok(())
    }

    /// Close all four pins concurrently.
    ///
    /// Every close is attempted even if some fail; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let results = join_all(self.pins.all().into_iter().map(|assignment| {
            self.guarded(PinOp::Close, assignment, self.gpio.close(assignment.pin))
        }))
        .await;
        first_failure(results, "Failed to close pin")?;

        debug!("Pins closed");
        Ok(())
    }

    /// Perform one full transaction and return the sample for `channel`.
    ///
    /// Waits for any transaction already on the bus to finish first. On
    /// error the transaction is abandoned where it failed and chip-select
    /// may still be asserted.
    pub async fn sample(&self, channel: AdcChannel) -> Result<u16> {
        if channel.0 > MAX_CHANNEL {
            return Err(Error::InvalidChannel(channel.0));
        }

        let _bus = self.bus.lock().await;
        if self.stale.swap(false, Ordering::SeqCst) {
            warn!(
                timeout = ?self.pin_timeout,
                "Previous pin operation timed out, letting the bus settle"
            );
            tokio::time::sleep(self.pin_timeout).await;
        }

        let value = self.transact(channel).await?;
        trace!(channel = channel.0, value, "Sampled");
        Ok(value)
    }

    async fn transact(&self, channel: AdcChannel) -> Result<u16> {
        let pins = self.pins;

        // Clean start edge: deselect, idle clock low, select
        self.write(pins.cs, PinValue::High).await?;
        self.write(pins.clock, PinValue::Low).await?;
        self.write(pins.cs, PinValue::Low).await?;

        let mut command = command_word(channel);
        for _ in 0..COMMAND_BITS {
            self.write(pins.mosi, PinValue::from(command & 0x80 != 0))
                .await?;
            command <<= 1;
            self.pulse_clock().await?;
        }

        let mut response: u16 = 0;
        for _ in 0..RESPONSE_CLOCKS {
            self.pulse_clock().await?;
            response <<= 1;
            if bool::from(self.read(pins.miso).await?) {
                response |= 1;
            }
        }

        self.write(pins.cs, PinValue::High).await?;

        Ok(response >> 1)
    }

    async fn pulse_clock(&self) -> Result<()> {
        self.write(self.pins.clock, PinValue::High).await?;
        self.write(self.pins.clock, PinValue::Low).await
    }

    async fn write(&self, assignment: PinAssignment, value: PinValue) -> Result<()> {
        self.guarded(
            PinOp::Write,
            assignment,
            self.gpio.write(assignment.pin, value),
        )
        .await
    }

    async fn read(&self, assignment: PinAssignment) -> Result<PinValue> {
        self.guarded(PinOp::Read, assignment, self.gpio.read(assignment.pin))
            .await
    }

    // Apply the pin timeout and attach the failing operation to the error.
    async fn guarded<T>(
        &self,
        op: PinOp,
        assignment: PinAssignment,
        fut: impl Future<Output = hw_trait::Result<T>>,
    ) -> Result<T> {
        let source = match tokio::time::timeout(self.pin_timeout, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => {
                self.stale.store(true, Ordering::SeqCst);
                HwError::Timeout
            }
        };

        error!(
            %op,
            pin = assignment.pin,
            role = %assignment.role,
            error = %source,
            "Pin operation failed"
        );
        Err(Error::Pin {
            op,
            pin: assignment.pin,
            source,
        })
    }
}

// Log every failure in a fan-out and return the first one.
fn first_failure(results: Vec<Result<()>>, message: &str) -> Result<()> {
    let mut first_err = None;
    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "{}", message);
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[async_trait]
impl<G: Gpio> Adc for Mcp3008<G> {
    async fn read_raw(&self, channel: AdcChannel) -> Result<u16> {
        self.sample(channel).await
    }

    async fn read_millivolts(&self, channel: AdcChannel) -> Result<u32> {
        let raw = self.sample(channel).await?;
        Ok(raw_to_millivolts(raw, self.vref_mv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_trait::mock::{transaction_ops, MockGpio, MockOp, MockOpKind};
    use crate::hw_trait::PinDirection;
    use std::collections::HashSet;

    fn driver() -> (Mcp3008<MockGpio>, MockGpio, PinMap) {
        let gpio = MockGpio::new();
        let pins = PinMap::default();
        (Mcp3008::new(gpio.clone(), pins), gpio, pins)
    }

    #[test]
    fn test_command_word() {
        assert_eq!(command_word(AdcChannel(0)), 0b1100_0000);
        assert_eq!(command_word(AdcChannel(5)), 0b1110_1000);
        assert_eq!(command_word(AdcChannel(7)), 0b1111_1000);
        for c in 0..=7u8 {
            assert_eq!(command_word(AdcChannel(c)) >> 3, c | 0x18);
        }
    }

    #[tokio::test]
    async fn test_command_bits_on_data_out() {
        for c in 0..=7u8 {
            let (adc, gpio, pins) = driver();
            adc.sample(AdcChannel(c)).await.unwrap();

            let sent: Vec<bool> = gpio
                .log()
                .into_iter()
                .filter_map(|op| match op {
                    MockOp::Write(pin, value) if pin == pins.mosi.pin => Some(value.into()),
                    _ => None,
                })
                .collect();
            let expected: Vec<bool> = (0..5).rev().map(|bit| (c | 0x18) >> bit & 1 != 0).collect();
            assert_eq!(sent, expected, "channel {c}");
        }
    }

    #[tokio::test]
    async fn test_transaction_sequence() {
        let (adc, gpio, pins) = driver();
        let value = adc.sample(AdcChannel(3)).await.unwrap();

        assert_eq!(value, 0);
        assert_eq!(gpio.log(), transaction_ops(&pins, 3));
    }

    #[tokio::test]
    async fn test_receive_framing() {
        let (adc, gpio, _) = driver();
        gpio.script_reads(&[1, 0, 1, 1, 0, 0, 1, 0, 1, 1, 0, 1]);

        // 0b101100101101 = 2861, >> 1
        assert_eq!(adc.sample(AdcChannel(0)).await.unwrap(), 1430);
    }

    #[tokio::test]
    async fn test_millivolts_full_scale() {
        let (adc, gpio, _) = driver();
        let adc = adc.with_vref_mv(3300);
        gpio.script_reads(&[0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);

        assert_eq!(adc.read_millivolts(AdcChannel(0)).await.unwrap(), 3300);
        assert_eq!(raw_to_millivolts(0, 3300), 0);
        assert_eq!(raw_to_millivolts(512, 3300), 1651);
    }

    #[tokio::test]
    async fn test_invalid_channel_touches_no_pins() {
        let (adc, gpio, _) = driver();
        let result = adc.sample(AdcChannel(8)).await;

        assert!(matches!(result, Err(Error::InvalidChannel(8))));
        assert!(gpio.log().is_empty());
    }

    #[tokio::test]
    async fn test_pin_failure_aborts_transaction() {
        let (adc, gpio, pins) = driver();
        gpio.fail_next(MockOpKind::Read, pins.miso.pin);

        let result = adc.sample(AdcChannel(0)).await;
        assert!(matches!(
            result,
            Err(Error::Pin { op: PinOp::Read, pin, .. }) if pin == pins.miso.pin
        ));

        // Nothing after the failed read, chip-select left asserted
        let log = gpio.log();
        assert_eq!(log.last(), Some(&MockOp::Write(pins.clock.pin, PinValue::Low)));
        assert!(!log.iter().any(|op| matches!(op, MockOp::Read(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_pin_times_out() {
        let (adc, gpio, pins) = driver();
        let adc = adc.with_pin_timeout(Duration::from_millis(50));
        gpio.stall(MockOpKind::Write, pins.clock.pin);

        let result = adc.sample(AdcChannel(0)).await;
        assert!(matches!(
            result,
            Err(Error::Pin { op: PinOp::Write, source: HwError::Timeout, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_settles_after_timeout() {
        let timeout = Duration::from_millis(50);
        let (adc, gpio, pins) = driver();
        let adc = adc.with_pin_timeout(timeout);

        gpio.stall(MockOpKind::Write, pins.clock.pin);
        assert!(adc.sample(AdcChannel(0)).await.is_err());
        gpio.release(MockOpKind::Write, pins.clock.pin);
        gpio.clear_log();

        // The transaction after a timeout holds off for one more timeout
        let start = tokio::time::Instant::now();
        adc.sample(AdcChannel(0)).await.unwrap();
        assert!(start.elapsed() >= timeout);
        assert_eq!(gpio.log(), transaction_ops(&pins, 0));

        // ...and only that one
        let start = tokio::time::Instant::now();
        adc.sample(AdcChannel(0)).await.unwrap();
        assert!(start.elapsed() < timeout);
    }

    #[tokio::test]
    async fn test_concurrent_transactions_do_not_interleave() {
        let (adc, gpio, pins) = driver();

        let (a, b) = tokio::join!(adc.sample(AdcChannel(1)), adc.sample(AdcChannel(6)));
        a.unwrap();
        b.unwrap();

        let log = gpio.log();
        let one = transaction_ops(&pins, 1);
        let six = transaction_ops(&pins, 6);
        let one_then_six: Vec<_> = one.iter().chain(six.iter()).copied().collect();
        let six_then_one: Vec<_> = six.iter().chain(one.iter()).copied().collect();
        assert!(log == one_then_six || log == six_then_one);
    }

    #[tokio::test]
    async fn test_open_and_close_all_pins() {
        let (adc, gpio, pins) = driver();
        adc.open().await.unwrap();

        let opened: HashSet<_> = gpio.log().into_iter().collect();
        let expected: HashSet<_> = [
            MockOp::Open(pins.clock.pin, PinDirection::Out),
            MockOp::Open(pins.mosi.pin, PinDirection::Out),
            MockOp::Open(pins.miso.pin, PinDirection::In),
            MockOp::Open(pins.cs.pin, PinDirection::Out),
        ]
        .into_iter()
        .collect();
        assert_eq!(opened, expected);

        gpio.clear_log();
        gpio.fail_next(MockOpKind::Close, pins.mosi.pin);
        let result = adc.close().await;
        assert!(matches!(result, Err(Error::Pin { op: PinOp::Close, .. })));

        // The other three are still released
        let closed: HashSet<_> = gpio.log().into_iter().collect();
        assert_eq!(closed.len(), 3);
        assert!(!closed.contains(&MockOp::Close(pins.mosi.pin)));
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let (adc, gpio, pins) = driver();
        gpio.fail_next(MockOpKind::Open, pins.cs.pin);

        let result = adc.open().await;
        assert!(matches!(
            result,
            Err(Error::Pin { op: PinOp::Open, pin, .. }) if pin == pins.cs.pin
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_waits_for_every_pin_after_failure() {
        let delay = Duration::from_millis(200);
        let (adc, gpio, pins) = driver();
        gpio.delay(MockOpKind::Open, pins.clock.pin, delay);
        gpio.fail_next(MockOpKind::Open, pins.cs.pin);

        let start = tokio::time::Instant::now();
        assert!(adc.open().await.is_err());
        assert!(start.elapsed() >= delay);

        let opened: HashSet<_> = gpio.log().into_iter().collect();
        assert!(opened.contains(&MockOp::Open(pins.clock.pin, PinDirection::Out)));
        assert_eq!(opened.len(), 3);
    }
}
