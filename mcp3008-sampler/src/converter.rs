//! Converter lifecycle and event delivery.
//!
//! A [`Converter`] owns the four bus pins, the per-channel samplers and the
//! event channel. Its lifecycle only moves forward:
//!
//! ```text
//! Uninitialized --init--> Opening --all pins open--> Ready --close--> Closed
//!                            |                                          ^
//!                            +--pin open failed--> Failed ----close-----+
//! ```
//!
//! [`ConverterEvent::Ready`] is sent once every pin is open and before any
//! sampler is started, so it always precedes the first
//! [`ConverterEvent::Change`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::ConverterConfig;
use crate::error::{Error, Result};
use crate::hw_trait::{Adc, AdcChannel, Gpio};
use crate::peripheral::Mcp3008;
use crate::sampler::{ChannelSampler, Sample};
use crate::tracing::prelude::*;

/// Capacity of the event channel handed to the owner.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConverterState {
    Uninitialized,
    Opening,
    Ready,
    Failed,
    Closed,
}

/// Events emitted by a converter during operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterEvent {
    /// All pins are open; sampling starts after this.
    Ready,

    /// A channel's reading moved past the tolerance band.
    Change(Sample),

    /// A periodic reading failed. The channel keeps sampling.
    SampleFailed {
        channel: AdcChannel,
        error: String, // String because Error is not Clone
    },
}

/// MCP3008 converter with periodic change-notification sampling.
pub struct Converter<G: Gpio + 'static> {
    config: ConverterConfig,
    adc: Arc<Mcp3008<G>>,
    state: ConverterState,
    /// Dropped on close so the receiver sees the end of the stream
    event_tx: Option<mpsc::Sender<ConverterEvent>>,
    event_rx: Option<mpsc::Receiver<ConverterEvent>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<G: Gpio + 'static> Converter<G> {
    /// Create a converter on `gpio`. Validates the configuration but does
    /// not touch any pin.
    pub fn new(gpio: G, config: ConverterConfig) -> Result<Self> {
        config.validate()?;

        let adc = Mcp3008::new(gpio, config.pins)
            .with_pin_timeout(config.pin_timeout)
            .with_vref_mv(config.vref_mv);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            adc: Arc::new(adc),
            state: ConverterState::Uninitialized,
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn state(&self) -> ConverterState {
        self.state
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Take ownership of the event receiver.
    ///
    /// Returns None if the receiver was already taken.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ConverterEvent>> {
        self.event_rx.take()
    }

    /// Open all pins, announce readiness and start one sampler per channel.
    ///
    /// A pin failure leaves the converter `Failed` with no sampler running;
    /// pins that did open are released by [`close`](Self::close).
    pub async fn init(&mut self) -> Result<()> {
        self.expect_state("init", &[ConverterState::Uninitialized])?;

        self.state = ConverterState::Opening;
        debug!("Opening converter pins");

        if let Err(e) = self.adc.open().await {
            self.state = ConverterState::Failed;
            error!(error = %e, "Converter initialization failed");
            return Err(e);
        }
        self.state = ConverterState::Ready;

        let Some(event_tx) = self.event_tx.clone() else {
            return Err(Error::InvalidState {
                operation: "init",
                state: self.state,
            });
        };

        if event_tx.send(ConverterEvent::Ready).await.is_err() {
            debug!("Event receiver dropped before ready");
        }

        for &channel in &self.config.channels {
            let sampler = ChannelSampler::new(
                self.adc.clone(),
                channel,
                self.config.tolerance,
                self.config.interval,
                event_tx.clone(),
                self.shutdown.clone(),
            );
            self.tracker.spawn(sampler.run());
        }

        let channels: Vec<u8> = self.config.channels.iter().map(|c| c.0).collect();
        info!(
            ?channels,
            tolerance = self.config.tolerance,
            interval = ?self.config.interval,
            "Converter ready"
        );
        Ok(())
    }

    /// Take a single reading outside the periodic schedule.
    ///
    /// Shares the bus gate with the samplers and does not affect change
    /// reporting.
    pub async fn sample(&self, channel: AdcChannel) -> Result<u16> {
        self.expect_state("sample", &[ConverterState::Ready])?;
        self.adc.read_raw(channel).await
    }

    /// Take a single reading and convert it to millivolts.
    pub async fn read_millivolts(&self, channel: AdcChannel) -> Result<u32> {
        self.expect_state("read", &[ConverterState::Ready])?;
        self.adc.read_millivolts(channel).await
    }

    /// Stop all samplers, then release the pins.
    ///
    /// Samplers are stopped first; a transaction already on the bus runs to
    /// completion before the pins are closed. The converter is `Closed`
    /// afterwards even if releasing a pin failed.
    pub async fn close(&mut self) -> Result<()> {
        self.expect_state(
            "close",
            &[
                ConverterState::Uninitialized,
                ConverterState::Opening,
                ConverterState::Ready,
                ConverterState::Failed,
            ],
        )?;

        let previous = self.state;
        self.state = ConverterState::Closed;

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.event_tx = None;

        if previous == ConverterState::Uninitialized {
            debug!("Converter closed before init");
            return Ok(());
        }

        let result = self.adc.close().await;
        info!("Converter closed");
        result
    }

    fn expect_state(&self, operation: &'static str, allowed: &[ConverterState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl<G: Gpio + 'static> Drop for Converter<G> {
    fn drop(&mut self) {
        // Samplers must not outlive their owner
        self.shutdown.cancel();
    }
}
