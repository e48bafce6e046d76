//! Periodic per-channel sampling with change notification.
//!
//! Each configured channel gets its own [`ChannelSampler`] task with an
//! independent timer. On every tick the sampler takes one reading through
//! the [`Adc`] and emits a [`ConverterEvent::Change`] only when the reading
//! moved by strictly more than the tolerance away from the value it last
//! reported. There is no smoothing or rate limiting beyond that.
//!
//! A failed reading is forwarded as [`ConverterEvent::SampleFailed`]; it
//! does not stop this channel's timer or any other channel's.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::converter::ConverterEvent;
use crate::hw_trait::{Adc, AdcChannel};
use crate::tracing::prelude::*;

/// A reading reported as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub channel: AdcChannel,
    pub value: u16,
}

/// Last reported value of one channel.
///
/// Starts out with nothing reported, so the first reading always counts as
/// a change whatever the tolerance.
#[derive(Debug, Clone)]
pub struct ChannelState {
    channel: AdcChannel,
    last_reported: Option<u16>,
}

impl ChannelState {
    pub fn new(channel: AdcChannel) -> Self {
        Self {
            channel,
            last_reported: None,
        }
    }

    pub fn channel(&self) -> AdcChannel {
        self.channel
    }

    pub fn last_reported(&self) -> Option<u16> {
        self.last_reported
    }

    /// Feed a fresh reading. Returns the sample to report, and records it as
    /// the new reference, if it lies outside the tolerance band.
    pub fn observe(&mut self, value: u16, tolerance: u16) -> Option<Sample> {
        let changed = match self.last_reported {
            None => true,
            Some(last) => last.abs_diff(value) > tolerance,
        };

        if !changed {
            return None;
        }

        self.last_reported = Some(value);
        Some(Sample {
            channel: self.channel,
            value,
        })
    }
}

/// Sampling loop for a single channel.
pub struct ChannelSampler<A: Adc> {
    adc: Arc<A>,
    state: ChannelState,
    tolerance: u16,
    interval: Duration,
    events: mpsc::Sender<ConverterEvent>,
    shutdown: CancellationToken,
}

impl<A: Adc> ChannelSampler<A> {
    pub fn new(
        adc: Arc<A>,
        channel: AdcChannel,
        tolerance: u16,
        interval: Duration,
        events: mpsc::Sender<ConverterEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adc,
            state: ChannelState::new(channel),
            tolerance,
            interval,
            events,
            shutdown,
        }
    }

    /// Run until `shutdown` is cancelled or the event receiver goes away.
    ///
    /// The first reading is taken one interval after the call. A reading
    /// already in progress when shutdown arrives is allowed to finish, so
    /// the bus is never abandoned mid-transaction.
    pub async fn run(mut self) {
        let channel = self.state.channel();
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(channel = channel.0, interval = ?self.interval, "Sampler started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let event = match self.adc.read_raw(channel).await {
                Ok(value) => self.state.observe(value, self.tolerance).map(|sample| {
                    debug!(channel = channel.0, value, "Value changed");
                    ConverterEvent::Change(sample)
                }),
                Err(e) => {
                    warn!(channel = channel.0, error = %e, "Sample failed");
                    Some(ConverterEvent::SampleFailed {
                        channel,
                        error: e.to_string(),
                    })
                }
            };

            let Some(event) = event else {
                continue;
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        debug!(channel = channel.0, "Event receiver dropped, stopping sampler");
                        break;
                    }
                }
            }
        }

        debug!(channel = channel.0, "Sampler stopped");
    }
}
