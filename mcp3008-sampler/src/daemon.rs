//! Daemon lifecycle for the sampler.
//!
//! Builds the converter from the environment, forwards its events to the
//! log, and shuts it down cleanly on SIGINT or SIGTERM.

use std::env;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::ConverterConfig;
use crate::converter::{Converter, ConverterEvent};
use crate::tracing::prelude::*;
use crate::transport::{sysfs, SysfsGpio};

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = ConverterConfig::from_env();
        let root = env::var("MCP3008_GPIO_ROOT").unwrap_or_else(|_| sysfs::DEFAULT_ROOT.into());
        let gpio = SysfsGpio::with_root(root);

        info!(
            clock = config.pins.clock.pin,
            mosi = config.pins.mosi.pin,
            miso = config.pins.miso.pin,
            cs = config.pins.cs.pin,
            gpio_root = %gpio.root().display(),
            "Starting converter"
        );

        let mut converter = Converter::new(gpio, config)?;
        let events = converter
            .take_event_receiver()
            .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

        self.tracker.spawn(log_events(events, self.shutdown.clone()));

        if let Err(e) = converter.init().await {
            error!(error = %e, "Failed to initialize converter");
            if let Err(e) = converter.close().await {
                warn!(error = %e, "Failed to release pins");
            }
            self.shutdown.cancel();
            self.tracker.close();
            self.tracker.wait().await;
            return Err(e.into());
        }

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=mcp3008_sampler=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Closing ends the event stream, which lets the logger drain and exit
        let result = converter.close().await;
        self.tracker.wait().await;
        info!("Exiting.");

        result.map_err(Into::into)
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

async fn log_events(mut events: mpsc::Receiver<ConverterEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.cancelled() => break,
        };

        match event {
            Some(ConverterEvent::Ready) => info!("Converter ready"),
            Some(ConverterEvent::Change(sample)) => {
                info!(channel = sample.channel.0, value = sample.value, "change")
            }
            Some(ConverterEvent::SampleFailed { channel, error }) => {
                error!(channel = channel.0, %error, "Sample failed")
            }
            None => break,
        }
    }
}
