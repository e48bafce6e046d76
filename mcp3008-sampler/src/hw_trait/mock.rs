//! Scripted in-memory GPIO backend for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Gpio, HwError, PinDirection, PinValue, Result};

/// One recorded pin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open(u8, PinDirection),
    Write(u8, PinValue),
    Read(u8),
    Close(u8),
}

/// Operation kind, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOpKind {
    Open,
    Write,
    Read,
    Close,
}

#[derive(Default)]
struct State {
    log: Vec<MockOp>,
    reads: VecDeque<PinValue>,
    failures: Vec<(MockOpKind, u8)>,
    stalled: Vec<(MockOpKind, u8)>,
    delays: Vec<(MockOpKind, u8, Duration)>,
}

/// Mock GPIO controller.
///
/// Clones share state, so a test can keep a handle after moving one into
/// the driver. Reads pop from a scripted queue and return `Low` once it is
/// empty. Every operation yields to the scheduler before completing, which
/// gives concurrently running transactions the chance to interleave.
#[derive(Clone, Default)]
pub struct MockGpio {
    state: Arc<Mutex<State>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue levels returned by subsequent reads, in order.
    pub fn script_reads(&self, levels: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state
            .reads
            .extend(levels.iter().map(|&l| PinValue::from(l != 0)));
    }

    /// Make the next `kind` operation on `pin` fail.
    pub fn fail_next(&self, kind: MockOpKind, pin: u8) {
        self.state.lock().unwrap().failures.push((kind, pin));
    }

    /// Make every `kind` operation on `pin` hang forever.
    pub fn stall(&self, kind: MockOpKind, pin: u8) {
        self.state.lock().unwrap().stalled.push((kind, pin));
    }

    /// Let `kind` operations on `pin` started from now on complete again.
    pub fn release(&self, kind: MockOpKind, pin: u8) {
        self.state.lock().unwrap().stalled.retain(|s| *s != (kind, pin));
    }

    /// Make every `kind` operation on `pin` take `delay` to complete.
    pub fn delay(&self, kind: MockOpKind, pin: u8, delay: Duration) {
        self.state.lock().unwrap().delays.push((kind, pin, delay));
    }

    /// Snapshot of every operation recorded so far.
    pub fn log(&self) -> Vec<MockOp> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    async fn record(&self, kind: MockOpKind, pin: u8, op: MockOp) -> Result<()> {
        tokio::task::yield_now().await;

        let (stalled, delay) = {
            let state = self.state.lock().unwrap();
            let delay = state
                .delays
                .iter()
                .find(|(k, p, _)| (*k, *p) == (kind, pin))
                .map(|(_, _, d)| *d);
            (state.stalled.contains(&(kind, pin)), delay)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.failures.iter().position(|f| *f == (kind, pin)) {
            state.failures.remove(idx);
            return Err(HwError::Other(format!("injected {kind:?} failure on pin {pin}")));
        }
        state.log.push(op);
        Ok(())
    }
}

#[async_trait]
impl Gpio for MockGpio {
    async fn open(&self, pin: u8, direction: PinDirection) -> Result<()> {
        self.record(MockOpKind::Open, pin, MockOp::Open(pin, direction))
            .await
    }

    async fn write(&self, pin: u8, value: PinValue) -> Result<()> {
        self.record(MockOpKind::Write, pin, MockOp::Write(pin, value))
            .await
    }

    async fn read(&self, pin: u8) -> Result<PinValue> {
        self.record(MockOpKind::Read, pin, MockOp::Read(pin)).await?;
        let mut state = self.state.lock().unwrap();
        Ok(state.reads.pop_front().unwrap_or(PinValue::Low))
    }

    async fn close(&self, pin: u8) -> Result<()> {
        self.record(MockOpKind::Close, pin, MockOp::Close(pin)).await
    }
}

/// Every pin operation one converter transaction performs on `channel`.
pub fn transaction_ops(pins: &crate::config::PinMap, channel: u8) -> Vec<MockOp> {
    use PinValue::{High, Low};

    let clk = pins.clock.pin;
    let cs = pins.cs.pin;
    let mut ops = vec![
        MockOp::Write(cs, High),
        MockOp::Write(clk, Low),
        MockOp::Write(cs, Low),
    ];
    let command = channel | 0x18;
    for bit in (0..5).rev() {
        ops.push(MockOp::Write(
            pins.mosi.pin,
            PinValue::from(command >> bit & 1 != 0),
        ));
        ops.push(MockOp::Write(clk, High));
        ops.push(MockOp::Write(clk, Low));
    }
    for _ in 0..12 {
        ops.push(MockOp::Write(clk, High));
        ops.push(MockOp::Write(clk, Low));
        ops.push(MockOp::Read(pins.miso.pin));
    }
    ops.push(MockOp::Write(cs, High));
    ops
}
