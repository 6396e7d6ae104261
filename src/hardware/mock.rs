//! Mock Hardware Implementations
//!
//! Provides a simulated syringe pump and stirrer for testing without
//! physical hardware.
//! All timing uses `tokio::time::sleep` so tests running on a paused clock
//! advance instantly.
//!
//! # Performance Characteristics
//!
//! - Valve: 150ms per switch when real-time pacing is enabled
//! - Plunger: travel time derived from step distance and pulse rate
//!   (one pulse is 0.01mm of plunger travel)

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{StirrerDriver, SyringeDriver};
use crate::pump::{ResolutionMode, PULSE_DISPLACEMENT_MM};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// A command received by [`MockSyringeDriver`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    Valve(u8),
    Move { steps: u32, pulses_per_s: u32 },
    Disconnect,
}

#[derive(Debug, Default)]
struct MockPumpState {
    commands: Vec<DriverCommand>,
    valve: Option<u8>,
    steps: u32,
    connected: bool,
}

/// Simulated syringe pump that records every command.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// pump under test owns another.
///
/// # Example
///
/// ```rust,ignore
/// let driver = MockSyringeDriver::new();
/// let pump = SyringePump::new(Box::new(driver.clone()), 12, 1.0, ResolutionMode::Standard);
/// pump.switch(3).await?;
/// assert_eq!(driver.commands().await, vec![DriverCommand::Valve(3)]);
/// ```
#[derive(Clone)]
pub struct MockSyringeDriver {
    state: Arc<Mutex<MockPumpState>>,
    resolution: ResolutionMode,
    realtime: bool,
    issued: Arc<AtomicUsize>,
    fail_at: Arc<AtomicUsize>,
}

impl MockSyringeDriver {
    /// Create a mock pump with instantaneous motion
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockPumpState {
                connected: true,
                ..Default::default()
            })),
            resolution: ResolutionMode::Standard,
            realtime: false,
            issued: Arc::new(AtomicUsize::new(0)),
            fail_at: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Create a mock pump that sleeps for the physical duration of each motion
    pub fn realtime(resolution: ResolutionMode) -> Self {
        Self {
            resolution,
            realtime: true,
            ..Self::new()
        }
    }

    /// Make the `n`-th motion command (0-based, disconnects excluded) fail
    /// with a communication error.
    pub fn fail_on_command(&self, n: usize) {
        self.fail_at.store(n, Ordering::SeqCst);
    }

    /// All commands received so far
    pub async fn commands(&self) -> Vec<DriverCommand> {
        self.state.lock().await.commands.clone()
    }

    /// Current valve position, if it has ever been set
    pub async fn valve(&self) -> Option<u8> {
        self.state.lock().await.valve
    }

    /// Current plunger position in steps
    pub async fn steps(&self) -> u32 {
        self.state.lock().await.steps
    }

    /// Whether `disconnect` has not been called yet
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    fn check_injected_failure(&self) -> AppResult<()> {
        let index = self.issued.fetch_add(1, Ordering::SeqCst);
        if index == self.fail_at.load(Ordering::SeqCst) {
            return Err(DaqError::comm(format!(
                "mock pump: injected failure on command #{}",
                index
            )));
        }
        Ok(())
    }
}

impl Default for MockSyringeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyringeDriver for MockSyringeDriver {
    fn name(&self) -> &str {
        "mock-pump"
    }

    async fn set_valve(&self, port: u8) -> AppResult<()> {
        self.check_injected_failure()?;
        if self.realtime {
            sleep(Duration::from_millis(150)).await;
        }

        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DaqError::comm("mock pump: not connected"));
        }
        state.commands.push(DriverCommand::Valve(port));
        state.valve = Some(port);
        debug!(port, "MockSyringeDriver: valve switched");
        Ok(())
    }

    async fn move_absolute(&self, steps: u32, pulses_per_s: u32) -> AppResult<()> {
        self.check_injected_failure()?;
        let current = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(DaqError::comm("mock pump: not connected"));
            }
            state.commands.push(DriverCommand::Move {
                steps,
                pulses_per_s,
            });
            state.steps
        };

        if self.realtime && pulses_per_s > 0 {
            let travel_mm = f64::from(current.abs_diff(steps)) * self.resolution.step_mm();
            let secs = travel_mm / (f64::from(pulses_per_s) * PULSE_DISPLACEMENT_MM);
            sleep(Duration::from_secs_f64(secs)).await;
        }

        self.state.lock().await.steps = steps;
        debug!(from = current, to = steps, pulses_per_s, "MockSyringeDriver: plunger moved");
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            state.connected = false;
            state.commands.push(DriverCommand::Disconnect);
        }
        Ok(())
    }
}

/// A command received by [`MockStirrer`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StirrerCommand {
    SetRate(u32),
    Start,
    Stop,
    Disconnect,
}

#[derive(Debug, Default)]
struct MockStirrerState {
    commands: Vec<StirrerCommand>,
    target_rpm: u32,
    stirring: bool,
    connected: bool,
    fail_start: bool,
}

/// Simulated stirrer plate. Clones share state.
#[derive(Clone)]
pub struct MockStirrer {
    state: Arc<Mutex<MockStirrerState>>,
}

impl MockStirrer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockStirrerState {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Make `start` fail with a communication error
    pub async fn fail_start(&self) {
        self.state.lock().await.fail_start = true;
    }

    pub async fn commands(&self) -> Vec<StirrerCommand> {
        self.state.lock().await.commands.clone()
    }

    pub async fn is_stirring(&self) -> bool {
        self.state.lock().await.stirring
    }

    pub async fn target_rpm(&self) -> u32 {
        self.state.lock().await.target_rpm
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }
}

impl Default for MockStirrer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StirrerDriver for MockStirrer {
    fn name(&self) -> &str {
        "mock-stirrer"
    }

    async fn set_target_rate(&self, rpm: u32) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DaqError::comm("mock stirrer: not connected"));
        }
        state.commands.push(StirrerCommand::SetRate(rpm));
        state.target_rpm = rpm;
        Ok(())
    }

    async fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DaqError::comm("mock stirrer: not connected"));
        }
        state.commands.push(StirrerCommand::Start);
        if state.fail_start {
            return Err(DaqError::comm("mock stirrer: injected start failure"));
        }
        state.stirring = true;
        debug!(rpm = state.target_rpm, "MockStirrer: stirring");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(DaqError::comm("mock stirrer: not connected"));
        }
        state.commands.push(StirrerCommand::Stop);
        state.stirring = false;
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            state.connected = false;
            state.stirring = false;
            state.commands.push(StirrerCommand::Disconnect);
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
