//! Syringe pump liquid transfers
//!
//! [`SyringePump`] turns volumetric requests (mL, mL/s) into the step and
//! pulse units of a [`SyringeDriver`] and runs aspirate/dispense cycles
//! between two valve ports.
//!
//! # Geometry
//!
//! - Full plunger travel is 30mm and displaces the whole syringe capacity.
//! - Steps are 0.01mm ([`ResolutionMode::Standard`]) or 0.00125mm
//!   ([`ResolutionMode::Fine`]).
//! - Speed is given in pulses/s and one pulse always displaces 0.01mm.
//!
//! Pulse rates are truncated, never rounded up, so a requested speed is never
//! exceeded.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::SyringeDriver;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Full plunger travel in mm.
pub const SYRINGE_TRAVEL_MM: f64 = 30.0;

/// Plunger displacement of one speed pulse in mm.
pub const PULSE_DISPLACEMENT_MM: f64 = 0.01;

/// Highest plunger speed the pump sustains, in mL/s.
pub const MAX_SPEED_ML_S: f64 = 0.53;

/// Partial cycles smaller than this are floating point residue of the split.
const REMAINDER_EPSILON_ML: f64 = 1e-9;

/// Plunger step resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// 0.01mm per step, 3000 steps full stroke
    #[default]
    Standard,
    /// 0.00125mm per step, 24000 steps full stroke
    Fine,
}

impl ResolutionMode {
    /// Plunger travel per step in mm
    pub fn step_mm(self) -> f64 {
        match self {
            ResolutionMode::Standard => 0.01,
            ResolutionMode::Fine => 0.00125,
        }
    }

    /// Steps for the full 30mm stroke
    pub fn full_stroke_steps(self) -> u32 {
        match self {
            ResolutionMode::Standard => 3000,
            ResolutionMode::Fine => 24000,
        }
    }

    /// Numeric code understood by the pump firmware
    pub fn code(self) -> u8 {
        match self {
            ResolutionMode::Standard => 0,
            ResolutionMode::Fine => 1,
        }
    }
}

/// Volume displaced by one plunger step
pub fn step_volume_ml(capacity_ml: f64, mode: ResolutionMode) -> f64 {
    capacity_ml / SYRINGE_TRAVEL_MM * mode.step_mm()
}

/// Absolute plunger position holding `volume_ml`
pub fn ml_to_steps(volume_ml: f64, capacity_ml: f64, mode: ResolutionMode) -> u32 {
    (volume_ml / step_volume_ml(capacity_ml, mode)).round() as u32
}

/// Volume held at an absolute plunger position
pub fn steps_to_ml(steps: u32, capacity_ml: f64, mode: ResolutionMode) -> f64 {
    f64::from(steps) * step_volume_ml(capacity_ml, mode)
}

/// Pulse rate for a plunger speed, truncated to an integer
pub fn ml_per_s_to_pulses(speed_ml_s: f64, capacity_ml: f64) -> u32 {
    let pulse_volume = capacity_ml / SYRINGE_TRAVEL_MM * PULSE_DISPLACEMENT_MM;
    // The tiny bias keeps exact quotients such as 0.07 / (1/3000) = 210 from
    // truncating to 209 on representation error.
    (speed_ml_s / pulse_volume + 1e-9).floor() as u32
}

/// Split a transfer into per-stroke volumes.
///
/// Produces `floor(volume / capacity)` full strokes followed by one partial
/// stroke holding the remainder, if any.
pub fn plan_cycles(volume_ml: f64, capacity_ml: f64) -> Vec<f64> {
    let full = (volume_ml / capacity_ml).floor() as usize;
    let remainder = volume_ml - full as f64 * capacity_ml;

    let mut cycles = vec![capacity_ml; full];
    if remainder > REMAINDER_EPSILON_ML {
        cycles.push(remainder);
    }
    cycles
}

/// A liquid move between two valve ports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_port: u8,
    pub to_port: u8,
    pub volume_ml: f64,
    pub aspirate_speed_ml_s: f64,
    pub dispense_speed_ml_s: f64,
}

impl TransferRequest {
    /// Transfer with the same speed for aspiration and dispensing
    pub fn new(from_port: u8, to_port: u8, volume_ml: f64, speed_ml_s: f64) -> Self {
        Self {
            from_port,
            to_port,
            volume_ml,
            aspirate_speed_ml_s: speed_ml_s,
            dispense_speed_ml_s: speed_ml_s,
        }
    }

    pub fn with_speeds(mut self, aspirate_ml_s: f64, dispense_ml_s: f64) -> Self {
        self.aspirate_speed_ml_s = aspirate_ml_s;
        self.dispense_speed_ml_s = dispense_ml_s;
        self
    }
}

/// Progress published after each completed stroke
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferProgress {
    pub cycles_done: usize,
    pub cycles_total: usize,
    pub moved_ml: f64,
    pub requested_ml: f64,
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub request: TransferRequest,
    /// Volume of each stroke, in execution order
    pub cycle_volumes_ml: Vec<f64>,
}

impl TransferReport {
    pub fn moved_ml(&self) -> f64 {
        self.cycle_volumes_ml.iter().sum()
    }
}

/// Snapshot of the actuator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorState {
    /// Last commanded valve position
    pub current_port: Option<u8>,
    /// Volume held in the syringe after the last move
    pub plunger_volume_ml: f64,
    pub syringe_capacity_ml: f64,
    pub resolution: ResolutionMode,
    pub connected: bool,
}

impl ActuatorState {
    /// Plunger position derived from the held volume
    pub fn plunger_position(&self) -> u32 {
        ml_to_steps(
            self.plunger_volume_ml,
            self.syringe_capacity_ml,
            self.resolution,
        )
    }
}

/// Volumetric front end for a distribution-valve syringe pump.
///
/// The actuator state lock is held for the whole of a `move_to` or
/// `transfer`, so at most one motion sequence runs at a time.
pub struct SyringePump {
    driver: Box<dyn SyringeDriver>,
    valve_count: u8,
    state: Mutex<ActuatorState>,
    progress: watch::Sender<TransferProgress>,
}

impl SyringePump {
    /// Wrap a driver
    ///
    /// # Arguments
    /// * `driver` - Device driver, already initialised
    /// * `valve_count` - Number of valve positions
    /// * `syringe_capacity_ml` - Installed syringe volume
    /// * `resolution` - Step resolution the driver was initialised with
    pub fn new(
        driver: Box<dyn SyringeDriver>,
        valve_count: u8,
        syringe_capacity_ml: f64,
        resolution: ResolutionMode,
    ) -> Self {
        let (progress, _) = watch::channel(TransferProgress::default());
        Self {
            driver,
            valve_count,
            state: Mutex::new(ActuatorState {
                current_port: None,
                plunger_volume_ml: 0.0,
                syringe_capacity_ml,
                resolution,
                connected: true,
            }),
            progress,
        }
    }

    pub fn valve_count(&self) -> u8 {
        self.valve_count
    }

    pub async fn state(&self) -> ActuatorState {
        *self.state.lock().await
    }

    /// Receive a [`TransferProgress`] update after every stroke
    pub fn subscribe_progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Move the valve to `port`; does nothing if it is already there
    pub async fn switch(&self, port: u8) -> AppResult<()> {
        self.validate_port(port)?;
        let mut state = self.state.lock().await;
        self.switch_locked(&mut state, port).await
    }

    /// Drive the plunger so the syringe holds `volume_ml`
    pub async fn move_to(&self, volume_ml: f64, speed_ml_s: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        validate_volume(volume_ml, state.syringe_capacity_ml)?;
        validate_speed(speed_ml_s, state.syringe_capacity_ml)?;
        self.move_locked(&mut state, volume_ml, speed_ml_s).await
    }

    /// Move `volume_ml` from one port to another, in as many strokes as needed
    pub async fn transfer(&self, request: &TransferRequest) -> AppResult<TransferReport> {
        self.validate_port(request.from_port)?;
        self.validate_port(request.to_port)?;
        if !(request.volume_ml.is_finite() && request.volume_ml >= 0.0) {
            return Err(DaqError::InvalidVolume {
                volume_ml: request.volume_ml,
                max_ml: f64::INFINITY,
            });
        }

        let mut state = self.state.lock().await;
        validate_speed(request.aspirate_speed_ml_s, state.syringe_capacity_ml)?;
        validate_speed(request.dispense_speed_ml_s, state.syringe_capacity_ml)?;

        let cycles = plan_cycles(request.volume_ml, state.syringe_capacity_ml);
        let total = cycles.len();
        debug!(
            from = request.from_port,
            to = request.to_port,
            volume_ml = request.volume_ml,
            cycles = total,
            "Starting transfer"
        );

        let mut moved = 0.0;
        self.progress.send_replace(TransferProgress {
            cycles_done: 0,
            cycles_total: total,
            moved_ml: 0.0,
            requested_ml: request.volume_ml,
        });

        for (index, volume) in cycles.iter().copied().enumerate() {
            self.switch_locked(&mut state, request.from_port).await?;
            self.move_locked(&mut state, volume, request.aspirate_speed_ml_s)
                .await?;
            self.switch_locked(&mut state, request.to_port).await?;
            self.move_locked(&mut state, 0.0, request.dispense_speed_ml_s)
                .await?;

            moved += volume;
            self.progress.send_replace(TransferProgress {
                cycles_done: index + 1,
                cycles_total: total,
                moved_ml: moved,
                requested_ml: request.volume_ml,
            });
            info!(
                "Transferred {:.3} mL out of {:.3} mL ({}/{} strokes)",
                moved,
                request.volume_ml,
                index + 1,
                total
            );
        }

        Ok(TransferReport {
            request: *request,
            cycle_volumes_ml: cycles,
        })
    }

    /// Release the pump connection
    pub async fn shutdown(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            info!(pump = self.driver.name(), "Disconnecting pump");
            self.driver.disconnect().await?;
            state.connected = false;
        }
        Ok(())
    }

    fn validate_port(&self, port: u8) -> AppResult<()> {
        if port == 0 || port > self.valve_count {
            return Err(DaqError::InvalidPort {
                port,
                valve_count: self.valve_count,
            });
        }
        Ok(())
    }

    async fn switch_locked(&self, state: &mut ActuatorState, port: u8) -> AppResult<()> {
        if state.current_port == Some(port) {
            return Ok(());
        }
        self.driver.set_valve(port).await?;
        state.current_port = Some(port);
        Ok(())
    }

    async fn move_locked(
        &self,
        state: &mut ActuatorState,
        volume_ml: f64,
        speed_ml_s: f64,
    ) -> AppResult<()> {
        let steps = ml_to_steps(volume_ml, state.syringe_capacity_ml, state.resolution);
        let pulses = ml_per_s_to_pulses(speed_ml_s, state.syringe_capacity_ml);
        self.driver.move_absolute(steps, pulses).await?;
        state.plunger_volume_ml = volume_ml;
        Ok(())
    }
}

fn validate_volume(volume_ml: f64, capacity_ml: f64) -> AppResult<()> {
    if !(volume_ml.is_finite() && (0.0..=capacity_ml).contains(&volume_ml)) {
        return Err(DaqError::InvalidVolume {
            volume_ml,
            max_ml: capacity_ml,
        });
    }
    Ok(())
}

fn validate_speed(speed_ml_s: f64, capacity_ml: f64) -> AppResult<()> {
    let in_range = speed_ml_s > 0.0 && speed_ml_s <= MAX_SPEED_ML_S;
    if !in_range || ml_per_s_to_pulses(speed_ml_s, capacity_ml) == 0 {
        return Err(DaqError::InvalidSpeed {
            speed_ml_s,
            max_ml_s: MAX_SPEED_ML_S,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DriverCommand, MockSyringeDriver};
    use proptest::prelude::*;

    fn pump_with(driver: &MockSyringeDriver, capacity: f64) -> SyringePump {
        SyringePump::new(
            Box::new(driver.clone()),
            12,
            capacity,
            ResolutionMode::Standard,
        )
    }

    #[test]
    fn test_position_conversion() {
        assert_eq!(ml_to_steps(1.0, 1.0, ResolutionMode::Standard), 3000);
        assert_eq!(ml_to_steps(0.5, 1.0, ResolutionMode::Standard), 1500);
        assert_eq!(ml_to_steps(1.0, 1.0, ResolutionMode::Fine), 24000);
        assert_eq!(ml_to_steps(0.0, 1.0, ResolutionMode::Fine), 0);
    }

    #[test]
    fn test_speed_conversion_truncates() {
        // pulse volume for a 1 mL syringe is 1/3000 mL
        assert_eq!(ml_per_s_to_pulses(0.07, 1.0), 210);
        assert_eq!(ml_per_s_to_pulses(MAX_SPEED_ML_S, 1.0), 1590);
        // 0.10005 mL/s would be 300.15 pulses/s
        assert_eq!(ml_per_s_to_pulses(0.10005, 1.0), 300);
    }

    #[test]
    fn test_plan_cycles_with_remainder() {
        let cycles = plan_cycles(3.1, 1.0);
        assert_eq!(cycles.len(), 4);
        assert_eq!(&cycles[..3], &[1.0, 1.0, 1.0]);
        assert!((cycles[3] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_plan_cycles_exact_multiple_and_zero() {
        assert_eq!(plan_cycles(2.0, 1.0), vec![1.0, 1.0]);
        assert!(plan_cycles(0.0, 1.0).is_empty());
        assert_eq!(plan_cycles(0.25, 1.0), vec![0.25]);
    }

    proptest! {
        #[test]
        fn prop_cycle_volumes_sum_to_request(
            volume in 0.0f64..50.0,
            capacity in 0.05f64..10.0,
        ) {
            let cycles = plan_cycles(volume, capacity);
            let full = (volume / capacity).floor() as usize;
            let total: f64 = cycles.iter().sum();

            prop_assert!((total - volume).abs() < 1e-6);
            prop_assert!(cycles.len() == full || cycles.len() == full + 1);
            prop_assert!(cycles.iter().take(full).all(|c| *c == capacity));
            prop_assert!(cycles.iter().all(|c| *c > 0.0 && *c <= capacity + 1e-12));
        }

        #[test]
        fn prop_position_round_trip_within_one_step(
            volume in 0.0f64..=1.0,
            fine in any::<bool>(),
        ) {
            let mode = if fine { ResolutionMode::Fine } else { ResolutionMode::Standard };
            let back = steps_to_ml(ml_to_steps(volume, 1.0, mode), 1.0, mode);
            prop_assert!((back - volume).abs() <= step_volume_ml(1.0, mode));
        }
    }

    #[tokio::test]
    async fn test_transfer_splits_into_strokes() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);

        let report = pump
            .transfer(&TransferRequest::new(4, 12, 3.1, 0.1))
            .await
            .unwrap();

        assert_eq!(report.cycle_volumes_ml.len(), 4);
        assert!((report.moved_ml() - 3.1).abs() < 1e-9);

        let commands = driver.commands().await;
        let valves: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                DriverCommand::Valve(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(valves, vec![4, 12, 4, 12, 4, 12, 4, 12]);

        let aspirations: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                DriverCommand::Move { steps, .. } if *steps > 0 => Some(*steps),
                _ => None,
            })
            .collect();
        assert_eq!(aspirations, vec![3000, 3000, 3000, 300]);
    }

    #[tokio::test]
    async fn test_switch_is_noop_when_already_there() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);
        pump.switch(3).await.unwrap();
        pump.switch(3).await.unwrap();
        assert_eq!(driver.commands().await, vec![DriverCommand::Valve(3)]);
        assert_eq!(pump.state().await.current_port, Some(3));
    }

    #[tokio::test]
    async fn test_invalid_port_sends_nothing() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);

        assert!(matches!(
            pump.switch(0).await,
            Err(DaqError::InvalidPort { port: 0, .. })
        ));
        assert!(matches!(
            pump.transfer(&TransferRequest::new(1, 13, 1.0, 0.1)).await,
            Err(DaqError::InvalidPort { port: 13, .. })
        ));
        assert!(driver.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_move_rejects_overfill_and_overspeed() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);

        assert!(matches!(
            pump.move_to(1.5, 0.1).await,
            Err(DaqError::InvalidVolume { .. })
        ));
        assert!(matches!(
            pump.move_to(0.5, 0.6).await,
            Err(DaqError::InvalidSpeed { .. })
        ));
        assert!(driver.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_move_tracks_plunger_position() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);
        pump.move_to(0.9, 16.0 / 60.0).await.unwrap();

        let state = pump.state().await;
        assert_eq!(state.plunger_position(), 2700);
        assert_eq!(
            driver.commands().await,
            vec![DriverCommand::Move {
                steps: 2700,
                pulses_per_s: 800
            }]
        );
    }

    #[tokio::test]
    async fn test_progress_reports_each_stroke() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);
        let progress = pump.subscribe_progress();

        pump.transfer(&TransferRequest::new(1, 2, 2.5, 0.2))
            .await
            .unwrap();

        let last = *progress.borrow();
        assert_eq!(last.cycles_done, 3);
        assert_eq!(last.cycles_total, 3);
        assert!((last.moved_ml - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let driver = MockSyringeDriver::new();
        let pump = pump_with(&driver, 1.0);
        pump.shutdown().await.unwrap();
        pump.shutdown().await.unwrap();
        assert_eq!(driver.commands().await, vec![DriverCommand::Disconnect]);
    }
}
