//! Hardware capability traits
//!
//! Drivers implement these traits so that the actuator logic in
//! [`crate::pump`] and the orchestrator never depend on a concrete protocol.
//! All units at this level are device units: valve positions, plunger steps,
//! pulses/s and rpm.

use crate::error::AppResult;
use async_trait::async_trait;

/// Capability for a distribution-valve syringe pump.
///
/// Implementations serialize their own I/O; callers still issue one command
/// at a time because the pump has a single plunger.
#[async_trait]
pub trait SyringeDriver: Send + Sync {
    /// Short identifier used in log lines.
    fn name(&self) -> &str;

    /// Rotate the valve to `port` along the shortest path.
    ///
    /// Returns once the valve has stopped.
    async fn set_valve(&self, port: u8) -> AppResult<()>;

    /// Drive the plunger to an absolute step position at `pulses_per_s`.
    ///
    /// Returns once the plunger has stopped.
    async fn move_absolute(&self, steps: u32, pulses_per_s: u32) -> AppResult<()>;

    /// Release the physical connection. Calling it twice is harmless.
    async fn disconnect(&self) -> AppResult<()>;
}

/// Capability for a magnetic stirrer hotplate.
///
/// Rates are in rpm. `start` spins at the last target rate.
#[async_trait]
pub trait StirrerDriver: Send + Sync {
    /// Short identifier used in log lines.
    fn name(&self) -> &str;

    async fn set_target_rate(&self, rpm: u32) -> AppResult<()>;

    async fn start(&self) -> AppResult<()>;

    /// Stop stirring. Stopping an idle stirrer is harmless.
    async fn stop(&self) -> AppResult<()>;

    /// Release the physical connection. Calling it twice is harmless.
    async fn disconnect(&self) -> AppResult<()>;
}
