//! Hardware drivers
//!
//! - [`capabilities`] - traits the actuator logic is written against
//! - [`dt_pump`] - serial DT-protocol syringe pump (`instrument_serial` feature)
//! - [`ika_stirrer`] - serial NAMUR magnetic stirrer (`instrument_serial` feature)
//! - [`mock`] - simulated pump and stirrer for tests and dry runs

pub mod capabilities;
pub mod dt_pump;
pub mod ika_stirrer;
pub mod mock;

pub use capabilities::{StirrerDriver, SyringeDriver};
pub use mock::{DriverCommand, MockStirrer, MockSyringeDriver, StirrerCommand};

#[cfg(feature = "instrument_serial")]
pub use dt_pump::DtPump;
#[cfg(feature = "instrument_serial")]
pub use ika_stirrer::IkaStirrer;
