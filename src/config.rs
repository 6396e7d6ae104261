//! Experiment configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/experiment.toml` by default)
//! 2. environment variables prefixed with `REACTIR_`
//!
//! Nested keys are separated by a double underscore so that field names keep
//! their own underscores:
//!
//! ```text
//! REACTIR_APPLICATION__LOG_LEVEL=debug
//! REACTIR_PUMP__SERIAL_PORT=/dev/ttyUSB1
//! REACTIR_RUN__EXPERIMENT_RUN_TIME_S=7200
//! ```
//!
//! Every section has defaults matching the bench setup the protocol was
//! developed on, so a file only needs to name what differs.

use crate::error::{AppResult, DaqError};
use crate::hardware::ika_stirrer::MAX_STIR_RATE_RPM;
use crate::instrument::nodes::NodeMap;
use crate::instrument::session::{MAX_SAMPLING_INTERVAL_S, MIN_SAMPLING_INTERVAL_S};
use crate::pump::{ResolutionMode, MAX_SPEED_ML_S};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/experiment.toml";

/// Top-level configuration for one experiment run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub application: ApplicationConfig,
    pub pump: PumpConfig,
    pub stirrer: StirrerConfig,
    pub instrument: InstrumentConfig,
    pub run: RunConfig,
    pub ports: PortMap,
    pub volumes: VolumeConfig,
    pub speeds: SpeedConfig,
    pub cleaning: CleaningConfig,
    pub mix_changeover: MixChangeoverConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Syringe pump connection and geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    pub serial_port: String,
    pub baud_rate: u32,
    /// DT-protocol device address (1-15)
    pub address: u8,
    /// Number of positions on the distribution valve
    pub valve_count: u8,
    /// Installed syringe volume in mL
    pub syringe_capacity_ml: f64,
    /// Plunger step resolution
    pub resolution: ResolutionMode,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
    /// Upper bound on a single plunger move, in seconds
    pub move_timeout_s: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            address: 1,
            valve_count: 12,
            syringe_capacity_ml: 1.0,
            resolution: ResolutionMode::default(),
            timeout_ms: 2000,
            move_timeout_s: 600,
        }
    }
}

/// Magnetic stirrer under the sample flask
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StirrerConfig {
    /// Stir the sample flask for the whole run
    pub enabled: bool,
    pub serial_port: String,
    pub baud_rate: u32,
    /// Target stir rate in rpm
    pub stir_rate: u32,
    /// Serial write timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for StirrerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            serial_port: "/dev/ttyUSB1".to_string(),
            baud_rate: 9600,
            stir_rate: 150,
            timeout_ms: 1000,
        }
    }
}

/// Spectrometer server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// OPC UA endpoint of the spectrometer controller
    pub endpoint: String,
    /// CSV table holding the `Wavenumbercm-1` axis
    pub wavenumber_table: PathBuf,
    /// Depth of each spectrum queue before the oldest sample is dropped
    pub queue_capacity: usize,
    /// Requested subscription publishing interval
    pub publishing_interval_ms: u64,
    /// Node addresses on the server
    pub nodes: NodeMap,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            endpoint: "opc.tcp://localhost:62552/iCOpcUaServer".to_string(),
            wavenumber_table: PathBuf::from("data/wavenumbers.csv"),
            queue_capacity: 1024,
            publishing_interval_ms: 100,
            nodes: NodeMap::default(),
        }
    }
}

/// Naming and timing of the run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Experiment name; also the stem of the spectra file on the instrument PC
    pub experiment_name: String,
    /// Acquisition template stored on the instrument PC
    pub template_name: String,
    /// Path-like experiment location passed to the start method.
    /// Falls back to `experiment_name` when unset.
    pub spectra_location: Option<String>,
    /// Folder where the instrument writes `<experiment_name>.iCIR`
    pub spectra_dir: Option<PathBuf>,
    /// Folder for per-scan CSV files; recording is off when unset
    pub output_dir: Option<PathBuf>,
    /// Collect a background when the experiment starts
    pub collect_background: bool,
    /// Instrument sampling interval to apply before starting
    pub sampling_interval_s: Option<u32>,
    /// Wall-clock budget for the sampling loop
    pub experiment_run_time_s: f64,
    /// Acquisition window for the solvent baseline
    pub solvent_spectrum_time_s: f64,
    /// Acquisition window per sample
    pub sample_spectrum_time_s: f64,
    /// Acquisition window right after a mix changeover
    pub mix_spectrum_time_s: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment_name: "experiment".to_string(),
            template_name: "DigitalDiscoveryProject_Updated".to_string(),
            spectra_location: None,
            spectra_dir: None,
            output_dir: None,
            collect_background: false,
            sampling_interval_s: None,
            experiment_run_time_s: 14_400.0,
            solvent_spectrum_time_s: 12.0,
            sample_spectrum_time_s: 12.0,
            mix_spectrum_time_s: 180.0,
        }
    }
}

impl RunConfig {
    /// Location string handed to the instrument's start method.
    pub fn spectra_location(&self) -> &str {
        self.spectra_location
            .as_deref()
            .unwrap_or(&self.experiment_name)
    }
}

/// Valve position assigned to each reservoir
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMap {
    pub solvent: u8,
    pub wet_solvent: u8,
    pub waste: u8,
    pub water: u8,
    pub air: u8,
    pub ir: u8,
}

impl Default for PortMap {
    fn default() -> Self {
        Self {
            solvent: 5,
            wet_solvent: 6,
            waste: 12,
            water: 8,
            air: 1,
            ir: 4,
        }
    }
}

impl PortMap {
    fn roles(&self) -> [(&'static str, u8); 6] {
        [
            ("solvent", self.solvent),
            ("wet_solvent", self.wet_solvent),
            ("waste", self.waste),
            ("water", self.water),
            ("air", self.air),
            ("ir", self.ir),
        ]
    }
}

/// Volumes in mL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub prime_ml: f64,
    pub solvent_sample_ml: f64,
    pub sample_ml: f64,
    /// Multiplier on the baseline return transfer that clears line carryover
    pub carryover_factor: f64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            prime_ml: 2.0,
            solvent_sample_ml: 1.0,
            sample_ml: 0.9,
            carryover_factor: 1.1,
        }
    }
}

/// Plunger speeds in mL/s
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub prime_ml_s: f64,
    pub solvent_ml_s: f64,
    pub sample_ml_s: f64,
    pub clean_ml_s: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            prime_ml_s: 15.0 / 60.0,
            solvent_ml_s: 0.07,
            sample_ml_s: 16.0 / 60.0,
            clean_ml_s: 6.0 / 60.0,
        }
    }
}

/// Line cleaning volumes in mL, applied in declaration order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub wet_solvent_ml: f64,
    pub water_ml: f64,
    pub solvent_ml: f64,
    pub air_ml: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            wet_solvent_ml: 3.0,
            water_ml: 4.0,
            solvent_ml: 3.0,
            air_ml: 20.0,
        }
    }
}

/// Mid-run sample vial changeover
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixChangeoverConfig {
    /// Ask the operator during the setup check whether a changeover is planned
    pub ask_operator: bool,
    /// Changeover planned without asking (used when `ask_operator` is false)
    pub required: bool,
}

impl Default for MixChangeoverConfig {
    fn default() -> Self {
        Self {
            ask_operator: true,
            required: false,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ExperimentConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`REACTIR_` prefix) take precedence over the file.
    /// The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("REACTIR_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string (no environment overlay)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks log level, pump geometry, stirrer settings, port assignments (in range, no two
    /// roles on one port), volumes, speeds, acquisition windows and the
    /// optional sampling interval.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let pump = &self.pump;
        if pump.valve_count == 0 {
            return Err(invalid("pump.valve_count must be at least 1"));
        }
        if !(pump.syringe_capacity_ml.is_finite() && pump.syringe_capacity_ml > 0.0) {
            return Err(invalid(format!(
                "pump.syringe_capacity_ml must be positive, got {}",
                pump.syringe_capacity_ml
            )));
        }
        if !(1..=15).contains(&pump.address) {
            return Err(invalid(format!(
                "pump.address must be 1-15, got {}",
                pump.address
            )));
        }

        if self.stirrer.enabled {
            if self.stirrer.stir_rate > MAX_STIR_RATE_RPM {
                return Err(invalid(format!(
                    "stirrer.stir_rate = {} exceeds {} rpm",
                    self.stirrer.stir_rate, MAX_STIR_RATE_RPM
                )));
            }
            if self.stirrer.serial_port == pump.serial_port {
                return Err(invalid(format!(
                    "stirrer and pump both use serial port '{}'",
                    pump.serial_port
                )));
            }
        }

        let mut seen: HashMap<u8, &str> = HashMap::new();
        for (role, port) in self.ports.roles() {
            if port == 0 || port > pump.valve_count {
                return Err(invalid(format!(
                    "ports.{} = {} is outside valve positions 1-{}",
                    role, port, pump.valve_count
                )));
            }
            if let Some(other) = seen.insert(port, role) {
                return Err(invalid(format!(
                    "ports.{} and ports.{} both use valve position {}",
                    other, role, port
                )));
            }
        }

        let volumes = [
            ("volumes.prime_ml", self.volumes.prime_ml),
            ("volumes.solvent_sample_ml", self.volumes.solvent_sample_ml),
            ("volumes.sample_ml", self.volumes.sample_ml),
            ("cleaning.wet_solvent_ml", self.cleaning.wet_solvent_ml),
            ("cleaning.water_ml", self.cleaning.water_ml),
            ("cleaning.solvent_ml", self.cleaning.solvent_ml),
            ("cleaning.air_ml", self.cleaning.air_ml),
        ];
        for (name, value) in volumes {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(format!("{} must be >= 0, got {}", name, value)));
            }
        }
        // Samples are drawn with a single plunger stroke.
        if self.volumes.sample_ml > pump.syringe_capacity_ml {
            return Err(invalid(format!(
                "volumes.sample_ml = {} exceeds syringe capacity {} mL",
                self.volumes.sample_ml, pump.syringe_capacity_ml
            )));
        }
        if !(self.volumes.carryover_factor >= 1.0) {
            return Err(invalid(format!(
                "volumes.carryover_factor must be >= 1, got {}",
                self.volumes.carryover_factor
            )));
        }

        let speeds = [
            ("speeds.prime_ml_s", self.speeds.prime_ml_s),
            ("speeds.solvent_ml_s", self.speeds.solvent_ml_s),
            ("speeds.sample_ml_s", self.speeds.sample_ml_s),
            ("speeds.clean_ml_s", self.speeds.clean_ml_s),
        ];
        for (name, value) in speeds {
            if !(value > 0.0 && value <= MAX_SPEED_ML_S) {
                return Err(invalid(format!(
                    "{} = {} must be within (0, {}] mL/s",
                    name, value, MAX_SPEED_ML_S
                )));
            }
        }

        let windows = [
            ("run.experiment_run_time_s", self.run.experiment_run_time_s),
            ("run.solvent_spectrum_time_s", self.run.solvent_spectrum_time_s),
            ("run.sample_spectrum_time_s", self.run.sample_spectrum_time_s),
            ("run.mix_spectrum_time_s", self.run.mix_spectrum_time_s),
        ];
        for (name, value) in windows {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{} must be positive, got {}", name, value)));
            }
        }

        if let Some(seconds) = self.run.sampling_interval_s {
            if !(MIN_SAMPLING_INTERVAL_S..=MAX_SAMPLING_INTERVAL_S).contains(&seconds) {
                return Err(DaqError::OutOfRangeInterval {
                    seconds,
                    min: MIN_SAMPLING_INTERVAL_S,
                    max: MAX_SAMPLING_INTERVAL_S,
                });
            }
        }
        if self.run.experiment_name.trim().is_empty() {
            return Err(invalid("run.experiment_name cannot be empty"));
        }

        if self.instrument.queue_capacity == 0 {
            return Err(invalid("instrument.queue_capacity must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ExperimentConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ExperimentConfig::from_toml_str(
            r#"
            [run]
            experiment_name = "TestTubingLength_7"
            experiment_run_time_s = 3600

            [pump]
            resolution = "fine"
            "#,
        )
        .unwrap();

        assert_eq!(config.run.experiment_name, "TestTubingLength_7");
        assert_eq!(config.run.experiment_run_time_s, 3600.0);
        assert_eq!(config.pump.resolution, ResolutionMode::Fine);
        assert_eq!(config.ports.ir, 4);
        assert_eq!(config.run.spectra_location(), "TestTubingLength_7");
    }

    #[test]
    fn test_shared_port_rejected() {
        let mut config = ExperimentConfig::default();
        config.ports.water = config.ports.solvent;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("valve position 5"));
    }

    #[test]
    fn test_port_outside_valve_rejected() {
        let mut config = ExperimentConfig::default();
        config.ports.air = 13;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_speed_above_hardware_limit_rejected() {
        let mut config = ExperimentConfig::default();
        config.speeds.clean_ml_s = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stirrer_settings_checked_only_when_enabled() {
        let mut config = ExperimentConfig::default();
        config.stirrer.stir_rate = 5000;
        config.validate().unwrap();

        config.stirrer.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stirrer.stir_rate"));

        config.stirrer.stir_rate = 150;
        config.stirrer.serial_port = config.pump.serial_port.clone();
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_sampling_interval_range_checked() {
        let mut config = ExperimentConfig::default();
        config.run.sampling_interval_s = Some(14);
        assert!(matches!(
            config.validate(),
            Err(DaqError::OutOfRangeInterval { seconds: 14, .. })
        ));
    }

    #[test]
    fn test_unknown_resolution_is_a_load_error() {
        let result = ExperimentConfig::from_toml_str(
            r#"
            [pump]
            resolution = "ultra"
            "#,
        );
        assert!(matches!(result, Err(DaqError::Config(_))));
    }
}
