//! Configuration loading tests against the shipped files.
//!
//! Run with: cargo test --test config_integration

use reactir_daq::config::ExperimentConfig;
use reactir_daq::instrument::spectrum::load_wavenumbers;
use reactir_daq::pump::ResolutionMode;
use std::io::Write;

#[test]
fn test_shipped_config_is_valid() {
    let config = ExperimentConfig::load_from("config/experiment.toml").unwrap();
    assert_eq!(config.pump.valve_count, 12);
    assert_eq!(config.pump.resolution, ResolutionMode::Standard);
    assert_eq!(config.ports.ir, 4);
    assert!(config.stirrer.enabled);
    assert_eq!(config.stirrer.stir_rate, 150);
    assert_eq!(
        config.instrument.endpoint,
        "opc.tcp://localhost:62552/iCOpcUaServer"
    );
    assert_eq!(config.instrument.nodes.raw_spectra, "ns=2;s=Local.iCIR.Probe1.SpectraRaw");
}

#[test]
fn test_shipped_wavenumber_table_loads() {
    let config = ExperimentConfig::load_from("config/experiment.toml").unwrap();
    let axis = load_wavenumbers(&config.instrument.wavenumber_table).unwrap();
    assert!(axis.len() > 1000);
    assert!(axis.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[run]\nexperiment_name = \"kinetics_07\"\n\n[pump]\nresolution = \"fine\"").unwrap();

    let config = ExperimentConfig::load_from(file.path()).unwrap();
    assert_eq!(config.run.experiment_name, "kinetics_07");
    assert_eq!(config.pump.resolution, ResolutionMode::Fine);
    assert_eq!(config.ports.waste, 12);
    assert_eq!(config.run.mix_spectrum_time_s, 180.0);
}

#[test]
fn test_clashing_ports_rejected() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[ports]\nwaste = 4").unwrap();

    let err = ExperimentConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("valve position 4"));
}
