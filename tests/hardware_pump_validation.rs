//! Hardware validation for the DT-protocol syringe pump.
//!
//! Needs a pump on the configured serial port with the syringe installed and
//! every valve port routed to a waste container.
//!
//! Run with: cargo test --test hardware_pump_validation -- --ignored --nocapture

#![cfg(feature = "instrument_serial")]

use reactir_daq::config::ExperimentConfig;
use reactir_daq::hardware::DtPump;
use reactir_daq::pump::{SyringePump, TransferRequest};

#[tokio::test]
#[ignore] // Hardware-only test
async fn test_initialise_and_round_trip() {
    let config = ExperimentConfig::load_from("config/experiment.toml").unwrap();
    let driver = DtPump::open(&config.pump).unwrap();
    driver
        .initialize(config.ports.waste, config.pump.resolution)
        .await
        .unwrap();

    let pump = SyringePump::new(
        Box::new(driver),
        config.pump.valve_count,
        config.pump.syringe_capacity_ml,
        config.pump.resolution,
    );

    println!("Switching through every port");
    for port in 1..=pump.valve_count() {
        pump.switch(port).await.unwrap();
    }

    println!("Moving half a stroke and back");
    let half = config.pump.syringe_capacity_ml / 2.0;
    pump.switch(config.ports.waste).await.unwrap();
    pump.move_to(half, 0.1).await.unwrap();
    pump.move_to(0.0, 0.1).await.unwrap();

    println!("Transferring 1.5 strokes waste -> waste");
    let report = pump
        .transfer(&TransferRequest::new(
            config.ports.waste,
            config.ports.waste,
            1.5 * config.pump.syringe_capacity_ml,
            0.2,
        ))
        .await
        .unwrap();
    assert_eq!(report.cycle_volumes_ml.len(), 2);

    pump.shutdown().await.unwrap();
}
