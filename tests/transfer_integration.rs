//! Syringe pump transfer integration tests against the mock driver.
//!
//! Run with: cargo test --test transfer_integration

use reactir_daq::error::DaqError;
use reactir_daq::hardware::{DriverCommand, MockSyringeDriver};
use reactir_daq::pump::{ResolutionMode, SyringePump, TransferRequest};
use std::time::Duration;

fn pump_with(driver: &MockSyringeDriver, capacity_ml: f64) -> SyringePump {
    SyringePump::new(
        Box::new(driver.clone()),
        12,
        capacity_ml,
        ResolutionMode::Standard,
    )
}

#[tokio::test]
async fn test_multi_stroke_transfer_alternates_ports() {
    let driver = MockSyringeDriver::new();
    let pump = pump_with(&driver, 1.0);

    let report = pump
        .transfer(&TransferRequest::new(4, 12, 3.1, 0.25))
        .await
        .unwrap();

    assert_eq!(report.cycle_volumes_ml.len(), 4);
    assert!((report.moved_ml() - 3.1).abs() < 1e-9);

    let commands = driver.commands().await;
    let valves: Vec<u8> = commands
        .iter()
        .filter_map(|c| match c {
            DriverCommand::Valve(port) => Some(*port),
            _ => None,
        })
        .collect();
    assert_eq!(valves, vec![4, 12, 4, 12, 4, 12, 4, 12]);

    let aspirations: Vec<u32> = commands
        .iter()
        .filter_map(|c| match c {
            DriverCommand::Move { steps, .. } if *steps > 0 => Some(*steps),
            _ => None,
        })
        .collect();
    assert_eq!(aspirations, vec![3000, 3000, 3000, 300]);

    // Every stroke ends empty.
    assert_eq!(driver.steps().await, 0);
    assert_eq!(pump.state().await.current_port, Some(12));
}

#[tokio::test]
async fn test_invalid_port_sends_nothing() {
    let driver = MockSyringeDriver::new();
    let pump = pump_with(&driver, 1.0);

    let err = pump
        .transfer(&TransferRequest::new(13, 12, 0.5, 0.1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaqError::InvalidPort {
            port: 13,
            valve_count: 12
        }
    ));
    assert!(driver.commands().await.is_empty());
}

#[tokio::test]
async fn test_progress_reports_every_stroke() {
    let driver = MockSyringeDriver::new();
    let pump = pump_with(&driver, 0.5);
    let mut progress = pump.subscribe_progress();

    pump.transfer(&TransferRequest::new(1, 2, 1.2, 0.1))
        .await
        .unwrap();

    assert!(progress.has_changed().unwrap());
    let last = *progress.borrow_and_update();
    assert_eq!(last.cycles_total, 3);
    assert_eq!(last.cycles_done, 3);
    assert!((last.moved_ml - 1.2).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_realtime_transfer_duration_follows_speed() {
    let driver = MockSyringeDriver::realtime(ResolutionMode::Standard);
    let pump = pump_with(&driver, 1.0);
    let start = tokio::time::Instant::now();

    // 1 mL at 0.1 mL/s each way: roughly 10 s aspirate plus 10 s dispense.
    pump.transfer(&TransferRequest::new(5, 4, 1.0, 0.1))
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(19), "took {:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(22), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_failure_mid_transfer_surfaces_and_shutdown_still_works() {
    let driver = MockSyringeDriver::new();
    driver.fail_on_command(5);
    let pump = pump_with(&driver, 1.0);

    let err = pump
        .transfer(&TransferRequest::new(5, 4, 2.0, 0.1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::HardwareComm(_)));

    pump.shutdown().await.unwrap();
    pump.shutdown().await.unwrap();
    assert!(!driver.is_connected().await);
    assert!(!pump.state().await.connected);
}
