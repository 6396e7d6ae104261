//! Serial magnetic stirrer driver (NAMUR command set)
//!
//! Protocol Overview:
//! - Line based ASCII, every command terminated by `\r\n`
//! - Serial framing: 9600 baud, 7 data bits, even parity, 1 stop bit
//! - Setters and `START`/`STOP` are not acknowledged
//!
//! | Command       | Meaning                       |
//! |---------------|-------------------------------|
//! | `OUT_SP_4 n`  | target stir rate in rpm       |
//! | `START_4`     | start the stirring motor      |
//! | `STOP_4`      | stop the stirring motor       |

/// NAMUR channel of the stirring motor
pub const STIR_CHANNEL: u8 = 4;

/// Highest rate the plate accepts
pub const MAX_STIR_RATE_RPM: u32 = 1500;

pub fn set_rate_command(rpm: u32) -> String {
    format!("OUT_SP_{} {}\r\n", STIR_CHANNEL, rpm)
}

pub fn start_command() -> String {
    format!("START_{}\r\n", STIR_CHANNEL)
}

pub fn stop_command() -> String {
    format!("STOP_{}\r\n", STIR_CHANNEL)
}

#[cfg(feature = "instrument_serial")]
pub use serial::IkaStirrer;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::*;
    use crate::config::StirrerConfig;
    use crate::error::{AppResult, DaqError};
    use crate::hardware::capabilities::StirrerDriver;
    use async_trait::async_trait;
    use serialport::SerialPort;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tracing::{debug, info};

    /// Driver for a NAMUR magnetic stirrer hotplate
    pub struct IkaStirrer {
        port_name: String,
        port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    }

    impl IkaStirrer {
        /// Open the serial port described by `config`
        pub fn open(config: &StirrerConfig) -> AppResult<Self> {
            let port = serialport::new(&config.serial_port, config.baud_rate)
                .data_bits(serialport::DataBits::Seven)
                .parity(serialport::Parity::Even)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(config.timeout_ms))
                .open()
                .map_err(|e| {
                    DaqError::comm(format!(
                        "failed to open stirrer port '{}': {}",
                        config.serial_port, e
                    ))
                })?;
            info!(port = %config.serial_port, "Stirrer port opened");

            Ok(Self {
                port_name: config.serial_port.clone(),
                port: Arc::new(Mutex::new(Some(port))),
            })
        }

        async fn send(&self, command: String) -> AppResult<()> {
            let port = self.port.clone();

            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut guard = port.blocking_lock();
                let port = guard
                    .as_mut()
                    .ok_or_else(|| DaqError::comm("stirrer port not connected"))?;
                port.write_all(command.as_bytes())
                    .map_err(|e| DaqError::comm(format!("stirrer write failed: {}", e)))?;
                port.flush()
                    .map_err(|e| DaqError::comm(format!("stirrer flush failed: {}", e)))?;
                debug!("Sent stirrer command: {}", command.trim());
                Ok(())
            })
            .await
            .map_err(|e| DaqError::comm(format!("stirrer I/O task failed: {}", e)))?
        }
    }

    #[async_trait]
    impl StirrerDriver for IkaStirrer {
        fn name(&self) -> &str {
            &self.port_name
        }

        async fn set_target_rate(&self, rpm: u32) -> AppResult<()> {
            self.send(set_rate_command(rpm)).await
        }

        async fn start(&self) -> AppResult<()> {
            self.send(start_command()).await
        }

        async fn stop(&self) -> AppResult<()> {
            self.send(stop_command()).await
        }

        async fn disconnect(&self) -> AppResult<()> {
            if self.port.lock().await.take().is_some() {
                debug!("Stirrer port '{}' closed", self.port_name);
            }
            Ok(())
        }
    }
}
