//! Serial syringe pump driver (DT protocol)
//!
//! Protocol Overview:
//! - Command frame: `/{addr}{commands}R\r` (ASCII, address as one hex digit)
//! - Reply frame: `/0{status}{data}\x03\r\n`
//! - Status byte: bit 5 (0x20) set when idle, low nibble is the error code
//! - Timing: half-duplex request-response, motions run after the reply
//!
//! Commands used here:
//!
//! | Command   | Meaning                                   |
//! |-----------|-------------------------------------------|
//! | `B{n}`    | rotate valve to port `n` by shortest path |
//! | `V{p}`    | top speed in pulses/s                     |
//! | `A{s}`    | absolute plunger move to step `s`         |
//! | `N{0,1}`  | standard / fine step resolution           |
//! | `Z`       | initialise plunger (empties to the valve) |
//! | `Q`       | status query                              |
//!
//! Frame building and reply parsing are plain functions so they can be tested
//! without a port. The port itself needs the `instrument_serial` feature.

use crate::error::{AppResult, DaqError};

/// End-of-text byte terminating reply payloads.
pub const ETX: u8 = 0x03;

const READY_BIT: u8 = 0x20;
const ERROR_MASK: u8 = 0x0F;

/// Build a command frame for device `address`.
pub fn frame(address: u8, commands: &str) -> String {
    format!("/{:X}{}R\r", address, commands)
}

/// Build a status query frame (no `R` suffix).
pub fn query_frame(address: u8) -> String {
    format!("/{:X}Q\r", address)
}

/// Decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ready: bool,
    pub error_code: u8,
    pub data: String,
}

/// Human-readable meaning of a pump error code.
pub fn describe_error(code: u8) -> &'static str {
    match code {
        0 => "no error",
        1 => "initialization error",
        2 => "invalid command",
        3 => "invalid operand",
        4 => "invalid command sequence",
        6 => "EEPROM failure",
        7 => "device not initialized",
        9 => "plunger overload",
        10 => "valve overload",
        11 => "plunger move not allowed",
        15 => "command overflow",
        _ => "unknown error",
    }
}

/// Parse a raw reply. Leading noise before `/` is skipped.
pub fn parse_reply(raw: &[u8]) -> AppResult<Reply> {
    let start = raw
        .iter()
        .position(|b| *b == b'/')
        .ok_or_else(|| DaqError::comm(format!("pump reply without start byte: {:?}", raw)))?;
    let body = &raw[start..];

    let end = body
        .iter()
        .position(|b| *b == ETX)
        .ok_or_else(|| DaqError::comm(format!("pump reply without ETX: {:?}", raw)))?;

    // "/0" + status byte at minimum
    if end < 3 || body[1] != b'0' {
        return Err(DaqError::comm(format!("malformed pump reply: {:?}", raw)));
    }

    let status = body[2];
    let data = String::from_utf8_lossy(&body[3..end]).trim().to_string();
    Ok(Reply {
        ready: status & READY_BIT != 0,
        error_code: status & ERROR_MASK,
        data,
    })
}

/// Turn a reply with a non-zero error code into an error.
pub fn check_reply(reply: Reply) -> AppResult<Reply> {
    if reply.error_code != 0 {
        return Err(DaqError::comm(format!(
            "pump error {}: {}",
            reply.error_code,
            describe_error(reply.error_code)
        )));
    }
    Ok(reply)
}

#[cfg(feature = "instrument_serial")]
pub use serial::DtPump;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::*;
    use crate::config::PumpConfig;
    use crate::hardware::capabilities::SyringeDriver;
    use crate::pump::ResolutionMode;
    use async_trait::async_trait;
    use serialport::SerialPort;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::Mutex;
    use tracing::{debug, info};

    /// Poll period while waiting for motion to finish
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Driver for a DT-protocol syringe pump with a distribution valve
    ///
    /// Blocking serial I/O runs on Tokio's blocking pool; the port sits behind
    /// `Arc<Mutex<Option<..>>>` so `disconnect` can drop it.
    pub struct DtPump {
        port_name: String,
        address: u8,
        timeout: Duration,
        move_timeout: Duration,
        port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    }

    impl DtPump {
        /// Open the serial port described by `config`
        ///
        /// # Errors
        /// Returns `HardwareComm` if the port cannot be opened
        pub fn open(config: &PumpConfig) -> AppResult<Self> {
            let port = serialport::new(&config.serial_port, config.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| {
                    DaqError::comm(format!(
                        "failed to open pump port '{}' at {} baud: {}",
                        config.serial_port, config.baud_rate, e
                    ))
                })?;

            debug!(
                "Pump port '{}' opened at {} baud",
                config.serial_port, config.baud_rate
            );

            Ok(Self {
                port_name: config.serial_port.clone(),
                address: config.address,
                timeout: Duration::from_millis(config.timeout_ms),
                move_timeout: Duration::from_secs(config.move_timeout_s),
                port: Arc::new(Mutex::new(Some(port))),
            })
        }

        /// Home the plunger through `waste_port` and select the step resolution
        pub async fn initialize(&self, waste_port: u8, resolution: ResolutionMode) -> AppResult<()> {
            info!(port = %self.port_name, waste_port, ?resolution, "Initialising pump");
            self.command(&format!("B{}", waste_port)).await?;
            self.wait_ready().await?;
            self.command("Z").await?;
            self.wait_ready().await?;
            self.command(&format!("N{}", resolution.code())).await?;
            self.wait_ready().await
        }

        async fn command(&self, commands: &str) -> AppResult<Reply> {
            let reply = self.transaction(frame(self.address, commands)).await?;
            check_reply(reply)
        }

        async fn status(&self) -> AppResult<Reply> {
            let reply = self.transaction(query_frame(self.address)).await?;
            check_reply(reply)
        }

        /// Poll the status byte until the pump reports idle
        async fn wait_ready(&self) -> AppResult<()> {
            let start = Instant::now();
            loop {
                if self.status().await?.ready {
                    return Ok(());
                }
                if start.elapsed() > self.move_timeout {
                    return Err(DaqError::comm(format!(
                        "pump still busy after {:?}",
                        self.move_timeout
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        async fn transaction(&self, payload: String) -> AppResult<Reply> {
            let port = self.port.clone();
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> AppResult<Reply> {
                use std::io::{Read, Write};

                let mut guard = port.blocking_lock();
                let port = guard
                    .as_mut()
                    .ok_or_else(|| DaqError::comm("pump port not connected"))?;

                port.write_all(payload.as_bytes())
                    .map_err(|e| DaqError::comm(format!("pump write failed: {}", e)))?;
                port.flush()
                    .map_err(|e| DaqError::comm(format!("pump flush failed: {}", e)))?;
                debug!("Sent pump frame: {}", payload.trim());

                let mut response = Vec::with_capacity(32);
                let mut buffer = [0u8; 32];
                let start = Instant::now();
                loop {
                    if start.elapsed() > timeout {
                        return Err(DaqError::comm(format!(
                            "pump reply timeout after {:?}",
                            timeout
                        )));
                    }
                    match port.read(&mut buffer) {
                        Ok(0) => {
                            return Err(DaqError::comm("unexpected EOF from pump port"));
                        }
                        Ok(n) => {
                            response.extend_from_slice(&buffer[..n]);
                            if buffer[..n].contains(&ETX) {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            return Err(DaqError::comm(format!("pump read error: {}", e)));
                        }
                    }
                }

                debug!("Received pump reply: {:?}", String::from_utf8_lossy(&response));
                parse_reply(&response)
            })
            .await
            .map_err(|e| DaqError::comm(format!("pump I/O task failed: {}", e)))?
        }
    }

    #[async_trait]
    impl SyringeDriver for DtPump {
        fn name(&self) -> &str {
            &self.port_name
        }

        async fn set_valve(&self, port: u8) -> AppResult<()> {
            self.command(&format!("B{}", port)).await?;
            self.wait_ready().await
        }

        async fn move_absolute(&self, steps: u32, pulses_per_s: u32) -> AppResult<()> {
            self.command(&format!("V{}A{}", pulses_per_s, steps)).await?;
            self.wait_ready().await
        }

        async fn disconnect(&self) -> AppResult<()> {
            let mut guard = self.port.lock().await;
            if guard.take().is_some() {
                debug!("Pump port '{}' closed", self.port_name);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_format() {
        assert_eq!(frame(1, "B4"), "/1B4R\r");
        assert_eq!(frame(1, "V210A2700"), "/1V210A2700R\r");
        assert_eq!(frame(11, "Z"), "/BZR\r");
        assert_eq!(query_frame(1), "/1Q\r");
    }

    #[test]
    fn test_parse_idle_reply() {
        let reply = parse_reply(b"\xff/0`\x03\r\n").unwrap();
        assert!(reply.ready);
        assert_eq!(reply.error_code, 0);
        assert!(reply.data.is_empty());
    }

    #[test]
    fn test_parse_busy_reply_with_data() {
        let reply = parse_reply(b"/0@3000\x03\r\n").unwrap();
        assert!(!reply.ready);
        assert_eq!(reply.data, "3000");
    }

    #[test]
    fn test_error_code_is_reported() {
        // 'g' = 0x67: ready bit set, error 7
        let reply = parse_reply(b"/0g\x03\r\n").unwrap();
        assert_eq!(reply.error_code, 7);
        let err = check_reply(reply).unwrap_err();
        assert!(err.to_string().contains("device not initialized"));
    }

    #[test]
    fn test_malformed_replies() {
        assert!(parse_reply(b"garbage").is_err());
        assert!(parse_reply(b"/0`").is_err());
        assert!(parse_reply(b"/1`\x03").is_err());
    }
}
