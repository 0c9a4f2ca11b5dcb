//! Programmable DC power supply.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::config::millis;
use crate::error::{BenchError, Result};

/// Operations the bench needs from a bench power supply.
pub trait PowerSupply {
    /// Sets the output voltage and returns the value actually applied, in mV.
    fn set_voltage_mv(&mut self, millivolts: u32) -> Result<u32>;
    /// Sets the current limit and returns the value actually applied, in mA.
    fn set_current_ma(&mut self, milliamps: u32) -> Result<u32>;
    fn set_output(&mut self, on: bool) -> Result<()>;
    /// Output current as measured by the supply, in mA.
    fn read_current_ma(&mut self) -> Result<f64>;
}

// Safety limits for the board under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyLimits {
    pub max_voltage_mv: u32,
    pub max_current_ma: u32,
    /// Pause after every setting so the output can settle.
    #[serde(with = "millis")]
    pub settle: Duration,
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self {
            max_voltage_mv: 3500,
            max_current_ma: 60,
            settle: Duration::from_millis(1500),
        }
    }
}

const BAUD_RATE: u32 = 9600;
const CURRENT_REPLY_LEN: usize = 5;

/// Tenma 72-series supply speaking its ASCII command set over a serial line.
///
/// The output is switched off when the value is dropped.
pub struct Tenma72<T: Read + Write> {
    port: T,
    channel: u8,
    limits: SupplyLimits,
    output: bool,
}

impl Tenma72<Box<dyn SerialPort>> {
    pub fn open(port_name: &str, limits: SupplyLimits) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(Duration::from_millis(500))
            .open()?;
        info!(port = port_name, "power supply opened");
        Ok(Self::new(port, limits))
    }
}

impl<T: Read + Write> Tenma72<T> {
    pub fn new(port: T, limits: SupplyLimits) -> Self {
        Self {
            port,
            channel: 1,
            limits,
            output: false,
        }
    }

    pub fn limits(&self) -> &SupplyLimits {
        &self.limits
    }

    pub fn is_on(&self) -> bool {
        self.output
    }

    fn send(&mut self, command: &str) -> Result<()> {
        debug!(command, "power supply command");
        self.port.write_all(command.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_reply(&mut self, len: usize) -> Result<String> {
        let mut reply = Vec::with_capacity(len);
        let mut buf = [0u8; 16];
        while reply.len() < len {
            let wanted = (len - reply.len()).min(buf.len());
            match self.port.read(&mut buf[..wanted]) {
                Ok(0) => break,
                Ok(n) => reply.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }
}

impl<T: Read + Write> PowerSupply for Tenma72<T> {
    fn set_voltage_mv(&mut self, millivolts: u32) -> Result<u32> {
        // The supply works in 10 mV steps.
        let applied = millivolts.min(self.limits.max_voltage_mv) / 10 * 10;
        let command = format!("VSET{}:{}.{:02}", self.channel, applied / 1000, applied % 1000 / 10);
        self.send(&command)?;
        thread::sleep(self.limits.settle);
        Ok(applied)
    }

    fn set_current_ma(&mut self, milliamps: u32) -> Result<u32> {
        let applied = milliamps.min(self.limits.max_current_ma);
        let command = format!("ISET{}:{}.{:03}", self.channel, applied / 1000, applied % 1000);
        self.send(&command)?;
        thread::sleep(self.limits.settle);
        Ok(applied)
    }

    fn set_output(&mut self, on: bool) -> Result<()> {
        self.send(if on { "OUT1" } else { "OUT0" })?;
        self.output = on;
        info!(on, "power supply output");
        Ok(())
    }

    fn read_current_ma(&mut self) -> Result<f64> {
        self.send(&format!("IOUT{}?", self.channel))?;
        let reply = self.read_reply(CURRENT_REPLY_LEN)?;
        let amps: f64 = reply
            .parse()
            .map_err(|_| BenchError::Instrument(format!("unexpected current reply '{}'", reply)))?;
        Ok(amps * 1000.0)
    }
}

impl<T: Read + Write> Drop for Tenma72<T> {
    fn drop(&mut self) {
        if self.output {
            if let Err(e) = self.send("OUT0") {
                warn!(error = %e, "failed to switch power supply off");
            }
        }
    }
}
