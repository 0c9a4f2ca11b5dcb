//! # BMS3 Bench Library
//!
//! Instrument control for the BMS3 production test bench. The library drives the
//! serial control relay boards that route signals to the board under test, reads
//! the bench multimeters on background threads, and talks to the power supply,
//! the firmware programmer and the result log.
//!
//! Relay boards are found by scanning serial ports ([`discovery`]), woken up and
//! driven through a [`relay_bank::RelayBank`]; every relay update resends the full
//! command byte of its board ([`relay`]). Multimeters stream tagged reports that
//! are reassembled into frames and decoded into measurements ([`multimeter`]).

pub mod config;
pub mod discovery;
pub mod error;
pub mod flasher;
pub mod logger;
pub mod logging;
pub mod monitor;
pub mod multimeter;
pub mod power_supply;
pub mod relay;
pub mod relay_bank;

pub use config::BenchConfig;
pub use error::{BenchError, Result};
pub use relay::{BoardLabel, RelayCommandEncoder, RelayState};
pub use relay_bank::RelayBank;
