//! Serial channels of the connected relay boards.

use std::collections::BTreeMap;
use std::io::Write;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::config::millis;
use crate::discovery::DiscoveredBoard;
use crate::error::{BenchError, Result};
use crate::relay::{BoardLabel, RelayCommandEncoder, RelayState, ALL_OFF, BAUD_RATE, HANDSHAKE};

// Delays the board firmware needs between bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTiming {
    /// Pause after opening a port.
    #[serde(with = "millis")]
    pub open_delay: Duration,
    /// Pause after each handshake byte.
    #[serde(with = "millis")]
    pub handshake_delay: Duration,
    /// Pause after each relay command.
    #[serde(with = "millis")]
    pub command_delay: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            open_delay: Duration::from_millis(500),
            handshake_delay: Duration::from_millis(100),
            command_delay: Duration::from_millis(100),
        }
    }
}

impl RelayTiming {
    /// No delays at all, for channels that are not real boards.
    pub fn immediate() -> Self {
        Self {
            open_delay: Duration::ZERO,
            handshake_delay: Duration::ZERO,
            command_delay: Duration::ZERO,
        }
    }
}

/// The relay boards of the bench and the command byte each one holds.
///
/// Commands are written blindly: boards never acknowledge, so a byte lost on the
/// line goes unnoticed. Every board is released (`0xFF`) when the bank is dropped.
pub struct RelayBank<W: Write> {
    encoder: RelayCommandEncoder,
    channels: BTreeMap<BoardLabel, W>,
    timing: RelayTiming,
}

impl RelayBank<Box<dyn SerialPort>> {
    /// Opens the serial port of every discovered board and wakes the boards up.
    pub fn open(boards: &[DiscoveredBoard], timing: RelayTiming) -> Result<Self> {
        let mut channels = Vec::with_capacity(boards.len());
        for board in boards {
            let port = serialport::new(&board.port.port_name, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .timeout(Duration::from_secs(1))
                .open()?;
            info!(board = %board.label, port = %board.port.port_name, baud = BAUD_RATE, "relay port opened");
            thread::sleep(timing.open_delay);
            channels.push((board.label.clone(), port));
        }
        Self::connect(channels, timing)
    }
}

impl<W: Write> RelayBank<W> {
    /// Runs the configuration handshake on every channel and releases all relays.
    pub fn connect(boards: Vec<(BoardLabel, W)>, timing: RelayTiming) -> Result<Self> {
        let mut channels = BTreeMap::new();
        for (label, channel) in boards {
            if channels.insert(label.clone(), channel).is_some() {
                return Err(BenchError::Config(format!("relay board {} given twice", label)));
            }
        }

        let mut bank = Self {
            encoder: RelayCommandEncoder::new(channels.keys().cloned()),
            channels,
            timing,
        };

        let labels: Vec<BoardLabel> = bank.channels.keys().cloned().collect();
        for label in &labels {
            bank.handshake(label)?;
        }
        Ok(bank)
    }

    fn handshake(&mut self, label: &BoardLabel) -> Result<()> {
        let delay = self.timing.handshake_delay;
        let channel = self.channel(label)?;
        for byte in HANDSHAKE {
            channel.write_all(&[byte])?;
            channel.flush()?;
            thread::sleep(delay);
        }
        channel.write_all(&[ALL_OFF])?;
        channel.flush()?;
        info!(board = %label, "relay board configured");
        Ok(())
    }

    fn channel(&mut self, label: &BoardLabel) -> Result<&mut W> {
        self.channels
            .get_mut(label)
            .ok_or_else(|| BenchError::InvalidAddress {
                board: label.to_string(),
                relay: 0,
            })
    }

    fn send(&mut self, label: &BoardLabel, command: u8) -> Result<()> {
        let channel = self.channel(label)?;
        channel.write_all(&[command])?;
        channel.flush()?;
        Ok(())
    }

    /// Switches one relay and writes the board's new command byte.
    ///
    /// The board's command byte only changes once the write went through.
    pub fn set_relay(&mut self, board: &str, relay: u8, state: RelayState) -> Result<u8> {
        let mut pending = self.encoder.clone();
        let command = pending.set_relay(board, relay, state)?;
        let label = BoardLabel::new(board).ok_or_else(|| BenchError::InvalidAddress {
            board: board.to_string(),
            relay,
        })?;
        self.send(&label, command)?;
        self.encoder = pending;
        debug!(board = %label, relay, state = %state, command = format_args!("{:#04X}", command), "relay command sent");
        thread::sleep(self.timing.command_delay);
        Ok(command)
    }

    /// Releases every relay of one board.
    pub fn reset_board(&mut self, board: &str) -> Result<()> {
        let mut pending = self.encoder.clone();
        let command = pending.reset_board(board)?;
        let label = BoardLabel::new(board).ok_or_else(|| BenchError::InvalidAddress {
            board: board.to_string(),
            relay: 0,
        })?;
        self.send(&label, command)?;
        self.encoder = pending;
        thread::sleep(self.timing.command_delay);
        Ok(())
    }

    /// Releases every relay of every board.
    pub fn reset_all(&mut self) -> Result<()> {
        let labels: Vec<BoardLabel> = self.channels.keys().cloned().collect();
        for label in labels {
            self.reset_board(label.as_str())?;
        }
        Ok(())
    }

    /// Current command byte of every board.
    pub fn masks(&self) -> Vec<(BoardLabel, u8)> {
        self.encoder.masks()
    }

    pub fn command(&self, board: &str) -> Option<u8> {
        self.encoder.command(board)
    }

    pub fn boards(&self) -> impl Iterator<Item = &BoardLabel> {
        self.channels.keys()
    }
}

impl<W: Write> Drop for RelayBank<W> {
    fn drop(&mut self) {
        for (label, channel) in self.channels.iter_mut() {
            let result = channel.write_all(&[ALL_OFF]).and_then(|_| channel.flush());
            match result {
                Ok(()) => info!(board = %label, "relay board released"),
                Err(e) => warn!(board = %label, error = %e, "failed to release relay board"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::rc::Rc;

    // A channel that records every byte written to it, readable after the bank is gone.
    #[derive(Clone, Default)]
    struct Line {
        written: Rc<RefCell<Vec<u8>>>,
        unplugged: Rc<Cell<bool>>,
    }

    impl Line {
        fn bytes(&self) -> Vec<u8> {
            self.written.borrow().clone()
        }

        fn unplug(&self, unplugged: bool) {
            self.unplugged.set(unplugged);
        }
    }

    impl Write for Line {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.unplugged.get() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn label(name: &str) -> BoardLabel {
        BoardLabel::new(name).unwrap()
    }

    fn bank(names: &[&str]) -> (RelayBank<Line>, Vec<Line>) {
        let lines: Vec<Line> = names.iter().map(|_| Line::default()).collect();
        let boards = names
            .iter()
            .zip(lines.iter())
            .map(|(name, line)| (label(name), line.clone()))
            .collect();
        let bank = RelayBank::connect(boards, RelayTiming::immediate()).unwrap();
        (bank, lines)
    }

    #[test]
    fn connect_sends_handshake_then_all_off() {
        let (_bank, lines) = bank(&["A", "B"]);
        for line in &lines {
            assert_eq!(line.bytes(), vec![0x50, 0x51, 0xFF]);
        }
    }

    #[test]
    fn set_relay_writes_one_byte_to_its_board_only() {
        let (mut bank, lines) = bank(&["C", "D"]);
        assert_eq!(bank.set_relay("D", 1, RelayState::Enable).unwrap(), 0xFE);
        assert_eq!(bank.set_relay("D", 2, RelayState::Enable).unwrap(), 0xFC);
        assert_eq!(lines[0].bytes(), vec![0x50, 0x51, 0xFF]);
        assert_eq!(lines[1].bytes(), vec![0x50, 0x51, 0xFF, 0xFE, 0xFC]);
        assert_eq!(bank.command("D"), Some(0xFC));
    }

    #[test]
    fn address_errors_do_not_write() {
        let (mut bank, lines) = bank(&["A"]);
        assert!(matches!(
            bank.set_relay("A", 9, RelayState::Enable),
            Err(BenchError::InvalidAddress { .. })
        ));
        assert!(matches!(
            bank.set_relay("B", 1, RelayState::Enable),
            Err(BenchError::InvalidAddress { .. })
        ));
        assert_eq!(lines[0].bytes().len(), 3);
    }

    #[test]
    fn reset_all_releases_every_board() {
        let (mut bank, lines) = bank(&["A", "B"]);
        bank.set_relay("A", 8, RelayState::Enable).unwrap();
        bank.reset_all().unwrap();
        assert_eq!(lines[0].bytes(), vec![0x50, 0x51, 0xFF, 0x7F, 0xFF]);
        assert_eq!(lines[1].bytes(), vec![0x50, 0x51, 0xFF, 0xFF]);
        assert!(bank.masks().iter().all(|(_, command)| *command == ALL_OFF));
    }

    #[test]
    fn drop_releases_every_board() {
        let (mut bank, lines) = bank(&["A", "B"]);
        bank.set_relay("B", 4, RelayState::Enable).unwrap();
        drop(bank);
        assert_eq!(lines[0].bytes(), vec![0x50, 0x51, 0xFF, 0xFF]);
        assert_eq!(lines[1].bytes(), vec![0x50, 0x51, 0xFF, 0xF7, 0xFF]);
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let boards = vec![(label("A"), Line::default()), (label("a"), Line::default())];
        assert!(matches!(
            RelayBank::connect(boards, RelayTiming::immediate()),
            Err(BenchError::Config(_))
        ));
    }

    #[test]
    fn failed_write_keeps_previous_command() {
        let (mut bank, lines) = bank(&["A"]);
        bank.set_relay("A", 2, RelayState::Enable).unwrap();

        lines[0].unplug(true);
        assert!(matches!(bank.set_relay("A", 5, RelayState::Enable), Err(BenchError::Io(_))));
        assert_eq!(bank.command("A"), Some(0xFD));
        assert!(matches!(bank.reset_board("A"), Err(BenchError::Io(_))));
        assert_eq!(bank.command("A"), Some(0xFD));

        // The next change starts from what the board last received.
        lines[0].unplug(false);
        assert_eq!(bank.set_relay("A", 1, RelayState::Enable).unwrap(), 0xFC);
        assert_eq!(lines[0].bytes(), vec![0x50, 0x51, 0xFF, 0xFD, 0xFC]);
    }
}
