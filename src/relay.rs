//! Relay command encoding.
//!
//! Each control relay board drives eight relays from a single command byte.
//! Bit `relay - 1` of that byte is cleared to energise the relay and set to
//! release it, so `0xFF` means every relay is off.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Command byte with every relay released.
pub const ALL_OFF: u8 = 0xFF;

/// Bytes the board expects, in order, before it accepts relay masks.
pub const HANDSHAKE: [u8; 2] = [0x50, 0x51];

/// Relay boards talk 9600 baud, 8 data bits, no parity, 1 stop bit.
pub const BAUD_RATE: u32 = 9600;

pub const RELAYS_PER_BOARD: u8 = 8;

// Requested state of a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    Enable,
    Disable,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Enable => f.pad("Enable"),
            RelayState::Disable => f.pad("Disable"),
        }
    }
}

/// Uppercase label identifying one relay board ("A", "B", ... or "AB", "AC", ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoardLabel(String);

impl BoardLabel {
    /// Builds a label from any text, normalising it to uppercase.
    pub fn new(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.is_empty() {
            return None;
        }
        Some(Self(label.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of characters in the label.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BoardLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BoardLabel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        BoardLabel::new(&value).ok_or_else(|| String::from("board label cannot be empty"))
    }
}

impl From<BoardLabel> for String {
    fn from(label: BoardLabel) -> Self {
        label.0
    }
}

/// Returns `command` with the bit for `relay` (1..=8) updated for `state`.
///
/// The caller is responsible for range-checking `relay`.
pub fn apply_state(command: u8, relay: u8, state: RelayState) -> u8 {
    let mask = 1u8 << (relay - 1);
    match state {
        RelayState::Enable => command & !mask,
        RelayState::Disable => command | mask,
    }
}

/// Keeps the current command byte of every known board.
///
/// Not thread-safe: callers sharing an encoder across threads must serialise access.
#[derive(Debug, Clone, Default)]
pub struct RelayCommandEncoder {
    commands: BTreeMap<BoardLabel, u8>,
}

impl RelayCommandEncoder {
    /// Creates an encoder for `labels`, every board starting with all relays off.
    pub fn new<I>(labels: I) -> Self
    where
        I: IntoIterator<Item = BoardLabel>,
    {
        Self {
            commands: labels.into_iter().map(|label| (label, ALL_OFF)).collect(),
        }
    }

    /// Updates one relay and returns the byte that must be sent to its board.
    pub fn set_relay(&mut self, board: &str, relay: u8, state: RelayState) -> Result<u8> {
        let invalid = || BenchError::InvalidAddress {
            board: board.to_string(),
            relay,
        };

        if !(1..=RELAYS_PER_BOARD).contains(&relay) {
            return Err(invalid());
        }
        let label = BoardLabel::new(board).ok_or_else(invalid)?;
        let command = self.commands.get_mut(&label).ok_or_else(invalid)?;

        *command = apply_state(*command, relay, state);
        Ok(*command)
    }

    /// Releases every relay of `board` and returns `ALL_OFF`.
    pub fn reset_board(&mut self, board: &str) -> Result<u8> {
        let command = BoardLabel::new(board)
            .and_then(|label| self.commands.get_mut(&label))
            .ok_or_else(|| BenchError::InvalidAddress {
                board: board.to_string(),
                relay: 0,
            })?;
        *command = ALL_OFF;
        Ok(ALL_OFF)
    }

    /// Current command byte of `board`, if the board is known.
    pub fn command(&self, board: &str) -> Option<u8> {
        BoardLabel::new(board).and_then(|label| self.commands.get(&label).copied())
    }

    /// Known boards, in label order.
    pub fn boards(&self) -> impl Iterator<Item = &BoardLabel> {
        self.commands.keys()
    }

    /// Label and current command byte of every board.
    pub fn masks(&self) -> Vec<(BoardLabel, u8)> {
        self.commands
            .iter()
            .map(|(label, command)| (label.clone(), *command))
            .collect()
    }
}
