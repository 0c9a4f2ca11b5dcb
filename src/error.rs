use thiserror::Error;

use crate::relay::BoardLabel;

// Errors raised by the bench instruments.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Relay number outside 1..=8, or a board label that is not connected.
    #[error("invalid relay address: board '{board}', relay {relay}")]
    InvalidAddress { board: String, relay: u8 },

    /// One or more configured relay boards have no matching serial device.
    #[error("failed to connect to control relay board {}", join_labels(.missing))]
    BoardsNotFound { missing: Vec<BoardLabel> },

    /// The same board label was read from more than one serial device.
    #[error("relay board {label} found on several ports: {}", .ports.join(", "))]
    DuplicateBoard { label: BoardLabel, ports: Vec<String> },

    /// Unrecoverable I/O failure on an instrument channel.
    #[error("transport failure on device {device}: {message}")]
    TransportFatal { device: String, message: String },

    /// The instrument answered with something we cannot interpret.
    #[error("instrument error: {0}")]
    Instrument(String),

    /// The result log cannot take more rows.
    #[error("result log error: {0}")]
    Logger(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),
}

pub type Result<T> = std::result::Result<T, BenchError>;

// "A", "A and B", "A, B and C".
fn join_labels(labels: &[BoardLabel]) -> String {
    match labels {
        [] => String::new(),
        [only] => only.to_string(),
        [init @ .., last] => {
            let head: Vec<String> = init.iter().map(ToString::to_string).collect();
            format!("{} and {}", head.join(", "), last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<BoardLabel> {
        names.iter().map(|n| BoardLabel::new(n).unwrap()).collect()
    }

    #[test]
    fn missing_boards_are_enumerated() {
        let err = BenchError::BoardsNotFound { missing: labels(&["C"]) };
        assert_eq!(err.to_string(), "failed to connect to control relay board C");

        let err = BenchError::BoardsNotFound { missing: labels(&["A", "D"]) };
        assert_eq!(err.to_string(), "failed to connect to control relay board A and D");

        let err = BenchError::BoardsNotFound { missing: labels(&["A", "B", "C", "D"]) };
        assert_eq!(
            err.to_string(),
            "failed to connect to control relay board A, B, C and D"
        );
    }

    #[test]
    fn invalid_address_names_board_and_relay() {
        let err = BenchError::InvalidAddress { board: "E".into(), relay: 9 };
        assert_eq!(err.to_string(), "invalid relay address: board 'E', relay 9");
    }
}
