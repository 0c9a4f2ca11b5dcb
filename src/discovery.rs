//! Relay board discovery.
//!
//! All relay boards sit behind the same USB-to-serial bridge, so the VID:PID only
//! tells us a port belongs to the bench. The board itself is identified by the
//! last characters of the port's hardware-ID string.

use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::relay::BoardLabel;

// A serial port as seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub port_name: String,
    pub hardware_id: String,
}

impl PortDescriptor {
    pub fn new(port_name: impl Into<String>, hardware_id: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            hardware_id: hardware_id.into(),
        }
    }
}

impl From<&SerialPortInfo> for PortDescriptor {
    fn from(info: &SerialPortInfo) -> Self {
        let hardware_id = match &info.port_type {
            SerialPortType::UsbPort(usb) => format!(
                "USB VID:PID={:04X}:{:04X} SER={}",
                usb.vid,
                usb.pid,
                usb.serial_number.as_deref().unwrap_or("")
            ),
            _ => String::from("n/a"),
        };
        Self::new(info.port_name.clone(), hardware_id)
    }
}

// How boards are picked out of the list of serial ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Pattern every relay board port carries in its hardware ID.
    pub vid_pid: String,
    /// Number of trailing hardware-ID characters forming the board label.
    pub suffix_len: usize,
    /// Boards that must be present.
    pub labels: Vec<BoardLabel>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            vid_pid: String::from("VID:PID=0403:6011"),
            suffix_len: 1,
            labels: ["A", "B", "C", "D"]
                .iter()
                .filter_map(|l| BoardLabel::new(l))
                .collect(),
        }
    }
}

/// A configured board bound to the port it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBoard {
    pub label: BoardLabel,
    pub port: PortDescriptor,
}

/// Operator answer after a failed discovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// Uppercased tail of `hardware_id`, `suffix_len` characters long.
pub fn label_of(hardware_id: &str, suffix_len: usize) -> Option<BoardLabel> {
    let chars: Vec<char> = hardware_id.trim_end().chars().collect();
    if suffix_len == 0 || chars.len() < suffix_len {
        return None;
    }
    let tail: String = chars[chars.len() - suffix_len..].iter().collect();
    BoardLabel::new(&tail)
}

/// Binds every configured label to exactly one port.
pub fn match_boards(ports: &[PortDescriptor], config: &DiscoveryConfig) -> Result<Vec<DiscoveredBoard>> {
    let pattern = config.vid_pid.to_uppercase();
    let candidates: Vec<&PortDescriptor> = ports
        .iter()
        .filter(|port| port.hardware_id.to_uppercase().contains(&pattern))
        .collect();
    debug!(candidates = candidates.len(), pattern = %pattern, "scanning relay board ports");

    let mut found = Vec::with_capacity(config.labels.len());
    let mut missing = Vec::new();

    for label in &config.labels {
        let matching: Vec<&PortDescriptor> = candidates
            .iter()
            .copied()
            .filter(|port| label_of(&port.hardware_id, config.suffix_len).as_ref() == Some(label))
            .collect();

        match matching.as_slice() {
            [] => missing.push(label.clone()),
            [port] => found.push(DiscoveredBoard {
                label: label.clone(),
                port: (*port).clone(),
            }),
            several => {
                return Err(BenchError::DuplicateBoard {
                    label: label.clone(),
                    ports: several.iter().map(|p| p.port_name.clone()).collect(),
                })
            }
        }
    }

    if !missing.is_empty() {
        return Err(BenchError::BoardsNotFound { missing });
    }

    for board in &found {
        info!(board = %board.label, port = %board.port.port_name, "relay board found");
    }
    Ok(found)
}

/// Runs `match_boards` until every board is found or the operator gives up.
///
/// `scan` lists the ports for each attempt. `on_missing` is told which labels are
/// missing and which attempt failed (starting at 1); it is not called after the
/// last attempt.
pub fn discover_with_retry<S, F>(
    mut scan: S,
    config: &DiscoveryConfig,
    max_attempts: usize,
    mut on_missing: F,
) -> Result<Vec<DiscoveredBoard>>
where
    S: FnMut() -> Result<Vec<PortDescriptor>>,
    F: FnMut(&[BoardLabel], usize) -> RetryDecision,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let ports = scan()?;
        match match_boards(&ports, config) {
            Err(BenchError::BoardsNotFound { missing }) if attempt < max_attempts => {
                warn!(attempt, missing = ?missing, "relay boards missing");
                if on_missing(&missing, attempt) == RetryDecision::Abort {
                    return Err(BenchError::BoardsNotFound { missing });
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Lists the serial ports currently attached to the host.
pub fn scan_serial_ports() -> Result<Vec<PortDescriptor>> {
    let ports = serialport::available_ports()?;
    Ok(ports.iter().map(PortDescriptor::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ftdi(port: &str, serial: &str) -> PortDescriptor {
        PortDescriptor::new(port, format!("USB VID:PID=0403:6011 SER={}", serial))
    }

    fn bench_ports() -> Vec<PortDescriptor> {
        vec![
            ftdi("COM7", "FT5Q2B3c"),
            PortDescriptor::new("COM3", "USB VID:PID=0416:5011 SER=NT2009101400"),
            ftdi("COM5", "FT5Q2B3a"),
            ftdi("COM8", "FT5Q2B3D"),
            ftdi("COM6", "FT5Q2B3B"),
        ]
    }

    // --- Tests for suffix labels ---

    #[test]
    fn label_is_uppercased_tail() {
        assert_eq!(label_of("USB VID:PID=0403:6011 SER=FT5Q2B3a", 1).unwrap().as_str(), "A");
        assert_eq!(label_of("USB VID:PID=0403:6011 SER=FT5Q2Bac", 2).unwrap().as_str(), "AC");
        assert!(label_of("A", 2).is_none());
        assert!(label_of("ABC", 0).is_none());
    }

    // --- Tests for board matching ---

    #[test]
    fn each_label_binds_to_its_port() {
        let boards = match_boards(&bench_ports(), &DiscoveryConfig::default()).unwrap();
        let bound: Vec<(&str, &str)> = boards
            .iter()
            .map(|b| (b.label.as_str(), b.port.port_name.as_str()))
            .collect();
        assert_eq!(bound, vec![("A", "COM5"), ("B", "COM6"), ("C", "COM7"), ("D", "COM8")]);
    }

    #[test]
    fn no_port_is_bound_twice() {
        let boards = match_boards(&bench_ports(), &DiscoveryConfig::default()).unwrap();
        let mut ports: Vec<&str> = boards.iter().map(|b| b.port.port_name.as_str()).collect();
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), boards.len());
    }

    #[test]
    fn two_character_suffixes() {
        let ports = vec![
            ftdi("/dev/ttyUSB0", "A600AB"),
            ftdi("/dev/ttyUSB1", "A600ac"),
            ftdi("/dev/ttyUSB2", "A600AD"),
        ];
        let config = DiscoveryConfig {
            suffix_len: 2,
            labels: ["AB", "AC", "AD"].iter().filter_map(|l| BoardLabel::new(l)).collect(),
            ..DiscoveryConfig::default()
        };
        let boards = match_boards(&ports, &config).unwrap();
        assert_eq!(boards[1].label.as_str(), "AC");
        assert_eq!(boards[1].port.port_name, "/dev/ttyUSB1");
    }

    #[test]
    fn ports_with_other_vid_pid_are_ignored() {
        // The power supply serial ends in '0' and would never match, but one ending
        // in 'A' must be ignored too.
        let ports = vec![
            PortDescriptor::new("COM3", "USB VID:PID=0416:5011 SER=XA"),
            ftdi("COM5", "FTB"),
        ];
        let config = DiscoveryConfig {
            labels: vec![BoardLabel::new("A").unwrap(), BoardLabel::new("B").unwrap()],
            ..DiscoveryConfig::default()
        };
        let err = match_boards(&ports, &config).unwrap_err();
        assert!(matches!(err, BenchError::BoardsNotFound { ref missing } if missing.len() == 1 && missing[0].as_str() == "A"));
    }

    #[test]
    fn missing_boards_are_listed_exactly() {
        let ports = vec![ftdi("COM5", "FTA"), ftdi("COM7", "FTC")];
        let err = match_boards(&ports, &DiscoveryConfig::default()).unwrap_err();
        match err {
            BenchError::BoardsNotFound { missing } => {
                let names: Vec<&str> = missing.iter().map(BoardLabel::as_str).collect();
                assert_eq!(names, vec!["B", "D"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut ports = bench_ports();
        ports.push(ftdi("COM9", "OTHERA"));
        let err = match_boards(&ports, &DiscoveryConfig::default()).unwrap_err();
        match err {
            BenchError::DuplicateBoard { label, ports } => {
                assert_eq!(label.as_str(), "A");
                assert_eq!(ports, vec!["COM5".to_string(), "COM9".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // --- Tests for retry loop ---

    #[test]
    fn retry_until_boards_appear() {
        let scans = Cell::new(0);
        let prompts = Cell::new(0);
        let boards = discover_with_retry(
            || {
                scans.set(scans.get() + 1);
                if scans.get() < 3 {
                    Ok(vec![ftdi("COM5", "FTA")])
                } else {
                    Ok(bench_ports())
                }
            },
            &DiscoveryConfig::default(),
            5,
            |missing, attempt| {
                assert_eq!(missing.len(), 3);
                assert_eq!(attempt, prompts.get() + 1);
                prompts.set(prompts.get() + 1);
                RetryDecision::Retry
            },
        )
        .unwrap();
        assert_eq!(boards.len(), 4);
        assert_eq!(scans.get(), 3);
        assert_eq!(prompts.get(), 2);
    }

    #[test]
    fn retry_is_bounded() {
        let scans = Cell::new(0);
        let prompts = Cell::new(0);
        let result = discover_with_retry(
            || {
                scans.set(scans.get() + 1);
                Ok(Vec::new())
            },
            &DiscoveryConfig::default(),
            3,
            |_, _| {
                prompts.set(prompts.get() + 1);
                RetryDecision::Retry
            },
        );
        assert!(matches!(result, Err(BenchError::BoardsNotFound { ref missing }) if missing.len() == 4));
        assert_eq!(scans.get(), 3);
        assert_eq!(prompts.get(), 2);
    }

    #[test]
    fn operator_can_abort() {
        let scans = Cell::new(0);
        let result = discover_with_retry(
            || {
                scans.set(scans.get() + 1);
                Ok(Vec::new())
            },
            &DiscoveryConfig::default(),
            10,
            |_, _| RetryDecision::Abort,
        );
        assert!(matches!(result, Err(BenchError::BoardsNotFound { .. })));
        assert_eq!(scans.get(), 1);
    }
}
