use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bms3_bench::discovery::{discover_with_retry, DiscoveryConfig, PortDescriptor, RetryDecision};
use bms3_bench::multimeter::{
    FrameAssembler, MeasurementDecoder, MeasurementMode, MeterWorker, ReadError, ReportSource, FRAME_TAG,
};
use bms3_bench::relay_bank::RelayTiming;
use bms3_bench::{BenchError, BoardLabel, RelayBank, RelayState};

// Serial channel that keeps every written byte.
#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<u8>>>);

impl Wire {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Multimeter cable fed from the test through a channel.
struct ChannelSource {
    name: String,
    bursts: Receiver<Vec<u8>>,
}

impl ReportSource for ChannelSource {
    fn identity(&self) -> String {
        self.name.clone()
    }

    fn read_into(&mut self, assembler: &mut FrameAssembler) -> Result<(), ReadError> {
        match self.bursts.recv_timeout(Duration::from_millis(5)) {
            Ok(burst) => {
                assembler.push_bytes(&burst);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(ReadError::Transient),
            Err(RecvTimeoutError::Disconnected) => Err(ReadError::Fatal(String::from("cable unplugged"))),
        }
    }
}

fn meter(name: &str) -> (Sender<Vec<u8>>, ChannelSource) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        ChannelSource {
            name: name.to_string(),
            bursts: rx,
        },
    )
}

fn tagged(nibbles: &[u8]) -> Vec<u8> {
    nibbles.iter().flat_map(|&n| [FRAME_TAG, 0xB0 | n]).collect()
}

fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn ftdi(port: &str, serial: &str) -> PortDescriptor {
    PortDescriptor::new(port, format!("USB VID:PID=0403:6011 SER={}", serial))
}

#[test]
fn discovered_boards_are_driven_over_their_own_channels() {
    let mut scans = 0;
    let boards = discover_with_retry(
        || {
            scans += 1;
            if scans == 1 {
                Ok(vec![ftdi("/dev/ttyUSB0", "A5XK3RJa")])
            } else {
                Ok(vec![
                    ftdi("/dev/ttyUSB0", "A5XK3RJa"),
                    ftdi("/dev/ttyUSB1", "A5XK3RJb"),
                    PortDescriptor::new("/dev/ttyACM0", "USB VID:PID=0416:5011 SER=NT20091014"),
                    ftdi("/dev/ttyUSB2", "A5XK3RJc"),
                    ftdi("/dev/ttyUSB3", "A5XK3RJd"),
                ])
            }
        },
        &DiscoveryConfig::default(),
        3,
        |missing, _| {
            assert_eq!(missing.len(), 3);
            RetryDecision::Retry
        },
    )
    .unwrap();
    assert_eq!(boards.len(), 4);

    let wires: Vec<Wire> = boards.iter().map(|_| Wire::default()).collect();
    let channels = boards
        .iter()
        .zip(wires.iter())
        .map(|(board, wire)| (board.label.clone(), wire.clone()))
        .collect();
    let mut bank = RelayBank::connect(channels, RelayTiming::immediate()).unwrap();

    assert_eq!(bank.set_relay("c", 3, RelayState::Enable).unwrap(), 0xFB);
    assert_eq!(bank.set_relay("C", 5, RelayState::Enable).unwrap(), 0xEB);
    assert_eq!(bank.set_relay("C", 3, RelayState::Disable).unwrap(), 0xEF);
    assert!(matches!(
        bank.set_relay("E", 1, RelayState::Enable),
        Err(BenchError::InvalidAddress { .. })
    ));

    let masks = bank.masks();
    let c = BoardLabel::new("C").unwrap();
    assert!(masks.iter().all(|(label, command)| (*label == c) == (*command != 0xFF)));

    drop(bank);
    assert_eq!(wires[0].bytes(), vec![0x50, 0x51, 0xFF, 0xFF]);
    assert_eq!(wires[2].bytes(), vec![0x50, 0x51, 0xFF, 0xFB, 0xEB, 0xEF, 0xFF]);
}

#[test]
fn meter_readings_follow_the_stream() {
    let (volts_tx, volts) = meter("voltmeter");
    let (amps_tx, amps) = meter("ammeter");
    let voltmeter = MeterWorker::spawn(volts, MeasurementDecoder::default()).unwrap();
    let ammeter = MeterWorker::spawn(amps, MeasurementDecoder::default()).unwrap();

    // Half a frame, then the rest with the start of the next one.
    let frame = tagged(&[0, 3, 3, 0, 0, 1, 1, 0, 0, 13, 10]);
    volts_tx.send(frame[..9].to_vec()).unwrap();
    let mut rest = frame[9..].to_vec();
    rest.extend(tagged(&[0, 0]));
    volts_tx.send(rest).unwrap();

    // -4.2 mA: range 2 auto-ranges "0.0042" up by a thousand.
    amps_tx.send(tagged(&[0, 0, 0, 4, 2, 2, 8, 0, 4, 13, 10])).unwrap();

    let first_volts = voltmeter.wait_for_first(Duration::from_secs(5)).unwrap();
    assert_eq!(first_volts.measurement.mode, MeasurementMode::Voltage);
    assert!((first_volts.measurement.value - 0.33).abs() < 1e-9);

    let first_amps = ammeter.wait_for_first(Duration::from_secs(5)).unwrap();
    assert_eq!(first_amps.measurement.mode, MeasurementMode::Current);
    assert!((first_amps.measurement.value + 4.2).abs() < 1e-9);

    // Completes the frame started above; an overflowed display reads as zero.
    volts_tx.send(tagged(&[0xA, 0, 0, 1, 1, 0, 0, 13, 10])).unwrap();
    assert!(eventually(|| voltmeter.latest().map_or(false, |s| s.sequence == 1)));
    let over = voltmeter.measurement().unwrap();
    assert!(over.overflow);
    assert_eq!(over.value, 0.0);

    drop(amps_tx);
    assert!(eventually(|| !ammeter.is_running()));
    assert!(matches!(ammeter.fault(), Some(BenchError::TransportFatal { ref device, .. }) if device == "ammeter"));
    assert!(voltmeter.is_running());
    assert!(voltmeter.fault().is_none());

    voltmeter.join();
}
