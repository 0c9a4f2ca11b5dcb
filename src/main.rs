use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use bms3_bench::config::BenchConfig;
use bms3_bench::discovery::{self, RetryDecision};
use bms3_bench::flasher::{ExternalFlasher, FlashOutcome, Flasher};
use bms3_bench::logger::{CsvLogger, ResultLogger};
use bms3_bench::multimeter::MeterHandle;
use bms3_bench::power_supply::{PowerSupply, Tenma72};
use bms3_bench::relay::RELAYS_PER_BOARD;
use bms3_bench::{logging, monitor, BenchError, RelayBank, RelayState};
use serialport::SerialPort;
use tracing::{info, warn};

type SerialBank = RelayBank<Box<dyn SerialPort>>;

const RESULT_LOG: &str = "bench_results.csv";
const SHEET_NAME: &str = "BMS3";
// Step, description, measurement, verdict.
const RESULT_COLUMN_WIDTHS: [f64; 4] = [5.0, 35.0, 15.0, 75.0];

// Operator menu of the BMS3 bench.
fn main() {
    println!("=========================");
    println!("    BMS3 Test Bench      ");
    println!("=========================");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match BenchConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init(&config.log_level) {
        eprintln!("[WARNING] {}", e);
    }

    let mut bank: Option<SerialBank> = None;
    let mut results: Option<CsvLogger> = None;

    loop {
        println!("\nSelect mode:");
        println!("  1. Relay Board Smoke Test");
        println!("  2. Manual Relay Control");
        println!("  3. Live Monitor");
        println!("  4. Power Supply Check");
        println!("  5. Flash Firmware");
        println!("  6. Exit");

        let Some(choice) = prompt("> ") else { break };
        match choice.as_str() {
            "1" => {
                if let Some(bank) = connected(&mut bank, &config) {
                    run_smoke_test(bank);
                }
            }
            "2" => {
                if let Some(bank) = connected(&mut bank, &config) {
                    run_manual_mode(bank);
                }
            }
            "3" => run_monitor(bank.as_ref(), &config),
            "4" => run_supply_check(&config, &mut results),
            "5" => run_flash(&config, &mut results),
            "6" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter a number from 1 to 6."),
        }
    }

    if let Some(mut logger) = results {
        match logger.finalize(SHEET_NAME) {
            Ok(path) => println!("Results saved to {}", path.display()),
            Err(e) => eprintln!("[ERROR] {}", e),
        }
    }
    // Dropping the bank releases every relay.
}

// Prints `message` and reads one trimmed line; `None` on end of input.
fn prompt(message: &str) -> Option<String> {
    print!("{}", message);
    if io::stdout().flush().is_err() {
        return None;
    }
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

// Connects the relay boards on first use.
fn connected<'a>(bank: &'a mut Option<SerialBank>, config: &BenchConfig) -> Option<&'a mut SerialBank> {
    if bank.is_none() {
        match connect_relays(config) {
            Ok(connected) => *bank = Some(connected),
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                return None;
            }
        }
    }
    bank.as_mut()
}

fn connect_relays(config: &BenchConfig) -> bms3_bench::Result<SerialBank> {
    let boards = discovery::discover_with_retry(
        discovery::scan_serial_ports,
        &config.relay.discovery,
        config.relay.discovery_attempts,
        |missing, attempt| {
            let names: Vec<&str> = missing.iter().map(|l| l.as_str()).collect();
            eprintln!("[WARNING] Relay board(s) {} not found (attempt {}).", names.join(", "), attempt);
            match prompt("Check the USB cables and press Enter to retry, or type 'q' to give up: ") {
                Some(answer) if answer.eq_ignore_ascii_case("q") => RetryDecision::Abort,
                Some(_) => RetryDecision::Retry,
                None => RetryDecision::Abort,
            }
        },
    )?;
    let bank = RelayBank::open(&boards, config.relay.timing)?;
    println!("Connected to relay board(s): {}", boards.iter().map(|b| b.label.as_str()).collect::<Vec<_>>().join(", "));
    Ok(bank)
}

// Energises every relay of every board in turn, then releases them.
fn run_smoke_test(bank: &mut SerialBank) {
    println!("\n--- Relay Board Smoke Test ---");
    let boards: Vec<String> = bank.boards().map(|l| l.to_string()).collect();
    for board in &boards {
        println!("Board {}", board);
        for (state, pause) in [(RelayState::Enable, 300), (RelayState::Disable, 100)] {
            for relay in 1..=RELAYS_PER_BOARD {
                match bank.set_relay(board, relay, state) {
                    Ok(command) => println!("  relay {} {:<7} -> {:#04X}", relay, state, command),
                    Err(e) => {
                        eprintln!("[ERROR] {}", e);
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(pause));
            }
        }
    }
    info!(boards = boards.len(), "relay smoke test done");
}

// Reads "<board> <relay> on|off" lines until 'back'.
fn run_manual_mode(bank: &mut SerialBank) {
    println!("\n--- Manual Relay Control ---");
    println!("Enter '<board> <relay> on|off', 'reset', or 'back' to return to the main menu.");

    while let Some(line) = prompt("> ") {
        let words: Vec<&str> = line.split_whitespace().collect();
        let result = match words.as_slice() {
            [] => continue,
            ["back"] => break,
            ["reset"] => bank.reset_all().map(|_| String::from("all relays released")),
            [board, relay, state] => match (relay.parse::<u8>(), parse_state(state)) {
                (Ok(relay), Some(state)) => bank
                    .set_relay(board, relay, state)
                    .map(|command| format!("board {} command {:#04X}", board.to_uppercase(), command)),
                _ => Err(BenchError::InvalidAddress {
                    board: board.to_string(),
                    relay: relay.parse().unwrap_or(0),
                }),
            },
            _ => {
                eprintln!("[ERROR] Expected '<board> <relay> on|off'.");
                continue;
            }
        };
        match result {
            Ok(message) => println!("< {}", message),
            Err(e) => eprintln!("[ERROR] {}", e),
        }
    }
}

fn parse_state(word: &str) -> Option<RelayState> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "enable" => Some(RelayState::Enable),
        "off" | "disable" => Some(RelayState::Disable),
        _ => None,
    }
}

#[cfg(feature = "usb")]
fn open_meters(config: &BenchConfig) -> Vec<MeterHandle> {
    use bms3_bench::multimeter::usb::{list_meters, UsbMeterSource};
    use bms3_bench::multimeter::{MeasurementDecoder, MeterWorker};

    let bcds = match list_meters() {
        Ok(bcds) => bcds,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return Vec::new();
        }
    };
    let mut meters = Vec::new();
    for bcd in bcds {
        let source = match UsbMeterSource::open(bcd, config.multimeter.read_timeout) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                continue;
            }
        };
        match MeterWorker::spawn(source, MeasurementDecoder::new(config.multimeter.modes)) {
            Ok(handle) => {
                if handle.wait_for_first(config.multimeter.startup_timeout).is_none() {
                    warn!(device = handle.identity(), "multimeter sent nothing yet");
                }
                meters.push(handle);
            }
            Err(e) => eprintln!("[ERROR] Failed to start multimeter reader: {}", e),
        }
    }
    meters
}

#[cfg(not(feature = "usb"))]
fn open_meters(_config: &BenchConfig) -> Vec<MeterHandle> {
    eprintln!("[WARNING] Built without USB support; multimeters are not read.");
    Vec::new()
}

fn run_monitor(bank: Option<&SerialBank>, config: &BenchConfig) {
    let meters = open_meters(config);
    if meters.is_empty() && bank.is_none() {
        eprintln!("[ERROR] Nothing to monitor: no multimeter found and relay boards not connected.");
        return;
    }
    if let Err(e) = monitor::run(&meters, bank, Duration::from_millis(250)) {
        eprintln!("[ERROR] {}", e);
    }
    for meter in meters {
        meter.stop();
    }
}

fn find_supply_port(config: &BenchConfig) -> bms3_bench::Result<String> {
    let pattern = config.power_supply.vid_pid.to_uppercase();
    discovery::scan_serial_ports()?
        .into_iter()
        .find(|port| port.hardware_id.to_uppercase().contains(&pattern))
        .map(|port| port.port_name)
        .ok_or_else(|| BenchError::Instrument(format!("no power supply with {} found", config.power_supply.vid_pid)))
}

// Powers the board with the configured limits and logs the current it draws.
fn run_supply_check(config: &BenchConfig, results: &mut Option<CsvLogger>) {
    println!("\n--- Power Supply Check ---");
    let result = find_supply_port(config)
        .and_then(|port| Tenma72::open(&port, config.power_supply.limits))
        .and_then(|mut supply| {
            let limits = *supply.limits();
            let volts = supply.set_voltage_mv(limits.max_voltage_mv)?;
            let amps = supply.set_current_ma(limits.max_current_ma)?;
            supply.set_output(true)?;
            thread::sleep(limits.settle);
            let drawn = supply.read_current_ma()?;
            supply.set_output(false)?;
            Ok((volts, amps, drawn))
        });

    match result {
        Ok((volts, amps, drawn)) => {
            println!("Supply at {} mV / {} mA limit, board draws {:.1} mA", volts, amps, drawn);
            log_result(results, &["supply", &volts.to_string(), &amps.to_string(), &format!("{:.1}", drawn)]);
        }
        Err(e) => eprintln!("[ERROR] {}", e),
    }
}

fn run_flash(config: &BenchConfig, results: &mut Option<CsvLogger>) {
    println!("\n--- Flash Firmware ---");
    let Some(path) = prompt("Firmware binary: ") else { return };
    let binary = Path::new(&path);
    let mut flasher = ExternalFlasher::new(config.flasher.clone());
    match flasher.flash(binary) {
        Ok(FlashOutcome::Success) => {
            println!("Firmware flashed.");
            log_result(results, &["flash", &path, "Test OK"]);
        }
        Ok(FlashOutcome::Failure { stdout }) => {
            eprintln!("[ERROR] Flashing failed:");
            for line in &stdout {
                eprintln!("    {}", line);
            }
            let mut row = vec!["flash", path.as_str(), "Test NOK"];
            row.extend(stdout.iter().map(String::as_str));
            log_result(results, &row);
        }
        Err(e) => eprintln!("[ERROR] Could not run the programmer: {}", e),
    }
}

// Appends one row to the session's result log, opening it on first use.
fn log_result(results: &mut Option<CsvLogger>, fields: &[&str]) {
    if results.is_none() {
        match CsvLogger::create(RESULT_LOG) {
            Ok(logger) => *results = Some(logger.with_column_widths(&RESULT_COLUMN_WIDTHS)),
            Err(e) => {
                warn!(error = %e, "result log unavailable");
                return;
            }
        }
    }
    if let Some(logger) = results.as_mut() {
        if let Err(e) = logger.write_row(fields) {
            warn!(error = %e, "result not logged");
        }
    }
}
