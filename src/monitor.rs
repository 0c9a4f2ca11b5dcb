//! Live terminal view of the bench: latest multimeter readings and relay masks.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};

use crate::error::Result;
use crate::multimeter::{DecodedMeasurement, MeasurementMode, MeterHandle};
use crate::relay::{BoardLabel, RELAYS_PER_BOARD};
use crate::relay_bank::RelayBank;

/// What a meter is used for on the bench, judged by the mode it reports.
pub fn role_of(mode: Option<MeasurementMode>) -> &'static str {
    match mode {
        Some(MeasurementMode::Voltage) => "voltmeter",
        Some(MeasurementMode::Current) => "ammeter",
        Some(MeasurementMode::Resistance) => "ohmmeter",
        Some(MeasurementMode::Unimplemented) | None => "unknown",
    }
}

/// Value with its unit, or `OL` when the display overflowed.
pub fn format_measurement(measurement: &DecodedMeasurement) -> String {
    if measurement.overflow {
        return String::from("OL");
    }
    match measurement.mode {
        MeasurementMode::Unimplemented => String::from("-"),
        mode => format!("{:.4} {}", measurement.value, mode.unit()),
    }
}

/// Relay numbers that are energised, e.g. `1 . 3 . . . . 8`.
pub fn relay_pattern(command: u8) -> String {
    (0..RELAYS_PER_BOARD)
        .map(|bit| {
            if command & (1 << bit) == 0 {
                (bit + 1).to_string()
            } else {
                String::from(".")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// One line of the meter table.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterLine {
    pub device: String,
    pub role: &'static str,
    pub reading: String,
    pub age: Option<Duration>,
    pub status: String,
}

impl MeterLine {
    pub fn of(handle: &MeterHandle) -> Self {
        let sample = handle.latest();
        let status = match handle.fault() {
            Some(fault) => fault.to_string(),
            None if handle.is_running() => String::from("running"),
            None => String::from("stopped"),
        };
        Self {
            device: handle.identity().to_string(),
            role: role_of(sample.map(|s| s.measurement.mode)),
            reading: sample.map_or_else(|| String::from("waiting"), |s| format_measurement(&s.measurement)),
            age: sample.map(|s| s.received_at.elapsed()),
            status,
        }
    }
}

/// Everything drawn in one refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub meters: Vec<MeterLine>,
    pub relays: Vec<(BoardLabel, u8)>,
}

impl Snapshot {
    pub fn capture<W: Write>(meters: &[MeterHandle], bank: Option<&RelayBank<W>>) -> Self {
        Self {
            meters: meters.iter().map(MeterLine::of).collect(),
            relays: bank.map(RelayBank::masks).unwrap_or_default(),
        }
    }
}

pub fn draw(f: &mut Frame, snapshot: &Snapshot) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(snapshot.relays.len() as u16 + 3),
        ])
        .split(f.size());

    let status = Paragraph::new(format!(
        " Meters: {}  Relay boards: {}  |  [q]uit",
        snapshot.meters.len(),
        snapshot.relays.len()
    ))
    .block(Block::default().borders(Borders::ALL).title(" BMS3 bench monitor "));
    f.render_widget(status, chunks[0]);

    let header_style = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);

    let meter_rows: Vec<Row> = snapshot
        .meters
        .iter()
        .map(|m| {
            let age = m.age.map_or_else(|| String::from("-"), |a| format!("{} ms", a.as_millis()));
            let style = if m.status == "running" {
                Style::default()
            } else {
                Style::default().fg(Color::Red)
            };
            Row::new([m.device.clone(), m.role.to_string(), m.reading.clone(), age, m.status.clone()]).style(style)
        })
        .collect();
    let meters = Table::new(
        meter_rows,
        [
            Constraint::Min(20),
            Constraint::Length(10),
            Constraint::Length(16),
            Constraint::Length(9),
            Constraint::Min(10),
        ],
    )
    .header(Row::new(["Device", "Role", "Reading", "Age", "Status"]).style(header_style))
    .block(Block::default().borders(Borders::ALL).title(" Multimeters "));
    f.render_widget(meters, chunks[1]);

    let relay_rows: Vec<Row> = snapshot
        .relays
        .iter()
        .map(|(label, command)| {
            Row::new([label.to_string(), format!("{:#04X}", command), relay_pattern(*command)])
        })
        .collect();
    let relays = Table::new(
        relay_rows,
        [Constraint::Length(6), Constraint::Length(8), Constraint::Min(16)],
    )
    .header(Row::new(["Board", "Command", "Energised"]).style(header_style))
    .block(Block::default().borders(Borders::ALL).title(" Relay boards "));
    f.render_widget(relays, chunks[2]);
}

/// Shows the monitor until the operator presses `q` or Esc.
pub fn run<W: Write>(meters: &[MeterHandle], bank: Option<&RelayBank<W>>, tick_rate: Duration) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = run_loop(&mut terminal, meters, bank, tick_rate);

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn run_loop<B: Backend, W: Write>(
    terminal: &mut Terminal<B>,
    meters: &[MeterHandle],
    bank: Option<&RelayBank<W>>,
    tick_rate: Duration,
) -> Result<()> {
    let mut last_tick = Instant::now();
    loop {
        let snapshot = Snapshot::capture(meters, bank);
        terminal.draw(|f| draw(f, &snapshot))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }
}
