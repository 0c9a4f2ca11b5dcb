//! Background readers, one thread per multimeter.
//!
//! A worker drains its report source continuously and publishes the most recent
//! measurement into a single-slot cell. Consumers poll the cell; there is no
//! history and no notification, so callers wait for the instrument to settle
//! before reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use super::decoder::{DecodedMeasurement, MeasurementDecoder, MeasurementMode};
use super::frame::FrameAssembler;
use crate::error::BenchError;

/// A measurement together with when it was published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub measurement: DecodedMeasurement,
    /// Number of measurements published before this one.
    pub sequence: u64,
    pub received_at: Instant,
}

/// Latest measurement of one instrument, overwritten on every frame.
#[derive(Debug, Clone, Default)]
pub struct LatestMeasurement {
    slot: Arc<Mutex<Option<Sample>>>,
}

impl LatestMeasurement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, measurement: DecodedMeasurement) {
        let mut slot = self.slot.lock();
        let sequence = slot.as_ref().map_or(0, |previous| previous.sequence + 1);
        *slot = Some(Sample {
            measurement,
            sequence,
            received_at: Instant::now(),
        });
    }

    pub fn sample(&self) -> Option<Sample> {
        *self.slot.lock()
    }

    pub fn measurement(&self) -> Option<DecodedMeasurement> {
        self.sample().map(|s| s.measurement)
    }
}

/// Outcome of a failed read on an instrument channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Timeout or empty read; nothing to report, try again.
    #[error("no data")]
    Transient,
    /// The channel is unusable.
    #[error("{0}")]
    Fatal(String),
}

/// Raw report stream of one instrument.
pub trait ReportSource: Send {
    /// Human readable device identity, used in diagnostics.
    fn identity(&self) -> String;

    /// Performs one read and feeds whatever arrived into `assembler`.
    fn read_into(&mut self, assembler: &mut FrameAssembler) -> Result<(), ReadError>;
}

/// Spawns the reader thread of one multimeter.
pub struct MeterWorker;

impl MeterWorker {
    pub fn spawn<S>(mut source: S, decoder: MeasurementDecoder) -> std::io::Result<MeterHandle>
    where
        S: ReportSource + 'static,
    {
        let identity = source.identity();
        let latest = LatestMeasurement::new();
        let stop = Arc::new(AtomicBool::new(false));
        let fault = Arc::new(Mutex::new(None));

        let thread = {
            let identity = identity.clone();
            let latest = latest.clone();
            let stop = Arc::clone(&stop);
            let fault = Arc::clone(&fault);
            thread::Builder::new()
                .name(format!("meter-{}", identity))
                .spawn(move || {
                    info!(device = %identity, "multimeter reader started");
                    let mut assembler = FrameAssembler::new();
                    while !stop.load(Ordering::Relaxed) {
                        match source.read_into(&mut assembler) {
                            Ok(()) => {}
                            Err(ReadError::Transient) => continue,
                            Err(ReadError::Fatal(message)) => {
                                error!(device = %identity, error = %message, "multimeter read failed");
                                *fault.lock() = Some(message);
                                break;
                            }
                        }
                        while let Some(frame) = assembler.next_frame() {
                            let measurement = decoder.decode(&frame);
                            debug!(device = %identity, value = measurement.value, mode = %measurement.mode, overflow = measurement.overflow, "measurement");
                            latest.publish(measurement);
                        }
                    }
                    info!(device = %identity, "multimeter reader stopped");
                })?
        };

        Ok(MeterHandle {
            identity,
            latest,
            stop,
            fault,
            thread: Some(thread),
        })
    }
}

/// Owner side of a running worker.
///
/// Dropping the handle asks the worker to stop but never waits for it.
pub struct MeterHandle {
    identity: String,
    latest: LatestMeasurement,
    stop: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    thread: Option<JoinHandle<()>>,
}

impl MeterHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Most recent sample, if any frame has been decoded yet.
    pub fn latest(&self) -> Option<Sample> {
        self.latest.sample()
    }

    pub fn measurement(&self) -> Option<DecodedMeasurement> {
        self.latest.measurement()
    }

    /// Mode of the most recent measurement.
    pub fn mode(&self) -> Option<MeasurementMode> {
        self.measurement().map(|m| m.mode)
    }

    /// Sleeps `settle` then returns the latest measurement.
    pub fn read_settled(&self, settle: Duration) -> Option<DecodedMeasurement> {
        thread::sleep(settle);
        self.measurement()
    }

    /// Polls until a first sample arrives, the worker dies or `timeout` elapses.
    pub fn wait_for_first(&self, timeout: Duration) -> Option<Sample> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(sample) = self.latest() {
                return Some(sample);
            }
            if !self.is_running() || Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// The fatal transport error that stopped the worker, if any.
    pub fn fault(&self) -> Option<BenchError> {
        self.fault.lock().clone().map(|message| BenchError::TransportFatal {
            device: self.identity.clone(),
            message,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Asks the worker to stop after its current read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = %self.identity, "multimeter reader panicked");
            }
        }
    }
}

impl Drop for MeterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
