//! Multimeter stream handling: frame assembly, decoding and background readers.

pub mod decoder;
pub mod frame;
#[cfg(feature = "usb")]
pub mod usb;
pub mod worker;

pub use decoder::{CurrentPlacement, DecodedMeasurement, MeasurementDecoder, MeasurementMode, ModeTable};
pub use frame::{FrameAssembler, RawFrame, FRAME_LEN, FRAME_TAG};
pub use worker::{LatestMeasurement, MeterHandle, MeterWorker, ReadError, ReportSource, Sample};
