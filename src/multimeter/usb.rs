//! HID report source for multimeters behind a CH9325 USB cable.
//!
//! Every cable carries the same VID:PID; the meters on one bench are told apart
//! by the cable's `bcdDevice`.

use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, UsbContext};
use tracing::{debug, info};

use super::frame::FrameAssembler;
use super::worker::{ReadError, ReportSource};
use crate::error::{BenchError, Result};

pub const VENDOR_ID: u16 = 0x1A86;
pub const PRODUCT_ID: u16 = 0xE008;

// HID SET_REPORT, class request to the interface.
const REQUEST_TYPE: u8 = 0x21;
const SET_REPORT: u8 = 0x09;
const REPORT_VALUE: u16 = 0x0200;
// Switches the cable's UART to 2400 baud.
const BAUD_REPORT: [u8; 5] = [0x60, 0x09, 0, 0, 3];
const REPORT_LEN: usize = 64;

fn usb_error(e: rusb::Error) -> BenchError {
    BenchError::Instrument(format!("USB: {}", e))
}

fn bcd_of(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12) | ((major % 10) << 8) | (u16::from(version.minor()) << 4) | u16::from(version.sub_minor())
}

/// `bcdDevice` of every connected multimeter cable, without duplicates.
pub fn list_meters() -> Result<Vec<u16>> {
    let context = Context::new().map_err(usb_error)?;
    let mut found = Vec::new();
    for device in context.devices().map_err(usb_error)?.iter() {
        let descriptor = device.device_descriptor().map_err(usb_error)?;
        if descriptor.vendor_id() == VENDOR_ID && descriptor.product_id() == PRODUCT_ID {
            let bcd = bcd_of(descriptor.device_version());
            if !found.contains(&bcd) {
                found.push(bcd);
            }
        }
    }
    debug!(meters = ?found, "multimeter cables found");
    Ok(found)
}

pub struct UsbMeterSource {
    handle: DeviceHandle<Context>,
    endpoint: u8,
    bcd_device: u16,
    timeout: Duration,
    buf: Vec<u8>,
}

impl UsbMeterSource {
    /// Opens the cable with the given `bcdDevice` and enables its report stream.
    pub fn open(bcd_device: u16, timeout: Duration) -> Result<Self> {
        let context = Context::new().map_err(usb_error)?;
        let device = context
            .devices()
            .map_err(usb_error)?
            .iter()
            .find(|device| {
                device.device_descriptor().map_or(false, |d| {
                    d.vendor_id() == VENDOR_ID
                        && d.product_id() == PRODUCT_ID
                        && bcd_of(d.device_version()) == bcd_device
                })
            })
            .ok_or_else(|| BenchError::Instrument(format!("multimeter {:04X} not found", bcd_device)))?;

        let config = device.config_descriptor(0).map_err(usb_error)?;
        let interface = config
            .interfaces()
            .next()
            .and_then(|i| i.descriptors().next())
            .ok_or_else(|| BenchError::Instrument(String::from("multimeter cable has no interface")))?;
        let endpoint = interface
            .endpoint_descriptors()
            .find(|e| e.direction() == Direction::In)
            .ok_or_else(|| BenchError::Instrument(String::from("multimeter cable has no IN endpoint")))?;

        let mut handle = device.open().map_err(usb_error)?;
        // Not supported everywhere; claiming fails later if it mattered.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!(bcd_device, error = %e, "kernel driver auto-detach unavailable");
        }
        handle.set_active_configuration(config.number()).map_err(usb_error)?;
        handle.claim_interface(interface.interface_number()).map_err(usb_error)?;

        let mut report = [0u8; REPORT_LEN];
        report[..BAUD_REPORT.len()].copy_from_slice(&BAUD_REPORT);
        handle
            .write_control(
                REQUEST_TYPE,
                SET_REPORT,
                REPORT_VALUE,
                u16::from(interface.interface_number()),
                &report,
                timeout,
            )
            .map_err(usb_error)?;

        info!(bcd_device = format_args!("{:04X}", bcd_device), endpoint = endpoint.address(), "multimeter cable opened");
        Ok(Self {
            handle,
            endpoint: endpoint.address(),
            bcd_device,
            timeout,
            buf: vec![0; usize::from(endpoint.max_packet_size())],
        })
    }
}

impl ReportSource for UsbMeterSource {
    fn identity(&self) -> String {
        format!("CH9325 {:04X}:{:04X} bcdDevice={:04X}", VENDOR_ID, PRODUCT_ID, self.bcd_device)
    }

    fn read_into(&mut self, assembler: &mut FrameAssembler) -> std::result::Result<(), ReadError> {
        match self.handle.read_interrupt(self.endpoint, &mut self.buf, self.timeout) {
            Ok(0) => Err(ReadError::Transient),
            Ok(n) => {
                assembler.push_report(&self.buf[..n]);
                Ok(())
            }
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => Err(ReadError::Transient),
            Err(e) => Err(ReadError::Fatal(e.to_string())),
        }
    }
}
