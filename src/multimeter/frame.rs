//! Frame assembly from the multimeter report stream.
//!
//! The cable forwards one datum per report: a tag byte (`0xF1` for measurement
//! data) followed by a byte whose low nibble is the datum. Eleven data make up a
//! frame, the last two being CR (13) and LF (10).

/// Nibbles in one complete frame, terminator included.
pub const FRAME_LEN: usize = 11;

/// Tag of the reports that carry measurement data.
pub const FRAME_TAG: u8 = 0xF1;

/// Frame terminator, CR LF.
pub const TERMINATOR: [u8; 2] = [13, 10];

// Stale nibbles are dropped once the buffer holds this many without a terminator.
const MAX_BUFFERED: usize = FRAME_LEN * 4;

/// One frame as captured from the instrument: five digit nibbles, then six
/// range/mode/flag nibbles ending with the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; FRAME_LEN]);

impl RawFrame {
    /// Builds a frame from nibbles; `None` unless exactly `FRAME_LEN` values are given.
    pub fn from_nibbles(nibbles: &[u8]) -> Option<Self> {
        let nibbles: [u8; FRAME_LEN] = nibbles.try_into().ok()?;
        Some(Self(nibbles))
    }

    pub fn digits(&self) -> &[u8] {
        &self.0[..5]
    }

    /// Block following the digits: range, mode, _, flags, CR, LF.
    pub fn rest(&self) -> &[u8] {
        &self.0[5..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Accumulates data nibbles and cuts them into frames.
///
/// Reads arrive in bursts that are not aligned with frames; whatever follows a
/// terminator is kept for the next frame.
#[derive(Debug, Default, Clone)]
pub struct FrameAssembler {
    nibbles: Vec<u8>,
    marker_pending: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one HID report: the first byte is the tag, the second the datum.
    pub fn push_report(&mut self, report: &[u8]) {
        if let [FRAME_TAG, datum, ..] = report {
            self.push_nibble(datum & 0x0F);
        }
    }

    /// Takes a raw burst in which every `0xF1` marker is followed by its datum.
    pub fn push_bytes(&mut self, burst: &[u8]) {
        for &byte in burst {
            if self.marker_pending {
                self.marker_pending = false;
                self.push_nibble(byte & 0x0F);
            } else if byte == FRAME_TAG {
                self.marker_pending = true;
            }
        }
    }

    fn push_nibble(&mut self, nibble: u8) {
        self.nibbles.push(nibble);
        if self.nibbles.len() > MAX_BUFFERED && self.terminator_at().is_none() {
            let excess = self.nibbles.len() - (FRAME_LEN - 1);
            self.nibbles.drain(..excess);
        }
    }

    fn terminator_at(&self) -> Option<usize> {
        self.nibbles.windows(2).position(|pair| pair == TERMINATOR)
    }

    /// Returns the next complete frame, if one has been received.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            let cr = self.terminator_at()?;
            let end = cr + TERMINATOR.len();
            let frame = if end >= FRAME_LEN {
                RawFrame::from_nibbles(&self.nibbles[end - FRAME_LEN..end])
            } else {
                // Frame started before we began listening.
                None
            };
            self.nibbles.drain(..end);
            if frame.is_some() {
                return frame;
            }
        }
    }

    /// Nibbles waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.nibbles.len()
    }

    pub fn clear(&mut self) {
        self.nibbles.clear();
        self.marker_pending = false;
    }
}
