//! Splits a continuous, arbitrarily chunked byte stream into JPEG frames.
//!
//! The stream is cut into *units*: a marker and every byte up to the next marker. Units between
//! `SOI` and `EOI` are collected into a [`FrameSegment`], together with an index of the markers
//! it contains. The index is what later allows splitting the entropy-coded data of the frame
//! into pieces that are decoded in parallel.

use std::{collections::VecDeque, fmt, mem};

use crate::{
    config::DecoderConfig,
    marker::{is_standalone_code, Marker},
};

/// Flags describing a chunk of input data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputFlags {
    /// The chunk may end in the middle of a unit, so the last unit is not complete until the next
    /// marker shows up.
    pub not_full_unit: bool,
    /// The chunk may end in the middle of a frame.
    pub not_full_frame: bool,
    /// No more data will follow this chunk.
    pub end_of_stream: bool,
}

/// A chunk of input data and the position up to which it has been consumed.
#[derive(Debug, Clone, Copy)]
pub struct Bitstream<'a> {
    data: &'a [u8],
    position: usize,
    flags: InputFlags,
}

impl<'a> Bitstream<'a> {
    pub fn new(data: &'a [u8], flags: InputFlags) -> Self {
        Self {
            data,
            position: 0,
            flags,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn flags(&self) -> InputFlags {
        self.flags
    }

    /// Returns the bytes that have not been consumed yet.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.position == self.data.len()
    }
}

/// An entry of a frame's marker index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerEntry {
    /// The marker code (the byte after `0xFF`).
    pub code: u8,
    /// Number of `SOS` and `RST` markers that precede this marker in the frame.
    pub restart_index: u32,
    /// Offset of the marker in the frame data.
    pub offset: usize,
}

impl MarkerEntry {
    #[inline]
    pub fn marker(&self) -> Marker {
        Marker::from_code(self.code)
    }

    /// Returns the entry as `code | restart_index << 8`, with the restart index saturated to 24
    /// bits.
    pub fn packed(&self) -> u32 {
        u32::from(self.code) | self.restart_index.min(0x00FF_FFFF) << 8
    }
}

/// A complete JPEG frame, cut out of the input stream.
#[derive(Clone)]
pub struct FrameSegment {
    data: Vec<u8>,
    markers: Vec<MarkerEntry>,
    implicit_eoi: bool,
}

impl FrameSegment {
    /// Returns the bytes of the frame, from its `SOI` marker up to and including `EOI` (if one
    /// was present).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn markers(&self) -> &[MarkerEntry] {
        &self.markers
    }

    /// Returns `true` if the frame was ended by a following `SOI` or the end of the stream
    /// instead of an `EOI` marker.
    #[inline]
    pub fn implicit_eoi(&self) -> bool {
        self.implicit_eoi
    }

    #[inline]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
impl FrameSegment {
    pub(crate) fn retain_markers(&mut self, f: impl FnMut(&MarkerEntry) -> bool) {
        self.markers.retain(f);
    }
}

impl fmt::Debug for FrameSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSegment")
            .field("len", &self.data.len())
            .field("markers", &self.markers)
            .field("implicit_eoi", &self.implicit_eoi)
            .finish()
    }
}

/// Where the scanner is relative to the marker structure of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Entropy-coded data or bytes outside of any segment.
    Data,
    /// After one `0xFF` byte, followed by the given number of further `0xFF` fill bytes.
    Fill(usize),
    /// Reading the 2-byte length of a segment (holding the high byte once read).
    Length(Option<u8>),
    /// Skipping the given number of segment payload bytes.
    Skip(usize),
}

struct Unit {
    code: u8,
    bytes: Vec<u8>,
}

/// Assembles [`FrameSegment`]s from chunks of input data.
pub struct FrameConstructor {
    marker_limit: usize,
    max_bitstream_size: usize,
    /// Size used to decide how finely restart markers are indexed.
    buffer_size: usize,

    state: ScanState,
    unit: Option<Unit>,
    completed: VecDeque<Unit>,

    frame: Vec<u8>,
    markers: Vec<MarkerEntry>,
    restart_count: u32,
    has_soi: bool,
    has_sos: bool,
}

impl FrameConstructor {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            marker_limit: config.marker_limit(),
            max_bitstream_size: config.max_bitstream_size(),
            buffer_size: 0,
            state: ScanState::Data,
            unit: None,
            completed: VecDeque::new(),
            frame: Vec::new(),
            markers: Vec::new(),
            restart_count: 0,
            has_soi: false,
            has_sos: false,
        }
    }

    /// Discards all buffered data.
    pub fn reset(&mut self) {
        self.state = ScanState::Data;
        self.unit = None;
        self.completed.clear();
        self.reset_frame();
    }

    /// Updates the size hint used for indexing restart markers and for discarding runaway units.
    pub fn set_max_bitstream_size(&mut self, size: usize) {
        self.max_bitstream_size = size;
    }

    #[inline]
    pub fn max_bitstream_size(&self) -> usize {
        self.max_bitstream_size
    }

    /// Consumes data from `input` until a frame is complete, and returns that frame.
    ///
    /// Returns `None` once `input` is exhausted without completing a frame. The data consumed so
    /// far is buffered, so the caller should pass the next chunk of the stream. After a frame is
    /// returned, `input` may still hold unconsumed data that belongs to the following frames.
    pub fn get_frame(&mut self, input: &mut Bitstream<'_>) -> Option<FrameSegment> {
        self.buffer_size = input.data.len().max(self.max_bitstream_size);

        loop {
            if let Some(frame) = self.drain_completed() {
                return Some(frame);
            }
            let Some(&byte) = input.data.get(input.position) else {
                break;
            };
            input.position += 1;
            self.push_byte(byte);
        }

        let flags = input.flags;
        if !flags.not_full_unit || !flags.not_full_frame || flags.end_of_stream {
            if let Some(unit) = self.unit.take() {
                self.completed.push_back(unit);
            }
            if let Some(frame) = self.drain_completed() {
                return Some(frame);
            }
        }

        let mut frame = None;
        if (!flags.not_full_frame || flags.end_of_stream) && self.has_sos && !self.frame.is_empty()
        {
            log::debug!("frame ends without EOI marker");
            frame = Some(self.take_frame(true));
        }
        if flags.end_of_stream {
            if frame.is_none() && !self.frame.is_empty() {
                log::debug!(
                    "discarding {} bytes of incomplete frame at end of stream",
                    self.frame.len()
                );
            }
            self.reset();
        }
        frame
    }

    fn drain_completed(&mut self) -> Option<FrameSegment> {
        while let Some(unit) = self.completed.pop_front() {
            if let Some(frame) = self.add_unit(unit) {
                return Some(frame);
            }
        }
        None
    }

    fn push_byte(&mut self, byte: u8) {
        match self.state {
            ScanState::Skip(n) => {
                self.append(byte);
                self.state = if n > 1 {
                    ScanState::Skip(n - 1)
                } else {
                    ScanState::Data
                };
            }
            ScanState::Length(None) => {
                self.append(byte);
                self.state = ScanState::Length(Some(byte));
            }
            ScanState::Length(Some(high)) => {
                self.append(byte);
                let length = usize::from(u16::from_be_bytes([high, byte]));
                if length < 2 {
                    log::warn!("invalid segment length {length}");
                }
                self.state = match length.saturating_sub(2) {
                    0 => ScanState::Data,
                    n => ScanState::Skip(n),
                };
            }
            ScanState::Data => {
                if byte == 0xFF {
                    self.state = ScanState::Fill(0);
                } else {
                    self.append(byte);
                }
            }
            ScanState::Fill(fill) => match byte {
                0xFF => self.state = ScanState::Fill(fill + 1),
                0x00 => {
                    // Entropy data is kept byte for byte, fill included.
                    for _ in 0..=fill {
                        self.append(0xFF);
                    }
                    self.append(0x00);
                    self.state = ScanState::Data;
                }
                // Fill bytes in front of a marker belong to no unit.
                code => self.start_unit(code),
            },
        }
    }

    fn append(&mut self, byte: u8) {
        let Some(unit) = &mut self.unit else {
            return;
        };
        unit.bytes.push(byte);
        if self.max_bitstream_size != 0 && unit.bytes.len() > self.max_bitstream_size {
            log::warn!(
                "no marker found within {} bytes after {}, dropping frame",
                self.max_bitstream_size,
                Marker::from_code(unit.code),
            );
            self.unit = None;
            self.reset_frame();
        }
    }

    fn start_unit(&mut self, code: u8) {
        if let Some(unit) = self.unit.take() {
            self.completed.push_back(unit);
        }

        let unit = Unit {
            code,
            bytes: vec![0xFF, code],
        };
        if code == Marker::EOI {
            // Nothing belongs to EOI, so there is no need to wait for the next marker.
            self.completed.push_back(unit);
            self.state = ScanState::Data;
            return;
        }

        self.unit = Some(unit);
        self.state = if is_standalone_code(code) {
            ScanState::Data
        } else {
            ScanState::Length(None)
        };
    }

    fn add_unit(&mut self, unit: Unit) -> Option<FrameSegment> {
        let marker = Marker::from_code(unit.code);
        let mut finished = None;
        match marker {
            Marker::Soi => {
                if self.has_soi && self.has_sos && !self.frame.is_empty() {
                    log::debug!("SOI inside of frame, closing previous frame");
                    finished = Some(self.take_frame(true));
                }
                self.reset_frame();
                self.has_soi = true;
            }
            _ if !self.has_soi => {
                log::trace!(
                    "dropping {} unit ({} bytes) outside of frame",
                    marker,
                    unit.bytes.len()
                );
                return None;
            }
            Marker::Sos | Marker::Rst(_) => self.has_sos = true,
            _ => {}
        }

        if !self.index_unit(&unit) {
            log::warn!(
                "frame contains more than {} markers, dropping it",
                self.marker_limit - 1
            );
            self.reset_frame();
            return finished;
        }

        if marker == Marker::Eoi {
            if !self.has_sos {
                log::debug!("dropping frame without scan data");
                self.reset_frame();
                return finished;
            }
            return Some(self.take_frame(false));
        }

        finished
    }

    /// Appends `unit` to the frame and indexes its marker.
    ///
    /// Returns `false` if the marker index is full.
    fn index_unit(&mut self, unit: &Unit) -> bool {
        let entries = self.markers.len();
        if entries >= self.marker_limit - 1 {
            return false;
        }

        let offset = self.frame.len();
        self.frame.extend_from_slice(&unit.bytes);
        let entry = MarkerEntry {
            code: unit.code,
            restart_index: self.restart_count,
            offset,
        };

        match Marker::from_code(unit.code) {
            Marker::Rst(_) => {
                // Short restart intervals are folded into the previous entry, so that the index
                // covers the whole frame.
                let threshold =
                    self.buffer_size as u64 * entries as u64 / (self.marker_limit as u64 - 2);
                if self.frame.len() as u64 > threshold {
                    self.markers.push(entry);
                }
                self.restart_count = self.restart_count.saturating_add(1);
            }
            Marker::Sos => {
                self.markers.push(entry);
                self.restart_count = self.restart_count.saturating_add(1);
            }
            _ => self.markers.push(entry),
        }
        true
    }

    fn take_frame(&mut self, implicit_eoi: bool) -> FrameSegment {
        let frame = FrameSegment {
            data: mem::take(&mut self.frame),
            markers: mem::take(&mut self.markers),
            implicit_eoi,
        };
        log::debug!(
            "frame complete: {} bytes, {} markers, {} restart intervals{}",
            frame.data.len(),
            frame.markers.len(),
            self.restart_count,
            if implicit_eoi { " (implicit EOI)" } else { "" },
        );
        self.reset_frame();
        frame
    }

    fn reset_frame(&mut self) {
        self.frame.clear();
        self.markers.clear();
        self.restart_count = 0;
        self.has_soi = false;
        self.has_sos = false;
    }
}
