//! A multi-threaded baseline JPEG and Motion-JPEG decoder front-end.
//!
//! Raw stream bytes are cut into frames by the [`FrameConstructor`], whose headers are parsed by
//! a [`HeaderDecoder`]. The entropy-coded data of each frame is split into independently
//! decodable [`Piece`]s at restart markers, and the [`Dispatcher`] decodes those pieces on a pool
//! of worker threads, writing dequantized coefficient blocks to an [`Output`].
//!
//! [`Decoder`] ties these together for the common case.

mod bits;
mod config;
mod dispatch;
mod error;
mod feedback;
mod file;
mod frame;
mod header;
mod huffman;
mod marker;
mod metadata;
mod output;
mod piece;
mod quant;
mod reader;
mod scan;

use std::time::{Duration, Instant};

pub use config::{DecoderConfig, MAX_THREADS};
pub use dispatch::{DecodeReport, Dispatcher, Generation, Picture};
pub use error::Error;
pub use feedback::{FeedbackMap, ReportStatus, DEFAULT_FEEDBACK_CAPACITY};
pub use file::{Adobe, Avi1, DensityUnit, Jfif, Jfxx};
pub use frame::{Bitstream, FrameConstructor, FrameSegment, InputFlags, MarkerEntry};
pub use header::{
    find_soi, AppMarkers, DecodeOutcome, HeaderDecoder, Operation, ScanComponentInfo,
    ScanDescriptor, MAX_BLOCKS_PER_MCU, MAX_SCANS_PER_FRAME,
};
pub use huffman::{HuffmanTable, HuffmanTables, TableClass};
pub use marker::Marker;
pub use metadata::{ChromaSampling, ChromaType, ColorSpace, Component, FrameInfo};
pub use output::{CoefficientPlane, Output, Surface};
pub use piece::{Piece, PieceLayout, ScanLocation};
pub use quant::{QuantPrecision, QuantTable, QuantTables, RawQuant};
pub use reader::Reader;
pub use scan::{decode_piece, DecodedBlock, DecodedPiece};

use error::Result;

/// Largest marker segment, including the marker. Derived unit limits never go below this.
const MAX_SEGMENT_SIZE: usize = 2 + 0xFFFF;

/// A frame decoded by [`Decoder`].
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Status report number assigned to this frame.
    pub report_number: u32,
    pub info: FrameInfo,
    pub surface: Surface,
    pub report: DecodeReport,
    /// Whether the frame was missing its EOI marker.
    pub implicit_eoi: bool,
}

/// Decodes a (Motion-)JPEG byte stream into coefficient [`Surface`]s.
pub struct Decoder {
    constructor: FrameConstructor,
    dispatcher: Dispatcher,
    feedback: FeedbackMap,
    next_report: u32,
    /// Whether the frame constructor's size limit follows the decoded frames.
    derive_bitstream_size: bool,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Result<Self> {
        Ok(Self {
            constructor: FrameConstructor::new(&config),
            dispatcher: Dispatcher::new(&config)?,
            feedback: FeedbackMap::new(),
            next_report: 0,
            derive_bitstream_size: config.max_bitstream_size() == 0,
        })
    }

    /// Consumes `input` until a complete frame is available and decodes it.
    ///
    /// Returns `Ok(None)` once `input` is used up without completing a frame. A stream chunk can
    /// contain several frames, so this should be called until it returns `Ok(None)`.
    ///
    /// The frame is registered under its status report number with destination `surface`, and
    /// its completion can be queried with [`Decoder::status`].
    pub fn decode_frame(
        &mut self,
        input: &mut Bitstream<'_>,
        surface: u32,
    ) -> Result<Option<DecodedFrame>> {
        let Some(frame) = self.constructor.get_frame(input) else {
            return Ok(None);
        };
        let implicit_eoi = frame.implicit_eoi();

        let (picture, t_prepare) = time(|| self.dispatcher.prepare(frame));
        let picture = picture?;

        if self.derive_bitstream_size {
            let size = picture.info().max_bitstream_size().max(MAX_SEGMENT_SIZE);
            if size > self.constructor.max_bitstream_size() {
                log::debug!("limiting stream units to {size} bytes");
                self.constructor.set_max_bitstream_size(size);
            }
        }

        let report_number = self.next_report;
        self.next_report = self.next_report.wrapping_add(1);
        self.feedback.submit(report_number, surface);

        let mut output = Surface::new(picture.info());
        let (report, t_decode) = time(|| self.dispatcher.decode_picture(&picture, &mut output));
        self.feedback.complete(report_number, output.is_corrupted());

        log::trace!("t_prepare={t_prepare:?}, t_decode={t_decode:?}");

        Ok(Some(DecodedFrame {
            report_number,
            info: picture.info().clone(),
            surface: output,
            report,
            implicit_eoi,
        }))
    }

    /// Decodes the first frame of an in-memory JPEG file.
    pub fn decode_image(&mut self, jpeg: &[u8]) -> Result<DecodedFrame> {
        let flags = InputFlags {
            end_of_stream: true,
            ..Default::default()
        };
        let mut input = Bitstream::new(jpeg, flags);
        let result = self.decode_frame(&mut input, 0);
        self.constructor.reset();
        let frame = result?.ok_or(Error::BufferExhausted)?;
        self.feedback.poll(frame.report_number);
        Ok(frame)
    }

    /// Returns the status of the frame with status report number `report`.
    ///
    /// Finished frames are forgotten once their status has been returned.
    pub fn status(&self, report: u32) -> Option<ReportStatus> {
        self.feedback.poll(report)
    }

    /// Discards buffered stream data and pending status reports.
    pub fn reset(&mut self) {
        self.constructor.reset();
        self.feedback.reset();
    }
}

fn time<R>(f: impl FnOnce() -> R) -> (R, Duration) {
    let start = Instant::now();
    let result = f();
    (result, start.elapsed())
}
