//! JPEG/JFIF segment parser.
//!
//! [`SegmentParser`] walks the marker segments of a JPEG stream, and [`parse_segment`] turns a
//! segment's payload into a [`SegmentKind`]. Neither keeps any decoding state; applying the
//! parsed tables and headers is the job of [`HeaderDecoder`](crate::header::HeaderDecoder).

#[cfg(test)]
mod tests;

use std::fmt;

use bytemuck::{AnyBitPattern, Pod, Zeroable};

use crate::{
    error::{bail, Error, Result},
    huffman::{HuffmanTable, TableClass},
    marker::Marker,
    quant::{QuantPrecision, QuantTable},
    reader::Reader,
};

pub struct SegmentParser<'a> {
    reader: Reader<'a>,
}

impl<'a> SegmentParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            reader: Reader::new(buf),
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.reader.position()
    }

    /// Moves the parser to `position`, which must lie inside the buffer.
    #[cfg(test)]
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        self.reader.set_position(position)
    }

    /// Returns the remaining (unparsed) bytes of the input data.
    ///
    /// After an SOS segment, this starts with the entropy-coded data of the scan.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        self.reader.remaining()
    }

    /// Finds the next marker and returns it along with its payload.
    ///
    /// Bytes that precede the marker (garbage, fill bytes, or entropy-coded data) are passed
    /// over. Fails with [`Error::BufferExhausted`] when the data ends before a complete segment,
    /// leaving the position unchanged.
    pub fn next_segment(&mut self) -> Result<Segment<'a>> {
        let start = self.reader.position();
        let result = self.next_segment_impl();
        if result.is_err() {
            self.reader.set_position(start)?;
        }
        result
    }

    fn next_segment_impl(&mut self) -> Result<Segment<'a>> {
        let search_start = self.reader.position();
        let code = loop {
            while self.reader.read_u8()? != 0xFF {}
            let mut code = self.reader.read_u8()?;
            while code == 0xFF {
                code = self.reader.read_u8()?;
            }
            if code != 0x00 {
                break code;
            }
        };

        let offset = self.reader.position() - 2;
        if offset != search_start {
            log::trace!(
                "skipped {} bytes before marker {:02X}",
                offset - search_start,
                code
            );
        }

        let marker = Marker::from_code(code);
        let payload = if marker.is_standalone() {
            &[][..]
        } else {
            let length = self.reader.read_length()?;
            self.reader.read_slice(length)?
        };

        Ok(Segment {
            marker,
            offset,
            payload,
        })
    }
}

/// A segment of a JPEG file, introduced by a `0xFF 0xXX` marker.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    marker: Marker,
    offset: usize,
    payload: &'a [u8],
}

impl<'a> Segment<'a> {
    #[inline]
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Returns the offset of the segment's `0xFF 0xXX` marker in the input buffer.
    ///
    /// Any `0xFF` fill bytes in front of the marker are not part of the segment.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The bytes making up this segment, excluding the `0xFF 0xXX` marker and the segment length.
    ///
    /// Empty for standalone markers. For an SOS segment this does not include any of the
    /// entropy-coded data following the segment.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Returns the offset of the first byte after the segment.
    #[inline]
    pub fn end(&self) -> usize {
        if self.marker.is_standalone() {
            self.offset + 2
        } else {
            self.offset + 4 + self.payload.len()
        }
    }
}

/// Enumeration of segment kinds understood by this parser.
#[derive(Debug)]
#[non_exhaustive]
pub enum SegmentKind<'a> {
    Soi,
    Eoi,
    Rst(u8),
    Dqt(Vec<QuantTable>),
    Dht(Vec<HuffmanTable>),
    Dri(Dri),
    Sof(Sof<'a>),
    Sos(Sos<'a>),
    App(App),
    Com(Com<'a>),
    /// A segment that is recognized as a marker, but carries nothing this parser uses.
    Other(Marker),
}

/// Parses the payload of `segment`.
///
/// A payload that is shorter than its structure requires is reported as [`Error::BadData`]: the
/// segment length was available, so more input would not help.
pub fn parse_segment<'a>(segment: &Segment<'a>) -> Result<SegmentKind<'a>> {
    let marker = segment.marker();
    let mut reader = Reader::new(segment.payload());
    let kind = match marker {
        Marker::Soi => Ok(SegmentKind::Soi),
        Marker::Eoi => Ok(SegmentKind::Eoi),
        Marker::Rst(n) => Ok(SegmentKind::Rst(n)),
        Marker::Dqt => read_dqt(&mut reader).map(SegmentKind::Dqt),
        Marker::Dht => read_dht(&mut reader).map(SegmentKind::Dht),
        Marker::Dri => read_dri(&mut reader).map(SegmentKind::Dri),
        Marker::Sof(_) => read_sof(marker, &mut reader).map(SegmentKind::Sof),
        Marker::Sos => read_sos(&mut reader).map(SegmentKind::Sos),
        Marker::App(n) => read_app(n, &mut reader).map(SegmentKind::App),
        Marker::Com => Ok(SegmentKind::Com(Com {
            text: segment.payload(),
        })),
        Marker::Tem | Marker::Other(_) => Ok(SegmentKind::Other(marker)),
    };
    kind.map_err(|e| match e {
        Error::BufferExhausted => Error::BadData(format!("{marker} segment is truncated")),
        e => e,
    })
}

fn read_dqt(reader: &mut Reader<'_>) -> Result<Vec<QuantTable>> {
    let mut tables = Vec::new();
    while !reader.is_empty() {
        let info = reader.read_u8()?;
        let precision = QuantPrecision::from_pq(info >> 4)?;
        let elements = reader.read_slice(64 * precision.element_size())?;
        tables.push(QuantTable::build(info & 0xf, precision, elements)?);
    }
    Ok(tables)
}

fn read_dht(reader: &mut Reader<'_>) -> Result<Vec<HuffmanTable>> {
    let mut tables = Vec::new();
    while !reader.is_empty() {
        let header: &DhtHeader = reader.read_obj()?;
        let count = header.num_values();
        if count > reader.remaining().len() {
            bail!(
                "DHT table {} defines {} values, but only {} bytes remain in the segment",
                header.id(),
                count,
                reader.remaining().len(),
            );
        }
        let values = reader.read_slice(count)?;
        let class = TableClass::from_tc(header.class())?;
        tables.push(HuffmanTable::build(header.id(), class, &header.counts, values)?);
    }
    Ok(tables)
}

fn read_dri(reader: &mut Reader<'_>) -> Result<Dri> {
    if reader.remaining().len() != 2 {
        bail!(
            "DRI segment has {} bytes of payload, expected 2",
            reader.remaining().len()
        );
    }
    Ok(Dri {
        restart_interval: reader.read_u16()?,
    })
}

fn read_sof<'a>(marker: Marker, reader: &mut Reader<'a>) -> Result<Sof<'a>> {
    let precision = reader.read_u8()?;
    let height = reader.read_u16()?;
    let width = reader.read_u16()?;
    let count = reader.read_u8()?;
    if reader.remaining().len() != usize::from(count) * 3 {
        bail!(
            "{marker} segment with {count} components has {} bytes of component data",
            reader.remaining().len(),
        );
    }
    Ok(Sof {
        marker,
        precision,
        height,
        width,
        components: reader.read_objs(count.into())?,
    })
}

fn read_sos<'a>(reader: &mut Reader<'a>) -> Result<Sos<'a>> {
    let count = reader.read_u8()?;
    if reader.remaining().len() != usize::from(count) * 2 + 3 {
        bail!(
            "SOS segment with {count} components has {} bytes of payload",
            reader.remaining().len() + 1,
        );
    }
    let components = reader.read_objs(count.into())?;
    let [ss, se, approx] = reader.read_array::<3>()?;
    Ok(Sos {
        components,
        ss,
        se,
        ah: approx >> 4,
        al: approx & 0xf,
    })
}

fn read_app(n: u8, reader: &mut Reader<'_>) -> Result<App> {
    let kind = match n {
        0 => read_app0(reader)?,
        14 => read_adobe(reader)?.map(AppKind::Adobe),
        _ => None,
    };

    // Anything else in an APP segment is application data and ignored.
    Ok(App { n, kind })
}

fn read_app0(reader: &mut Reader<'_>) -> Result<Option<AppKind>> {
    let payload = reader.remaining();
    if payload.len() >= 14 && payload.starts_with(b"JFIF\0") {
        reader.seek(5)?;
        let version = (reader.read_u8()?, reader.read_u8()?);
        let density_unit = match reader.read_u8()? {
            0 => Some(DensityUnit::None),
            1 => Some(DensityUnit::DotsPerInch),
            2 => Some(DensityUnit::DotsPerCm),
            _ => None,
        };
        let density = (reader.read_u16()?, reader.read_u16()?);
        let thumbnail = (reader.read_u8()?, reader.read_u8()?);
        return Ok(Some(AppKind::Jfif(Jfif {
            version,
            density_unit,
            density,
            thumbnail,
        })));
    }

    if payload.len() >= 6 && payload.starts_with(b"JFXX\0") {
        reader.seek(5)?;
        return Ok(Some(AppKind::Jfxx(Jfxx {
            thumbnail_format: reader.read_u8()?,
        })));
    }

    if payload.len() >= 14 && payload.starts_with(b"AVI1") {
        reader.seek(4)?;
        let polarity = reader.read_u8()?;
        // OpenDML variant.
        let field_sizes = if reader.remaining().len() == 9 {
            reader.seek(1)?;
            Some((reader.read_u32()?, reader.read_u32()?))
        } else {
            None
        };
        return Ok(Some(AppKind::Avi1(Avi1 {
            polarity,
            field_sizes,
        })));
    }

    Ok(None)
}

fn read_adobe(reader: &mut Reader<'_>) -> Result<Option<Adobe>> {
    if reader.remaining().len() < 12 || !reader.remaining().starts_with(b"Adobe") {
        return Ok(None);
    }
    let segment: &AdobeSegment = reader.read_obj()?;
    Ok(Some(Adobe {
        version: u16::from_be_bytes(segment.version),
        flags0: u16::from_be_bytes(segment.flags0),
        flags1: u16::from_be_bytes(segment.flags1),
        transform: segment.transform,
    }))
}

/// An `APPn` segment.
#[derive(Debug, Clone)]
pub struct App {
    n: u8,
    kind: Option<AppKind>,
}

impl App {
    /// The `n` in `APPn`. JFIF, JFXX and AVI1 use APP0, Adobe uses APP14.
    #[inline]
    pub fn n(&self) -> u8 {
        self.n
    }

    #[inline]
    pub fn as_app_kind(&self) -> Option<&AppKind> {
        self.kind.as_ref()
    }

    #[inline]
    pub fn into_app_kind(self) -> Option<AppKind> {
        self.kind
    }
}

/// APP segment contents recognized by their identifier string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AppKind {
    Jfif(Jfif),
    Jfxx(Jfxx),
    Avi1(Avi1),
    Adobe(Adobe),
}

/// The JFIF `APP0` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jfif {
    /// Major and minor version.
    pub version: (u8, u8),
    /// `None` if the header contains an invalid unit.
    pub density_unit: Option<DensityUnit>,
    /// Horizontal and vertical pixel density.
    pub density: (u16, u16),
    /// Size of the embedded RGB thumbnail.
    pub thumbnail: (u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DensityUnit {
    None,
    DotsPerInch,
    DotsPerCm,
}

/// JFIF extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jfxx {
    /// `0x10` = JPEG, `0x11` = 1 byte/pixel palette, `0x13` = 3 bytes/pixel RGB.
    pub thumbnail_format: u8,
}

/// The `AVI1` header that Motion-JPEG AVI files put into each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Avi1 {
    polarity: u8,
    field_sizes: Option<(u32, u32)>,
}

impl Avi1 {
    /// Field polarity: 0 = progressive frame, 1 = odd field first, 2 = even field first.
    #[inline]
    pub fn polarity(&self) -> u8 {
        self.polarity
    }

    /// Sizes of both fields, present in the OpenDML variant of the header.
    #[inline]
    pub fn field_sizes(&self) -> Option<(u32, u32)> {
        self.field_sizes
    }
}

/// The Adobe `APP14` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adobe {
    version: u16,
    flags0: u16,
    flags1: u16,
    transform: u8,
}

impl Adobe {
    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    #[inline]
    pub fn flags0(&self) -> u16 {
        self.flags0
    }

    #[inline]
    pub fn flags1(&self) -> u16 {
        self.flags1
    }

    /// Color transform: 0 = none (RGB or CMYK), 1 = YCbCr, 2 = YCCK.
    #[inline]
    pub fn transform(&self) -> u8 {
        self.transform
    }
}

#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct AdobeSegment {
    id: [u8; 5],
    version: [u8; 2],
    flags0: [u8; 2],
    flags1: [u8; 2],
    transform: u8,
}

/// A comment segment.
pub struct Com<'a> {
    text: &'a [u8],
}

impl<'a> Com<'a> {
    #[inline]
    pub fn text(&self) -> &'a [u8] {
        self.text
    }
}

impl fmt::Debug for Com<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Com(\"{}\")", self.text.escape_ascii())
    }
}

/// Fixed-size head of each table in a DHT segment, followed by the table's values.
#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
struct DhtHeader {
    /// Class in the high nibble (0 = DC, 1 = AC), destination in the low nibble.
    class_id: u8,
    /// Number of codes of each length, 1 to 16 bits.
    counts: [u8; 16],
}

impl DhtHeader {
    #[inline]
    fn class(&self) -> u8 {
        self.class_id >> 4
    }

    #[inline]
    fn id(&self) -> u8 {
        self.class_id & 0xf
    }

    fn num_values(&self) -> usize {
        self.counts.iter().copied().map(usize::from).sum()
    }
}

/// Define Restart Interval.
///
/// A nonzero interval makes the encoder emit an `RSTn` marker after every `restart_interval`
/// MCUs. Each restart interval can be entropy-decoded on its own, which is what allows pieces of
/// a scan to be decoded in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dri {
    /// Number of MCUs per restart interval, 0 if restart markers are disabled.
    pub restart_interval: u16,
}

/// Frame header (`SOFn`).
#[derive(Debug)]
pub struct Sof<'a> {
    pub marker: Marker,
    /// Sample precision in bits.
    pub precision: u8,
    /// Number of lines.
    pub height: u16,
    /// Number of samples per line.
    pub width: u16,
    pub components: &'a [FrameComponent],
}

/// Frame component specification, as stored in the SOF segment.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct FrameComponent {
    id: u8,
    sampling: u8,
    quant_table: u8,
}

impl FrameComponent {
    /// Identifier the scan headers use to refer to this component.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Horizontal sampling factor.
    #[inline]
    pub fn h(&self) -> u8 {
        self.sampling >> 4
    }

    /// Vertical sampling factor.
    #[inline]
    pub fn v(&self) -> u8 {
        self.sampling & 0xf
    }

    #[inline]
    pub fn quant_table(&self) -> u8 {
        self.quant_table
    }
}

impl fmt::Debug for FrameComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}x{} q{}",
            self.id,
            self.h(),
            self.v(),
            self.quant_table
        )
    }
}

/// Scan header (`SOS`). The entropy-coded data of the scan follows the segment.
#[derive(Debug)]
pub struct Sos<'a> {
    pub components: &'a [ScanComponent],
    /// Start of spectral selection.
    pub ss: u8,
    /// End of spectral selection.
    pub se: u8,
    /// Successive approximation bit position high.
    pub ah: u8,
    /// Successive approximation bit position low.
    pub al: u8,
}

/// Scan component specification, as stored in the SOS segment.
#[derive(Clone, Copy, AnyBitPattern)]
#[repr(C)]
pub struct ScanComponent {
    id: u8,
    tables: u8,
}

impl ScanComponent {
    /// Identifier of the frame component coded in this scan.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// DC Huffman table destination.
    #[inline]
    pub fn dc_table(&self) -> u8 {
        self.tables >> 4
    }

    /// AC Huffman table destination.
    #[inline]
    pub fn ac_table(&self) -> u8 {
        self.tables & 0xf
    }
}

impl fmt::Debug for ScanComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} dc{} ac{}", self.id, self.dc_table(), self.ac_table())
    }
}
