//! Stateful JPEG header decoding.
//!
//! [`HeaderDecoder`] applies the segments of a frame (tables, frame header, restart interval,
//! scan headers, APP metadata) and derives the scan geometry needed by the piece decoder.

use crate::{
    error::{bail, Error, Result},
    file::{
        parse_segment, Adobe, App, AppKind, Avi1, Jfif, Jfxx, SegmentKind, SegmentParser, Sof,
        Sos,
    },
    huffman::{HuffmanTable, HuffmanTables, TableClass, MAX_HUFF_TABLES},
    marker::Marker,
    metadata::{ChromaSampling, ColorSpace, Component, FrameInfo, MAX_COMPS_PER_SCAN},
    quant::{QuantTable, QuantTables},
};

/// Upper bound on the number of blocks in one MCU.
pub const MAX_BLOCKS_PER_MCU: u8 = 10;
/// Maximum number of scans in one frame.
pub const MAX_SCANS_PER_FRAME: usize = 4;

/// What a [`HeaderDecoder::decode_segments`] call is reading the headers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Reading the frame headers for the first time; infers the color space.
    ReadHeader,
    /// Re-reading the headers of a scan before decoding its data.
    ReadData,
}

/// Where header decoding stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// An SOS segment was applied.
    StartOfScan {
        scan: usize,
        /// Offset of the `FF DA` marker.
        sos_offset: usize,
        /// Offset of the first entropy-coded byte.
        data_offset: usize,
    },
    /// The EOI marker was reached.
    EndOfImage { offset: usize },
}

/// A component taking part in a scan, with its sampling factors normalized to the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanComponentInfo {
    /// Index into the frame components.
    pub index: usize,
    pub h: u8,
    pub v: u8,
}

/// Geometry and parameters of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanDescriptor {
    pub components: Vec<ScanComponentInfo>,
    pub ss: u8,
    pub se: u8,
    pub ah: u8,
    pub al: u8,
    pub restart_interval: u16,
    pub mcu_width: usize,
    pub mcu_height: usize,
    pub mcus_x: usize,
    pub mcus_y: usize,
    pub x_padding: usize,
    pub y_padding: usize,
    pub min_h_factor: u8,
    pub min_v_factor: u8,
}

impl ScanDescriptor {
    #[inline]
    pub fn num_mcus(&self) -> usize {
        self.mcus_x * self.mcus_y
    }

    /// Number of restart intervals in the scan (1 when restart intervals are disabled).
    pub fn num_restart_intervals(&self) -> usize {
        match self.restart_interval {
            0 => 1,
            ri => self.num_mcus().div_ceil(usize::from(ri)),
        }
    }

    /// Number of blocks in each MCU of this scan.
    pub fn blocks_per_mcu(&self) -> usize {
        self.components
            .iter()
            .map(|c| usize::from(c.h) * usize::from(c.v))
            .sum()
    }
}

#[derive(Debug, Clone)]
struct FrameHeader {
    width: u16,
    height: u16,
    precision: u8,
    components: Vec<Component>,
    sampling: ChromaSampling,
}

/// The APP segments seen in the current frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMarkers {
    pub jfif: Option<Jfif>,
    pub jfxx: Option<Jfxx>,
    pub avi1: Option<Avi1>,
    pub adobe: Option<Adobe>,
}

/// Decoding state built up from the header segments of a JPEG frame.
///
/// Tables are owned by the decoder. A table is only replaced once its replacement was built
/// successfully, so a rejected DQT or DHT segment leaves the previous tables usable.
#[derive(Debug, Clone)]
pub struct HeaderDecoder {
    quant: QuantTables,
    huffman: HuffmanTables,
    frame: Option<FrameHeader>,
    scans: [Option<ScanDescriptor>; MAX_SCANS_PER_FRAME],
    /// Restart interval for each scan index. DRI applies to the next scan and all following ones.
    restart_intervals: [u16; MAX_SCANS_PER_FRAME],
    /// Index the next SOS segment is stored at.
    next_scan: usize,
    current_scan: Option<usize>,
    app: AppMarkers,
    color: ColorSpace,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self {
            quant: QuantTables::default(),
            huffman: HuffmanTables::new(),
            frame: None,
            scans: Default::default(),
            restart_intervals: [0; MAX_SCANS_PER_FRAME],
            next_scan: 0,
            current_scan: None,
            app: AppMarkers::default(),
            color: ColorSpace::Unknown,
        }
    }

    /// Forgets everything, including tables.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Reads the headers of a frame, from its SOI up to and including the first SOS segment.
    ///
    /// All previous state is discarded first. The returned `StartOfScan` outcome points at the
    /// SOS marker of the first scan.
    pub fn read_header(&mut self, data: &[u8]) -> Result<(FrameInfo, DecodeOutcome)> {
        self.reset();

        let mut parser = SegmentParser::new(data);
        let soi = parser.next_segment()?;
        if soi.marker() != Marker::Soi {
            bail!("JPEG image does not start with SOI marker (found {})", soi.marker());
        }

        let outcome = self.decode_segments(&mut parser, Operation::ReadHeader)?;
        match outcome {
            DecodeOutcome::StartOfScan { .. } => {}
            DecodeOutcome::EndOfImage { .. } => bail!("EOI reached before the first scan"),
        }

        let info = self.frame_info()?;
        Ok((info, outcome))
    }

    /// Parses the tables and the scan header of scan number `scan`.
    ///
    /// `data` starts at the first segment following the previous scan's entropy-coded data (or
    /// directly at the SOS marker if the scan has no tables of its own).
    pub fn read_scan_header(&mut self, data: &[u8], scan: usize) -> Result<DecodeOutcome> {
        if scan >= MAX_SCANS_PER_FRAME {
            bail!("scan {scan} exceeds the limit of {MAX_SCANS_PER_FRAME} scans per frame");
        }
        self.next_scan = scan;

        let mut parser = SegmentParser::new(data);
        match self.decode_segments(&mut parser, Operation::ReadData)? {
            outcome @ DecodeOutcome::StartOfScan { .. } => Ok(outcome),
            DecodeOutcome::EndOfImage { .. } => bail!("EOI reached while looking for scan {scan}"),
        }
    }

    /// Applies segments until an SOS segment has been applied or EOI is reached.
    ///
    /// When an SOS segment is returned, `parser` is positioned at the first byte of the
    /// entropy-coded data.
    pub fn decode_segments(
        &mut self,
        parser: &mut SegmentParser<'_>,
        op: Operation,
    ) -> Result<DecodeOutcome> {
        loop {
            let segment = parser.next_segment()?;
            let marker = segment.marker();
            log::trace!("{:04X} {:?}", segment.offset(), marker);

            if let Marker::Sof(n) = marker {
                if n != 0 {
                    return Err(Error::NotImplemented(format!(
                        "{marker} frames (only baseline SOF0 is supported)"
                    )));
                }
            }

            match parse_segment(&segment)? {
                SegmentKind::Eoi => {
                    return Ok(DecodeOutcome::EndOfImage {
                        offset: segment.offset(),
                    })
                }
                SegmentKind::Sos(sos) => {
                    let scan = self.apply_sos(&sos, op)?;
                    return Ok(DecodeOutcome::StartOfScan {
                        scan,
                        sos_offset: segment.offset(),
                        data_offset: segment.end(),
                    });
                }
                SegmentKind::Soi => log::trace!("ignoring SOI inside frame"),
                SegmentKind::Rst(n) => log::trace!("ignoring RST{n} outside of scan data"),
                SegmentKind::Dqt(tables) => {
                    for table in tables {
                        self.quant.set(table);
                    }
                }
                SegmentKind::Dht(tables) => {
                    for table in tables {
                        self.huffman.set(table);
                    }
                }
                SegmentKind::Dri(dri) => {
                    for ri in &mut self.restart_intervals[self.next_scan..] {
                        *ri = dri.restart_interval;
                    }
                }
                SegmentKind::Sof(sof) => self.apply_sof(&sof)?,
                SegmentKind::App(app) => self.apply_app(app),
                SegmentKind::Com(_) | SegmentKind::Other(_) => {}
            }
        }
    }

    fn apply_sof(&mut self, sof: &Sof<'_>) -> Result<()> {
        if self.frame.is_some() {
            bail!("encountered multiple SOF markers");
        }
        if sof.precision != 8 && sof.precision != 12 {
            bail!("sample precision of {} bits is not supported", sof.precision);
        }
        if sof.components.is_empty() || sof.components.len() > MAX_COMPS_PER_SCAN {
            bail!(
                "frame with {} components not supported (1-{MAX_COMPS_PER_SCAN} are allowed)",
                sof.components.len()
            );
        }
        if sof.width == 0 {
            bail!("frame width is 0");
        }
        if sof.height == 0 {
            return Err(Error::NotImplemented(
                "frame height defined by a DNL segment".into(),
            ));
        }

        log::trace!("frame components:");
        let single = sof.components.len() == 1;
        let mut components = Vec::with_capacity(sof.components.len());
        for c in sof.components {
            log::trace!("{:?}", c);

            let (h, v) = if single { (1, 1) } else { (c.h(), c.v()) };
            if !(1..=4).contains(&h) || !(1..=4).contains(&v) {
                bail!(
                    "invalid sampling factors {}x{} for component {}",
                    c.h(),
                    c.v(),
                    c.id()
                );
            }
            if c.quant_table() > 3 {
                bail!(
                    "invalid quantization table selection {} for component {} (only tables 0-3 are valid)",
                    c.quant_table(),
                    c.id()
                );
            }
            components.push(Component {
                id: c.id(),
                h,
                v,
                quant_selector: c.quant_table(),
                dc_selector: 0,
                ac_selector: 0,
                h_factor: 1,
                v_factor: 1,
            });
        }

        let max_h = components.iter().map(|c| c.h).max().unwrap_or(1);
        let max_v = components.iter().map(|c| c.v).max().unwrap_or(1);
        for c in &mut components {
            c.h_factor = max_h / c.h;
            c.v_factor = max_v / c.v;
        }

        let factors: Vec<_> = components.iter().map(|c| (c.h, c.v)).collect();
        let sampling = ChromaSampling::detect(&factors);

        self.frame = Some(FrameHeader {
            width: sof.width,
            height: sof.height,
            precision: sof.precision,
            components,
            sampling,
        });
        Ok(())
    }

    fn apply_sos(&mut self, sos: &Sos<'_>, op: Operation) -> Result<usize> {
        let Some(frame) = &mut self.frame else {
            bail!("SOS not preceded by SOF header");
        };
        let scan_index = self.next_scan;
        if scan_index >= MAX_SCANS_PER_FRAME {
            bail!("frame has more than {MAX_SCANS_PER_FRAME} scans");
        }
        if sos.components.is_empty() || sos.components.len() > MAX_COMPS_PER_SCAN {
            bail!(
                "scan with {} components not supported (1-{MAX_COMPS_PER_SCAN} are allowed)",
                sos.components.len()
            );
        }

        log::trace!("scan components:");
        let mut members = Vec::with_capacity(sos.components.len());
        for sc in sos.components {
            log::trace!("{:?}", sc);

            let Some(index) = frame.components.iter().position(|c| c.id == sc.id()) else {
                bail!("scan references unknown component id {}", sc.id());
            };
            let (dc, ac) = (sc.dc_table(), sc.ac_table());
            if usize::from(dc) >= MAX_HUFF_TABLES || usize::from(ac) >= MAX_HUFF_TABLES {
                bail!(
                    "invalid Huffman table selection DC={dc} AC={ac} for component {}",
                    sc.id()
                );
            }
            let component = &mut frame.components[index];
            component.dc_selector = dc;
            component.ac_selector = ac;
            members.push(index);
        }

        // Normalize the sampling factors of the scan's components by their greatest common
        // divisor, which turns every non-interleaved scan into 1x1 MCUs.
        let hs: Vec<u8> = members.iter().map(|&i| frame.components[i].h).collect();
        let vs: Vec<u8> = members.iter().map(|&i| frame.components[i].v).collect();
        let h_gcd = common_divisor(&hs);
        let v_gcd = common_divisor(&vs);

        let mut min_h_factor = MAX_BLOCKS_PER_MCU;
        let mut min_v_factor = MAX_BLOCKS_PER_MCU;
        let mut scan_max_h = 0;
        let mut scan_max_v = 0;
        let mut components = Vec::with_capacity(members.len());
        for &index in &members {
            let c = &frame.components[index];
            let h = c.h / h_gcd;
            let v = c.v / v_gcd;
            scan_max_h = scan_max_h.max(h);
            scan_max_v = scan_max_v.max(v);
            min_h_factor = min_h_factor.min(c.h_factor);
            min_v_factor = min_v_factor.min(c.v_factor);
            components.push(ScanComponentInfo { index, h, v });
        }

        let blocks: usize = components
            .iter()
            .map(|c| usize::from(c.h) * usize::from(c.v))
            .sum();
        if blocks > usize::from(MAX_BLOCKS_PER_MCU) {
            bail!("scan MCU contains {blocks} blocks (at most {MAX_BLOCKS_PER_MCU} are allowed)");
        }

        let mcu_width = 8 * usize::from(scan_max_h.max(1));
        let mcu_height = 8 * usize::from(scan_max_v.max(1));
        let width = usize::from(frame.width);
        let height = usize::from(frame.height);
        let mcu_span_x = mcu_width * usize::from(min_h_factor);
        let mcu_span_y = mcu_height * usize::from(min_v_factor);
        let mcus_x = width.div_ceil(mcu_span_x);
        let mcus_y = height.div_ceil(mcu_span_y);

        let descriptor = ScanDescriptor {
            components,
            ss: sos.ss,
            se: sos.se,
            ah: sos.ah,
            al: sos.al,
            restart_interval: self.restart_intervals[scan_index],
            mcu_width,
            mcu_height,
            mcus_x,
            mcus_y,
            x_padding: mcus_x * mcu_span_x - width,
            y_padding: mcus_y * mcu_span_y - height,
            min_h_factor,
            min_v_factor,
        };
        log::trace!("scan {scan_index}: {:?}", descriptor);

        // Motion-JPEG frames usually carry no DHT segment and rely on the standard tables.
        for &index in &members {
            let c = frame.components[index];
            for (class, id) in [(TableClass::Dc, c.dc_selector), (TableClass::Ac, c.ac_selector)] {
                if self.huffman.get(class, id).is_none() {
                    if let Some(table) = HuffmanTable::standard(class, id) {
                        log::debug!("installing standard {:?} Huffman table {}", class, id);
                        self.huffman.set(table);
                    }
                }
            }
        }

        if op == Operation::ReadHeader && self.color == ColorSpace::Unknown {
            self.color = infer_color(
                frame.components.len(),
                frame.precision,
                self.app.jfif.is_some(),
                self.app.adobe.map(|a| a.transform()),
            );
        }

        self.scans[scan_index] = Some(descriptor);
        self.current_scan = Some(scan_index);
        self.next_scan = scan_index + 1;
        Ok(scan_index)
    }

    fn apply_app(&mut self, app: App) {
        match app.into_app_kind() {
            Some(AppKind::Jfif(jfif)) => self.app.jfif = Some(jfif),
            Some(AppKind::Jfxx(jfxx)) => self.app.jfxx = Some(jfxx),
            Some(AppKind::Avi1(avi1)) => self.app.avi1 = Some(avi1),
            Some(AppKind::Adobe(adobe)) => self.app.adobe = Some(adobe),
            None => {}
        }
    }

    /// Returns the frame information, once an SOF segment has been applied.
    pub fn frame_info(&self) -> Result<FrameInfo> {
        let Some(frame) = &self.frame else {
            bail!("missing SOF header");
        };
        Ok(FrameInfo {
            width: frame.width,
            height: frame.height,
            precision: frame.precision,
            components: frame.components.clone(),
            sampling: frame.sampling,
            color: self.color,
            restart_interval: self.restart_intervals[0],
        })
    }

    /// Returns the frame components, once an SOF segment has been applied.
    pub fn components(&self) -> &[Component] {
        match &self.frame {
            Some(frame) => &frame.components,
            None => &[],
        }
    }

    /// Returns the descriptor of scan `index`, if its SOS segment has been applied.
    pub fn scan(&self, index: usize) -> Option<&ScanDescriptor> {
        self.scans.get(index)?.as_ref()
    }

    /// Index of the most recently applied scan header.
    #[inline]
    pub fn current_scan(&self) -> Option<usize> {
        self.current_scan
    }

    #[inline]
    pub fn color(&self) -> ColorSpace {
        self.color
    }

    #[inline]
    pub fn app_markers(&self) -> &AppMarkers {
        &self.app
    }

    pub fn quant_table(&self, id: u8) -> Option<&QuantTable> {
        self.quant.get(id)
    }

    pub fn huffman_table(&self, class: TableClass, id: u8) -> Option<&HuffmanTable> {
        self.huffman.get(class, id)
    }

    pub fn num_quant_tables(&self) -> usize {
        self.quant.iter().count()
    }

    pub fn num_dc_tables(&self) -> usize {
        self.huffman.iter(TableClass::Dc).count()
    }

    pub fn num_ac_tables(&self) -> usize {
        self.huffman.iter(TableClass::Ac).count()
    }

    /// Returns every installed quantization table as `(id, elements)`, elements in transmission
    /// order.
    pub fn quant_tables(&self) -> impl Iterator<Item = (u8, [u16; 64])> + '_ {
        self.quant.iter().map(|t| (t.id(), t.as_u16()))
    }

    /// Returns every installed DC table as `(id, bits, values)`.
    pub fn dc_tables(&self) -> impl Iterator<Item = (u8, &[u8; 16], &[u8])> + '_ {
        self.huffman
            .iter(TableClass::Dc)
            .map(|t| (t.id(), t.bits(), t.values()))
    }

    /// Returns every installed AC table as `(id, bits, values)`.
    pub fn ac_tables(&self) -> impl Iterator<Item = (u8, &[u8; 16], &[u8])> + '_ {
        self.huffman
            .iter(TableClass::Ac)
            .map(|t| (t.id(), t.bits(), t.values()))
    }
}

/// Returns the largest divisor in `2..MAX_BLOCKS_PER_MCU` shared by all `factors`, or 1.
fn common_divisor(factors: &[u8]) -> u8 {
    (2..MAX_BLOCKS_PER_MCU)
        .rev()
        .find(|&d| factors.iter().all(|&f| f % d == 0))
        .unwrap_or(1)
}

fn infer_color(
    num_components: usize,
    precision: u8,
    jfif: bool,
    adobe_transform: Option<u8>,
) -> ColorSpace {
    let mut color = ColorSpace::Unknown;
    if jfif {
        color = match num_components {
            1 => ColorSpace::Gray,
            3 => ColorSpace::YCbCr,
            _ => ColorSpace::Unknown,
        };
    }
    if let Some(transform) = adobe_transform {
        color = match (transform, num_components) {
            (0, 1) => ColorSpace::Gray,
            (0, 3) => ColorSpace::Rgb,
            (0, 4) => ColorSpace::Cmyk,
            (1, _) => ColorSpace::YCbCr,
            (2, _) => ColorSpace::Ycck,
            _ => ColorSpace::Unknown,
        };
    }
    if !jfif && adobe_transform.is_none() {
        color = match num_components {
            1 => ColorSpace::Gray,
            3 if precision == 8 => ColorSpace::YCbCr,
            _ => ColorSpace::Unknown,
        };
    }
    color
}

/// Returns the offset of the first SOI marker in `data`.
///
/// Bytes in front of the SOI are skipped without interpreting them, so segment lengths in leading
/// garbage are never followed. Runs of `0xFF` are treated as fill bytes.
///
/// Fails with [`Error::BufferExhausted`] if `data` contains no SOI marker.
pub fn find_soi(data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    while let Some(found) = data[pos..].iter().position(|&b| b == 0xFF) {
        let mut marker = pos + found;
        while data.get(marker + 1) == Some(&0xFF) {
            marker += 1;
        }
        match data.get(marker + 1) {
            Some(&Marker::SOI) => return Ok(marker),
            Some(_) => pos = marker + 2,
            None => break,
        }
    }
    Err(Error::BufferExhausted)
}
