//! Cuts the entropy-coded data of a frame into pieces.
//!
//! A piece starts at an `SOS` or `RST` marker and covers one or more whole restart intervals, so
//! every piece can be entropy-decoded without looking at any other piece.

use std::ops::Range;

use crate::{
    error::{bail, Result},
    frame::FrameSegment,
    header::{ScanDescriptor, MAX_SCANS_PER_FRAME},
    marker::Marker,
};

/// A byte range of a frame that decodes into a contiguous run of MCUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    /// Offset of the `SOS` or `RST` marker starting the piece.
    pub offset: usize,
    pub length: usize,
    /// Restart index (see [`MarkerEntry`](crate::frame::MarkerEntry)) of the starting marker.
    pub first_restart_index: u32,
    /// Number of restart intervals in the piece.
    ///
    /// `u32::MAX` for a piece running up to the end of a frame that has no `EOI` marker.
    pub restart_count: u32,
    /// Index of the scan the piece belongs to.
    pub scan: usize,
}

impl Piece {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Returns the range of MCUs of `scan` covered by this piece.
    ///
    /// The range is clamped to the scan, so it is empty for pieces that start past its end.
    pub fn mcu_range(&self, location: &ScanLocation, scan: &ScanDescriptor) -> Range<usize> {
        let total = scan.num_mcus();
        let ri = usize::from(scan.restart_interval);
        if ri == 0 {
            return 0..total;
        }

        let interval = self
            .first_restart_index
            .saturating_sub(location.first_restart_index) as usize;
        let first = interval.saturating_mul(ri).min(total);
        let count = (self.restart_count as usize).saturating_mul(ri);
        first..first.saturating_add(count).min(total)
    }
}

/// Position of a scan inside its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLocation {
    /// Offset of the first segment belonging to this scan (tables and restart interval
    /// definitions preceding the `SOS` marker).
    pub header_offset: usize,
    /// Offset of the `SOS` marker.
    pub sos_offset: usize,
    /// Restart index of the `SOS` marker.
    pub first_restart_index: u32,
}

/// The scans and pieces of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceLayout {
    pub scans: Vec<ScanLocation>,
    pub pieces: Vec<Piece>,
}

impl PieceLayout {
    /// Computes the layout from the marker index of `frame`.
    pub fn new(frame: &FrameSegment) -> Result<Self> {
        let markers = frame.markers();
        let end = frame.data().len();

        let mut layout = Self::default();
        let mut header_offset = 0;
        for (i, entry) in markers.iter().enumerate() {
            let next = markers.get(i + 1);
            match entry.marker() {
                Marker::Sos => {
                    if layout.scans.len() >= MAX_SCANS_PER_FRAME {
                        bail!("frame has more than {MAX_SCANS_PER_FRAME} scans");
                    }
                    layout.scans.push(ScanLocation {
                        header_offset,
                        sos_offset: entry.offset,
                        first_restart_index: entry.restart_index,
                    });
                }
                Marker::Rst(n) if layout.scans.is_empty() => {
                    bail!("RST{n} marker at offset {} precedes the first scan", entry.offset);
                }
                Marker::Rst(_) => {}
                _ => continue,
            }

            let piece_end = next.map_or(end, |next| next.offset);
            let restart_count = match next {
                Some(next) => next.restart_index.saturating_sub(entry.restart_index),
                None => u32::MAX,
            };
            layout.pieces.push(Piece {
                offset: entry.offset,
                length: piece_end - entry.offset,
                first_restart_index: entry.restart_index,
                restart_count,
                scan: layout.scans.len() - 1,
            });
            header_offset = piece_end;
        }

        if layout.scans.is_empty() {
            bail!("frame contains no scan");
        }
        Ok(layout)
    }

    /// Returns the pieces of scan `scan`.
    pub fn scan_pieces(&self, scan: usize) -> impl Iterator<Item = &Piece> {
        self.pieces.iter().filter(move |p| p.scan == scan)
    }

    /// Merges neighboring pieces of scan `scan` until at most `max` of them remain.
    pub fn merge(&mut self, scan: usize, max: usize) {
        let max = max.max(1);
        let count = self.scan_pieces(scan).count();
        if count <= max {
            return;
        }
        let group = count.div_ceil(max);

        let mut merged = Vec::with_capacity(self.pieces.len() - count + max);
        let mut pending: Option<Piece> = None;
        let mut in_group = 0;
        for piece in self.pieces.drain(..) {
            if piece.scan != scan {
                merged.extend(pending.take());
                merged.push(piece);
                continue;
            }
            match &mut pending {
                Some(acc) if in_group < group => {
                    acc.length = piece.end() - acc.offset;
                    acc.restart_count = acc.restart_count.saturating_add(piece.restart_count);
                    in_group += 1;
                }
                _ => {
                    merged.extend(pending.take());
                    pending = Some(piece);
                    in_group = 1;
                }
            }
        }
        merged.extend(pending);

        log::trace!("merged {count} pieces of scan {scan} into groups of {group}");
        self.pieces = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DecoderConfig,
        frame::{Bitstream, FrameConstructor, InputFlags},
        header::HeaderDecoder,
        tests::SyntheticJpeg,
    };

    fn frame(jpeg: &[u8]) -> FrameSegment {
        let mut constructor = FrameConstructor::new(&DecoderConfig::default());
        let flags = InputFlags {
            end_of_stream: true,
            ..Default::default()
        };
        constructor
            .get_frame(&mut Bitstream::new(jpeg, flags))
            .unwrap()
    }

    #[test]
    fn one_piece_per_restart_interval() {
        let jpeg = SyntheticJpeg::new(40, 8, &[(1, 1)]).restart_interval(2).build();
        let frame = frame(&jpeg);
        let layout = PieceLayout::new(&frame).unwrap();

        assert_eq!(layout.scans.len(), 1);
        assert_eq!(&jpeg[layout.scans[0].sos_offset..][..2], &[0xFF, 0xDA]);
        // 5 MCUs with Ri=2: SOS, RST0, RST1
        assert_eq!(layout.pieces.len(), 3);
        assert!(layout.pieces.iter().all(|p| p.restart_count == 1));
        assert_eq!(&jpeg[layout.pieces[1].offset..][..2], &[0xFF, 0xD0]);
        assert_eq!(layout.pieces[0].end(), layout.pieces[1].offset);
        // The last piece stops in front of EOI.
        assert_eq!(layout.pieces[2].end(), jpeg.len() - 2);

        let mut header = HeaderDecoder::new();
        header.read_header(frame.data()).unwrap();
        let scan = header.scan(0).unwrap();
        let ranges: Vec<_> = layout
            .pieces
            .iter()
            .map(|p| p.mcu_range(&layout.scans[0], scan))
            .collect();
        assert_eq!(ranges, [0..2, 2..4, 4..5]);
    }

    #[test]
    fn multiple_scans() {
        let jpeg = SyntheticJpeg::new(16, 8, &[(1, 1), (1, 1), (1, 1)])
            .restart_interval(1)
            .scan_components(&[0])
            .extra_scan(&[1, 2])
            .build();
        let frame = frame(&jpeg);
        let layout = PieceLayout::new(&frame).unwrap();

        assert_eq!(layout.scans.len(), 2);
        assert_eq!(layout.scan_pieces(0).count(), 2);
        assert_eq!(layout.scan_pieces(1).count(), 2);
        let second = layout.scans[1];
        assert_eq!(second.first_restart_index, 2);
        assert_eq!(
            second.header_offset,
            layout.scan_pieces(0).last().unwrap().end()
        );
        assert!(second.header_offset <= second.sos_offset);
    }

    #[test]
    fn merging() {
        let jpeg = SyntheticJpeg::new(80, 8, &[(1, 1)]).restart_interval(1).build();
        let frame = frame(&jpeg);
        let mut layout = PieceLayout::new(&frame).unwrap();
        assert_eq!(layout.pieces.len(), 10);
        let first = layout.pieces[0];
        let last = layout.pieces[9];

        layout.merge(0, 3);
        let counts: Vec<_> = layout.pieces.iter().map(|p| p.restart_count).collect();
        assert_eq!(counts, [4, 4, 2]);
        assert_eq!(layout.pieces[0].offset, first.offset);
        assert_eq!(layout.pieces[2].end(), last.end());
        assert!(layout.pieces.windows(2).all(|w| w[0].end() == w[1].offset));
        assert_eq!(layout.pieces[1].first_restart_index, 4);

        layout.merge(0, 1);
        assert_eq!(layout.pieces.len(), 1);
        assert_eq!(layout.pieces[0].restart_count, 10);
    }

    #[test]
    fn no_scan() {
        let jpeg = SyntheticJpeg::new(8, 8, &[(1, 1)]).build();
        let mut frame = frame(&jpeg);
        // Only keep SOI and EOI.
        frame.retain_markers(|m| matches!(m.marker(), Marker::Soi | Marker::Eoi));
        assert!(PieceLayout::new(&frame).is_err());
    }
}
