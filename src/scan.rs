//! Entropy decoding of scan data.
//!
//! [`decode_piece`] decodes the MCUs of one [`Piece`] into dequantized coefficient blocks. The
//! Huffman and quantization tables, as well as the scan geometry, come from a
//! [`HeaderDecoder`] that has parsed the headers of the piece's scan.
//!
//! Pieces start at an `SOS` or `RST` marker, which resets the DC predictors, so any number of
//! pieces can be decoded concurrently. Restart markers inside a piece are consumed along the way.

use std::ops::Range;

use crate::{
    bits::BitReader,
    error::{bail, Error, Result},
    header::HeaderDecoder,
    huffman::{HuffmanTable, TableClass},
    marker::Marker,
    output::Output,
    piece::{Piece, ScanLocation},
    quant::ZIGZAG_TO_NATURAL,
    reader::Reader,
};

/// A dequantized 8x8 block, in natural coefficient order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    /// Index of the frame component.
    pub component: usize,
    /// Block column within the component.
    pub x: usize,
    /// Block row within the component.
    pub y: usize,
    pub coefficients: [i16; 64],
}

/// The blocks of a decoded piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPiece {
    pub scan: usize,
    /// The MCUs of the scan that were decoded.
    pub mcus: Range<usize>,
    pub blocks: Vec<DecodedBlock>,
}

impl DecodedPiece {
    pub fn write_to<O: Output + ?Sized>(&self, output: &mut O) {
        for block in &self.blocks {
            output.put_block(block.component, block.x, block.y, &block.coefficients);
        }
    }
}

struct ComponentState<'a> {
    index: usize,
    h: u8,
    v: u8,
    dc: &'a HuffmanTable,
    ac: &'a HuffmanTable,
    quant: &'a [u16; 64],
    pred: i32,
}

/// Decodes `piece` of `frame`.
///
/// `header` must hold the tables and scan header of the scan the piece belongs to.
pub fn decode_piece(
    header: &HeaderDecoder,
    frame: &[u8],
    piece: &Piece,
    location: &ScanLocation,
) -> Result<DecodedPiece> {
    let Some(scan) = header.scan(piece.scan) else {
        bail!("header of scan {} has not been decoded", piece.scan);
    };
    let Some(data) = frame.get(piece.offset..piece.end()) else {
        bail!(
            "piece {}..{} exceeds the frame ({} bytes)",
            piece.offset,
            piece.end(),
            frame.len()
        );
    };

    let mcus = piece.mcu_range(location, scan);
    if mcus.is_empty() {
        bail!(
            "piece at offset {} starts after the end of scan {}",
            piece.offset,
            piece.scan
        );
    }

    let frame_components = header.components();
    let mut components = Vec::with_capacity(scan.components.len());
    for info in &scan.components {
        let component = &frame_components[info.index];
        let huffman = |class, id| {
            header.huffman_table(class, id).ok_or_else(|| {
                Error::bad_data(format!(
                    "{:?} Huffman table {} used by component {} is not defined",
                    class, id, component.id
                ))
            })
        };
        let Some(quant) = header.quant_table(component.quant_selector) else {
            bail!(
                "quantization table {} used by component {} is not defined",
                component.quant_selector,
                component.id
            );
        };
        components.push(ComponentState {
            index: info.index,
            h: info.h,
            v: info.v,
            dc: huffman(TableClass::Dc, component.dc_selector)?,
            ac: huffman(TableClass::Ac, component.ac_selector)?,
            quant: quant.dequant(),
            pred: 0,
        });
    }

    let mut reader = BitReader::new(entropy_data(data)?);
    let ri = usize::from(scan.restart_interval);
    let mut blocks = Vec::with_capacity(mcus.len() * scan.blocks_per_mcu());
    for mcu in mcus.clone() {
        if ri != 0 && mcu != mcus.start && mcu % ri == 0 {
            let n = reader.read_restart_marker()?;
            let expected = ((mcu / ri - 1) % 8) as u8;
            if n != expected {
                log::warn!("expected RST{expected} before MCU {mcu}, found RST{n}");
            }
            for c in &mut components {
                c.pred = 0;
            }
        }

        let mx = mcu % scan.mcus_x;
        let my = mcu / scan.mcus_x;
        for c in &mut components {
            for by in 0..usize::from(c.v) {
                for bx in 0..usize::from(c.h) {
                    let mut coefficients = [0; 64];
                    decode_block(&mut reader, c, &mut coefficients)?;
                    blocks.push(DecodedBlock {
                        component: c.index,
                        x: mx * usize::from(c.h) + bx,
                        y: my * usize::from(c.v) + by,
                        coefficients,
                    });
                }
            }
        }
    }
    log::trace!(
        "decoded MCUs {mcus:?} of scan {} from {} bytes",
        piece.scan,
        reader.position()
    );

    Ok(DecodedPiece {
        scan: piece.scan,
        mcus,
        blocks,
    })
}

/// Skips the `SOS` segment or `RST` marker a piece starts with.
fn entropy_data(piece: &[u8]) -> Result<&[u8]> {
    let mut reader = Reader::new(piece);
    let [0xFF, code] = reader.read_array::<2>()? else {
        bail!("piece does not start with a marker");
    };
    match Marker::from_code(code) {
        Marker::Sos => {
            let length = reader.read_length()?;
            reader.read_slice(length)?;
        }
        Marker::Rst(_) => {}
        other => bail!("piece starts with {other} marker"),
    }
    Ok(reader.remaining())
}

fn decode_block(
    reader: &mut BitReader<'_>,
    c: &mut ComponentState<'_>,
    out: &mut [i16; 64],
) -> Result<()> {
    let t = c.dc.decode(reader)?;
    let diff = reader.receive_extend(t)?;
    c.pred = c.pred.saturating_add(diff);
    out[0] = dequantize(c.pred, c.quant[0]);

    let mut k = 1;
    while k < 64 {
        let rs = c.ac.decode(reader)?;
        let run = usize::from(rs >> 4);
        let size = rs & 0xF;
        if size == 0 {
            if run == 15 {
                // ZRL
                k += 16;
                continue;
            }
            // EOB
            break;
        }

        k += run;
        if k > 63 {
            bail!("AC coefficient run exceeds the block (index {k})");
        }
        let value = reader.receive_extend(size)?;
        let n = usize::from(ZIGZAG_TO_NATURAL[k]);
        out[n] = dequantize(value, c.quant[n]);
        k += 1;
    }
    Ok(())
}

#[inline]
fn dequantize(value: i32, q: u16) -> i16 {
    value
        .saturating_mul(i32::from(q))
        .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DecoderConfig,
        frame::{Bitstream, FrameConstructor, FrameSegment, InputFlags},
        piece::PieceLayout,
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

    /// Decodes every piece of a single-scan frame.
    fn decode_all(jpeg: &[u8]) -> Result<Vec<DecodedPiece>> {
        let frame = frame(jpeg);
        let layout = PieceLayout::new(&frame)?;
        let mut header = HeaderDecoder::new();
        header.read_header(frame.data())?;
        layout
            .pieces
            .iter()
            .map(|piece| decode_piece(&header, frame.data(), piece, &layout.scans[0]))
            .collect()
    }

    #[test]
    fn flat_gray() {
        let jpeg = SyntheticJpeg::new(24, 16, &[(1, 1)]).dc(&[5]).build();
        let pieces = decode_all(&jpeg).unwrap();
        assert_eq!(pieces.len(), 1);
        let piece = &pieces[0];
        assert_eq!(piece.mcus, 0..6);
        assert_eq!(piece.blocks.len(), 6);
        for block in &piece.blocks {
            // Quantization table 0 is all 2s.
            assert_eq!(block.coefficients[0], 10);
            assert!(block.coefficients[1..].iter().all(|&c| c == 0));
        }
        let coords: Vec<_> = piece.blocks.iter().map(|b| (b.x, b.y)).collect();
        assert_eq!(coords, [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn interleaved_420() {
        let jpeg = SyntheticJpeg::new(32, 16, &[(2, 2), (1, 1), (1, 1)])
            .dc(&[-4, 3, 7])
            .build();
        let pieces = decode_all(&jpeg).unwrap();
        let blocks = &pieces[0].blocks;
        assert_eq!(blocks.len(), 2 * 6);

        // The first MCU: 4 luma blocks, then one block of each chroma component.
        let first: Vec<_> = blocks[..6]
            .iter()
            .map(|b| (b.component, b.x, b.y, b.coefficients[0]))
            .collect();
        assert_eq!(
            first,
            [
                (0, 0, 0, -8),
                (0, 1, 0, -8),
                (0, 0, 1, -8),
                (0, 1, 1, -8),
                (1, 0, 0, 9),
                (2, 0, 0, 21),
            ]
        );
        assert_eq!((blocks[6].component, blocks[6].x, blocks[6].y), (0, 2, 0));
    }

    #[test]
    fn ac_coefficients() {
        let jpeg = SyntheticJpeg::new(64, 8, &[(1, 1)]).pattern().build();
        let pieces = decode_all(&jpeg).unwrap();
        for (i, block) in pieces[0].blocks.iter().enumerate() {
            let (dc, ac) = SyntheticJpeg::pattern_levels(0, i);
            assert_eq!(block.coefficients[0], dc * 2, "block {i}");
            // zigzag index 1 is natural index 1
            assert_eq!(block.coefficients[1], ac * 2, "block {i}");
        }
    }

    #[test]
    fn restart_intervals() {
        let plain = SyntheticJpeg::new(64, 8, &[(1, 1)]).pattern().build();
        let restarts = SyntheticJpeg::new(64, 8, &[(1, 1)])
            .pattern()
            .restart_interval(3)
            .build();

        let expected = decode_all(&plain).unwrap().remove(0).blocks;
        let pieces = decode_all(&restarts).unwrap();
        assert_eq!(pieces.len(), 3);
        let mcus: Vec<_> = pieces.iter().map(|p| p.mcus.clone()).collect();
        assert_eq!(mcus, [0..3, 3..6, 6..8]);
        let blocks: Vec<_> = pieces.into_iter().flat_map(|p| p.blocks).collect();
        assert_eq!(blocks, expected);
    }

    #[test]
    fn merged_piece_crosses_restart_markers() {
        let jpeg = SyntheticJpeg::new(64, 8, &[(1, 1)])
            .pattern()
            .restart_interval(2)
            .build();
        let frame = frame(&jpeg);
        let mut layout = PieceLayout::new(&frame).unwrap();
        layout.merge(0, 1);
        let mut header = HeaderDecoder::new();
        header.read_header(frame.data()).unwrap();
        let piece = decode_piece(&header, frame.data(), &layout.pieces[0], &layout.scans[0])
            .unwrap();
        assert_eq!(piece.mcus, 0..8);

        let separate: Vec<_> = decode_all(&jpeg)
            .unwrap()
            .into_iter()
            .flat_map(|p| p.blocks)
            .collect();
        assert_eq!(piece.blocks, separate);
    }

    #[test]
    fn wrong_restart_number_is_tolerated() {
        let _ = env_logger::builder().is_test(true).try_init();

        let jpeg = SyntheticJpeg::new(32, 8, &[(1, 1)])
            .pattern()
            .restart_interval(1)
            .build();
        let mut renumbered = jpeg.clone();
        for i in 0..renumbered.len() - 1 {
            if renumbered[i] == 0xFF && renumbered[i + 1] == 0xD1 {
                renumbered[i + 1] = 0xD5;
            }
        }
        assert_ne!(jpeg, renumbered);

        let frame = frame(&renumbered);
        let mut layout = PieceLayout::new(&frame).unwrap();
        layout.merge(0, 1);
        let mut header = HeaderDecoder::new();
        header.read_header(frame.data()).unwrap();
        let piece = decode_piece(&header, frame.data(), &layout.pieces[0], &layout.scans[0])
            .unwrap();
        assert_eq!(piece.blocks.len(), 4);
    }

    #[test]
    fn truncated_piece() {
        let jpeg = SyntheticJpeg::new(64, 64, &[(1, 1)]).pattern().build();
        let frame = frame(&jpeg);
        let layout = PieceLayout::new(&frame).unwrap();
        let mut header = HeaderDecoder::new();
        header.read_header(frame.data()).unwrap();

        let mut piece = layout.pieces[0];
        piece.length /= 2;
        let err = decode_piece(&header, frame.data(), &piece, &layout.scans[0]).unwrap_err();
        assert_eq!(err, Error::BufferExhausted);
    }

    #[test]
    fn missing_tables() {
        // Selector 2 has neither a DHT table nor a standard table.
        let jpeg = SyntheticJpeg::new(8, 8, &[(1, 1)]).scan_selectors(2, 0).build();
        let err = decode_all(&jpeg).unwrap_err();
        expect_test::expect![[r#"Dc Huffman table 2 used by component 1 is not defined"#]]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn standard_tables_without_dht() {
        let jpeg = SyntheticJpeg::new(16, 16, &[(2, 1), (1, 1), (1, 1)])
            .pattern()
            .without_dht()
            .build();
        let with_dht = SyntheticJpeg::new(16, 16, &[(2, 1), (1, 1), (1, 1)])
            .pattern()
            .build();
        assert_eq!(decode_all(&jpeg).unwrap(), decode_all(&with_dht).unwrap());
    }

    #[test]
    fn corrupt_data() {
        // Random scan data is reported as bad data or exhaustion.
        let jpeg = SyntheticJpeg::new(64, 64, &[(1, 1)]).pattern().build();
        let frame = frame(&jpeg);
        let layout = PieceLayout::new(&frame).unwrap();
        let mut header = HeaderDecoder::new();
        header.read_header(frame.data()).unwrap();

        let mut rng = fastrand::Rng::with_seed(7);
        let piece = layout.pieces[0];
        let sos_len = 2 + usize::from(u16::from_be_bytes([
            frame.data()[piece.offset + 2],
            frame.data()[piece.offset + 3],
        ]));
        for _ in 0..100 {
            let mut data = frame.data().to_vec();
            for byte in &mut data[piece.offset + sos_len..piece.end()] {
                *byte = rng.u8(..);
            }
            match decode_piece(&header, &data, &piece, &layout.scans[0]) {
                Ok(_) | Err(Error::BadData(_)) | Err(Error::BufferExhausted) => {}
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
    }

    #[test]
    fn dequantization_saturates() {
        assert_eq!(dequantize(3, 7), 21);
        assert_eq!(dequantize(-2047, 255), i16::MIN);
        assert_eq!(dequantize(4000, 255), i16::MAX);
    }
}
