//! Parallel decoding of frames.
//!
//! The [`Dispatcher`] owns a fixed pool of worker threads, each with its own [`WorkerSlot`]. A
//! slot holds a [`HeaderDecoder`] whose tables match the picture it last worked on, so the
//! headers of a frame are only parsed again when a worker moves on to a different picture or
//! scan.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    config::{DecoderConfig, MAX_THREADS},
    error::{Error, Result},
    frame::FrameSegment,
    header::{HeaderDecoder, ScanDescriptor},
    metadata::FrameInfo,
    output::Output,
    piece::{Piece, PieceLayout},
    scan::{decode_piece, DecodedPiece},
};

/// Identifies a prepared [`Picture`].
///
/// Every call to [`Dispatcher::prepare`] hands out a new value, unique across all dispatchers in
/// the process, so a worker never mistakes another dispatcher's picture for the one it cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A frame whose headers have been parsed and whose scan data has been split into pieces.
#[derive(Debug)]
pub struct Picture {
    generation: Generation,
    frame: FrameSegment,
    info: FrameInfo,
    scans: Vec<ScanDescriptor>,
    layout: PieceLayout,
}

impl Picture {
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    pub fn frame(&self) -> &FrameSegment {
        &self.frame
    }

    #[inline]
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    #[inline]
    pub fn scans(&self) -> &[ScanDescriptor] {
        &self.scans
    }

    #[inline]
    pub fn pieces(&self) -> &[Piece] {
        &self.layout.pieces
    }
}

/// Per-worker decoding state.
pub struct WorkerSlot {
    header: HeaderDecoder,
    /// Picture whose headers `header` holds, up to scan `scan`.
    last_parsed: Option<Generation>,
    scan: usize,
    finished: Vec<(usize, Result<DecodedPiece>)>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            header: HeaderDecoder::new(),
            last_parsed: None,
            scan: 0,
            finished: Vec::new(),
        }
    }

    /// Brings `header` up to date with scan `scan` of `picture`.
    fn sync(&mut self, picture: &Picture, scan: usize) -> Result<()> {
        let result = self.sync_impl(picture, scan);
        if result.is_err() {
            self.last_parsed = None;
        }
        result
    }

    fn sync_impl(&mut self, picture: &Picture, scan: usize) -> Result<()> {
        let data = picture.frame.data();
        if self.last_parsed != Some(picture.generation) || scan < self.scan {
            log::trace!(
                "worker parsing headers of {:?} (scan {scan})",
                picture.generation
            );
            self.last_parsed = None;
            self.header.read_header(data)?;
            self.scan = 0;
            self.last_parsed = Some(picture.generation);
        }

        while self.scan < scan {
            let next = self.scan + 1;
            let location = &picture.layout.scans[next];
            self.header
                .read_scan_header(&data[location.header_offset..], next)?;
            self.scan = next;
        }
        Ok(())
    }

    fn decode(&mut self, picture: &Picture, index: usize) -> Result<DecodedPiece> {
        let Some(piece) = picture.layout.pieces.get(index) else {
            return Err(Error::bad_data(format!(
                "piece index {index} out of range ({} pieces)",
                picture.layout.pieces.len()
            )));
        };
        self.sync(picture, piece.scan)?;
        let location = &picture.layout.scans[piece.scan];
        decode_piece(&self.header, picture.frame.data(), piece, location)
    }
}

/// Outcome of [`Dispatcher::decode_picture`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    pub pieces: usize,
    pub decoded: usize,
    pub blocks: usize,
    /// Index and error of every piece that failed to decode.
    pub failed: Vec<(usize, Error)>,
}

impl DecodeReport {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Decodes pictures on a pool of worker threads.
pub struct Dispatcher {
    pool: ThreadPool,
    slots: Vec<WorkerSlot>,
    header: HeaderDecoder,
    max_pieces_per_scan: Option<usize>,
}

impl Dispatcher {
    pub fn new(config: &DecoderConfig) -> Result<Self> {
        let threads = config.threads().clamp(1, MAX_THREADS);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mjpeg-dec-{i}"))
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        Ok(Self {
            pool,
            slots: (0..threads).map(|_| WorkerSlot::new()).collect(),
            header: HeaderDecoder::new(),
            max_pieces_per_scan: config.max_pieces_per_scan(),
        })
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    /// Parses the headers of `frame` and splits its scan data into pieces.
    pub fn prepare(&mut self, frame: FrameSegment) -> Result<Picture> {
        let (info, _) = self.header.read_header(frame.data())?;
        let mut layout = PieceLayout::new(&frame)?;

        let mut scans = Vec::with_capacity(layout.scans.len());
        for (i, location) in layout.scans.iter().enumerate() {
            if i != 0 {
                self.header
                    .read_scan_header(&frame.data()[location.header_offset..], i)?;
            }
            let Some(scan) = self.header.scan(i) else {
                return Err(Error::bad_data(format!("scan {i} has no header")));
            };
            scans.push(scan.clone());
        }

        for (i, scan) in scans.iter().enumerate() {
            if scan.restart_interval == 0 {
                // Without restart intervals, RST markers carry no meaning.
                layout.merge(i, 1);
            } else if let Some(max) = self.max_pieces_per_scan {
                layout.merge(i, max);
            }
        }

        let generation = Generation::next();
        log::debug!(
            "prepared {:?}: {}x{} {:?}, {} scans, {} pieces",
            generation,
            info.width,
            info.height,
            info.sampling,
            scans.len(),
            layout.pieces.len(),
        );

        Ok(Picture {
            generation,
            frame,
            info,
            scans,
            layout,
        })
    }

    /// Decodes piece `index` of `picture` on the calling thread, using the state of worker
    /// `worker`.
    pub fn decode_piece(
        &mut self,
        worker: usize,
        picture: &Picture,
        index: usize,
    ) -> Result<DecodedPiece> {
        let workers = self.slots.len();
        let Some(slot) = self.slots.get_mut(worker) else {
            return Err(Error::bad_data(format!(
                "worker {worker} out of range ({workers} workers)"
            )));
        };
        slot.decode(picture, index)
    }

    /// Decodes all pieces of `picture` in parallel and writes them to `output`.
    ///
    /// A piece that fails to decode marks `output` as corrupted, but does not affect the other
    /// pieces.
    pub fn decode_picture<O: Output + ?Sized>(
        &mut self,
        picture: &Picture,
        output: &mut O,
    ) -> DecodeReport {
        let count = picture.layout.pieces.len();
        let next = AtomicUsize::new(0);

        let Self { pool, slots, .. } = self;
        pool.scope(|s| {
            for slot in slots.iter_mut() {
                let next = &next;
                s.spawn(move |_| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    if index >= count {
                        break;
                    }
                    let result = slot.decode(picture, index);
                    slot.finished.push((index, result));
                });
            }
        });

        let mut results: Vec<_> = slots
            .iter_mut()
            .flat_map(|slot| slot.finished.drain(..))
            .collect();
        results.sort_by_key(|(index, _)| *index);

        let mut report = DecodeReport {
            pieces: count,
            ..Default::default()
        };
        for (index, result) in results {
            match result {
                Ok(piece) => {
                    piece.write_to(output);
                    report.decoded += 1;
                    report.blocks += piece.blocks.len();
                }
                Err(e) => {
                    log::warn!("piece {index} of {:?} failed: {e}", picture.generation);
                    output.set_corrupted();
                    report.failed.push((index, e));
                }
            }
        }

        log::debug!(
            "decoded {:?}: {}/{} pieces, {} blocks",
            picture.generation,
            report.decoded,
            report.pieces,
            report.blocks
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{Bitstream, FrameConstructor, InputFlags},
        output::Surface,
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

    fn decode_sequential(dispatcher: &mut Dispatcher, picture: &Picture) -> Surface {
        let mut surface = Surface::new(picture.info());
        for index in 0..picture.pieces().len() {
            dispatcher
                .decode_piece(0, picture, index)
                .unwrap()
                .write_to(&mut surface);
        }
        surface
    }

    #[test]
    fn generations() {
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default()).unwrap();
        assert_eq!(dispatcher.num_workers(), 4);
        let jpeg = SyntheticJpeg::new(8, 8, &[(1, 1)]).build();
        let a = dispatcher.prepare(frame(&jpeg)).unwrap();
        let b = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert_ne!(a.generation(), b.generation());
        assert!(a.generation() < b.generation());
    }

    #[test]
    fn pictures_from_another_dispatcher() {
        let x = SyntheticJpeg::new(16, 8, &[(1, 1)]).dc(&[3]).build();
        let y = SyntheticJpeg::new(16, 8, &[(1, 1), (1, 1), (1, 1)])
            .dc(&[-2, 1, 1])
            .build();
        let config = DecoderConfig::default().with_threads(1);
        let mut a = Dispatcher::new(&config).unwrap();
        let mut b = Dispatcher::new(&config).unwrap();

        let x = a.prepare(frame(&x)).unwrap();
        let mut surface = Surface::new(x.info());
        assert!(a.decode_picture(&x, &mut surface).is_complete());

        let y = b.prepare(frame(&y)).unwrap();
        assert_ne!(x.generation(), y.generation());
        let mut surface = Surface::new(y.info());
        let report = a.decode_picture(&y, &mut surface);
        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.blocks, 6);
        assert_eq!(surface.plane(0).unwrap().block(0, 0).unwrap()[0], -4);
        assert_eq!(surface.plane(1).unwrap().block(0, 0).unwrap()[0], 3);
    }

    #[test]
    fn worker_switches_pictures() {
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default().with_threads(1)).unwrap();
        let a = SyntheticJpeg::new(16, 8, &[(1, 1)]).dc(&[3]).build();
        let b = SyntheticJpeg::new(16, 8, &[(1, 1), (1, 1), (1, 1)])
            .dc(&[-2, 1, 1])
            .build();
        let a = dispatcher.prepare(frame(&a)).unwrap();
        let b = dispatcher.prepare(frame(&b)).unwrap();

        for _ in 0..2 {
            let piece = dispatcher.decode_piece(0, &a, 0).unwrap();
            assert_eq!(piece.blocks.len(), 2);
            assert_eq!(piece.blocks[0].coefficients[0], 6);

            let piece = dispatcher.decode_piece(0, &b, 0).unwrap();
            assert_eq!(piece.blocks.len(), 6);
            assert_eq!(piece.blocks[0].coefficients[0], -4);
            assert_eq!(piece.blocks[1].coefficients[0], 3);
        }
    }

    #[test]
    fn scans_in_any_order() {
        let jpeg = SyntheticJpeg::new(32, 16, &[(2, 1), (1, 1), (1, 1)])
            .pattern()
            .restart_interval(1)
            .scan_components(&[0])
            .extra_scan(&[1])
            .extra_scan(&[2])
            .build();
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default().with_threads(1)).unwrap();
        let picture = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert_eq!(picture.scans().len(), 3);

        let forward: Vec<_> = (0..picture.pieces().len())
            .map(|i| dispatcher.decode_piece(0, &picture, i).unwrap())
            .collect();
        let backward: Vec<_> = (0..picture.pieces().len())
            .rev()
            .map(|i| dispatcher.decode_piece(0, &picture, i).unwrap())
            .collect();
        assert!(forward.iter().eq(backward.iter().rev()));
        let scans: Vec<_> = forward.iter().map(|p| p.scan).collect();
        assert!(scans.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(scans.last(), Some(&2));
    }

    #[test]
    fn parallel_matches_sequential() {
        let _ = env_logger::builder().is_test(true).try_init();

        let jpeg = SyntheticJpeg::new(96, 48, &[(2, 2), (1, 1), (1, 1)])
            .pattern()
            .restart_interval(1)
            .build();
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default()).unwrap();
        let picture = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert_eq!(picture.pieces().len(), 18);

        let mut parallel = Surface::new(picture.info());
        let report = dispatcher.decode_picture(&picture, &mut parallel);
        assert!(report.is_complete());
        assert_eq!(report.decoded, 18);
        assert_eq!(report.blocks, 18 * 6);
        assert!(!parallel.is_corrupted());

        let sequential = decode_sequential(&mut dispatcher, &picture);
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn merged_pieces() {
        let jpeg = SyntheticJpeg::new(96, 48, &[(2, 1), (1, 1), (1, 1)])
            .pattern()
            .restart_interval(4)
            .build();
        let config = DecoderConfig::default().with_max_pieces_per_scan(2);
        let mut dispatcher = Dispatcher::new(&config).unwrap();
        let merged = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert_eq!(merged.pieces().len(), 2);
        let mut a = Surface::new(merged.info());
        assert!(dispatcher.decode_picture(&merged, &mut a).is_complete());

        let mut dispatcher = Dispatcher::new(&DecoderConfig::default()).unwrap();
        let split = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert_eq!(split.pieces().len(), 9);
        let mut b = Surface::new(split.info());
        assert!(dispatcher.decode_picture(&split, &mut b).is_complete());
        assert_eq!(a, b);
    }

    #[test]
    fn corrupt_piece() {
        let jpeg = SyntheticJpeg::new(64, 8, &[(1, 1)])
            .pattern()
            .restart_interval(2)
            .build();
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default()).unwrap();
        let good = dispatcher.prepare(frame(&jpeg)).unwrap();
        let mut expected = Surface::new(good.info());
        dispatcher.decode_picture(&good, &mut expected);

        // Truncate the second piece by cutting its data short.
        let piece = good.pieces()[1];
        let mut damaged = jpeg.clone();
        damaged.drain(piece.offset + 3..piece.end());
        let picture = dispatcher.prepare(frame(&damaged)).unwrap();
        assert_eq!(picture.pieces().len(), 4);

        let mut surface = Surface::new(picture.info());
        let report = dispatcher.decode_picture(&picture, &mut surface);
        assert_eq!(report.decoded, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 1);
        assert!(surface.is_corrupted());

        // The other pieces are unaffected.
        let plane = surface.plane(0).unwrap();
        let reference = expected.plane(0).unwrap();
        for x in [0, 1, 4, 5, 6, 7] {
            assert_eq!(plane.block(x, 0), reference.block(x, 0), "block {x}");
        }
    }

    #[test]
    fn bad_indices() {
        let mut dispatcher = Dispatcher::new(&DecoderConfig::default().with_threads(2)).unwrap();
        let jpeg = SyntheticJpeg::new(8, 8, &[(1, 1)]).build();
        let picture = dispatcher.prepare(frame(&jpeg)).unwrap();
        assert!(dispatcher.decode_piece(2, &picture, 0).is_err());
        assert!(dispatcher.decode_piece(1, &picture, 1).is_err());
        assert!(dispatcher.decode_piece(1, &picture, 0).is_ok());
    }
}
