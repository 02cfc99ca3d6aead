/// Maximum number of worker threads a [`Dispatcher`](crate::dispatch::Dispatcher) will use.
pub const MAX_THREADS: usize = 4;

/// Smallest usable number of marker index entries per frame.
const MIN_MARKER_LIMIT: usize = 4;

/// Decoder configuration.
///
/// Obtain one via [`Default`] and adjust it with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    threads: usize,
    max_bitstream_size: usize,
    marker_limit: usize,
    max_pieces_per_scan: Option<usize>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            threads: MAX_THREADS,
            max_bitstream_size: 0,
            marker_limit: 2048,
            max_pieces_per_scan: None,
        }
    }
}

impl DecoderConfig {
    /// Sets the number of worker threads, clamped to `1..=4`.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.clamp(1, MAX_THREADS);
        self
    }

    /// Sets the expected maximum size of one compressed frame in bytes.
    ///
    /// The frame constructor uses this to decide how finely restart markers are indexed, and
    /// discards units that grow beyond it without a marker. 0 (the default) lets
    /// [`Decoder`](crate::Decoder) derive it from the size of the frames it decodes.
    pub fn with_max_bitstream_size(mut self, size: usize) -> Self {
        self.max_bitstream_size = size;
        self
    }

    /// Sets the maximum number of marker index entries per frame (at least 4).
    pub fn with_marker_limit(mut self, limit: usize) -> Self {
        self.marker_limit = limit.max(MIN_MARKER_LIMIT);
        self
    }

    /// Merges the pieces of each scan until at most `max` remain.
    pub fn with_max_pieces_per_scan(mut self, max: usize) -> Self {
        self.max_pieces_per_scan = Some(max.max(1));
        self
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    #[inline]
    pub fn max_bitstream_size(&self) -> usize {
        self.max_bitstream_size
    }

    #[inline]
    pub fn marker_limit(&self) -> usize {
        self.marker_limit
    }

    #[inline]
    pub fn max_pieces_per_scan(&self) -> Option<usize> {
        self.max_pieces_per_scan
    }
}
