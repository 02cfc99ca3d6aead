//! Tracks decode completion per status report number.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Status of a submitted frame, as returned by [`FeedbackMap::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// The frame has been submitted but not finished decoding.
    Busy,
    /// The frame has been decoded into `surface`. `corrupted` is set if any part of it failed
    /// to decode.
    Done { surface: u32, corrupted: bool },
}

/// Number of reports a [`FeedbackMap::new`] map holds before finished ones are evicted.
pub const DEFAULT_FEEDBACK_CAPACITY: usize = 64;

#[derive(Debug)]
struct Entry {
    surface: u32,
    state: State,
    /// Completion order, used to evict the oldest finished report first.
    finished_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Submitted,
    Ready,
    Corrupted,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<u32, Entry>,
    completions: u64,
}

/// Maps status report numbers to their destination surface and completion state.
///
/// Can be shared between the submitting thread and threads querying the status.
///
/// The map holds a bounded number of reports. Once it is full, submitting a new report evicts
/// the finished report that completed first, so callers that never poll do not make it grow.
/// Reports that are still busy are never evicted.
#[derive(Debug)]
pub struct FeedbackMap {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl Default for FeedbackMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackMap {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEEDBACK_CAPACITY)
    }

    /// Creates a map that keeps at least 1 and at most `capacity` reports, unless more are busy.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::default(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries are only replaced as a whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that the frame with status report number `report` will be decoded into
    /// `surface`.
    pub fn submit(&self, report: u32, surface: u32) {
        let entry = Entry {
            surface,
            state: State::Submitted,
            finished_at: 0,
        };
        let mut entries = self.lock();
        if !entries.map.contains_key(&report) {
            self.evict(&mut entries);
        }
        if let Some(old) = entries.map.insert(report, entry) {
            log::warn!(
                "status report {report} reused while still pending (surface {})",
                old.surface
            );
        }
    }

    fn evict(&self, entries: &mut Entries) {
        while entries.map.len() >= self.capacity {
            let oldest = entries
                .map
                .iter()
                .filter(|(_, entry)| entry.state != State::Submitted)
                .min_by_key(|(_, entry)| entry.finished_at)
                .map(|(&report, _)| report);
            let Some(report) = oldest else {
                break;
            };
            log::debug!("evicting unpolled status report {report}");
            entries.map.remove(&report);
        }
    }

    /// Marks report `report` as decoded. Returns `false` if it was never submitted.
    pub fn complete(&self, report: u32, corrupted: bool) -> bool {
        let mut entries = self.lock();
        entries.completions += 1;
        let order = entries.completions;
        match entries.map.get_mut(&report) {
            Some(entry) => {
                entry.state = if corrupted {
                    State::Corrupted
                } else {
                    State::Ready
                };
                entry.finished_at = order;
                true
            }
            None => {
                log::warn!("completion for unknown status report {report}");
                false
            }
        }
    }

    /// Returns the status of `report`, or `None` if it is unknown.
    ///
    /// A finished report is removed from the map once it has been returned.
    pub fn poll(&self, report: u32) -> Option<ReportStatus> {
        let mut entries = self.lock();
        let entry = entries.map.get(&report)?;
        let corrupted = match entry.state {
            State::Submitted => return Some(ReportStatus::Busy),
            State::Ready => false,
            State::Corrupted => true,
        };
        let surface = entry.surface;
        entries.map.remove(&report);
        Some(ReportStatus::Done { surface, corrupted })
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Forgets all reports.
    pub fn reset(&self) {
        self.lock().map.clear();
    }
}
