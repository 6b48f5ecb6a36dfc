//! Shared arenas written concurrently by per-track kernels.
//!
//! * [`AppendArena`] hands out slots with one `fetch_add`; each slot is
//!   written at most once. Claims past the capacity are dropped and raise
//!   the arena's [`ErrorCode`].
//! * [`AttachmentArena`] keeps one word per cluster, merged with
//!   `fetch_max`. The final word is the largest claim issued, whatever the
//!   arrival order.
//! * [`ErrorFlags`] collects error codes; the first raise of a code is
//!   logged, later ones are only counted.
//!
//! All arenas are read back only after the kernels have joined.

use log::warn;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Run-level error codes raised by kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// Output track array full.
    TrackOverflow,
    /// Output cluster array full.
    ClusterOverflow,
    /// Deferred looper queue full.
    LoopOverflow,
    /// Attachment claim outside the cluster range.
    AttachmentOverflow,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 4] = [
        ErrorCode::TrackOverflow,
        ErrorCode::ClusterOverflow,
        ErrorCode::LoopOverflow,
        ErrorCode::AttachmentOverflow,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    #[inline]
    #[must_use]
    pub fn bit(self) -> u32 {
        1 << self.index()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::TrackOverflow => "track output overflow",
            ErrorCode::ClusterOverflow => "cluster output overflow",
            ErrorCode::LoopOverflow => "looper queue overflow",
            ErrorCode::AttachmentOverflow => "attachment overflow",
        }
    }
}

/// Atomic error bit set with per-code drop counters.
#[derive(Debug, Default)]
pub struct ErrorFlags {
    bits: AtomicU32,
    counts: [AtomicU64; 4],
}

impl ErrorFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `code`. Returns true for the first raise.
    pub fn raise(&self, code: ErrorCode) -> bool {
        self.counts[code.index()].fetch_add(1, Ordering::Relaxed);
        let previous = self.bits.fetch_or(code.bit(), Ordering::AcqRel);
        let first = previous & code.bit() == 0;
        if first {
            warn!("{} raised", code.name());
        }
        first
    }

    #[must_use]
    pub fn is_raised(&self, code: ErrorCode) -> bool {
        self.bits.load(Ordering::Acquire) & code.bit() != 0
    }

    /// Number of raises of `code`.
    #[must_use]
    pub fn count(&self, code: ErrorCode) -> u64 {
        self.counts[code.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of the raised codes.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        let entries = ErrorCode::ALL
            .iter()
            .filter(|c| self.is_raised(**c))
            .map(|&c| (c, self.count(c)))
            .collect();
        ErrorReport { entries }
    }
}

/// Raised codes with their drop counts, in code order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorReport {
    pub entries: Vec<(ErrorCode, u64)>,
}

impl ErrorReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Each raised code once.
    #[must_use]
    pub fn codes(&self) -> Vec<ErrorCode> {
        self.entries.iter().map(|(c, _)| *c).collect()
    }

    #[must_use]
    pub fn count(&self, code: ErrorCode) -> u64 {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(0, |(_, n)| *n)
    }
}

/// Append-only array with atomic slot claims.
#[derive(Debug)]
pub struct AppendArena<T> {
    slots: Vec<OnceLock<T>>,
    next: AtomicUsize,
    code: ErrorCode,
}

impl<T> AppendArena<T> {
    /// Creates an arena with `capacity` slots raising `code` on overflow.
    #[must_use]
    pub fn with_capacity(capacity: usize, code: ErrorCode) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, OnceLock::new);
        Self {
            slots,
            next: AtomicUsize::new(0),
            code,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of successfully claimed slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.next.load(Ordering::Acquire).min(self.slots.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims one slot.
    pub fn claim(&self, errors: &ErrorFlags) -> Option<usize> {
        self.claim_range(1, errors).map(|r| r.start)
    }

    /// Claims `n` consecutive slots.
    pub fn claim_range(&self, n: usize, errors: &ErrorFlags) -> Option<Range<usize>> {
        let start = self.next.fetch_add(n, Ordering::AcqRel);
        match start.checked_add(n) {
            Some(end) if end <= self.slots.len() => Some(start..end),
            _ => {
                errors.raise(self.code);
                None
            }
        }
    }

    /// Writes a claimed slot. Returns false if the slot was already written
    /// or lies outside the arena.
    pub fn set(&self, index: usize, value: T) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.set(value).is_ok())
    }

    /// Claims a slot and writes `value`.
    pub fn push(&self, value: T, errors: &ErrorFlags) -> Option<usize> {
        let index = self.claim(errors)?;
        self.set(index, value);
        Some(index)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(OnceLock::get)
    }

    /// Moves out every written slot with its index, leaving the arena empty.
    pub fn take_all(&mut self) -> Vec<(usize, T)> {
        let out = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.take().map(|v| (i, v)))
            .collect();
        *self.next.get_mut() = 0;
        out
    }
}

/// Per-cluster ownership words merged by atomic max.
#[derive(Debug)]
pub struct AttachmentArena {
    words: Vec<AtomicU32>,
}

impl AttachmentArena {
    #[must_use]
    pub fn new(n_clusters: usize) -> Self {
        let mut words = Vec::with_capacity(n_clusters);
        words.resize_with(n_clusters, || AtomicU32::new(0));
        Self { words }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Merges `word` into cluster `index`. Returns true if `word` is now the
    /// stored maximum; losing claims leave the word untouched.
    pub fn claim(&self, index: usize, word: u32, errors: &ErrorFlags) -> bool {
        let Some(slot) = self.words.get(index) else {
            errors.raise(ErrorCode::AttachmentOverflow);
            return false;
        };
        slot.fetch_max(word, Ordering::AcqRel) <= word
    }

    #[must_use]
    pub fn load(&self, index: usize) -> u32 {
        self.words
            .get(index)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Rewrites every word in place; used by the single-threaded compaction.
    pub fn remap(&mut self, mut f: impl FnMut(u32) -> u32) {
        for w in &mut self.words {
            let v = w.get_mut();
            *v = f(*v);
        }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u32> {
        self.words.into_iter().map(AtomicU32::into_inner).collect()
    }
}
