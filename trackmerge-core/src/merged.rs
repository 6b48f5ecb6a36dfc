//! Fused hit lists and merged-track output records.

use crate::param::TrackParam;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// State flag bits of a fused hit.
pub mod hit_state {
    /// Cluster lies at the sector edge.
    pub const EDGE: u8 = 0x04;
    /// Rejected as a distant outlier (tolerated unless escalated).
    pub const REJECT_DISTANCE: u8 = 0x20;
    /// Rejected in a bad track region.
    pub const REJECT_ERROR: u8 = 0x40;
    /// Any rejection.
    pub const REJECT: u8 = REJECT_DISTANCE | REJECT_ERROR;
    /// Not used in the fit of the current pass.
    pub const NOT_FIT: u8 = 0x80;
    /// Hits dropped by the output formatter.
    pub const DROPPED: u8 = REJECT | NOT_FIT;
}

/// Quality bits of a merged track.
pub mod track_flags {
    /// Passed the acceptance gate.
    pub const OK: u8 = 0x01;
    /// More than one leg.
    pub const LOOPER: u8 = 0x02;
    /// Hits on both sides of the central electrode.
    pub const CE: u8 = 0x04;
    /// Track lies on the C side.
    pub const SIDE_C: u8 = 0x08;
}

/// Priority bits in the upper nibble of an attachment word.
pub mod attach {
    /// Claimed by a tube search.
    pub const TUBE: u32 = 0x1 << 28;
    /// Used by a stored track.
    pub const FIT: u32 = 0x2 << 28;
    /// Hit on the primary leg.
    pub const PRIMARY_LEG: u32 = 0x4 << 28;
    /// Owner passed the acceptance gate.
    pub const GOOD_TRACK: u32 = 0x8 << 28;
    /// All priority bits.
    pub const FLAG_MASK: u32 = 0xF << 28;
    /// Owner id bits.
    pub const ID_MASK: u32 = !FLAG_MASK;
    /// Largest encodable owner id.
    pub const MAX_ID: u32 = ID_MASK;

    /// Packs priority flags and an owner id.
    #[inline]
    #[must_use]
    pub const fn encode(flags: u32, id: u32) -> u32 {
        (flags & FLAG_MASK) | (id & ID_MASK)
    }

    /// Owner id of a word.
    #[inline]
    #[must_use]
    pub const fn owner(word: u32) -> u32 {
        word & ID_MASK
    }

    /// Priority flags of a word.
    #[inline]
    #[must_use]
    pub const fn flags(word: u32) -> u32 {
        word & FLAG_MASK
    }
}

/// Entry of a fused hit list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterRef {
    pub sector: u16,
    pub row: u16,
    pub index: u32,
    /// Direction-consistent part of a looper, starting at 0.
    pub leg: u8,
    /// [`hit_state`] bits.
    pub state: u8,
}

impl ClusterRef {
    #[must_use]
    pub fn new(sector: u16, row: u16, index: u32, leg: u8) -> Self {
        Self {
            sector,
            row,
            index,
            leg,
            state: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn has(&self, bits: u8) -> bool {
        self.state & bits != 0
    }

    #[inline]
    pub fn set(&mut self, bits: u8) {
        self.state |= bits;
    }

    #[inline]
    pub fn clear(&mut self, bits: u8) {
        self.state &= !bits;
    }

    /// Same pad row of the same sector.
    #[inline]
    #[must_use]
    pub fn same_row(&self, other: &Self) -> bool {
        self.sector == other.sector && self.row == other.row
    }
}

/// Renumbered hit reference in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputClusterRef {
    pub sector: u16,
    pub row: u16,
    /// Global cluster index.
    pub cluster: u32,
    pub leg: u8,
    pub state: u8,
}

/// Drift-time window around the production time, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeWindow {
    /// Allowed shift towards earlier production.
    pub before: f64,
    /// Allowed shift towards later production.
    pub after: f64,
}

/// A merged track in the output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputTrack {
    /// Candidate the track was built from.
    pub candidate: u32,
    /// Fitted parameters at the reference X.
    pub param: TrackParam,
    /// Parameters at the outermost fitted hit of the primary leg.
    pub outer: Option<TrackParam>,
    /// [`track_flags`] bits.
    pub flags: u8,
    pub chi2: f64,
    pub ndf: i32,
    /// Truncated-mean energy loss.
    pub dedx: f64,
    pub n_accepted: u32,
    pub n_tolerated: u32,
    /// Number of legs.
    pub n_legs: u8,
    pub time_window: TimeWindow,
    /// First entry in the output cluster array.
    pub cluster_offset: u32,
    pub n_clusters: u32,
}

impl OutputTrack {
    #[inline]
    #[must_use]
    pub fn has(&self, bits: u8) -> bool {
        self.flags & bits != 0
    }

    /// Sign of the detector side, +1 for A.
    #[must_use]
    pub fn side_sign(&self) -> f64 {
        if self.has(track_flags::SIDE_C) {
            -1.0
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_encoding_orders_by_priority() {
        let low = attach::encode(attach::TUBE, attach::MAX_ID);
        let high = attach::encode(attach::FIT, 0);
        assert!(high > low);
        assert_eq!(attach::owner(low), attach::MAX_ID);
        assert_eq!(attach::flags(high), attach::FIT);
        assert_eq!(attach::owner(attach::encode(attach::GOOD_TRACK, 77)), 77);
    }

    #[test]
    fn test_cluster_ref_flags() {
        let mut r = ClusterRef::new(3, 10, 4, 0);
        assert!(!r.has(hit_state::DROPPED));
        r.set(hit_state::REJECT_DISTANCE);
        assert!(r.has(hit_state::REJECT));
        assert!(!r.has(hit_state::REJECT_ERROR));
        r.clear(hit_state::REJECT);
        assert_eq!(r.state, 0);
        assert!(r.same_row(&ClusterRef::new(3, 10, 9, 1)));
    }
}
