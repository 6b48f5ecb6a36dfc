//! Per-sector track segments produced by local pattern recognition.

use crate::cluster::ClusterStore;
use crate::param::TrackParam;
use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Reference from a segment into the cluster store of its sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmentHit {
    /// Pad row.
    pub row: u16,
    /// Index of the cluster within the row.
    pub index: u32,
}

impl SegmentHit {
    #[must_use]
    pub fn new(row: u16, index: u32) -> Self {
        Self { row, index }
    }
}

/// One locally found track segment.
///
/// `hits` are ordered along the flight direction of the particle. `param`
/// is the local fit in the frame of `sector`; its orientation follows the
/// radial direction of the hits (see [`crate::param`]).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SectorTrack {
    /// Sector that found the segment.
    pub sector: usize,
    /// Local estimate.
    pub param: TrackParam,
    /// Linear z offset of the segment (time/position ambiguity).
    pub z_offset: f64,
    /// Hits in flight order.
    pub hits: Vec<SegmentHit>,
}

impl SectorTrack {
    #[must_use]
    pub fn new(sector: usize, param: TrackParam, hits: Vec<SegmentHit>) -> Self {
        Self {
            sector,
            param,
            z_offset: 0.0,
            hits,
        }
    }

    /// Sets the linear z offset.
    #[must_use]
    pub fn with_z_offset(mut self, z_offset: f64) -> Self {
        self.z_offset = z_offset;
        self
    }

    /// Row of the first hit in flight order.
    #[must_use]
    pub fn first_row(&self) -> usize {
        self.hits.first().map_or(0, |h| usize::from(h.row))
    }

    /// Row of the last hit in flight order.
    #[must_use]
    pub fn last_row(&self) -> usize {
        self.hits.last().map_or(0, |h| usize::from(h.row))
    }

    /// True if the particle moves to larger radius along the segment.
    #[must_use]
    pub fn is_outward(&self) -> bool {
        self.last_row() >= self.first_row()
    }

    /// Smallest row touched by the segment.
    #[must_use]
    pub fn inner_row(&self) -> usize {
        self.hits
            .iter()
            .map(|h| usize::from(h.row))
            .min()
            .unwrap_or(0)
    }

    /// Dip slope in the direction of flight.
    #[must_use]
    pub fn physical_tgl(&self) -> f64 {
        if self.is_outward() {
            self.param.tgl()
        } else {
            -self.param.tgl()
        }
    }

    /// Checks hit references and parameters against a cluster store.
    ///
    /// # Errors
    /// Returns an error for an empty segment, a sector or cluster reference
    /// outside the store, or non-finite parameters.
    pub fn validate<S: ClusterStore + ?Sized>(&self, id: usize, store: &S) -> Result<()> {
        if self.hits.is_empty() {
            return Err(Error::EmptySegment(id));
        }
        if self.sector >= store.n_sectors() {
            return Err(Error::InvalidSector {
                sector: self.sector,
                n_sectors: store.n_sectors(),
            });
        }
        for hit in &self.hits {
            let row = usize::from(hit.row);
            if store.cluster(self.sector, row, hit.index).is_none() {
                return Err(Error::InvalidHitReference {
                    segment: id,
                    sector: self.sector,
                    row,
                    index: hit.index,
                });
            }
        }
        if !self.param.is_valid() || !self.z_offset.is_finite() {
            return Err(Error::InvalidParameters(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterStoreBuilder};
    use crate::param::Covariance;

    fn param() -> TrackParam {
        TrackParam::new(100.0, 0.0, [0.0, 0.0, 0.1, 0.5, 1.0], Covariance::default())
    }

    #[test]
    fn test_orientation() {
        let out = SectorTrack::new(0, param(), vec![SegmentHit::new(2, 0), SegmentHit::new(5, 0)]);
        assert!(out.is_outward());
        assert!((out.physical_tgl() - 0.5).abs() < 1e-12);

        let inward =
            SectorTrack::new(0, param(), vec![SegmentHit::new(5, 0), SegmentHit::new(2, 0)]);
        assert!(!inward.is_outward());
        assert!((inward.physical_tgl() + 0.5).abs() < 1e-12);
        assert_eq!(inward.inner_row(), 2);
    }

    #[test]
    fn test_validate() {
        let mut builder = ClusterStoreBuilder::new(2, 4);
        builder.push(1, 3, Cluster::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        let store = builder.build().unwrap();

        let good = SectorTrack::new(1, param(), vec![SegmentHit::new(3, 0)]);
        assert!(good.validate(0, &store).is_ok());

        let missing = SectorTrack::new(1, param(), vec![SegmentHit::new(3, 1)]);
        assert!(matches!(
            missing.validate(4, &store),
            Err(Error::InvalidHitReference { segment: 4, .. })
        ));

        let empty = SectorTrack::new(1, param(), Vec::new());
        assert!(matches!(empty.validate(2, &store), Err(Error::EmptySegment(2))));

        let mut nan = good.clone();
        nan.param.p[0] = f64::NAN;
        assert!(matches!(nan.validate(1, &store), Err(Error::InvalidParameters(1))));
    }
}
