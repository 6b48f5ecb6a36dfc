//! A complete merger input: clusters plus the segments referencing them.

use crate::cluster::{ClusterStore, SectorClusterStore};
use crate::geometry::Geometry;
use crate::segment::SectorTrack;
use crate::{Error, Result};

/// Clusters and per-sector segments of one event.
#[derive(Debug, Clone)]
pub struct Event {
    pub clusters: SectorClusterStore,
    pub segments: Vec<SectorTrack>,
}

impl Event {
    #[must_use]
    pub fn new(clusters: SectorClusterStore, segments: Vec<SectorTrack>) -> Self {
        Self { clusters, segments }
    }

    /// Total number of segment hits.
    #[must_use]
    pub fn n_segment_hits(&self) -> usize {
        self.segments.iter().map(|s| s.hits.len()).sum()
    }

    /// Checks the event against a geometry.
    ///
    /// # Errors
    /// Returns an error if the store layout disagrees with the geometry or
    /// any segment is malformed.
    pub fn validate<G: Geometry + ?Sized>(&self, geometry: &G) -> Result<()> {
        if self.clusters.n_sectors() != geometry.n_sectors() {
            return Err(Error::Config(format!(
                "cluster store has {} sectors, geometry {}",
                self.clusters.n_sectors(),
                geometry.n_sectors()
            )));
        }
        if self.clusters.n_rows() != geometry.n_rows() {
            return Err(Error::Config(format!(
                "cluster store has {} rows, geometry {}",
                self.clusters.n_rows(),
                geometry.n_rows()
            )));
        }
        for (id, segment) in self.segments.iter().enumerate() {
            segment.validate(id, &self.clusters)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CylindricalGeometry;

    #[test]
    fn test_layout_mismatch() {
        let geo = CylindricalGeometry::default();
        let event = Event::new(SectorClusterStore::empty(4, 4), Vec::new());
        assert!(event.validate(&geo).is_err());

        let ok = Event::new(
            SectorClusterStore::empty(geo.n_sectors(), geo.n_rows()),
            Vec::new(),
        );
        assert!(ok.validate(&geo).is_ok());
        assert_eq!(ok.n_segment_hits(), 0);
    }
}
