//! Cluster measurements and the shared cluster store.

use crate::spatial::SpatialGrid;
use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Flag bits carried by a cluster from the hit finder.
pub mod cluster_flags {
    /// Cluster was split in pad direction.
    pub const SPLIT_PAD: u8 = 0x01;
    /// Cluster was split in time direction.
    pub const SPLIT_TIME: u8 = 0x02;
    /// Cluster touches the sector edge.
    pub const EDGE: u8 = 0x04;
    /// Single-pad cluster.
    pub const SINGLE: u8 = 0x08;
}

/// One 2-D measurement in a pad row.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cluster {
    /// Pad-direction coordinate in the sector frame (cm).
    pub y: f32,
    /// Drift-direction coordinate (cm).
    pub z: f32,
    /// Integrated charge.
    pub q_tot: f32,
    /// Peak amplitude.
    pub q_max: f32,
    /// Hit-finder flags, see [`cluster_flags`].
    pub flags: u8,
}

impl Cluster {
    /// Creates a cluster without flags.
    #[must_use]
    pub fn new(y: f32, z: f32, q_tot: f32, q_max: f32) -> Self {
        Self {
            y,
            z,
            q_tot,
            q_max,
            flags: 0,
        }
    }

    /// Sets hit-finder flags.
    #[must_use]
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// True if the hit finder marked the cluster at the sector edge.
    #[inline]
    #[must_use]
    pub fn is_edge(&self) -> bool {
        self.flags & cluster_flags::EDGE != 0
    }
}

/// Random-access cluster lookup plus a bounded neighbour query per row.
pub trait ClusterStore: Send + Sync {
    /// Number of sectors covered by the store.
    fn n_sectors(&self) -> usize;

    /// Number of rows per sector.
    fn n_rows(&self) -> usize;

    /// Clusters of one pad row.
    fn row(&self, sector: usize, row: usize) -> &[Cluster];

    /// Flat index of the first cluster of a row.
    fn row_offset(&self, sector: usize, row: usize) -> u32;

    /// Total number of clusters.
    fn n_clusters(&self) -> usize;

    /// Appends indices (within the row) of clusters inside the window
    /// `|dy| <= half_y`, `|dz| <= half_z` around (y, z). The window is a
    /// broad phase: candidates may lie outside the exact gate.
    fn neighbours(
        &self,
        sector: usize,
        row: usize,
        y: f64,
        z: f64,
        half_y: f64,
        half_z: f64,
        out: &mut Vec<u32>,
    );

    /// Looks up one cluster.
    #[inline]
    fn cluster(&self, sector: usize, row: usize, index: u32) -> Option<&Cluster> {
        if sector >= self.n_sectors() || row >= self.n_rows() {
            return None;
        }
        self.row(sector, row).get(index as usize)
    }

    /// Flat index used by the attachment arena.
    #[inline]
    fn global_index(&self, sector: usize, row: usize, index: u32) -> u32 {
        self.row_offset(sector, row) + index
    }
}

/// In-memory store with one spatial grid per pad row.
#[derive(Debug, Clone)]
pub struct SectorClusterStore {
    n_sectors: usize,
    n_rows: usize,
    rows: Vec<Vec<Cluster>>,
    offsets: Vec<u32>,
    index: Vec<SpatialGrid<u32>>,
}

impl SectorClusterStore {
    /// Default grid cell size in y (cm).
    pub const CELL_Y: f64 = 2.0;
    /// Default grid cell size in z (cm).
    pub const CELL_Z: f64 = 4.0;

    /// Builds a store from sector-major rows (`rows[sector * n_rows + row]`).
    ///
    /// # Errors
    /// Returns an error if the number of rows does not match the layout or the
    /// store would exceed the 32-bit cluster index range.
    pub fn from_rows(n_sectors: usize, n_rows: usize, rows: Vec<Vec<Cluster>>) -> Result<Self> {
        if rows.len() != n_sectors * n_rows {
            return Err(Error::Config(format!(
                "expected {} cluster rows, got {}",
                n_sectors * n_rows,
                rows.len()
            )));
        }
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut total: u64 = 0;
        let overflow = |_| Error::Config("cluster count exceeds 32-bit index range".to_string());
        for row in &rows {
            offsets.push(u32::try_from(total).map_err(overflow)?);
            total += row.len() as u64;
        }
        offsets.push(u32::try_from(total).map_err(overflow)?);

        let index = rows
            .iter()
            .map(|row| {
                let mut grid = SpatialGrid::new(Self::CELL_Y, Self::CELL_Z);
                for (i, c) in row.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    grid.insert(f64::from(c.y), f64::from(c.z), i as u32);
                }
                grid
            })
            .collect();

        Ok(Self {
            n_sectors,
            n_rows,
            rows,
            offsets,
            index,
        })
    }

    /// Creates an empty store.
    #[must_use]
    pub fn empty(n_sectors: usize, n_rows: usize) -> Self {
        Self {
            n_sectors,
            n_rows,
            rows: vec![Vec::new(); n_sectors * n_rows],
            offsets: vec![0; n_sectors * n_rows + 1],
            index: vec![SpatialGrid::new(Self::CELL_Y, Self::CELL_Z); n_sectors * n_rows],
        }
    }

    /// Sector-major rows, the layout accepted by [`Self::from_rows`].
    #[must_use]
    pub fn rows(&self) -> &[Vec<Cluster>] {
        &self.rows
    }

    /// Consumes the store and returns its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Vec<Cluster>> {
        self.rows
    }
}

impl ClusterStore for SectorClusterStore {
    fn n_sectors(&self) -> usize {
        self.n_sectors
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    fn row(&self, sector: usize, row: usize) -> &[Cluster] {
        &self.rows[sector * self.n_rows + row]
    }

    #[inline]
    fn row_offset(&self, sector: usize, row: usize) -> u32 {
        self.offsets[sector * self.n_rows + row]
    }

    fn n_clusters(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) as usize
    }

    fn neighbours(
        &self,
        sector: usize,
        row: usize,
        y: f64,
        z: f64,
        half_y: f64,
        half_z: f64,
        out: &mut Vec<u32>,
    ) {
        if sector >= self.n_sectors || row >= self.n_rows {
            return;
        }
        self.index[sector * self.n_rows + row].query_window(y, z, half_y, half_z, out);
    }
}

/// Incremental builder for [`SectorClusterStore`].
#[derive(Debug, Clone)]
pub struct ClusterStoreBuilder {
    n_sectors: usize,
    n_rows: usize,
    rows: Vec<Vec<Cluster>>,
}

impl ClusterStoreBuilder {
    /// Creates a builder for the given layout.
    #[must_use]
    pub fn new(n_sectors: usize, n_rows: usize) -> Self {
        Self {
            n_sectors,
            n_rows,
            rows: vec![Vec::new(); n_sectors * n_rows],
        }
    }

    /// Adds a cluster and returns its index within the row.
    ///
    /// # Errors
    /// Returns an error for an out-of-range sector or row.
    pub fn push(&mut self, sector: usize, row: usize, cluster: Cluster) -> Result<u32> {
        if sector >= self.n_sectors {
            return Err(Error::InvalidSector {
                sector,
                n_sectors: self.n_sectors,
            });
        }
        if row >= self.n_rows {
            return Err(Error::InvalidRow {
                row,
                n_rows: self.n_rows,
            });
        }
        let slot = &mut self.rows[sector * self.n_rows + row];
        let index = u32::try_from(slot.len())
            .map_err(|_| Error::Config("row holds too many clusters".to_string()))?;
        slot.push(cluster);
        Ok(index)
    }

    /// Finalizes the store and builds the row indices.
    ///
    /// # Errors
    /// See [`SectorClusterStore::from_rows`].
    pub fn build(self) -> Result<SectorClusterStore> {
        SectorClusterStore::from_rows(self.n_sectors, self.n_rows, self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> SectorClusterStore {
        let mut builder = ClusterStoreBuilder::new(2, 3);
        builder.push(0, 0, Cluster::new(0.0, 0.0, 10.0, 5.0)).unwrap();
        builder.push(0, 0, Cluster::new(1.0, 0.5, 12.0, 6.0)).unwrap();
        builder.push(0, 2, Cluster::new(-3.0, 4.0, 8.0, 3.0)).unwrap();
        builder
            .push(1, 1, Cluster::new(5.0, 5.0, 8.0, 3.0).with_flags(cluster_flags::EDGE))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_store_lookup() {
        let store = sample_store();
        assert_eq!(store.n_clusters(), 4);
        assert_eq!(store.row(0, 0).len(), 2);
        assert_eq!(store.global_index(0, 2, 0), 2);
        assert_eq!(store.global_index(1, 1, 0), 3);
        assert!(store.cluster(1, 1, 0).unwrap().is_edge());
        assert!(store.cluster(0, 1, 0).is_none());
        assert!(store.cluster(5, 0, 0).is_none());
    }

    #[test]
    fn test_store_neighbours() {
        let store = sample_store();
        let mut out = Vec::new();
        store.neighbours(0, 0, 0.2, 0.1, 1.0, 1.0, &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1]);

        out.clear();
        store.neighbours(0, 2, 20.0, 20.0, 0.5, 0.5, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_builder_rejects_bad_row() {
        let mut builder = ClusterStoreBuilder::new(1, 1);
        assert!(builder.push(0, 4, Cluster::default()).is_err());
        assert!(builder.push(2, 0, Cluster::default()).is_err());
    }

    #[test]
    fn test_from_rows_layout_mismatch() {
        assert!(SectorClusterStore::from_rows(2, 2, vec![Vec::new(); 3]).is_err());
    }
}
