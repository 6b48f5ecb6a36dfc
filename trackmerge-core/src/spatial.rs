//! Spatial indexing for bounded-window neighbour lookup inside one pad row.

use std::collections::HashMap;

/// Uniform grid over the (y, z) plane of a pad row.
///
/// Cells are `cell_y` x `cell_z` wide; a window query visits only the
/// cells overlapping the window and leaves the exact distance test to the
/// caller.
#[derive(Debug, Clone, Default)]
pub struct SpatialGrid<T> {
    cell_y: f64,
    cell_z: f64,
    cells: HashMap<(i32, i32), Vec<T>>,
}

impl<T: Copy> SpatialGrid<T> {
    /// Creates an empty grid.
    #[must_use]
    pub fn new(cell_y: f64, cell_z: f64) -> Self {
        Self {
            cell_y: cell_y.max(1e-3),
            cell_z: cell_z.max(1e-3),
            cells: HashMap::new(),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn key(&self, y: f64, z: f64) -> (i32, i32) {
        (
            (y / self.cell_y).floor() as i32,
            (z / self.cell_z).floor() as i32,
        )
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Returns true if nothing has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Inserts a value at (y, z).
    pub fn insert(&mut self, y: f64, z: f64, value: T) {
        let key = self.key(y, z);
        self.cells.entry(key).or_default().push(value);
    }

    /// Appends every value whose cell overlaps `[y-dy, y+dy] x [z-dz, z+dz]`.
    pub fn query_window(&self, y: f64, z: f64, dy: f64, dz: f64, out: &mut Vec<T>) {
        let (y0, z0) = self.key(y - dy, z - dz);
        let (y1, z1) = self.key(y + dy, z + dz);
        for iy in y0..=y1 {
            for iz in z0..=z1 {
                if let Some(values) = self.cells.get(&(iy, iz)) {
                    out.extend_from_slice(values);
                }
            }
        }
    }
}
