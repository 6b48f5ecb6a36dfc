//! Detector geometry queries.
//!
//! The merger only needs a handful of geometric facts: how many sectors
//! exist, where each sector's local frame points, the radius of every pad
//! row and the drift model. [`Geometry`] captures those; detector specific
//! tables are expected to live behind an implementation of it.
//! [`CylindricalGeometry`] is a parametric stand-in with equally spaced
//! rows and sectors.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use std::f64::consts::PI;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Detector half, split by the central electrode at z = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Side {
    /// z > 0.
    A,
    /// z < 0.
    C,
}

impl Side {
    /// +1 for the A side, -1 for the C side.
    #[inline]
    #[must_use]
    pub fn sign(self) -> f64 {
        match self {
            Side::A => 1.0,
            Side::C => -1.0,
        }
    }

    /// Side a longitudinal coordinate belongs to.
    #[inline]
    #[must_use]
    pub fn of_z(z: f64) -> Self {
        if z < 0.0 {
            Side::C
        } else {
            Side::A
        }
    }
}

/// Normalizes an angle into (-pi, pi].
#[inline]
#[must_use]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Narrow geometry interface consumed by the merger.
///
/// Sectors `0..sectors_per_side()` are on the A side, the following
/// `sectors_per_side()` sectors on the C side, in the same azimuthal order.
pub trait Geometry: Send + Sync {
    /// Sectors on one side of the central electrode.
    fn sectors_per_side(&self) -> usize;

    /// Number of pad rows per sector.
    fn n_rows(&self) -> usize;

    /// Local X (radius along the sector axis) of a pad row, in cm.
    fn row_x(&self, row: usize) -> f64;

    /// Maximum drift distance from the central electrode to the readout, in cm.
    fn drift_length(&self) -> f64;

    /// Drift velocity in cm/us.
    fn drift_velocity(&self) -> f64;

    /// Tag identifying the geometry variant in diagnostic dumps.
    fn tag(&self) -> u32;

    /// Total number of sectors on both sides.
    #[inline]
    fn n_sectors(&self) -> usize {
        2 * self.sectors_per_side()
    }

    /// Azimuthal width of one sector.
    #[inline]
    fn sector_width(&self) -> f64 {
        2.0 * PI / self.sectors_per_side() as f64
    }

    /// Rotation angle of the sector's local frame.
    #[inline]
    fn sector_alpha(&self, sector: usize) -> f64 {
        let local = sector % self.sectors_per_side();
        normalize_angle((local as f64 + 0.5) * self.sector_width())
    }

    /// Side of a sector.
    #[inline]
    fn sector_side(&self, sector: usize) -> Side {
        if sector < self.sectors_per_side() {
            Side::A
        } else {
            Side::C
        }
    }

    /// Neighbour on the same side, `step` sectors away in increasing azimuth.
    #[inline]
    fn neighbour(&self, sector: usize, step: i32) -> usize {
        let n = self.sectors_per_side() as i64;
        let base = (sector as i64 / n) * n;
        let local = (sector as i64 % n + i64::from(step)).rem_euclid(n);
        (base + local) as usize
    }

    /// Sector with the same azimuth on the opposite side.
    #[inline]
    fn mirror_sector(&self, sector: usize) -> usize {
        let n = self.sectors_per_side();
        (sector + n) % (2 * n)
    }

    /// Half width of the sensitive area at local X.
    #[inline]
    fn half_width(&self, x: f64) -> f64 {
        x * (0.5 * self.sector_width()).tan()
    }

    /// Distance between neighbouring rows near `row`.
    #[inline]
    fn row_pitch(&self, row: usize) -> f64 {
        if self.n_rows() < 2 {
            return 1.0;
        }
        if row + 1 < self.n_rows() {
            self.row_x(row + 1) - self.row_x(row)
        } else {
            self.row_x(row) - self.row_x(row - 1)
        }
    }

    /// Sector containing the global azimuth `phi` on the side of `z`.
    fn sector_at(&self, phi: f64, z: f64) -> usize {
        let mut a = phi.rem_euclid(2.0 * PI);
        if a >= 2.0 * PI {
            a = 0.0;
        }
        let local = ((a / self.sector_width()) as usize).min(self.sectors_per_side() - 1);
        match Side::of_z(z) {
            Side::A => local,
            Side::C => local + self.sectors_per_side(),
        }
    }

    /// Row whose X is closest to `x`, if `x` lies inside the row range.
    fn nearest_row(&self, x: f64) -> Option<usize> {
        let n = self.n_rows();
        if n == 0 {
            return None;
        }
        let first = self.row_x(0);
        let last = self.row_x(n - 1);
        let half = 0.5 * self.row_pitch(0);
        if x < first - half || x > last + half {
            return None;
        }
        (0..n).min_by(|&a, &b| {
            (self.row_x(a) - x)
                .abs()
                .total_cmp(&(self.row_x(b) - x).abs())
        })
    }
}

/// Cylindrical detector with equally spaced pad rows.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CylindricalGeometry {
    /// Sectors per side.
    pub sectors_per_side: usize,
    /// Number of pad rows.
    pub n_rows: usize,
    /// X of the innermost row (cm).
    pub first_row_x: f64,
    /// Spacing between rows (cm).
    pub row_pitch: f64,
    /// Drift length (cm).
    pub drift_length: f64,
    /// Drift velocity (cm/us).
    pub drift_velocity: f64,
}

impl Default for CylindricalGeometry {
    fn default() -> Self {
        Self {
            sectors_per_side: 18,
            n_rows: 64,
            first_row_x: 85.0,
            row_pitch: 2.5,
            drift_length: 250.0,
            drift_velocity: 2.58,
        }
    }
}

impl CylindricalGeometry {
    /// Geometry tag written into diagnostic dumps.
    pub const TAG: u32 = 1;

    /// Sets the number of rows.
    #[must_use]
    pub fn with_rows(mut self, n_rows: usize, first_row_x: f64, row_pitch: f64) -> Self {
        self.n_rows = n_rows;
        self.first_row_x = first_row_x;
        self.row_pitch = row_pitch;
        self
    }

    /// Sets the number of sectors per side.
    #[must_use]
    pub fn with_sectors_per_side(mut self, sectors: usize) -> Self {
        self.sectors_per_side = sectors;
        self
    }

    /// Checks that the geometry is usable.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] for empty or degenerate layouts.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sectors_per_side < 3 {
            return Err(crate::Error::Config(
                "at least 3 sectors per side are required".to_string(),
            ));
        }
        if self.n_rows == 0 || self.n_rows > usize::from(u16::MAX) {
            return Err(crate::Error::Config(format!(
                "row count {} out of range",
                self.n_rows
            )));
        }
        if !(self.first_row_x > 0.0 && self.row_pitch > 0.0) {
            return Err(crate::Error::Config(
                "row positions must be positive".to_string(),
            ));
        }
        if !(self.drift_length > 0.0 && self.drift_velocity > 0.0) {
            return Err(crate::Error::Config(
                "drift model must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Geometry for CylindricalGeometry {
    fn sectors_per_side(&self) -> usize {
        self.sectors_per_side
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    fn row_x(&self, row: usize) -> f64 {
        self.first_row_x + row as f64 * self.row_pitch
    }

    fn drift_length(&self) -> f64 {
        self.drift_length
    }

    fn drift_velocity(&self) -> f64 {
        self.drift_velocity
    }

    fn tag(&self) -> u32 {
        Self::TAG
    }

    fn row_pitch(&self, _row: usize) -> f64 {
        self.row_pitch
    }

    fn nearest_row(&self, x: f64) -> Option<usize> {
        let pos = ((x - self.first_row_x) / self.row_pitch).round();
        if pos < 0.0 || pos >= self.n_rows as f64 {
            return None;
        }
        Some(pos as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_normalize_angle() {
        assert_abs_diff_eq!(normalize_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(-PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(0.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(-2.0 * PI + 0.1), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_sector_layout() {
        let geo = CylindricalGeometry::default();
        assert_eq!(geo.n_sectors(), 36);
        assert_abs_diff_eq!(geo.sector_alpha(0), 10f64.to_radians(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            geo.sector_alpha(18),
            geo.sector_alpha(0),
            epsilon = 1e-12
        );
        assert_eq!(geo.sector_side(17), Side::A);
        assert_eq!(geo.sector_side(18), Side::C);
        assert_eq!(geo.neighbour(17, 1), 0);
        assert_eq!(geo.neighbour(18, -1), 35);
        assert_eq!(geo.mirror_sector(3), 21);
        assert_eq!(geo.mirror_sector(21), 3);
    }

    #[test]
    fn test_sector_at() {
        let geo = CylindricalGeometry::default();
        assert_eq!(geo.sector_at(5f64.to_radians(), 10.0), 0);
        assert_eq!(geo.sector_at(25f64.to_radians(), 10.0), 1);
        assert_eq!(geo.sector_at(-5f64.to_radians(), 10.0), 17);
        assert_eq!(geo.sector_at(-5f64.to_radians(), -10.0), 35);
    }

    #[test]
    fn test_rows() {
        let geo = CylindricalGeometry::default();
        assert_abs_diff_eq!(geo.row_x(0), 85.0);
        assert_abs_diff_eq!(geo.row_x(10), 110.0);
        assert_eq!(geo.nearest_row(110.4), Some(10));
        assert_eq!(geo.nearest_row(10.0), None);
        assert!(geo.validate().is_ok());
        assert!(geo.clone().with_sectors_per_side(2).validate().is_err());
    }
}
