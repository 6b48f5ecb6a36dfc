//! Helix parameters in a sector-local frame and their packed covariance.
//!
//! Parameters are `[y, z, sinφ, tanλ, q/pt]` at a reference X of a frame
//! rotated by α around the beam axis. The local direction always has a
//! positive X component; a leg running towards smaller radius is stored as
//! its reversed traversal (sinφ, tanλ and q/pt negated).

#![allow(clippy::cast_precision_loss)]

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of track parameters.
pub const N_PAR: usize = 5;
/// Number of independent covariance entries.
pub const N_COV: usize = 15;

/// Parameter indices.
pub mod par {
    pub const Y: usize = 0;
    pub const Z: usize = 1;
    pub const SNP: usize = 2;
    pub const TGL: usize = 3;
    pub const QPT: usize = 4;
}

/// Index of element (r, c) in the packed lower triangle.
#[inline]
#[must_use]
pub const fn cov_index(r: usize, c: usize) -> usize {
    if r >= c {
        r * (r + 1) / 2 + c
    } else {
        c * (c + 1) / 2 + r
    }
}

/// Relative slack allowed when checking `c_ij^2 <= c_ii * c_jj`.
const PSD_TOLERANCE: f64 = 1e-9;

/// Symmetric 5x5 covariance stored as 15 packed values.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Covariance(pub [f64; N_COV]);

impl Default for Covariance {
    fn default() -> Self {
        Self::from_diagonal([1.0, 1.0, 0.01, 0.01, 1.0])
    }
}

impl Covariance {
    /// Diagonal covariance.
    #[must_use]
    pub fn from_diagonal(diag: [f64; N_PAR]) -> Self {
        let mut c = [0.0; N_COV];
        for (i, d) in diag.iter().enumerate() {
            c[cov_index(i, i)] = *d;
        }
        Self(c)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.0[cov_index(r, c)]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.0[cov_index(r, c)] = v;
    }

    #[inline]
    #[must_use]
    pub fn diag(&self, i: usize) -> f64 {
        self.0[cov_index(i, i)]
    }

    /// Expands into a row-major 5x5 matrix.
    #[must_use]
    pub fn to_array(&self) -> [[f64; N_PAR]; N_PAR] {
        let mut m = [[0.0; N_PAR]; N_PAR];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.get(r, c);
            }
        }
        m
    }

    /// Packs the lower triangle of a 5x5 matrix, symmetrizing it.
    #[must_use]
    pub fn from_array(m: &[[f64; N_PAR]; N_PAR]) -> Self {
        let mut c = [0.0; N_COV];
        for r in 0..N_PAR {
            for col in 0..=r {
                c[cov_index(r, col)] = 0.5 * (m[r][col] + m[col][r]);
            }
        }
        Self(c)
    }

    /// All entries finite, diagonal non-negative and every 2x2 sub-block
    /// positive semi-definite.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().any(|v| !v.is_finite()) {
            return false;
        }
        for i in 0..N_PAR {
            if self.diag(i) < 0.0 {
                return false;
            }
        }
        for r in 1..N_PAR {
            for c in 0..r {
                let bound = self.diag(r) * self.diag(c);
                let v = self.get(r, c);
                if v * v > bound * (1.0 + PSD_TOLERANCE) + f64::MIN_POSITIVE {
                    return false;
                }
            }
        }
        true
    }

    /// Clamps every off-diagonal entry into `[-sqrt(c_ii c_jj), sqrt(c_ii c_jj)]`.
    pub fn bound_correlations(&mut self) {
        for r in 1..N_PAR {
            for c in 0..r {
                let bound = (self.diag(r).max(0.0) * self.diag(c).max(0.0)).sqrt();
                let v = self.get(r, c);
                self.set(r, c, v.clamp(-bound, bound));
            }
        }
    }

    /// Zeroes every correlation of parameter `i`.
    pub fn clear_correlations(&mut self, i: usize) {
        for j in 0..N_PAR {
            if j != i {
                self.set(i, j, 0.0);
            }
        }
    }
}

/// Track parameters with covariance at (x, α).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackParam {
    /// Reference X in the rotated frame (cm).
    pub x: f64,
    /// Frame rotation angle.
    pub alpha: f64,
    /// `[y, z, sinφ, tanλ, q/pt]`.
    pub p: [f64; N_PAR],
    /// Packed covariance.
    pub cov: Covariance,
}

impl TrackParam {
    #[must_use]
    pub fn new(x: f64, alpha: f64, p: [f64; N_PAR], cov: Covariance) -> Self {
        Self { x, alpha, p, cov }
    }

    #[inline]
    #[must_use]
    pub fn y(&self) -> f64 {
        self.p[par::Y]
    }

    #[inline]
    #[must_use]
    pub fn z(&self) -> f64 {
        self.p[par::Z]
    }

    #[inline]
    #[must_use]
    pub fn snp(&self) -> f64 {
        self.p[par::SNP]
    }

    #[inline]
    #[must_use]
    pub fn tgl(&self) -> f64 {
        self.p[par::TGL]
    }

    #[inline]
    #[must_use]
    pub fn qpt(&self) -> f64 {
        self.p[par::QPT]
    }

    /// cos φ, always non-negative in this parametrization.
    #[inline]
    #[must_use]
    pub fn cos_phi(&self) -> f64 {
        (1.0 - self.snp() * self.snp()).max(0.0).sqrt()
    }

    /// Transverse momentum in GeV, infinite for a straight track.
    #[must_use]
    pub fn pt(&self) -> f64 {
        if self.qpt() == 0.0 {
            f64::INFINITY
        } else {
            1.0 / self.qpt().abs()
        }
    }

    /// Total momentum in GeV.
    #[must_use]
    pub fn p_total(&self) -> f64 {
        self.pt() * (1.0 + self.tgl() * self.tgl()).sqrt()
    }

    /// Global (x, y, z) of the reference point.
    #[must_use]
    pub fn global_position(&self) -> [f64; 3] {
        let (sa, ca) = self.alpha.sin_cos();
        [
            self.x * ca - self.y() * sa,
            self.x * sa + self.y() * ca,
            self.z(),
        ]
    }

    /// Global azimuth of the direction of the parametrization.
    #[must_use]
    pub fn global_phi(&self) -> f64 {
        crate::geometry::normalize_angle(self.alpha + self.snp().asin())
    }

    /// Parameters and covariance are finite, the covariance is PSD and |sinφ| < 1.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.alpha.is_finite()
            && self.p.iter().all(|v| v.is_finite())
            && self.snp().abs() < 1.0
            && self.cov.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_cov_index_layout() {
        assert_eq!(cov_index(0, 0), 0);
        assert_eq!(cov_index(1, 1), 2);
        assert_eq!(cov_index(2, 0), 3);
        assert_eq!(cov_index(0, 2), 3);
        assert_eq!(cov_index(3, 1), 7);
        assert_eq!(cov_index(4, 4), 14);
    }

    #[test]
    fn test_covariance_validity() {
        let mut c = Covariance::from_diagonal([1.0, 4.0, 0.01, 0.01, 0.25]);
        assert!(c.is_valid());
        c.set(par::SNP, par::Y, 0.09);
        assert!(c.is_valid());
        c.set(par::SNP, par::Y, 0.2);
        assert!(!c.is_valid());
        c.bound_correlations();
        assert!(c.is_valid());
        assert_abs_diff_eq!(c.get(par::Y, par::SNP), 0.1, epsilon = 1e-12);

        let mut bad = Covariance::default();
        bad.set(par::Z, par::Z, -1.0);
        assert!(!bad.is_valid());
        bad.set(par::Z, par::Z, f64::NAN);
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_array_roundtrip_symmetrizes() {
        let mut m = [[0.0; N_PAR]; N_PAR];
        m[1][0] = 0.2;
        m[0][1] = 0.4;
        let c = Covariance::from_array(&m);
        assert_abs_diff_eq!(c.get(0, 1), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(c.to_array()[0][1], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_global_position() {
        let t = TrackParam::new(
            100.0,
            std::f64::consts::FRAC_PI_2,
            [5.0, 1.0, 0.0, 0.0, 1.0],
            Covariance::default(),
        );
        let g = t.global_position();
        assert_abs_diff_eq!(g[0], -5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(g[1], 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(t.pt(), 1.0);
        assert!(t.is_valid());
    }
}
