//! Kalman track state: measurement update, looper mirror and covariance reset.

use crate::propagator::to_matrix;
use nalgebra::{Matrix2, Matrix5x2, Vector2, Vector5};
use trackmerge_core::{par, Covariance, TrackParam};

/// Degrees of freedom of a freshly seeded state.
pub const INITIAL_NDF: i32 = -5;

/// Result of one measurement update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    /// χ² above the cut.
    RejectedFar,
    /// Compatible edge cluster inside the unreliable band of the row.
    RejectedEdge,
    /// Residual against the combined two-direction estimate above the cut.
    RejectedInterpolation,
    /// Non-positive innovation covariance or broken covariance invariant.
    Invalid,
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            UpdateOutcome::RejectedFar
                | UpdateOutcome::RejectedEdge
                | UpdateOutcome::RejectedInterpolation
        )
    }
}

/// Predicted position of a hit from an earlier pass, excluding the hit itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub y: f64,
    pub z: f64,
    pub cyy: f64,
    pub czy: f64,
    pub czz: f64,
}

/// One 2-D cluster measurement in the frame of the state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub y: f64,
    pub z: f64,
    pub sigma2_y: f64,
    pub sigma2_z: f64,
    /// Cluster flagged at the sector edge by the hit finder.
    pub edge: bool,
    /// Half width of the pad row.
    pub half_width: f64,
}

/// Rejection settings for one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RejectionMode {
    pub chi2_cut: f64,
    pub edge_band: f64,
    /// Opposite-direction prediction with its χ² cut.
    pub interpolation: Option<(Prediction, f64)>,
}

/// Helix apex of a looper in the frame of the state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Apex {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// sinφ of the parametrization at the apex, ±1.
    pub snp: f64,
}

/// Trajectory estimate owned by one refit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackState {
    pub param: TrackParam,
    pub ndf: i32,
    pub chi2: f64,
    /// Longitudinal offset added to measured z.
    pub time_offset: f64,
}

impl TrackState {
    #[must_use]
    pub fn new(param: TrackParam, time_offset: f64) -> Self {
        Self {
            param,
            ndf: INITIAL_NDF,
            chi2: 0.0,
            time_offset,
        }
    }

    /// Replaces the covariance by a diagonal seed and restarts χ²/NDF.
    pub fn reset_covariance(&mut self, scale: f64) {
        let qpt = self.param.qpt().abs().max(1.0);
        self.param.cov = Covariance::from_diagonal([
            scale,
            scale,
            0.01 * scale,
            0.01 * scale,
            0.25 * qpt * qpt * scale,
        ]);
        self.ndf = INITIAL_NDF;
        self.chi2 = 0.0;
    }

    /// Predicted position without the next measurement.
    #[must_use]
    pub fn prediction(&self) -> Prediction {
        Prediction {
            y: self.param.y(),
            z: self.param.z(),
            cyy: self.param.cov.get(par::Y, par::Y),
            czy: self.param.cov.get(par::Z, par::Y),
            czz: self.param.cov.get(par::Z, par::Z),
        }
    }

    /// Parameters finite and covariance positive semi-definite.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.param.is_valid() && self.chi2.is_finite()
    }

    /// One Kalman update with a 2-D measurement.
    ///
    /// Rejections apply only once `ndf > 0`. On anything but
    /// [`UpdateOutcome::Accepted`] the state is left unchanged.
    pub fn update(
        &mut self,
        m: &Measurement,
        rejection: &RejectionMode,
        max_sin_phi: f64,
    ) -> UpdateOutcome {
        let c = to_matrix(&self.param.cov);
        let s = Matrix2::new(
            c[(0, 0)] + m.sigma2_y,
            c[(0, 1)],
            c[(1, 0)],
            c[(1, 1)] + m.sigma2_z,
        );
        let det = s.determinant();
        if !(det > 0.0 && det.is_finite() && s[(0, 0)] > 0.0) {
            return UpdateOutcome::Invalid;
        }
        let Some(s_inv) = s.try_inverse() else {
            return UpdateOutcome::Invalid;
        };
        let r = Vector2::new(m.y - self.param.y(), m.z - self.param.z());
        let chi2 = (r.transpose() * s_inv * r)[(0, 0)];
        if !chi2.is_finite() {
            return UpdateOutcome::Invalid;
        }

        if self.ndf > 0 {
            if chi2 > rejection.chi2_cut {
                return UpdateOutcome::RejectedFar;
            }
            if m.edge && self.param.y().abs() > m.half_width - rejection.edge_band {
                return UpdateOutcome::RejectedEdge;
            }
            if let Some((pred, cut)) = rejection.interpolation {
                if let Some(ichi2) = self.interpolation_chi2(&pred, m) {
                    if ichi2 > cut {
                        return UpdateOutcome::RejectedInterpolation;
                    }
                }
            }
        }

        let pht: Matrix5x2<f64> = c.fixed_view::<5, 2>(0, 0).into_owned();
        let k = pht * s_inv;
        let dp: Vector5<f64> = k * r;
        let c_new = c - k * pht.transpose();

        let mut next = self.param;
        for i in 0..5 {
            next.p[i] += dp[i];
        }
        next.cov = crate::propagator::from_matrix(&c_new);
        // Rounding after a strong update can push correlations just past ±1.
        next.cov.bound_correlations();
        next.p[par::SNP] = next.snp().clamp(-max_sin_phi, max_sin_phi);
        if !next.is_valid() {
            return UpdateOutcome::Invalid;
        }
        self.param = next;
        self.ndf += 2;
        self.chi2 += chi2;
        UpdateOutcome::Accepted
    }

    /// χ² of `m` against the weighted mean of the current prediction and
    /// `pred`, both excluding the measurement.
    fn interpolation_chi2(&self, pred: &Prediction, m: &Measurement) -> Option<f64> {
        let own = self.prediction();
        let c1 = Matrix2::new(own.cyy, own.czy, own.czy, own.czz);
        let c2 = Matrix2::new(pred.cyy, pred.czy, pred.czy, pred.czz);
        let w1 = c1.try_inverse()?;
        let w2 = c2.try_inverse()?;
        let c = (w1 + w2).try_inverse()?;
        let mean = c * (w1 * Vector2::new(own.y, own.z) + w2 * Vector2::new(pred.y, pred.z));
        let s = c + Matrix2::new(m.sigma2_y, 0.0, 0.0, m.sigma2_z);
        let s_inv = s.try_inverse()?;
        let r = Vector2::new(m.y, m.z) - mean;
        let chi2 = (r.transpose() * s_inv * r)[(0, 0)];
        chi2.is_finite().then_some(chi2)
    }

    /// Hard reset at a looper apex.
    ///
    /// The position moves to the apex, direction and curvature flip to the
    /// representation of the next leg, y/z lose their correlations and take
    /// the given variances. NDF grows by 3.
    pub fn mirror(&mut self, apex: &Apex, sigma2_y: f64, sigma2_z: f64, max_sin_phi: f64) {
        let t = &mut self.param;
        t.x = apex.x;
        t.p[par::Y] = apex.y;
        t.p[par::Z] = apex.z;
        t.p[par::SNP] = -apex.snp.signum() * max_sin_phi;
        t.p[par::TGL] = -t.tgl();
        t.p[par::QPT] = -t.qpt();

        // snp, tgl and qpt flip together, so their mutual correlations keep their sign.
        t.cov.clear_correlations(par::Y);
        t.cov.clear_correlations(par::Z);
        t.cov.set(par::Y, par::Y, sigma2_y);
        t.cov.set(par::Z, par::Z, sigma2_z);
        self.ndf += 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn state() -> TrackState {
        let mut s = TrackState::new(
            TrackParam::new(100.0, 0.0, [0.0, 0.0, 0.0, 0.1, 1.0], Covariance::default()),
            0.0,
        );
        s.reset_covariance(1.0);
        s
    }

    fn meas(y: f64, z: f64) -> Measurement {
        Measurement {
            y,
            z,
            sigma2_y: 0.01,
            sigma2_z: 0.01,
            edge: false,
            half_width: 20.0,
        }
    }

    fn mode() -> RejectionMode {
        RejectionMode {
            chi2_cut: 25.0,
            edge_band: 0.5,
            interpolation: None,
        }
    }

    #[test]
    fn test_update_pulls_towards_measurement() {
        let mut s = state();
        assert_eq!(s.update(&meas(0.5, -0.2), &mode(), 0.999), UpdateOutcome::Accepted);
        assert!(s.param.y() > 0.45 && s.param.y() < 0.5);
        assert!(s.param.z() < -0.15);
        assert_eq!(s.ndf, INITIAL_NDF + 2);
        assert!(s.chi2 > 0.0);
        assert!(s.param.cov.get(par::Y, par::Y) < 0.01);
        assert!(s.param.cov.is_valid());
    }

    #[test]
    fn test_rejection_only_after_positive_ndf() {
        let mut s = state();
        // Far measurement is accepted while NDF <= 0.
        assert_eq!(s.update(&meas(5.0, 0.0), &mode(), 0.999), UpdateOutcome::Accepted);
        s.ndf = 1;
        let before = s;
        assert_eq!(s.update(&meas(10.0, 0.0), &mode(), 0.999), UpdateOutcome::RejectedFar);
        assert_eq!(s, before);
    }

    #[test]
    fn test_edge_rejection() {
        let mut s = state();
        s.ndf = 1;
        s.param.p[par::Y] = 19.8;
        let mut m = meas(19.8, 0.0);
        m.edge = true;
        assert_eq!(s.update(&m, &mode(), 0.999), UpdateOutcome::RejectedEdge);
        // A far edge cluster is an outlier first.
        m.y = 10.0;
        assert_eq!(s.update(&m, &mode(), 0.999), UpdateOutcome::RejectedFar);
        m.y = 19.8;
        m.edge = false;
        assert_eq!(s.update(&m, &mode(), 0.999), UpdateOutcome::Accepted);
    }

    #[test]
    fn test_interpolation_rejection() {
        let mut s = state();
        s.ndf = 3;
        s.param.cov.set(par::Y, par::Y, 0.04);
        s.param.cov.set(par::Z, par::Z, 0.04);
        let pred = Prediction {
            y: 0.0,
            z: 0.0,
            cyy: 0.0004,
            czy: 0.0,
            czz: 0.0004,
        };
        let mut rej = mode();
        rej.chi2_cut = 1e6;
        rej.interpolation = Some((pred, 9.0));
        assert_eq!(
            s.update(&meas(0.6, 0.0), &rej, 0.999),
            UpdateOutcome::RejectedInterpolation
        );
        assert_eq!(s.update(&meas(0.05, 0.0), &rej, 0.999), UpdateOutcome::Accepted);
    }

    #[test]
    fn test_invalid_innovation() {
        let mut s = state();
        let mut m = meas(0.0, 0.0);
        m.sigma2_y = -10.0;
        assert_eq!(s.update(&m, &mode(), 0.999), UpdateOutcome::Invalid);
    }

    #[test]
    fn test_snp_clamped_after_update() {
        let mut s = state();
        s.param.p[par::SNP] = 0.998;
        s.param.cov = Covariance::from_diagonal([1.0, 1.0, 1.0, 0.01, 1.0]);
        s.param.cov.set(par::SNP, par::Y, 0.9);
        let outcome = s.update(&meas(1.0, 0.0), &mode(), 0.999);
        assert_eq!(outcome, UpdateOutcome::Accepted);
        assert!(s.param.snp() <= 0.999);
    }

    #[test]
    fn test_mirror_flips_representation() {
        let mut s = state();
        s.param.cov.set(par::SNP, par::Y, 0.05);
        let ndf = s.ndf;
        let apex = Apex {
            x: 120.0,
            y: 3.0,
            z: 7.0,
            snp: 1.0,
        };
        s.mirror(&apex, 1.0, 2.0, 0.999);
        assert_abs_diff_eq!(s.param.x, 120.0);
        assert_abs_diff_eq!(s.param.snp(), -0.999);
        assert_abs_diff_eq!(s.param.tgl(), -0.1);
        assert_abs_diff_eq!(s.param.qpt(), -1.0);
        assert_abs_diff_eq!(s.param.cov.get(par::SNP, par::Y), 0.0);
        assert_abs_diff_eq!(s.param.cov.get(par::Z, par::Z), 2.0);
        assert_eq!(s.ndf, ndf + 3);
        assert!(s.param.cov.is_valid());
    }
}
