//! Helix transport of [`TrackParam`] between reference planes.
//!
//! Transport uses the exact helix for the parameters and a first-order
//! Jacobian for the covariance. Rotations keep the direction inside the
//! `cos φ > 0` half plane of the target frame and fail otherwise.

use crate::field::{bethe_bloch, curvature, FieldModel, MaterialModel, B2C, PION_MASS};
use nalgebra::Matrix5;
use thiserror::Error;
use trackmerge_core::{normalize_angle, par, Covariance, TrackParam, N_PAR};

/// Direction of a propagation relative to the particle flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// Same direction as the particle; energy is lost.
    Along,
    /// Towards the production point; energy is restored.
    Against,
}

/// Geometric or numerical propagation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PropagationError {
    #[error("rotation leaves the acceptance of the target frame")]
    Rotation,
    #[error("|sin phi| would exceed the allowed maximum")]
    SinPhiLimit,
    #[error("energy loss larger than the particle energy allows")]
    EnergyLoss,
    #[error("non-finite state after propagation")]
    NotFinite,
}

pub type PropagationResult = std::result::Result<(), PropagationError>;

pub(crate) fn to_matrix(cov: &Covariance) -> Matrix5<f64> {
    let a = cov.to_array();
    Matrix5::from_fn(|r, c| a[r][c])
}

pub(crate) fn from_matrix(m: &Matrix5<f64>) -> Covariance {
    let mut a = [[0.0; N_PAR]; N_PAR];
    for (r, row) in a.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    Covariance::from_array(&a)
}

/// Transverse arc length for a move of `dx` between slopes `f1` and `f2`.
#[must_use]
pub fn arc_length(dx: f64, f1: f64, f2: f64, crv: f64) -> f64 {
    let r1 = (1.0 - f1 * f1).max(0.0).sqrt();
    let r2 = (1.0 - f2 * f2).max(0.0).sqrt();
    let dy2dx = (f1 + f2) / (r1 + r2);
    let chord = dx * (1.0 + dy2dx * dy2dx).sqrt();
    let h = (0.5 * crv * chord).clamp(-1.0, 1.0);
    if h.abs() < 1e-4 {
        chord * (1.0 + h * h / 6.0)
    } else {
        chord * h.asin() / h
    }
}

/// Field (and optionally material) aware propagator.
#[derive(Clone, Copy)]
pub struct Propagator<'a> {
    field: &'a dyn FieldModel,
    material: Option<&'a dyn MaterialModel>,
    max_sin_phi: f64,
    mass: f64,
}

impl<'a> Propagator<'a> {
    /// Field-only propagator.
    #[must_use]
    pub fn new(field: &'a dyn FieldModel, max_sin_phi: f64) -> Self {
        Self {
            field,
            material: None,
            max_sin_phi,
            mass: PION_MASS,
        }
    }

    /// Enables material corrections.
    #[must_use]
    pub fn with_material(mut self, material: &'a dyn MaterialModel) -> Self {
        self.material = Some(material);
        self
    }

    /// Disables material corrections.
    #[must_use]
    pub fn without_material(mut self) -> Self {
        self.material = None;
        self
    }

    #[must_use]
    pub fn uses_material(&self) -> bool {
        self.material.is_some()
    }

    #[must_use]
    pub fn max_sin_phi(&self) -> f64 {
        self.max_sin_phi
    }

    /// Bz at the reference point of `t`.
    #[must_use]
    pub fn bz_at(&self, t: &TrackParam) -> f64 {
        self.field.bz(t.global_position())
    }

    /// Rotates `t` into the frame `alpha`, keeping the reference point.
    ///
    /// # Errors
    /// [`PropagationError::Rotation`] if the direction would leave the
    /// `cos φ > 0` half plane or exceed the sinφ limit.
    pub fn rotate(&self, t: &mut TrackParam, alpha: f64) -> PropagationResult {
        let alpha = normalize_angle(alpha);
        let da = normalize_angle(alpha - t.alpha);
        if da.abs() < 1e-12 {
            t.alpha = alpha;
            return Ok(());
        }
        let (sa, ca) = da.sin_cos();
        let sf = t.snp();
        let cf = t.cos_phi();
        let cf_new = cf * ca + sf * sa;
        let sf_new = sf * ca - cf * sa;
        if cf_new <= 0.0 || sf_new.abs() >= self.max_sin_phi || cf <= 0.0 {
            return Err(PropagationError::Rotation);
        }
        let rr = ca + sf / cf * sa;

        let x = t.x;
        let y = t.y();
        t.x = x * ca + y * sa;
        t.p[par::Y] = -x * sa + y * ca;
        t.p[par::SNP] = sf_new;
        t.alpha = alpha;

        let f = Matrix5::from_diagonal(&nalgebra::Vector5::new(ca, 1.0, rr, 1.0, 1.0));
        let c = to_matrix(&t.cov);
        t.cov = from_matrix(&(f * c * f.transpose()));
        Ok(())
    }

    /// Moves `t` along its helix to reference X `xk` in the current frame.
    ///
    /// # Errors
    /// [`PropagationError::SinPhiLimit`] if the helix does not reach `xk`
    /// inside the sinφ limit, [`PropagationError::EnergyLoss`] or
    /// [`PropagationError::NotFinite`] on numerical trouble.
    pub fn transport(&self, t: &mut TrackParam, xk: f64, flight: Flight) -> PropagationResult {
        let dx = xk - t.x;
        if dx.abs() < 1e-9 {
            t.x = xk;
            return Ok(());
        }
        let start = t.global_position();
        let bz = self.field.bz(start);
        let cc = bz * B2C;
        let crv = curvature(t.qpt(), bz);
        let f1 = t.snp();
        let f2 = f1 + crv * dx;
        // A state mirrored at an apex starts exactly on the limit.
        if f1.abs() > self.max_sin_phi || f2.abs() >= self.max_sin_phi {
            return Err(PropagationError::SinPhiLimit);
        }
        let r1 = (1.0 - f1 * f1).sqrt();
        let r2 = (1.0 - f2 * f2).sqrt();
        let dy2dx = (f1 + f2) / (r1 + r2);
        let ds = arc_length(dx, f1, f2, crv);
        let tgl = t.tgl();

        t.x = xk;
        t.p[par::Y] += dx * dy2dx;
        t.p[par::Z] += ds * tgl;
        t.p[par::SNP] = f2;

        let r1_3 = r1 * r1 * r1;
        let mut f = Matrix5::<f64>::identity();
        f[(0, 2)] = dx / r1_3;
        f[(0, 4)] = 0.5 * dx * dx / r1_3 * cc;
        f[(1, 2)] = dx * tgl * f1 / r1_3;
        f[(1, 3)] = dx / r1;
        f[(1, 4)] = 0.5 * dx * dx * tgl * f1 / r1_3 * cc;
        f[(2, 4)] = dx * cc;
        let c = to_matrix(&t.cov);
        t.cov = from_matrix(&(f * c * f.transpose()));

        if let Some(material) = self.material {
            let end = t.global_position();
            let length = ds.abs() * (1.0 + tgl * tgl).sqrt();
            let budget = material.budget(start, end, length);
            self.correct_for_material(t, budget.x_over_x0, budget.x_rho, flight)?;
        }

        if !(t.p.iter().all(|v| v.is_finite()) && t.cov.0.iter().all(|v| v.is_finite())) {
            return Err(PropagationError::NotFinite);
        }
        Ok(())
    }

    /// Rotates to `alpha` and transports to `xk`.
    ///
    /// # Errors
    /// See [`Self::rotate`] and [`Self::transport`]. On error `t` may be
    /// partially updated; callers work on a copy when they need to retry.
    pub fn propagate(
        &self,
        t: &mut TrackParam,
        xk: f64,
        alpha: f64,
        flight: Flight,
    ) -> PropagationResult {
        self.rotate(t, alpha)?;
        self.transport(t, xk, flight)
    }

    /// Like [`Self::propagate`] but leaves `t` untouched on failure.
    ///
    /// # Errors
    /// See [`Self::propagate`].
    pub fn try_propagate(
        &self,
        t: &mut TrackParam,
        xk: f64,
        alpha: f64,
        flight: Flight,
    ) -> PropagationResult {
        let mut trial = *t;
        self.propagate(&mut trial, xk, alpha, flight)?;
        *t = trial;
        Ok(())
    }

    /// Adds multiple scattering noise and applies the mean energy loss.
    fn correct_for_material(
        &self,
        t: &mut TrackParam,
        x_over_x0: f64,
        x_rho: f64,
        flight: Flight,
    ) -> PropagationResult {
        let p = t.p_total();
        if !p.is_finite() || p <= 0.0 {
            return Ok(());
        }
        let m2 = self.mass * self.mass;
        let p2 = p * p;
        let beta2 = p2 / (p2 + m2);
        let snp = t.snp();
        let tgl = t.tgl();
        let qpt = t.qpt();
        let t2 = 1.0 + tgl * tgl;

        let theta2 = 0.0136 * 0.0136 / (beta2 * p2) * x_over_x0.abs();
        let c22 = t.cov.get(par::SNP, par::SNP) + theta2 * (1.0 - snp * snp) * t2;
        let c33 = t.cov.get(par::TGL, par::TGL) + theta2 * t2 * t2;
        let c43 = t.cov.get(par::QPT, par::TGL) + theta2 * tgl * qpt * t2;
        let c44 = t.cov.get(par::QPT, par::QPT) + theta2 * tgl * tgl * qpt * qpt;
        t.cov.set(par::SNP, par::SNP, c22);
        t.cov.set(par::TGL, par::TGL, c33);
        t.cov.set(par::QPT, par::TGL, c43);
        t.cov.set(par::QPT, par::QPT, c44);

        let e = (p2 + m2).sqrt();
        let de = bethe_bloch(p / self.mass) * x_rho.abs();
        if de > 0.3 * e {
            return Err(PropagationError::EnergyLoss);
        }
        let e_new = match flight {
            Flight::Along => e - de,
            Flight::Against => e + de,
        };
        if e_new <= self.mass {
            return Err(PropagationError::EnergyLoss);
        }
        let p_new = (e_new * e_new - m2).sqrt();
        let ratio = p / p_new;
        t.p[par::QPT] *= ratio;
        for j in 0..N_PAR {
            let v = t.cov.get(par::QPT, j);
            let scale = if j == par::QPT { ratio * ratio } else { ratio };
            t.cov.set(par::QPT, j, v * scale);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{NoMaterial, UniformField, UniformMaterial};
    use approx::assert_abs_diff_eq;

    fn param(snp: f64, qpt: f64) -> TrackParam {
        TrackParam::new(
            100.0,
            0.0,
            [0.0, 0.0, snp, 0.5, qpt],
            Covariance::from_diagonal([0.01, 0.01, 1e-4, 1e-4, 1e-3]),
        )
    }

    #[test]
    fn test_straight_line_transport() {
        let field = UniformField::new(0.0);
        let prop = Propagator::new(&field, 0.999);
        let mut t = param(0.6, 1.0);
        prop.transport(&mut t, 110.0, Flight::Along).unwrap();
        assert_abs_diff_eq!(t.y(), 10.0 * 0.6 / 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(t.z(), 0.5 * 10.0 / 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(t.snp(), 0.6, epsilon = 1e-12);
        assert!(t.cov.is_valid());
        assert!(t.cov.get(par::Y, par::Y) > 0.01);
    }

    #[test]
    fn test_helix_transport_stays_on_circle() {
        let field = UniformField::new(5.0);
        let prop = Propagator::new(&field, 0.999);
        let mut t = param(0.0, 2.0);
        let k = curvature(2.0, 5.0);
        let (cx, cy) = (t.x - t.snp() / k, t.y() + t.cos_phi() / k);
        prop.transport(&mut t, 110.0, Flight::Along).unwrap();
        let r = ((t.x - cx).powi(2) + (t.y() - cy).powi(2)).sqrt();
        assert_abs_diff_eq!(r, 1.0 / k.abs(), epsilon = 1e-6);
        assert_abs_diff_eq!(t.snp(), 10.0 * k, epsilon = 1e-12);
    }

    #[test]
    fn test_transport_back_and_forth() {
        let field = UniformField::new(5.0);
        let prop = Propagator::new(&field, 0.999);
        let start = param(0.2, -1.5);
        let mut t = start;
        prop.transport(&mut t, 140.0, Flight::Along).unwrap();
        prop.transport(&mut t, 100.0, Flight::Against).unwrap();
        for i in 0..N_PAR {
            assert_abs_diff_eq!(t.p[i], start.p[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_sin_phi_limit() {
        let field = UniformField::new(5.0);
        let prop = Propagator::new(&field, 0.999);
        let mut t = param(0.9, -30.0);
        let before = t;
        assert_eq!(
            prop.try_propagate(&mut t, 150.0, 0.0, Flight::Along),
            Err(PropagationError::SinPhiLimit)
        );
        assert_eq!(t, before);
    }

    #[test]
    fn test_rotation_preserves_global_position() {
        let field = UniformField::new(5.0);
        let prop = Propagator::new(&field, 0.999);
        let mut t = param(0.1, 1.0);
        t.p[par::Y] = 12.0;
        let g0 = t.global_position();
        let phi0 = t.global_phi();
        prop.rotate(&mut t, 0.3).unwrap();
        let g1 = t.global_position();
        assert_abs_diff_eq!(g0[0], g1[0], epsilon = 1e-9);
        assert_abs_diff_eq!(g0[1], g1[1], epsilon = 1e-9);
        assert_abs_diff_eq!(phi0, t.global_phi(), epsilon = 1e-12);
        assert!(t.cov.is_valid());

        let mut steep = param(0.95, 1.0);
        assert_eq!(prop.rotate(&mut steep, -0.5), Err(PropagationError::Rotation));
    }

    #[test]
    fn test_material_direction() {
        let field = UniformField::new(5.0);
        let gas = UniformMaterial {
            radiation_length: 100.0,
            density: 1.0,
        };
        let prop = Propagator::new(&field, 0.999).with_material(&gas);
        let mut along = param(0.0, 2.0);
        prop.transport(&mut along, 102.0, Flight::Along).unwrap();
        assert!(along.qpt().abs() > 2.0);
        assert!(along.cov.get(par::SNP, par::SNP) > 1e-4);

        let mut against = param(0.0, 2.0);
        prop.transport(&mut against, 102.0, Flight::Against).unwrap();
        assert!(against.qpt().abs() < 2.0);
        assert!(against.cov.is_valid());

        let vacuum = NoMaterial;
        let plain = Propagator::new(&field, 0.999).with_material(&vacuum);
        let mut t = param(0.0, 2.0);
        plain.transport(&mut t, 102.0, Flight::Along).unwrap();
        assert_abs_diff_eq!(t.qpt(), 2.0, epsilon = 1e-12);
    }
}
