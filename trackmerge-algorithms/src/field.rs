//! Magnetic field and material budget models.

/// Conversion from kG·cm to GeV/c per unit charge.
///
/// Negative so that a positive charge turns clockwise in a positive field.
pub const B2C: f64 = -0.000_299_792_458;

/// Pion mass in GeV, used for material corrections.
pub const PION_MASS: f64 = 0.139_570;

/// Signed curvature (1/cm) of a track with `qpt` in a field `bz` (kG).
///
/// Positive curvature turns counterclockwise.
#[inline]
#[must_use]
pub fn curvature(qpt: f64, bz: f64) -> f64 {
    qpt * bz * B2C
}

/// Longitudinal field lookup.
pub trait FieldModel: Send + Sync {
    /// Bz in kG at a global position (cm).
    fn bz(&self, position: [f64; 3]) -> f64;
}

/// Homogeneous solenoid field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformField {
    bz: f64,
}

impl UniformField {
    #[must_use]
    pub fn new(bz: f64) -> Self {
        Self { bz }
    }
}

impl Default for UniformField {
    fn default() -> Self {
        Self::new(5.0)
    }
}

impl FieldModel for UniformField {
    #[inline]
    fn bz(&self, _position: [f64; 3]) -> f64 {
        self.bz
    }
}

/// Material crossed along a trajectory segment.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaterialBudget {
    /// Path length in units of the radiation length.
    pub x_over_x0: f64,
    /// Areal density crossed (g/cm²).
    pub x_rho: f64,
}

/// Material lookup by trajectory segment.
pub trait MaterialModel: Send + Sync {
    /// Budget between two global points for a straight path of `length` cm.
    fn budget(&self, from: [f64; 3], to: [f64; 3], length: f64) -> MaterialBudget;
}

/// Homogeneous medium.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformMaterial {
    /// Radiation length (cm).
    pub radiation_length: f64,
    /// Density (g/cm³).
    pub density: f64,
}

impl Default for UniformMaterial {
    /// Ne-CO2 drift gas.
    fn default() -> Self {
        Self {
            radiation_length: 28_000.0,
            density: 0.001_66,
        }
    }
}

impl MaterialModel for UniformMaterial {
    fn budget(&self, _from: [f64; 3], _to: [f64; 3], length: f64) -> MaterialBudget {
        let length = length.abs();
        MaterialBudget {
            x_over_x0: length / self.radiation_length,
            x_rho: length * self.density,
        }
    }
}

/// Vacuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoMaterial;

impl MaterialModel for NoMaterial {
    fn budget(&self, _from: [f64; 3], _to: [f64; 3], _length: f64) -> MaterialBudget {
        MaterialBudget::default()
    }
}

/// Mean energy loss in GeV·cm²/g for a particle with `beta_gamma`.
///
/// Simplified Bethe formula for a light gas.
#[must_use]
pub fn bethe_bloch(beta_gamma: f64) -> f64 {
    let bg2 = beta_gamma * beta_gamma;
    let beta2 = bg2 / (1.0 + bg2);
    if beta2 <= 0.0 {
        return 0.0;
    }
    (0.153e-3 / beta2 * ((5940.0 * bg2).ln() - beta2)).max(0.0)
}
