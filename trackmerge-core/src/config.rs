//! Merger configuration.
//!
//! Every section has defaults tuned for [`crate::CylindricalGeometry`] with a
//! 5 kG solenoid field. Builders return updated copies.

use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ceilings applied to border-record covariances before comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CovLimits {
    pub yy: f64,
    pub zz: f64,
    pub snp: f64,
    pub tgl: f64,
    pub qpt: f64,
}

impl Default for CovLimits {
    fn default() -> Self {
        Self {
            yy: 5.0,
            zz: 5.0,
            snp: 0.01,
            tgl: 0.01,
            qpt: 4.0,
        }
    }
}

/// Border matching settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MatchingConfig {
    /// Reference X of the boundary frame (cm).
    pub border_x: f64,
    /// Distance from the sector edge within which a segment takes part (cm).
    pub border_margin: f64,
    /// Cut applied by every compatibility test.
    pub chi2_cut: f64,
    /// Absolute q/pt margin of the curvature veto.
    pub qpt_abs_margin: f64,
    /// Relative q/pt margin of the curvature veto.
    pub qpt_rel_margin: f64,
    /// Match segments across the central electrode.
    pub central_electrode: bool,
    /// |z| window around the central electrode (cm).
    pub ce_z_window: f64,
    pub limits: CovLimits,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            border_x: 165.0,
            border_margin: 10.0,
            chi2_cut: 9.0,
            qpt_abs_margin: 0.1,
            qpt_rel_margin: 0.2,
            central_electrode: true,
            ce_z_window: 10.0,
            limits: CovLimits::default(),
        }
    }
}

impl MatchingConfig {
    #[must_use]
    pub fn with_chi2_cut(mut self, cut: f64) -> Self {
        self.chi2_cut = cut;
        self
    }

    #[must_use]
    pub fn with_border_x(mut self, x: f64) -> Self {
        self.border_x = x;
        self
    }

    #[must_use]
    pub fn with_central_electrode(mut self, enabled: bool) -> Self {
        self.central_electrode = enabled;
        self
    }
}

/// How a looper crossing is continued during the refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LooperMode {
    /// Mirror the state at the apex and keep fitting.
    #[default]
    InPlace,
    /// Fit the primary leg only and queue the rest for the loop stage.
    Deferred,
}

/// Looper linking and continuation settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LooperConfig {
    /// Link segments of opposite orientation through their helix apex.
    pub match_loopers: bool,
    /// Transverse apex distance tolerance (cm).
    pub apex_dxy: f64,
    /// Longitudinal apex distance tolerance (cm).
    pub apex_dz: f64,
    /// Relative helix radius tolerance.
    pub radius_tolerance: f64,
    /// Minimum |sinφ| at which a reversal is accepted during the refit.
    pub min_sin_phi: f64,
    pub mode: LooperMode,
    /// y variance after a mirror (cm²).
    pub mirror_sigma2_y: f64,
    /// z variance after a mirror (cm²).
    pub mirror_sigma2_z: f64,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            match_loopers: true,
            apex_dxy: 3.0,
            apex_dz: 5.0,
            radius_tolerance: 0.15,
            min_sin_phi: 0.5,
            mode: LooperMode::InPlace,
            mirror_sigma2_y: 1.0,
            mirror_sigma2_z: 2.0,
        }
    }
}

impl LooperConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: LooperMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_match_loopers(mut self, enabled: bool) -> Self {
        self.match_loopers = enabled;
        self
    }
}

/// Longitudinal variance added at a mid-track sector crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ZJump {
    /// Constant variance (cm²).
    Fixed { variance: f64 },
    /// Variance proportional to |Bz| (cm² per kG).
    FieldScaled { variance_per_kgauss: f64 },
}

impl Default for ZJump {
    fn default() -> Self {
        ZJump::Fixed { variance: 0.5 }
    }
}

impl ZJump {
    /// Variance to add for a field of `bz` kG.
    #[must_use]
    pub fn variance(&self, bz: f64) -> f64 {
        match *self {
            ZJump::Fixed { variance } => variance,
            ZJump::FieldScaled {
                variance_per_kgauss,
            } => variance_per_kgauss * bz.abs(),
        }
    }
}

/// Tube search for extra clusters around the fitted trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TubeConfig {
    pub enabled: bool,
    /// Gate size in standard deviations.
    pub sigma: f64,
    /// Lower bound of each half-axis (cm).
    pub min: f64,
    /// Upper bound of each half-axis (cm).
    pub max: f64,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sigma: 3.0,
            min: 0.2,
            max: 2.0,
        }
    }
}

/// Multi-pass refit settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RefitConfig {
    /// Number of alternating passes; the last one runs against flight.
    pub ways: usize,
    pub max_sin_phi: f64,
    /// Measurement χ² cut.
    pub chi2_cut: f64,
    /// Combine with the previous pass to reject outliers in the last pass.
    pub interpolation_rejection: bool,
    pub interpolation_chi2_cut: f64,
    /// Consecutive misses that mark a bad track region.
    pub soft_miss: u32,
    /// Consecutive misses that abort the pass.
    pub hard_miss: u32,
    /// Growth of the y variance since the last accepted hit that marks a bad region.
    pub bad_region_growth: f64,
    /// Cluster y resolution (cm).
    pub sigma_y: f64,
    /// Cluster z resolution (cm).
    pub sigma_z: f64,
    /// Width of the unreliable band at the sector edge (cm).
    pub edge_band: f64,
    pub z_jump: ZJump,
    pub tube: TubeConfig,
    /// Apply material effects in the last pass.
    pub material: bool,
    /// Canonical reference X of the output parameters (cm).
    pub reference_x: f64,
    /// Neighbour rotations tried during the reference move.
    pub max_reference_rotations: u32,
    /// Retry once with a loose seed after a numerical failure.
    pub loose_retry: bool,
    /// Covariance scale of the loose seed.
    pub loose_factor: f64,
    pub min_hits: u32,
    pub min_hits_low_pt: u32,
    /// |q/pt| above which `min_hits_low_pt` applies.
    pub low_pt_qpt: f64,
    pub max_tolerated: u32,
    /// Fraction of rows kept by the truncated dE/dx mean.
    pub dedx_truncation: f64,
}

impl Default for RefitConfig {
    fn default() -> Self {
        Self {
            ways: 3,
            max_sin_phi: 0.999,
            chi2_cut: 25.0,
            interpolation_rejection: true,
            interpolation_chi2_cut: 25.0,
            soft_miss: 3,
            hard_miss: 10,
            bad_region_growth: 10.0,
            sigma_y: 0.08,
            sigma_z: 0.1,
            edge_band: 0.5,
            z_jump: ZJump::default(),
            tube: TubeConfig::default(),
            material: true,
            reference_x: 83.0,
            max_reference_rotations: 3,
            loose_retry: true,
            loose_factor: 10.0,
            min_hits: 10,
            min_hits_low_pt: 6,
            low_pt_qpt: 5.0,
            max_tolerated: 8,
            dedx_truncation: 0.6,
        }
    }
}

impl RefitConfig {
    /// Minimum accepted plus tolerated hits for a track of the given q/pt.
    #[must_use]
    pub fn min_hits_for(&self, qpt: f64) -> u32 {
        if qpt.abs() > self.low_pt_qpt {
            self.min_hits_low_pt
        } else {
            self.min_hits
        }
    }

    #[must_use]
    pub fn with_ways(mut self, ways: usize) -> Self {
        self.ways = ways;
        self
    }

    #[must_use]
    pub fn with_min_hits(mut self, min_hits: u32) -> Self {
        self.min_hits = min_hits;
        self.min_hits_low_pt = self.min_hits_low_pt.min(min_hits);
        self
    }

    #[must_use]
    pub fn with_chi2_cut(mut self, cut: f64) -> Self {
        self.chi2_cut = cut;
        self
    }

    #[must_use]
    pub fn with_material(mut self, enabled: bool) -> Self {
        self.material = enabled;
        self
    }

    #[must_use]
    pub fn with_tube(mut self, tube: TubeConfig) -> Self {
        self.tube = tube;
        self
    }

    #[must_use]
    pub fn with_z_jump(mut self, z_jump: ZJump) -> Self {
        self.z_jump = z_jump;
        self
    }
}

/// Output filtering settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OutputConfig {
    /// Minimum surviving clusters per track.
    pub min_clusters: u32,
    /// Keep only hits of the first leg.
    pub primary_leg_only: bool,
    /// dE/dx threshold for positive tracks.
    pub min_dedx_pos: f64,
    /// dE/dx threshold for negative tracks.
    pub min_dedx_neg: f64,
    /// |tanλ| above which the dE/dx threshold is not applied.
    pub near_vertical_tgl: f64,
    /// Use the smaller side for both ends of the time window.
    pub symmetric_time_window: bool,
    /// Store the outer-parameter snapshot.
    pub outer_param: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_clusters: 10,
            primary_leg_only: false,
            min_dedx_pos: 0.0,
            min_dedx_neg: 0.0,
            near_vertical_tgl: 1.5,
            symmetric_time_window: true,
            outer_param: true,
        }
    }
}

impl OutputConfig {
    #[must_use]
    pub fn with_min_clusters(mut self, n: u32) -> Self {
        self.min_clusters = n;
        self
    }

    #[must_use]
    pub fn with_dedx_thresholds(mut self, positive: f64, negative: f64) -> Self {
        self.min_dedx_pos = positive;
        self.min_dedx_neg = negative;
        self
    }

    #[must_use]
    pub fn with_primary_leg_only(mut self, enabled: bool) -> Self {
        self.primary_leg_only = enabled;
        self
    }

    #[must_use]
    pub fn with_symmetric_time_window(mut self, enabled: bool) -> Self {
        self.symmetric_time_window = enabled;
        self
    }
}

/// Capacities of the shared output arrays; `None` sizes them from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CapacityConfig {
    pub tracks: Option<usize>,
    pub clusters: Option<usize>,
    pub loop_data: Option<usize>,
}

/// Complete merger configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MergerConfig {
    /// Solenoid field used when no field map is supplied (kG).
    pub bz: f64,
    pub matching: MatchingConfig,
    pub loopers: LooperConfig,
    pub refit: RefitConfig,
    pub output: OutputConfig,
    pub capacity: CapacityConfig,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            bz: 5.0,
            matching: MatchingConfig::default(),
            loopers: LooperConfig::default(),
            refit: RefitConfig::default(),
            output: OutputConfig::default(),
            capacity: CapacityConfig::default(),
        }
    }
}

impl MergerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bz(mut self, bz: f64) -> Self {
        self.bz = bz;
        self
    }

    #[must_use]
    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = matching;
        self
    }

    #[must_use]
    pub fn with_loopers(mut self, loopers: LooperConfig) -> Self {
        self.loopers = loopers;
        self
    }

    #[must_use]
    pub fn with_refit(mut self, refit: RefitConfig) -> Self {
        self.refit = refit;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: CapacityConfig) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: f64) -> Result<()> {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(Error::Config(format!("{name} must be positive, got {v}")))
            }
        }

        if !self.bz.is_finite() {
            return Err(Error::Config("bz must be finite".to_string()));
        }
        positive("matching.border_x", self.matching.border_x)?;
        positive("matching.chi2_cut", self.matching.chi2_cut)?;
        positive("matching.ce_z_window", self.matching.ce_z_window)?;
        if self.matching.qpt_abs_margin < 0.0 || self.matching.qpt_rel_margin < 0.0 {
            return Err(Error::Config("q/pt margins must be non-negative".to_string()));
        }
        positive("loopers.apex_dxy", self.loopers.apex_dxy)?;
        positive("loopers.apex_dz", self.loopers.apex_dz)?;
        positive("loopers.mirror_sigma2_y", self.loopers.mirror_sigma2_y)?;
        positive("loopers.mirror_sigma2_z", self.loopers.mirror_sigma2_z)?;

        let r = &self.refit;
        if r.ways == 0 {
            return Err(Error::Config("refit.ways must be at least 1".to_string()));
        }
        if !(r.max_sin_phi > 0.0 && r.max_sin_phi < 1.0) {
            return Err(Error::Config(format!(
                "refit.max_sin_phi must lie in (0, 1), got {}",
                r.max_sin_phi
            )));
        }
        positive("refit.chi2_cut", r.chi2_cut)?;
        positive("refit.interpolation_chi2_cut", r.interpolation_chi2_cut)?;
        positive("refit.sigma_y", r.sigma_y)?;
        positive("refit.sigma_z", r.sigma_z)?;
        positive("refit.loose_factor", r.loose_factor)?;
        positive("refit.bad_region_growth", r.bad_region_growth)?;
        if r.soft_miss == 0 || r.soft_miss > r.hard_miss {
            return Err(Error::Config(
                "refit.soft_miss must be in 1..=hard_miss".to_string(),
            ));
        }
        if r.tube.min < 0.0 || r.tube.min > r.tube.max {
            return Err(Error::Config("refit.tube min must not exceed max".to_string()));
        }
        if !(r.dedx_truncation > 0.0 && r.dedx_truncation <= 1.0) {
            return Err(Error::Config(
                "refit.dedx_truncation must lie in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MergerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = MergerConfig::default().with_refit(RefitConfig::default().with_ways(0));
        assert!(cfg.validate().is_err());

        let mut refit = RefitConfig::default();
        refit.soft_miss = 20;
        assert!(MergerConfig::default().with_refit(refit).validate().is_err());

        let cfg =
            MergerConfig::default().with_matching(MatchingConfig::default().with_chi2_cut(-1.0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_min_hits_depends_on_momentum() {
        let refit = RefitConfig::default();
        assert_eq!(refit.min_hits_for(1.0), 10);
        assert_eq!(refit.min_hits_for(-8.0), 6);
        let strict = refit.with_min_hits(4);
        assert_eq!(strict.min_hits_for(-8.0), 4);
    }

    #[test]
    fn test_z_jump_variance() {
        assert!((ZJump::Fixed { variance: 0.5 }.variance(-2.0) - 0.5).abs() < 1e-12);
        let scaled = ZJump::FieldScaled {
            variance_per_kgauss: 0.1,
        };
        assert!((scaled.variance(-5.0) - 0.5).abs() < 1e-12);
    }
}
