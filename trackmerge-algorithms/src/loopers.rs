//! Looper handling: apex geometry, segment linking and state continuation.
//!
//! A looper reverses its radial direction at a helix apex. The apex is the
//! point of the circle with the largest ([`ApexKind::Max`]) or smallest
//! ([`ApexKind::Min`]) local X of a given frame. Because inward segments are
//! stored in the reversed representation, the circle centre is the same for
//! both legs and can be compared directly.

use crate::field::curvature;
use crate::propagator::{Flight, Propagator};
use crate::track_state::{Apex, TrackState};
use std::f64::consts::PI;
use trackmerge_core::{
    normalize_angle, ClusterStore, Geometry, LooperConfig, SectorTrack, TrackParam,
};

/// Which side of the circle a reversal happens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApexKind {
    /// Outermost point: the track turns back inwards.
    Max,
    /// Innermost point: the track turns back outwards.
    Min,
}

impl ApexKind {
    /// Apex reached when leaving a leg in the given radial direction.
    #[must_use]
    pub fn leaving(outward: bool) -> Self {
        if outward {
            ApexKind::Max
        } else {
            ApexKind::Min
        }
    }
}

/// Circle of a state in the frame `frame_alpha`: centre and signed curvature.
fn circle(param: &TrackParam, frame_alpha: f64, bz: f64) -> Option<([f64; 2], f64)> {
    let k = curvature(param.qpt(), bz);
    if k.abs() < 1e-9 {
        return None;
    }
    let cx = param.x - param.snp() / k;
    let cy = param.y() + param.cos_phi() / k;
    let da = normalize_angle(frame_alpha - param.alpha);
    let (sa, ca) = da.sin_cos();
    Some(([cx * ca + cy * sa, -cx * sa + cy * ca], k))
}

/// Apex of the helix of `param` in the frame `frame_alpha`.
///
/// The z of the apex follows the nearest arc from the reference point.
/// Returns `None` for a straight track.
#[must_use]
pub fn apex_in_frame(
    param: &TrackParam,
    kind: ApexKind,
    frame_alpha: f64,
    bz: f64,
) -> Option<Apex> {
    let (c, k) = circle(param, frame_alpha, bz)?;
    let r = 1.0 / k.abs();
    let da = normalize_angle(frame_alpha - param.alpha);
    let (sa, ca) = da.sin_cos();
    let px = param.x * ca + param.y() * sa;
    let py = -param.x * sa + param.y() * ca;
    let theta_pos = (py - c[1]).atan2(px - c[0]);

    let (x, theta_apex, snp) = match kind {
        ApexKind::Max => (c[0] + r, 0.0, k.signum()),
        ApexKind::Min => (c[0] - r, PI, -k.signum()),
    };
    let ds = normalize_angle(theta_apex - theta_pos) / k;
    Some(Apex {
        x,
        y: c[1],
        z: param.z() + param.tgl() * ds,
        snp,
    })
}

/// Mirrors `state` at its local apex if the current direction shows the
/// reversal is imminent. Returns false if the reversal is not expected
/// here; the state is then unchanged.
pub fn continue_looper(
    state: &mut TrackState,
    kind: ApexKind,
    bz: f64,
    config: &LooperConfig,
    max_sin_phi: f64,
) -> bool {
    let k = curvature(state.param.qpt(), bz);
    let snp = state.param.snp();
    if k.abs() < 1e-9 || snp.abs() < config.min_sin_phi {
        return false;
    }
    let turning = match kind {
        ApexKind::Max => snp * k > 0.0,
        ApexKind::Min => snp * k < 0.0,
    };
    if !turning {
        return false;
    }
    let Some(apex) = apex_in_frame(&state.param, kind, state.param.alpha, bz) else {
        return false;
    };
    state.mirror(&apex, config.mirror_sigma2_y, config.mirror_sigma2_z, max_sin_phi);
    true
}

/// Deferred continuation of a looper after its primary leg was fitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopData {
    pub candidate: u32,
    /// State at the last fitted hit before the apex.
    pub state: TrackState,
    pub kind: ApexKind,
    /// First fused hit after the apex.
    pub first_hit: usize,
    pub flight: Flight,
}

/// Two segments linked through a common apex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LooperMatch {
    /// Segment before the apex in flight order.
    pub before: u32,
    /// Segment after the apex.
    pub after: u32,
    pub kind: ApexKind,
    pub cost: f64,
}

/// Apex of one segment end, with the helix radius.
#[derive(Debug, Clone, Copy)]
struct SegmentApex {
    apex: Apex,
    radius: f64,
}

/// Links segments of opposite radial orientation whose helices share an apex.
pub struct LooperMatcher<'a, G: Geometry + ?Sized> {
    geometry: &'a G,
    config: &'a LooperConfig,
    propagator: Propagator<'a>,
}

impl<'a, G: Geometry + ?Sized> LooperMatcher<'a, G> {
    #[must_use]
    pub fn new(geometry: &'a G, config: &'a LooperConfig, propagator: Propagator<'a>) -> Self {
        Self {
            geometry,
            config,
            propagator: propagator.without_material(),
        }
    }

    /// Apex of `segment` in the frame of `frame_sector`, evaluated from the
    /// segment end closest to the apex.
    fn segment_apex<S: ClusterStore + ?Sized>(
        &self,
        segment: &SectorTrack,
        store: &S,
        kind: ApexKind,
        before: bool,
        frame_sector: usize,
    ) -> Option<SegmentApex> {
        let mut param = segment.param;
        if before {
            let last = segment.hits.last()?;
            store.cluster(segment.sector, usize::from(last.row), last.index)?;
            let x = self.geometry.row_x(usize::from(last.row));
            let flight = if segment.is_outward() {
                Flight::Along
            } else {
                Flight::Against
            };
            let alpha = param.alpha;
            self.propagator.try_propagate(&mut param, x, alpha, flight).ok()?;
        }
        let bz = self.propagator.bz_at(&param);
        let k = curvature(param.qpt(), bz);
        let mut apex = apex_in_frame(&param, kind, self.geometry.sector_alpha(frame_sector), bz)?;
        apex.z += segment.z_offset;
        Some(SegmentApex {
            apex,
            radius: 1.0 / k.abs(),
        })
    }

    fn cost(&self, a: &SegmentApex, b: &SegmentApex) -> Option<f64> {
        let dxy = (a.apex.x - b.apex.x).hypot(a.apex.y - b.apex.y);
        let dz = (a.apex.z - b.apex.z).abs();
        let dr = (a.radius - b.radius).abs();
        if dxy > self.config.apex_dxy
            || dz > self.config.apex_dz
            || dr > self.config.radius_tolerance * a.radius.max(b.radius)
        {
            return None;
        }
        Some(dxy / self.config.apex_dxy + dz / self.config.apex_dz)
    }

    /// Candidate links for every ordered pair of segments, best first.
    ///
    /// A segment is used at most once as the leg before an apex and at most
    /// once as the leg after one.
    pub fn match_segments<S: ClusterStore + ?Sized>(
        &self,
        store: &S,
        segments: &[SectorTrack],
    ) -> Vec<LooperMatch> {
        let geo = self.geometry;
        let n_rows = geo.n_rows();
        let outer_limit = if n_rows == 0 {
            0.0
        } else {
            geo.row_x(n_rows - 1) + 2.0 * geo.row_pitch(n_rows - 1)
        };

        let mut candidates = Vec::new();
        for (i, a) in segments.iter().enumerate() {
            let kind = ApexKind::leaving(a.is_outward());
            let Some(apex_a) = self.segment_apex(a, store, kind, true, a.sector) else {
                continue;
            };
            if apex_a.apex.x > outer_limit || apex_a.apex.x < 0.0 {
                continue;
            }
            for (j, b) in segments.iter().enumerate() {
                if i == j
                    || b.is_outward() == a.is_outward()
                    || geo.sector_side(b.sector) != geo.sector_side(a.sector)
                    || a.param.qpt() * b.param.qpt() >= 0.0
                {
                    continue;
                }
                let adjacent = b.sector == a.sector
                    || b.sector == geo.neighbour(a.sector, 1)
                    || b.sector == geo.neighbour(a.sector, -1);
                if !adjacent {
                    continue;
                }
                let Some(apex_b) = self.segment_apex(b, store, kind, false, a.sector) else {
                    continue;
                };
                if let Some(cost) = self.cost(&apex_a, &apex_b) {
                    candidates.push((cost, i, j, kind));
                }
            }
        }
        candidates.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)).then(x.2.cmp(&y.2)));

        let mut used_before = vec![false; segments.len()];
        let mut used_after = vec![false; segments.len()];
        let mut matches = Vec::new();
        for (cost, i, j, kind) in candidates {
            if used_before[i] || used_after[j] {
                continue;
            }
            let (Ok(before), Ok(after)) = (u32::try_from(i), u32::try_from(j)) else {
                continue;
            };
            used_before[i] = true;
            used_after[j] = true;
            matches.push(LooperMatch {
                before,
                after,
                kind,
                cost,
            });
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::UniformField;
    use approx::assert_abs_diff_eq;
    use trackmerge_core::{par, Covariance};

    fn param(x: f64, snp: f64, qpt: f64) -> TrackParam {
        TrackParam::new(
            x,
            0.0,
            [0.0, 10.0, snp, 0.3, qpt],
            Covariance::from_diagonal([0.01, 0.01, 1e-4, 1e-4, 1e-3]),
        )
    }

    #[test]
    fn test_apex_lies_on_the_circle() {
        let bz = 5.0;
        let t = param(150.0, 0.0, 3.0);
        let k = curvature(3.0, bz);
        let r = 1.0 / k.abs();
        let max = apex_in_frame(&t, ApexKind::Max, 0.0, bz).unwrap();
        let min = apex_in_frame(&t, ApexKind::Min, 0.0, bz).unwrap();
        assert_abs_diff_eq!(max.x - min.x, 2.0 * r, epsilon = 1e-9);
        assert_abs_diff_eq!(max.x, 150.0 + r, epsilon = 1e-9);
        // A quarter turn ahead and a quarter turn behind.
        assert_abs_diff_eq!(max.z - 10.0, 0.3 * 0.5 * PI * r, epsilon = 1e-9);
        assert_abs_diff_eq!(min.z - 10.0, -0.3 * 0.5 * PI * r, epsilon = 1e-9);
        assert_abs_diff_eq!(max.snp, k.signum());
        assert_abs_diff_eq!(min.snp, -k.signum());
    }

    #[test]
    fn test_apex_is_frame_independent() {
        let bz = 5.0;
        let field = UniformField::new(bz);
        let prop = Propagator::new(&field, 0.999);
        let t = param(150.0, 0.2, -3.0);
        let a = apex_in_frame(&t, ApexKind::Max, 0.0, bz).unwrap();
        let mut rotated = t;
        prop.rotate(&mut rotated, 0.1).unwrap();
        let b = apex_in_frame(&rotated, ApexKind::Max, 0.0, bz).unwrap();
        assert_abs_diff_eq!(a.x, b.x, epsilon = 1e-9);
        assert_abs_diff_eq!(a.y, b.y, epsilon = 1e-9);
        assert_abs_diff_eq!(a.z, b.z, epsilon = 1e-9);
    }

    #[test]
    fn test_straight_track_has_no_apex() {
        assert!(apex_in_frame(&param(150.0, 0.0, 0.0), ApexKind::Max, 0.0, 5.0).is_none());
    }

    #[test]
    fn test_continue_looper_requires_turning_direction() {
        let bz = 5.0;
        let cfg = LooperConfig::default();
        let k = curvature(3.0, bz);
        let mut s = TrackState::new(param(150.0, 0.9 * k.signum(), 3.0), 0.0);
        s.ndf = 20;

        let mut wrong = s;
        assert!(!continue_looper(&mut wrong, ApexKind::Min, bz, &cfg, 0.999));
        assert_eq!(wrong, s);

        let mut shallow = s;
        shallow.param.p[par::SNP] = 0.1 * k.signum();
        assert!(!continue_looper(&mut shallow, ApexKind::Max, bz, &cfg, 0.999));

        assert!(continue_looper(&mut s, ApexKind::Max, bz, &cfg, 0.999));
        assert!(s.param.x > 150.0);
        assert_abs_diff_eq!(s.param.snp(), -0.999 * k.signum());
        assert_abs_diff_eq!(s.param.qpt(), -3.0);
        assert_eq!(s.ndf, 23);
    }
}
