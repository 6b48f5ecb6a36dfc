//! Matching of segments across sector boundaries.
//!
//! Every segment close to a boundary is transported (field only) into the
//! boundary frame at a common reference X, producing a [`BorderTrack`].
//! Two records are compatible when every χ² test passes; the surviving
//! pairs of one boundary are resolved greedily by ascending χ², so each
//! record takes part in at most one match.

use crate::propagator::{Flight, Propagator};
use rayon::prelude::*;
use trackmerge_core::{
    par, ClusterStore, CovLimits, Covariance, Geometry, MatchingConfig, SectorTrack,
};

/// Projection of one segment onto a boundary plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderTrack {
    pub segment: u32,
    pub n_hits: u32,
    pub row: u16,
    /// `[y, z, sinφ, tanλ, q/pt]` at the boundary X.
    pub p: [f64; 5],
    pub z_offset: f64,
    pub cov: Covariance,
    /// `cov(y, sinφ)` and `cov(z, tanλ)`.
    pub cross: [f64; 2],
}

impl BorderTrack {
    /// Builds a record from parameters already in the boundary frame.
    #[must_use]
    pub fn from_param(segment: u32, n_hits: u32, row: u16, p: [f64; 5], cov: Covariance) -> Self {
        Self {
            segment,
            n_hits,
            row,
            p,
            z_offset: 0.0,
            cov,
            cross: [cov.get(par::Y, par::SNP), cov.get(par::Z, par::TGL)],
        }
    }

    #[must_use]
    pub fn with_z_offset(mut self, z_offset: f64) -> Self {
        self.z_offset = z_offset;
        self
    }

    #[inline]
    fn var(&self, i: usize) -> f64 {
        self.cov.diag(i)
    }
}

/// First test that failed for a pair of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFailure {
    /// Curvature differs by more than the absolute-or-relative margin.
    CurvatureVeto,
    Y,
    Z,
    YSnp,
    ZTgl,
    Qpt,
}

/// Kind of boundary a match was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderKind {
    Azimuthal,
    CentralElectrode,
}

/// An accepted pair of segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderMatch {
    pub a: u32,
    pub b: u32,
    pub chi2: f64,
    pub kind: BorderKind,
}

/// Clamps the diagonal of a record to fixed ceilings and re-bounds the
/// correlations.
pub fn limit_cov(rec: &mut BorderTrack, limits: &CovLimits) {
    let ceilings = [limits.yy, limits.zz, limits.snp, limits.tgl, limits.qpt];
    for (i, max) in ceilings.iter().enumerate() {
        let v = rec.cov.diag(i);
        rec.cov.set(i, i, v.clamp(0.0, *max));
    }
    rec.cov.bound_correlations();
    rec.cross = [rec.cov.get(par::Y, par::SNP), rec.cov.get(par::Z, par::TGL)];
}

/// Generic 2-DOF test of the difference `(d0, d1)` with covariance
/// `[[c00, c01], [c01, c11]]`. Returns the χ² if it passes `cut`.
#[must_use]
pub fn check_chi2(d0: f64, d1: f64, c00: f64, c01: f64, c11: f64, cut: f64) -> Option<f64> {
    let det = c00 * c11 - c01 * c01;
    if !(det > 0.0) {
        return None;
    }
    let chi2 = (d0 * d0 * c11 - 2.0 * d0 * d1 * c01 + d1 * d1 * c00) / det;
    (chi2 <= cut).then_some(chi2)
}

fn check_1d(d: f64, var: f64, cut: f64) -> Option<f64> {
    if !(var > 0.0) {
        return None;
    }
    let chi2 = d * d / var;
    (chi2 <= cut).then_some(chi2)
}

/// Independent lateral position test.
#[must_use]
pub fn check_y(a: &BorderTrack, b: &BorderTrack, cut: f64) -> Option<f64> {
    check_1d(a.p[par::Y] - b.p[par::Y], a.var(par::Y) + b.var(par::Y), cut)
}

/// Independent longitudinal test on offset-corrected z.
#[must_use]
pub fn check_z(a: &BorderTrack, b: &BorderTrack, cut: f64) -> Option<f64> {
    let dz = (a.p[par::Z] + a.z_offset) - (b.p[par::Z] + b.z_offset);
    check_1d(dz, a.var(par::Z) + b.var(par::Z), cut)
}

/// Correlated (y, sinφ) test.
#[must_use]
pub fn check_y_snp(a: &BorderTrack, b: &BorderTrack, cut: f64) -> Option<f64> {
    check_chi2(
        a.p[par::Y] - b.p[par::Y],
        a.p[par::SNP] - b.p[par::SNP],
        a.var(par::Y) + b.var(par::Y),
        a.cross[0] + b.cross[0],
        a.var(par::SNP) + b.var(par::SNP),
        cut,
    )
}

/// Correlated (z, tanλ) test on offset-corrected z.
#[must_use]
pub fn check_z_tgl(a: &BorderTrack, b: &BorderTrack, cut: f64) -> Option<f64> {
    check_chi2(
        (a.p[par::Z] + a.z_offset) - (b.p[par::Z] + b.z_offset),
        a.p[par::TGL] - b.p[par::TGL],
        a.var(par::Z) + b.var(par::Z),
        a.cross[1] + b.cross[1],
        a.var(par::TGL) + b.var(par::TGL),
        cut,
    )
}

/// Curvature test with a hard veto on large differences.
///
/// # Errors
/// [`MatchFailure::CurvatureVeto`] when `|Δq/pt|` exceeds
/// `abs_margin + rel_margin * max(|q/pt|)`, [`MatchFailure::Qpt`] when the
/// χ² exceeds `cut`.
pub fn check_qpt(
    a: &BorderTrack,
    b: &BorderTrack,
    cut: f64,
    abs_margin: f64,
    rel_margin: f64,
) -> Result<f64, MatchFailure> {
    let (qa, qb) = (a.p[par::QPT], b.p[par::QPT]);
    let d = qa - qb;
    if d.abs() > abs_margin + rel_margin * qa.abs().max(qb.abs()) {
        return Err(MatchFailure::CurvatureVeto);
    }
    check_1d(d, a.var(par::QPT) + b.var(par::QPT), cut).ok_or(MatchFailure::Qpt)
}

/// Runs every test; returns the combined χ².
///
/// # Errors
/// The first failing test.
pub fn compare(
    a: &BorderTrack,
    b: &BorderTrack,
    config: &MatchingConfig,
) -> Result<f64, MatchFailure> {
    let cut = config.chi2_cut;
    let qpt = check_qpt(a, b, cut, config.qpt_abs_margin, config.qpt_rel_margin)?;
    check_y(a, b, cut).ok_or(MatchFailure::Y)?;
    check_z(a, b, cut).ok_or(MatchFailure::Z)?;
    let y_snp = check_y_snp(a, b, cut).ok_or(MatchFailure::YSnp)?;
    let z_tgl = check_z_tgl(a, b, cut).ok_or(MatchFailure::ZTgl)?;
    Ok(y_snp + z_tgl + qpt)
}

/// Pairs records of two sides of one boundary by ascending combined χ².
///
/// The result depends only on the inputs and the configuration: ties are
/// broken by record position.
#[must_use]
pub fn match_records(
    a: &[BorderTrack],
    b: &[BorderTrack],
    config: &MatchingConfig,
    kind: BorderKind,
) -> Vec<BorderMatch> {
    let mut candidates = Vec::new();
    for (i, ra) in a.iter().enumerate() {
        for (j, rb) in b.iter().enumerate() {
            if ra.segment == rb.segment {
                continue;
            }
            if let Ok(chi2) = compare(ra, rb, config) {
                candidates.push((chi2, i, j));
            }
        }
    }
    candidates.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)).then(x.2.cmp(&y.2)));

    let mut used_a = vec![false; a.len()];
    let mut used_b = vec![false; b.len()];
    let mut matches = Vec::new();
    for (chi2, i, j) in candidates {
        if used_a[i] || used_b[j] {
            continue;
        }
        used_a[i] = true;
        used_b[j] = true;
        matches.push(BorderMatch {
            a: a[i].segment,
            b: b[j].segment,
            chi2,
            kind,
        });
    }
    matches
}

/// Counters of one matching run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BorderStats {
    pub records: usize,
    pub azimuthal: usize,
    pub central_electrode: usize,
}

/// Builds border records for an event and matches them on every boundary.
pub struct BorderMatcher<'a, G: Geometry + ?Sized> {
    geometry: &'a G,
    config: &'a MatchingConfig,
    propagator: Propagator<'a>,
}

impl<'a, G: Geometry + ?Sized> BorderMatcher<'a, G> {
    /// `propagator` should be field only.
    #[must_use]
    pub fn new(geometry: &'a G, config: &'a MatchingConfig, propagator: Propagator<'a>) -> Self {
        Self {
            geometry,
            config,
            propagator: propagator.without_material(),
        }
    }

    /// Projects a segment into the frame `alpha` at X `x`.
    #[must_use]
    pub fn make_record(
        &self,
        id: u32,
        segment: &SectorTrack,
        alpha: f64,
        x: f64,
    ) -> Option<BorderTrack> {
        let mut param = segment.param;
        self.propagator
            .propagate(&mut param, x, alpha, Flight::Along)
            .ok()?;
        let n_hits = u32::try_from(segment.hits.len()).unwrap_or(u32::MAX);
        let row = u16::try_from(segment.last_row()).unwrap_or(u16::MAX);
        let mut rec = BorderTrack::from_param(id, n_hits, row, param.p, param.cov)
            .with_z_offset(segment.z_offset);
        limit_cov(&mut rec, &self.config.limits);
        Some(rec)
    }

    /// True if some hit lies within the border margin of the upper (`+y`)
    /// or lower (`-y`) sector edge.
    fn near_edge<S: ClusterStore + ?Sized>(
        &self,
        segment: &SectorTrack,
        store: &S,
        upper: bool,
    ) -> bool {
        let margin = self.config.border_margin;
        segment.hits.iter().any(|h| {
            let row = usize::from(h.row);
            let limit = self.geometry.half_width(self.geometry.row_x(row)) - margin;
            store
                .cluster(segment.sector, row, h.index)
                .is_some_and(|c| {
                    let y = f64::from(c.y);
                    if upper {
                        y >= limit
                    } else {
                        y <= -limit
                    }
                })
        })
    }

    /// True if the first or last hit lies within the central electrode window.
    fn near_ce<S: ClusterStore + ?Sized>(&self, segment: &SectorTrack, store: &S) -> bool {
        [segment.hits.first(), segment.hits.last()]
            .into_iter()
            .flatten()
            .any(|h| {
                store
                    .cluster(segment.sector, usize::from(h.row), h.index)
                    .is_some_and(|c| f64::from(c.z).abs() < self.config.ce_z_window)
            })
    }

    fn records<S, P>(
        &self,
        segments: &[SectorTrack],
        store: &S,
        sector: usize,
        alpha: f64,
        select: P,
    ) -> Vec<BorderTrack>
    where
        S: ClusterStore + ?Sized,
        P: Fn(&SectorTrack, &S) -> bool,
    {
        segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sector == sector && select(s, store))
            .filter_map(|(id, s)| {
                let id = u32::try_from(id).ok()?;
                self.make_record(id, s, alpha, self.config.border_x)
            })
            .collect()
    }

    /// Matches every azimuthal boundary and, when enabled, the central
    /// electrode. Boundaries are processed in parallel; the result is
    /// ordered by boundary.
    pub fn match_event<S: ClusterStore + ?Sized>(
        &self,
        store: &S,
        segments: &[SectorTrack],
    ) -> (Vec<BorderMatch>, BorderStats)
    where
        G: Sync,
    {
        let geo = self.geometry;
        let n = geo.sectors_per_side();
        let mut borders: Vec<(usize, usize, BorderKind)> = (0..geo.n_sectors())
            .map(|s| (s, geo.neighbour(s, 1), BorderKind::Azimuthal))
            .collect();
        if self.config.central_electrode {
            borders.extend((0..n).map(|s| (s, geo.mirror_sector(s), BorderKind::CentralElectrode)));
        }

        let per_border: Vec<(usize, Vec<BorderMatch>)> = borders
            .par_iter()
            .map(|&(s, t, kind)| {
                let (a, b) = match kind {
                    BorderKind::Azimuthal => {
                        let alpha = geo.sector_alpha(s) + 0.5 * geo.sector_width();
                        (
                            self.records(segments, store, s, alpha, |seg, st| {
                                self.near_edge(seg, st, true)
                            }),
                            self.records(segments, store, t, alpha, |seg, st| {
                                self.near_edge(seg, st, false)
                            }),
                        )
                    }
                    BorderKind::CentralElectrode => {
                        let alpha = geo.sector_alpha(s);
                        (
                            self.records(segments, store, s, alpha, |seg, st| {
                                self.near_ce(seg, st)
                            }),
                            self.records(segments, store, t, alpha, |seg, st| {
                                self.near_ce(seg, st)
                            }),
                        )
                    }
                };
                (a.len() + b.len(), match_records(&a, &b, self.config, kind))
            })
            .collect();

        let mut stats = BorderStats::default();
        let mut matches = Vec::new();
        for (records, found) in per_border {
            stats.records += records;
            for m in found {
                match m.kind {
                    BorderKind::Azimuthal => stats.azimuthal += 1,
                    BorderKind::CentralElectrode => stats.central_electrode += 1,
                }
                matches.push(m);
            }
        }
        (matches, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(segment: u32, y: f64, z: f64, qpt: f64) -> BorderTrack {
        let mut cov = Covariance::from_diagonal([0.04, 0.09, 1e-4, 1e-4, 0.01]);
        cov.set(par::SNP, par::Y, 0.001);
        BorderTrack::from_param(segment, 20, 32, [y, z, 0.1, 0.3, qpt], cov)
    }

    #[test]
    fn test_check_chi2_uses_correlation() {
        // Perfectly correlated difference along the correlation axis is cheap.
        let with = check_chi2(1.0, 1.0, 1.0, 0.9, 1.0, 100.0).unwrap();
        let without = check_chi2(1.0, 1.0, 1.0, 0.0, 1.0, 100.0).unwrap();
        assert!(with < without);
        assert!(check_chi2(1.0, 0.0, 1.0, 1.0, 1.0, 100.0).is_none());
    }

    #[test]
    fn test_compatible_records_match() {
        let cfg = MatchingConfig::default();
        // Offsets of about one sigma in y and z.
        let a = record(0, 0.0, 10.0, 0.5);
        let b = record(1, 0.25, 10.3, 0.52);
        let chi2 = compare(&a, &b, &cfg).unwrap();
        assert!(chi2 > 0.0 && chi2 < 3.0 * cfg.chi2_cut);
    }

    #[test]
    fn test_curvature_veto() {
        let cfg = MatchingConfig::default();
        let a = record(0, 0.0, 10.0, 2.0);
        let b = record(1, 0.0, 10.0, 3.0);
        assert_eq!(compare(&a, &b, &cfg), Err(MatchFailure::CurvatureVeto));
        assert_eq!(
            check_qpt(&a, &b, 1e9, cfg.qpt_abs_margin, cfg.qpt_rel_margin),
            Err(MatchFailure::CurvatureVeto)
        );
    }

    #[test]
    fn test_z_offset_correction() {
        let cfg = MatchingConfig::default();
        let a = record(0, 0.0, 10.0, 0.5);
        let b = record(1, 0.0, 14.0, 0.5);
        assert_eq!(compare(&a, &b, &cfg), Err(MatchFailure::Z));
        let a = a.with_z_offset(4.0);
        assert!(check_z(&a, &b, cfg.chi2_cut).is_some());
    }

    #[test]
    fn test_limit_cov() {
        let mut rec = record(0, 0.0, 0.0, 1.0);
        rec.cov.set(par::Y, par::Y, 50.0);
        rec.cov.set(par::SNP, par::Y, 0.06);
        limit_cov(&mut rec, &CovLimits::default());
        assert!((rec.cov.diag(par::Y) - 5.0).abs() < 1e-12);
        assert!(rec.cov.is_valid());
        assert!((rec.cross[0] - rec.cov.get(par::Y, par::SNP)).abs() < 1e-15);
    }

    #[test]
    fn test_mutual_best_is_unique_and_deterministic() {
        let cfg = MatchingConfig::default();
        let a = vec![record(0, 0.0, 10.0, 0.5), record(1, 0.1, 10.0, 0.5)];
        let b = vec![record(2, 0.05, 10.0, 0.5), record(3, 5.0, 50.0, 0.5)];
        let first = match_records(&a, &b, &cfg, BorderKind::Azimuthal);
        let second = match_records(&a, &b, &cfg, BorderKind::Azimuthal);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].b, 2);
    }
}
