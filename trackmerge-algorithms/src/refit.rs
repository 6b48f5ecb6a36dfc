//! Multi-pass Kalman refit of fused track candidates.
//!
//! A refit runs `ways` passes over the fused hit list, alternating the
//! direction so that the last pass runs against the flight direction and
//! ends near the production point. Intermediate passes are field only;
//! the last pass adds material effects, the tube search for extra
//! clusters, interpolation-based outlier rejection and dE/dx.
//!
//! Per hit group a pass:
//! 1. averages clusters sampled twice on the same row,
//! 2. mirrors the state at a looper apex when the leg changes,
//! 3. widens σz at a mid-track sector change,
//! 4. propagates to the row, retrying once in a frame aligned with the
//!    track direction,
//! 5. collects nearby clusters for the tube claim (last pass only),
//! 6. runs the measurement update and the miss bookkeeping.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use crate::arena::{AppendArena, ErrorFlags};
use crate::fuse::TrackCandidate;
use crate::loopers::{continue_looper, ApexKind, LoopData};
use crate::propagator::{Flight, Propagator};
use crate::track_state::{Measurement, Prediction, RejectionMode, TrackState, UpdateOutcome};
use std::ops::Range;
use trackmerge_core::{
    hit_state, normalize_angle, par, ClusterRef, ClusterStore, Geometry, LooperConfig, LooperMode,
    RefitConfig, TrackParam,
};

/// Why a candidate did not produce a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitFailure {
    /// Empty hit list.
    NoHits,
    /// Non-finite or non-PSD state.
    Numerical,
    /// Not enough hits or too many outliers.
    Gate,
}

/// Accepted refit of one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitResult {
    /// State at the reference X (or at the innermost hit if the move failed).
    pub state: TrackState,
    /// State at the outermost fitted hit of the primary leg.
    pub outer: Option<TrackParam>,
    pub n_accepted: u32,
    pub n_tolerated: u32,
    pub dedx: f64,
    /// Succeeded only on the loose second attempt.
    pub loose_retry: bool,
    /// Later legs were queued for the loop stage.
    pub deferred: bool,
}

/// Refit progress of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FitStatus {
    #[default]
    Pending,
    Fitted(FitResult),
    Failed(FitFailure),
}

impl FitStatus {
    #[must_use]
    pub fn result(&self) -> Option<&FitResult> {
        match self {
            FitStatus::Fitted(r) => Some(r),
            _ => None,
        }
    }
}

/// Order of the hits within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassDirection {
    /// Flight order.
    Forward,
    /// Reverse flight order.
    Backward,
}

impl PassDirection {
    /// Direction of pass `pass` out of `ways`; the last pass is always backward.
    #[must_use]
    pub fn of_pass(pass: usize, ways: usize) -> Self {
        if (ways.saturating_sub(1 + pass)) % 2 == 0 {
            PassDirection::Backward
        } else {
            PassDirection::Forward
        }
    }

    #[must_use]
    pub fn flight(self) -> Flight {
        match self {
            PassDirection::Forward => Flight::Along,
            PassDirection::Backward => Flight::Against,
        }
    }
}

/// Terminal acceptance check.
#[must_use]
pub fn passes_gate(
    config: &RefitConfig,
    qpt: f64,
    accepted: u32,
    tolerated: u32,
    valid: bool,
) -> bool {
    valid
        && accepted + tolerated > config.min_hits_for(qpt)
        && 2 * tolerated <= accepted
        && tolerated <= config.max_tolerated
}

/// Mean of the lowest `fraction` of the values (at least one).
#[must_use]
pub fn truncated_mean(values: &mut [f64], fraction: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let keep = ((values.len() as f64 * fraction).ceil() as usize).clamp(1, values.len());
    values[..keep].iter().sum::<f64>() / keep as f64
}

#[derive(Debug, Clone, Copy)]
struct PassPlan {
    direction: PassDirection,
    last: bool,
    material: bool,
    record_predictions: bool,
    use_predictions: bool,
    tube: bool,
}

#[derive(Debug, Default)]
struct PassOutput {
    accepted: u32,
    tolerated: u32,
    /// State right after the first accepted group.
    first_state: Option<TrackState>,
    dedx_rows: Vec<f64>,
    /// Row X and state of the outermost accepted primary-leg group.
    outer: Option<(f64, TrackParam)>,
}

#[derive(Debug, Clone, Copy)]
struct GroupMeasurement {
    y: f64,
    z: f64,
    q: f64,
    edge: bool,
}

#[derive(Debug, Clone, Copy)]
struct PassFailure {
    failure: FitFailure,
    last: bool,
}

type Predictions = [Option<(f64, Prediction)>];

/// Per-candidate refit kernel. Shared read-only by all lanes; the only
/// shared writes go through the loop queue and the error flags.
pub struct Refitter<'a, G: Geometry + ?Sized, S: ClusterStore + ?Sized> {
    geometry: &'a G,
    store: &'a S,
    propagator: Propagator<'a>,
    config: &'a RefitConfig,
    loopers: &'a LooperConfig,
    errors: &'a ErrorFlags,
    loop_queue: Option<&'a AppendArena<LoopData>>,
}

impl<'a, G: Geometry + ?Sized, S: ClusterStore + ?Sized> Refitter<'a, G, S> {
    /// `propagator` carries the material model used by the last pass.
    #[must_use]
    pub fn new(
        geometry: &'a G,
        store: &'a S,
        propagator: Propagator<'a>,
        config: &'a RefitConfig,
        loopers: &'a LooperConfig,
        errors: &'a ErrorFlags,
    ) -> Self {
        Self {
            geometry,
            store,
            propagator,
            config,
            loopers,
            errors,
            loop_queue: None,
        }
    }

    /// Queue for deferred looper legs.
    #[must_use]
    pub fn with_loop_queue(mut self, queue: &'a AppendArena<LoopData>) -> Self {
        self.loop_queue = Some(queue);
        self
    }

    fn deferred(&self, candidate: &TrackCandidate) -> bool {
        self.loopers.mode == LooperMode::Deferred && candidate.n_legs() > 1
    }

    /// Refits one candidate and stores the outcome in `candidate.fit`.
    pub fn refit(&self, candidate: &mut TrackCandidate) {
        let original = candidate.hits.clone();
        let status = match self.fit_passes(candidate, false) {
            Ok(result) => FitStatus::Fitted(result),
            Err(PassFailure {
                failure: FitFailure::Numerical,
                last: true,
            }) if self.config.loose_retry => {
                candidate.hits.copy_from_slice(&original);
                match self.fit_passes(candidate, true) {
                    Ok(mut result) => {
                        result.loose_retry = true;
                        FitStatus::Fitted(result)
                    }
                    Err(e) => FitStatus::Failed(e.failure),
                }
            }
            Err(e) => FitStatus::Failed(e.failure),
        };
        candidate.fit = status;
    }

    /// Runs all passes. A loose fit widens the seed covariance by
    /// `loose_factor` and leaves out material corrections.
    fn fit_passes(
        &self,
        candidate: &mut TrackCandidate,
        loose: bool,
    ) -> Result<FitResult, PassFailure> {
        let n = candidate.hits.len();
        candidate.tube.clear();
        if n == 0 {
            return Err(PassFailure {
                failure: FitFailure::NoHits,
                last: false,
            });
        }
        let deferred = self.deferred(candidate);
        let end = if deferred {
            candidate.leg_start(1).unwrap_or(n)
        } else {
            n
        };
        let (scale, material) = if loose {
            (self.config.loose_factor, false)
        } else {
            (1.0, self.config.material)
        };
        let ways = self.config.ways.max(1);
        let first = PassDirection::of_pass(0, ways);
        let seed = if first == PassDirection::Backward && !deferred {
            candidate.seed_last
        } else {
            candidate.seed_first
        };
        let mut state = TrackState::new(seed, candidate.z_offset);
        state.param.p[par::Z] += candidate.z_offset;

        let mut predictions = vec![None; n];
        let mut leg_end: Option<TrackState> = None;
        let mut last_out = PassOutput::default();
        for pass in 0..ways {
            let direction = PassDirection::of_pass(pass, ways);
            let last = pass + 1 == ways;
            let plan = PassPlan {
                direction,
                last,
                material: last && material,
                record_predictions: pass + 2 == ways,
                use_predictions: last && self.config.interpolation_rejection,
                tube: last && self.config.tube.enabled,
            };
            state.reset_covariance(scale);
            let out = self
                .run_pass(
                    &mut candidate.hits,
                    &candidate.leg_outward,
                    0..end,
                    &mut state,
                    &plan,
                    &mut predictions,
                    None,
                    &mut candidate.tube,
                )
                .map_err(|failure| PassFailure { failure, last })?;
            if direction == PassDirection::Forward {
                leg_end = Some(state);
            } else if last && leg_end.is_none() {
                leg_end = out.first_state;
            }
            if last {
                last_out = out;
            }
        }

        let prop = self.pass_propagator(material);
        self.move_to_reference(&prop, &mut state, PassDirection::of_pass(ways - 1, ways).flight());

        let valid = state.is_valid();
        if !valid {
            return Err(PassFailure {
                failure: FitFailure::Numerical,
                last: true,
            });
        }
        let (accepted, tolerated) = (last_out.accepted, last_out.tolerated);
        if !passes_gate(self.config, state.param.qpt(), accepted, tolerated, valid) {
            return Err(PassFailure {
                failure: FitFailure::Gate,
                last: true,
            });
        }

        if deferred {
            for h in &mut candidate.hits[end..] {
                h.set(hit_state::NOT_FIT);
            }
            if let (Some(queue), Some(leg_state)) = (self.loop_queue, leg_end) {
                let outward = candidate.leg_outward.first().copied().unwrap_or(true);
                let kind = ApexKind::leaving(outward);
                queue.push(
                    LoopData {
                        candidate: candidate.id,
                        state: leg_state,
                        kind,
                        first_hit: end,
                        flight: Flight::Along,
                    },
                    self.errors,
                );
            }
        }

        let dedx = truncated_mean(&mut last_out.dedx_rows, self.config.dedx_truncation);
        Ok(FitResult {
            state,
            outer: last_out.outer.map(|(_, p)| p),
            n_accepted: last_out.accepted,
            n_tolerated: last_out.tolerated,
            dedx,
            loose_retry: false,
            deferred,
        })
    }

    /// Fits the legs after the primary one from a queued apex crossing.
    ///
    /// On success the hit counts, χ² and NDF of the fit grow by those of
    /// the new legs; on failure the new legs stay excluded.
    pub fn continue_loop(&self, candidate: &mut TrackCandidate, data: &LoopData) {
        let FitStatus::Fitted(result) = &mut candidate.fit else {
            return;
        };
        let n = candidate.hits.len();
        if data.first_hit >= n {
            return;
        }
        let mut state = data.state;
        let (ndf0, chi0) = (state.ndf, state.chi2);
        let bz = self.propagator.bz_at(&state.param);
        if !continue_looper(&mut state, data.kind, bz, self.loopers, self.config.max_sin_phi) {
            return;
        }
        let plan = PassPlan {
            direction: PassDirection::Forward,
            last: true,
            material: self.config.material && !result.loose_retry,
            record_predictions: false,
            use_predictions: false,
            tube: self.config.tube.enabled,
        };
        let start_leg = candidate.hits.get(data.first_hit).map(|h| h.leg);
        let n_tube = candidate.tube.len();
        let outcome = self.run_pass(
            &mut candidate.hits,
            &candidate.leg_outward,
            data.first_hit..n,
            &mut state,
            &plan,
            &mut [],
            start_leg,
            &mut candidate.tube,
        );
        match outcome {
            Ok(out) => {
                result.n_accepted += out.accepted;
                result.n_tolerated += out.tolerated;
                result.state.chi2 += state.chi2 - chi0;
                result.state.ndf += state.ndf - ndf0;
            }
            Err(_) => {
                candidate.tube.truncate(n_tube);
                for h in &mut candidate.hits[data.first_hit..] {
                    h.set(hit_state::NOT_FIT);
                }
            }
        }
    }

    fn pass_propagator(&self, material: bool) -> Propagator<'a> {
        if material {
            self.propagator
        } else {
            self.propagator.without_material()
        }
    }

    /// q-weighted mean of a duplicate-row group.
    fn group_measurement(
        &self,
        hits: &[ClusterRef],
        members: &[usize],
    ) -> Option<GroupMeasurement> {
        let (mut y, mut z, mut w, mut q) = (0.0, 0.0, 0.0, 0.0);
        let mut edge = false;
        for &i in members {
            let h = hits[i];
            let c = self
                .store
                .cluster(usize::from(h.sector), usize::from(h.row), h.index)?;
            let qc = f64::from(c.q_tot);
            let wc = if qc > 0.0 { qc } else { 1.0 };
            y += wc * f64::from(c.y);
            z += wc * f64::from(c.z);
            w += wc;
            q += qc;
            edge |= h.has(hit_state::EDGE);
        }
        (w > 0.0).then(|| GroupMeasurement {
            y: y / w,
            z: z / w,
            q,
            edge,
        })
    }

    /// Propagation in the frame aligned with the track direction.
    /// Returns the frame and the hit y expressed in it.
    fn retry_propagation(
        prop: &Propagator<'_>,
        state: &mut TrackState,
        x: f64,
        alpha: f64,
        y: f64,
        flight: Flight,
    ) -> Option<(f64, f64)> {
        let aligned = normalize_angle(state.param.alpha + state.param.snp().asin());
        let da = normalize_angle(aligned - alpha);
        let (s, c) = da.sin_cos();
        let xr = x * c + y * s;
        let yr = -x * s + y * c;
        prop.try_propagate(&mut state.param, xr, aligned, flight).ok()?;
        Some((aligned, yr))
    }

    /// Collects the clusters of the row inside the elliptical gate around
    /// the prediction into `found`. Returns their summed charge.
    fn tube_search(
        &self,
        head: ClusterRef,
        members: &[usize],
        hits: &[ClusterRef],
        state: &TrackState,
        buf: &mut Vec<u32>,
        found: &mut Vec<u32>,
    ) -> f64 {
        let tube = &self.config.tube;
        let pred = state.prediction();
        let (sy, sz) = (self.config.sigma_y, self.config.sigma_z);
        let hy = (tube.sigma * (pred.cyy + sy * sy).sqrt()).clamp(tube.min, tube.max);
        let hz = (tube.sigma * (pred.czz + sz * sz).sqrt()).clamp(tube.min, tube.max);
        let cz = pred.z - state.time_offset;
        let sector = usize::from(head.sector);
        let row = usize::from(head.row);

        buf.clear();
        self.store.neighbours(sector, row, pred.y, cz, hy, hz, buf);
        let mut q = 0.0;
        for &index in buf.iter() {
            if members.iter().any(|&m| hits[m].index == index) {
                continue;
            }
            let Some(c) = self.store.cluster(sector, row, index) else {
                continue;
            };
            let dy = (f64::from(c.y) - pred.y) / hy;
            let dz = (f64::from(c.z) - cz) / hz;
            if dy * dy + dz * dz > 1.0 {
                continue;
            }
            found.push(self.store.global_index(sector, row, index));
            q += f64::from(c.q_tot);
        }
        q
    }

    /// Propagates to `ref_x` in the sector frame of the state, rotating to
    /// a neighbour while the track lies outside the sector. Keeps the state
    /// unchanged if no frame works.
    fn move_to_reference(&self, prop: &Propagator<'_>, state: &mut TrackState, flight: Flight) {
        let geo = self.geometry;
        let ref_x = self.config.reference_x;
        let pos = state.param.global_position();
        let mut alpha = geo.sector_alpha(geo.sector_at(pos[1].atan2(pos[0]), pos[2]));
        for _ in 0..=self.config.max_reference_rotations {
            let mut trial = state.param;
            if prop.propagate(&mut trial, ref_x, alpha, flight).is_err() {
                return;
            }
            if trial.y().abs() <= geo.half_width(ref_x) {
                state.param = trial;
                return;
            }
            alpha = normalize_angle(alpha + trial.y().signum() * geo.sector_width());
        }
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn run_pass(
        &self,
        hits: &mut [ClusterRef],
        leg_outward: &[bool],
        range: Range<usize>,
        state: &mut TrackState,
        plan: &PassPlan,
        predictions: &mut Predictions,
        start_leg: Option<u8>,
        tube: &mut Vec<u32>,
    ) -> Result<PassOutput, FitFailure> {
        let geo = self.geometry;
        let cfg = self.config;
        let prop = self.pass_propagator(plan.material);
        let flight = plan.direction.flight();
        let backward = plan.direction == PassDirection::Backward;

        for h in &mut hits[range.clone()] {
            h.clear(hit_state::NOT_FIT);
            if !h.has(hit_state::REJECT_ERROR) {
                h.clear(hit_state::REJECT_DISTANCE);
            }
        }
        let mut order: Vec<usize> = range
            .clone()
            .filter(|&i| !hits[i].has(hit_state::REJECT_ERROR))
            .collect();
        if backward {
            order.reverse();
        }
        let mut groups: Vec<Range<usize>> = Vec::new();
        for (pos, &i) in order.iter().enumerate() {
            let joins = groups.last().is_some_and(|g| {
                let head = hits[order[g.start]];
                head.same_row(&hits[i]) && head.leg == hits[i].leg
            });
            match groups.last_mut() {
                Some(g) if joins => g.end = pos + 1,
                _ => groups.push(pos..pos + 1),
            }
        }

        let mut out = PassOutput::default();
        let mut prev_leg = start_leg;
        let mut prev_sector: Option<u16> = None;
        let mut misses = 0u32;
        let mut streak: Vec<usize> = Vec::new();
        let mut cyy_accepted = state.param.cov.diag(par::Y);
        let mut buf = Vec::new();
        let n_groups = groups.len();

        for (g, span) in groups.iter().enumerate() {
            let members = &order[span.clone()];
            if misses >= cfg.hard_miss {
                for &i in &order[span.start..] {
                    hits[i].set(hit_state::NOT_FIT);
                }
                break;
            }
            let head = hits[members[0]];
            let sector = usize::from(head.sector);
            let row = usize::from(head.row);
            let Some(meas) = self.group_measurement(hits, members) else {
                for &i in members {
                    hits[i].set(hit_state::NOT_FIT);
                }
                continue;
            };

            if let Some(prev) = prev_leg {
                if head.leg != prev {
                    let leaving = leg_outward.get(usize::from(prev)).copied().unwrap_or(true);
                    let kind = ApexKind::leaving(leaving ^ backward);
                    let bz = prop.bz_at(&state.param);
                    if !continue_looper(state, kind, bz, self.loopers, cfg.max_sin_phi) {
                        for &i in members {
                            hits[i].set(hit_state::NOT_FIT);
                        }
                        misses += 1;
                        continue;
                    }
                }
            }
            prev_leg = Some(head.leg);

            if let Some(ps) = prev_sector {
                if ps != head.sector && g + 1 < n_groups {
                    let bz = prop.bz_at(&state.param);
                    let czz = state.param.cov.get(par::Z, par::Z) + cfg.z_jump.variance(bz);
                    state.param.cov.set(par::Z, par::Z, czz);
                }
            }
            prev_sector = Some(head.sector);

            let alpha = geo.sector_alpha(sector);
            let x = geo.row_x(row);
            let propagated = match prop.try_propagate(&mut state.param, x, alpha, flight) {
                Ok(()) => Some((state.param.alpha, meas.y)),
                Err(_) => Self::retry_propagation(&prop, state, x, alpha, meas.y, flight),
            };
            let Some((frame, y)) = propagated else {
                for &i in members {
                    hits[i].set(hit_state::NOT_FIT);
                }
                misses += 1;
                continue;
            };
            let in_sector_frame = (normalize_angle(frame - alpha)).abs() < 1e-9;

            // Groups are visited in both orders; key them by their lowest hit.
            let key = members.iter().copied().min().unwrap_or(members[0]);
            if plan.record_predictions {
                if let Some(slot) = predictions.get_mut(key) {
                    *slot = Some((frame, state.prediction()));
                }
            }
            let tube_q = if plan.tube && in_sector_frame {
                self.tube_search(head, members, hits, state, &mut buf, tube)
            } else {
                0.0
            };

            let interpolation = if plan.use_predictions {
                predictions
                    .get(key)
                    .copied()
                    .flatten()
                    .filter(|(a, _)| normalize_angle(a - frame).abs() < 1e-9)
                    .map(|(_, p)| (p, cfg.interpolation_chi2_cut))
            } else {
                None
            };
            let rejection = RejectionMode {
                chi2_cut: cfg.chi2_cut,
                edge_band: cfg.edge_band,
                interpolation,
            };
            let m = Measurement {
                y,
                z: meas.z + state.time_offset,
                sigma2_y: cfg.sigma_y * cfg.sigma_y,
                sigma2_z: cfg.sigma_z * cfg.sigma_z,
                edge: meas.edge && in_sector_frame,
                half_width: geo.half_width(x),
            };

            match state.update(&m, &rejection, cfg.max_sin_phi) {
                UpdateOutcome::Accepted => {
                    for &i in members {
                        hits[i].clear(hit_state::REJECT_DISTANCE);
                    }
                    out.accepted += members.len() as u32;
                    misses = 0;
                    streak.clear();
                    cyy_accepted = state.param.cov.diag(par::Y);
                    if out.first_state.is_none() {
                        out.first_state = Some(*state);
                    }
                    if plan.last {
                        let t = &state.param;
                        let path = geo.row_pitch(row) * (1.0 + t.tgl() * t.tgl()).sqrt();
                        out.dedx_rows.push((meas.q + tube_q) * t.cos_phi() / path);
                        if head.leg == 0 && out.outer.is_none_or(|(ox, _)| x > ox) {
                            out.outer = Some((x, *t));
                        }
                    }
                }
                // Edge clusters stay on the track but are neither fitted nor
                // counted as misses.
                UpdateOutcome::RejectedEdge => {}
                outcome if outcome.is_rejection() => {
                    for &i in members {
                        hits[i].set(hit_state::REJECT_DISTANCE);
                    }
                    streak.extend_from_slice(members);
                    misses += 1;
                    let grown = state.param.cov.diag(par::Y) > cfg.bad_region_growth * cyy_accepted;
                    if misses >= cfg.soft_miss || (misses >= 2 && grown) {
                        for &i in &streak {
                            hits[i].set(hit_state::REJECT_ERROR);
                        }
                    }
                }
                _ => return Err(FitFailure::Numerical),
            }
        }

        out.tolerated = hits[range]
            .iter()
            .filter(|h| h.has(hit_state::REJECT_DISTANCE) && !h.has(hit_state::REJECT_ERROR))
            .count() as u32;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ErrorFlags;
    use crate::field::UniformField;
    use trackmerge_core::{ClusterStoreBuilder, Covariance, CylindricalGeometry};

    /// Straight track at x = 100 in sector 0 whose line reaches the
    /// reference X outside the sector, in sector 1.
    fn reference_move(max_rotations: u32) -> TrackParam {
        let geo = CylindricalGeometry::default();
        let store = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows()).build().unwrap();
        let field = UniformField::new(0.0);
        let config = RefitConfig {
            max_reference_rotations: max_rotations,
            ..RefitConfig::default()
        };
        let loopers = LooperConfig::default();
        let errors = ErrorFlags::new();
        let prop = Propagator::new(&field, config.max_sin_phi);
        let refitter = Refitter::new(&geo, &store, prop, &config, &loopers, &errors);

        let cov = Covariance::from_diagonal([0.01, 0.01, 1e-4, 1e-4, 0.01]);
        let param = TrackParam::new(100.0, geo.sector_alpha(0), [15.0, 10.0, -0.3, 0.1, 1.0], cov);
        let mut state = TrackState::new(param, 0.0);
        refitter.move_to_reference(&prop, &mut state, Flight::Against);
        state.param
    }

    #[test]
    fn test_reference_move_rotates_to_neighbour() {
        let geo = CylindricalGeometry::default();
        let t = reference_move(3);
        let expected = geo.sector_alpha(0) + geo.sector_width();
        assert!(normalize_angle(t.alpha - expected).abs() < 1e-9);
        assert!((t.x - 83.0).abs() < 1e-9);
        assert!(t.y().abs() <= geo.half_width(83.0));
        // Same line, 7.78 cm below the axis of sector 1.
        assert!((t.y() + 7.78).abs() < 0.05, "y {}", t.y());
    }

    #[test]
    fn test_reference_move_gives_up_after_rotation_limit() {
        let geo = CylindricalGeometry::default();
        let t = reference_move(0);
        assert!(normalize_angle(t.alpha - geo.sector_alpha(0)).abs() < 1e-12);
        assert!((t.x - 100.0).abs() < 1e-12);
        assert!((t.y() - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_pass_directions_end_backward() {
        assert_eq!(PassDirection::of_pass(0, 1), PassDirection::Backward);
        assert_eq!(PassDirection::of_pass(0, 3), PassDirection::Backward);
        assert_eq!(PassDirection::of_pass(1, 3), PassDirection::Forward);
        assert_eq!(PassDirection::of_pass(2, 3), PassDirection::Backward);
        assert_eq!(PassDirection::of_pass(0, 2), PassDirection::Forward);
        assert_eq!(PassDirection::Backward.flight(), Flight::Against);
    }

    #[test]
    fn test_gate() {
        let cfg = RefitConfig::default();
        assert!(passes_gate(&cfg, 1.0, 11, 0, true));
        assert!(!passes_gate(&cfg, 1.0, 10, 0, true));
        assert!(!passes_gate(&cfg, 1.0, 11, 0, false));
        // Too many tolerated outliers relative to accepted hits.
        assert!(!passes_gate(&cfg, 1.0, 8, 5, true));
        assert!(passes_gate(&cfg, 1.0, 12, 6, true));
        assert!(!passes_gate(&cfg, 1.0, 30, 9, true));
        // Low momentum lowers the hit requirement.
        assert!(passes_gate(&cfg, 8.0, 7, 0, true));
    }

    #[test]
    fn test_truncated_mean() {
        let mut v = vec![5.0, 1.0, 100.0, 2.0, 3.0];
        // ceil(5 * 0.6) = 3 lowest values.
        assert!((truncated_mean(&mut v, 0.6) - 2.0).abs() < 1e-12);
        assert!((truncated_mean(&mut [], 0.6)).abs() < 1e-12);
        assert!((truncated_mean(&mut [4.0], 0.1) - 4.0).abs() < 1e-12);
    }
}
