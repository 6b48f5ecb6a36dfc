//! Quality filtering and serialization of fitted candidates.

use crate::arena::{AppendArena, AttachmentArena, ErrorCode, ErrorFlags};
use crate::fuse::TrackCandidate;
use trackmerge_core::{
    attach, hit_state, track_flags, ClusterStore, Geometry, OutputClusterRef, OutputConfig,
    OutputTrack, Side, TimeWindow,
};

/// Shared output arrays filled by the formatter lanes.
#[derive(Debug)]
pub struct OutputArenas {
    pub tracks: AppendArena<OutputTrack>,
    pub clusters: AppendArena<OutputClusterRef>,
}

impl OutputArenas {
    #[must_use]
    pub fn new(track_capacity: usize, cluster_capacity: usize) -> Self {
        Self {
            tracks: AppendArena::with_capacity(track_capacity, ErrorCode::TrackOverflow),
            clusters: AppendArena::with_capacity(cluster_capacity, ErrorCode::ClusterOverflow),
        }
    }
}

/// Drift-time window from the longitudinal extent of a track.
///
/// `before` is how much earlier the particle could have been produced
/// before the farthest hit reaches the readout; `after` how much later
/// before the nearest hit crosses the central electrode.
#[must_use]
pub fn time_window<G: Geometry + ?Sized>(
    geometry: &G,
    z_min: f64,
    z_max: f64,
    symmetric: bool,
) -> TimeWindow {
    let length = geometry.drift_length();
    let v = geometry.drift_velocity();
    let limit = length / v;
    let mut before = (length - z_max) / v;
    let mut after = z_min / v;
    if symmetric {
        let m = before.min(after);
        before = m;
        after = m;
    }
    TimeWindow {
        before: before.clamp(0.0, limit),
        after: after.clamp(0.0, limit),
    }
}

/// Per-candidate output kernel.
pub struct OutputFormatter<'a, G: Geometry + ?Sized, S: ClusterStore + ?Sized> {
    geometry: &'a G,
    store: &'a S,
    config: &'a OutputConfig,
    arenas: &'a OutputArenas,
    attachment: &'a AttachmentArena,
    errors: &'a ErrorFlags,
}

impl<'a, G: Geometry + ?Sized, S: ClusterStore + ?Sized> OutputFormatter<'a, G, S> {
    #[must_use]
    pub fn new(
        geometry: &'a G,
        store: &'a S,
        config: &'a OutputConfig,
        arenas: &'a OutputArenas,
        attachment: &'a AttachmentArena,
        errors: &'a ErrorFlags,
    ) -> Self {
        Self {
            geometry,
            store,
            config,
            arenas,
            attachment,
            errors,
        }
    }

    /// Writes a fitted candidate to the output arrays. Returns its track
    /// slot, or `None` if the candidate is filtered out or does not fit.
    pub fn format(&self, candidate: &TrackCandidate) -> Option<usize> {
        let result = candidate.fit.result()?;
        let hits: Vec<_> = candidate
            .hits
            .iter()
            .filter(|h| !h.has(hit_state::DROPPED) && (!self.config.primary_leg_only || h.leg == 0))
            .collect();
        let n = u32::try_from(hits.len()).ok()?;
        if n < self.config.min_clusters {
            return None;
        }

        let param = result.state.param;
        let threshold = if param.qpt() > 0.0 {
            self.config.min_dedx_pos
        } else {
            self.config.min_dedx_neg
        };
        if param.tgl().abs() <= self.config.near_vertical_tgl && result.dedx < threshold {
            return None;
        }

        let mut flags = track_flags::OK | (candidate.flags & track_flags::CE);
        let n_legs = hits.iter().map(|h| h.leg).max().map_or(0, |l| l.saturating_add(1));
        if n_legs > 1 {
            flags |= track_flags::LOOPER;
        }
        if self.geometry.sector_side(usize::from(hits[0].sector)) == Side::C {
            flags |= track_flags::SIDE_C;
        }

        let (mut z_min, mut z_max) = (f64::INFINITY, 0.0_f64);
        for h in &hits {
            let (sector, row) = (usize::from(h.sector), usize::from(h.row));
            if let Some(c) = self.store.cluster(sector, row, h.index) {
                let z = f64::from(c.z).abs();
                z_min = z_min.min(z);
                z_max = z_max.max(z);
            }
        }
        if !z_min.is_finite() {
            z_min = 0.0;
        }
        let window = time_window(self.geometry, z_min, z_max, self.config.symmetric_time_window);

        // Both arrays are claimed so that each overflow is reported.
        let slot = self.arenas.tracks.claim(self.errors);
        let range = self.arenas.clusters.claim_range(hits.len(), self.errors);
        let (Some(slot), Some(range)) = (slot, range) else {
            return None;
        };

        let id = candidate.id;
        for (pos, h) in range.clone().zip(&hits) {
            let (sector, row) = (usize::from(h.sector), usize::from(h.row));
            let cluster = self.store.global_index(sector, row, h.index);
            self.arenas.clusters.set(
                pos,
                OutputClusterRef {
                    sector: h.sector,
                    row: h.row,
                    cluster,
                    leg: h.leg,
                    state: h.state,
                },
            );
            let mut priority = attach::GOOD_TRACK | attach::FIT;
            if h.leg == 0 {
                priority |= attach::PRIMARY_LEG;
            }
            self.attachment
                .claim(cluster as usize, attach::encode(priority, id), self.errors);
        }
        for &cluster in &candidate.tube {
            self.attachment
                .claim(cluster as usize, attach::encode(attach::TUBE, id), self.errors);
        }

        self.arenas.tracks.set(
            slot,
            OutputTrack {
                candidate: id,
                param,
                outer: if self.config.outer_param { result.outer } else { None },
                flags,
                chi2: result.state.chi2,
                ndf: result.state.ndf,
                dedx: result.dedx,
                n_accepted: result.n_accepted,
                n_tolerated: result.n_tolerated,
                n_legs,
                time_window: window,
                cluster_offset: u32::try_from(range.start).unwrap_or(u32::MAX),
                n_clusters: n,
            },
        );
        Some(slot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::refit::{FitResult, FitStatus};
    use crate::track_state::TrackState;
    use trackmerge_core::{
        Cluster, ClusterRef, ClusterStoreBuilder, Covariance, CylindricalGeometry,
        SectorClusterStore, TrackParam,
    };

    /// One cluster on each of rows 0..48 of sector 0.
    pub(crate) fn row_store(geo: &CylindricalGeometry) -> SectorClusterStore {
        let mut builder = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        for row in 0..48u16 {
            let cluster = Cluster::new(0.0, 20.0 + f32::from(row), 50.0, 15.0);
            builder.push(0, usize::from(row), cluster).unwrap();
        }
        builder.build().unwrap()
    }

    /// Fitted candidate with `legs` legs of `per_leg` consecutive rows each.
    pub(crate) fn fitted(
        id: u32,
        legs: u8,
        per_leg: u16,
        qpt: f64,
        tgl: f64,
        dedx: f64,
    ) -> TrackCandidate {
        let mut hits = Vec::new();
        for leg in 0..legs {
            for r in 0..per_leg {
                hits.push(ClusterRef::new(0, u16::from(leg) * per_leg + r, 0, leg));
            }
        }
        let n = hits.len() as u32;
        let cov = Covariance::from_diagonal([0.01, 0.01, 1e-4, 1e-4, 1e-3]);
        let param = TrackParam::new(83.0, 0.0, [0.0, 20.0, 0.0, tgl, qpt], cov);
        TrackCandidate {
            id,
            segments: vec![id],
            hits,
            leg_outward: (0..legs).map(|l| l % 2 == 0).collect(),
            seed_first: param,
            seed_last: param,
            z_offset: 0.0,
            flags: 0,
            fit: FitStatus::Fitted(FitResult {
                state: TrackState::new(param, 0.0),
                outer: None,
                n_accepted: n,
                n_tolerated: 0,
                dedx,
                loose_retry: false,
                deferred: false,
            }),
            tube: Vec::new(),
        }
    }

    fn format(
        config: &OutputConfig,
        candidate: &TrackCandidate,
    ) -> (Option<OutputTrack>, Vec<u32>) {
        let geo = CylindricalGeometry::default();
        let store = row_store(&geo);
        let arenas = OutputArenas::new(4, 128);
        let attachment = AttachmentArena::new(store.n_clusters());
        let errors = ErrorFlags::new();
        let formatter = OutputFormatter::new(&geo, &store, config, &arenas, &attachment, &errors);
        let slot = formatter.format(candidate);
        let track = slot.and_then(|s| arenas.tracks.get(s).cloned());
        (track, attachment.into_vec())
    }

    #[test]
    fn test_time_window() {
        let geo = CylindricalGeometry::default();
        let v = geo.drift_velocity();
        let w = time_window(&geo, 20.0, 100.0, false);
        assert!((w.before - 150.0 / v).abs() < 1e-9);
        assert!((w.after - 20.0 / v).abs() < 1e-9);

        let sym = time_window(&geo, 20.0, 100.0, true);
        assert!((sym.before - sym.after).abs() < 1e-12);
        assert!((sym.after - 20.0 / v).abs() < 1e-9);

        // Hits beyond the drift length clamp to zero.
        let out = time_window(&geo, 0.0, 300.0, false);
        assert!(out.before.abs() < 1e-12);
        assert!(out.after <= geo.drift_length() / v);
    }

    #[test]
    fn test_min_clusters_counts_kept_hits() {
        let config = OutputConfig::default();
        let (track, words) = format(&config, &fitted(0, 1, 12, 1.0, 0.2, 0.0));
        assert_eq!(track.map(|t| t.n_clusters), Some(12));
        assert_eq!(words.iter().filter(|&&w| w != 0).count(), 12);

        let strict = config.clone().with_min_clusters(13);
        let (track, _) = format(&strict, &fitted(0, 1, 12, 1.0, 0.2, 0.0));
        assert!(track.is_none());

        // Dropped hits do not count towards the minimum.
        let mut candidate = fitted(0, 1, 12, 1.0, 0.2, 0.0);
        for h in &mut candidate.hits[..3] {
            h.set(hit_state::REJECT_ERROR);
        }
        let (track, words) = format(&config, &candidate);
        assert!(track.is_none());
        assert!(words.iter().all(|&w| w == 0));
    }

    #[test]
    fn test_dedx_thresholds_by_charge_sign() {
        let config = OutputConfig::default().with_dedx_thresholds(10.0, 20.0);
        assert!(format(&config, &fitted(0, 1, 12, 1.0, 0.2, 15.0)).0.is_some());
        assert!(format(&config, &fitted(0, 1, 12, -1.0, 0.2, 15.0)).0.is_none());
        assert!(format(&config, &fitted(0, 1, 12, 1.0, 0.2, 5.0)).0.is_none());
        // Near-vertical tracks are exempt.
        assert!(format(&config, &fitted(0, 1, 12, -1.0, 2.0, 15.0)).0.is_some());
        assert!(format(&config, &fitted(0, 1, 12, 1.0, -2.0, 0.0)).0.is_some());
    }

    #[test]
    fn test_primary_leg_only() {
        let candidate = fitted(0, 2, 12, 1.0, 0.2, 0.0);
        let (track, words) = format(&OutputConfig::default(), &candidate);
        let track = track.unwrap();
        assert_eq!(track.n_clusters, 24);
        assert_eq!(track.n_legs, 2);
        assert!(track.flags & track_flags::LOOPER != 0);
        assert_eq!(words.iter().filter(|&&w| w != 0).count(), 24);

        let config = OutputConfig::default().with_primary_leg_only(true);
        let (track, words) = format(&config, &candidate);
        let track = track.unwrap();
        assert_eq!(track.n_clusters, 12);
        assert_eq!(track.n_legs, 1);
        assert!(track.flags & track_flags::LOOPER == 0);
        let attached: Vec<usize> = (0..words.len()).filter(|&i| words[i] != 0).collect();
        assert_eq!(attached, (0..12).collect::<Vec<_>>());
        assert!(attached
            .iter()
            .all(|&i| attach::flags(words[i]) & attach::PRIMARY_LEG != 0));
    }

    #[test]
    fn test_tube_clusters_claimed_with_low_priority() {
        let geo = CylindricalGeometry::default();
        let store = row_store(&geo);
        let extra = store.global_index(0, 40, 0) as usize;
        let mut candidate = fitted(3, 1, 12, 1.0, 0.2, 0.0);
        // One tube cluster is also a fitted hit of the track.
        candidate.tube = vec![extra as u32, store.global_index(0, 5, 0)];
        let (track, words) = format(&OutputConfig::default(), &candidate);
        assert!(track.is_some());
        assert_eq!(words[extra], attach::encode(attach::TUBE, 3));
        let fit = attach::flags(words[store.global_index(0, 5, 0) as usize]);
        assert_eq!(fit, attach::GOOD_TRACK | attach::FIT | attach::PRIMARY_LEG);
    }
}
