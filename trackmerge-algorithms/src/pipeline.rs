//! Staged merge run: matching, fusion, refit, loop stage, output, compaction.
//!
//! The per-candidate stages run through a [`Dispatcher`]; everything else is
//! single threaded. Capacity overflows never abort a run, they are reported
//! in [`MergeOutput::errors`].

use crate::arena::{AppendArena, AttachmentArena, ErrorCode, ErrorFlags, ErrorReport};
use crate::border::BorderMatcher;
use crate::dispatch::Dispatcher;
use crate::field::{FieldModel, MaterialModel, UniformField, UniformMaterial};
use crate::fuse::{fuse_segments, TrackCandidate};
use crate::loopers::{LoopData, LooperMatcher};
use crate::output::{OutputArenas, OutputFormatter};
use crate::propagator::Propagator;
use crate::refit::{FitFailure, FitStatus, Refitter};
use log::{debug, info, warn};
use trackmerge_core::{
    attach, ClusterStore, Error, Event, Geometry, MergerConfig, OutputClusterRef, OutputTrack,
    Result, SectorTrack,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Counters of one merge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MergeStats {
    pub segments: usize,
    pub border_records: usize,
    pub border_matches: usize,
    pub ce_matches: usize,
    pub looper_matches: usize,
    pub candidates: usize,
    pub fitted: usize,
    pub gate_failures: usize,
    pub numerical_failures: usize,
    pub loose_retries: usize,
    pub deferred_loops: usize,
    pub output_tracks: usize,
}

/// Result of a merge run.
#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    /// Tracks ordered by side-signed z.
    pub tracks: Vec<OutputTrack>,
    /// Cluster references; each track owns a contiguous range.
    pub clusters: Vec<OutputClusterRef>,
    /// One word per input cluster: priority flags and output track index,
    /// or 0 if unattached.
    pub attachment: Vec<u32>,
    pub errors: ErrorReport,
    pub stats: MergeStats,
}

impl MergeOutput {
    /// Cluster references of one track.
    #[must_use]
    pub fn track_clusters(&self, track: &OutputTrack) -> &[OutputClusterRef] {
        let start = track.cluster_offset as usize;
        let end = start + track.n_clusters as usize;
        self.clusters.get(start..end).unwrap_or(&[])
    }
}

/// Cross-sector merger for one detector geometry.
pub struct TrackMerger<G: Geometry> {
    geometry: G,
    config: MergerConfig,
    field: Box<dyn FieldModel>,
    material: Box<dyn MaterialModel>,
}

impl<G: Geometry> TrackMerger<G> {
    /// Creates a merger with a uniform field of `config.bz` and gas material.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(geometry: G, config: MergerConfig) -> Result<Self> {
        config.validate()?;
        let field = Box::new(UniformField::new(config.bz));
        Ok(Self {
            geometry,
            config,
            field,
            material: Box::new(UniformMaterial::default()),
        })
    }

    #[must_use]
    pub fn with_field(mut self, field: Box<dyn FieldModel>) -> Self {
        self.field = field;
        self
    }

    #[must_use]
    pub fn with_material(mut self, material: Box<dyn MaterialModel>) -> Self {
        self.material = material;
        self
    }

    #[must_use]
    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    #[must_use]
    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    fn field_propagator(&self) -> Propagator<'_> {
        Propagator::new(self.field.as_ref(), self.config.refit.max_sin_phi)
    }

    fn check_input<S: ClusterStore + ?Sized>(
        &self,
        store: &S,
        segments: &[SectorTrack],
    ) -> Result<()> {
        let geo = &self.geometry;
        if store.n_sectors() != geo.n_sectors() || store.n_rows() != geo.n_rows() {
            return Err(Error::Config(format!(
                "cluster store layout {}x{} does not match geometry {}x{}",
                store.n_sectors(),
                store.n_rows(),
                geo.n_sectors(),
                geo.n_rows()
            )));
        }
        for (id, segment) in segments.iter().enumerate() {
            segment.validate(id, store)?;
        }
        Ok(())
    }

    /// Matches segments across borders and loopers and fuses them.
    ///
    /// # Errors
    /// Returns an error for inconsistent input.
    pub fn build_candidates<S: ClusterStore + ?Sized>(
        &self,
        store: &S,
        segments: &[SectorTrack],
    ) -> Result<(Vec<TrackCandidate>, MergeStats)> {
        self.check_input(store, segments)?;
        let prop = self.field_propagator();

        let matcher = BorderMatcher::new(&self.geometry, &self.config.matching, prop);
        let (border, border_stats) = matcher.match_event(store, segments);
        let loopers = if self.config.loopers.match_loopers {
            LooperMatcher::new(&self.geometry, &self.config.loopers, prop)
                .match_segments(store, segments)
        } else {
            Vec::new()
        };
        let candidates = fuse_segments(&self.geometry, store, segments, &border, &loopers)?;

        let stats = MergeStats {
            segments: segments.len(),
            border_records: border_stats.records,
            border_matches: border_stats.azimuthal,
            ce_matches: border_stats.central_electrode,
            looper_matches: loopers.len(),
            candidates: candidates.len(),
            ..MergeStats::default()
        };
        debug!(
            "{} segments -> {} candidates ({} border, {} CE, {} looper links)",
            stats.segments,
            stats.candidates,
            stats.border_matches,
            stats.ce_matches,
            stats.looper_matches
        );
        Ok((candidates, stats))
    }

    /// Runs the full merge on one event.
    ///
    /// # Errors
    /// Returns an error for inconsistent input. Capacity overflows are not
    /// errors; see [`MergeOutput::errors`].
    pub fn run<S, D>(
        &self,
        store: &S,
        segments: &[SectorTrack],
        dispatcher: &D,
    ) -> Result<MergeOutput>
    where
        S: ClusterStore + ?Sized,
        D: Dispatcher,
    {
        let (mut candidates, mut stats) = self.build_candidates(store, segments)?;
        let cfg = &self.config;
        let capacity = cfg.capacity;

        let errors = ErrorFlags::new();
        let mut attachment = AttachmentArena::new(store.n_clusters());
        let mut loop_queue = AppendArena::with_capacity(
            capacity.loop_data.unwrap_or(candidates.len()),
            ErrorCode::LoopOverflow,
        );

        let field_prop = self.field_propagator();
        let fit_prop = if cfg.refit.material {
            field_prop.with_material(self.material.as_ref())
        } else {
            field_prop
        };

        {
            let refitter = Refitter::new(
                &self.geometry,
                store,
                fit_prop,
                &cfg.refit,
                &cfg.loopers,
                &errors,
            )
            .with_loop_queue(&loop_queue);
            dispatcher.dispatch(&mut candidates, |_, c| refitter.refit(c));
        }

        let queued = loop_queue.take_all();
        stats.deferred_loops = queued.len();
        if !queued.is_empty() {
            let mut pending: Vec<Option<LoopData>> = vec![None; candidates.len()];
            for (_, data) in queued {
                if let Some(slot) = pending.get_mut(data.candidate as usize) {
                    *slot = Some(data);
                }
            }
            let refitter = Refitter::new(
                &self.geometry,
                store,
                fit_prop,
                &cfg.refit,
                &cfg.loopers,
                &errors,
            );
            let mut work: Vec<(&mut TrackCandidate, Option<LoopData>)> =
                candidates.iter_mut().zip(pending).collect();
            dispatcher.dispatch(&mut work, |_, (c, data)| {
                if let Some(data) = data {
                    refitter.continue_loop(c, data);
                }
            });
        }

        for c in &candidates {
            match c.fit {
                FitStatus::Fitted(r) => {
                    stats.fitted += 1;
                    stats.loose_retries += usize::from(r.loose_retry);
                }
                FitStatus::Failed(FitFailure::Gate) => stats.gate_failures += 1,
                FitStatus::Failed(FitFailure::Numerical) => stats.numerical_failures += 1,
                FitStatus::Failed(FitFailure::NoHits) | FitStatus::Pending => {}
            }
        }

        let total_hits: usize = candidates.iter().map(|c| c.hits.len()).sum();
        let mut arenas = OutputArenas::new(
            capacity.tracks.unwrap_or(candidates.len()),
            capacity.clusters.unwrap_or(total_hits),
        );
        {
            let formatter = OutputFormatter::new(
                &self.geometry,
                store,
                &cfg.output,
                &arenas,
                &attachment,
                &errors,
            );
            dispatcher.dispatch(&mut candidates, |_, c| {
                formatter.format(c);
            });
        }

        let (tracks, clusters) = compact(&mut arenas, &mut attachment, candidates.len());
        stats.output_tracks = tracks.len();
        let report = errors.report();
        for (code, count) in &report.entries {
            warn!("{}: {} writes dropped", code.name(), count);
        }
        info!(
            "merged {} segments into {} tracks ({} fitted, {} gate, {} numerical failures)",
            stats.segments,
            stats.output_tracks,
            stats.fitted,
            stats.gate_failures,
            stats.numerical_failures
        );

        Ok(MergeOutput {
            tracks,
            clusters,
            attachment: attachment.into_vec(),
            errors: report,
            stats,
        })
    }

    /// Runs the merge on an [`Event`].
    ///
    /// # Errors
    /// See [`Self::run`].
    pub fn run_event<D: Dispatcher>(&self, event: &Event, dispatcher: &D) -> Result<MergeOutput> {
        self.run(&event.clusters, &event.segments, dispatcher)
    }
}

/// Sorts the written tracks, packs their clusters and rewrites attachment
/// owners from candidate ids to output indices.
fn compact(
    arenas: &mut OutputArenas,
    attachment: &mut AttachmentArena,
    n_candidates: usize,
) -> (Vec<OutputTrack>, Vec<OutputClusterRef>) {
    let mut slots: Vec<Option<OutputClusterRef>> = vec![None; arenas.clusters.capacity()];
    for (i, c) in arenas.clusters.take_all() {
        slots[i] = Some(c);
    }
    let mut tracks: Vec<OutputTrack> = arenas
        .tracks
        .take_all()
        .into_iter()
        .map(|(_, t)| t)
        .collect();
    tracks.sort_by(|a, b| {
        (a.side_sign() * a.param.z())
            .total_cmp(&(b.side_sign() * b.param.z()))
            .then(a.candidate.cmp(&b.candidate))
    });

    let mut clusters = Vec::new();
    let mut index_of = vec![None; n_candidates];
    for (i, t) in tracks.iter_mut().enumerate() {
        let start = t.cluster_offset as usize;
        let end = start + t.n_clusters as usize;
        t.cluster_offset = u32::try_from(clusters.len()).unwrap_or(u32::MAX);
        clusters.extend(slots.get(start..end).unwrap_or(&[]).iter().flatten().copied());
        if let Some(slot) = index_of.get_mut(t.candidate as usize) {
            *slot = u32::try_from(i).ok();
        }
    }

    attachment.remap(|word| {
        if word == 0 {
            return 0;
        }
        match index_of.get(attach::owner(word) as usize).copied().flatten() {
            Some(i) => attach::encode(attach::flags(word), i),
            None => 0,
        }
    });
    (tracks, clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::{fitted, row_store};
    use trackmerge_core::{CylindricalGeometry, OutputConfig};

    #[test]
    fn test_compaction_keeps_tube_claim_of_written_track() {
        let geo = CylindricalGeometry::default();
        let store = row_store(&geo);
        let shared = store.global_index(0, 40, 0);
        let config = OutputConfig::default();
        let errors = ErrorFlags::new();
        let mut attachment = AttachmentArena::new(store.n_clusters());
        let mut arenas = OutputArenas::new(4, 64);

        let mut written = fitted(0, 1, 12, 1.0, 0.2, 0.0);
        written.tube.push(shared);
        // Same tube cluster, but too short to be written.
        let mut dropped = fitted(1, 1, 5, 1.0, 0.2, 0.0);
        dropped.tube.push(shared);
        {
            let formatter =
                OutputFormatter::new(&geo, &store, &config, &arenas, &attachment, &errors);
            assert!(formatter.format(&written).is_some());
            assert!(formatter.format(&dropped).is_none());
        }

        let (tracks, clusters) = compact(&mut arenas, &mut attachment, 2);
        assert_eq!(tracks.len(), 1);
        assert_eq!(clusters.len(), 12);
        assert_eq!(attachment.load(shared as usize), attach::encode(attach::TUBE, 0));
        assert!(errors.report().is_empty());
    }
}
