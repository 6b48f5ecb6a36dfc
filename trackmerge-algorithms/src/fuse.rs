//! Fusion of matched segments into track candidates.
//!
//! Matches are edges of a graph over segments; each connected component
//! becomes one candidate whose hit list is the concatenation of its
//! segments in flight order.

use crate::border::BorderMatch;
use crate::loopers::LooperMatch;
use crate::refit::FitStatus;
use std::collections::HashSet;
use trackmerge_core::{
    attach, hit_state, track_flags, ClusterRef, ClusterStore, Error, Geometry, Result, SectorTrack,
    Side, TrackParam,
};

/// Minimum |tanλ| for ordering segments along z.
const MIN_ORDERING_TGL: f64 = 0.05;

/// Union-Find data structure for connected component detection.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, x: usize, y: usize) {
        let px = self.find(x);
        let py = self.find(y);

        if px == py {
            return;
        }

        match self.rank[px].cmp(&self.rank[py]) {
            std::cmp::Ordering::Less => self.parent[px] = py,
            std::cmp::Ordering::Greater => self.parent[py] = px,
            std::cmp::Ordering::Equal => {
                self.parent[py] = px;
                self.rank[px] += 1;
            }
        }
    }
}

/// A group of segments believed to belong to one particle.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCandidate {
    /// Owner id used in attachment words.
    pub id: u32,
    /// Segment indices in flight order.
    pub segments: Vec<u32>,
    /// Fused hit list in flight order.
    pub hits: Vec<ClusterRef>,
    /// Radial direction of every leg.
    pub leg_outward: Vec<bool>,
    /// Local estimate of the first segment.
    pub seed_first: TrackParam,
    /// Local estimate of the last segment.
    pub seed_last: TrackParam,
    pub z_offset: f64,
    /// [`track_flags`] known before the fit.
    pub flags: u8,
    pub fit: FitStatus,
    /// Global indices of the clusters found by the tube search of the
    /// final pass. Claimed only if the track is written.
    pub tube: Vec<u32>,
}

impl TrackCandidate {
    #[must_use]
    pub fn n_legs(&self) -> usize {
        self.leg_outward.len()
    }

    /// Index of the first hit of `leg`, if the leg exists.
    #[must_use]
    pub fn leg_start(&self, leg: u8) -> Option<usize> {
        self.hits.iter().position(|h| h.leg == leg)
    }
}

/// Mean cluster z and hit-weighted physical dip of a segment.
fn segment_key<S: ClusterStore + ?Sized>(segment: &SectorTrack, store: &S) -> (f64, f64) {
    let mut sum = 0.0;
    let mut n = 0.0;
    for h in &segment.hits {
        if let Some(c) = store.cluster(segment.sector, usize::from(h.row), h.index) {
            sum += f64::from(c.z);
            n += 1.0;
        }
    }
    let mean_z = if n > 0.0 { sum / n } else { 0.0 };
    (mean_z + segment.z_offset, segment.physical_tgl())
}

/// Orders the segments of one component along the flight direction.
fn order_component<S: ClusterStore + ?Sized>(
    members: &mut [usize],
    segments: &[SectorTrack],
    store: &S,
) {
    if members.len() < 2 {
        return;
    }
    let keys: Vec<(usize, f64, f64)> = members
        .iter()
        .map(|&i| {
            let (z, tgl) = segment_key(&segments[i], store);
            (i, z, tgl)
        })
        .collect();
    let weights: f64 = members.iter().map(|&i| segments[i].hits.len() as f64).sum();
    let mean_tgl = keys
        .iter()
        .map(|(i, _, tgl)| tgl * segments[*i].hits.len() as f64)
        .sum::<f64>()
        / weights.max(1.0);

    if mean_tgl.abs() > MIN_ORDERING_TGL {
        let sign = mean_tgl.signum();
        let mut sorted = keys;
        sorted.sort_by(|a, b| (a.1 * sign).total_cmp(&(b.1 * sign)).then(a.0.cmp(&b.0)));
        for (slot, (i, _, _)) in members.iter_mut().zip(sorted) {
            *slot = i;
        }
    } else {
        members.sort_by_key(|&i| (segments[i].inner_row(), i));
    }
}

/// Builds one candidate per connected component of the match graph.
///
/// Components are numbered by their smallest segment index, so the
/// numbering depends only on the inputs.
///
/// # Errors
/// Returns an error if there are more candidates than attachment words can
/// encode or a candidate has more legs than a hit can number.
pub fn fuse_segments<G, S>(
    geometry: &G,
    store: &S,
    segments: &[SectorTrack],
    border: &[BorderMatch],
    loopers: &[LooperMatch],
) -> Result<Vec<TrackCandidate>>
where
    G: Geometry + ?Sized,
    S: ClusterStore + ?Sized,
{
    let n = segments.len();
    let mut uf = UnionFind::new(n);
    let edges = border
        .iter()
        .map(|m| (m.a, m.b))
        .chain(loopers.iter().map(|m| (m.before, m.after)));
    for (a, b) in edges {
        let (a, b) = (a as usize, b as usize);
        if a < n && b < n {
            uf.union(a, b);
        }
    }

    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root = vec![usize::MAX; n];
    for i in 0..n {
        let root = uf.find(i);
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = components.len();
            components.push(Vec::new());
        }
        components[slot_of_root[root]].push(i);
    }

    if components.len() > attach::MAX_ID as usize {
        return Err(Error::Config(format!(
            "{} candidates exceed the attachment id range",
            components.len()
        )));
    }

    let mut candidates = Vec::with_capacity(components.len());
    for (id, mut members) in components.into_iter().enumerate() {
        order_component(&mut members, segments, store);

        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        let mut leg_outward: Vec<bool> = Vec::new();
        let mut sides = (false, false);
        for &i in &members {
            let seg = &segments[i];
            let outward = seg.is_outward();
            if leg_outward.last() != Some(&outward) {
                leg_outward.push(outward);
            }
            let Ok(leg) = u8::try_from(leg_outward.len() - 1) else {
                return Err(Error::Config(format!(
                    "candidate {id} has more than {} legs",
                    usize::from(u8::MAX) + 1
                )));
            };
            match geometry.sector_side(seg.sector) {
                Side::A => sides.0 = true,
                Side::C => sides.1 = true,
            }
            let sector = u16::try_from(seg.sector).unwrap_or(u16::MAX);
            for h in &seg.hits {
                if !seen.insert((seg.sector, h.row, h.index)) {
                    continue;
                }
                let mut r = ClusterRef::new(sector, h.row, h.index, leg);
                if store
                    .cluster(seg.sector, usize::from(h.row), h.index)
                    .is_some_and(|c| c.is_edge())
                {
                    r.set(hit_state::EDGE);
                }
                hits.push(r);
            }
        }

        let first = &segments[members[0]];
        let last = &segments[members[members.len() - 1]];
        let flags = if sides.0 && sides.1 { track_flags::CE } else { 0 };
        candidates.push(TrackCandidate {
            id: u32::try_from(id).unwrap_or(attach::MAX_ID),
            segments: members.iter().map(|&i| u32::try_from(i).unwrap_or(u32::MAX)).collect(),
            hits,
            leg_outward,
            seed_first: first.param,
            seed_last: last.param,
            z_offset: first.z_offset,
            flags,
            fit: FitStatus::Pending,
            tube: Vec::new(),
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::border::BorderKind;
    use crate::loopers::ApexKind;
    use trackmerge_core::{
        Cluster, ClusterStoreBuilder, Covariance, CylindricalGeometry, SectorClusterStore,
        SegmentHit,
    };

    fn setup() -> (CylindricalGeometry, SectorClusterStore, Vec<SectorTrack>) {
        let geo = CylindricalGeometry::default();
        let mut b = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        let mut segments = Vec::new();
        let param = TrackParam::new(90.0, 0.0, [0.0, 0.0, 0.0, 0.0, 1.0], Covariance::default());
        // Segment 0: rows 0..5 sector 0, segment 1: rows 5..10 sector 1,
        // segment 2: isolated in sector 5.
        for (sector, rows) in [(0usize, 0u16..5), (1, 5..10), (5, 0..4)] {
            let hits = rows
                .map(|r| {
                    let cluster = Cluster::new(0.0, 1.0, 10.0, 5.0);
                    let idx = b.push(sector, usize::from(r), cluster).unwrap();
                    SegmentHit::new(r, idx)
                })
                .collect();
            segments.push(SectorTrack::new(sector, param, hits));
        }
        (geo, b.build().unwrap(), segments)
    }

    #[test]
    fn test_union_find_components() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 4);
        uf.union(1, 4);
        assert_eq!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(0), uf.find(2));
    }

    #[test]
    fn test_fuse_border_match() {
        let (geo, store, segments) = setup();
        let matches = [BorderMatch {
            a: 0,
            b: 1,
            chi2: 1.0,
            kind: BorderKind::Azimuthal,
        }];
        let cands = fuse_segments(&geo, &store, &segments, &matches, &[]).unwrap();
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].segments, vec![0, 1]);
        assert_eq!(cands[0].hits.len(), 10);
        assert!(cands[0].hits.iter().all(|h| h.leg == 0));
        assert!(cands[0].hits.windows(2).all(|w| w[0].row < w[1].row));
        assert_eq!(cands[1].segments, vec![2]);
        assert_eq!(cands[1].id, 1);
    }

    #[test]
    fn test_fuse_counts_legs() {
        let (geo, store, mut segments) = setup();
        segments[1].hits.reverse();
        let loopers = [LooperMatch {
            before: 0,
            after: 1,
            kind: ApexKind::Max,
            cost: 0.1,
        }];
        let cands = fuse_segments(&geo, &store, &segments, &[], &loopers).unwrap();
        let c = &cands[0];
        assert_eq!(c.leg_outward, vec![true, false]);
        assert_eq!(c.leg_start(1), Some(5));
        let legs: Vec<u8> = c.hits.iter().map(|h| h.leg).collect();
        assert!(legs.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
    }

    /// Chain of `n` two-hit segments in sector 0 with alternating direction.
    fn zigzag(n: usize) -> (CylindricalGeometry, SectorClusterStore, Vec<SectorTrack>) {
        let geo = CylindricalGeometry::default();
        let mut b = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        let param = TrackParam::new(90.0, 0.0, [0.0, 0.0, 0.0, 0.0, 1.0], Covariance::default());
        let segments = (0..n)
            .map(|i| {
                let mut hits: Vec<SegmentHit> = (0..2u16)
                    .map(|r| {
                        let cluster = Cluster::new(0.0, 1.0, 10.0, 5.0);
                        let idx = b.push(0, usize::from(r), cluster).unwrap();
                        SegmentHit::new(r, idx)
                    })
                    .collect();
                if i % 2 == 1 {
                    hits.reverse();
                }
                SectorTrack::new(0, param, hits)
            })
            .collect();
        (geo, b.build().unwrap(), segments)
    }

    fn chain(n: usize) -> Vec<LooperMatch> {
        (1..n)
            .map(|i| LooperMatch {
                before: u32::try_from(i - 1).unwrap(),
                after: u32::try_from(i).unwrap(),
                kind: ApexKind::Max,
                cost: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_leg_counter_range() {
        let (geo, store, segments) = zigzag(256);
        let cands = fuse_segments(&geo, &store, &segments, &[], &chain(256)).unwrap();
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].n_legs(), 256);
        assert_eq!(cands[0].hits.last().unwrap().leg, u8::MAX);
        let legs: Vec<u8> = cands[0].hits.iter().map(|h| h.leg).collect();
        assert!(legs.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));

        let (geo, store, segments) = zigzag(257);
        assert!(matches!(
            fuse_segments(&geo, &store, &segments, &[], &chain(257)),
            Err(Error::Config(_))
        ));
    }
}
