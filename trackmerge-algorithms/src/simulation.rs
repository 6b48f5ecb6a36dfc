//! Synthetic events: helix tracing, row crossings and per-sector segments.
//!
//! The generator stands in for local pattern recognition. Each particle is
//! traced through the field in small exact arcs; every pad-row crossing
//! becomes a cluster, and consecutive crossings in the same sector and
//! radial direction form one segment. Segment parameters are the true
//! state at the first hit, optionally smeared.

use crate::field::{bethe_bloch, curvature, FieldModel, MaterialModel, PION_MASS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use trackmerge_core::{
    cluster_flags, normalize_angle, Cluster, ClusterStoreBuilder, Covariance, Event, Geometry,
    Result, SectorTrack, SegmentHit, TrackParam,
};

/// Initial state of a simulated particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    /// Global production point (cm).
    pub origin: [f64; 3],
    /// Global azimuth of the momentum.
    pub phi: f64,
    pub tgl: f64,
    pub qpt: f64,
}

impl Particle {
    #[must_use]
    pub fn new(origin: [f64; 3], phi: f64, tgl: f64, qpt: f64) -> Self {
        Self {
            origin,
            phi,
            tgl,
            qpt,
        }
    }

    /// Particle from the nominal vertex.
    #[must_use]
    pub fn from_vertex(phi: f64, tgl: f64, qpt: f64) -> Self {
        Self::new([0.0; 3], phi, tgl, qpt)
    }
}

/// Generator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Cluster y resolution (cm).
    pub sigma_y: f64,
    /// Cluster z resolution (cm).
    pub sigma_z: f64,
    /// Transverse tracing step (cm).
    pub step: f64,
    pub q_mean: f64,
    pub q_sigma: f64,
    /// Uniformly distributed clusters not belonging to any particle.
    pub noise_clusters: usize,
    /// Shorter runs of crossings produce clusters but no segment.
    pub min_segment_hits: usize,
    pub seed: u64,
    /// Smear the segment parameters.
    pub smear: bool,
    /// Maximum transverse path per particle (cm).
    pub max_path: f64,
    /// Clusters closer than this to the sector edge get the edge flag (cm).
    pub edge_distance: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sigma_y: 0.08,
            sigma_z: 0.1,
            step: 0.5,
            q_mean: 50.0,
            q_sigma: 10.0,
            noise_clusters: 0,
            min_segment_hits: 3,
            seed: 42,
            smear: true,
            max_path: 1000.0,
            edge_distance: 0.3,
        }
    }
}

impl SimConfig {
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_smear(mut self, smear: bool) -> Self {
        self.smear = smear;
        self
    }

    #[must_use]
    pub fn with_noise(mut self, clusters: usize) -> Self {
        self.noise_clusters = clusters;
        self
    }

    #[must_use]
    pub fn with_max_path(mut self, max_path: f64) -> Self {
        self.max_path = max_path;
        self
    }
}

/// Segments produced by one particle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruthTrack {
    pub particle: usize,
    /// Indices into [`Event::segments`].
    pub segments: Vec<usize>,
    /// Row crossings, including those in segments too short to keep.
    pub n_hits: usize,
}

/// A generated event with its truth.
#[derive(Debug, Clone)]
pub struct SimulatedEvent {
    pub event: Event,
    pub truth: Vec<TruthTrack>,
}

#[derive(Debug, Clone, Copy)]
struct Crossing {
    sector: usize,
    row: usize,
    y: f64,
    z: f64,
    /// Flight direction in the sector frame.
    phi: f64,
    qpt: f64,
    outward: bool,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    x: f64,
    y: f64,
    z: f64,
    phi: f64,
    qpt: f64,
}

fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    if sigma > 0.0 {
        Normal::new(0.0, sigma).map_or(0.0, |n| n.sample(rng))
    } else {
        0.0
    }
}

/// Traces particles and builds events.
pub struct EventGenerator<'a, G: Geometry + ?Sized> {
    geometry: &'a G,
    field: &'a dyn FieldModel,
    material: Option<&'a dyn MaterialModel>,
    config: SimConfig,
}

impl<'a, G: Geometry + ?Sized> EventGenerator<'a, G> {
    #[must_use]
    pub fn new(geometry: &'a G, field: &'a dyn FieldModel, config: SimConfig) -> Self {
        Self {
            geometry,
            field,
            material: None,
            config,
        }
    }

    /// Applies mean energy loss while tracing.
    #[must_use]
    pub fn with_material(mut self, material: &'a dyn MaterialModel) -> Self {
        self.material = Some(material);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn max_radius(&self) -> f64 {
        let geo = self.geometry;
        let n = geo.n_rows();
        if n == 0 {
            return 0.0;
        }
        (geo.row_x(n - 1) + geo.row_pitch(n - 1)) / (0.5 * geo.sector_width()).cos()
    }

    /// Row crossings of the chord from `a` to `b`.
    fn crossings(&self, a: &Point, b: &Point, out: &mut Vec<Crossing>) {
        let geo = self.geometry;
        let s0 = geo.sector_at(a.y.atan2(a.x), a.z);
        let s1 = geo.sector_at(b.y.atan2(b.x), b.z);
        let sectors = if s0 == s1 { vec![s0] } else { vec![s0, s1] };
        for s in sectors {
            let alpha = geo.sector_alpha(s);
            let (sa, ca) = alpha.sin_cos();
            let lx0 = a.x * ca + a.y * sa;
            let lx1 = b.x * ca + b.y * sa;
            if (lx1 - lx0).abs() < 1e-12 {
                continue;
            }
            let (lo, hi) = (lx0.min(lx1), lx0.max(lx1));
            for row in 0..geo.n_rows() {
                let xr = geo.row_x(row);
                if !(xr > lo && xr <= hi) {
                    continue;
                }
                let t = (xr - lx0) / (lx1 - lx0);
                let gx = a.x + t * (b.x - a.x);
                let gy = a.y + t * (b.y - a.y);
                let gz = a.z + t * (b.z - a.z);
                if geo.sector_at(gy.atan2(gx), gz) != s {
                    continue;
                }
                let ly = -gx * sa + gy * ca;
                if ly.abs() > geo.half_width(xr) {
                    continue;
                }
                out.push(Crossing {
                    sector: s,
                    row,
                    y: ly,
                    z: gz,
                    phi: normalize_angle(a.phi + t * (b.phi - a.phi) - alpha),
                    qpt: a.qpt,
                    outward: lx1 > lx0,
                });
            }
        }
    }

    /// All row crossings of one particle in flight order.
    fn trace(&self, particle: &Particle) -> Vec<Crossing> {
        let cfg = &self.config;
        let length = self.geometry.drift_length();
        let r_max = self.max_radius();
        let tgl = particle.tgl;
        let mut p = Point {
            x: particle.origin[0],
            y: particle.origin[1],
            z: particle.origin[2],
            phi: particle.phi,
            qpt: particle.qpt,
        };
        let mut out = Vec::new();
        let mut path = 0.0;
        let ds = cfg.step.max(1e-3);
        while path < cfg.max_path {
            let bz = self.field.bz([p.x, p.y, p.z]);
            let k = curvature(p.qpt, bz);
            let phi1 = p.phi + k * ds;
            let (x1, y1) = if (k * ds).abs() < 1e-9 {
                (p.x + ds * p.phi.cos(), p.y + ds * p.phi.sin())
            } else {
                (
                    p.x + (phi1.sin() - p.phi.sin()) / k,
                    p.y - (phi1.cos() - p.phi.cos()) / k,
                )
            };
            let mut next = Point {
                x: x1,
                y: y1,
                z: p.z + tgl * ds,
                phi: phi1,
                qpt: p.qpt,
            };
            if let Some(material) = self.material {
                let step_length = ds * (1.0 + tgl * tgl).sqrt();
                let budget = material.budget([p.x, p.y, p.z], [x1, y1, next.z], step_length);
                let mom = (1.0 + tgl * tgl).sqrt() / p.qpt.abs();
                let m2 = PION_MASS * PION_MASS;
                let e = (mom * mom + m2).sqrt() - bethe_bloch(mom / PION_MASS) * budget.x_rho;
                if e <= PION_MASS {
                    break;
                }
                let mom1 = (e * e - m2).sqrt();
                next.qpt *= mom / mom1;
            }
            self.crossings(&p, &next, &mut out);
            p = next;
            path += ds;
            if p.z.abs() > length || p.x.hypot(p.y) > r_max {
                break;
            }
        }
        out
    }

    /// Generates one event.
    ///
    /// # Errors
    /// Returns an error if the geometry produces a cluster outside the store
    /// layout.
    pub fn generate(&self, particles: &[Particle]) -> Result<SimulatedEvent> {
        let geo = self.geometry;
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut builder = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        let mut segments = Vec::new();
        let mut truth = Vec::with_capacity(particles.len());

        for (pi, particle) in particles.iter().enumerate() {
            let crossings = self.trace(particle);
            let mut runs: Vec<Vec<Crossing>> = Vec::new();
            for c in &crossings {
                let same_run = runs
                    .last()
                    .and_then(|run| run.last())
                    .is_some_and(|l| l.sector == c.sector && l.outward == c.outward);
                match runs.last_mut() {
                    Some(run) if same_run => run.push(*c),
                    _ => runs.push(vec![*c]),
                }
            }

            let mut ids = Vec::new();
            for run in runs {
                let mut hits = Vec::with_capacity(run.len());
                for c in &run {
                    let y = c.y + gauss(&mut rng, cfg.sigma_y);
                    let z = c.z + gauss(&mut rng, cfg.sigma_z);
                    let q = (cfg.q_mean + gauss(&mut rng, cfg.q_sigma)).max(1.0);
                    let mut cluster = Cluster::new(y as f32, z as f32, q as f32, (0.3 * q) as f32);
                    if geo.half_width(geo.row_x(c.row)) - y.abs() < cfg.edge_distance {
                        cluster = cluster.with_flags(cluster_flags::EDGE);
                    }
                    let index = builder.push(c.sector, c.row, cluster)?;
                    hits.push(SegmentHit::new(u16::try_from(c.row).unwrap_or(u16::MAX), index));
                }
                if run.len() < cfg.min_segment_hits {
                    continue;
                }
                let first = run[0];
                let param = self.segment_param(&first, particle.tgl, &mut rng);
                ids.push(segments.len());
                segments.push(SectorTrack::new(first.sector, param, hits));
            }
            truth.push(TruthTrack {
                particle: pi,
                segments: ids,
                n_hits: crossings.len(),
            });
        }

        for _ in 0..cfg.noise_clusters {
            if geo.n_rows() == 0 {
                break;
            }
            let sector = rng.gen_range(0..geo.n_sectors());
            let row = rng.gen_range(0..geo.n_rows());
            let hw = geo.half_width(geo.row_x(row));
            let y = rng.gen_range(-hw..hw);
            let z = rng.gen_range(0.0..geo.drift_length()) * geo.sector_side(sector).sign();
            let q = (cfg.q_mean + gauss(&mut rng, cfg.q_sigma)).max(1.0);
            let cluster = Cluster::new(y as f32, z as f32, q as f32, (0.3 * q) as f32);
            builder.push(sector, row, cluster)?;
        }

        Ok(SimulatedEvent {
            event: Event::new(builder.build()?, segments),
            truth,
        })
    }

    /// Local estimate at the first crossing in the segment representation.
    fn segment_param(&self, c: &Crossing, tgl: f64, rng: &mut StdRng) -> TrackParam {
        let cfg = &self.config;
        let (snp, tgl, qpt) = if c.phi.cos() >= 0.0 {
            (c.phi.sin(), tgl, c.qpt)
        } else {
            (-c.phi.sin(), -tgl, -c.qpt)
        };
        let (s_angle, s_qpt) = (0.005, 0.02);
        let cov = Covariance::from_diagonal([
            cfg.sigma_y * cfg.sigma_y,
            cfg.sigma_z * cfg.sigma_z,
            s_angle * s_angle,
            s_angle * s_angle,
            (s_qpt * qpt).powi(2) + 1e-6,
        ]);
        let mut p = [c.y, c.z, snp, tgl, qpt];
        if cfg.smear {
            p[0] += gauss(rng, cfg.sigma_y);
            p[1] += gauss(rng, cfg.sigma_z);
            p[2] = (p[2] + gauss(rng, s_angle)).clamp(-0.99, 0.99);
            p[3] += gauss(rng, s_angle);
            p[4] *= 1.0 + gauss(rng, s_qpt);
        }
        TrackParam::new(
            self.geometry.row_x(c.row),
            self.geometry.sector_alpha(c.sector),
            p,
            cov,
        )
    }
}
