//! trackmerge-core: Core types for cross-sector track merging.
//!
//! This crate provides the detector geometry interface, the cluster store,
//! helix parameters with packed covariance, per-sector segments, merged
//! track records and the merger configuration.
//!

pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod geometry;
pub mod merged;
pub mod param;
pub mod segment;
pub mod spatial;

pub use cluster::{cluster_flags, Cluster, ClusterStore, ClusterStoreBuilder, SectorClusterStore};
pub use config::{
    CapacityConfig, CovLimits, LooperConfig, LooperMode, MatchingConfig, MergerConfig, OutputConfig,
    RefitConfig, TubeConfig, ZJump,
};
pub use error::{Error, Result};
pub use event::Event;
pub use geometry::{normalize_angle, CylindricalGeometry, Geometry, Side};
pub use merged::{
    attach, hit_state, track_flags, ClusterRef, OutputClusterRef, OutputTrack, TimeWindow,
};
pub use param::{cov_index, par, Covariance, TrackParam, N_COV, N_PAR};
pub use segment::{SectorTrack, SegmentHit};
pub use spatial::SpatialGrid;
