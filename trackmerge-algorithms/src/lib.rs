//! trackmerge-algorithms: Merging and refitting of per-sector track segments.
//!
//! The merge of one event runs in stages:
//! - **Border matching** - segments near azimuthal sector borders and the
//!   central electrode are compared in a common frame
//! - **Looper matching** - segments meeting at a radial apex of a curling
//!   particle are paired
//! - **Fusion** - union-find over all links builds track candidates
//! - **Refit** - multi-pass Kalman filter with outlier rejection, looper
//!   continuation and the quality gate
//! - **Output** - filtering, bounded output arrays and cluster attachment
//!
//! [`TrackMerger`] drives all stages; [`simulation`] produces synthetic
//! input events.

pub mod arena;
pub mod border;
pub mod dispatch;
pub mod field;
pub mod fuse;
pub mod loopers;
pub mod output;
mod pipeline;
pub mod propagator;
pub mod refit;
pub mod simulation;
pub mod track_state;

pub use arena::{AppendArena, AttachmentArena, ErrorCode, ErrorFlags, ErrorReport};
pub use border::{BorderKind, BorderMatch, BorderMatcher, BorderStats, BorderTrack, MatchFailure};
pub use dispatch::{Dispatcher, Lane, Rayon, Sequential};
pub use field::{FieldModel, MaterialModel, NoMaterial, UniformField, UniformMaterial};
pub use fuse::{fuse_segments, TrackCandidate};
pub use loopers::{ApexKind, LoopData, LooperMatch, LooperMatcher};
pub use output::{OutputArenas, OutputFormatter};
pub use pipeline::{MergeOutput, MergeStats, TrackMerger};
pub use propagator::{Flight, PropagationError, Propagator};
pub use refit::{FitFailure, FitResult, FitStatus, PassDirection, Refitter};
pub use simulation::{EventGenerator, Particle, SimConfig, SimulatedEvent, TruthTrack};
pub use track_state::{Measurement, TrackState, UpdateOutcome};
