//! trackmerge-io: File formats for trackmerge.
//!
//! This crate provides JSON event and configuration files, the binary
//! diagnostic dump (read through a memory map via memmap2) and writers
//! for merged tracks.
//!

pub mod dump;
mod error;
pub mod json;
mod writer;

pub use dump::{DumpHeader, DumpWriter, MappedDump, DUMP_MAGIC, DUMP_VERSION};
pub use error::{Error, Result};
pub use json::{read_config, read_event, write_config, write_event, ClusterRecord, EventFile};
pub use writer::TrackWriter;
