//! JSON event and configuration files.
//!
//! An event file stores the geometry, a flat cluster list and the
//! segments. Clusters are listed in (sector, row, index) order so that
//! rebuilding the store reproduces the in-row indices the segments refer to.

use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use trackmerge_core::{
    Cluster, ClusterStore, ClusterStoreBuilder, CylindricalGeometry, Event, Geometry, MergerConfig,
    SectorTrack,
};

/// One cluster with its location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub sector: usize,
    pub row: usize,
    #[serde(flatten)]
    pub cluster: Cluster,
}

/// Serialized form of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFile {
    pub geometry: CylindricalGeometry,
    pub clusters: Vec<ClusterRecord>,
    pub segments: Vec<SectorTrack>,
}

impl EventFile {
    /// Flattens an event.
    #[must_use]
    pub fn from_event(geometry: &CylindricalGeometry, event: &Event) -> Self {
        let store = &event.clusters;
        let mut clusters = Vec::with_capacity(store.n_clusters());
        for sector in 0..store.n_sectors() {
            for row in 0..store.n_rows() {
                clusters.extend(store.row(sector, row).iter().map(|&cluster| ClusterRecord {
                    sector,
                    row,
                    cluster,
                }));
            }
        }
        Self {
            geometry: geometry.clone(),
            clusters,
            segments: event.segments.clone(),
        }
    }

    /// Rebuilds the event and checks it against the stored geometry.
    ///
    /// # Errors
    /// Returns an error for an invalid geometry, clusters outside it or
    /// segments referencing missing clusters.
    pub fn into_event(self) -> Result<(CylindricalGeometry, Event)> {
        self.geometry.validate()?;
        let geo = self.geometry;
        let mut builder = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        let mut last = (0, 0);
        for rec in &self.clusters {
            if (rec.sector, rec.row) < last {
                return Err(Error::InvalidFormat(format!(
                    "clusters not ordered by sector and row at ({}, {})",
                    rec.sector, rec.row
                )));
            }
            last = (rec.sector, rec.row);
            builder.push(rec.sector, rec.row, rec.cluster)?;
        }
        let event = Event::new(builder.build()?, self.segments);
        event.validate(&geo)?;
        Ok((geo, event))
    }
}

/// Reads an event file.
///
/// # Errors
/// Returns an error if the file cannot be read or does not describe a
/// consistent event.
pub fn read_event<P: AsRef<Path>>(path: P) -> Result<(CylindricalGeometry, Event)> {
    let file = File::open(path.as_ref())?;
    let parsed: EventFile = serde_json::from_reader(BufReader::new(file))?;
    debug!(
        "read {} clusters and {} segments from {}",
        parsed.clusters.len(),
        parsed.segments.len(),
        path.as_ref().display()
    );
    parsed.into_event()
}

/// Writes an event file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_event<P: AsRef<Path>>(
    path: P,
    geometry: &CylindricalGeometry,
    event: &Event,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &EventFile::from_event(geometry, event))?;
    writer.flush()?;
    Ok(())
}

/// Reads a merger configuration. Missing fields take their defaults.
///
/// # Errors
/// Returns an error if the file cannot be parsed or the values are invalid.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<MergerConfig> {
    let file = File::open(path)?;
    let config: MergerConfig = serde_json::from_reader(BufReader::new(file))?;
    config.validate()?;
    Ok(config)
}

/// Writes a merger configuration as pretty-printed JSON.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_config<P: AsRef<Path>>(path: P, config: &MergerConfig) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, config)?;
    writer.flush()?;
    Ok(())
}
