//! Binary diagnostic dump of merger input.
//!
//! Layout (little endian):
//!
//! | field | type |
//! |---|---|
//! | magic `TMDP` | 4 bytes |
//! | version | u32 |
//! | geometry tag | u32 |
//! | sectors, rows | u32, u32 |
//! | clusters, segments | u64, u64 |
//!
//! followed by the clusters in (sector, row, index) order
//! (`u16 sector, u16 row, f32 y, f32 z, f32 q_tot, f32 q_max, u8 flags`)
//! and the segments
//! (`u16 sector, f64 x, f64 alpha, 5 x f64 params, 15 x f64 covariance,
//! f64 z_offset, u32 hits, hits x (u16 row, u32 index)`).

use crate::{Error, Result};
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use trackmerge_core::{
    Cluster, ClusterStore, ClusterStoreBuilder, Covariance, Event, Geometry, SectorTrack,
    SegmentHit, TrackParam, N_COV, N_PAR,
};

/// File magic.
pub const DUMP_MAGIC: [u8; 4] = *b"TMDP";
/// Current format version.
pub const DUMP_VERSION: u32 = 1;

/// Magic, four u32 fields and two u64 counts.
const HEADER_LEN: usize = 4 + 4 * 4 + 2 * 8;

/// Fixed-size header of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    pub version: u32,
    pub geometry_tag: u32,
    pub n_sectors: u32,
    pub n_rows: u32,
    pub n_clusters: u64,
    pub n_segments: u64,
}

/// Writes dumps.
pub struct DumpWriter {
    writer: BufWriter<File>,
}

impl DumpWriter {
    /// Creates a new dump file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Writes one event recorded with `geometry`.
    ///
    /// # Errors
    /// Returns an error if writing fails or a count does not fit the format.
    pub fn write_event<G: Geometry + ?Sized>(&mut self, geometry: &G, event: &Event) -> Result<()> {
        let store = &event.clusters;
        let w = &mut self.writer;
        w.write_all(&DUMP_MAGIC)?;
        w.write_all(&DUMP_VERSION.to_le_bytes())?;
        w.write_all(&geometry.tag().to_le_bytes())?;
        w.write_all(&to_u32(store.n_sectors())?.to_le_bytes())?;
        w.write_all(&to_u32(store.n_rows())?.to_le_bytes())?;
        w.write_all(&(store.n_clusters() as u64).to_le_bytes())?;
        w.write_all(&(event.segments.len() as u64).to_le_bytes())?;

        for sector in 0..store.n_sectors() {
            for row in 0..store.n_rows() {
                for c in store.row(sector, row) {
                    w.write_all(&to_u16(sector)?.to_le_bytes())?;
                    w.write_all(&to_u16(row)?.to_le_bytes())?;
                    for v in [c.y, c.z, c.q_tot, c.q_max] {
                        w.write_all(&v.to_le_bytes())?;
                    }
                    w.write_all(&[c.flags])?;
                }
            }
        }

        for seg in &event.segments {
            let t = &seg.param;
            w.write_all(&to_u16(seg.sector)?.to_le_bytes())?;
            w.write_all(&t.x.to_le_bytes())?;
            w.write_all(&t.alpha.to_le_bytes())?;
            for v in t.p.iter().chain(t.cov.0.iter()) {
                w.write_all(&v.to_le_bytes())?;
            }
            w.write_all(&seg.z_offset.to_le_bytes())?;
            w.write_all(&to_u32(seg.hits.len())?.to_le_bytes())?;
            for h in &seg.hits {
                w.write_all(&h.row.to_le_bytes())?;
                w.write_all(&h.index.to_le_bytes())?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

fn to_u16(v: usize) -> Result<u16> {
    u16::try_from(v).map_err(|_| Error::InvalidFormat(format!("{v} does not fit in 16 bits")))
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::InvalidFormat(format!("{v} does not fit in 32 bits")))
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::InvalidFormat(format!("count {v} too large")))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::InvalidFormat(format!("truncated at byte {}", self.pos)))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }
}

/// A memory-mapped dump.
pub struct MappedDump {
    mmap: Mmap,
    header: DumpHeader,
}

impl MappedDump {
    /// Maps a dump and checks its header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped, is not a dump or was
    /// written by another format version.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        let header = Self::parse_header(&mmap[..])?;
        debug!(
            "mapped dump {} ({} bytes, {} clusters, {} segments)",
            path.as_ref().display(),
            mmap.len(),
            header.n_clusters,
            header.n_segments
        );
        Ok(Self { mmap, header })
    }

    fn parse_header(data: &[u8]) -> Result<DumpHeader> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidFormat("file shorter than the dump header".to_string()));
        }
        let mut c = Cursor::new(data);
        if c.take::<4>()? != DUMP_MAGIC {
            return Err(Error::InvalidFormat("missing TMDP magic".to_string()));
        }
        let version = c.u32()?;
        if version != DUMP_VERSION {
            return Err(Error::UnsupportedVersion {
                found: version,
                expected: DUMP_VERSION,
            });
        }
        Ok(DumpHeader {
            version,
            geometry_tag: c.u32()?,
            n_sectors: c.u32()?,
            n_rows: c.u32()?,
            n_clusters: c.u64()?,
            n_segments: c.u64()?,
        })
    }

    #[must_use]
    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Decodes the event for replay with `geometry`.
    ///
    /// # Errors
    /// Returns an error if the dump was recorded with another geometry, is
    /// truncated or references clusters that do not exist.
    pub fn read_event<G: Geometry + ?Sized>(&self, geometry: &G) -> Result<Event> {
        let h = self.header;
        if h.geometry_tag != geometry.tag() {
            return Err(Error::GeometryMismatch {
                found: h.geometry_tag,
                expected: geometry.tag(),
            });
        }
        if h.n_sectors as usize != geometry.n_sectors() || h.n_rows as usize != geometry.n_rows() {
            return Err(Error::InvalidFormat(format!(
                "dump layout {}x{} does not match geometry {}x{}",
                h.n_sectors,
                h.n_rows,
                geometry.n_sectors(),
                geometry.n_rows()
            )));
        }

        let mut c = Cursor::new(&self.mmap[..]);
        c.pos = HEADER_LEN;
        let mut builder = ClusterStoreBuilder::new(geometry.n_sectors(), geometry.n_rows());
        for _ in 0..h.n_clusters {
            let sector = usize::from(c.u16()?);
            let row = usize::from(c.u16()?);
            let (y, z, q_tot, q_max) = (c.f32()?, c.f32()?, c.f32()?, c.f32()?);
            let flags = c.u8()?;
            builder.push(sector, row, Cluster::new(y, z, q_tot, q_max).with_flags(flags))?;
        }

        let mut segments = Vec::with_capacity(to_usize(h.n_segments)?.min(1 << 20));
        for _ in 0..h.n_segments {
            let sector = usize::from(c.u16()?);
            let x = c.f64()?;
            let alpha = c.f64()?;
            let mut p = [0.0; N_PAR];
            for v in &mut p {
                *v = c.f64()?;
            }
            let mut cov = [0.0; N_COV];
            for v in &mut cov {
                *v = c.f64()?;
            }
            let z_offset = c.f64()?;
            let n_hits = c.u32()?;
            let hits = (0..n_hits)
                .map(|_| Ok(SegmentHit::new(c.u16()?, c.u32()?)))
                .collect::<Result<Vec<_>>>()?;
            let param = TrackParam::new(x, alpha, p, Covariance(cov));
            segments.push(SectorTrack::new(sector, param, hits).with_z_offset(z_offset));
        }
        if c.pos != self.mmap.len() {
            return Err(Error::InvalidFormat(format!(
                "{} trailing bytes after the last segment",
                self.mmap.len() - c.pos
            )));
        }

        let event = Event::new(builder.build()?, segments);
        event.validate(geometry)?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use trackmerge_core::{cluster_flags, CylindricalGeometry};

    fn sample(geo: &CylindricalGeometry) -> Event {
        let mut builder = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows());
        let mut hits = Vec::new();
        for row in 3..9 {
            let i = builder
                .push(2, row, Cluster::new(0.25 * row as f32, 7.0, 30.0, 9.0))
                .unwrap();
            hits.push(SegmentHit::new(row as u16, i));
        }
        builder
            .push(20, 0, Cluster::new(-1.0, -5.0, 11.0, 4.0).with_flags(cluster_flags::EDGE))
            .unwrap();
        let cov = Covariance::from_diagonal([0.01, 0.02, 1e-4, 1e-4, 0.05]);
        let p = [0.75, 7.0, 0.05, 0.1, -0.4];
        let param = TrackParam::new(geo.row_x(3), geo.sector_alpha(2), p, cov);
        Event::new(
            builder.build().unwrap(),
            vec![SectorTrack::new(2, param, hits).with_z_offset(1.5)],
        )
    }

    #[test]
    fn test_dump_roundtrip() {
        let geo = CylindricalGeometry::default();
        let event = sample(&geo);
        let file = NamedTempFile::new().unwrap();
        DumpWriter::create(file.path()).unwrap().write_event(&geo, &event).unwrap();

        let dump = MappedDump::open(file.path()).unwrap();
        assert_eq!(dump.header().geometry_tag, CylindricalGeometry::TAG);
        assert_eq!(dump.header().n_clusters, 7);
        assert_eq!(dump.header().n_segments, 1);

        let replay = dump.read_event(&geo).unwrap();
        assert_eq!(replay.segments, event.segments);
        assert_eq!(replay.clusters.row(20, 0), event.clusters.row(20, 0));
        assert!(replay.clusters.row(20, 0)[0].is_edge());
    }

    #[test]
    fn test_empty_event_is_header_only() {
        let geo = CylindricalGeometry::default();
        let store = ClusterStoreBuilder::new(geo.n_sectors(), geo.n_rows()).build().unwrap();
        let file = NamedTempFile::new().unwrap();
        DumpWriter::create(file.path())
            .unwrap()
            .write_event(&geo, &Event::new(store, Vec::new()))
            .unwrap();

        let dump = MappedDump::open(file.path()).unwrap();
        assert_eq!(dump.len(), HEADER_LEN);
        let replay = dump.read_event(&geo).unwrap();
        assert_eq!(replay.clusters.n_clusters(), 0);
        assert!(replay.segments.is_empty());
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0u8; 40]).unwrap();
        assert!(matches!(MappedDump::open(file.path()), Err(Error::InvalidFormat(_))));

        let geo = CylindricalGeometry::default();
        let full = NamedTempFile::new().unwrap();
        DumpWriter::create(full.path()).unwrap().write_event(&geo, &sample(&geo)).unwrap();
        let bytes = std::fs::read(full.path()).unwrap();
        std::fs::write(file.path(), &bytes[..bytes.len() - 3]).unwrap();
        let dump = MappedDump::open(file.path()).unwrap();
        assert!(matches!(dump.read_event(&geo), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_other_version_and_geometry() {
        let geo = CylindricalGeometry::default();
        let file = NamedTempFile::new().unwrap();
        DumpWriter::create(file.path()).unwrap().write_event(&geo, &sample(&geo)).unwrap();
        let mut bytes = std::fs::read(file.path()).unwrap();

        let small = CylindricalGeometry::default().with_rows(10, 85.0, 2.5);
        let dump = MappedDump::open(file.path()).unwrap();
        assert!(matches!(dump.read_event(&small), Err(Error::InvalidFormat(_))));
        drop(dump);

        bytes[4] = 9;
        std::fs::write(file.path(), &bytes).unwrap();
        assert!(matches!(
            MappedDump::open(file.path()),
            Err(Error::UnsupportedVersion { found: 9, .. })
        ));
    }
}
