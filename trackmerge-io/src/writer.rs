//! File writers for merged tracks.

use crate::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use trackmerge_algorithms::MergeOutput;

/// Writer for merge results.
///
/// Writes the merged tracks to files in various formats.
pub struct TrackWriter {
    writer: BufWriter<File>,
}

impl TrackWriter {
    /// Creates a new file writer.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        Ok(Self { writer })
    }

    /// Writes one line per track as CSV.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_tracks_csv(&mut self, output: &MergeOutput) -> Result<()> {
        writeln!(
            self.writer,
            "candidate,x,alpha,y,z,snp,tgl,qpt,chi2,ndf,dedx,n_clusters,n_legs,flags,time_before,time_after"
        )?;

        for t in &output.tracks {
            let p = &t.param;
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                t.candidate,
                p.x,
                p.alpha,
                p.y(),
                p.z(),
                p.snp(),
                p.tgl(),
                p.qpt(),
                t.chi2,
                t.ndf,
                t.dedx,
                t.n_clusters,
                t.n_legs,
                t.flags,
                t.time_window.before,
                t.time_window.after
            )?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Writes tracks and their cluster references as binary data.
    ///
    /// Format: u64 track count, then per track: u32 (candidate) + 7 f64
    /// (x, alpha, y, z, snp, tgl, qpt) + f64 (chi2) + i32 (ndf) + u8 (flags)
    /// + u32 (cluster count) followed by that many u32 global cluster indices.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_tracks_binary(&mut self, output: &MergeOutput) -> Result<()> {
        self.writer.write_all(&(output.tracks.len() as u64).to_le_bytes())?;
        for t in &output.tracks {
            let p = &t.param;
            self.writer.write_all(&t.candidate.to_le_bytes())?;
            for v in [p.x, p.alpha, p.y(), p.z(), p.snp(), p.tgl(), p.qpt(), t.chi2] {
                self.writer.write_all(&v.to_le_bytes())?;
            }
            self.writer.write_all(&t.ndf.to_le_bytes())?;
            self.writer.write_all(&[t.flags])?;
            self.writer.write_all(&t.n_clusters.to_le_bytes())?;
            for c in output.track_clusters(t) {
                self.writer.write_all(&c.cluster.to_le_bytes())?;
            }
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Writes the run counters and raised error codes as JSON.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_summary_json(&mut self, output: &MergeOutput) -> Result<()> {
        let summary = serde_json::json!({
            "stats": output.stats,
            "errors": output.errors,
        });
        serde_json::to_writer_pretty(&mut self.writer, &summary)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
