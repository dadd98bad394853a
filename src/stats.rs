// --- File: stats.rs ---
// Ordered per-iteration statistics. Row 0 is the host-computed initial state;
// rows 1..=iters arrive from device read-backs, possibly out of band, and the
// whole series is persisted once after a successful run.
use crate::error::{Error, Result};
use crate::kernels::StatsRecord;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct StatsRecorder {
    rows: Vec<StatsRecord>,
    filled: Vec<bool>,
}

impl StatsRecorder {
    pub fn new(iters: u32, initial: StatsRecord) -> Self {
        let len = iters as usize + 1;
        let mut rows = vec![StatsRecord::default(); len];
        let mut filled = vec![false; len];
        rows[0] = initial;
        filled[0] = true;
        Self { rows, filled }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn initial(&self) -> StatsRecord {
        self.rows[0]
    }

    // Store the grass count read back for `iteration`. Agent counts are not
    // computed on the device, so they carry over from row 0.
    pub fn record_grass(&mut self, iteration: u32, grass: u32) -> Result<()> {
        let index = iteration as usize;
        if index == 0 || index >= self.rows.len() {
            return Err(Error::sync(
                "stats series",
                format!(
                    "iteration {} outside 1..={}",
                    iteration,
                    self.rows.len() - 1
                ),
            ));
        }
        if self.filled[index] {
            return Err(Error::sync(
                "stats series",
                format!("iteration {iteration} recorded twice"),
            ));
        }
        let initial = self.rows[0];
        self.rows[index] = StatsRecord { grass, ..initial };
        self.filled[index] = true;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.filled.iter().all(|&filled| filled)
    }

    // First iteration whose row has not arrived yet.
    pub fn first_missing(&self) -> Option<u32> {
        self.filled
            .iter()
            .position(|&filled| !filled)
            .map(|index| index as u32)
    }

    pub fn rows(&self) -> &[StatsRecord] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<StatsRecord> {
        self.rows
    }

    // One line per row: sheep, wolves, grass; tab separated, no header.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for row in &self.rows {
            writeln!(out, "{}\t{}\t{}", row.sheep, row.wolves, row.grass)?;
        }
        Ok(())
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(missing) = self.first_missing() {
            return Err(Error::sync(
                "stats series",
                format!("row {missing} never arrived; refusing to write a partial file"),
            ));
        }
        let io_err = |e| Error::io(path.display().to_string(), e);
        let file = std::fs::File::create(path).map_err(io_err)?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out).map_err(io_err)?;
        out.flush().map_err(io_err)?;
        log::info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}

// --- End of File: stats.rs ---
