//! Per-step metrics log
//!
//! CSV with columns `step,epoch,batch,loss,loss_min,loss_mean,best,elapsed_s`,
//! plus `c0..cN-1` (every candidate's loss) when candidate columns are on.
//! The file is opened in append mode so a resumed run keeps its history.

use crate::error::{Error, Result};
use crate::loss::LossReport;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const BASE_COLUMNS: &str = "step,epoch,batch,loss,loss_min,loss_mean,best,elapsed_s";

/// Appends one CSV row per training step
pub struct MetricsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    candidate_columns: Option<usize>,
}

impl MetricsWriter {
    /// Open (or create) `path`; the header is written only to an empty file
    pub fn open(path: &Path, candidate_columns: Option<usize>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        let is_empty = file.metadata().map_err(|e| Error::io(path, e))?.len() == 0;

        let mut metrics = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            candidate_columns,
        };
        if is_empty {
            let header = metrics.header();
            metrics.write_line(&header)?;
        }
        Ok(metrics)
    }

    pub fn header(&self) -> String {
        let mut header = BASE_COLUMNS.to_string();
        for i in 0..self.candidate_columns.unwrap_or(0) {
            header.push_str(&format!(",c{}", i));
        }
        header
    }

    /// Append one row and flush it
    pub fn write_step(
        &mut self,
        step: usize,
        epoch: usize,
        batch: usize,
        report: &LossReport,
        elapsed_s: f64,
    ) -> Result<()> {
        let mut line = format!(
            "{},{},{},{},{},{},{},{:.3}",
            step,
            epoch,
            batch,
            report.loss,
            report.loss_min,
            report.loss_mean,
            report.best_candidate,
            elapsed_s
        );
        if let Some(n) = self.candidate_columns {
            for i in 0..n {
                match report.candidate_losses.get(i) {
                    Some(l) => line.push_str(&format!(",{}", l)),
                    None => line.push(','),
                }
            }
        }
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line).map_err(|e| Error::io(&self.path, e))?;
        self.writer.flush().map_err(|e| Error::io(&self.path, e))
    }
}
