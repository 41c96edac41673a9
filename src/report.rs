//! Run report files: the mismatches list and the What's New summary.
//!
//! Both are plain text, written incrementally during the run and flushed at
//! batch boundaries so a crashed run still leaves a usable partial report.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::SyncError;
use crate::model::Item;

/// Insert thousands separators into a decimal count.
pub fn commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Flat list of every missing file's full publisher path, one per line, with
/// a grand-total trailer.
pub struct MismatchReport {
    out: BufWriter<File>,
}

impl MismatchReport {
    pub fn create(path: &Path, header: &str) -> Result<MismatchReport, SyncError> {
        let file = File::create(path).map_err(|e| {
            SyncError::Config(format!(
                "cannot create mismatches file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("writing to mismatches file {}", path.display());
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", header)?;
        Ok(MismatchReport { out })
    }

    pub fn record(&mut self, full_path: &str) -> Result<(), SyncError> {
        writeln!(self.out, "{}", full_path)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SyncError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn finish(mut self, total_items: u64, total_bytes: u64) -> Result<(), SyncError> {
        writeln!(self.out, "----------------------------------------------------")?;
        writeln!(self.out, "Grand total items: {}", total_items)?;
        writeln!(
            self.out,
            "Grand total size : {} bytes, {} GB",
            commas(total_bytes),
            total_bytes / (1024 * 1024 * 1024)
        )?;
        self.out.flush()?;
        Ok(())
    }
}

/// Human-oriented What's New summary: one section per library, one entry per
/// new title (consecutive items under the same title collapse into one line).
pub struct WhatsNewReport {
    out: BufWriter<File>,
    current_library: String,
    current_entry: String,
    library_total: u64,
}

impl WhatsNewReport {
    pub fn create(path: &Path) -> Result<WhatsNewReport, SyncError> {
        let file = File::create(path).map_err(|e| {
            SyncError::Config(format!(
                "cannot create what's new file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("writing to what's new file {}", path.display());
        let mut out = BufWriter::new(file);
        writeln!(out, "What's New")?;
        Ok(WhatsNewReport {
            out,
            current_library: String::new(),
            current_entry: String::new(),
            library_total: 0,
        })
    }

    /// Record one missing item (directories included).
    pub fn record(&mut self, item: &Item, sep: char) -> Result<(), SyncError> {
        if item.library != self.current_library {
            if !self.current_library.is_empty() {
                self.close_section()?;
            }
            self.current_library = item.library.clone();
            writeln!(self.out)?;
            writeln!(self.out, "{}", self.current_library)?;
            writeln!(self.out, "{}", "=".repeat(self.current_library.len()))?;
        }
        let entry = whats_new_entry(item, sep);
        if !entry.eq_ignore_ascii_case(&self.current_entry) {
            writeln!(self.out, "    {}", entry)?;
            self.current_entry = entry;
            self.library_total += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SyncError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), SyncError> {
        if !self.current_library.is_empty() {
            self.close_section()?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn close_section(&mut self) -> Result<(), SyncError> {
        writeln!(self.out, "--------------------------------")?;
        writeln!(
            self.out,
            "Total for {} = {}",
            self.current_library, self.library_total
        )?;
        writeln!(self.out, "================================")?;
        self.library_total = 0;
        Ok(())
    }
}

/// The What's New entry for an item is its title directory: the last segment
/// of the parent path, or the leaf name itself for a top-level item.
fn whats_new_entry(item: &Item, sep: char) -> String {
    let parent = item.parent_path(sep);
    if parent.is_empty() {
        return item.name(sep).to_string();
    }
    match parent.rfind(sep) {
        Some(i) => parent[i + 1..].to_string(),
        None => parent.to_string(),
    }
}

/// The optional report pair a run carries. Recording applies each file's own
/// rule: every missing item lands in What's New, only missing files (not
/// directories) land in the mismatches list.
#[derive(Default)]
pub struct Reports {
    pub mismatch: Option<MismatchReport>,
    pub whats_new: Option<WhatsNewReport>,
}

impl Reports {
    pub fn open(
        mismatch_path: Option<&Path>,
        whats_new_path: Option<&Path>,
        header: &str,
    ) -> Result<Reports, SyncError> {
        Ok(Reports {
            mismatch: match mismatch_path {
                Some(p) => Some(MismatchReport::create(p, header)?),
                None => None,
            },
            whats_new: match whats_new_path {
                Some(p) => Some(WhatsNewReport::create(p)?),
                None => None,
            },
        })
    }

    pub fn record_missing(&mut self, item: &Item, sep: char) -> Result<(), SyncError> {
        if let Some(wn) = &mut self.whats_new {
            wn.record(item, sep)?;
        }
        if !item.directory {
            if let Some(mm) = &mut self.mismatch {
                mm.record(&item.full_path)?;
            }
        }
        Ok(())
    }

    /// Flushed at batch boundaries so partial output survives a failed run.
    pub fn flush(&mut self) -> Result<(), SyncError> {
        if let Some(mm) = &mut self.mismatch {
            mm.flush()?;
        }
        if let Some(wn) = &mut self.whats_new {
            wn.flush()?;
        }
        Ok(())
    }

    pub fn finish(self, total_items: u64, total_bytes: u64) -> Result<(), SyncError> {
        if let Some(mm) = self.mismatch {
            mm.finish(total_items, total_bytes)?;
        }
        if let Some(wn) = self.whats_new {
            wn.finish()?;
        }
        Ok(())
    }
}
