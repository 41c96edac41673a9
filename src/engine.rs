//! The munge run loop: diff each library pair, allocate space for each batch,
//! copy, and report.

use std::path::PathBuf;

use tracing::{error, info};

use crate::differ::{Batch, DiffSink, Differ};
use crate::error::SyncError;
use crate::model::{translate_separators, Item, Repository};
use crate::report::{commas, Reports};
use crate::storage::{select_destination, Allocation, TargetData};
use crate::transfer::Endpoint;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Count and log what would be copied without allocating or copying.
    pub dry_run: bool,
    pub mismatches: Option<PathBuf>,
    pub whats_new: Option<PathBuf>,
}

/// Grand totals for one run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub copies: u64,
    pub errors: u64,
    pub ignored: u64,
    pub items: u64,
    pub bytes: u64,
}

struct CopySink<'a, E: Endpoint> {
    subscriber: &'a Repository,
    targets: Option<&'a TargetData>,
    endpoint: &'a mut E,
    reports: &'a mut Reports,
    dry_run: bool,
    stats: &'a mut RunStats,
    pub_sep: char,
}

impl<E: Endpoint> CopySink<'_, E> {
    fn destination(&self, location: &str, item: &Item) -> String {
        let sep = self.endpoint.separator();
        format!(
            "{}{}{}",
            location,
            sep,
            translate_separators(&item.item_path, self.pub_sep, sep)
        )
    }
}

impl<E: Endpoint> DiffSink for CopySink<'_, E> {
    fn missing(&mut self, item: &Item) -> Result<(), SyncError> {
        self.reports.record_missing(item, self.pub_sep)
    }

    fn batch(&mut self, batch: Batch) -> Result<(), SyncError> {
        self.stats.items += batch.items.len() as u64;
        self.stats.bytes += batch.total_size;
        // Batch boundary: make partial reports durable.
        self.reports.flush()?;

        if self.dry_run {
            for item in &batch.items {
                self.stats.copies += 1;
                info!("    would copy #{} {}", self.stats.copies, item.full_path);
            }
            return Ok(());
        }

        let allocation = select_destination(
            self.subscriber,
            self.targets,
            &batch.items[0],
            &batch.library,
            batch.total_size,
            self.pub_sep,
            self.endpoint,
        )?;
        let location = match allocation {
            Allocation::Location(path) => path,
            Allocation::NoTarget => {
                error!(
                    "no target library match found for publisher library {}",
                    batch.library
                );
                return Ok(());
            }
            Allocation::NoSpace => {
                error!(
                    "no space on any target for {} '{}' of {} MB",
                    batch.library,
                    batch.group,
                    batch.total_size / (1024 * 1024)
                );
                return Ok(());
            }
        };

        for item in &batch.items {
            let to = self.destination(&location, item);
            self.stats.copies += 1;
            info!(
                "  > copying #{} {} to {}",
                self.stats.copies, item.full_path, to
            );
            match self.endpoint.copy(item, &to) {
                Ok(()) => {}
                Err(SyncError::Transfer { .. }) => {
                    // Already logged at the point of failure. Copies count
                    // attempts, so the failed one stays in the total.
                    self.stats.errors += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Replicate the publisher's content to the subscriber. Iterates the
/// subscriber's libraries in order; each must exist on the publisher.
/// Libraries with sources but no items are scanned on demand, on both
/// sides: a remote subscriber arrives pre-populated via `collection`, a
/// local one is walked here so existing content is not re-copied.
pub fn munge<E: Endpoint>(
    publisher: &mut Repository,
    subscriber: &mut Repository,
    targets: Option<&TargetData>,
    endpoint: &mut E,
    options: &RunOptions,
) -> Result<RunStats, SyncError> {
    let header = format!(
        "Munging {} to {}",
        publisher.description, subscriber.description
    );
    info!("{}", header);
    if options.dry_run {
        info!("dry run, no copies will be made");
    }

    // Resolve and scan up front so the diff pass can hold the publisher
    // immutably.
    let mut plan: Vec<(String, bool)> = Vec::new();
    for sub_lib in &subscriber.libraries {
        let name = sub_lib.name.clone();
        match publisher.get_library(&name) {
            Some(lib) => {
                let needs_scan = lib.items.is_empty() && !lib.sources.is_empty();
                plan.push((name, needs_scan));
            }
            None => {
                return Err(SyncError::Config(format!(
                    "subscriber library {} not found in publisher",
                    name
                )));
            }
        }
    }
    for (name, needs_scan) in &plan {
        if *needs_scan {
            publisher.scan(name)?;
        }
    }
    // Subscriber sizes stay unset; the diff only needs item identity.
    let sub_scan: Vec<String> = subscriber
        .libraries
        .iter()
        .filter(|l| l.items.is_empty() && !l.sources.is_empty())
        .map(|l| l.name.clone())
        .collect();
    for name in &sub_scan {
        subscriber.scan(name)?;
    }
    let subscriber: &Repository = subscriber;

    let mut stats = RunStats::default();
    let mut reports = Reports::open(
        options.mismatches.as_deref(),
        options.whats_new.as_deref(),
        &header,
    )?;
    let mut differ = Differ::new();
    let pub_sep = publisher.flavor.separator();

    for (name, scanned) in &plan {
        info!("munge library {}", name);
        let mut sink = CopySink {
            subscriber,
            targets,
            endpoint: &mut *endpoint,
            reports: &mut reports,
            dry_run: options.dry_run,
            stats: &mut stats,
            pub_sep,
        };
        differ.diff_library(publisher, name, subscriber, *scanned, &mut sink)?;
    }

    stats.ignored = differ.ignored.len() as u64;
    reports.finish(stats.items, stats.bytes)?;

    info!("-----------------------------------------------------");
    if !differ.ignored.is_empty() {
        info!("ignored {} files:", differ.ignored.len());
        for path in &differ.ignored {
            info!("    {}", path);
        }
    }
    info!("grand total copies: {}", stats.copies);
    info!("grand total errors: {}", stats.errors);
    info!("grand total ignored: {}", stats.ignored);
    info!("grand total items: {}", stats.items);
    info!(
        "grand total size : {} bytes, {} GB",
        commas(stats.bytes),
        stats.bytes / (1024 * 1024 * 1024)
    );
    Ok(stats)
}
