//! Diff and grouping: turn a publisher/subscriber library pair into an
//! ordered stream of copy batches.
//!
//! Publisher items are walked in their scanned order, which is load-bearing:
//! the what's-new report groups by that order and batch boundaries fall where
//! the parent directory changes.

use std::fs;

use tracing::{error, info};

use crate::error::SyncError;
use crate::model::{Item, Repository};

/// A run of missing items sharing one parent directory, processed as a unit.
/// Never spans two libraries.
#[derive(Debug, Clone)]
pub struct Batch {
    pub library: String,
    /// Parent-path grouping key, in the publisher's flavor.
    pub group: String,
    pub items: Vec<Item>,
    /// Sum of the items' sizes in bytes.
    pub total_size: u64,
}

/// Receives diff results as they are produced. `missing` fires for every
/// missing item including directories (reporting); `batch` fires for each
/// closed batch of missing files (allocation + transfer).
pub trait DiffSink {
    fn missing(&mut self, item: &Item) -> Result<(), SyncError>;
    fn batch(&mut self, batch: Batch) -> Result<(), SyncError>;
}

/// Diff engine state carried across libraries: the open batch plus running
/// counters for reporting.
pub struct Differ {
    current_group: String,
    last_group: String,
    open_library: String,
    open: Vec<Item>,
    open_size: u64,
    /// Full source paths of every ignored item, in encounter order.
    pub ignored: Vec<String>,
}

impl Default for Differ {
    fn default() -> Self {
        Self::new()
    }
}

impl Differ {
    pub fn new() -> Differ {
        Differ {
            current_group: String::new(),
            last_group: String::new(),
            open_library: String::new(),
            open: Vec::new(),
            open_size: 0,
            ignored: Vec::new(),
        }
    }

    /// Diff one library pair, handing closed batches to `sink` in order.
    ///
    /// `scanned` marks a publisher library populated by a scan this run: item
    /// sizes are unknown and each accepted file is stat'd lazily; a stat
    /// failure logs and counts the item as zero bytes rather than aborting.
    pub fn diff_library(
        &mut self,
        publisher: &Repository,
        library: &str,
        subscriber: &Repository,
        scanned: bool,
        sink: &mut dyn DiffSink,
    ) -> Result<(), SyncError> {
        let pub_lib = publisher
            .get_library(library)
            .ok_or_else(|| SyncError::Config(format!("publisher library {} not found", library)))?;
        let sep = publisher.flavor.separator();

        for item in &pub_lib.items {
            if publisher.matches_ignore(item.name(sep)) {
                info!("  ! ignoring '{}'", item.item_path);
                self.ignored.push(item.full_path.clone());
                continue;
            }
            if subscriber.has_item(library, &item.item_path) {
                info!("  = subscriber {} has {}", library, item.item_path);
                continue;
            }

            sink.missing(item)?;
            info!("  + subscriber {} missing {}", library, item.item_path);

            // Directories feed reporting but are never queued for copy; files
            // create their own parent directories on demand.
            if item.directory {
                continue;
            }

            let group = item.parent_path(sep).to_string();
            if !group.eq_ignore_ascii_case(&self.current_group) {
                self.flush(sink)?;
                info!(
                    "switching groups from '{}' to '{}'",
                    self.last_group, group
                );
                self.current_group = group;
            }

            let mut accepted = item.clone();
            if scanned {
                let size = match fs::metadata(&accepted.full_path) {
                    Ok(m) => m.len(),
                    Err(e) => {
                        error!(
                            "exception '{}' getting size of item {}",
                            e, accepted.full_path
                        );
                        0
                    }
                };
                accepted.size = Some(size);
            }
            self.open_size += accepted.size.unwrap_or(0);
            if self.open.is_empty() {
                self.open_library = library.to_string();
            }
            self.open.push(accepted);
        }

        // End of the library's item list closes any open batch; a batch never
        // spans two libraries.
        self.flush(sink)
    }

    fn flush(&mut self, sink: &mut dyn DiffSink) -> Result<(), SyncError> {
        if self.open.is_empty() {
            return Ok(());
        }
        let batch = Batch {
            library: std::mem::take(&mut self.open_library),
            group: self.current_group.clone(),
            items: std::mem::take(&mut self.open),
            total_size: std::mem::replace(&mut self.open_size, 0),
        };
        self.last_group = self.current_group.clone();
        sink.batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flavor, Library};

    #[derive(Default)]
    struct Collect {
        missing: Vec<String>,
        batches: Vec<Batch>,
    }

    impl DiffSink for Collect {
        fn missing(&mut self, item: &Item) -> Result<(), SyncError> {
            self.missing.push(item.item_path.clone());
            Ok(())
        }
        fn batch(&mut self, batch: Batch) -> Result<(), SyncError> {
            self.batches.push(batch);
            Ok(())
        }
    }

    fn item(path: &str, directory: bool, size: Option<u64>) -> Item {
        Item {
            item_path: path.to_string(),
            full_path: format!("/pub/Movies/{}", path),
            library: "Movies".into(),
            directory,
            symlink: false,
            size,
        }
    }

    fn repo(name: &str, items: Vec<Item>, patterns: Vec<&str>) -> Repository {
        let mut r = Repository::new(name, "k", Flavor::Linux);
        r.ignore_patterns = patterns.into_iter().map(String::from).collect();
        r.libraries.push(Library {
            name: "Movies".into(),
            sources: vec![],
            items,
        });
        r.compile_patterns().unwrap();
        r
    }

    #[test]
    fn missing_set_excludes_present_ignored_and_directories_from_batches() {
        let publisher = repo(
            "pub",
            vec![
                item("Alien", true, None),
                item("Alien/alien.mkv", false, Some(10)),
                item("Alien/alien.srt", false, Some(1)),
                item("Alien/extras.mkv", false, Some(20)),
            ],
            vec!["*.srt"],
        );
        let subscriber = repo("sub", vec![item("alien/ALIEN.MKV", false, None)], vec![]);

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, false, &mut sink)
            .unwrap();

        // Directory is reported missing but never batched; the present file
        // is skipped case-insensitively; the ignored file appears nowhere.
        assert_eq!(sink.missing, vec!["Alien", "Alien/extras.mkv"]);
        assert_eq!(sink.batches.len(), 1);
        let batch = &sink.batches[0];
        assert_eq!(batch.library, "Movies");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].item_path, "Alien/extras.mkv");
        assert_eq!(batch.total_size, 20);
        assert_eq!(differ.ignored, vec!["/pub/Movies/Alien/alien.srt"]);
    }

    #[test]
    fn batch_boundaries_follow_parent_directory() {
        let publisher = repo(
            "pub",
            vec![
                item("Alien/a.mkv", false, Some(1)),
                item("ALIEN/b.mkv", false, Some(2)), // same parent, different case
                item("Blade/c.mkv", false, Some(4)),
                item("Blade/d.mkv", false, Some(8)),
            ],
            vec![],
        );
        let subscriber = repo("sub", vec![], vec![]);

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, false, &mut sink)
            .unwrap();

        assert_eq!(sink.batches.len(), 2);
        assert_eq!(sink.batches[0].group, "Alien");
        assert_eq!(sink.batches[0].total_size, 3);
        assert_eq!(sink.batches[1].group, "Blade");
        assert_eq!(sink.batches[1].total_size, 12);
    }

    #[test]
    fn ignored_items_do_not_break_batches() {
        let publisher = repo(
            "pub",
            vec![
                item("Alien/a.mkv", false, Some(1)),
                item("Trash/junk.tmp", false, Some(99)),
                item("Alien/b.mkv", false, Some(2)),
            ],
            vec!["*.tmp"],
        );
        let subscriber = repo("sub", vec![], vec![]);

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, false, &mut sink)
            .unwrap();

        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0].items.len(), 2);
        assert_eq!(sink.batches[0].total_size, 3);
    }

    #[test]
    fn batches_never_span_libraries() {
        let mut publisher = repo("pub", vec![item("Alien/a.mkv", false, Some(1))], vec![]);
        publisher.libraries.push(Library {
            name: "Shows".into(),
            sources: vec![],
            items: vec![Item {
                item_path: "Alien/e1.mkv".into(), // same parent key as Movies batch
                full_path: "/pub/Shows/Alien/e1.mkv".into(),
                library: "Shows".into(),
                directory: false,
                symlink: false,
                size: Some(2),
            }],
        });
        let mut subscriber = repo("sub", vec![], vec![]);
        subscriber.libraries.push(Library {
            name: "Shows".into(),
            sources: vec![],
            items: vec![],
        });

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, false, &mut sink)
            .unwrap();
        differ
            .diff_library(&publisher, "Shows", &subscriber, false, &mut sink)
            .unwrap();

        assert_eq!(sink.batches.len(), 2);
        assert_eq!(sink.batches[0].library, "Movies");
        assert_eq!(sink.batches[1].library, "Shows");
    }

    #[test]
    fn scanned_libraries_stat_sizes_lazily() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.mkv");
        std::fs::write(&a, vec![0u8; 123]).unwrap();

        let mut it = item("Alien/a.mkv", false, None);
        it.full_path = a.to_string_lossy().into_owned();
        // A second item whose backing file is gone: size counts as zero.
        let mut gone = item("Alien/gone.mkv", false, None);
        gone.full_path = tmp.path().join("gone.mkv").to_string_lossy().into_owned();

        let publisher = repo("pub", vec![it, gone], vec![]);
        let subscriber = repo("sub", vec![], vec![]);

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, true, &mut sink)
            .unwrap();

        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0].total_size, 123);
        assert_eq!(sink.batches[0].items[0].size, Some(123));
        assert_eq!(sink.batches[0].items[1].size, Some(0));
    }

    #[test]
    fn top_level_files_group_under_empty_key() {
        let publisher = repo(
            "pub",
            vec![
                item("loose1.mkv", false, Some(1)),
                item("loose2.mkv", false, Some(2)),
            ],
            vec![],
        );
        let subscriber = repo("sub", vec![], vec![]);

        let mut differ = Differ::new();
        let mut sink = Collect::default();
        differ
            .diff_library(&publisher, "Movies", &subscriber, false, &mut sink)
            .unwrap();
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0].group, "");
        assert_eq!(sink.batches[0].items.len(), 2);
    }
}
