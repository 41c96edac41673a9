//! Storage target definitions and space-aware destination selection.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::model::{Item, Repository};

/// Hard default minimum free-space threshold (1 GiB) used when a library has
/// no target definition.
pub const MINIMUM_BYTES: u64 = 1_073_741_824;

/// A named storage destination: the library it serves, a minimum free-space
/// threshold, and an ordered list of candidate locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub minimum: String,
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetData {
    pub description: String,
    pub targets: Vec<Target>,
}

impl TargetData {
    pub fn load(path: &Path) -> Result<TargetData, SyncError> {
        info!("reading targets file {}", path.display());
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| SyncError::Config(format!("parsing {}: {}", path.display(), e)))
    }

    /// Fail fast on a malformed definition, naming the offending index.
    /// `check_paths` requires every location to exist on the local
    /// filesystem; skip it when the locations describe a remote subscriber.
    pub fn validate(&self, check_paths: bool) -> Result<(), SyncError> {
        if self.description.is_empty() {
            return Err(SyncError::Config("targets.description must be defined".into()));
        }
        for (i, t) in self.targets.iter().enumerate() {
            if t.name.is_empty() {
                return Err(SyncError::Config(format!("targets[{}].name must be defined", i)));
            }
            if t.minimum.is_empty() {
                return Err(SyncError::Config(format!(
                    "targets[{}].minimum must be defined",
                    i
                )));
            }
            let min = scaled_value(&t.minimum)?;
            if min < MINIMUM_BYTES {
                warn!(
                    "targets[{}] {} minimum of {} is less than the allowed minimum of {} MB",
                    i,
                    t.name,
                    t.minimum,
                    MINIMUM_BYTES / 1024 / 1024
                );
            }
            if t.locations.is_empty() {
                return Err(SyncError::Config(format!(
                    "targets[{}].locations {} must be defined",
                    i, t.name
                )));
            }
            for (j, loc) in t.locations.iter().enumerate() {
                if loc.is_empty() {
                    return Err(SyncError::Config(format!(
                        "targets[{}].locations[{}] {} must be defined",
                        i, j, t.name
                    )));
                }
                if check_paths && !Path::new(loc).exists() {
                    return Err(SyncError::Config(format!(
                        "targets[{}].locations[{}]: {} does not exist",
                        i, j, loc
                    )));
                }
            }
        }
        info!("targets validation successful");
        Ok(())
    }

    /// Target serving a library, if one is defined. A duplicate definition is
    /// a configuration error.
    pub fn get_library_target(&self, library: &str) -> Result<Option<&Target>, SyncError> {
        let mut found: Option<&Target> = None;
        for t in &self.targets {
            if t.name.eq_ignore_ascii_case(library) {
                if found.is_some() {
                    return Err(SyncError::Config(format!(
                        "target name {} defined more than once",
                        t.name
                    )));
                }
                found = Some(t);
            }
        }
        Ok(found)
    }

    /// Serialize for the `targets` protocol command.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("serializing targets: {}", e)))
    }
}

/// Parse a human-readable scaled size ("768", "500MB", "1t") into bytes.
/// Multipliers are binary: K=1024, M, G, T, with an optional trailing B.
pub fn scaled_value(s: &str) -> Result<u64, SyncError> {
    let t = s.trim().to_ascii_uppercase();
    if t.is_empty() {
        return Err(SyncError::Config("empty size value".into()));
    }
    let split = t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
    let (digits, suffix) = t.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid size value '{}'", s)))?;
    let mult: u64 = match suffix.trim() {
        "" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        _ => return Err(SyncError::Config(format!("invalid size suffix in '{}'", s))),
    };
    value
        .checked_mul(mult)
        .ok_or_else(|| SyncError::Config(format!("size value '{}' overflows", s)))
}

/// Seam for free-space queries: local filesystem stat or a remote `space`
/// round trip, depending on the session.
pub trait SpaceQuery {
    fn available_space(&mut self, path: &str) -> Result<u64, SyncError>;
}

/// Free space on the local machine, resolved by the longest mount-point
/// prefix of the queried path.
pub struct LocalSpace;

impl SpaceQuery for LocalSpace {
    fn available_space(&mut self, path: &str) -> Result<u64, SyncError> {
        let target = Path::new(path);
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match best {
            Some(d) => Ok(d.available_space()),
            None => {
                warn!("no mounted filesystem matches {}", path);
                Ok(0)
            }
        }
    }
}

/// Outcome of destination selection for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Copy the batch here.
    Location(String),
    /// No target is defined for this library. Batch-level: the run continues.
    NoTarget,
    /// A target exists, but no candidate has room for this batch (while at
    /// least one is above its bare minimum). Batch-level.
    NoSpace,
}

/// Pick a destination for a batch of `total_size` bytes belonging to
/// `library`.
///
/// Prefers an "original location" where siblings of the item already live,
/// then falls back to the target's candidate locations in order. When every
/// candidate sits at or below the minimum threshold the run has a systemic
/// capacity problem and `AllTargetsExhausted` is returned for the caller to
/// treat as fatal.
pub fn select_destination<S: SpaceQuery + ?Sized>(
    subscriber: &Repository,
    targets: Option<&TargetData>,
    item: &Item,
    library: &str,
    total_size: u64,
    pub_sep: char,
    space: &mut S,
) -> Result<Allocation, SyncError> {
    let target = match targets {
        Some(td) => td.get_library_target(library)?,
        None => None,
    };
    let minimum = match target {
        Some(t) => scaled_value(&t.minimum)?,
        None => MINIMUM_BYTES,
    };

    // Keep related files together: if siblings already live somewhere with
    // room, use that directory.
    if let Some(path) = subscriber.has_directory(library, &item.item_path, pub_sep) {
        let avail = space.available_space(&path)?;
        info!(
            "checking space on {} == {} MB for {} MB, minimum {} MB",
            path,
            avail / (1024 * 1024),
            total_size / (1024 * 1024),
            minimum / (1024 * 1024)
        );
        if avail > total_size + minimum {
            info!("using original location for {} at {}", item.item_path, path);
            return Ok(Allocation::Location(path));
        }
        info!(
            "original location too full for {} ({}) at {}",
            item.item_path, total_size, path
        );
    }

    let target = match target {
        Some(t) => t,
        None => {
            error!("no target library match found for publisher library {}", library);
            return Ok(Allocation::NoTarget);
        }
    };

    let mut all_full = true;
    for candidate in &target.locations {
        let avail = space.available_space(candidate)?;
        if avail > minimum {
            all_full = false;
            if avail > total_size + minimum {
                return Ok(Allocation::Location(candidate.clone()));
            }
        }
    }
    if all_full {
        return Err(SyncError::AllTargetsExhausted {
            library: library.to_string(),
            minimum: target.minimum.clone(),
        });
    }
    Ok(Allocation::NoSpace)
}
