//! Item transfer: local filesystem copies and remote resumable streaming.
//!
//! Both variants sit behind [`Endpoint`], which also answers free-space
//! queries so one authenticated session serves allocation and transfer.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use filetime::FileTime;
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::model::{Flavor, Item};
use crate::session::Session;
use crate::storage::{LocalSpace, SpaceQuery};

/// Data frame size for remote uploads.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// One side a run copies to. Space queries and copies go through the same
/// object because a remote run multiplexes both over one session.
pub trait Endpoint: SpaceQuery {
    /// Separator to build destination paths with.
    fn separator(&self) -> char;

    /// Copy one item to the exact destination path `to_path`.
    fn copy(&mut self, item: &Item, to_path: &str) -> Result<(), SyncError>;
}

/// Destination on the local filesystem.
pub struct LocalEndpoint {
    flavor: Flavor,
    space: LocalSpace,
}

impl LocalEndpoint {
    pub fn new(flavor: Flavor) -> LocalEndpoint {
        LocalEndpoint {
            flavor,
            space: LocalSpace,
        }
    }
}

impl SpaceQuery for LocalEndpoint {
    fn available_space(&mut self, path: &str) -> Result<u64, SyncError> {
        self.space.available_space(path)
    }
}

impl Endpoint for LocalEndpoint {
    fn separator(&self) -> char {
        self.flavor.separator()
    }

    fn copy(&mut self, item: &Item, to_path: &str) -> Result<(), SyncError> {
        copy_local(&item.full_path, to_path, item.symlink).map_err(|e| {
            match e.kind() {
                ErrorKind::Unsupported => {
                    error!("copy unsupported for {}: {}", item.full_path, e)
                }
                ErrorKind::AlreadyExists => {
                    error!("destination already exists for {}: {}", item.full_path, e)
                }
                ErrorKind::DirectoryNotEmpty => {
                    error!("destination directory not empty for {}: {}", item.full_path, e)
                }
                _ => error!("copying {}: {}", item.full_path, e),
            }
            SyncError::Transfer {
                path: item.full_path.clone(),
                source: e,
            }
        })
    }
}

fn copy_local(from: &str, to: &str, symlink: bool) -> std::io::Result<()> {
    let dest = Path::new(to);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if symlink {
        let link_target = fs::read_link(from)?;
        match fs::symlink_metadata(dest) {
            Ok(_) => fs::remove_file(dest)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link_target, dest)?;
        #[cfg(not(unix))]
        return Err(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("symlink to {} not supported here", link_target.display()),
        ));
        #[cfg(unix)]
        return Ok(());
    }
    fs::copy(from, to)?;
    let meta = fs::metadata(from)?;
    filetime::set_file_mtime(to, FileTime::from_last_modification_time(&meta))?;
    Ok(())
}

/// Destination behind a subscriber daemon. Copies stream over the session's
/// `stat`/`mkdir`/`put`/`commit` commands with automatic `.part` resume.
pub struct RemoteEndpoint {
    pub session: Session,
}

impl RemoteEndpoint {
    pub fn new(session: Session) -> RemoteEndpoint {
        RemoteEndpoint { session }
    }

    /// Size of `path` on the remote end if it is a regular file.
    fn stat_file(&mut self, path: &str) -> Result<Option<u64>, SyncError> {
        let reply = self.session.round_trip(&format!("stat {}", path))?;
        let mut parts = reply.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("file"), Some(size)) => {
                let size = size
                    .parse::<u64>()
                    .map_err(|_| SyncError::Protocol(format!("bad stat reply '{}'", reply)))?;
                Ok(Some(size))
            }
            (Some("dir"), _) | (Some("missing"), _) => Ok(None),
            _ => Err(SyncError::Protocol(format!("bad stat reply '{}'", reply))),
        }
    }

    /// Create the directory tree holding `pathname` (a file path), one
    /// segment at a time. The daemon tolerates segments that already exist.
    fn make_remote_directory(&mut self, pathname: &str) -> Result<(), SyncError> {
        let sep = self.session.remote_flavor().separator();
        let windows = self.session.remote_flavor() == Flavor::Windows;
        for dir in directory_segments(pathname, sep, windows) {
            let reply = self.session.round_trip(&format!("mkdir {}", dir))?;
            if reply != "ok" {
                return Err(SyncError::Protocol(format!(
                    "mkdir {} failed: {}",
                    dir, reply
                )));
            }
        }
        Ok(())
    }

    fn transmit_file(&mut self, src: &str, dest: &str) -> Result<(), SyncError> {
        let part = format!("{}.part", dest);

        // A leftover .part from an interrupted run resumes where it stopped.
        let offset = match self.stat_file(&part)? {
            Some(size) if size > 0 => {
                warn!("resuming partial transfer of {} at {}", dest, size);
                size
            }
            Some(_) => 0,
            None => {
                self.make_remote_directory(&part)?;
                0
            }
        };

        let mut file = File::open(src).map_err(|e| SyncError::Transfer {
            path: src.to_string(),
            source: e,
        })?;
        let total = file
            .metadata()
            .map_err(|e| SyncError::Transfer {
                path: src.to_string(),
                source: e,
            })?
            .len();
        if offset > total {
            // The partial is longer than the source; start over.
            warn!("partial {} longer than source, restarting", part);
            return self.stream(&mut file, src, &part, dest, 0, total);
        }
        self.stream(&mut file, src, &part, dest, offset, total - offset)
    }

    fn stream(
        &mut self,
        file: &mut File,
        src: &str,
        part: &str,
        dest: &str,
        offset: u64,
        len: u64,
    ) -> Result<(), SyncError> {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SyncError::Transfer {
                path: src.to_string(),
                source: e,
            })?;

        let reply = self
            .session
            .round_trip(&format!("put {} {} {}", offset, len, part))?;
        if reply != "ok" {
            return Err(SyncError::Protocol(format!("put rejected: {}", reply)));
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            file.read_exact(&mut buf[..want])
                .map_err(|e| SyncError::Transfer {
                    path: src.to_string(),
                    source: e,
                })?;
            self.session.send_frame(&buf[..want])?;
            remaining -= want as u64;
        }

        let done = self.session.read_reply()?;
        let written = done
            .strip_prefix("ok ")
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| SyncError::Protocol(format!("bad put completion '{}'", done)))?;
        if written != len {
            return Err(SyncError::Protocol(format!(
                "short remote write: {} of {} bytes",
                written, len
            )));
        }

        let reply = self.session.round_trip(&format!("commit {}", dest))?;
        if reply != "ok" {
            return Err(SyncError::Protocol(format!("commit failed: {}", reply)));
        }
        info!("committed {} ({} bytes)", dest, offset + len);
        Ok(())
    }
}

impl SpaceQuery for RemoteEndpoint {
    fn available_space(&mut self, path: &str) -> Result<u64, SyncError> {
        self.session.available_space(path)
    }
}

impl Endpoint for RemoteEndpoint {
    fn separator(&self) -> char {
        self.session.remote_flavor().separator()
    }

    fn copy(&mut self, item: &Item, to_path: &str) -> Result<(), SyncError> {
        self.transmit_file(&item.full_path, to_path)
    }
}

/// The mkdir sequence for the directory tree holding the file at `pathname`:
/// each ancestor from the top down, skipping a bare Windows drive root.
fn directory_segments(pathname: &str, sep: char, windows: bool) -> Vec<String> {
    let dir = match pathname.rfind(sep) {
        Some(i) => &pathname[..i],
        None => return Vec::new(),
    };
    let absolute = dir.starts_with(sep);
    let mut out = Vec::new();
    let mut whole = String::new();
    for (i, part) in dir.split(sep).filter(|p| !p.is_empty()).enumerate() {
        if i == 0 && windows && part.len() == 2 && part.ends_with(':') {
            whole.push_str(part);
            continue;
        }
        if absolute || !whole.is_empty() {
            whole.push(sep);
        }
        whole.push_str(part);
        out.push(whole.clone());
    }
    out
}
