//! Inventory data model: items, libraries, repositories, path flavors.
//!
//! A Repository is one side of a replication run (publisher or subscriber).
//! It is read once at startup from a JSON file and is read-only for the rest
//! of the run, except for on-demand scan population of empty libraries.

use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::SyncError;

/// Path-separator convention a repository's filesystem uses. Exchanged during
/// the handshake so the publisher builds destination paths the subscriber's
/// way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Linux,
    Windows,
    Mac,
}

impl Flavor {
    pub fn separator(&self) -> char {
        match self {
            Flavor::Linux => '/',
            Flavor::Windows => '\\',
            Flavor::Mac => ':',
        }
    }

    /// The wire token sent during the handshake.
    pub fn token(&self) -> &'static str {
        match self {
            Flavor::Linux => "linux",
            Flavor::Windows => "windows",
            Flavor::Mac => "mac",
        }
    }

    /// Parse a wire token. This is the handshake's validation point: an
    /// unparseable token fails the handshake.
    pub fn from_token(token: &str) -> Option<Flavor> {
        match token.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(Flavor::Linux),
            "windows" => Some(Flavor::Windows),
            "mac" | "apple" => Some(Flavor::Mac),
            _ => None,
        }
    }
}

/// Rewrite a path from one flavor's separator to another's.
pub fn translate_separators(path: &str, from: char, to: char) -> String {
    if from == to {
        return path.to_string();
    }
    path.chars().map(|c| if c == from { to } else { c }).collect()
}

/// One file or directory entry inside a library. Identity for diffing is
/// `(library, item_path)`, compared case-insensitively on the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Path relative to the library root, in the owning repository's flavor.
    pub item_path: String,
    /// Absolute source path.
    pub full_path: String,
    /// Owning library name.
    pub library: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub symlink: bool,
    /// Bytes; populated lazily, set once during diff processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Item {
    /// Leaf name of the item path.
    pub fn name(&self, sep: char) -> &str {
        match self.item_path.rfind(sep) {
            Some(i) => &self.item_path[i + 1..],
            None => &self.item_path,
        }
    }

    /// Everything left of the last separator; empty for a top-level item.
    pub fn parent_path(&self, sep: char) -> &str {
        match self.item_path.rfind(sep) {
            Some(i) => &self.item_path[..i],
            None => "",
        }
    }
}

/// A named logical collection of items with one or more root paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub items: Vec<Item>,
}

/// Full inventory for one side of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub description: String,
    /// `host[:port]` of this repository's daemon; empty means loopback.
    #[serde(default)]
    pub host: String,
    /// Shared key used for session authentication and the keyed codec.
    pub key: String,
    pub flavor: Flavor,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<Library>,
    #[serde(skip)]
    compiled_patterns: Vec<Regex>,
}

impl Repository {
    /// An empty repository definition; libraries and ignore patterns are
    /// filled in afterwards (call [`compile_patterns`](Self::compile_patterns)
    /// once patterns are set).
    pub fn new(description: &str, key: &str, flavor: Flavor) -> Repository {
        Repository {
            description: description.to_string(),
            host: String::new(),
            key: key.to_string(),
            flavor,
            ignore_patterns: Vec::new(),
            libraries: Vec::new(),
            compiled_patterns: Vec::new(),
        }
    }

    /// Read a repository JSON file and compile its ignore patterns.
    pub fn load(path: &Path) -> Result<Repository, SyncError> {
        info!("reading repository file {}", path.display());
        let json = fs::read_to_string(path)?;
        let mut repo: Repository = serde_json::from_str(&json)
            .map_err(|e| SyncError::Config(format!("parsing {}: {}", path.display(), e)))?;
        repo.compile_patterns()?;
        Ok(repo)
    }

    /// Translate the glob-style ignore patterns (`*` and `?`) into anchored,
    /// case-insensitive regexes matched against item leaf names.
    pub fn compile_patterns(&mut self) -> Result<(), SyncError> {
        self.compiled_patterns.clear();
        for pat in &self.ignore_patterns {
            let mut src = String::from("^");
            for c in pat.chars() {
                match c {
                    '*' => src.push_str(".*?"),
                    '?' => src.push_str(".?"),
                    other => src.push_str(&regex::escape(&other.to_string())),
                }
            }
            src.push('$');
            let re = RegexBuilder::new(&src)
                .case_insensitive(true)
                .build()
                .map_err(|e| SyncError::Config(format!("ignore pattern '{}': {}", pat, e)))?;
            self.compiled_patterns.push(re);
        }
        Ok(())
    }

    /// Does any ignore pattern match this leaf name?
    pub fn matches_ignore(&self, name: &str) -> bool {
        self.compiled_patterns.iter().any(|re| re.is_match(name))
    }

    pub fn get_library(&self, name: &str) -> Option<&Library> {
        self.libraries
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    pub fn get_library_mut(&mut self, name: &str) -> Option<&mut Library> {
        self.libraries
            .iter_mut()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Does this repository have an item with the same `(library, item_path)`
    /// identity, compared case-insensitively?
    pub fn has_item(&self, library: &str, item_path: &str) -> bool {
        match self.get_library(library) {
            Some(lib) => lib
                .items
                .iter()
                .any(|i| i.item_path.eq_ignore_ascii_case(item_path)),
            None => false,
        }
    }

    /// Find an "original location": a base storage path under which siblings
    /// of `item_path` already live. `sep` is the separator of the flavor
    /// `item_path` was written in (the publisher's).
    ///
    /// Returns the location root, so a destination is always built the same
    /// way: location + separator + item path.
    pub fn has_directory(&self, library: &str, item_path: &str, sep: char) -> Option<String> {
        let want = normalize_group(parent_of(item_path, sep), sep);
        if want.is_empty() {
            return None;
        }
        let my_sep = self.flavor.separator();
        let lib = self.get_library(library)?;
        for it in &lib.items {
            if normalize_group(it.parent_path(my_sep), my_sep) == want {
                // The full path ends with the item path; what precedes it is
                // the location this library root is mounted at.
                let tail = it.item_path.len() + 1;
                if it.full_path.len() > tail {
                    return Some(it.full_path[..it.full_path.len() - tail].to_string());
                }
            }
        }
        None
    }

    /// Populate one library's item list by walking its source roots in a
    /// stable order. Sizes are left unset; the differ stats files lazily as
    /// they are accepted into batches.
    pub fn scan(&mut self, library_name: &str) -> Result<(), SyncError> {
        let sep = self.flavor.separator();
        let lib = self
            .libraries
            .iter_mut()
            .find(|l| l.name.eq_ignore_ascii_case(library_name))
            .ok_or_else(|| SyncError::Config(format!("library {} not found", library_name)))?;
        lib.items.clear();
        for source in &lib.sources {
            for entry in WalkDir::new(source)
                .follow_links(false)
                .min_depth(1)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("skipping unreadable entry under {}: {}", source, e);
                        continue;
                    }
                };
                let rel = match entry.path().strip_prefix(source) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let item_path = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(&sep.to_string());
                lib.items.push(Item {
                    item_path,
                    full_path: entry.path().to_string_lossy().into_owned(),
                    library: lib.name.clone(),
                    directory: entry.file_type().is_dir(),
                    symlink: entry.path_is_symlink(),
                    size: None,
                });
            }
        }
        info!("scanned library {}: {} items", lib.name, lib.items.len());
        Ok(())
    }

    /// Sanity-check the repository definition. `check_paths` additionally
    /// requires every library source to exist on the local filesystem, which
    /// only makes sense for a repository this process will scan.
    pub fn validate(&self, check_paths: bool) -> Result<(), SyncError> {
        if self.description.is_empty() {
            return Err(SyncError::Config("repository description must be defined".into()));
        }
        if self.key.is_empty() {
            return Err(SyncError::Config("repository key must be defined".into()));
        }
        for (i, lib) in self.libraries.iter().enumerate() {
            if lib.name.is_empty() {
                return Err(SyncError::Config(format!(
                    "libraries[{}].name must be defined",
                    i
                )));
            }
            if lib.sources.is_empty() && lib.items.is_empty() {
                return Err(SyncError::Config(format!(
                    "libraries[{}] {} must have sources or items",
                    i, lib.name
                )));
            }
            if check_paths {
                for (j, src) in lib.sources.iter().enumerate() {
                    if !Path::new(src).exists() {
                        return Err(SyncError::Config(format!(
                            "libraries[{}].sources[{}]: {} does not exist",
                            i, j, src
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize for the `collection` protocol command.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("serializing repository: {}", e)))
    }
}

fn parent_of(path: &str, sep: char) -> &str {
    match path.rfind(sep) {
        Some(i) => &path[..i],
        None => "",
    }
}

/// Flavor- and case-insensitive form of a parent path for group comparisons.
fn normalize_group(path: &str, sep: char) -> String {
    path.chars()
        .map(|c| if c == sep { '/' } else { c.to_ascii_lowercase() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(lib: &str, path: &str) -> Item {
        Item {
            item_path: path.to_string(),
            full_path: format!("/pub/{}/{}", lib, path),
            library: lib.to_string(),
            directory: false,
            symlink: false,
            size: None,
        }
    }

    fn repo_with(items: Vec<Item>, patterns: Vec<&str>) -> Repository {
        let mut r = Repository {
            description: "test".into(),
            host: String::new(),
            key: "k".into(),
            flavor: Flavor::Linux,
            ignore_patterns: patterns.into_iter().map(String::from).collect(),
            libraries: vec![Library {
                name: "Movies".into(),
                sources: vec![],
                items,
            }],
            compiled_patterns: Vec::new(),
        };
        r.compile_patterns().unwrap();
        r
    }

    #[test]
    fn flavor_tokens_round_trip() {
        for f in [Flavor::Linux, Flavor::Windows, Flavor::Mac] {
            assert_eq!(Flavor::from_token(f.token()), Some(f));
        }
        assert_eq!(Flavor::from_token("APPLE"), Some(Flavor::Mac));
        assert_eq!(Flavor::from_token("plan9"), None);
    }

    #[test]
    fn separator_translation() {
        assert_eq!(
            translate_separators("Movies/Alien/alien.mkv", '/', '\\'),
            "Movies\\Alien\\alien.mkv"
        );
        assert_eq!(translate_separators("a/b", '/', '/'), "a/b");
    }

    #[test]
    fn ignore_patterns_anchor_on_leaf_name() {
        let r = repo_with(vec![], vec!["*.srt", "Thumbs.db", "sample?"]);
        assert!(r.matches_ignore("movie.srt"));
        assert!(r.matches_ignore("THUMBS.DB"));
        assert!(r.matches_ignore("sample1"));
        assert!(r.matches_ignore("sample"));
        assert!(!r.matches_ignore("movie.mkv"));
        // Not a substring match: anchored on the whole leaf name
        assert!(!r.matches_ignore("movie.srt.bak"));
    }

    #[test]
    fn has_item_is_case_insensitive() {
        let r = repo_with(vec![item("Movies", "Alien/Alien.mkv")], vec![]);
        assert!(r.has_item("movies", "alien/alien.MKV"));
        assert!(!r.has_item("Movies", "Alien/Aliens.mkv"));
        assert!(!r.has_item("Shows", "Alien/Alien.mkv"));
    }

    #[test]
    fn has_directory_finds_sibling_location() {
        let mut sub = repo_with(vec![], vec![]);
        sub.libraries[0].items.push(Item {
            item_path: "Alien/alien.mkv".into(),
            full_path: "/vol1/Movies/Alien/alien.mkv".into(),
            library: "Movies".into(),
            directory: false,
            symlink: false,
            size: None,
        });
        // Publisher item in the same parent directory; the location root is
        // returned so the item path can be appended to it.
        let loc = sub.has_directory("Movies", "ALIEN/aliens.mkv", '/');
        assert_eq!(loc.as_deref(), Some("/vol1/Movies"));
        assert!(sub.has_directory("Movies", "Predator/predator.mkv", '/').is_none());
        // Top-level items have no original location
        assert!(sub.has_directory("Movies", "loose.mkv", '/').is_none());
    }

    #[test]
    fn scan_populates_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("Alien")).unwrap();
        std::fs::write(root.join("Alien/alien.mkv"), b"x").unwrap();
        std::fs::write(root.join("loose.txt"), b"y").unwrap();

        let mut r = repo_with(vec![], vec![]);
        r.libraries[0].sources = vec![root.to_string_lossy().into_owned()];
        r.scan("Movies").unwrap();

        let paths: Vec<&str> = r.libraries[0]
            .items
            .iter()
            .map(|i| i.item_path.as_str())
            .collect();
        assert!(paths.contains(&"Alien"));
        assert!(paths.contains(&"Alien/alien.mkv"));
        assert!(paths.contains(&"loose.txt"));
        let dir = r.libraries[0]
            .items
            .iter()
            .find(|i| i.item_path == "Alien")
            .unwrap();
        assert!(dir.directory);
        assert!(r.libraries[0].items.iter().all(|i| i.size.is_none()));
    }

    #[test]
    fn validate_catches_missing_fields() {
        let mut r = repo_with(vec![item("Movies", "a.mkv")], vec![]);
        assert!(r.validate(false).is_ok());
        r.key.clear();
        assert!(r.validate(false).is_err());
    }
}
