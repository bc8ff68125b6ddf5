//! Watched file set and modification-time signatures.
//!
//! # Responsibilities
//! - Resolve the configured files and directories into concrete paths
//! - Apply exclusion prefixes
//! - Capture and compare modification times
//!
//! # Design Decisions
//! - A file only counts as changed when it was seen before with a different
//!   mtime; new files are recorded silently and deleted files are forgotten
//! - Hidden entries below a watched directory are skipped

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::config::ReloaderConfig;

/// Files and directories whose changes restart the worker.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The running executable plus everything the config names.
    pub fn from_config(config: &ReloaderConfig) -> Self {
        let mut set = Self::new();
        match std::env::current_exe() {
            Ok(exe) => set = set.file(exe),
            Err(e) => tracing::warn!(error = %e, "Cannot resolve current executable; not watching it"),
        }
        for file in &config.extra_files {
            set = set.file(file);
        }
        for dir in &config.watch_dirs {
            set = set.dir(dir);
        }
        for path in &config.exclude_paths {
            set = set.exclude(path);
        }
        set
    }

    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.files.push(absolute(path.as_ref()));
        self
    }

    pub fn dir(mut self, path: impl AsRef<Path>) -> Self {
        self.dirs.push(absolute(path.as_ref()));
        self
    }

    pub fn exclude(mut self, path: impl AsRef<Path>) -> Self {
        self.exclude.push(absolute(path.as_ref()));
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Whether a changed path belongs to this set.
    pub fn contains(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return false;
        }
        self.files.iter().any(|file| file == path)
            || self.dirs.iter().any(|dir| {
                path.strip_prefix(dir)
                    .map(|rest| !rest.components().any(|c| is_hidden(c.as_os_str())))
                    .unwrap_or(false)
            })
    }

    /// Every concrete file currently covered by the set.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|file| !self.is_excluded(file))
            .cloned()
            .collect();

        for dir in &self.dirs {
            let walker = WalkDir::new(dir)
                .follow_links(true)
                .into_iter()
                .filter_entry(|entry| {
                    (entry.depth() == 0 || !is_hidden(entry.file_name()))
                        && !self.is_excluded(entry.path())
                });
            for entry in walker.filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    paths.push(entry.into_path());
                }
            }
        }

        paths.sort();
        paths.dedup();
        paths
    }

    pub fn snapshot(&self) -> Signature {
        Signature::capture(self.paths())
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Modification times of a set of files at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    mtimes: BTreeMap<PathBuf, SystemTime>,
}

impl Signature {
    /// Stat every path; unreadable or missing paths are left out.
    pub fn capture(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mtimes = paths
            .into_iter()
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((path, modified))
            })
            .collect();
        Self { mtimes }
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }

    pub fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.mtimes.get(path).copied()
    }

    /// First path known to both signatures whose mtime differs.
    pub fn changed_from(&self, previous: &Signature) -> Option<&Path> {
        self.mtimes
            .iter()
            .find(|(path, mtime)| previous.mtimes.get(*path).is_some_and(|old| old != *mtime))
            .map(|(path, _)| path.as_path())
    }
}
