//! Modification-time polling.
//!
//! A [`WatchSet`] names the roots to watch; an [`MtimeSnapshot`] remembers
//! the mtime of every file under them and reports the first change.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

use crate::config::ReloaderConfig;

/// Files and directories whose changes restart the worker.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    roots: Vec<PathBuf>,
    ignore: Vec<String>,
}

impl WatchSet {
    pub fn new(ignore: Vec<String>) -> Self {
        Self {
            roots: Vec::new(),
            ignore,
        }
    }

    /// The running executable (when enabled) plus the configured extra paths.
    pub fn from_config(config: &ReloaderConfig) -> Self {
        let mut set = Self::new(config.ignore.clone());
        if config.watch_executable {
            match std::env::current_exe() {
                Ok(exe) => set.add(exe),
                Err(err) => {
                    tracing::warn!(error = %err, "Cannot locate the running executable; not watching it")
                }
            }
        }
        for path in &config.extra_files {
            set.add(path.clone());
        }
        set
    }

    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.roots.contains(&path) {
            self.roots.push(path);
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Every file currently under the roots, ignored names excluded.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for root in &self.roots {
            let walker = WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !self.is_ignored(entry));
            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                    Ok(_) => {}
                    Err(err) => tracing::trace!(error = %err, "Skipping unreadable watch entry"),
                }
            }
        }
        files
    }

    fn is_ignored(&self, entry: &DirEntry) -> bool {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| self.ignore.iter().any(|ignored| ignored == name))
    }
}

/// What the poller noticed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Modified(PathBuf),
    Removed(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Modified(path) | Change::Removed(path) => path,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Last observed mtime of every watched file.
#[derive(Debug, Clone, Default)]
pub struct MtimeSnapshot {
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl MtimeSnapshot {
    pub fn take(watch: &WatchSet) -> Self {
        let mtimes = watch
            .files()
            .into_iter()
            .filter_map(|path| mtime(&path).ok().map(|time| (path, time)))
            .collect();
        Self { mtimes }
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }

    /// Re-stat the watched files and report the first change.
    ///
    /// Files that appeared since the last poll are recorded silently.
    pub fn detect_change(&mut self, watch: &WatchSet) -> Option<Change> {
        for (path, seen) in &self.mtimes {
            match mtime(path) {
                Ok(current) if current > *seen => return Some(Change::Modified(path.clone())),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Some(Change::Removed(path.clone()))
                }
                Err(err) => tracing::trace!(path = %path.display(), error = %err, "Cannot stat watched file"),
            }
        }

        for path in watch.files() {
            if !self.mtimes.contains_key(&path) {
                if let Ok(time) = mtime(&path) {
                    tracing::debug!(path = %path.display(), "Watching new file");
                    self.mtimes.insert(path, time);
                }
            }
        }
        None
    }
}

fn mtime(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch_later(path: &Path) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
    }

    fn watch(dir: &Path) -> WatchSet {
        let mut set = WatchSet::new(vec![".git".into()]);
        set.add(dir);
        set
    }

    #[test]
    fn walks_directories_and_skips_ignored_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("src/app.rs"), "a").unwrap();
        fs::write(dir.path().join("src/nested/mod.rs"), "b").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "c").unwrap();

        let mut files = watch(dir.path()).files();
        files.sort();
        assert_eq!(
            files,
            vec![
                dir.path().join("src/app.rs"),
                dir.path().join("src/nested/mod.rs")
            ]
        );
    }

    #[test]
    fn reports_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.rs");
        fs::write(&file, "v1").unwrap();

        let set = watch(dir.path());
        let mut snapshot = MtimeSnapshot::take(&set);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.detect_change(&set), None);

        touch_later(&file);
        assert_eq!(snapshot.detect_change(&set), Some(Change::Modified(file)));
    }

    #[test]
    fn reports_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.txt");
        fs::write(&file, "x").unwrap();

        let set = watch(dir.path());
        let mut snapshot = MtimeSnapshot::take(&set);
        fs::remove_file(&file).unwrap();
        assert_eq!(snapshot.detect_change(&set), Some(Change::Removed(file)));
    }

    #[test]
    fn new_files_are_recorded_without_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let set = watch(dir.path());
        let mut snapshot = MtimeSnapshot::take(&set);
        assert!(snapshot.is_empty());

        let file = dir.path().join("new.rs");
        fs::write(&file, "x").unwrap();
        assert_eq!(snapshot.detect_change(&set), None);
        assert_eq!(snapshot.len(), 1);

        touch_later(&file);
        assert_eq!(snapshot.detect_change(&set), Some(Change::Modified(file)));
    }

    #[test]
    fn single_file_roots_are_watched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("greeting.txt");
        fs::write(&file, "hi").unwrap();

        let mut set = WatchSet::default();
        set.add(&file);
        set.add(&file);
        assert_eq!(set.roots().len(), 1);
        assert_eq!(set.files(), vec![file]);
    }
}
