//! Canonical directory traversal.
//!
//! Within each directory, files (including symlinks) come first, then
//! subdirectories, each group sorted by the bytes of its names. Every
//! subdirectory is recursed into right after it is listed.

use crate::error::{Error, IoResultExt, Result, walk_error};
use crate::flags::{self, SYMLINK_FILE, XBIT_FILE};
use crate::handler::{Handler, Progress};
use crate::manifest::MANIFEST_FILE;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Bookkeeping files that never show up as entries.
const SKIPPED_FILES: [&str; 3] = [MANIFEST_FILE, XBIT_FILE, SYMLINK_FILE];

/// What a walked entry turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File { size: u64, modified_time: i64 },
    /// A regular file with the executable bit set (natively or through a flag file).
    ExecutableFile { size: u64, modified_time: i64 },
    /// A symbolic link (native or emulated) pointing at `target`.
    Symlink { target: String },
    /// A directory.
    Directory,
}

/// A classified entry below the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full path on disk.
    pub path: PathBuf,
    /// Unix-style path from the walk root, starting with `/`.
    pub relative_path: String,
    /// The final path component.
    pub name: String,
    /// The classification.
    pub kind: EntryKind,
}

impl Entry {
    /// Bytes counted towards progress: the size of regular and executable files.
    pub fn file_size(&self) -> u64 {
        match self.kind {
            EntryKind::File { size, .. } | EntryKind::ExecutableFile { size, .. } => size,
            _ => 0,
        }
    }
}

/// Walks a directory tree in canonical order.
#[derive(Debug)]
pub struct Walker {
    root: PathBuf,
    unix_fs: bool,
    executables: HashSet<PathBuf>,
    symlinks: HashSet<PathBuf>,
}

impl Walker {
    /// Prepare a walk of `root`, loading any governing flag files.
    pub fn new(root: &Path) -> Result<Self> {
        let root = dunce::canonicalize(root).io_context("resolving", root)?;
        if !root.is_dir() {
            return Err(Error::invalid_path(&root, "not a directory"));
        }

        let unix_fs = flags::is_unix_fs(&root);
        let executables = flags::get_files(XBIT_FILE, &root)?;
        let symlinks = flags::get_files(SYMLINK_FILE, &root)?;

        Ok(Self {
            root,
            unix_fs,
            executables,
            symlinks,
        })
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether entries are classified using native Unix file semantics.
    pub fn is_unix_fs(&self) -> bool {
        self.unix_fs
    }

    /// List every entry below the root in canonical order.
    pub fn entries(&self, handler: &dyn Handler) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        self.list_dir(&self.root, "", handler, &mut entries)?;
        Ok(entries)
    }

    /// Visit every entry in canonical order, reporting progress under `task`.
    ///
    /// Cancellation is checked before each entry.
    pub fn walk<F>(&self, task: &str, handler: &dyn Handler, mut visit: F) -> Result<()>
    where
        F: FnMut(&Entry) -> Result<()>,
    {
        let entries = self.entries(handler)?;
        let total: u64 = entries.iter().map(Entry::file_size).sum();
        debug!(root = ?self.root, entries = entries.len(), total, "Walking directory");

        let mut done = 0;
        for entry in &entries {
            handler.check_cancellation()?;
            visit(entry)?;

            done += entry.file_size();
            handler.report(&Progress {
                task,
                done,
                total: Some(total),
            });
        }

        Ok(())
    }

    fn list_dir(
        &self,
        dir: &Path,
        relative: &str,
        handler: &dyn Handler,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        handler.check_cancellation()?;

        let mut files = Vec::new();
        let mut dirs = Vec::new();

        // Only immediate children, nothing filtered, symlinks not followed
        let walker = ignore::WalkBuilder::new(dir)
            .standard_filters(false)
            .follow_links(false)
            .max_depth(Some(1))
            .build();

        for result in walker {
            let dir_entry = result.map_err(|e| walk_error(dir, e))?;
            if dir_entry.depth() == 0 {
                continue;
            }

            let path = dir_entry.path().to_path_buf();
            let name = entry_name(&path)?;
            if SKIPPED_FILES.contains(&name.as_str()) {
                continue;
            }

            let metadata = fs::symlink_metadata(&path).io_context("reading", &path)?;
            if metadata.is_dir() {
                dirs.push((name, path));
            } else {
                files.push((name, path, metadata));
            }
        }

        files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        dirs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        for (name, path, metadata) in files {
            let kind = self.classify(&path, &metadata)?;
            out.push(Entry {
                relative_path: format!("{}/{}", relative, name),
                path,
                name,
                kind,
            });
        }

        for (name, path) in dirs {
            let relative_path = format!("{}/{}", relative, name);
            out.push(Entry {
                path: path.clone(),
                relative_path: relative_path.clone(),
                name,
                kind: EntryKind::Directory,
            });
            self.list_dir(&path, &relative_path, handler, out)?;
        }

        Ok(())
    }

    fn classify(&self, path: &Path, metadata: &fs::Metadata) -> Result<EntryKind> {
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(path).io_context("reading link", path)?;
            let target = target
                .to_str()
                .ok_or_else(|| Error::invalid_path(path, "symlink target is not valid UTF-8"))?;
            return Ok(EntryKind::Symlink {
                target: target.to_string(),
            });
        }

        if !metadata.is_file() {
            return Err(Error::unsupported_entry_type(path));
        }

        let size = metadata.len();
        let modified_time = unix_time(metadata.modified().io_context("reading", path)?);

        if self.unix_fs {
            return Ok(if is_executable(metadata) {
                EntryKind::ExecutableFile {
                    size,
                    modified_time,
                }
            } else {
                EntryKind::File {
                    size,
                    modified_time,
                }
            });
        }

        if let Some(target) = flags::read_cygwin_symlink(path)? {
            return Ok(EntryKind::Symlink { target });
        }

        if self.executables.contains(path) {
            return Ok(EntryKind::ExecutableFile {
                size,
                modified_time,
            });
        }

        if self.symlinks.contains(path) {
            let target = fs::read_to_string(path).io_context("reading", path)?;
            return Ok(EntryKind::Symlink { target });
        }

        Ok(EntryKind::File {
            size,
            modified_time,
        })
    }
}

fn entry_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid_path(path, "file name is not valid UTF-8"))?;

    if name.contains('\n') {
        return Err(Error::invalid_path(path, "file name contains a newline"));
    }

    Ok(name.to_string())
}

/// Whether the executable bit is set.
#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// Whether the executable bit is set (always false without Unix permissions).
#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Whole seconds since the Unix epoch, rounded towards negative infinity.
pub fn unix_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(e) => {
            let before = e.duration();
            let secs = before.as_secs() as i64;
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

/// The `SystemTime` for whole seconds since the Unix epoch.
pub fn from_unix_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SilentHandler;
    use tempfile::TempDir;

    fn relative_paths(root: &Path) -> Vec<String> {
        Walker::new(root)
            .unwrap()
            .entries(&SilentHandler)
            .unwrap()
            .into_iter()
            .map(|e| e.relative_path)
            .collect()
    }

    #[test]
    fn test_canonical_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("b.txt"), b"b").unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("Z.txt"), b"Z").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("inner"), b"i").unwrap();
        fs::create_dir(root.join("asub")).unwrap();
        fs::write(root.join("zzz"), b"z").unwrap();

        assert_eq!(
            relative_paths(root),
            vec![
                "/Z.txt", "/a.txt", "/b.txt", "/zzz", "/asub", "/sub", "/sub/inner"
            ]
        );
    }

    #[test]
    fn test_skips_bookkeeping_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join(MANIFEST_FILE), b"").unwrap();
        fs::write(root.join(XBIT_FILE), b"").unwrap();
        fs::write(root.join(SYMLINK_FILE), b"").unwrap();
        fs::write(root.join("file"), b"").unwrap();

        assert_eq!(relative_paths(root), vec!["/file"]);
    }

    #[test]
    fn test_walk_reports_progress() {
        use std::cell::RefCell;

        struct Recorder(RefCell<Vec<(u64, Option<u64>)>>);
        impl Handler for Recorder {
            fn report(&self, progress: &Progress<'_>) {
                self.0.borrow_mut().push((progress.done, progress.total));
            }
        }

        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), b"123").unwrap();
        fs::write(temp_dir.path().join("b"), b"45").unwrap();

        let handler = Recorder(RefCell::new(Vec::new()));
        let walker = Walker::new(temp_dir.path()).unwrap();
        let mut seen = Vec::new();
        walker
            .walk("test", &handler, |entry| {
                seen.push(entry.name.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(
            *handler.0.borrow(),
            vec![(3, Some(5)), (5, Some(5))]
        );
    }

    #[test]
    fn test_walk_honours_cancellation() {
        struct Cancel;
        impl Handler for Cancel {
            fn is_cancellation_requested(&self) -> bool {
                true
            }
        }

        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), b"1").unwrap();

        let walker = Walker::new(temp_dir.path()).unwrap();
        let result = walker.walk("test", &Cancel, |_| Ok(()));
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[test]
    fn test_flagged_entries_on_emulated_fs() {
        let temp_dir = TempDir::new().unwrap();
        flags::mark_as_no_unix_fs(temp_dir.path()).unwrap();
        let root = temp_dir.path().join("impl");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("tool"), b"#!/bin/sh").unwrap();
        fs::write(root.join("link"), b"tool").unwrap();
        fs::write(root.join("plain"), b"data").unwrap();
        flags::write_cygwin_symlink(&root.join("cyg"), "plain").unwrap();
        flags::set(&root.join(XBIT_FILE), Path::new("tool")).unwrap();
        flags::set(&root.join(SYMLINK_FILE), Path::new("link")).unwrap();

        let walker = Walker::new(&root).unwrap();
        assert!(!walker.is_unix_fs());
        let entries = walker.entries(&SilentHandler).unwrap();
        let kinds: Vec<(&str, &EntryKind)> =
            entries.iter().map(|e| (e.name.as_str(), &e.kind)).collect();

        assert_eq!(kinds[0].0, "cyg");
        assert_eq!(
            kinds[0].1,
            &EntryKind::Symlink {
                target: "plain".to_string()
            }
        );
        assert_eq!(kinds[1].0, "link");
        assert_eq!(
            kinds[1].1,
            &EntryKind::Symlink {
                target: "tool".to_string()
            }
        );
        assert_eq!(kinds[2].0, "plain");
        assert!(matches!(kinds[2].1, EntryKind::File { size: 4, .. }));
        assert_eq!(kinds[3].0, "tool");
        assert!(matches!(kinds[3].1, EntryKind::ExecutableFile { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn test_native_classification() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("exe"), b"#!/bin/sh").unwrap();
        fs::set_permissions(root.join("exe"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(root.join("dir")).unwrap();
        std::os::unix::fs::symlink("dir", root.join("dirlink")).unwrap();

        let entries = Walker::new(root).unwrap().entries(&SilentHandler).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        // Symlinked directories are listed with the files and never entered
        assert_eq!(names, vec!["dirlink", "exe", "dir"]);
        assert_eq!(
            entries[0].kind,
            EntryKind::Symlink {
                target: "dir".to_string()
            }
        );
        assert!(matches!(entries[1].kind, EntryKind::ExecutableFile { .. }));
        assert_eq!(entries[2].kind, EntryKind::Directory);
    }

    #[test]
    #[cfg(unix)]
    fn test_rejects_special_files() {
        use std::os::unix::net::UnixListener;

        let temp_dir = TempDir::new().unwrap();
        let _listener = UnixListener::bind(temp_dir.path().join("socket")).unwrap();

        let result = Walker::new(temp_dir.path()).unwrap().entries(&SilentHandler);
        assert!(matches!(result, Err(Error::UnsupportedEntryType { .. })));
    }

    #[test]
    fn test_unix_time_conversions() {
        assert_eq!(unix_time(UNIX_EPOCH), 0);
        assert_eq!(unix_time(from_unix_time(1_234_567_890)), 1_234_567_890);
        assert_eq!(unix_time(from_unix_time(-42)), -42);
        assert_eq!(unix_time(UNIX_EPOCH - Duration::from_millis(500)), -1);
    }
}
