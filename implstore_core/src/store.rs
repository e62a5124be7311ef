//! The store contract and the on-disk directory store.

use crate::archive::{ArchiveExtractor, ArchiveFileInfo};
use crate::copy::copy_directory;
use crate::digest::ManifestDigest;
use crate::error::{DigestMismatch, Error, IoResultExt, Result};
use crate::flags::{self, NO_UNIX_FS_FILE};
use crate::format::ManifestFormat;
use crate::handler::Handler;
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::optimise::OptimiseRun;
use crate::protection;
use crate::walk::{from_unix_time, unix_time};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

/// Whether a store accepts new implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Implementations can be added and removed.
    ReadWrite,
    /// The store can only be read by the current user.
    ReadOnly,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::ReadWrite => f.write_str("ReadWrite"),
            StoreKind::ReadOnly => f.write_str("ReadOnly"),
        }
    }
}

/// A place that holds implementations keyed by their manifest digest.
pub trait Store {
    /// Whether this store accepts writes.
    fn kind(&self) -> StoreKind;

    /// The directory backing this store, if there is exactly one.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// All implementations in the store, sorted.
    fn list_all(&self) -> Result<Vec<ManifestDigest>>;

    /// Leftover directories from interrupted operations, sorted.
    fn list_all_temp(&self) -> Result<Vec<PathBuf>>;

    /// Whether an implementation with any of the digest's values is present.
    ///
    /// Never fails: unreadable stores simply do not contain anything.
    fn contains(&self, digest: &ManifestDigest) -> bool;

    /// Whether a directory with this exact name exists in the store.
    fn contains_dir(&self, name: &str) -> bool;

    /// The directory holding an implementation, if present.
    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf>;

    /// Copy a directory into the store after verifying it against `expected`.
    fn add_directory(
        &self,
        path: &Path,
        expected: &ManifestDigest,
        handler: &dyn Handler,
    ) -> Result<PathBuf>;

    /// Extract archives on top of each other and add the result after verifying it.
    fn add_archives(
        &self,
        archives: &[ArchiveFileInfo],
        expected: &ManifestDigest,
        extractor: &dyn ArchiveExtractor,
        handler: &dyn Handler,
    ) -> Result<PathBuf>;

    /// Remove an implementation. Returns `false` if it was not present.
    fn remove(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<bool>;

    /// Replace duplicate files with hard links. Returns the number of bytes saved.
    fn optimise(&self, handler: &dyn Handler) -> Result<u64>;

    /// Check that an implementation still matches its digest.
    fn verify(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<()>;

    /// Recheck every implementation and collect the damaged ones. Nothing is removed.
    fn audit(&self, handler: &dyn Handler) -> Result<Vec<DigestMismatch>>;

    /// Delete a leftover directory reported by [`Store::list_all_temp`].
    ///
    /// Returns `false` if the path is not a leftover of this store.
    fn remove_temp(&self, path: &Path, handler: &dyn Handler) -> Result<bool>;

    /// Drop any cached state.
    fn flush(&self) {}
}

/// A store backed by a single directory with one subdirectory per implementation.
#[derive(Debug)]
pub struct DirectoryStore {
    path: PathBuf,
    kind: StoreKind,
    use_write_protection: bool,
    is_unix_fs: bool,
    rename_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Open (or create) a store with write protection enabled.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_write_protection(path, true)
    }

    /// Open (or create) a store.
    ///
    /// Fails if the filesystem cannot record modification times to the second.
    /// Stores the current user cannot write to are opened read-only.
    pub fn with_write_protection(path: impl AsRef<Path>, use_write_protection: bool) -> Result<Self> {
        let path = path.as_ref();

        // Create root directory
        fs::create_dir_all(path).io_context("creating", path)?;
        let path = dunce::canonicalize(path).io_context("resolving", path)?;

        let kind = determine_kind(&path)?;
        let is_unix_fs = flags::is_unix_fs(&path);

        if kind == StoreKind::ReadWrite && !is_unix_fs && !path.join(NO_UNIX_FS_FILE).exists() {
            flags::mark_as_no_unix_fs(&path)?;
        }

        debug!(path = ?path, %kind, is_unix_fs, "Opened directory store");
        Ok(Self {
            path,
            kind,
            use_write_protection,
            is_unix_fs,
            rename_lock: Mutex::new(()),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.path
    }

    /// Whether the store's filesystem natively supports executable bits and symlinks.
    pub fn is_unix_fs(&self) -> bool {
        self.is_unix_fs
    }

    /// Whether implementations are write-protected after being added.
    pub fn uses_write_protection(&self) -> bool {
        self.use_write_protection
    }

    /// Check a directory against a digest and return its manifest.
    ///
    /// On mismatch the error carries the directory's stored `.manifest`, if any.
    pub fn verify_directory(
        directory: &Path,
        expected: &ManifestDigest,
        handler: &dyn Handler,
    ) -> Result<Manifest> {
        let expected_id = best_id(expected)?;
        let format = ManifestFormat::from_id(&expected_id)?;

        let actual = Manifest::generate(directory, format, handler)?;
        let actual_id = actual.calculate_digest();
        if actual_id != expected_id {
            let manifest_path = directory.join(MANIFEST_FILE);
            let expected_manifest = manifest_path
                .is_file()
                .then(|| Manifest::load_path(&manifest_path, format).ok())
                .flatten();

            return Err(DigestMismatch {
                expected_digest: expected_id,
                actual_digest: actual_id,
                expected_manifest,
                actual_manifest: Some(actual),
            }
            .into());
        }

        Ok(actual)
    }

    /// Create a fresh staging directory inside the store. Removed when dropped.
    fn temp_dir(&self) -> Result<TempDir> {
        let temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.path)
            .io_context("creating temporary directory in", &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o755))
                .io_context("setting permissions on", temp.path())?;
        }

        Ok(temp)
    }

    /// Hash the staged directory, record its manifest and move it into place.
    fn verify_and_add(
        &self,
        temp: TempDir,
        expected: &ManifestDigest,
        expected_manifest: Option<Manifest>,
        handler: &dyn Handler,
    ) -> Result<PathBuf> {
        let expected_id = best_id(expected)?;
        let format = ManifestFormat::from_id(&expected_id)?;
        let source = temp.path();
        let target = self.path.join(&expected_id);

        if self.is_unix_fs {
            flags::convert_to_fs(source)?;
        }

        // Saved before comparing so a rejected directory can still be inspected
        let actual = Manifest::generate(source, format, handler)?;
        let actual_id = actual.save_path(&source.join(MANIFEST_FILE))?;
        if actual_id != expected_id {
            return Err(DigestMismatch {
                expected_digest: expected_id,
                actual_digest: actual_id,
                expected_manifest,
                actual_manifest: Some(actual),
            }
            .into());
        }

        {
            let _guard = self.rename_lock.lock();

            if target.exists() {
                return Err(Error::already_in_store(expected_id));
            }

            if let Err(e) = fs::rename(source, &target) {
                // Another process may have won the race
                if target.exists()
                    || matches!(
                        e.kind(),
                        io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
                    )
                {
                    return Err(Error::already_in_store(expected_id));
                }
                return Err(Error::from_io("moving", source, e));
            }
        }

        if self.use_write_protection {
            enable_write_protection(&target);
        }

        info!(digest = %expected_id, path = ?target, "Added implementation");
        Ok(target)
    }

    fn already_in_store(&self, digest: &ManifestDigest) -> Error {
        Error::already_in_store(digest.best().unwrap_or_default())
    }

    fn check_admin(&self) -> Result<()> {
        if self.kind == StoreKind::ReadOnly && !is_administrator() {
            return Err(Error::RequiresAdmin {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

impl Store for DirectoryStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn list_all(&self) -> Result<Vec<ManifestDigest>> {
        let mut digests: Vec<ManifestDigest> = self
            .subdirectories()?
            .into_iter()
            .filter_map(|(name, _)| ManifestDigest::from_id(&name).ok())
            .collect();
        digests.sort();
        Ok(digests)
    }

    fn list_all_temp(&self) -> Result<Vec<PathBuf>> {
        let mut temp: Vec<PathBuf> = self
            .subdirectories()?
            .into_iter()
            .filter(|(name, _)| ManifestDigest::from_id(name).is_err())
            .map(|(_, path)| path)
            .collect();
        temp.sort();
        Ok(temp)
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        digest
            .available_digests()
            .iter()
            .any(|id| self.path.join(id).is_dir())
    }

    fn contains_dir(&self, name: &str) -> bool {
        self.path.join(name).is_dir()
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        digest
            .available_digests()
            .iter()
            .map(|id| self.path.join(id))
            .find(|path| path.is_dir())
    }

    #[instrument(skip(self, expected, handler), fields(store = ?self.path, digest = %expected), err)]
    fn add_directory(
        &self,
        path: &Path,
        expected: &ManifestDigest,
        handler: &dyn Handler,
    ) -> Result<PathBuf> {
        if self.contains(expected) {
            return Err(self.already_in_store(expected));
        }

        // The source may carry the manifest it was published with
        let expected_manifest = match expected.best_format() {
            Some(format) if path.join(MANIFEST_FILE).is_file() => {
                Manifest::load_path(&path.join(MANIFEST_FILE), format).ok()
            }
            _ => None,
        };

        let temp = self.temp_dir()?;
        copy_directory(path, temp.path(), handler)?;
        self.verify_and_add(temp, expected, expected_manifest, handler)
    }

    #[instrument(skip_all, fields(store = ?self.path, digest = %expected, archives = archives.len()), err)]
    fn add_archives(
        &self,
        archives: &[ArchiveFileInfo],
        expected: &ManifestDigest,
        extractor: &dyn ArchiveExtractor,
        handler: &dyn Handler,
    ) -> Result<PathBuf> {
        if self.contains(expected) {
            return Err(self.already_in_store(expected));
        }

        let temp = self.temp_dir()?;
        for archive in archives {
            extractor
                .extract(archive, temp.path(), handler)
                .map_err(|e| match e {
                    Error::Canceled => e,
                    e => Error::extraction(&archive.source_name, e),
                })?;
        }
        self.verify_and_add(temp, expected, None, handler)
    }

    #[instrument(skip(self, handler), fields(store = ?self.path, digest = %digest), err)]
    fn remove(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<bool> {
        let Some(path) = self.get_path(digest) else {
            return Ok(false);
        };

        self.check_admin()?;
        if is_own_installation(&path) {
            return Err(Error::OwnInstallation { path });
        }
        handler.check_cancellation()?;

        disable_write_protection(&path);

        // Move out of the way first so no half-deleted directory stays visible under its digest
        let graveyard = tempfile::Builder::new()
            .prefix(".del-")
            .tempdir_in(&self.path)
            .io_context("creating temporary directory in", &self.path)?;
        let doomed = graveyard.path().join("implementation");
        fs::rename(&path, &doomed).io_context("moving", &path)?;
        graveyard.close().io_context("deleting", &doomed)?;

        info!(path = ?path, "Removed implementation");
        Ok(true)
    }

    #[instrument(skip_all, fields(store = ?self.path), err)]
    fn optimise(&self, handler: &dyn Handler) -> Result<u64> {
        if !self.path.is_dir() {
            return Ok(0);
        }

        let digests = self.list_all()?;
        let mut run = OptimiseRun::new(&self.path, self.use_write_protection);
        run.run(&digests, handler)?;

        let saved = run.saved_bytes();
        info!(saved, "Optimised store");
        Ok(saved)
    }

    #[instrument(skip(self, handler), fields(store = ?self.path, digest = %digest), err)]
    fn verify(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<()> {
        let Some(path) = self.get_path(digest) else {
            return Err(Error::not_found(digest.best().unwrap_or_default()));
        };

        // Verify against the algorithm the directory is actually named after
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid_path(&path, "not a digest directory"))?;
        let stored = ManifestDigest::from_id(name)?;

        match Self::verify_directory(&path, &stored, handler) {
            Ok(_) => {
                // Reseal in case the write protection got lost
                if self.use_write_protection {
                    enable_write_protection(&path);
                }
                Ok(())
            }
            Err(Error::DigestMismatch(mismatch)) => {
                error!(expected = %mismatch.expected_digest, actual = %mismatch.actual_digest, "{}", mismatch);

                let question = format!(
                    "Implementation {} is damaged. Do you want to remove it?",
                    mismatch.expected_digest
                );
                if handler.confirm(&question) {
                    self.remove(&stored, handler)?;
                }
                Err(Error::DigestMismatch(mismatch))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(store = ?self.path), err)]
    fn audit(&self, handler: &dyn Handler) -> Result<Vec<DigestMismatch>> {
        let mut problems = Vec::new();
        for digest in self.list_all()? {
            handler.check_cancellation()?;
            let path = self.path.join(best_id(&digest)?);
            match Self::verify_directory(&path, &digest, handler) {
                Ok(_) => {}
                Err(Error::DigestMismatch(mismatch)) => {
                    warn!(expected = %mismatch.expected_digest, actual = %mismatch.actual_digest, "Damaged implementation");
                    problems.push(*mismatch);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(problems)
    }

    #[instrument(skip(self, handler), fields(store = ?self.path), err)]
    fn remove_temp(&self, path: &Path, handler: &dyn Handler) -> Result<bool> {
        if path.parent() != Some(self.path.as_path()) {
            return Ok(false);
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        if ManifestDigest::from_id(name).is_ok() {
            return Err(Error::invalid_path(path, "not a temporary directory"));
        }
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::from_io("reading", path, e)),
        };

        self.check_admin()?;
        handler.check_cancellation()?;

        if metadata.is_dir() {
            disable_write_protection(path);
            fs::remove_dir_all(path).io_context("deleting", path)?;
        } else {
            fs::remove_file(path).io_context("deleting", path)?;
        }

        info!(path = ?path, "Removed temporary directory");
        Ok(true)
    }
}

impl DirectoryStore {
    /// Immediate subdirectories as `(name, path)` pairs.
    fn subdirectories(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        for entry in fs::read_dir(&self.path).io_context("listing", &self.path)? {
            let entry = entry.io_context("listing", &self.path)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                result.push((name.to_string(), path));
            }
        }
        Ok(result)
    }
}

impl fmt::Display for DirectoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.path.display())
    }
}

impl PartialEq for DirectoryStore {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

fn best_id(digest: &ManifestDigest) -> Result<String> {
    digest
        .best()
        .ok_or_else(|| Error::invalid_digest("No known digest method"))
}

/// Read-write if modification times survive to the second, read-only if we cannot write at all.
fn determine_kind(path: &Path) -> Result<StoreKind> {
    match has_accurate_times(path) {
        Ok(true) => Ok(StoreKind::ReadWrite),
        Ok(false) => Err(Error::InsufficientTimeAccuracy {
            path: path.to_path_buf(),
        }),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
            ) =>
        {
            debug!(path = ?path, "Store is not writable, opening read-only");
            Ok(StoreKind::ReadOnly)
        }
        Err(e) => Err(Error::from_io("checking time accuracy of", path, e)),
    }
}

fn has_accurate_times(path: &Path) -> io::Result<bool> {
    let probe = tempfile::Builder::new()
        .prefix(".time-check-")
        .tempfile_in(path)?;

    // An odd number of seconds catches filesystems with two-second resolution
    let expected = 1_234_567_891;
    probe.as_file().set_modified(from_unix_time(expected))?;
    let actual = unix_time(probe.as_file().metadata()?.modified()?);

    Ok(actual == expected)
}

fn enable_write_protection(path: &Path) {
    if let Err(e) = protection::enable(path) {
        warn!(path = ?path, error = %e, "Unable to write-protect implementation");
    }
}

fn disable_write_protection(path: &Path) {
    if let Err(e) = protection::disable(path) {
        warn!(path = ?path, error = %e, "Unable to remove write protection");
    }
}

#[cfg(unix)]
fn is_administrator() -> bool {
    rustix::process::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_administrator() -> bool {
    false
}

/// Whether the running program lives inside `path`.
fn is_own_installation(path: &Path) -> bool {
    std::env::current_exe()
        .ok()
        .and_then(|exe| dunce::canonicalize(exe).ok())
        .is_some_and(|exe| exe.starts_with(path))
}
