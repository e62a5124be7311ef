//! Deduplication of identical files across implementations via hard links.

use crate::digest::ManifestDigest;
use crate::error::{IoResultExt, Result};
use crate::format::ManifestFormat;
use crate::handler::{Handler, Progress};
use crate::manifest::{MANIFEST_FILE, Manifest, ManifestNode};
use crate::protection;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Files are only considered identical if all of these agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    size: u64,
    modified_time: i64,
    format: ManifestFormat,
    digest: String,
    executable: bool,
}

/// The first copy seen of a file.
#[derive(Debug)]
struct StoredFile {
    implementation: PathBuf,
    path: PathBuf,
}

/// One pass of hard-linking duplicate files inside a store.
///
/// Implementations whose write protection was lifted are resealed when the
/// run is dropped, whether it finished or failed.
pub(crate) struct OptimiseRun {
    store_path: PathBuf,
    reseal: bool,
    files: HashMap<DedupKey, StoredFile>,
    unsealed: HashSet<PathBuf>,
    staging: Option<TempDir>,
    link_counter: u64,
    saved_bytes: u64,
}

impl OptimiseRun {
    pub(crate) fn new(store_path: &Path, reseal: bool) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            reseal,
            files: HashMap::new(),
            unsealed: HashSet::new(),
            staging: None,
            link_counter: 0,
            saved_bytes: 0,
        }
    }

    /// Bytes saved so far.
    pub(crate) fn saved_bytes(&self) -> u64 {
        self.saved_bytes
    }

    /// Process implementations in order.
    pub(crate) fn run(&mut self, digests: &[ManifestDigest], handler: &dyn Handler) -> Result<()> {
        let total = digests.len() as u64;
        for (index, digest) in digests.iter().enumerate() {
            handler.check_cancellation()?;
            self.work(digest)?;
            handler.report(&Progress {
                task: "Finding duplicate files",
                done: index as u64 + 1,
                total: Some(total),
            });
        }
        Ok(())
    }

    fn work(&mut self, digest: &ManifestDigest) -> Result<()> {
        let (Some(id), Some(format)) = (digest.best(), digest.best_format()) else {
            return Ok(());
        };
        let implementation = self.store_path.join(&id);
        let manifest_path = implementation.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            debug!(path = ?implementation, "No manifest, skipping");
            return Ok(());
        }

        let manifest = match Manifest::load_path(&manifest_path, format) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = ?manifest_path, error = %e, "Unreadable manifest, skipping");
                return Ok(());
            }
        };

        for (directory, node) in manifest.files() {
            let (digest, modified_time, size, name, executable) = match node {
                ManifestNode::File {
                    digest,
                    modified_time,
                    size,
                    name,
                } => (digest, *modified_time, *size, name, false),
                ManifestNode::ExecutableFile {
                    digest,
                    modified_time,
                    size,
                    name,
                } => (digest, *modified_time, *size, name, true),
                _ => continue,
            };
            if size == 0 {
                continue;
            }

            let path = implementation
                .join(directory.trim_start_matches('/'))
                .join(name);
            let key = DedupKey {
                size,
                modified_time,
                format,
                digest: digest.clone(),
                executable,
            };

            let Some(existing) = self.files.get(&key) else {
                if path.is_file() {
                    self.files.insert(
                        key,
                        StoredFile {
                            implementation: implementation.clone(),
                            path,
                        },
                    );
                } else {
                    warn!(path = ?path, "File listed in manifest is missing, skipping");
                }
                continue;
            };

            if !path.is_file() || same_file::is_same_file(&existing.path, &path).unwrap_or(false) {
                continue;
            }

            let existing_implementation = existing.implementation.clone();
            let existing_path = existing.path.clone();
            self.unseal(&existing_implementation);
            self.unseal(&implementation);
            self.join(&existing_path, &path)?;
            self.saved_bytes += size;
        }

        Ok(())
    }

    /// Replace `duplicate` with a hard link to `original`.
    fn join(&mut self, original: &Path, duplicate: &Path) -> Result<()> {
        if self.staging.is_none() {
            let staging = tempfile::Builder::new()
                .prefix(".tmp-optimise-")
                .tempdir_in(&self.store_path)
                .io_context("creating temporary directory in", &self.store_path)?;
            self.staging = Some(staging);
        }
        let Some(staging) = &self.staging else {
            return Ok(());
        };

        self.link_counter += 1;
        let temp_link = staging.path().join(self.link_counter.to_string());
        fs::hard_link(original, &temp_link).io_context("linking", original)?;
        fs::rename(&temp_link, duplicate).io_context("replacing", duplicate)?;

        debug!(original = ?original, duplicate = ?duplicate, "Hard-linked duplicate");
        Ok(())
    }

    /// Lift write protection from an implementation once per run.
    fn unseal(&mut self, implementation: &Path) {
        if !self.reseal || !self.unsealed.insert(implementation.to_path_buf()) {
            return;
        }
        if let Err(e) = protection::disable(implementation) {
            warn!(path = ?implementation, error = %e, "Unable to remove write protection");
        }
    }
}

impl Drop for OptimiseRun {
    fn drop(&mut self) {
        for implementation in self.unsealed.drain() {
            if let Err(e) = protection::enable(&implementation) {
                warn!(path = ?implementation, error = %e, "Unable to restore write protection");
            }
        }
    }
}
