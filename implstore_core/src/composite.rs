//! An ordered union of stores presented as one.

use crate::archive::{ArchiveExtractor, ArchiveFileInfo};
use crate::digest::ManifestDigest;
use crate::error::{DigestMismatch, Error, Result};
use crate::handler::Handler;
use crate::store::{Store, StoreKind};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Memoized `contains` answers, dropped on every mutation.
#[derive(Debug, Default)]
struct ContainsCache {
    generation: u64,
    entries: HashMap<ManifestDigest, bool>,
}

/// Combines several stores in priority order.
///
/// Reads scan the stores first to last. Writes try them last to first, so the
/// most specific store configured last receives new implementations.
pub struct CompositeStore {
    stores: Vec<Box<dyn Store>>,
    cache: Mutex<ContainsCache>,
}

impl CompositeStore {
    /// Create a composite over `stores`, highest read priority first.
    pub fn new(stores: Vec<Box<dyn Store>>) -> Self {
        Self {
            stores,
            cache: Mutex::new(ContainsCache::default()),
        }
    }

    /// The child stores in priority order.
    pub fn stores(&self) -> &[Box<dyn Store>] {
        &self.stores
    }

    /// How many times the containment cache has been invalidated.
    pub fn cache_generation(&self) -> u64 {
        self.cache.lock().generation
    }

    /// Try a write on each store from last to first until one accepts it.
    fn add_with<F>(&self, digest: &ManifestDigest, mut add: F) -> Result<PathBuf>
    where
        F: FnMut(&dyn Store) -> Result<PathBuf>,
    {
        self.flush();

        let mut last_error = None;
        for store in self.stores.iter().rev() {
            match add(store.as_ref()) {
                Ok(path) => {
                    self.flush();
                    return Ok(path);
                }
                Err(e) if e.is_storage_failure() => {
                    debug!(digest = %digest, error = %e, "Store refused implementation, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(Error::NoWritableStore))
    }
}

impl Store for CompositeStore {
    fn kind(&self) -> StoreKind {
        if self
            .stores
            .iter()
            .any(|store| store.kind() == StoreKind::ReadWrite)
        {
            StoreKind::ReadWrite
        } else {
            StoreKind::ReadOnly
        }
    }

    fn list_all(&self) -> Result<Vec<ManifestDigest>> {
        let mut all = BTreeSet::new();
        for store in &self.stores {
            match store.list_all() {
                Ok(digests) => all.extend(digests),
                Err(e) => warn!(error = %e, "Unable to list store, skipping"),
            }
        }
        Ok(all.into_iter().collect())
    }

    fn list_all_temp(&self) -> Result<Vec<PathBuf>> {
        let mut all = BTreeSet::new();
        for store in &self.stores {
            match store.list_all_temp() {
                Ok(paths) => all.extend(paths),
                Err(e) => warn!(error = %e, "Unable to list store, skipping"),
            }
        }
        Ok(all.into_iter().collect())
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        if let Some(&found) = self.cache.lock().entries.get(digest) {
            return found;
        }

        let found = self.stores.iter().any(|store| store.contains(digest));
        self.cache.lock().entries.insert(digest.clone(), found);
        found
    }

    fn contains_dir(&self, name: &str) -> bool {
        self.stores.iter().any(|store| store.contains_dir(name))
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.stores.iter().find_map(|store| store.get_path(digest))
    }

    #[instrument(skip(self, expected, handler), fields(digest = %expected), err)]
    fn add_directory(
        &self,
        path: &Path,
        expected: &ManifestDigest,
        handler: &dyn Handler,
    ) -> Result<PathBuf> {
        self.add_with(expected, |store| {
            store.add_directory(path, expected, handler)
        })
    }

    #[instrument(skip_all, fields(digest = %expected), err)]
    fn add_archives(
        &self,
        archives: &[ArchiveFileInfo],
        expected: &ManifestDigest,
        extractor: &dyn ArchiveExtractor,
        handler: &dyn Handler,
    ) -> Result<PathBuf> {
        self.add_with(expected, |store| {
            store.add_archives(archives, expected, extractor, handler)
        })
    }

    #[instrument(skip(self, handler), fields(digest = %digest), err)]
    fn remove(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<bool> {
        self.flush();

        let mut removed = false;
        let mut last_error = None;
        for store in self.stores.iter().rev() {
            if !store.contains(digest) {
                continue;
            }
            match store.remove(digest, handler) {
                Ok(true) => removed = true,
                Ok(false) => {}
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => {
                    warn!(digest = %digest, error = %e, "Unable to remove from store");
                    last_error = Some(e);
                }
            }
        }

        self.flush();
        match last_error {
            Some(e) if !removed => Err(e),
            _ => Ok(removed),
        }
    }

    #[instrument(skip_all, err)]
    fn optimise(&self, handler: &dyn Handler) -> Result<u64> {
        let mut saved = 0;
        for store in &self.stores {
            match store.optimise(handler) {
                Ok(bytes) => saved += bytes,
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => warn!(error = %e, "Unable to optimise store, skipping"),
            }
        }
        Ok(saved)
    }

    #[instrument(skip(self, handler), fields(digest = %digest), err)]
    fn verify(&self, digest: &ManifestDigest, handler: &dyn Handler) -> Result<()> {
        let mut found = false;
        let result = self
            .stores
            .iter()
            .filter(|store| store.contains(digest))
            .try_for_each(|store| {
                found = true;
                store.verify(digest, handler)
            });

        // Verification may have removed damaged copies
        self.flush();
        result?;

        if !found {
            return Err(Error::not_found(digest.best().unwrap_or_default()));
        }
        Ok(())
    }

    #[instrument(skip_all, err)]
    fn audit(&self, handler: &dyn Handler) -> Result<Vec<DigestMismatch>> {
        let mut problems = Vec::new();
        for store in &self.stores {
            match store.audit(handler) {
                Ok(found) => problems.extend(found),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => warn!(error = %e, "Unable to audit store, skipping"),
            }
        }
        Ok(problems)
    }

    #[instrument(skip(self, handler), err)]
    fn remove_temp(&self, path: &Path, handler: &dyn Handler) -> Result<bool> {
        for store in &self.stores {
            if store.remove_temp(path, handler)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn flush(&self) {
        {
            let mut cache = self.cache.lock();
            cache.entries.clear();
            cache.generation += 1;
        }
        for store in &self.stores {
            store.flush();
        }
    }
}

impl fmt::Debug for CompositeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeStore")
            .field("stores", &self.stores.len())
            .finish()
    }
}
