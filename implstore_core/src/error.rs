//! Error types for implstore_core.

use crate::manifest::Manifest;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using implstore_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during manifest and store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A filesystem operation failed.
    #[error("I/O error while {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A filesystem operation was refused for lack of privileges.
    #[error("Access denied while {action} {path}: {source}")]
    Unauthorized {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The implementation is already present in the store.
    #[error("Implementation {digest} is already in the store")]
    AlreadyInStore { digest: String },

    /// A directory does not hash to the digest it was expected to have.
    #[error(transparent)]
    DigestMismatch(Box<DigestMismatch>),

    /// No store contains the requested implementation.
    #[error("Implementation {digest} not found")]
    NotFound { digest: String },

    /// A manifest file could not be parsed.
    #[error("Malformed manifest at line {line}: {reason}")]
    MalformedManifest { line: usize, reason: String },

    /// A directory entry is neither a file, an executable, a symlink nor a directory.
    #[error("Unsupported file type: {path}")]
    UnsupportedEntryType { path: PathBuf },

    /// A digest identifier is malformed or uses an unknown algorithm.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// A path cannot be represented in a manifest.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// The filesystem hosting a store cannot record modification times to the second.
    #[error("The filesystem at {path} does not record modification times accurately enough")]
    InsufficientTimeAccuracy { path: PathBuf },

    /// Removing from a read-only store needs elevated rights.
    #[error("Store at {path} is read-only; removing implementations requires administrator rights")]
    RequiresAdmin { path: PathBuf },

    /// The implementation contains the running program.
    #[error("Refusing to remove {path}: it contains the running program")]
    OwnInstallation { path: PathBuf },

    /// An archive could not be extracted.
    #[error("Failed to extract archive {source_name}: {inner}")]
    Extraction {
        source_name: String,
        #[source]
        inner: Box<Error>,
    },

    /// No extractor understands the archive's MIME type.
    #[error("Unsupported archive type: {mime_type}")]
    UnsupportedArchive { mime_type: String },

    /// A composite store has no child store to write to.
    #[error("No store available to add the implementation to")]
    NoWritableStore,

    /// The operation was canceled by the caller.
    #[error("Operation canceled")]
    Canceled,
}

impl Error {
    /// Wrap an I/O error with the action and path it happened on.
    ///
    /// Permission failures become `Unauthorized`, everything else `Io`.
    pub fn from_io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Error::Unauthorized {
                action,
                path,
                source,
            }
        } else {
            Error::Io {
                action,
                path,
                source,
            }
        }
    }

    /// Create an AlreadyInStore error.
    pub fn already_in_store(digest: impl Into<String>) -> Self {
        Error::AlreadyInStore {
            digest: digest.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(digest: impl Into<String>) -> Self {
        Error::NotFound {
            digest: digest.into(),
        }
    }

    /// Create a MalformedManifest error.
    pub fn malformed_manifest(line: usize, reason: impl Into<String>) -> Self {
        Error::MalformedManifest {
            line,
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedEntryType error.
    pub fn unsupported_entry_type(path: impl Into<PathBuf>) -> Self {
        Error::UnsupportedEntryType { path: path.into() }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an Extraction error naming the archive that failed.
    pub fn extraction(source_name: impl Into<String>, inner: Error) -> Self {
        Error::Extraction {
            source_name: source_name.into(),
            inner: Box::new(inner),
        }
    }

    /// Whether this error comes from the storage medium rather than the content.
    ///
    /// Composite stores try the next child on these and give up on everything else.
    pub fn is_storage_failure(&self) -> bool {
        match self {
            Error::Io { .. }
            | Error::Unauthorized { .. }
            | Error::RequiresAdmin { .. }
            | Error::InsufficientTimeAccuracy { .. } => true,
            Error::Extraction { inner, .. } => inner.is_storage_failure(),
            _ => false,
        }
    }

    /// Whether this error reports missing read privileges.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}

/// An implementation whose content does not match its digest.
#[derive(Debug)]
pub struct DigestMismatch {
    /// The digest the content was supposed to have.
    pub expected_digest: String,
    /// The digest actually computed.
    pub actual_digest: String,
    /// The manifest recorded when the implementation was added, if any.
    pub expected_manifest: Option<Manifest>,
    /// The manifest computed from the current content.
    pub actual_manifest: Option<Manifest>,
}

impl DigestMismatch {
    /// Lines present in the actual manifest but not in the expected one, and vice versa.
    ///
    /// Returns `None` unless both manifests are known.
    pub fn diff(&self) -> Option<(Vec<String>, Vec<String>)> {
        let expected = self.expected_manifest.as_ref()?;
        let actual = self.actual_manifest.as_ref()?;
        Some(expected.diff(actual))
    }
}

impl fmt::Display for DigestMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest mismatch: expected {}, got {}",
            self.expected_digest, self.actual_digest
        )?;

        if let Some((added, removed)) = self.diff() {
            for line in &removed {
                write!(f, "\n- {}", line)?;
            }
            for line in &added {
                write!(f, "\n+ {}", line)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for DigestMismatch {}

impl From<DigestMismatch> for Error {
    fn from(mismatch: DigestMismatch) -> Self {
        Error::DigestMismatch(Box::new(mismatch))
    }
}

/// Attach an action and a path to `std::io` results.
pub trait IoResultExt<T> {
    /// Convert the error into an `Error::Io` or `Error::Unauthorized`.
    fn io_context(self, action: &'static str, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context(self, action: &'static str, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::from_io(action, path.as_ref(), source))
    }
}

// Conversions for external error types that do not carry a usable path.

/// Convert a directory listing error into an `Error`.
pub(crate) fn walk_error(path: &Path, err: ignore::Error) -> Error {
    // ignore::Error can wrap an io::Error or be a path error
    let source = match err.io_error() {
        Some(io_err) => std::io::Error::new(io_err.kind(), io_err.to_string()),
        None => std::io::Error::other(err.to_string()),
    };
    Error::from_io("listing", path, source)
}

/// Convert a failed atomic replace into an `Error`.
pub(crate) fn persist_error(path: &Path, err: tempfile::PersistError) -> Error {
    Error::from_io("replacing", path, err.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_permission_denied_maps_to_unauthorized() {
        let err = Error::from_io(
            "reading",
            "/some/path",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_unauthorized());
        assert!(err.is_storage_failure());
        assert!(err.to_string().contains("/some/path"));
    }

    #[test]
    fn test_other_io_maps_to_io() {
        let result: io::Result<()> = Err(io::Error::from(io::ErrorKind::NotFound));
        let err = result.io_context("opening", "/x").unwrap_err();
        assert!(matches!(err, Error::Io { action: "opening", .. }));
    }

    #[test]
    fn test_content_errors_are_not_storage_failures() {
        assert!(!Error::already_in_store("sha256=abc").is_storage_failure());
        assert!(!Error::Canceled.is_storage_failure());
        assert!(!Error::malformed_manifest(1, "bad").is_storage_failure());
    }

    #[test]
    fn test_extraction_inherits_inner_classification() {
        let inner = Error::from_io("writing", "/t", io::Error::other("disk full"));
        let err = Error::extraction("http://example.com/a.tar.gz", inner);
        assert!(err.is_storage_failure());
        assert!(err.to_string().contains("http://example.com/a.tar.gz"));

        let err = Error::extraction("a.zip", Error::Canceled);
        assert!(!err.is_storage_failure());
    }

    #[test]
    fn test_digest_mismatch_display_without_manifests() {
        let err: Error = DigestMismatch {
            expected_digest: "sha1new=abc".to_string(),
            actual_digest: "sha1new=def".to_string(),
            expected_manifest: None,
            actual_manifest: None,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Digest mismatch: expected sha1new=abc, got sha1new=def"
        );
    }
}
