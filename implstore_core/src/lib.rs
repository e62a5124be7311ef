//! # Implstore Core
//!
//! A content-addressed cache of software implementations.
//!
//! Every implementation is a directory tree identified by the digest of its
//! *manifest*: a canonical, line-oriented listing of its files, executables,
//! symlinks and subdirectories together with their content hashes. A store
//! only accepts a directory after recomputing that digest, and can later
//! re-verify, remove or deduplicate what it holds.
//!
//! ## Features
//!
//! - Three manifest formats (`sha1new`, `sha256`, `sha256new`)
//! - Atomic verify-and-commit into digest-named directories
//! - Write protection for committed implementations
//! - Flag-file emulation of executable bits and symlinks on filesystems without them
//! - Hard-link deduplication of identical files across implementations
//! - Composition of several stores into one ordered view
//!
//! ## Example
//!
//! ```no_run
//! use implstore_core::{DirectoryStore, Manifest, SilentHandler, Store};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DirectoryStore::new("./implementations")?;
//!
//! // Compute the digest of a directory and add it to the store
//! let source = Path::new("./my-app-1.0");
//! let digest = Manifest::create_digest(source, &SilentHandler)?;
//! let path = store.add_directory(source, &digest, &SilentHandler)?;
//! println!("Stored at {}", path.display());
//!
//! // Check it later
//! store.verify(&digest, &SilentHandler)?;
//!
//! // Hard-link identical files across implementations
//! let saved = store.optimise(&SilentHandler)?;
//! println!("Saved {} bytes", saved);
//! # Ok(())
//! # }
//! ```

mod archive;
mod composite;
mod copy;
mod digest;
mod error;
pub mod flags;
mod format;
mod generator;
mod handler;
mod manifest;
mod optimise;
pub mod protection;
mod store;
mod walk;

pub use archive::{
    ArchiveExtractor, ArchiveFileInfo, MIME_TAR, MIME_TAR_GZ, TarExtractor, guess_mime_type,
};
pub use composite::CompositeStore;
pub use copy::copy_directory;
pub use digest::ManifestDigest;
pub use error::{DigestMismatch, Error, Result};
pub use format::ManifestFormat;
pub use generator::ManifestGenerator;
pub use handler::{Handler, Progress, SilentHandler};
pub use manifest::{Files, MANIFEST_FILE, Manifest, ManifestNode};
pub use store::{DirectoryStore, Store, StoreKind};
pub use walk::{Entry, EntryKind, Walker};
