//! Write protection for committed implementation directories.
//!
//! - **Unix**: files become 0444, directories and executables 0555
//! - **Elsewhere**: files get the read-only attribute
//!
//! Failures on individual entries are logged and skipped.

use crate::error::{Result, walk_error};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Remove write permissions from everything below `path`.
pub fn enable(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    debug!(path = ?path, "Enabling write protection");

    // Contents before their directories so the directories stay writable until last
    for entry in list_tree(path)?.iter().rev() {
        if let Err(e) = protect_entry(entry) {
            warn!(path = ?entry, error = %e, "Failed to write-protect, continuing");
        }
    }

    Ok(())
}

/// Restore write permissions on everything below `path`.
pub fn disable(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    debug!(path = ?path, "Disabling write protection");

    // Directories before their contents
    for entry in list_tree(path)? {
        if let Err(e) = unprotect_entry(&entry) {
            warn!(path = ?entry, error = %e, "Failed to remove write protection, continuing");
        }
    }

    Ok(())
}

/// All paths below and including `path` in pre-order, symlinks not followed.
fn list_tree(path: &Path) -> Result<Vec<PathBuf>> {
    let walker = ignore::WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .build();

    walker
        .map(|entry| {
            entry
                .map(ignore::DirEntry::into_path)
                .map_err(|e| walk_error(path, e))
        })
        .collect()
}

#[cfg(unix)]
fn protect_entry(path: &Path) -> std::io::Result<()> {
    set_mode(path, 0o555, 0o444)
}

#[cfg(unix)]
fn unprotect_entry(path: &Path) -> std::io::Result<()> {
    set_mode(path, 0o755, 0o644)
}

/// Apply `executable_mode` to directories and executables, `plain_mode` to other files.
#[cfg(unix)]
fn set_mode(path: &Path, executable_mode: u32, plain_mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let current_mode = metadata.permissions().mode();
    let new_mode = if metadata.is_dir() || (current_mode & 0o111 != 0) {
        executable_mode
    } else {
        plain_mode
    };

    fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
}

#[cfg(not(unix))]
fn protect_entry(path: &Path) -> std::io::Result<()> {
    set_readonly(path, true)
}

#[cfg(not(unix))]
fn unprotect_entry(path: &Path) -> std::io::Result<()> {
    set_readonly(path, false)
}

#[cfg(not(unix))]
fn set_readonly(path: &Path, readonly: bool) -> std::io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_file() {
        return Ok(());
    }

    let mut permissions = metadata.permissions();
    if permissions.readonly() != readonly {
        permissions.set_readonly(readonly);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        enable(&missing).unwrap();
        disable(&missing).unwrap();
    }

    #[test]
    fn test_enable_then_disable() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("impl");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("file"), b"data").unwrap();

        enable(&root).unwrap();
        assert!(
            fs::metadata(root.join("sub").join("file"))
                .unwrap()
                .permissions()
                .readonly()
        );

        disable(&root).unwrap();
        assert!(
            !fs::metadata(root.join("sub").join("file"))
                .unwrap()
                .permissions()
                .readonly()
        );
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_unix_modes() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("impl");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("plain"), b"").unwrap();
        fs::write(root.join("exe"), b"").unwrap();
        fs::set_permissions(root.join("exe"), fs::Permissions::from_mode(0o700)).unwrap();
        std::os::unix::fs::symlink("plain", root.join("link")).unwrap();

        let mode = |name: &str| {
            fs::symlink_metadata(root.join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };

        enable(&root).unwrap();
        assert_eq!(mode("plain"), 0o444);
        assert_eq!(mode("exe"), 0o555);
        assert_eq!(fs::metadata(&root).unwrap().permissions().mode() & 0o777, 0o555);

        disable(&root).unwrap();
        assert_eq!(mode("plain"), 0o644);
        assert_eq!(mode("exe"), 0o755);
        assert_eq!(fs::metadata(&root).unwrap().permissions().mode() & 0o777, 0o755);
    }
}
