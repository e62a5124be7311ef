//! Copies an implementation directory while preserving what its manifest records.

use crate::error::{IoResultExt, Result};
use crate::flags::{self, SYMLINK_FILE, XBIT_FILE};
use crate::handler::Handler;
use crate::walk::{Entry, EntryKind, Walker, from_unix_time};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Copy the contents of `source` into the existing directory `target`.
///
/// Modification times, executable bits and symlinks are preserved. If `target`
/// lacks Unix semantics they are recorded in flag files instead.
pub fn copy_directory(source: &Path, target: &Path, handler: &dyn Handler) -> Result<()> {
    let walker = Walker::new(source)?;
    let target_unix = flags::is_unix_fs(target);
    debug!(source = ?walker.root(), target = ?target, target_unix, "Copying directory");

    walker.walk("Copying files", handler, |entry| {
        copy_entry(entry, target, target_unix)
    })
}

fn copy_entry(entry: &Entry, target: &Path, target_unix: bool) -> Result<()> {
    let relative = Path::new(entry.relative_path.trim_start_matches('/'));
    let destination = target.join(relative);

    match &entry.kind {
        EntryKind::Directory => {
            fs::create_dir(&destination).io_context("creating", &destination)?;
        }
        EntryKind::File { modified_time, .. } => {
            copy_file(&entry.path, &destination, false, *modified_time)?;
        }
        EntryKind::ExecutableFile { modified_time, .. } => {
            copy_file(&entry.path, &destination, target_unix, *modified_time)?;
            if !target_unix {
                flags::set(&target.join(XBIT_FILE), relative)?;
            }
        }
        EntryKind::Symlink { target: link_target } => {
            if target_unix {
                create_symlink(link_target, &destination)?;
            } else {
                fs::write(&destination, link_target).io_context("writing", &destination)?;
                flags::set(&target.join(SYMLINK_FILE), relative)?;
            }
        }
    }

    Ok(())
}

fn copy_file(source: &Path, destination: &Path, executable: bool, modified_time: i64) -> Result<()> {
    fs::copy(source, destination).io_context("copying", source)?;
    set_writable_mode(destination, executable)?;

    let file = fs::File::options()
        .write(true)
        .open(destination)
        .io_context("opening", destination)?;
    file.set_modified(from_unix_time(modified_time))
        .io_context("setting modification time on", destination)?;

    Ok(())
}

/// Reset permissions of a fresh copy (0644 or 0755).
#[cfg(unix)]
fn set_writable_mode(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .io_context("setting permissions on", path)
}

/// Clear the read-only attribute a copy may have inherited.
#[cfg(not(unix))]
fn set_writable_mode(path: &Path, _executable: bool) -> Result<()> {
    let mut permissions = fs::metadata(path).io_context("reading", path)?.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions).io_context("setting permissions on", path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).io_context("creating symlink", link)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    // Never reached: without Unix semantics symlinks go to flag files
    fs::write(link, target).io_context("writing", link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ManifestFormat;
    use crate::handler::SilentHandler;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("b.txt"), b"beta").unwrap();
        fs::File::options()
            .write(true)
            .open(root.join("a.txt"))
            .unwrap()
            .set_modified(from_unix_time(1_500_000_000))
            .unwrap();
    }

    #[test]
    fn test_copy_preserves_manifest() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        populate(source.path());

        copy_directory(source.path(), target.path(), &SilentHandler).unwrap();

        let expected =
            Manifest::generate(source.path(), ManifestFormat::Sha256New, &SilentHandler).unwrap();
        let actual =
            Manifest::generate(target.path(), ManifestFormat::Sha256New, &SilentHandler).unwrap();
        assert_eq!(expected, actual);
        assert_eq!(
            fs::read(target.path().join("sub").join("b.txt")).unwrap(),
            b"beta"
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_copy_preserves_xbits_and_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        populate(source.path());
        fs::write(source.path().join("run"), b"#!/bin/sh").unwrap();
        fs::set_permissions(source.path().join("run"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("a.txt", source.path().join("link")).unwrap();

        copy_directory(source.path(), target.path(), &SilentHandler).unwrap();

        let expected =
            Manifest::generate(source.path(), ManifestFormat::Sha1New, &SilentHandler).unwrap();
        let actual =
            Manifest::generate(target.path(), ManifestFormat::Sha1New, &SilentHandler).unwrap();
        assert_eq!(expected, actual);
        assert_eq!(
            fs::read_link(target.path().join("link")).unwrap(),
            Path::new("a.txt")
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_copy_to_emulated_fs_writes_flag_files() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        fs::write(source.path().join("run"), b"#!/bin/sh").unwrap();
        fs::set_permissions(source.path().join("run"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("run", source.path().join("link")).unwrap();

        let target_root = TempDir::new().unwrap();
        flags::mark_as_no_unix_fs(target_root.path()).unwrap();
        let target = target_root.path().join("copy");
        fs::create_dir(&target).unwrap();

        copy_directory(source.path(), &target, &SilentHandler).unwrap();

        assert_eq!(fs::read_to_string(target.join(XBIT_FILE)).unwrap(), "/run\n");
        assert_eq!(fs::read_to_string(target.join(SYMLINK_FILE)).unwrap(), "/link\n");
        assert_eq!(fs::read_to_string(target.join("link")).unwrap(), "run");

        // The emulated copy still describes the same tree
        let expected =
            Manifest::generate(source.path(), ManifestFormat::Sha256, &SilentHandler).unwrap();
        let actual = Manifest::generate(&target, ManifestFormat::Sha256, &SilentHandler).unwrap();
        assert_eq!(expected, actual);
    }
}
