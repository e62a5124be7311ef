//! Archive extraction into staging directories.
//!
//! Stores do not know archive formats themselves. They take an
//! [`ArchiveExtractor`] from the caller; [`TarExtractor`] handles tarballs.

use crate::error::{Error, IoResultExt, Result};
use crate::flags::{self, SYMLINK_FILE, XBIT_FILE};
use crate::handler::Handler;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// MIME type of uncompressed tarballs.
pub const MIME_TAR: &str = "application/x-tar";

/// MIME type of gzip-compressed tarballs.
pub const MIME_TAR_GZ: &str = "application/x-compressed-tar";

/// An archive to be extracted into an implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFileInfo {
    /// Local path of the archive file.
    pub path: PathBuf,
    /// MIME type selecting the archive format.
    pub mime_type: String,
    /// Only extract entries below this directory inside the archive.
    pub subdir: Option<String>,
    /// Where the archive came from (e.g. a URL), used in error messages.
    pub source_name: String,
}

impl ArchiveFileInfo {
    /// Describe a local archive, guessing its MIME type from the file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mime_type = guess_mime_type(&path).ok_or_else(|| Error::UnsupportedArchive {
            mime_type: path.display().to_string(),
        })?;
        Ok(Self {
            source_name: path.display().to_string(),
            path,
            mime_type: mime_type.to_string(),
            subdir: None,
        })
    }
}

/// Guess the MIME type of an archive from its file name.
pub fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(MIME_TAR_GZ)
    } else if name.ends_with(".tar") {
        Some(MIME_TAR)
    } else {
        None
    }
}

/// Extracts archives into a directory.
pub trait ArchiveExtractor {
    /// Extract `archive` into `target`, overwriting files already present.
    fn extract(&self, archive: &ArchiveFileInfo, target: &Path, handler: &dyn Handler)
    -> Result<()>;
}

/// Extracts plain and gzip-compressed tarballs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarExtractor;

impl ArchiveExtractor for TarExtractor {
    fn extract(
        &self,
        archive: &ArchiveFileInfo,
        target: &Path,
        handler: &dyn Handler,
    ) -> Result<()> {
        let file = File::open(&archive.path).io_context("opening", &archive.path)?;
        let reader: Box<dyn Read> = match archive.mime_type.as_str() {
            MIME_TAR => Box::new(BufReader::new(file)),
            MIME_TAR_GZ => Box::new(GzDecoder::new(BufReader::new(file))),
            other => {
                return Err(Error::UnsupportedArchive {
                    mime_type: other.to_string(),
                });
            }
        };

        debug!(archive = ?archive.path, target = ?target, subdir = ?archive.subdir, "Extracting tarball");

        let target_unix = flags::is_unix_fs(target);
        let mut tarball = tar::Archive::new(reader);
        tarball.set_preserve_mtime(true);

        let entries = tarball.entries().io_context("reading", &archive.path)?;
        for entry in entries {
            handler.check_cancellation()?;
            let mut entry = entry.io_context("reading", &archive.path)?;

            let entry_path = entry.path().io_context("reading", &archive.path)?.into_owned();
            let Some(relative) = strip_subdir(&entry_path, archive.subdir.as_deref())? else {
                continue;
            };
            // Earlier entries may have planted symlinks to redirect later writes
            flags::check_parents(target, &relative)?;
            let destination = target.join(&relative);

            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                if fs::symlink_metadata(&destination).is_ok_and(|m| m.file_type().is_symlink()) {
                    return Err(Error::invalid_path(relative, "directory entry replaces a symlink"));
                }
                fs::create_dir_all(&destination).io_context("creating", &destination)?;
                continue;
            }

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).io_context("creating", parent)?;
            }

            if entry_type.is_hard_link() {
                let link_name = link_name(&entry, &archive.path)?;
                let Some(source) = strip_subdir(&link_name, archive.subdir.as_deref())? else {
                    return Err(Error::invalid_path(link_name, "hard link leaves the extracted directory"));
                };
                flags::check_parents(target, &source)?;
                remove_existing(&destination)?;
                fs::hard_link(target.join(source), &destination)
                    .io_context("linking", &destination)?;
            } else if entry_type.is_symlink() && !target_unix {
                let link_name = link_name(&entry, &archive.path)?;
                let link_target = link_name
                    .to_str()
                    .ok_or_else(|| Error::invalid_path(&link_name, "not valid UTF-8"))?;
                remove_existing(&destination)?;
                fs::write(&destination, link_target).io_context("writing", &destination)?;
                flags::set(&target.join(SYMLINK_FILE), &relative)?;
            } else {
                remove_existing(&destination)?;
                entry.unpack(&destination).io_context("extracting", &destination)?;

                let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                if entry_type.is_file() && executable && !target_unix {
                    flags::set(&target.join(XBIT_FILE), &relative)?;
                }
            }
        }

        Ok(())
    }
}

fn link_name<R: Read>(entry: &tar::Entry<'_, R>, archive: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .io_context("reading", archive)?
        .map(|name| name.into_owned())
        .ok_or_else(|| Error::invalid_path(archive, "link entry without a target"))
}

/// Remove an earlier layer's file so the next layer can replace it.
fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if !metadata.is_dir() => fs::remove_file(path).io_context("removing", path),
        _ => Ok(()),
    }
}

/// Make `path` relative to `subdir`, rejecting anything that escapes the target.
///
/// Returns `None` for entries outside `subdir` and for the subdir itself.
fn strip_subdir(path: &Path, subdir: Option<&str>) -> Result<Option<PathBuf>> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(Error::invalid_path(path, "archive entry escapes the target directory")),
        }
    }

    let relative = match subdir {
        Some(subdir) => {
            let subdir: PathBuf = subdir.split('/').filter(|p| !p.is_empty()).collect();
            match normalized.strip_prefix(&subdir) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => return Ok(None),
            }
        }
        None => normalized,
    };

    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SilentHandler;
    use std::io::Write;
    use tempfile::TempDir;

    fn build_tarball(path: &Path, files: &[(&str, &str, u32)], gzip: bool) {
        let file = File::create(path).unwrap();
        let writer: Box<dyn std::io::Write> = if gzip {
            Box::new(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            ))
        } else {
            Box::new(file)
        };

        let mut builder = tar::Builder::new(writer);
        for (name, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_mtime(1_000_000);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type(Path::new("a.tar.gz")), Some(MIME_TAR_GZ));
        assert_eq!(guess_mime_type(Path::new("a.TGZ")), Some(MIME_TAR_GZ));
        assert_eq!(guess_mime_type(Path::new("a.tar")), Some(MIME_TAR));
        assert_eq!(guess_mime_type(Path::new("a.zip")), None);
    }

    #[test]
    fn test_extract_with_subdir() {
        let temp_dir = TempDir::new().unwrap();
        let tarball = temp_dir.path().join("impl.tar.gz");
        build_tarball(
            &tarball,
            &[
                ("pkg-1.0/bin/tool", "#!/bin/sh", 0o755),
                ("pkg-1.0/README", "read me", 0o644),
                ("other/ignored", "x", 0o644),
            ],
            true,
        );

        let target = temp_dir.path().join("out");
        fs::create_dir(&target).unwrap();

        let mut info = ArchiveFileInfo::from_path(&tarball).unwrap();
        info.subdir = Some("pkg-1.0".to_string());
        TarExtractor.extract(&info, &target, &SilentHandler).unwrap();

        assert_eq!(fs::read(target.join("README")).unwrap(), b"read me");
        assert_eq!(fs::read(target.join("bin").join("tool")).unwrap(), b"#!/bin/sh");
        assert!(!target.join("other").exists());
    }

    #[test]
    fn test_later_layers_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first.tar");
        let second = temp_dir.path().join("second.tar");
        build_tarball(&first, &[("a", "one", 0o644), ("b", "keep", 0o644)], false);
        build_tarball(&second, &[("a", "two", 0o644)], false);

        let target = temp_dir.path().join("out");
        fs::create_dir(&target).unwrap();
        for archive in [&first, &second] {
            let info = ArchiveFileInfo::from_path(archive).unwrap();
            TarExtractor.extract(&info, &target, &SilentHandler).unwrap();
        }

        assert_eq!(fs::read(target.join("a")).unwrap(), b"two");
        assert_eq!(fs::read(target.join("b")).unwrap(), b"keep");
    }

    #[test]
    fn test_unsupported_mime_type() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.zip");
        fs::write(&path, b"PK").unwrap();

        assert!(ArchiveFileInfo::from_path(&path).is_err());

        let info = ArchiveFileInfo {
            path,
            mime_type: "application/zip".to_string(),
            subdir: None,
            source_name: "a.zip".to_string(),
        };
        let result = TarExtractor.extract(&info, temp_dir.path(), &SilentHandler);
        assert!(matches!(result, Err(Error::UnsupportedArchive { .. })));
    }

    #[test]
    fn test_strip_subdir_rejects_escapes() {
        assert!(strip_subdir(Path::new("../evil"), None).is_err());
        assert!(strip_subdir(Path::new("/etc/passwd"), None).is_err());
        assert_eq!(
            strip_subdir(Path::new("./a/b"), Some("a")).unwrap(),
            Some(PathBuf::from("b"))
        );
        assert_eq!(strip_subdir(Path::new("a"), Some("a")).unwrap(), None);
        assert_eq!(strip_subdir(Path::new("ab/c"), Some("a")).unwrap(), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_refuses_writes_through_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir(&outside).unwrap();

        let tarball = temp_dir.path().join("evil.tar");
        {
            let mut builder = tar::Builder::new(File::create(&tarball).unwrap());

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_link_name(&outside).unwrap();
            builder
                .append_data(&mut header, "link", std::io::empty())
                .unwrap();

            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "link/pwned", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let target = temp_dir.path().join("out");
        fs::create_dir(&target).unwrap();
        let info = ArchiveFileInfo::from_path(&tarball).unwrap();
        let result = TarExtractor.extract(&info, &target, &SilentHandler);

        assert!(matches!(result, Err(Error::InvalidPath { .. })));
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_executables_flagged_on_emulated_fs() {
        let temp_dir = TempDir::new().unwrap();
        let tarball = temp_dir.path().join("impl.tar");
        build_tarball(&tarball, &[("tool", "#!/bin/sh", 0o755)], false);

        flags::mark_as_no_unix_fs(temp_dir.path()).unwrap();
        let target = temp_dir.path().join("out");
        fs::create_dir(&target).unwrap();

        let info = ArchiveFileInfo::from_path(&tarball).unwrap();
        TarExtractor.extract(&info, &target, &SilentHandler).unwrap();

        assert_eq!(fs::read_to_string(target.join(XBIT_FILE)).unwrap(), "/tool\n");
    }
}
