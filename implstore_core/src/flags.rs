//! Flag files: executable bits and symlinks on filesystems that cannot store them.
//!
//! A flag file lists one path per line, each relative to the directory holding
//! the flag file and written Unix-style with a leading slash (`/bin/tool`).
//! The nearest flag file found by searching upward from a directory governs it.

use crate::error::{Error, IoResultExt, Result, persist_error};
use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Flag file listing executable files.
pub const XBIT_FILE: &str = ".xbit";

/// Flag file listing files whose content is a symlink target.
pub const SYMLINK_FILE: &str = ".symlink";

/// Marker file declaring that a directory tree lacks Unix file semantics.
pub const NO_UNIX_FS_FILE: &str = ".no-unix-fs";

/// Header of a Cygwin-style emulated symlink, followed by UTF-16LE text.
const CYGWIN_SYMLINK_HEADER: &[u8] = b"!<symlink>\xff\xfe";

/// Find the closest directory at or above `start` containing a file named `name`.
pub fn find_root_dir(name: &str, start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(name).is_file())
        .map(Path::to_path_buf)
}

/// Get the full paths of all files flagged by the nearest flag file `name`.
///
/// Returns an empty set if no flag file exists at or above `target`.
pub fn get_files(name: &str, target: &Path) -> Result<HashSet<PathBuf>> {
    let Some(flag_dir) = find_root_dir(name, target) else {
        return Ok(HashSet::new());
    };

    let flag_path = flag_dir.join(name);
    let mut files = HashSet::new();
    for line in read_lines(&flag_path)? {
        if let Some(relative) = line.strip_prefix('/') {
            match from_unix_path(relative) {
                Ok(relative) => {
                    files.insert(flag_dir.join(relative));
                }
                Err(e) => warn!(path = ?flag_path, error = %e, "Ignoring flag file entry"),
            }
        }
    }

    debug!(path = ?flag_path, count = files.len(), "Loaded flag file");
    Ok(files)
}

/// Add a relative path to a flag file, creating the file if needed.
pub fn set(flag_file: &Path, relative_path: &Path) -> Result<()> {
    let line = to_unix_path(relative_path)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(flag_file)
        .io_context("opening", flag_file)?;
    writeln!(file, "{}", line).io_context("writing", flag_file)?;

    Ok(())
}

/// Remove a relative path, and everything below it, from a flag file.
pub fn remove(flag_file: &Path, relative_path: &Path) -> Result<()> {
    if !flag_file.exists() {
        return Ok(());
    }

    let removed = to_unix_path(relative_path)?;
    let prefix = format!("{}/", removed);

    let lines = read_lines(flag_file)?
        .into_iter()
        .filter(|line| line.starts_with('/'))
        .filter(|line| *line != removed && !line.starts_with(&prefix))
        .collect::<Vec<_>>();

    write_lines_atomic(flag_file, &lines)
}

/// Rewrite a relative path, and everything below it, in a flag file.
pub fn rename(flag_file: &Path, source: &Path, destination: &Path) -> Result<()> {
    if !flag_file.exists() {
        return Ok(());
    }

    let source = to_unix_path(source)?;
    let destination = to_unix_path(destination)?;
    let prefix = format!("{}/", source);

    let lines = read_lines(flag_file)?
        .into_iter()
        .filter(|line| line.starts_with('/'))
        .map(|line| {
            if line == source || line.starts_with(&prefix) {
                format!("{}{}", destination, &line[source.len()..])
            } else {
                line
            }
        })
        .collect::<Vec<_>>();

    write_lines_atomic(flag_file, &lines)
}

/// Whether the filesystem at `path` can natively store executable bits and symlinks.
///
/// Always false on non-Unix platforms. On Unix a `.no-unix-fs` marker at or above
/// `path` forces emulation.
pub fn is_unix_fs(path: &Path) -> bool {
    cfg!(unix) && find_root_dir(NO_UNIX_FS_FILE, path).is_none()
}

/// Place a `.no-unix-fs` marker in `path`.
pub fn mark_as_no_unix_fs(path: &Path) -> Result<()> {
    let marker = path.join(NO_UNIX_FS_FILE);
    fs::File::create(&marker).io_context("creating", &marker)?;
    Ok(())
}

/// Turn flag files directly inside `path` into real executable bits and symlinks.
///
/// The flag files are deleted afterwards. Does nothing on non-Unix platforms.
#[cfg(unix)]
pub fn convert_to_fs(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let xbit_file = path.join(XBIT_FILE);
    if xbit_file.is_file() {
        for line in read_lines(&xbit_file)? {
            let Some(relative) = line.strip_prefix('/') else {
                continue;
            };
            let relative = from_unix_path(relative)?;
            check_parents(path, &relative)?;
            let target = path.join(relative);
            let metadata = fs::symlink_metadata(&target).io_context("reading", &target)?;
            if metadata.is_file() {
                let mode = metadata.permissions().mode();
                fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o111))
                    .io_context("setting permissions on", &target)?;
            }
        }
        fs::remove_file(&xbit_file).io_context("removing", &xbit_file)?;
    }

    let symlink_file = path.join(SYMLINK_FILE);
    if symlink_file.is_file() {
        for line in read_lines(&symlink_file)? {
            let Some(relative) = line.strip_prefix('/') else {
                continue;
            };
            let relative = from_unix_path(relative)?;
            check_parents(path, &relative)?;
            let link = path.join(&relative);
            let metadata = fs::symlink_metadata(&link).io_context("reading", &link)?;
            if !metadata.is_file() {
                return Err(Error::invalid_path(relative, "flagged symlink is not a plain file"));
            }
            let target = fs::read_to_string(&link).io_context("reading", &link)?;
            fs::remove_file(&link).io_context("removing", &link)?;
            std::os::unix::fs::symlink(&target, &link).io_context("creating symlink", &link)?;
        }
        fs::remove_file(&symlink_file).io_context("removing", &symlink_file)?;
    }

    Ok(())
}

/// Turn flag files directly inside `path` into real executable bits and symlinks.
#[cfg(not(unix))]
pub fn convert_to_fs(_path: &Path) -> Result<()> {
    Ok(())
}

/// Read the target of a Cygwin-style emulated symlink.
///
/// Returns `None` if the file does not carry the symlink header.
pub fn read_cygwin_symlink(path: &Path) -> Result<Option<String>> {
    let mut file = fs::File::open(path).io_context("opening", path)?;

    let mut header = Vec::with_capacity(CYGWIN_SYMLINK_HEADER.len());
    (&mut file)
        .take(CYGWIN_SYMLINK_HEADER.len() as u64)
        .read_to_end(&mut header)
        .io_context("reading", path)?;
    if header != CYGWIN_SYMLINK_HEADER {
        return Ok(None);
    }

    let mut body = Vec::new();
    file.read_to_end(&mut body).io_context("reading", path)?;

    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    let target = String::from_utf16(&units)
        .map_err(|_| Error::invalid_path(path, "emulated symlink target is not valid UTF-16"))?;

    Ok(Some(target))
}

/// Write a Cygwin-style emulated symlink.
pub fn write_cygwin_symlink(path: &Path, target: &str) -> Result<()> {
    let mut data = CYGWIN_SYMLINK_HEADER.to_vec();
    for unit in target.encode_utf16() {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data.extend_from_slice(&[0, 0]);
    fs::write(path, data).io_context("writing", path)
}

/// Convert a relative path into the `/a/b` form used inside flag files.
fn to_unix_path(relative_path: &Path) -> Result<String> {
    let mut unix_path = String::new();
    for component in relative_path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| Error::invalid_path(relative_path, "not valid UTF-8"))?;
                unix_path.push('/');
                unix_path.push_str(part);
            }
            Component::CurDir => {}
            _ => return Err(Error::invalid_path(relative_path, "must be a relative path")),
        }
    }

    if unix_path.is_empty() {
        return Err(Error::invalid_path(relative_path, "path is empty"));
    }

    Ok(unix_path)
}

/// Parse the part of a flag file line after its leading slash.
fn from_unix_path(relative: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for part in relative.split('/').filter(|part| !part.is_empty()) {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => path.push(part),
            _ => return Err(Error::invalid_path(relative, "flag file entry leaves its directory")),
        }
    }

    if path.as_os_str().is_empty() {
        return Err(Error::invalid_path(relative, "path is empty"));
    }
    Ok(path)
}

/// Fail if any directory between `root` and `root/relative` is a symlink.
///
/// The last component is not checked; callers deal with it themselves.
pub(crate) fn check_parents(root: &Path, relative: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(Error::invalid_path(relative, "path leads through a symlink"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path).io_context("opening", path)?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .io_context("reading", path)
}

fn write_lines_atomic(path: &Path, lines: &[String]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = tempfile::NamedTempFile::new_in(parent).io_context("creating", parent)?;
    for line in lines {
        writeln!(temp_file, "{}", line).io_context("writing", path)?;
    }
    temp_file.flush().io_context("writing", path)?;
    temp_file.persist(path).map_err(|e| persist_error(path, e))?;
    Ok(())
}
