//! Manifest model: a canonical, line-oriented snapshot of a directory tree.

use crate::digest::ManifestDigest;
use crate::error::{Error, IoResultExt, Result, persist_error};
use crate::format::ManifestFormat;
use crate::generator::ManifestGenerator;
use crate::handler::Handler;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::OnceLock;

/// Name of the manifest file stored inside every implementation directory.
pub const MANIFEST_FILE: &str = ".manifest";

/// A single line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManifestNode {
    /// A directory, named by its full path from the tree root (e.g. `/sub/dir`).
    Directory { full_path: String },
    /// A regular file.
    File {
        digest: String,
        modified_time: i64,
        size: u64,
        name: String,
    },
    /// A file with the executable bit set.
    ExecutableFile {
        digest: String,
        modified_time: i64,
        size: u64,
        name: String,
    },
    /// A symbolic link. Digest and size describe the link target.
    Symlink {
        digest: String,
        size: u64,
        name: String,
    },
}

impl ManifestNode {
    /// Parse a single manifest line (without its trailing newline).
    ///
    /// `line_number` is 1-based and only used for error reporting.
    pub fn parse(line: &str, line_number: usize) -> Result<Self> {
        let malformed = |reason: &str| Error::malformed_manifest(line_number, reason);

        let Some(kind) = line.chars().next() else {
            return Err(malformed("empty line"));
        };

        match kind {
            'D' => {
                let full_path = line
                    .strip_prefix("D ")
                    .ok_or_else(|| malformed("expected 2 fields"))?;
                Ok(ManifestNode::Directory {
                    full_path: full_path.to_string(),
                })
            }
            'F' | 'X' => {
                let parts: Vec<&str> = line.splitn(5, ' ').collect();
                let [_, digest, modified_time, size, name] = parts[..] else {
                    return Err(malformed("expected 5 fields"));
                };
                let digest = digest.to_string();
                let modified_time = modified_time
                    .parse::<i64>()
                    .map_err(|e| malformed(&format!("invalid modification time: {}", e)))?;
                let size = size
                    .parse::<u64>()
                    .map_err(|e| malformed(&format!("invalid size: {}", e)))?;
                let name = name.to_string();

                Ok(if kind == 'F' {
                    ManifestNode::File {
                        digest,
                        modified_time,
                        size,
                        name,
                    }
                } else {
                    ManifestNode::ExecutableFile {
                        digest,
                        modified_time,
                        size,
                        name,
                    }
                })
            }
            'S' => {
                let parts: Vec<&str> = line.splitn(4, ' ').collect();
                let [_, digest, size, name] = parts[..] else {
                    return Err(malformed("expected 4 fields"));
                };
                let size = size
                    .parse::<u64>()
                    .map_err(|e| malformed(&format!("invalid size: {}", e)))?;

                Ok(ManifestNode::Symlink {
                    digest: digest.to_string(),
                    size,
                    name: name.to_string(),
                })
            }
            other => Err(malformed(&format!("unknown node type '{}'", other))),
        }
    }

    /// The entry name, or the full path for directories.
    pub fn name(&self) -> &str {
        match self {
            ManifestNode::Directory { full_path } => full_path,
            ManifestNode::File { name, .. }
            | ManifestNode::ExecutableFile { name, .. }
            | ManifestNode::Symlink { name, .. } => name,
        }
    }

    /// The content digest, if this node has one.
    pub fn digest(&self) -> Option<&str> {
        match self {
            ManifestNode::Directory { .. } => None,
            ManifestNode::File { digest, .. }
            | ManifestNode::ExecutableFile { digest, .. }
            | ManifestNode::Symlink { digest, .. } => Some(digest),
        }
    }

    /// Whether this node is a regular or executable file.
    pub fn is_file(&self) -> bool {
        matches!(
            self,
            ManifestNode::File { .. } | ManifestNode::ExecutableFile { .. }
        )
    }
}

impl fmt::Display for ManifestNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestNode::Directory { full_path } => write!(f, "D {}", full_path),
            ManifestNode::File {
                digest,
                modified_time,
                size,
                name,
            } => write!(f, "F {} {} {} {}", digest, modified_time, size, name),
            ManifestNode::ExecutableFile {
                digest,
                modified_time,
                size,
                name,
            } => write!(f, "X {} {} {} {}", digest, modified_time, size, name),
            ManifestNode::Symlink { digest, size, name } => {
                write!(f, "S {} {} {}", digest, size, name)
            }
        }
    }
}

/// An ordered list of manifest nodes together with the format that produced them.
///
/// Non-directory nodes belong to the most recent preceding directory node,
/// or to the root if there is none.
#[derive(Debug, Clone)]
pub struct Manifest {
    format: ManifestFormat,
    nodes: Vec<ManifestNode>,
    total_size: OnceLock<u64>,
}

impl Manifest {
    /// Create a manifest from nodes in canonical order.
    pub fn new(format: ManifestFormat, nodes: Vec<ManifestNode>) -> Self {
        Self {
            format,
            nodes,
            total_size: OnceLock::new(),
        }
    }

    /// The format used to digest file content.
    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// All nodes in manifest order.
    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the manifest describes an empty directory.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of the sizes of all regular and executable files.
    pub fn total_size(&self) -> u64 {
        *self.total_size.get_or_init(|| {
            self.nodes
                .iter()
                .map(|node| match node {
                    ManifestNode::File { size, .. } | ManifestNode::ExecutableFile { size, .. } => {
                        *size
                    }
                    _ => 0,
                })
                .sum()
        })
    }

    /// Iterate over non-directory nodes paired with the directory they belong to.
    ///
    /// The directory is `""` for the root and a full path like `/sub` otherwise.
    pub fn files(&self) -> Files<'_> {
        Files {
            nodes: self.nodes.iter(),
            directory: "",
        }
    }

    /// Serialize the manifest: one node per line, LF terminated.
    pub fn save<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for node in &self.nodes {
            writeln!(writer, "{}", node)?;
        }
        writer.flush()
    }

    /// Serialize the manifest into a buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.save(&mut buf);
        buf
    }

    /// Write the manifest to `path` atomically and return its digest identifier.
    pub fn save_path(&self, path: &Path) -> Result<String> {
        let bytes = self.to_bytes();

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent).io_context("creating", parent)?;
        temp_file.write_all(&bytes).io_context("writing", path)?;
        temp_file.flush().io_context("writing", path)?;
        temp_file.persist(path).map_err(|e| persist_error(path, e))?;

        Ok(self.digest_bytes(&bytes))
    }

    /// Compute the digest identifier of the serialized manifest.
    pub fn calculate_digest(&self) -> String {
        self.digest_bytes(&self.to_bytes())
    }

    fn digest_bytes(&self, bytes: &[u8]) -> String {
        // Hashing an in-memory buffer cannot fail
        let value = self
            .format
            .digest_manifest(bytes)
            .unwrap_or_default();
        self.format.id(&value)
    }

    /// Parse a manifest produced with `format`.
    pub fn load<R: BufRead>(reader: R, format: ManifestFormat) -> Result<Self> {
        let mut nodes = Vec::new();
        for (index, line) in reader.split(b'\n').enumerate() {
            let line = line.map_err(|e| Error::malformed_manifest(index + 1, e.to_string()))?;
            let line = String::from_utf8(line)
                .map_err(|_| Error::malformed_manifest(index + 1, "invalid UTF-8"))?;
            nodes.push(ManifestNode::parse(&line, index + 1)?);
        }
        Ok(Self::new(format, nodes))
    }

    /// Parse a manifest file produced with `format`.
    pub fn load_path(path: &Path, format: ManifestFormat) -> Result<Self> {
        let file = fs::File::open(path).io_context("opening", path)?;
        Self::load(BufReader::new(file), format)
    }

    /// Compare two manifests line by line.
    ///
    /// Returns `(added, removed)`: lines only in `other`, then lines only in `self`.
    /// File lines are qualified with their directory so equal names in different
    /// directories stay distinct.
    pub fn diff(&self, other: &Manifest) -> (Vec<String>, Vec<String>) {
        let ours = self.qualified_lines();
        let theirs = other.qualified_lines();

        let our_set: HashSet<&String> = ours.iter().collect();
        let their_set: HashSet<&String> = theirs.iter().collect();

        let added = theirs
            .iter()
            .filter(|line| !our_set.contains(line))
            .cloned()
            .collect();
        let removed = ours
            .iter()
            .filter(|line| !their_set.contains(line))
            .cloned()
            .collect();

        (added, removed)
    }

    fn qualified_lines(&self) -> Vec<String> {
        let mut directory = "";
        self.nodes
            .iter()
            .map(|node| match node {
                ManifestNode::Directory { full_path } => {
                    directory = full_path.as_str();
                    node.to_string()
                }
                _ if directory.is_empty() => node.to_string(),
                _ => format!("{} (in {})", node, directory),
            })
            .collect()
    }

    /// Generate a manifest for a directory tree.
    pub fn generate(path: &Path, format: ManifestFormat, handler: &dyn Handler) -> Result<Self> {
        ManifestGenerator::new(path, format)?.run(handler)
    }

    /// Generate a manifest for a directory, store it as `.manifest` inside it and return its digest.
    pub fn create_dot_file(
        path: &Path,
        format: ManifestFormat,
        handler: &dyn Handler,
    ) -> Result<String> {
        let manifest = Self::generate(path, format, handler)?;
        manifest.save_path(&path.join(MANIFEST_FILE))
    }

    /// Compute the digest of a directory under every supported format.
    pub fn create_digest(path: &Path, handler: &dyn Handler) -> Result<ManifestDigest> {
        let mut digest = ManifestDigest::default();
        for format in ManifestFormat::ALL {
            let manifest = Self::generate(path, format, handler)?;
            digest.parse_id(&manifest.calculate_digest())?;
        }
        Ok(digest)
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl Eq for Manifest {}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}", node)?;
        }
        Ok(())
    }
}

/// Iterator over `(directory, node)` pairs returned by [`Manifest::files`].
pub struct Files<'a> {
    nodes: std::slice::Iter<'a, ManifestNode>,
    directory: &'a str,
}

impl<'a> Iterator for Files<'a> {
    type Item = (&'a str, &'a ManifestNode);

    fn next(&mut self) -> Option<Self::Item> {
        for node in self.nodes.by_ref() {
            match node {
                ManifestNode::Directory { full_path } => self.directory = full_path.as_str(),
                _ => return Some((self.directory, node)),
            }
        }
        None
    }
}
