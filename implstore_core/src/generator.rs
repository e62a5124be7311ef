//! Builds a manifest from a directory tree.

use crate::error::Result;
use crate::format::ManifestFormat;
use crate::handler::Handler;
use crate::manifest::{Manifest, ManifestNode};
use crate::walk::{EntryKind, Walker};
use std::path::Path;
use tracing::debug;

/// Generates the manifest of one directory. Consumed by [`ManifestGenerator::run`].
#[derive(Debug)]
pub struct ManifestGenerator {
    walker: Walker,
    format: ManifestFormat,
}

impl ManifestGenerator {
    /// Prepare a manifest generation for `path` using `format`.
    pub fn new(path: &Path, format: ManifestFormat) -> Result<Self> {
        Ok(Self {
            walker: Walker::new(path)?,
            format,
        })
    }

    /// Walk the directory and return the finished manifest.
    pub fn run(self, handler: &dyn Handler) -> Result<Manifest> {
        let format = self.format;
        let mut nodes = Vec::new();

        self.walker
            .walk("Generating manifest", handler, |entry| {
                let node = match &entry.kind {
                    EntryKind::Directory => ManifestNode::Directory {
                        full_path: entry.relative_path.clone(),
                    },
                    EntryKind::File {
                        size,
                        modified_time,
                    } => ManifestNode::File {
                        digest: format.digest_file(&entry.path)?,
                        modified_time: *modified_time,
                        size: *size,
                        name: entry.name.clone(),
                    },
                    EntryKind::ExecutableFile {
                        size,
                        modified_time,
                    } => ManifestNode::ExecutableFile {
                        digest: format.digest_file(&entry.path)?,
                        modified_time: *modified_time,
                        size: *size,
                        name: entry.name.clone(),
                    },
                    EntryKind::Symlink { target } => ManifestNode::Symlink {
                        digest: format.digest_content_bytes(target.as_bytes()),
                        size: target.len() as u64,
                        name: entry.name.clone(),
                    },
                };
                nodes.push(node);
                Ok(())
            })?;

        debug!(root = ?self.walker.root(), %format, nodes = nodes.len(), "Generated manifest");
        Ok(Manifest::new(format, nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SilentHandler;
    use crate::walk::from_unix_time;
    use std::fs;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, secs: i64) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(from_unix_time(secs))
            .unwrap();
    }

    #[test]
    fn test_generate_listing_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("b.txt"), b"b").unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("c.txt"), b"c").unwrap();
        for name in ["a.txt", "b.txt", "sub/c.txt"] {
            set_mtime(&root.join(name), 1_000);
        }

        let manifest = ManifestGenerator::new(root, ManifestFormat::Sha256)
            .unwrap()
            .run(&SilentHandler)
            .unwrap();

        let digest = |data: &[u8]| ManifestFormat::Sha256.digest_content_bytes(data);
        let expected = format!(
            "F {} 1000 1 a.txt\nF {} 1000 1 b.txt\nD /sub\nF {} 1000 1 c.txt\n",
            digest(b"a"),
            digest(b"b"),
            digest(b"c")
        );
        assert_eq!(manifest.to_string(), expected);
        assert_eq!(manifest.total_size(), 3);
    }

    #[test]
    fn test_digest_is_deterministic_and_sensitive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("file"), b"content").unwrap();
        set_mtime(&root.join("file"), 5_000);

        let digest = || {
            Manifest::generate(root, ManifestFormat::Sha256New, &SilentHandler)
                .unwrap()
                .calculate_digest()
        };

        let original = digest();
        assert_eq!(digest(), original);

        // Content change
        fs::write(root.join("file"), b"Content").unwrap();
        set_mtime(&root.join("file"), 5_000);
        let changed_content = digest();
        assert_ne!(changed_content, original);

        // Modification time change
        set_mtime(&root.join("file"), 5_001);
        assert_ne!(digest(), changed_content);

        // Name change
        set_mtime(&root.join("file"), 5_000);
        fs::rename(root.join("file"), root.join("renamed")).unwrap();
        assert_ne!(digest(), changed_content);
    }

    #[test]
    #[cfg(unix)]
    fn test_executable_and_symlink_nodes() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("run"), b"#!/bin/sh").unwrap();
        set_mtime(&root.join("run"), 10);
        std::os::unix::fs::symlink("run", root.join("link")).unwrap();

        let plain = Manifest::generate(root, ManifestFormat::Sha1New, &SilentHandler).unwrap();
        fs::set_permissions(root.join("run"), fs::Permissions::from_mode(0o755)).unwrap();
        let executable = Manifest::generate(root, ManifestFormat::Sha1New, &SilentHandler).unwrap();

        assert_ne!(plain.calculate_digest(), executable.calculate_digest());
        assert_eq!(
            executable.nodes()[0],
            ManifestNode::Symlink {
                digest: ManifestFormat::Sha1New.digest_content_bytes(b"run"),
                size: 3,
                name: "link".to_string(),
            }
        );
        assert!(matches!(
            executable.nodes()[1],
            ManifestNode::ExecutableFile { modified_time: 10, .. }
        ));
    }

    #[test]
    fn test_executable_flag_on_emulated_fs() {
        use crate::flags::{self, XBIT_FILE};

        let temp_dir = TempDir::new().unwrap();
        flags::mark_as_no_unix_fs(temp_dir.path()).unwrap();
        let root = temp_dir.path().join("impl");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("tool"), b"#!/bin/sh").unwrap();
        flags::set(&root.join(XBIT_FILE), Path::new("tool")).unwrap();

        let manifest = Manifest::generate(&root, ManifestFormat::Sha256, &SilentHandler).unwrap();
        assert!(matches!(
            manifest.nodes()[0],
            ManifestNode::ExecutableFile { .. }
        ));

        // Renaming keeps the flag attached to the file
        fs::rename(root.join("tool"), root.join("tool2")).unwrap();
        flags::rename(&root.join(XBIT_FILE), Path::new("tool"), Path::new("tool2")).unwrap();
        let manifest = Manifest::generate(&root, ManifestFormat::Sha256, &SilentHandler).unwrap();
        assert!(matches!(
            &manifest.nodes()[0],
            ManifestNode::ExecutableFile { name, .. } if name == "tool2"
        ));
    }
}
