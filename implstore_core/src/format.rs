//! Manifest formats: hash algorithm, digest encoding and identifier syntax.

use crate::error::{Error, IoResultExt, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

/// Supported manifest formats, ordered from least to most preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestFormat {
    /// SHA-1 hashes, hex encoded.
    Sha1New,
    /// SHA-256 hashes, hex encoded.
    Sha256,
    /// SHA-256 hashes, manifest digest base32 encoded.
    Sha256New,
}

impl ManifestFormat {
    /// All formats listed from best to worst.
    pub const ALL: [ManifestFormat; 3] = [
        ManifestFormat::Sha256New,
        ManifestFormat::Sha256,
        ManifestFormat::Sha1New,
    ];

    /// The algorithm name used in digest identifiers (e.g. "sha256new").
    pub fn prefix(&self) -> &'static str {
        match self {
            ManifestFormat::Sha1New => "sha1new",
            ManifestFormat::Sha256 => "sha256",
            ManifestFormat::Sha256New => "sha256new",
        }
    }

    /// The character between prefix and value in digest identifiers.
    pub fn separator(&self) -> char {
        match self {
            ManifestFormat::Sha256New => '_',
            _ => '=',
        }
    }

    /// Parse a format from its prefix alone (e.g. "sha256").
    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.prefix() == s)
            .ok_or_else(|| Error::invalid_digest(format!("Unknown algorithm: {}", s)))
    }

    /// Select the format a full digest identifier was produced with.
    pub fn from_id(id: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.strip_id(id).is_some())
            .ok_or_else(|| Error::invalid_digest(format!("No known digest method in {}", id)))
    }

    /// Return the value part of `id` if it was produced with this format.
    pub(crate) fn strip_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        id.strip_prefix(self.prefix())?
            .strip_prefix(self.separator())
    }

    /// Build a full digest identifier from a value.
    pub fn id(&self, value: &str) -> String {
        format!("{}{}{}", self.prefix(), self.separator(), value)
    }

    /// Hash raw content and encode it the way manifest lines embed it.
    pub fn digest_content_bytes(&self, data: &[u8]) -> String {
        hex::encode(self.hash_bytes(data))
    }

    /// Hash content from a reader and encode it the way manifest lines embed it.
    pub fn digest_content<R: Read>(&self, reader: R) -> io::Result<String> {
        Ok(hex::encode(self.hash_reader(reader)?))
    }

    /// Hash the content of a file.
    pub fn digest_file(&self, path: &Path) -> Result<String> {
        let file = std::fs::File::open(path).io_context("opening", path)?;
        self.digest_content(file).io_context("hashing", path)
    }

    /// Hash a serialized manifest and encode the value used in directory names.
    pub fn digest_manifest<R: Read>(&self, reader: R) -> io::Result<String> {
        let hash = self.hash_reader(reader)?;
        Ok(self.encode_manifest_digest(&hash))
    }

    fn encode_manifest_digest(&self, hash: &[u8]) -> String {
        match self {
            ManifestFormat::Sha256New => data_encoding::BASE32_NOPAD.encode(hash),
            _ => hex::encode(hash),
        }
    }

    fn hash_bytes(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ManifestFormat::Sha1New => Sha1::digest(data).to_vec(),
            ManifestFormat::Sha256 | ManifestFormat::Sha256New => Sha256::digest(data).to_vec(),
        }
    }

    fn hash_reader<R: Read>(&self, reader: R) -> io::Result<Vec<u8>> {
        match self {
            ManifestFormat::Sha1New => hash_with::<Sha1, R>(reader),
            ManifestFormat::Sha256 | ManifestFormat::Sha256New => hash_with::<Sha256, R>(reader),
        }
    }
}

fn hash_with<D: Digest + Write, R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut hasher = D::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
