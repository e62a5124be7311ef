//! Manifest digests: the store's primary key.

use crate::error::{Error, Result};
use crate::format::ManifestFormat;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Digest values for one implementation under one or more manifest formats.
///
/// Each field holds the bare value (without prefix and separator).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ManifestDigest {
    /// SHA-1 of the manifest, hex encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1new: Option<String>,
    /// SHA-256 of the manifest, hex encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// SHA-256 of the manifest, base32 encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256new: Option<String>,
}

impl ManifestDigest {
    /// Create a digest from a single identifier such as `sha256new_ABC...`.
    pub fn from_id(id: &str) -> Result<Self> {
        let mut digest = Self::default();
        digest.parse_id(id)?;
        Ok(digest)
    }

    /// Add the value of an identifier to this digest.
    ///
    /// Existing values are never overwritten.
    pub fn parse_id(&mut self, id: &str) -> Result<()> {
        let format = ManifestFormat::from_id(id)?;
        let value = format.strip_id(id).unwrap_or_default();
        validate_value(id, value)?;

        let slot = self.slot_mut(format);
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
        Ok(())
    }

    /// Get the bare value for a format.
    pub fn get(&self, format: ManifestFormat) -> Option<&str> {
        match format {
            ManifestFormat::Sha1New => self.sha1new.as_deref(),
            ManifestFormat::Sha256 => self.sha256.as_deref(),
            ManifestFormat::Sha256New => self.sha256new.as_deref(),
        }
    }

    fn slot_mut(&mut self, format: ManifestFormat) -> &mut Option<String> {
        match format {
            ManifestFormat::Sha1New => &mut self.sha1new,
            ManifestFormat::Sha256 => &mut self.sha256,
            ManifestFormat::Sha256New => &mut self.sha256new,
        }
    }

    /// All known identifiers, best first.
    pub fn available_digests(&self) -> Vec<String> {
        ManifestFormat::ALL
            .into_iter()
            .filter_map(|format| self.get(format).map(|value| format.id(value)))
            .collect()
    }

    /// The most preferred format with a known value.
    pub fn best_format(&self) -> Option<ManifestFormat> {
        ManifestFormat::ALL
            .into_iter()
            .find(|format| self.get(*format).is_some())
    }

    /// The identifier of the most preferred format with a known value.
    pub fn best(&self) -> Option<String> {
        let format = self.best_format()?;
        self.get(format).map(|value| format.id(value))
    }

    /// Whether no value is known at all.
    pub fn is_empty(&self) -> bool {
        self.best_format().is_none()
    }

    /// Whether two digests agree on every format both know, and share at least one.
    pub fn partial_eq(&self, other: &ManifestDigest) -> bool {
        let mut matches = 0;
        for format in ManifestFormat::ALL {
            match (self.get(format), other.get(format)) {
                (Some(a), Some(b)) if a == b => matches += 1,
                (Some(_), Some(_)) => return false,
                _ => {}
            }
        }
        matches > 0
    }
}

fn validate_value(id: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_digest(format!("Empty digest value in {}", id)));
    }

    if !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::invalid_digest(format!(
            "Digest value must be alphanumeric: {}",
            id
        )));
    }

    Ok(())
}

impl FromStr for ManifestDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_id(s)
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.available_digests();
        if ids.is_empty() {
            f.write_str("(no digest)")
        } else {
            f.write_str(&ids.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id() {
        let digest = ManifestDigest::from_id("sha256new_ABCDEF234567").unwrap();
        assert_eq!(digest.sha256new.as_deref(), Some("ABCDEF234567"));
        assert!(digest.sha256.is_none());
        assert_eq!(digest.best().unwrap(), "sha256new_ABCDEF234567");
    }

    #[test]
    fn test_parse_id_does_not_overwrite() {
        let mut digest = ManifestDigest::from_id("sha1new=abc").unwrap();
        digest.parse_id("sha1new=def").unwrap();
        assert_eq!(digest.sha1new.as_deref(), Some("abc"));
    }

    #[test]
    fn test_best_prefers_strongest() {
        let mut digest = ManifestDigest::from_id("sha1new=abc").unwrap();
        digest.parse_id("sha256=123").unwrap();
        assert_eq!(digest.best().unwrap(), "sha256=123");
        assert_eq!(digest.best_format(), Some(ManifestFormat::Sha256));

        digest.parse_id("sha256new_XYZ").unwrap();
        assert_eq!(
            digest.available_digests(),
            vec!["sha256new_XYZ", "sha256=123", "sha1new=abc"]
        );
    }

    #[test]
    fn test_rejects_invalid_ids() {
        assert!(ManifestDigest::from_id("abc").is_err());
        assert!(ManifestDigest::from_id("sha256=").is_err());
        assert!(ManifestDigest::from_id("sha256=../../etc").is_err());
        assert!(ManifestDigest::from_id("sha256=ab cd").is_err());
        assert!(ManifestDigest::from_id(".tmp-abc").is_err());
    }

    #[test]
    fn test_empty_digest() {
        let digest = ManifestDigest::default();
        assert!(digest.is_empty());
        assert!(digest.best().is_none());
        assert!(digest.available_digests().is_empty());
        assert_eq!(digest.to_string(), "(no digest)");
    }

    #[test]
    fn test_partial_eq() {
        let a = ManifestDigest {
            sha1new: Some("abc".into()),
            sha256: Some("123".into()),
            sha256new: None,
        };
        let b = ManifestDigest::from_id("sha256=123").unwrap();
        let c = ManifestDigest::from_id("sha256=456").unwrap();
        let d = ManifestDigest::from_id("sha256new_XYZ").unwrap();

        assert!(a.partial_eq(&b));
        assert!(!a.partial_eq(&c));
        assert!(!a.partial_eq(&d));
    }

    #[test]
    fn test_serialize_skips_missing() {
        let digest = ManifestDigest::from_id("sha256=123").unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, r#"{"sha256":"123"}"#);
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// The best identifier parses back into an equal digest
        #[test]
        fn prop_best_roundtrip(value in "[A-Z2-7]{1,52}") {
            for format in ManifestFormat::ALL {
                let digest = ManifestDigest::from_id(&format.id(&value))?;
                let reparsed: ManifestDigest = digest.best().unwrap().parse()?;
                prop_assert_eq!(digest, reparsed);
            }
        }

        /// Anything containing a path separator is rejected
        #[test]
        fn prop_rejects_separators(a in "[a-z0-9]{0,8}", b in "[a-z0-9]{0,8}") {
            let id = format!("sha256={}/{}", a, b);
            prop_assert!(ManifestDigest::from_id(&id).is_err());
        }
    }
}
