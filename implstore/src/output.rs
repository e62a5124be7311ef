//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use implstore_core::{ManifestDigest, StoreKind};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// A configured store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub path: String,
    pub kind: StoreKind,
}

/// Output for `stores` command.
#[derive(Debug, Serialize)]
pub struct StoresOutput {
    pub success: bool,
    pub result_code: u8,
    pub stores: Vec<StoreInfo>,
}

/// Output for `add` command.
#[derive(Debug, Serialize)]
pub struct AddOutput {
    pub success: bool,
    pub result_code: u8,
    pub digest: String,
    pub path: String,
}

/// Output for `remove` command.
#[derive(Debug, Serialize)]
pub struct RemoveOutput {
    pub success: bool,
    pub result_code: u8,
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
}

/// A damaged implementation found by `verify`.
#[derive(Debug, Clone, Serialize)]
pub struct DamagedInfo {
    pub expected_digest: String,
    pub actual_digest: String,
    /// Manifest lines present on disk but not recorded.
    pub added: Vec<String>,
    /// Manifest lines recorded but missing on disk.
    pub removed: Vec<String>,
}

/// Output for `verify` command.
#[derive(Debug, Serialize)]
pub struct VerifyOutput {
    pub success: bool,
    pub result_code: u8,
    pub verified: Vec<String>,
    pub damaged: Vec<DamagedInfo>,
}

/// Output for `audit` command.
#[derive(Debug, Serialize)]
pub struct AuditOutput {
    pub success: bool,
    pub result_code: u8,
    pub damaged: Vec<DamagedInfo>,
}

/// Output for `remove-temp` command.
#[derive(Debug, Serialize)]
pub struct RemoveTempOutput {
    pub success: bool,
    pub result_code: u8,
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
}

/// Output for `optimise` command.
#[derive(Debug, Serialize)]
pub struct OptimiseOutput {
    pub success: bool,
    pub result_code: u8,
    pub saved_bytes: u64,
}

/// Output for `list` command.
#[derive(Debug, Serialize)]
pub struct ListOutput {
    pub success: bool,
    pub result_code: u8,
    pub implementations: Vec<ManifestDigest>,
}

/// Output for `list-temp` command.
#[derive(Debug, Serialize)]
pub struct ListTempOutput {
    pub success: bool,
    pub result_code: u8,
    pub paths: Vec<String>,
}

/// Output for `find` command.
#[derive(Debug, Serialize)]
pub struct FindOutput {
    pub success: bool,
    pub result_code: u8,
    pub digest: String,
    pub path: String,
}

/// Output for `manifest` command.
#[derive(Debug, Serialize)]
pub struct ManifestOutput {
    pub success: bool,
    pub result_code: u8,
    pub digest: String,
    pub total_size: u64,
    pub manifest: String,
}

/// Output for `digest` command.
#[derive(Debug, Serialize)]
pub struct DigestOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub digest: ManifestDigest,
}
