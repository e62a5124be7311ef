mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use implstore_core::{
    ArchiveFileInfo, CompositeStore, DigestMismatch, DirectoryStore, Error, Handler, Manifest,
    ManifestDigest, ManifestFormat, Progress, Store, TarExtractor,
};
use output::{
    AddOutput, AuditOutput, DamagedInfo, DigestOutput, FindOutput, ListOutput, ListTempOutput,
    ManifestOutput, OptimiseOutput, OutputWriter, RemoveOutput, RemoveTempOutput, StoreInfo,
    StoresOutput, VerifyOutput,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Implstore - A content-addressed implementation cache
#[derive(Parser)]
#[command(name = "implstore")]
#[command(about = "Manages implementations verified by manifest digests", long_about = None)]
#[command(version)]
struct Cli {
    /// Store directory; repeat to combine stores (defaults to IMPLSTORE_PATH or ./implementations)
    #[arg(short, long = "store", global = true)]
    stores: Vec<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Never ask questions; damaged implementations are kept
    #[arg(long, global = true)]
    batch: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a directory or an archive to the store
    Add {
        /// Expected manifest digest, e.g. sha256new_ABC...
        digest: String,

        /// Directory or archive to add
        source: PathBuf,

        /// Only extract this subdirectory of the archive
        #[arg(long)]
        extract: Option<String>,

        /// Archive MIME type (guessed from the file name if omitted)
        #[arg(long)]
        mime_type: Option<String>,
    },

    /// Remove implementations from the store
    Remove {
        /// Digests to remove
        #[arg(required = true)]
        digests: Vec<String>,
    },

    /// Check implementations against their digests (all if none given)
    Verify {
        /// Digests to verify
        digests: Vec<String>,
    },

    /// Recheck every implementation and report damaged ones without removing them
    Audit,

    /// Hard-link identical files across implementations
    Optimise,

    /// List all implementations
    List,

    /// List leftover temporary directories
    ListTemp,

    /// Delete leftover temporary directories (all if none given)
    RemoveTemp {
        /// Paths or names as printed by list-temp
        paths: Vec<PathBuf>,
    },

    /// Show the configured stores
    Stores,

    /// Print the path of an implementation
    Find {
        /// Digest to look up
        digest: String,
    },

    /// Print the manifest of a directory
    Manifest {
        /// Directory to describe
        path: PathBuf,

        /// Manifest format
        #[arg(long, default_value = "sha256new")]
        algorithm: String,
    },

    /// Print the manifest digest of a directory
    Digest {
        /// Directory to hash
        path: PathBuf,

        /// Only compute this format (all formats if omitted)
        #[arg(long)]
        algorithm: Option<String>,
    },
}

/// Reports progress through tracing and asks questions on the terminal.
struct CliHandler {
    batch: bool,
}

impl Handler for CliHandler {
    fn report(&self, progress: &Progress<'_>) {
        match progress.total {
            Some(total) => debug!(task = progress.task, done = progress.done, total, "Progress"),
            None => debug!(task = progress.task, done = progress.done, "Progress"),
        }
    }

    fn confirm(&self, question: &str) -> bool {
        if self.batch || !atty::is(atty::Stream::Stdin) {
            return false;
        }

        eprint!("{} [y/N] ", question);
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = OutputWriter::new(cli.json);
    match run(cli, &output) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = result_code(&e);
            output.write_error(&e, code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Exit code for a failed command.
fn result_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::DigestMismatch(_)) => 2,
        Some(Error::NotFound { .. }) => 3,
        Some(Error::AlreadyInStore { .. }) => 4,
        Some(Error::Canceled) => 130,
        _ => 1,
    }
}

fn run(cli: Cli, output: &OutputWriter) -> Result<u8> {
    let handler = CliHandler { batch: cli.batch };

    // Commands that work on plain directories need no store
    match &cli.command {
        Commands::Manifest { path, algorithm } => {
            return cmd_manifest(output, path, algorithm, &handler);
        }
        Commands::Digest { path, algorithm } => {
            return cmd_digest(output, path, algorithm.as_deref(), &handler);
        }
        _ => {}
    }

    let store = open_store(&store_paths(cli.stores))?;

    match cli.command {
        Commands::Add {
            digest,
            source,
            extract,
            mime_type,
        } => cmd_add(output, &store, &digest, &source, extract, mime_type, &handler),
        Commands::Remove { digests } => cmd_remove(output, &store, &digests, &handler),
        Commands::Verify { digests } => cmd_verify(output, &store, &digests, &handler),
        Commands::Audit => cmd_audit(output, &store, &handler),
        Commands::Optimise => cmd_optimise(output, &store, &handler),
        Commands::List => cmd_list(output, &store),
        Commands::ListTemp => cmd_list_temp(output, &store),
        Commands::RemoveTemp { paths } => cmd_remove_temp(output, &store, &paths, &handler),
        Commands::Stores => cmd_stores(output, &store),
        Commands::Find { digest } => cmd_find(output, &store, &digest),
        Commands::Manifest { .. } | Commands::Digest { .. } => Ok(0),
    }
}

/// Store directories: --store flags > IMPLSTORE_PATH > ./implementations.
fn store_paths(flags: Vec<PathBuf>) -> Vec<PathBuf> {
    if !flags.is_empty() {
        return flags;
    }

    if let Some(value) = std::env::var_os("IMPLSTORE_PATH") {
        let paths: Vec<PathBuf> = std::env::split_paths(&value)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        if !paths.is_empty() {
            return paths;
        }
    }

    vec![PathBuf::from("./implementations")]
}

fn open_store(paths: &[PathBuf]) -> Result<CompositeStore> {
    let mut stores: Vec<Box<dyn Store>> = Vec::new();
    let mut last_error = None;

    for path in paths {
        match DirectoryStore::new(path) {
            Ok(store) => {
                debug!(store = %store, "Using store");
                stores.push(Box::new(store));
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Unable to open store, skipping");
                last_error = Some(
                    anyhow::Error::new(e)
                        .context(format!("Failed to open store at {}", path.display())),
                );
            }
        }
    }

    if stores.is_empty()
        && let Some(e) = last_error
    {
        return Err(e);
    }
    Ok(CompositeStore::new(stores))
}

fn parse_digest(id: &str) -> Result<ManifestDigest> {
    ManifestDigest::from_id(id).with_context(|| format!("Invalid digest: {}", id))
}

fn cmd_add(
    output: &OutputWriter,
    store: &CompositeStore,
    digest_str: &str,
    source: &Path,
    extract: Option<String>,
    mime_type: Option<String>,
    handler: &CliHandler,
) -> Result<u8> {
    let digest = parse_digest(digest_str)?;

    let path = if source.is_dir() {
        store
            .add_directory(source, &digest, handler)
            .with_context(|| format!("Failed to add directory: {}", source.display()))?
    } else {
        let mut archive = match mime_type {
            Some(mime_type) => ArchiveFileInfo {
                path: source.to_path_buf(),
                mime_type,
                subdir: None,
                source_name: source.display().to_string(),
            },
            None => ArchiveFileInfo::from_path(source)
                .with_context(|| format!("Unknown archive type: {}", source.display()))?,
        };
        archive.subdir = extract;

        store
            .add_archives(&[archive], &digest, &TarExtractor, handler)
            .with_context(|| format!("Failed to add archive: {}", source.display()))?
    };

    let data = AddOutput {
        success: true,
        result_code: 0,
        digest: digest_str.to_string(),
        path: path.display().to_string(),
    };
    output.write(&data, || format!("{} {}\n", digest_str, path.display()))?;

    Ok(0)
}

fn cmd_remove(
    output: &OutputWriter,
    store: &CompositeStore,
    digests: &[String],
    handler: &CliHandler,
) -> Result<u8> {
    let mut removed = Vec::new();
    let mut not_found = Vec::new();

    for id in digests {
        let digest = parse_digest(id)?;
        if store
            .remove(&digest, handler)
            .with_context(|| format!("Failed to remove {}", id))?
        {
            removed.push(id.clone());
        } else {
            not_found.push(id.clone());
        }
    }

    let code = if not_found.is_empty() { 0 } else { 3 };
    let data = RemoveOutput {
        success: not_found.is_empty(),
        result_code: code,
        removed: removed.clone(),
        not_found: not_found.clone(),
    };
    output.write(&data, || {
        let mut text = String::new();
        for id in &removed {
            text.push_str(&format!("Removed {}\n", id));
        }
        for id in &not_found {
            text.push_str(&format!("Not found: {}\n", id));
        }
        text
    })?;

    Ok(code)
}

fn cmd_verify(
    output: &OutputWriter,
    store: &CompositeStore,
    digests: &[String],
    handler: &CliHandler,
) -> Result<u8> {
    let targets = if digests.is_empty() {
        store
            .list_all()
            .with_context(|| "Failed to list implementations")?
    } else {
        digests
            .iter()
            .map(|id| parse_digest(id))
            .collect::<Result<Vec<_>>>()?
    };

    let mut verified = Vec::new();
    let mut damaged = Vec::new();
    for digest in &targets {
        let id = digest.best().unwrap_or_default();
        match store.verify(digest, handler) {
            Ok(()) => verified.push(id),
            Err(Error::DigestMismatch(mismatch)) => damaged.push(damaged_info(&mismatch)),
            Err(e) => return Err(e).with_context(|| format!("Failed to verify {}", id)),
        }
    }

    let code = if damaged.is_empty() { 0 } else { 2 };
    let data = VerifyOutput {
        success: damaged.is_empty(),
        result_code: code,
        verified: verified.clone(),
        damaged: damaged.clone(),
    };
    output.write(&data, || {
        let mut text = String::new();
        for id in &verified {
            text.push_str(&format!("OK {}\n", id));
        }
        text.push_str(&damaged_text(&damaged));
        text
    })?;

    Ok(code)
}

fn damaged_info(mismatch: &DigestMismatch) -> DamagedInfo {
    let (added, removed) = mismatch.diff().unwrap_or_default();
    DamagedInfo {
        expected_digest: mismatch.expected_digest.clone(),
        actual_digest: mismatch.actual_digest.clone(),
        added,
        removed,
    }
}

fn damaged_text(damaged: &[DamagedInfo]) -> String {
    let mut text = String::new();
    for info in damaged {
        text.push_str(&format!(
            "DAMAGED {} (actual {})\n",
            info.expected_digest, info.actual_digest
        ));
        for line in &info.removed {
            text.push_str(&format!("  - {}\n", line));
        }
        for line in &info.added {
            text.push_str(&format!("  + {}\n", line));
        }
    }
    text
}

fn cmd_audit(output: &OutputWriter, store: &CompositeStore, handler: &CliHandler) -> Result<u8> {
    let damaged: Vec<DamagedInfo> = store
        .audit(handler)
        .with_context(|| "Failed to audit store")?
        .iter()
        .map(damaged_info)
        .collect();

    let code = if damaged.is_empty() { 0 } else { 2 };
    let data = AuditOutput {
        success: damaged.is_empty(),
        result_code: code,
        damaged: damaged.clone(),
    };
    output.write(&data, || {
        if damaged.is_empty() {
            "No problems found\n".to_string()
        } else {
            damaged_text(&damaged)
        }
    })?;

    Ok(code)
}

fn cmd_optimise(output: &OutputWriter, store: &CompositeStore, handler: &CliHandler) -> Result<u8> {
    let saved_bytes = store
        .optimise(handler)
        .with_context(|| "Failed to optimise store")?;

    let data = OptimiseOutput {
        success: true,
        result_code: 0,
        saved_bytes,
    };
    output.write(&data, || format!("Saved {} bytes\n", saved_bytes))?;

    Ok(0)
}

fn cmd_list(output: &OutputWriter, store: &CompositeStore) -> Result<u8> {
    let implementations = store
        .list_all()
        .with_context(|| "Failed to list implementations")?;

    let data = ListOutput {
        success: true,
        result_code: 0,
        implementations: implementations.clone(),
    };
    output.write(&data, || {
        implementations
            .iter()
            .filter_map(|digest| digest.best())
            .map(|id| format!("{}\n", id))
            .collect()
    })?;

    Ok(0)
}

fn cmd_list_temp(output: &OutputWriter, store: &CompositeStore) -> Result<u8> {
    let paths: Vec<String> = store
        .list_all_temp()
        .with_context(|| "Failed to list temporary directories")?
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    let data = ListTempOutput {
        success: true,
        result_code: 0,
        paths: paths.clone(),
    };
    output.write(&data, || paths.iter().map(|p| format!("{}\n", p)).collect())?;

    Ok(0)
}

fn cmd_remove_temp(
    output: &OutputWriter,
    store: &CompositeStore,
    requested: &[PathBuf],
    handler: &CliHandler,
) -> Result<u8> {
    let leftovers = store
        .list_all_temp()
        .with_context(|| "Failed to list temporary directories")?;

    let mut targets = Vec::new();
    let mut not_found = Vec::new();
    if requested.is_empty() {
        targets = leftovers;
    } else {
        for path in requested {
            match resolve_temp(&leftovers, path) {
                Some(found) => targets.push(found.clone()),
                None => not_found.push(path.display().to_string()),
            }
        }
    }

    let mut removed = Vec::new();
    for path in &targets {
        if store
            .remove_temp(path, handler)
            .with_context(|| format!("Failed to remove {}", path.display()))?
        {
            removed.push(path.display().to_string());
        } else {
            not_found.push(path.display().to_string());
        }
    }

    let code = if not_found.is_empty() { 0 } else { 3 };
    let data = RemoveTempOutput {
        success: not_found.is_empty(),
        result_code: code,
        removed: removed.clone(),
        not_found: not_found.clone(),
    };
    output.write(&data, || {
        let mut text = String::new();
        for path in &removed {
            text.push_str(&format!("Removed {}\n", path));
        }
        for path in &not_found {
            text.push_str(&format!("Not found: {}\n", path));
        }
        text
    })?;

    Ok(code)
}

/// Match a user-supplied path or bare directory name against the listed leftovers.
fn resolve_temp<'a>(leftovers: &'a [PathBuf], requested: &Path) -> Option<&'a PathBuf> {
    leftovers.iter().find(|leftover| {
        leftover.as_path() == requested
            || (requested.components().count() == 1 && leftover.file_name() == requested.file_name())
    })
}

fn cmd_stores(output: &OutputWriter, store: &CompositeStore) -> Result<u8> {
    let stores: Vec<StoreInfo> = store
        .stores()
        .iter()
        .filter_map(|child| {
            child.path().map(|path| StoreInfo {
                path: path.display().to_string(),
                kind: child.kind(),
            })
        })
        .collect();

    let data = StoresOutput {
        success: true,
        result_code: 0,
        stores: stores.clone(),
    };
    output.write(&data, || {
        stores
            .iter()
            .map(|s| format!("{:?}: {}\n", s.kind, s.path))
            .collect()
    })?;

    Ok(0)
}

fn cmd_find(output: &OutputWriter, store: &CompositeStore, digest_str: &str) -> Result<u8> {
    let digest = parse_digest(digest_str)?;
    let path = store
        .get_path(&digest)
        .ok_or_else(|| Error::not_found(digest_str))?;

    let data = FindOutput {
        success: true,
        result_code: 0,
        digest: digest_str.to_string(),
        path: path.display().to_string(),
    };
    output.write(&data, || format!("{}\n", path.display()))?;

    Ok(0)
}

fn cmd_manifest(
    output: &OutputWriter,
    path: &Path,
    algorithm: &str,
    handler: &CliHandler,
) -> Result<u8> {
    let format = ManifestFormat::parse(algorithm)
        .with_context(|| format!("Unsupported algorithm: {}", algorithm))?;
    let manifest = Manifest::generate(path, format, handler)
        .with_context(|| format!("Failed to generate manifest for {}", path.display()))?;

    let text = manifest.to_string();
    let data = ManifestOutput {
        success: true,
        result_code: 0,
        digest: manifest.calculate_digest(),
        total_size: manifest.total_size(),
        manifest: text.clone(),
    };
    output.write(&data, || text)?;

    Ok(0)
}

fn cmd_digest(
    output: &OutputWriter,
    path: &Path,
    algorithm: Option<&str>,
    handler: &CliHandler,
) -> Result<u8> {
    let digest = match algorithm {
        Some(algorithm) => {
            let format = ManifestFormat::parse(algorithm)
                .with_context(|| format!("Unsupported algorithm: {}", algorithm))?;
            let id = Manifest::generate(path, format, handler)
                .with_context(|| format!("Failed to hash {}", path.display()))?
                .calculate_digest();
            ManifestDigest::from_id(&id)?
        }
        None => Manifest::create_digest(path, handler)
            .with_context(|| format!("Failed to hash {}", path.display()))?,
    };

    let data = DigestOutput {
        success: true,
        result_code: 0,
        digest: digest.clone(),
    };
    output.write(&data, || {
        digest
            .available_digests()
            .iter()
            .map(|id| format!("{}\n", id))
            .collect()
    })?;

    Ok(0)
}
