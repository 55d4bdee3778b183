//! iavl CLI - Command line interface for iavl_db
//!
//! Every invocation opens the database file, applies one command and exits.
//! Mutating commands commit a new version before returning.

use anyhow::Context;
use clap::{Parser, Subcommand};
use iavl_db::{
    verify_proof, ExportNode, FileDb, Hash, ImmutableTree, KvStore, MutableTree, Options, Proof,
};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iavl")]
#[command(about = "A versioned, authenticated key-value store")]
#[command(version)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = "state.iavl")]
    database: PathBuf,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    /// Read keys and values as hex and print them as hex
    #[arg(long)]
    hex: bool,

    /// Options file (defaults to ~/.config/iavl/options.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug events to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new database
    Init,

    // === Write Commands ===
    /// Set one or more keys and commit a new version
    Set {
        /// Pairs in the form key=value
        #[arg(required = true)]
        pairs: Vec<String>,
    },

    /// Remove one or more keys and commit a new version
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Commit a version without changes
    Commit,

    // === Read Commands ===
    /// Get the value of a key
    Get {
        key: String,
        /// Version to read (defaults to latest)
        #[arg(long)]
        version: Option<u64>,
    },

    /// List keys in [start, end)
    Range {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Iterate from the largest key down
        #[arg(long)]
        descending: bool,
        /// Maximum number of entries to return
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        version: Option<u64>,
    },

    // === Proof Commands ===
    /// Produce a proof for a key
    Proof {
        key: String,
        #[arg(long)]
        version: Option<u64>,
    },

    /// Verify a proof file produced by `proof`
    Verify {
        key: String,
        /// Root hash (hex) to verify against
        #[arg(long)]
        root: String,
        /// Path to the proof JSON
        #[arg(long)]
        proof: PathBuf,
    },

    // === Version Commands ===
    /// List available versions
    Versions,

    /// Delete old versions
    Prune {
        /// A single version to delete
        version: Option<u64>,
        /// Delete every version up to and including this one
        #[arg(long, conflicts_with = "version")]
        to: Option<u64>,
    },

    /// Make an older version the latest, deleting everything after it
    Rewind { version: u64 },

    // === Maintenance Commands ===
    /// Print the tree structure
    Dump {
        #[arg(long)]
        version: Option<u64>,
    },

    /// Show database information
    Info,

    /// Export a version as JSON lines
    Export {
        #[arg(long)]
        version: Option<u64>,
        /// Output file
        output: PathBuf,
    },

    /// Import a JSON lines export into an empty database
    Import {
        /// Input file
        input: PathBuf,
        /// Version to commit the imported tree as
        #[arg(long)]
        version: u64,
    },

    /// Rewrite the database file without superseded records
    Compact,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = load_options(cli.config.as_deref())?;
    let codec = Codec { hex: cli.hex };

    match &cli.command {
        Commands::Init => {
            let db = FileDb::create(&cli.database)?;
            db.flush()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Created database at {}", cli.database.display())
                }),
            );
        }

        Commands::Set { pairs } => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            let mut inserted = 0;
            for pair in pairs {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("Expected key=value, got: {}", pair))?;
                if tree.set(codec.decode(key)?, codec.decode(value)?)? {
                    inserted += 1;
                }
            }
            let (hash, version) = tree.save_version()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": version,
                    "hash": hash.to_hex(),
                    "inserted": inserted,
                    "updated": pairs.len() - inserted
                }),
            );
        }

        Commands::Remove { keys } => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            let mut removed = Vec::new();
            for key in keys {
                if tree.remove(&codec.decode(key)?)?.is_some() {
                    removed.push(key.clone());
                }
            }
            let (hash, version) = tree.save_version()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": version,
                    "hash": hash.to_hex(),
                    "removed": removed
                }),
            );
        }

        Commands::Commit => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            let (hash, version) = tree.save_version()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": version,
                    "hash": hash.to_hex()
                }),
            );
        }

        Commands::Get { key, version } => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let snapshot = snapshot_at(&tree, *version)?;
            match snapshot.get(&codec.decode(key)?)? {
                Some(value) => output(
                    &cli.format,
                    &serde_json::json!({
                        "key": key,
                        "value": codec.encode(&value),
                        "version": snapshot.version()
                    }),
                ),
                None => {
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "status": "error",
                            "message": format!("Key not found: {}", key)
                        }),
                    );
                    std::process::exit(1);
                }
            }
        }

        Commands::Range {
            start,
            end,
            descending,
            limit,
            version,
        } => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let snapshot = snapshot_at(&tree, *version)?;
            let start = start.as_deref().map(|s| codec.decode(s)).transpose()?;
            let end = end.as_deref().map(|s| codec.decode(s)).transpose()?;

            let mut entries = Vec::new();
            for item in snapshot
                .range(start.as_deref(), end.as_deref(), !descending)
                .take(limit.unwrap_or(usize::MAX))
            {
                let (key, value) = item?;
                entries.push(serde_json::json!({
                    "key": codec.encode(&key),
                    "value": codec.encode(&value)
                }));
            }
            output(
                &cli.format,
                &serde_json::json!({
                    "version": snapshot.version(),
                    "count": entries.len(),
                    "entries": entries
                }),
            );
        }

        Commands::Proof { key, version } => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let snapshot = snapshot_at(&tree, *version)?;
            let (value, proof) = snapshot.get_with_proof(&codec.decode(key)?)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "key": key,
                    "exists": value.is_some(),
                    "value": value.as_deref().map(|v| codec.encode(v)),
                    "version": snapshot.version(),
                    "root": snapshot.hash().to_hex(),
                    "proof": proof
                }),
            );
        }

        Commands::Verify { key, root, proof } => {
            let root = Hash::from_hex(root).map_err(|_| anyhow::anyhow!("Invalid root hash: {}", root))?;
            let proof = read_proof(proof)?;
            let valid = verify_proof(&root, &codec.decode(key)?, &proof);
            output(
                &cli.format,
                &serde_json::json!({
                    "valid": valid,
                    "exists": proof.is_existence(),
                    "value": proof.value().map(|v| codec.encode(v))
                }),
            );
            if !valid {
                std::process::exit(1);
            }
        }

        Commands::Versions => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let versions = tree.available_versions()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "latest": versions.last(),
                    "versions": versions
                }),
            );
        }

        Commands::Prune { version, to } => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            match (version, to) {
                (Some(version), _) => tree.delete_version(*version)?,
                (None, Some(to)) => tree.delete_versions_to(*to)?,
                (None, None) => anyhow::bail!("Specify a version or --to"),
            }
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "versions": tree.available_versions()?
                }),
            );
        }

        Commands::Rewind { version } => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            let version = tree.load_version_for_overwriting(*version)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": version,
                    "hash": tree.hash().to_hex()
                }),
            );
        }

        Commands::Dump { version } => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let snapshot = snapshot_at(&tree, *version)?;
            let rendered = snapshot.render()?;
            match cli.format {
                OutputFormat::Text => print!("{}", rendered),
                OutputFormat::Json => output(
                    &cli.format,
                    &serde_json::json!({
                        "version": snapshot.version(),
                        "tree": rendered.lines().collect::<Vec<_>>()
                    }),
                ),
            }
        }

        Commands::Info => {
            let (db, tree) = open_tree(&cli.database, &options)?;
            let versions = tree.available_versions()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "path": db.path().display().to_string(),
                    "file_size": db.file_size(),
                    "records": db.len(),
                    "version": tree.version(),
                    "hash": tree.hash().to_hex(),
                    "size": tree.size(),
                    "height": tree.height(),
                    "versions": versions.len(),
                    "oldest_version": versions.first(),
                    "nodes": tree.node_db().node_count()?,
                    "orphans": tree.node_db().orphans()?.len()
                }),
            );
        }

        Commands::Export { version, output: path } => {
            let (_, tree) = open_tree(&cli.database, &options)?;
            let snapshot = snapshot_at(&tree, *version)?;
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            let mut count = 0u64;
            for node in snapshot.export() {
                serde_json::to_writer(&mut writer, &node?)?;
                writer.write_all(b"\n")?;
                count += 1;
            }
            writer.flush()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": snapshot.version(),
                    "nodes": count
                }),
            );
        }

        Commands::Import { input, version } => {
            let (_, mut tree) = open_tree(&cli.database, &options)?;
            let file = std::fs::File::open(input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let mut importer = tree.import(*version)?;
            for line in std::io::BufReader::new(file).lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let node: ExportNode = serde_json::from_str(&line)?;
                importer.add(node)?;
            }
            let hash = importer.commit()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "version": version,
                    "hash": hash.to_hex()
                }),
            );
        }

        Commands::Compact => {
            let (db, _tree) = open_tree(&cli.database, &options)?;
            let before = db.file_size();
            db.compact()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "bytes_before": before,
                    "bytes_after": db.file_size()
                }),
            );
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(path: Option<&Path>) -> anyhow::Result<Options> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Options::default_path()?,
    };
    Ok(Options::load(&path)?)
}

fn open_tree(path: &Path, options: &Options) -> anyhow::Result<(Arc<FileDb>, MutableTree)> {
    let db = Arc::new(FileDb::open_or_create(path)?.with_sync_writes(options.sync_writes));
    let store: Arc<dyn KvStore> = db.clone();
    let tree = MutableTree::open(store, options.clone())?;
    Ok((db, tree))
}

fn snapshot_at(tree: &MutableTree, version: Option<u64>) -> anyhow::Result<ImmutableTree> {
    match version {
        Some(version) => Ok(tree.get_immutable(version)?),
        None => Ok(tree.snapshot()),
    }
}

fn read_proof(path: &Path) -> anyhow::Result<Proof> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    // Accept either a bare proof or the full output of `iavl proof`
    let proof = match value.get("proof") {
        Some(inner) => serde_json::from_value(inner.clone())?,
        None => serde_json::from_value(value)?,
    };
    Ok(proof)
}

/// Converts command-line keys and values to bytes and back
struct Codec {
    hex: bool,
}

impl Codec {
    fn decode(&self, s: &str) -> anyhow::Result<Vec<u8>> {
        if self.hex {
            hex::decode(s).with_context(|| format!("Invalid hex: {}", s))
        } else {
            Ok(s.as_bytes().to_vec())
        }
    }

    fn encode(&self, bytes: &[u8]) -> String {
        if self.hex {
            hex::encode(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn output(format: &OutputFormat, value: &serde_json::Value) {
    match format {
        OutputFormat::Json => {
            println!("{}", value);
        }
        OutputFormat::Text => {
            println!("{:#}", value);
        }
    }
}
