//! instadb CLI - Command line interface for instadb
//!
//! Stores and fetches content-addressed blobs and key-value associations in
//! a fixed-size storage file. Each invocation opens the store, runs one
//! command and closes it, so several processes can share the same files.

use anyhow::Context;
use clap::{Parser, Subcommand};
use instadb::{Config, Digest, Engine};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Default storage file size: 64 MiB
const DEFAULT_SIZE: u64 = 64 << 20;

#[derive(Parser)]
#[command(name = "instadb")]
#[command(about = "A content-addressed object store in a fixed-size file")]
#[command(version)]
struct Cli {
    /// Path to the primary storage file
    #[arg(short, long, default_value = "store.instadb")]
    storage_file: PathBuf,

    /// Size in bytes of the storage file and its copies
    #[arg(long, default_value_t = DEFAULT_SIZE)]
    size: u64,

    /// Mirror every write to this file (repeatable)
    #[arg(long = "copy")]
    copies: Vec<PathBuf>,

    /// Search this file after the primary on a miss (repeatable)
    #[arg(long = "read-only")]
    read_only: Vec<PathBuf>,

    /// Load options from a JSON config; --copy and --read-only add to it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

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
    /// Store a file, or stdin with "-", and print its digest
    Store {
        /// Path to read, or "-" for stdin
        input: String,
    },

    /// Fetch an object by digest
    Fetch {
        /// 64 hex character digest
        digest: String,
        /// Return the stored compressed frame instead of the original bytes
        #[arg(long)]
        raw: bool,
        /// Write the bytes to this file instead of printing them
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Associate a value with a key
    Set {
        key: String,
        value: String,
    },

    /// Get the value associated with a key
    Get {
        key: String,
        /// Return the stored compressed frame instead of the value
        #[arg(long)]
        raw: bool,
    },

    /// Show storage file statistics
    Stats,
}

/// What a command produced, and whether it found what it looked for
struct Outcome {
    value: serde_json::Value,
    found: bool,
}

impl Outcome {
    fn ok(value: serde_json::Value) -> Self {
        Outcome { value, found: true }
    }

    fn missing(message: String) -> Self {
        Outcome {
            value: serde_json::json!({
                "status": "error",
                "message": message
            }),
            found: false,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,instadb=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let engine = Engine::open(build_config(&cli)?).context("Failed to open store")?;
    let result = run(&engine, cli.command);
    engine.close()?;

    let outcome = result?;
    output(&cli.format, &outcome.value)?;
    if !outcome.found {
        std::process::exit(1);
    }

    Ok(())
}

fn run(engine: &Engine, command: Commands) -> anyhow::Result<Outcome> {
    let outcome = match command {
        Commands::Store { input } => {
            let data = read_input(&input)?;
            let digest = engine.store(&data)?;
            Outcome::ok(serde_json::json!({
                "status": "ok",
                "digest": digest,
                "size": data.len()
            }))
        }

        Commands::Fetch {
            digest,
            raw,
            output,
        } => match fetch_checked(engine, &digest, raw)? {
            Some(bytes) => match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    Outcome::ok(serde_json::json!({
                        "status": "ok",
                        "digest": digest,
                        "size": bytes.len(),
                        "output": path.display().to_string()
                    }))
                }
                None => Outcome::ok(serde_json::json!({
                    "digest": digest,
                    "size": bytes.len(),
                    "content": String::from_utf8_lossy(&bytes)
                })),
            },
            None => Outcome::missing(format!("Object not found: {}", digest)),
        },

        Commands::Set { key, value } => {
            let committed = engine.associate(key.as_bytes(), value.as_bytes())?;
            Outcome {
                value: serde_json::json!({
                    "status": if committed { "ok" } else { "error" },
                    "key": key,
                    "committed": committed
                }),
                found: committed,
            }
        }

        Commands::Get { key, raw } => match engine.get(key.as_str(), !raw)? {
            Some(bytes) => Outcome::ok(serde_json::json!({
                "key": key,
                "size": bytes.len(),
                "value": String::from_utf8_lossy(&bytes)
            })),
            None => Outcome::missing(format!("Key not found: {}", key)),
        },

        Commands::Stats => Outcome::ok(serde_json::to_value(engine.stats()?)?),
    };

    Ok(outcome)
}

/// Like [`Engine::fetch`], but a malformed digest is a usage error here
fn fetch_checked(engine: &Engine, digest: &str, raw: bool) -> anyhow::Result<Option<bytes::Bytes>> {
    if !Digest::is_digest_shaped(digest) {
        return Err(instadb::Error::InvalidDigest(digest.to_string()).into());
    }
    Ok(engine.fetch(digest, !raw)?)
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::new(&cli.storage_file, cli.size),
    };
    config.storage_copies.extend(cli.copies.iter().cloned());
    config.read_only_files.extend(cli.read_only.iter().cloned());
    Ok(config)
}

fn read_input(input: &str) -> anyhow::Result<Vec<u8>> {
    if input == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .context("Failed to read stdin")?;
        Ok(data)
    } else {
        std::fs::read(input).with_context(|| format!("Failed to read {}", input))
    }
}

fn output(format: &OutputFormat, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::Text => serde_json::to_string_pretty(value)?,
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text)?;
    Ok(())
}
