//! Stashbox CLI - Command line access to bucket/object storage.
//!
//! Copies data between local files (or stdio) and objects of the configured
//! storage provider.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stashbox_storage::facade::DEFAULT_PROVIDER;
use stashbox_storage::{
    create_default_registry, CancellationToken, ProviderConfig, Storage,
};

#[derive(Parser)]
#[command(name = "stashbox")]
#[command(about = "Stashbox - Bucket and object storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with the provider id and its settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage provider id (overrides the config file).
    #[arg(short, long)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file (or stdin) to an object.
    Put {
        /// Bucket name.
        #[arg(short, long)]
        bucket: String,

        /// Object name.
        #[arg(short, long)]
        object: String,

        /// Source file; stdin when omitted or "-".
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Download an object to a file.
    Get {
        /// Bucket name.
        #[arg(short, long)]
        bucket: String,

        /// Object name.
        #[arg(short, long)]
        object: String,

        /// Destination file path.
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Write an object to stdout.
    Cat {
        /// Bucket name.
        #[arg(short, long)]
        bucket: String,

        /// Object name.
        #[arg(short, long)]
        object: String,
    },

    /// List registered storage providers.
    Providers,
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    /// Provider id, e.g. "local" or "gcs".
    #[serde(default)]
    provider: Option<String>,
    /// Provider-specific settings.
    #[serde(default)]
    settings: Value,
}

impl CliConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Provider config, with `provider` taking precedence over the file.
    fn provider_config(self, provider: Option<String>) -> ProviderConfig {
        let id = provider
            .or(self.provider)
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        ProviderConfig::storage(id).with_settings(self.settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides --verbose
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = CliConfig::load(cli.config.as_deref())?;
    let storage = Storage::new(Arc::new(create_default_registry()?));
    let provider_config = config.provider_config(cli.provider);

    if let Commands::Providers = cli.command {
        return cmd_providers(&storage, &provider_config.id);
    }

    storage
        .configure(&provider_config)
        .with_context(|| format!("Failed to configure provider '{}'", provider_config.id))?;

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            canceller.cancel();
        }
    });

    match cli.command {
        Commands::Put {
            bucket,
            object,
            source,
        } => cmd_put(&storage, &bucket, &object, source.as_deref(), &ctx).await,

        Commands::Get {
            bucket,
            object,
            dest,
        } => cmd_get(&storage, &bucket, &object, &dest, &ctx).await,

        Commands::Cat { bucket, object } => cmd_cat(&storage, &bucket, &object, &ctx).await,

        Commands::Providers => Ok(()),
    }
}

/// Upload a file or stdin.
async fn cmd_put(
    storage: &Storage,
    bucket: &str,
    object: &str,
    source: Option<&Path>,
    ctx: &CancellationToken,
) -> Result<()> {
    let mut obj = storage.try_bucket(bucket)?.object(object);
    let writer = obj
        .new_writer(ctx)
        .await
        .with_context(|| format!("Failed to open {}/{} for writing", bucket, object))?;

    let written = match source {
        Some(path) if path != Path::new("-") => {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            tokio::io::copy(&mut file, writer).await
        }
        _ => tokio::io::copy(&mut tokio::io::stdin(), writer).await,
    }
    .context("Failed to write object")?;

    obj.close().await.context("Failed to commit object")?;

    info!("Stored {} bytes in {}/{}", written, bucket, object);
    Ok(())
}

/// Download an object to a file.
async fn cmd_get(
    storage: &Storage,
    bucket: &str,
    object: &str,
    dest: &Path,
    ctx: &CancellationToken,
) -> Result<()> {
    let mut obj = storage.try_bucket(bucket)?.object(object);
    let reader = obj
        .new_reader(ctx)
        .await
        .with_context(|| format!("Failed to open {}/{}", bucket, object))?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let copied = tokio::io::copy(reader, &mut file)
        .await
        .context("Failed to read object")?;
    file.flush().await?;

    obj.close().await?;

    info!("Wrote {} bytes to {}", copied, dest.display());
    Ok(())
}

/// Write an object to stdout.
async fn cmd_cat(
    storage: &Storage,
    bucket: &str,
    object: &str,
    ctx: &CancellationToken,
) -> Result<()> {
    let mut obj = storage.try_bucket(bucket)?.object(object);
    let reader = obj
        .new_reader(ctx)
        .await
        .with_context(|| format!("Failed to open {}/{}", bucket, object))?;

    let mut stdout = tokio::io::stdout();
    tokio::io::copy(reader, &mut stdout)
        .await
        .context("Failed to read object")?;
    stdout.flush().await?;

    obj.close().await?;
    Ok(())
}

/// List registered providers, marking the selected one.
fn cmd_providers(storage: &Storage, selected: &str) -> Result<()> {
    let mut providers = storage.registry().providers();
    providers.sort();

    for id in providers {
        let marker = if id == selected { "*" } else { " " };
        println!("{} {}", marker, id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_selects_local() {
        let config = CliConfig::load(None).unwrap();
        let provider = config.provider_config(None);

        assert_eq!(provider.id, "local");
        assert!(provider.settings.is_null());
    }

    #[test]
    fn test_config_file_and_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "provider": "gcs", "settings": {{ "endpoint": "http://localhost:4443" }} }}"#
        )
        .unwrap();

        let config = CliConfig::load(Some(file.path())).unwrap();
        let provider = config.provider_config(None);
        assert_eq!(provider.id, "gcs");
        assert_eq!(provider.settings["endpoint"], "http://localhost:4443");

        let config = CliConfig::load(Some(file.path())).unwrap();
        let provider = config.provider_config(Some("local".to_string()));
        assert_eq!(provider.id, "local");
    }

    #[test]
    fn test_invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "provider = 'local'").unwrap();

        assert!(CliConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_cli_parses_put() {
        let cli = Cli::try_parse_from([
            "stashbox", "-p", "gcs", "put", "-b", "bucket", "-o", "dir/obj", "-s", "in.bin",
        ])
        .unwrap();

        assert_eq!(cli.provider.as_deref(), Some("gcs"));
        match cli.command {
            Commands::Put {
                bucket,
                object,
                source,
            } => {
                assert_eq!(bucket, "bucket");
                assert_eq!(object, "dir/obj");
                assert_eq!(source, Some(PathBuf::from("in.bin")));
            }
            _ => panic!("expected put"),
        }
    }
}
