use crate::models::OutputFormat;
use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Engine configuration, constructed once at startup and shared by
/// reference into the policy, gateway and resize service.
#[derive(Debug, Clone)]
pub struct ResizeConfig {
    /// Largest variant width the engine will produce.
    pub max_resize_width: u32,
    /// Largest original eligible for on-the-fly resizing, in bytes.
    pub max_source_bytes: u64,
    /// Never enlarge an image beyond its source pixel width.
    pub auto_prevent_upscale: bool,
    /// Format served when negotiation is disabled or inconclusive.
    pub preferred_format: OutputFormat,
    /// Negotiate the output format from the client's Accept header.
    pub content_negotiation: bool,
    /// Allow webp as a negotiated output.
    pub webp_enabled: bool,
    /// Allow avif as a negotiated output.
    pub avif_enabled: bool,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            max_resize_width: 1200,
            max_source_bytes: 15 * 1024 * 1024,
            auto_prevent_upscale: true,
            preferred_format: OutputFormat::Original,
            content_negotiation: false,
            webp_enabled: true,
            avif_enabled: false,
        }
    }
}

impl ResizeConfig {
    /// Build from `MEDIA_STORE_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_resize_width: env_parse("MEDIA_STORE_MAX_RESIZE_WIDTH", defaults.max_resize_width)?,
            max_source_bytes: env_parse("MEDIA_STORE_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            auto_prevent_upscale: env_parse(
                "MEDIA_STORE_PREVENT_UPSCALE",
                defaults.auto_prevent_upscale,
            )?,
            preferred_format: match env::var("MEDIA_STORE_PREFERRED_FORMAT") {
                Ok(value) => OutputFormat::parse(&value).with_context(|| {
                    format!("parsing MEDIA_STORE_PREFERRED_FORMAT value `{value}`")
                })?,
                Err(_) => defaults.preferred_format,
            },
            content_negotiation: env_parse(
                "MEDIA_STORE_CONTENT_NEGOTIATION",
                defaults.content_negotiation,
            )?,
            webp_enabled: env_parse("MEDIA_STORE_WEBP", defaults.webp_enabled)?,
            avif_enabled: env_parse("MEDIA_STORE_AVIF", defaults.avif_enabled)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {name}")),
    }
}

/// Binary-level configuration: where the local store lives.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage_dir: String,
    pub database_url: String,
}

/// Command-line + environment configuration for the batch tool.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media store variant pre-generation tool")]
pub struct Args {
    /// Directory where object payloads are stored (overrides MEDIA_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Object key to resize; repeatable
    #[arg(long = "key")]
    pub keys: Vec<String>,

    /// Variant width to generate for every key; repeatable
    #[arg(long = "width")]
    pub widths: Vec<u32>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the
    /// parsed arguments.
    pub fn from_env_and_args() -> Result<(Self, Args)> {
        let args = Args::parse();

        let env_storage =
            env::var("MEDIA_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("MEDIA_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_store.db".into());

        let cfg = Self {
            storage_dir: args.storage_dir.clone().unwrap_or(env_storage),
            database_url: args.database_url.clone().unwrap_or(env_db),
        };

        Ok((cfg, args))
    }
}
