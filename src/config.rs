use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::env;

const DEFAULT_BUCKET: &str = "files-api-bucket";
const DEFAULT_REGION: &str = "eu-central-1";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub s3: S3Config,
}

/// Everything the object store client needs to reach the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Named credentials profile; `None` uses the SDK's default chain.
    pub profile: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// AWS S3 or any S3-compatible endpoint.
    S3,
    /// Process-local store; contents vanish on exit.
    Memory,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Files API backed by S3-compatible object storage")]
pub struct Args {
    /// Host to bind to (overrides FILES_API_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILES_API_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket holding the files (overrides FILES_API_S3_BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Bucket region (overrides AWS_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// AWS credentials profile (overrides AWS_PROFILE)
    #[arg(long)]
    pub profile: Option<String>,

    /// S3-compatible endpoint URL (overrides FILES_API_S3_ENDPOINT_URL)
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// Use path-style bucket addressing (overrides FILES_API_S3_FORCE_PATH_STYLE)
    #[arg(long)]
    pub force_path_style: bool,

    /// Storage backend (overrides FILES_API_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Create the bucket if needed and exit
    #[arg(long)]
    pub init_bucket: bool,

    /// Delete every file, then the bucket itself, and exit
    #[arg(long, conflicts_with = "init_bucket")]
    pub delete_bucket: bool,
}

/// What the process does once configuration is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Serve,
    InitBucket,
    DeleteBucket,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let command = if args.init_bucket {
            Command::InitBucket
        } else if args.delete_bucket {
            Command::DeleteBucket
        } else {
            Command::Serve
        };
        let cfg = Self::resolve(args, |name| env::var(name))?;
        Ok((cfg, command))
    }

    /// Merge CLI args over variables looked up through `var`, over defaults.
    pub fn resolve<F>(args: Args, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let lookup = |name: &str| -> Result<Option<String>> {
            match var(name) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        // --- Environment fallback ---
        let env_host = lookup("FILES_API_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match lookup("FILES_API_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing FILES_API_PORT value `{}`", value))?,
            None => 8000,
        };
        let env_bucket = lookup("FILES_API_S3_BUCKET_NAME")?.unwrap_or_else(|| DEFAULT_BUCKET.into());
        let env_region = lookup("AWS_REGION")?.unwrap_or_else(|| DEFAULT_REGION.into());
        let env_profile = lookup("AWS_PROFILE")?;
        let env_endpoint = lookup("FILES_API_S3_ENDPOINT_URL")?;
        let env_path_style = match lookup("FILES_API_S3_FORCE_PATH_STYLE")? {
            Some(value) => parse_flag("FILES_API_S3_FORCE_PATH_STYLE", &value)?,
            None => false,
        };
        let env_backend = match lookup("FILES_API_BACKEND")? {
            Some(value) => Backend::from_str(&value, true)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parsing FILES_API_BACKEND value `{}`", value))?,
            None => Backend::S3,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            s3: S3Config {
                bucket: args.bucket.unwrap_or(env_bucket),
                region: args.region.unwrap_or(env_region),
                profile: args.profile.or(env_profile),
                endpoint_url: args.endpoint_url.or(env_endpoint),
                force_path_style: args.force_path_style || env_path_style,
            },
        };

        if cfg.s3.bucket.is_empty() {
            bail!("bucket name must not be empty");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("parsing {} value `{}`: expected a boolean", name, value),
    }
}
