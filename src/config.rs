use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use reqwest::Url;
use std::{collections::HashMap, env, fmt, time::Duration};

const ENV_PREFIX: &str = "S3_COPY_PROXY_";

/// Misses are buffered whole in memory, so they are bounded by default.
const DEFAULT_MAX_OBJECT_BYTES: u64 = 1024 * 1024 * 1024;

const KNOWN_REGIONS: [&str; 20] = [
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-central-1",
    "eu-north-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "sa-east-1",
    "ca-central-1",
    "cn-north-1",
    "cn-northwest-1",
    "me-south-1",
    "us-gov-west-1",
    "af-south-1",
];

/// Where cached copies are written.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// A regional S3 bucket.
    S3,
    /// A directory on local disk with SQLite metadata.
    Disk,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::S3 => f.write_str("s3"),
            TargetKind::Disk => f.write_str("disk"),
        }
    }
}

/// Immutable configuration consumed by the request path.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL objects are replicated from.
    pub source: Url,
    /// Name of the target bucket (or disk directory) holding cached copies.
    pub bucket: String,
    /// Prefix joined in front of every request path.
    pub prefix: String,
    pub source_timeout: Option<Duration>,
    pub target_timeout: Option<Duration>,
    /// Largest object a miss may buffer; `None` means no limit.
    pub max_object_bytes: Option<u64>,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub source: Url,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub metadata_url: Option<String>,
    pub target: TargetKind,
    pub endpoint_url: Option<String>,
    pub storage_dir: String,
    pub database_url: String,
    pub source_timeout: Option<Duration>,
    pub target_timeout: Option<Duration>,
    pub max_object_bytes: Option<u64>,
}

/// Command-line + environment configuration.
///
/// Every flag falls back to an `S3_COPY_PROXY_*` environment variable.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Pull-through copy proxy that replicates objects from a remote bucket into a regional one"
)]
pub struct Args {
    /// Where to replicate content from, e.g. https://s3-us-west-2.amazonaws.com/artifacts
    #[arg(long)]
    pub source: Option<String>,

    /// Region the target bucket resides in
    #[arg(long)]
    pub region: Option<String>,

    /// Target bucket name
    #[arg(long)]
    pub bucket: Option<String>,

    /// Prefix to use within the bucket when replicating
    #[arg(long)]
    pub prefix: Option<String>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(long)]
    pub port: Option<u16>,

    /// Instance metadata endpoint; omit on hosts without one
    #[arg(long)]
    pub metadata_url: Option<String>,

    /// Kind of target storage
    #[arg(long, value_enum)]
    pub target: Option<TargetKind>,

    /// Custom endpoint for S3-compatible targets
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// Directory where objects are stored (disk target)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (disk target)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Limit on a single source read, in seconds (0 = none)
    #[arg(long)]
    pub source_timeout_secs: Option<u64>,

    /// Limit on a single target read or write, in seconds (0 = none)
    #[arg(long)]
    pub target_timeout_secs: Option<u64>,

    /// Largest object copied on a miss, in bytes (0 = none, default 1 GiB)
    #[arg(long)]
    pub max_object_bytes: Option<u64>,

    /// Create the disk target's metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let vars: HashMap<String, String> = env::vars().collect();
        let migrate = args.migrate;
        Ok((Self::from_parts(args, &vars)?, migrate))
    }

    /// Merge parsed arguments over environment values. CLI wins.
    pub fn from_parts(args: Args, vars: &HashMap<String, String>) -> Result<Self> {
        let var = |name: &str| {
            vars.get(&format!("{ENV_PREFIX}{name}"))
                .filter(|v| !v.trim().is_empty())
                .cloned()
        };

        let source = args
            .source
            .or_else(|| var("SOURCE"))
            .context("--source (or S3_COPY_PROXY_SOURCE) is required")?;
        let source = Url::parse(&source)
            .with_context(|| format!("parsing source url `{}`", source))?;
        if !matches!(source.scheme(), "http" | "https") {
            bail!("source url must be http or https, got `{}`", source);
        }

        let region = args
            .region
            .or_else(|| var("REGION"))
            .context("--region (or S3_COPY_PROXY_REGION) is required")?
            .to_lowercase();
        if !KNOWN_REGIONS.contains(&region.as_str()) {
            bail!("unknown region {}", region);
        }

        let target = match args.target {
            Some(target) => target,
            None => match var("TARGET") {
                Some(value) => <TargetKind as ValueEnum>::from_str(&value, true)
                    .map_err(|err| anyhow::anyhow!("parsing S3_COPY_PROXY_TARGET: {err}"))?,
                None => TargetKind::S3,
            },
        };

        let bucket = match (args.bucket.or_else(|| var("BUCKET")), target) {
            (Some(bucket), _) => bucket,
            (None, TargetKind::Disk) => "local".to_string(),
            (None, TargetKind::S3) => {
                bail!("--bucket (or S3_COPY_PROXY_BUCKET) is required for the s3 target")
            }
        };

        let port = match args.port {
            Some(port) => port,
            None => match var("PORT") {
                Some(value) => value
                    .parse::<u16>()
                    .with_context(|| format!("parsing S3_COPY_PROXY_PORT value `{}`", value))?,
                None => 8080,
            },
        };

        let source_timeout = timeout(args.source_timeout_secs, var("SOURCE_TIMEOUT_SECS"))
            .context("parsing source timeout")?;
        let target_timeout = timeout(args.target_timeout_secs, var("TARGET_TIMEOUT_SECS"))
            .context("parsing target timeout")?;
        let max_object_bytes = match args.max_object_bytes {
            Some(bytes) => bytes,
            None => match var("MAX_OBJECT_BYTES") {
                Some(value) => value.parse::<u64>().with_context(|| {
                    format!("parsing S3_COPY_PROXY_MAX_OBJECT_BYTES value `{}`", value)
                })?,
                None => DEFAULT_MAX_OBJECT_BYTES,
            },
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            source,
            region,
            bucket,
            prefix: args.prefix.or_else(|| var("PREFIX")).unwrap_or_default(),
            metadata_url: args.metadata_url.or_else(|| var("METADATA_URL")),
            target,
            endpoint_url: args.endpoint_url.or_else(|| var("ENDPOINT_URL")),
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/copy_proxy.db".into()),
            source_timeout,
            target_timeout,
            max_object_bytes: (max_object_bytes > 0).then_some(max_object_bytes),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            source: self.source.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            source_timeout: self.source_timeout,
            target_timeout: self.target_timeout,
            max_object_bytes: self.max_object_bytes,
        }
    }
}

/// Zero seconds means no limit.
fn timeout(flag: Option<u64>, env_value: Option<String>) -> Result<Option<Duration>> {
    let secs = match (flag, env_value) {
        (Some(secs), _) => secs,
        (None, Some(value)) => value
            .parse::<u64>()
            .with_context(|| format!("`{}` is not a number of seconds", value))?,
        (None, None) => 0,
    };
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
