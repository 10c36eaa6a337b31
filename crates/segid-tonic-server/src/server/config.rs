use anyhow::{Context, bail};
use clap::Parser;
use core::{str::FromStr, time::Duration};
use segid_tonic_core::{
    segid::{AllocatorConfig, RetryConfig, StepPolicy},
    types::MAX_BATCH_IDS,
};

/// Runtime configuration for the `segid-tonic-server` binary.
///
/// Every option can also be set through the environment variable named in
/// its help text; a `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "segid-tonic-server",
    version,
    about = "A gRPC service for segment-based unique IDs"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/segid.sock"
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Postgres URL of the `business_tag` store. Without it, an in-memory
    /// store seeded from `--seed-tag` is used.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum pooled database connections.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 8)]
    pub db_max_connections: u32,

    /// Tags to create at start-up, as `tag:max_id:step`. Repeatable or
    /// comma-separated. Existing tags are left alone.
    #[arg(long = "seed-tag", env = "SEED_TAGS", value_delimiter = ',')]
    pub seed_tags: Vec<String>,

    /// Fraction of a segment consumed before the next one is prefetched.
    #[arg(long, env = "REFILL_THRESHOLD", default_value_t = 0.1)]
    pub refill_threshold: f64,

    /// How long a request waits for a refill before failing `UNAVAILABLE`.
    #[arg(long, env = "REFILL_WAIT_MS", default_value_t = 500)]
    pub refill_wait_ms: u64,

    /// Upper bound on a single store call.
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 3_000)]
    pub store_timeout_ms: u64,

    /// Retries of a failed store fetch before giving up.
    #[arg(long, env = "STORE_MAX_RETRIES", default_value_t = 3)]
    pub store_max_retries: usize,

    /// Background refill workers.
    #[arg(long, env = "REFILL_WORKERS", default_value_t = 2)]
    pub refill_workers: usize,

    /// Register unknown tags on first use with this step. Unset rejects them.
    #[arg(long, env = "AUTO_REGISTER_STEP")]
    pub auto_register_step: Option<u32>,

    /// Size segments adaptively from how fast they are consumed.
    #[arg(long, env = "ADAPTIVE_STEP", default_value_t = false)]
    pub adaptive_step: bool,

    /// Target lifetime of one segment under `--adaptive-step`.
    #[arg(long, env = "SEGMENT_TTL_SECS", default_value_t = 900)]
    pub segment_ttl_secs: u64,

    /// Largest step `--adaptive-step` may grow to.
    #[arg(long, env = "MAX_STEP", default_value_t = 1_000_000)]
    pub max_step: u32,

    /// Maximum IDs per `AllocateIds` call.
    #[arg(long, env = "MAX_BATCH_IDS", default_value_t = MAX_BATCH_IDS)]
    pub max_batch_ids: u32,

    /// Seconds between tag syncs and snapshot publishes.
    #[arg(long, env = "MAINTENANCE_INTERVAL_SECS", default_value_t = 60)]
    pub maintenance_interval_secs: u64,

    /// Name this instance uses for leader election. Defaults to
    /// `segid-<pid>`.
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Skip loading every known tag at start-up.
    #[arg(long, env = "NO_WARM_UP", default_value_t = false)]
    pub no_warm_up: bool,

    /// Seconds each refill worker gets to acknowledge shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

/// A tag created at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSeed {
    pub tag: String,
    pub max_id: i64,
    pub step: u32,
}

impl FromStr for TagSeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().rsplitn(3, ':');
        let (Some(step), Some(max_id), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("seed tag `{s}` must look like `tag:max_id:step`");
        };
        Ok(Self {
            tag: tag.to_owned(),
            max_id: max_id
                .parse()
                .with_context(|| format!("invalid max_id in seed tag `{s}`"))?,
            step: step
                .parse()
                .with_context(|| format!("invalid step in seed tag `{s}`"))?,
        })
    }
}

/// Where segments are reserved.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory,
    Postgres { url: String, max_connections: u32 },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub backend: StoreBackend,
    pub seed_tags: Vec<TagSeed>,
    pub allocator: AllocatorConfig,
    pub max_batch_ids: u32,
    pub maintenance_interval: Duration,
    pub instance_id: String,
    pub warm_up: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_batch_ids == 0 {
            bail!("MAX_BATCH_IDS must be greater than 0");
        }
        if args.maintenance_interval_secs == 0 {
            bail!("MAINTENANCE_INTERVAL_SECS must be greater than 0");
        }

        let backend = match args.database_url {
            Some(_) if cfg!(not(feature = "postgres")) => {
                bail!("DATABASE_URL is set but this build lacks the `postgres` feature")
            }
            Some(url) => StoreBackend::Postgres {
                url,
                max_connections: args.db_max_connections,
            },
            None => StoreBackend::Memory,
        };

        let seed_tags = args
            .seed_tags
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse())
            .collect::<anyhow::Result<Vec<TagSeed>>>()?;

        let allocator = AllocatorConfig {
            refill_threshold: args.refill_threshold,
            refill_wait: Duration::from_millis(args.refill_wait_ms),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            retry: RetryConfig {
                max_retries: args.store_max_retries,
                ..RetryConfig::default()
            },
            refill_workers: args.refill_workers,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            auto_register_step: args.auto_register_step,
            step_policy: args.adaptive_step.then(|| StepPolicy {
                segment_ttl: Duration::from_secs(args.segment_ttl_secs),
                max_step: args.max_step,
            }),
        };
        allocator
            .validate()
            .context("invalid allocator configuration")?;

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            backend,
            seed_tags,
            allocator,
            max_batch_ids: args.max_batch_ids,
            maintenance_interval: Duration::from_secs(args.maintenance_interval_secs),
            instance_id: args
                .instance_id
                .unwrap_or_else(|| format!("segid-{}", std::process::id())),
            warm_up: !args.no_warm_up,
        })
    }
}
