//! Configuration types for nzb-triage
//!
//! Two layers mirror the two public calls:
//! - [`TriageConfig`]: everything the triage engine needs for one call
//! - [`RunnerConfig`]: candidate selection and the global time budget, wrapping a
//!   [`TriageConfig`] that is passed through to every engine invocation
//!
//! [`Config`] bundles both and knows how to load itself from the `NZB_TRIAGE_*`
//! environment variables.

use crate::error::{Error, Result};
use crate::utils::{
    normalize_env_value, parse_bool, parse_comma_list, parse_path_list, parse_positive_u64,
    parse_u64,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// NNTP server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default)]
    pub tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Timeout for TCP connect, TLS handshake, greeting and authentication
    #[serde(default = "default_connect_timeout", with = "duration_ms_serde")]
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Plain-text server on the default port without credentials
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            tls: false,
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Settings for a single triage call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriageConfig {
    /// News server to check against; `None` limits triage to manifest parsing
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Maximum simultaneous NNTP connections (default: 60)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum decoded bytes kept per inspected file (default: 32 KiB)
    #[serde(default = "default_max_decoded_bytes")]
    pub max_decoded_bytes: usize,

    /// Segments sampled with STAT per file (default: 2)
    #[serde(default = "default_stat_sample_count")]
    pub stat_sample_count: usize,

    /// Segments fetched with BODY per inspected file (default: 1)
    ///
    /// The first segment is always fetched for header inspection; any extra samples
    /// are spread across the file to confirm the archive body is still retrievable.
    #[serde(default = "default_archive_sample_count")]
    pub archive_sample_count: usize,

    /// Upper bound on files inspected per manifest (default: 8)
    #[serde(default = "default_archive_inspect_limit")]
    pub archive_inspect_limit: usize,

    /// Use the process-wide shared pool when one is available (default: true)
    #[serde(default = "default_true")]
    pub reuse_pool: bool,

    /// Ping interval for idle pooled connections (None = no keep-alive)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub keep_alive: Option<Duration>,

    /// Manifests triaged concurrently within one call (default: 16)
    #[serde(default = "default_max_parallel_nzbs")]
    pub max_parallel_nzbs: usize,

    /// Internal pace for one triage call (default: 35 seconds)
    #[serde(default = "default_time_budget", with = "duration_ms_serde")]
    pub health_check_timeout: Duration,

    /// Extra archive locations handed to the archive classification policy
    #[serde(default)]
    pub archive_dirs: Vec<PathBuf>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            server: None,
            max_connections: default_max_connections(),
            max_decoded_bytes: default_max_decoded_bytes(),
            stat_sample_count: default_stat_sample_count(),
            archive_sample_count: default_archive_sample_count(),
            archive_inspect_limit: default_archive_inspect_limit(),
            reuse_pool: true,
            keep_alive: None,
            max_parallel_nzbs: default_max_parallel_nzbs(),
            health_check_timeout: default_time_budget(),
            archive_dirs: Vec::new(),
        }
    }
}

/// Candidate selection and scheduling settings for one runner invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Global wall-clock budget for the whole invocation (default: 35 seconds)
    #[serde(default = "default_time_budget", with = "duration_ms_serde")]
    pub time_budget: Duration,

    /// Preferred release size; candidates closest to it are checked first
    #[serde(default)]
    pub preferred_size_bytes: Option<u64>,

    /// Indexer ids or names checked before all others (case-insensitive)
    #[serde(default)]
    pub priority_indexers: Vec<String>,

    /// Indexers whose results feed health statistics (accepted, not interpreted)
    #[serde(default)]
    pub health_indexers: Vec<String>,

    /// Indexers whose downloads should be serialised (accepted, not interpreted)
    #[serde(default)]
    pub serialized_indexers: Vec<String>,

    /// Maximum candidates evaluated per invocation (default: 25)
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Concurrent manifest downloads / triage workers (default: 8)
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Timeout for one manifest download (default: 30 seconds)
    #[serde(default = "default_download_timeout", with = "duration_ms_serde")]
    pub download_timeout: Duration,

    /// Whether the caller should start the best verified result early (default: true)
    #[serde(default = "default_true")]
    pub prefetch_first_verified: bool,

    /// Triage settings passed through to every engine invocation
    #[serde(default)]
    pub triage: TriageConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            time_budget: default_time_budget(),
            preferred_size_bytes: None,
            priority_indexers: Vec::new(),
            health_indexers: Vec::new(),
            serialized_indexers: Vec::new(),
            max_candidates: default_max_candidates(),
            download_concurrency: default_download_concurrency(),
            download_timeout: default_download_timeout(),
            prefetch_first_verified: true,
            triage: TriageConfig::default(),
        }
    }
}

/// Top-level configuration for the triage subsystem
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Whether triage runs at all for incoming requests (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Runner settings (the triage settings live inside)
    #[serde(flatten)]
    pub runner: RunnerConfig,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Missing or malformed numeric values fall back to their defaults, matching how
    /// the environment is treated by the rest of the service.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key);
        let num = |key: &str, default: u64| parse_positive_u64(get(key).as_deref(), default);
        let ms = |key: &str, default: Duration| {
            Duration::from_millis(parse_positive_u64(
                get(key).as_deref(),
                default.as_millis() as u64,
            ))
        };

        let server = match get("NZB_TRIAGE_NNTP_HOST")
            .as_deref()
            .map(normalize_env_value)
            .filter(|h| !h.is_empty())
        {
            Some(host) => {
                let port = num("NZB_TRIAGE_NNTP_PORT", u64::from(default_port()));
                let port = u16::try_from(port)
                    .map_err(|_| Error::config("port out of range", "NZB_TRIAGE_NNTP_PORT"))?;
                let credential = |key: &str| {
                    get(key)
                        .as_deref()
                        .map(normalize_env_value)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                };
                Some(ServerConfig {
                    host: host.to_string(),
                    port,
                    tls: parse_bool(get("NZB_TRIAGE_NNTP_TLS").as_deref(), false),
                    username: credential("NZB_TRIAGE_NNTP_USER"),
                    password: credential("NZB_TRIAGE_NNTP_PASS"),
                    connect_timeout: default_connect_timeout(),
                })
            }
            None => None,
        };

        let time_budget = ms("NZB_TRIAGE_TIME_BUDGET_MS", default_time_budget());
        let keep_alive_ms = parse_u64(get("NZB_TRIAGE_NNTP_KEEP_ALIVE_MS").as_deref(), 0);

        let triage = TriageConfig {
            server,
            max_connections: num(
                "NZB_TRIAGE_MAX_CONNECTIONS",
                default_max_connections() as u64,
            ) as usize,
            max_decoded_bytes: num(
                "NZB_TRIAGE_MAX_DECODED_BYTES",
                default_max_decoded_bytes() as u64,
            ) as usize,
            stat_sample_count: num(
                "NZB_TRIAGE_STAT_SAMPLE_COUNT",
                default_stat_sample_count() as u64,
            ) as usize,
            archive_sample_count: num(
                "NZB_TRIAGE_ARCHIVE_SAMPLE_COUNT",
                default_archive_sample_count() as u64,
            ) as usize,
            archive_inspect_limit: num(
                "NZB_TRIAGE_ARCHIVE_INSPECT_LIMIT",
                default_archive_inspect_limit() as u64,
            ) as usize,
            reuse_pool: parse_bool(get("NZB_TRIAGE_REUSE_POOL").as_deref(), true),
            keep_alive: (keep_alive_ms > 0).then(|| Duration::from_millis(keep_alive_ms)),
            max_parallel_nzbs: num(
                "NZB_TRIAGE_MAX_PARALLEL_NZBS",
                default_max_parallel_nzbs() as u64,
            ) as usize,
            health_check_timeout: time_budget,
            archive_dirs: parse_path_list(get("NZB_TRIAGE_ARCHIVE_DIRS").as_deref()),
        };

        let config = Config {
            enabled: parse_bool(get("NZB_TRIAGE_ENABLED").as_deref(), false),
            runner: RunnerConfig {
                time_budget,
                preferred_size_bytes: None,
                priority_indexers: parse_comma_list(
                    get("NZB_TRIAGE_PRIORITY_INDEXERS").as_deref(),
                ),
                health_indexers: parse_comma_list(get("NZB_TRIAGE_HEALTH_INDEXERS").as_deref()),
                serialized_indexers: parse_comma_list(
                    get("NZB_TRIAGE_SERIALIZED_INDEXERS").as_deref(),
                ),
                max_candidates: num(
                    "NZB_TRIAGE_MAX_CANDIDATES",
                    default_max_candidates() as u64,
                ) as usize,
                download_concurrency: num(
                    "NZB_TRIAGE_DOWNLOAD_CONCURRENCY",
                    default_download_concurrency() as u64,
                ) as usize,
                download_timeout: ms("NZB_TRIAGE_DOWNLOAD_TIMEOUT_MS", default_download_timeout()),
                prefetch_first_verified: parse_bool(
                    get("NZB_TRIAGE_PREFETCH_FIRST_VERIFIED").as_deref(),
                    true,
                ),
                triage,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make triage unable to run
    pub fn validate(&self) -> Result<()> {
        self.runner.validate()
    }
}

impl RunnerConfig {
    /// Reject settings that would make the runner unable to make progress
    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(Error::config(
                "max_candidates must be at least 1",
                "max_candidates",
            ));
        }
        if self.download_concurrency == 0 {
            return Err(Error::config(
                "download_concurrency must be at least 1",
                "download_concurrency",
            ));
        }
        self.triage.validate()
    }
}

impl TriageConfig {
    /// Reject settings that would make the engine unable to make progress
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config(
                "max_connections must be at least 1",
                "max_connections",
            ));
        }
        if self.max_parallel_nzbs == 0 {
            return Err(Error::config(
                "max_parallel_nzbs must be at least 1",
                "max_parallel_nzbs",
            ));
        }
        if let Some(server) = &self.server
            && server.host.trim().is_empty()
        {
            return Err(Error::config("server host must not be empty", "server.host"));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    119
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    60
}

fn default_max_decoded_bytes() -> usize {
    32 * 1024
}

fn default_stat_sample_count() -> usize {
    2
}

fn default_archive_sample_count() -> usize {
    1
}

fn default_archive_inspect_limit() -> usize {
    8
}

fn default_max_parallel_nzbs() -> usize {
    16
}

fn default_time_budget() -> Duration {
    Duration::from_millis(35_000)
}

fn default_max_candidates() -> usize {
    25
}

fn default_download_concurrency() -> usize {
    8
}

fn default_download_timeout() -> Duration {
    Duration::from_millis(30_000)
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// Optional Duration serialization helper (milliseconds, 0 or null = None)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
