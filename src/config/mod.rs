use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub api_server: ServerConfig,
    pub counter: CounterConfig,
    pub visitor: VisitorConfig,
    pub frontend: FrontendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory holding `counter.txt` and `ip_log.txt` for the file backend
    pub data_dir: String,
    pub database_url: String,
    pub max_connections: u32,
    /// Capacity of the repeat-visitor cache, 0 disables it
    pub cache_entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How repeat visits are recognized. A deployment uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// Visitor identifier plus a time window, backed by the visit log
    Window,
    /// A session cookie flag, no server-side history
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub dedup_mode: DedupMode,
    pub window_secs: i64,
    /// Purge roughly once every `purge_one_in` counted visits (0 = never)
    pub purge_one_in: u32,
    pub session_cookie_name: String,
}

impl CounterConfig {
    pub const DEFAULT_WINDOW_SECS: i64 = 86_400;
    pub const DEFAULT_PURGE_ONE_IN: u32 = 10;
    pub const DEFAULT_SESSION_COOKIE: &'static str = "tally_counted";
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            dedup_mode: DedupMode::Window,
            window_secs: Self::DEFAULT_WINDOW_SECS,
            purge_one_in: Self::DEFAULT_PURGE_ONE_IN,
            session_cookie_name: Self::DEFAULT_SESSION_COOKIE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket address only
    None,
    /// Parse Forwarded / X-Forwarded-For
    Standard,
    /// Trust CF-Connecting-IP
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
    #[serde(default)]
    pub num_trusted_proxies: Option<usize>,
    /// When set, visitor ids are keyed hashes of the client IP
    #[serde(default, skip_serializing)]
    pub id_salt: Option<String>,
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: Vec::new(),
            num_trusted_proxies: None,
            id_salt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Directory of static site files served as the router fallback
    pub static_dir: Option<String>,
    /// Origins allowed to fetch the count; empty or `*` allows any
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match env_or("STORAGE_BACKEND", "file").to_lowercase().as_str() {
            "sqlite" => StorageBackend::Sqlite,
            "postgres" | "postgresql" => StorageBackend::Postgres,
            "file" => StorageBackend::File,
            other => {
                tracing::warn!(
                    "Unknown STORAGE_BACKEND '{other}', falling back to 'file'. Supported values: file, sqlite, postgres"
                );
                StorageBackend::File
            }
        };

        let data_dir = env_or("DATA_DIR", "./data");
        let database_url = env_or("DATABASE_URL", "sqlite://./tally.db?mode=rwc");
        let max_connections = env_or("DATABASE_MAX_CONNECTIONS", "5")
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;
        let cache_entries = env_or("VISITOR_CACHE_ENTRIES", "10000")
            .parse::<u64>()
            .context("VISITOR_CACHE_ENTRIES must be a non-negative integer")?;

        let api_host = env_or("API_HOST", "127.0.0.1");
        let api_port = env_or("API_PORT", "8080")
            .parse::<u16>()
            .context("API_PORT must be a valid port number")?;

        let dedup_mode = match env_or("DEDUP_MODE", "window").to_lowercase().as_str() {
            "window" | "ip" => DedupMode::Window,
            "session" => DedupMode::Session,
            other => {
                tracing::warn!(
                    "Unknown DEDUP_MODE '{other}', falling back to 'window'. Supported values: window, session"
                );
                DedupMode::Window
            }
        };

        let window_secs = env_or("VISIT_WINDOW_SECS", "86400")
            .parse::<i64>()
            .context("VISIT_WINDOW_SECS must be an integer")?;
        if window_secs <= 0 {
            anyhow::bail!("VISIT_WINDOW_SECS must be greater than zero");
        }

        let purge_one_in = env_or("PURGE_ONE_IN", "10")
            .parse::<u32>()
            .context("PURGE_ONE_IN must be a non-negative integer")?;

        let session_cookie_name = env_or("SESSION_COOKIE_NAME", CounterConfig::DEFAULT_SESSION_COOKIE);

        let trusted_proxy_mode =
            match env_or("TRUSTED_PROXY_MODE", "none").to_lowercase().as_str() {
                "none" => TrustedProxyMode::None,
                "standard" => TrustedProxyMode::Standard,
                "cloudflare" => TrustedProxyMode::Cloudflare,
                other => {
                    tracing::warn!(
                        "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                    );
                    TrustedProxyMode::None
                }
            };

        let trusted_proxies = parse_trusted_proxies(&env_or("TRUSTED_PROXIES", ""))?;
        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("NUM_TRUSTED_PROXIES must be a non-negative integer")?;

        let id_salt = std::env::var("VISITOR_ID_SALT")
            .ok()
            .filter(|s| !s.is_empty());

        let static_dir = std::env::var("STATIC_DIR").ok();
        let cors_allowed_origins = parse_list(&env_or("CORS_ALLOWED_ORIGINS", "*"));

        Ok(Config {
            storage: StorageConfig {
                backend,
                data_dir,
                database_url,
                max_connections,
                cache_entries,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            counter: CounterConfig {
                dedup_mode,
                window_secs,
                purge_one_in,
                session_cookie_name,
            },
            visitor: VisitorConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
                id_salt,
            },
            frontend: FrontendConfig {
                static_dir,
                cors_allowed_origins,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated list of CIDR ranges; bare addresses become host routes.
pub fn parse_trusted_proxies(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    parse_list(raw)
        .iter()
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .with_context(|| format!("invalid TRUSTED_PROXIES entry '{entry}'"))
        })
        .collect()
}
