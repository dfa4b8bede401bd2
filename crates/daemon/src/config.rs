use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    /// Optional JSON catalog imported at startup.
    pub ports_file: Option<PathBuf>,
    /// Shared API key; requests are accepted without one when unset.
    pub api_token: Option<String>,
    /// Token for the exit-IP geo lookup service.
    pub ipinfo_token: Option<String>,
    pub reconcile_interval: Duration,
    pub expiry_interval: Duration,
    /// How long a reservation may sit unconfirmed before it is reclaimed.
    pub reclaim_grace: Duration,
    pub alert_interval: Duration,
    /// Upstream rents ending within this window trigger an admin notice.
    pub alert_horizon: Duration,
    pub rotation_timeout: Duration,
    /// Overall budget for one exit-IP probe race.
    pub probe_timeout: Duration,
    pub probe_attempts: usize,
    pub probe_url: String,
    pub ipinfo_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3030)),
            db_path: default_db_path(),
            ports_file: None,
            api_token: None,
            ipinfo_token: None,
            reconcile_interval: Duration::from_secs(5),
            expiry_interval: Duration::from_secs(10),
            reclaim_grace: Duration::from_secs(60),
            alert_interval: Duration::from_secs(6 * 60 * 60),
            alert_horizon: Duration::from_secs(12 * 60 * 60),
            rotation_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(60),
            probe_attempts: 5,
            probe_url: "https://v4v6.ipv6-test.com/api/myip.php?json".to_string(),
            ipinfo_url: "https://ipinfo.io".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(addr) = parse_env("PROXYRENT_LISTEN") {
            cfg.listen_addr = addr;
        }
        if let Ok(path) = env::var("PROXYRENT_DB") {
            cfg.db_path = PathBuf::from(path);
        }
        cfg.ports_file = env::var("PROXYRENT_PORTS_FILE").ok().map(PathBuf::from);
        cfg.api_token = non_empty(env::var("PROXYRENT_API_TOKEN").ok());
        cfg.ipinfo_token = non_empty(env::var("IP_INFO_KEY").ok());
        if let Some(secs) = parse_env::<u64>("PROXYRENT_RECLAIM_GRACE_SECONDS") {
            cfg.reclaim_grace = Duration::from_secs(secs);
        }
        if let Ok(url) = env::var("PROXYRENT_PROBE_URL") {
            cfg.probe_url = url;
        }
        cfg
    }
}

/// Default database path (~/.proxyrent/proxy.db).
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".proxyrent")
        .join("proxy.db")
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
