use std::path::PathBuf;

/// Server settings, read once from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "innkeep".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse().ok());
        Self {
            port: parsed("INNKEEP_PORT").unwrap_or(defaults.port),
            bind: lookup("INNKEEP_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("INNKEEP_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("INNKEEP_PASSWORD").unwrap_or(defaults.password),
            max_connections: lookup("INNKEEP_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_connections),
            compact_threshold: lookup("INNKEEP_COMPACT_THRESHOLD")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("INNKEEP_TLS_CERT"),
            tls_key: lookup("INNKEEP_TLS_KEY"),
            metrics_port: parsed("INNKEEP_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }
}
