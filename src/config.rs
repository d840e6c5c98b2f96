use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read once from `SLOTGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub resync_interval: Duration,
    /// Full resync every this many resync ticks; stale pools are retried every tick.
    pub full_resync_every: u32,
    pub pools_path: PathBuf,
    /// `host:port` of a RESP counter server. `None` keeps counters in-process.
    pub cache_addr: Option<String>,
    pub cache_prefix: String,
    pub cache_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5434,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotgate".into(),
            max_connections: 256,
            compact_threshold: 1000,
            resync_interval: Duration::from_secs(30),
            full_resync_every: 10,
            pools_path: PathBuf::from("./pools.json"),
            cache_addr: None,
            cache_prefix: "slotgate".into(),
            cache_timeout: Duration::from_millis(500),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let string = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            port: number(&string, "SLOTGATE_PORT").unwrap_or(d.port),
            bind: string("SLOTGATE_BIND").unwrap_or(d.bind),
            data_dir: string("SLOTGATE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: string("SLOTGATE_PASSWORD").unwrap_or(d.password),
            max_connections: number::<usize>(&string, "SLOTGATE_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: number(&string, "SLOTGATE_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            resync_interval: number::<u64>(&string, "SLOTGATE_RESYNC_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.resync_interval),
            full_resync_every: number::<u32>(&string, "SLOTGATE_FULL_RESYNC_EVERY")
                .filter(|n| *n > 0)
                .unwrap_or(d.full_resync_every),
            pools_path: string("SLOTGATE_POOLS").map(PathBuf::from).unwrap_or(d.pools_path),
            cache_addr: string("SLOTGATE_CACHE_ADDR"),
            cache_prefix: string("SLOTGATE_CACHE_PREFIX").unwrap_or(d.cache_prefix),
            cache_timeout: number::<u64>(&string, "SLOTGATE_CACHE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.cache_timeout),
            metrics_port: number(&string, "SLOTGATE_METRICS_PORT"),
            tls_cert: string("SLOTGATE_TLS_CERT").map(PathBuf::from),
            tls_key: string("SLOTGATE_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn number<T: FromStr>(string: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = string(key)?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={value:?}, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.listen_addr(), "0.0.0.0:5434");
        assert_eq!(c.wal_path(), PathBuf::from("./data/ledger.wal"));
        assert!(c.cache_addr.is_none());
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SLOTGATE_PORT", "6000"),
            ("SLOTGATE_RESYNC_SECS", "5"),
            ("SLOTGATE_CACHE_ADDR", "127.0.0.1:6379"),
            ("SLOTGATE_METRICS_PORT", "9100"),
            ("SLOTGATE_POOLS", "/etc/slotgate/pools.json"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.resync_interval, Duration::from_secs(5));
        assert_eq!(c.cache_addr.as_deref(), Some("127.0.0.1:6379"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.pools_path, PathBuf::from("/etc/slotgate/pools.json"));
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("SLOTGATE_PORT", "not-a-port"),
            ("SLOTGATE_MAX_CONNECTIONS", "0"),
            ("SLOTGATE_RESYNC_SECS", "0"),
            ("SLOTGATE_CACHE_ADDR", ""),
        ]);
        assert_eq!(c.port, 5434);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.resync_interval, Duration::from_secs(30));
        assert!(c.cache_addr.is_none());
    }
}
