use dropcode::{FsStore, KvStore, MemoryStore, RedeemPolicy};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 1024;
pub const DEFAULT_REDEEM_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Fs(PathBuf),
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Fs(dir) => write!(f, "fs:{}", dir.display()),
            StoreBackend::Memory => f.write_str("memory (not persisted)"),
        }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret for admin endpoints. Unset means admin endpoints refuse.
    pub admin_secret: Option<String>,
    /// Public origin used to build redemption URLs.
    pub site_url: Option<String>,
    pub store: StoreBackend,
    pub redeem_policy: RedeemPolicy,
    pub max_upload_bytes: usize,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_secret", &self.admin_secret.as_ref().map(|_| "<redacted>"))
            .field("site_url", &self.site_url)
            .field("store", &self.store)
            .field("redeem_policy", &self.redeem_policy)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = var("PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let admin_secret = var("ADMIN_SECRET").filter(|s| !s.is_empty());
        let site_url = var("SITE_URL").filter(|s| !s.is_empty());

        let data_dir = var("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        let store = match var("STORE_BACKEND").as_deref().unwrap_or("fs") {
            "fs" => StoreBackend::Fs(PathBuf::from(data_dir)),
            "memory" => StoreBackend::Memory,
            other => anyhow::bail!("Unknown STORE_BACKEND '{}' (expected 'fs' or 'memory')", other),
        };

        let max_attempts = var("REDEEM_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(dropcode::redeem::DEFAULT_MAX_ATTEMPTS);
        let timeout_ms = var("REDEEM_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REDEEM_TIMEOUT_MS);
        let redeem_policy = RedeemPolicy::default()
            .with_max_attempts(max_attempts)
            .with_timeout((timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)));

        let max_upload_mb: usize = var("MAX_UPLOAD_MB")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_MB);

        Ok(Self {
            host,
            port,
            admin_secret,
            site_url,
            store,
            redeem_policy,
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
        })
    }

    pub async fn open_store(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        let store: Arc<dyn KvStore> = match &self.store {
            StoreBackend::Fs(dir) => Arc::new(FsStore::open(dir.clone()).await?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<GatewayConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.admin_secret, None);
        assert_eq!(config.store, StoreBackend::Fs(PathBuf::from("./data")));
        assert_eq!(config.redeem_policy.max_attempts, 3);
        assert_eq!(config.redeem_policy.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_upload_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("ADMIN_SECRET", "hunter2"),
            ("STORE_BACKEND", "memory"),
            ("REDEEM_ATTEMPTS", "5"),
            ("REDEEM_TIMEOUT_MS", "0"),
            ("MAX_UPLOAD_MB", "2"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.admin_secret.as_deref(), Some("hunter2"));
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.redeem_policy.max_attempts, 5);
        assert_eq!(config.redeem_policy.timeout, None);
        assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024);
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_empty_secret_counts_as_unset() {
        let config = config_from(&[("ADMIN_SECRET", "")]).unwrap();
        assert!(config.admin_secret.is_none());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(config_from(&[("STORE_BACKEND", "redis")]).is_err());
    }
}
