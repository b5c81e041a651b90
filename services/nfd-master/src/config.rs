use anyhow::{Context, Result, bail};
use fleet_store::PostgresConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Label service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NfdMasterConfig {
    // QUIC listener bind address.
    pub bind_addr: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Root authority certificate and key.
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    // Subject name on the server certificate; clients dial this name.
    pub server_name: String,
    // Validity of the server certificate issued at startup.
    pub leaf_validity_secs: u64,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    // Pause between storage liveness probes at startup.
    pub store_retry_interval_ms: u64,
    // Max frame size accepted on QUIC streams.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            other => bail!("unknown storage backend {other:?} (expected memory or postgres)"),
        }
    }
}

const DEFAULT_BIND: &str = "0.0.0.0:8082";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9102";
const DEFAULT_CA_CERT_PATH: &str = "/ca/cert.pem";
const DEFAULT_CA_KEY_PATH: &str = "/ca/key.pem";
const DEFAULT_SERVER_NAME: &str = "nfd-master.openness";
const DEFAULT_STORE_RETRY_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
struct NfdMasterConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    server_name: Option<String>,
    leaf_validity_secs: Option<u64>,
    storage: Option<StorageBackend>,
    postgres: Option<PostgresConfig>,
    store_retry_interval_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

impl NfdMasterConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("NFD_MASTER_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse NFD_MASTER_BIND")?;
        let metrics_bind = std::env::var("NFD_MASTER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse NFD_MASTER_METRICS_BIND")?;
        let ca_cert_path = std::env::var("NFD_MASTER_CA_CERT")
            .unwrap_or_else(|_| DEFAULT_CA_CERT_PATH.to_string())
            .into();
        let ca_key_path = std::env::var("NFD_MASTER_CA_KEY")
            .unwrap_or_else(|_| DEFAULT_CA_KEY_PATH.to_string())
            .into();
        let server_name = std::env::var("NFD_MASTER_SERVER_NAME")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        let leaf_validity_secs = env_u64("NFD_MASTER_LEAF_VALIDITY_SECS")
            .unwrap_or(fleet_pki::DEFAULT_LEAF_VALIDITY.as_secs());
        let storage = match std::env::var("NFD_MASTER_STORE") {
            Ok(value) => value.parse().with_context(|| "parse NFD_MASTER_STORE")?,
            Err(_) => StorageBackend::Memory,
        };
        let postgres = std::env::var("NFD_MASTER_POSTGRES_URL").ok().map(|url| {
            let mut pg = PostgresConfig::new(url);
            if let Some(value) = env_u64("NFD_MASTER_PG_MAX_CONNECTIONS") {
                pg.max_connections = u32::try_from(value).unwrap_or(u32::MAX);
            }
            if let Some(value) = env_u64("NFD_MASTER_PG_ACQUIRE_TIMEOUT_MS") {
                pg.acquire_timeout_ms = value;
            }
            pg
        });
        let store_retry_interval_ms =
            env_u64("NFD_MASTER_STORE_RETRY_MS").unwrap_or(DEFAULT_STORE_RETRY_INTERVAL_MS);
        let max_frame_bytes = env_u64("NFD_MASTER_MAX_FRAME_BYTES")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            bind_addr,
            metrics_bind,
            ca_cert_path,
            ca_key_path,
            server_name,
            leaf_validity_secs,
            storage,
            postgres,
            store_retry_interval_ms,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("NFD_MASTER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read NFD_MASTER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: NfdMasterConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse nfd-master config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.ca_cert_path {
            self.ca_cert_path = value;
        }
        if let Some(value) = override_cfg.ca_key_path {
            self.ca_key_path = value;
        }
        if let Some(value) = override_cfg.server_name.filter(|name| !name.is_empty()) {
            self.server_name = value;
        }
        if let Some(value) = override_cfg.leaf_validity_secs.filter(|secs| *secs > 0) {
            self.leaf_validity_secs = value;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value;
        }
        if let Some(value) = override_cfg.postgres {
            self.postgres = Some(value);
        }
        if let Some(value) = override_cfg.store_retry_interval_ms.filter(|ms| *ms > 0) {
            self.store_retry_interval_ms = value;
        }
        if let Some(value) = override_cfg.max_frame_bytes.filter(|bytes| *bytes > 0) {
            self.max_frame_bytes = value;
        }
        Ok(())
    }

    pub fn leaf_validity(&self) -> Duration {
        Duration::from_secs(self.leaf_validity_secs)
    }

    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "NFD_MASTER_BIND",
        "NFD_MASTER_METRICS_BIND",
        "NFD_MASTER_CA_CERT",
        "NFD_MASTER_CA_KEY",
        "NFD_MASTER_SERVER_NAME",
        "NFD_MASTER_LEAF_VALIDITY_SECS",
        "NFD_MASTER_STORE",
        "NFD_MASTER_POSTGRES_URL",
        "NFD_MASTER_PG_MAX_CONNECTIONS",
        "NFD_MASTER_PG_ACQUIRE_TIMEOUT_MS",
        "NFD_MASTER_STORE_RETRY_MS",
        "NFD_MASTER_MAX_FRAME_BYTES",
        "NFD_MASTER_CONFIG",
    ];

    fn clean_env() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|key| EnvGuard::unset(key)).collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _env = clean_env();
        let config = NfdMasterConfig::from_env().expect("config");
        assert_eq!(config.bind_addr, "0.0.0.0:8082".parse().expect("addr"));
        assert_eq!(config.ca_cert_path, PathBuf::from("/ca/cert.pem"));
        assert_eq!(config.ca_key_path, PathBuf::from("/ca/key.pem"));
        assert_eq!(config.server_name, "nfd-master.openness");
        assert_eq!(config.leaf_validity(), fleet_pki::DEFAULT_LEAF_VALIDITY);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.postgres.is_none());
        assert_eq!(config.store_retry_interval(), Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("NFD_MASTER_BIND", "127.0.0.1:9000");
        let _g2 = EnvGuard::set("NFD_MASTER_STORE", "Postgres");
        let _g3 = EnvGuard::set("NFD_MASTER_POSTGRES_URL", "postgres://db/fleet");
        let _g4 = EnvGuard::set("NFD_MASTER_PG_MAX_CONNECTIONS", "3");
        let _g5 = EnvGuard::set("NFD_MASTER_STORE_RETRY_MS", "250");
        let _g6 = EnvGuard::set("NFD_MASTER_MAX_FRAME_BYTES", "0");
        let config = NfdMasterConfig::from_env().expect("config");
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(config.storage, StorageBackend::Postgres);
        let pg = config.postgres.as_ref().expect("postgres");
        assert_eq!(pg.url, "postgres://db/fleet");
        assert_eq!(pg.max_connections, 3);
        assert_eq!(config.store_retry_interval_ms, 250);
        // Zero is ignored.
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    #[serial]
    fn unknown_backend_is_rejected() {
        let _env = clean_env();
        let _g = EnvGuard::set("NFD_MASTER_STORE", "mysql");
        let err = NfdMasterConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains("unknown storage backend"), "{err:#}");
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _env = clean_env();
        let _g = EnvGuard::set("NFD_MASTER_SERVER_NAME", "from-env");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nfd-master.yaml");
        fs::write(
            &path,
            "bind_addr: 127.0.0.1:7000\n\
             server_name: from-yaml\n\
             storage: postgres\n\
             postgres:\n  url: postgres://yaml/fleet\n\
             leaf_validity_secs: 3600\n",
        )
        .expect("write yaml");
        let _cfg = EnvGuard::set("NFD_MASTER_CONFIG", path.to_str().expect("utf-8 path"));

        let config = NfdMasterConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().expect("addr"));
        assert_eq!(config.server_name, "from-yaml");
        assert_eq!(config.storage, StorageBackend::Postgres);
        let pg = config.postgres.as_ref().expect("postgres");
        assert_eq!(pg.url, "postgres://yaml/fleet");
        assert_eq!(pg.max_connections, fleet_store::postgres::DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.leaf_validity(), Duration::from_secs(3600));
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let _env = clean_env();
        let _cfg = EnvGuard::set("NFD_MASTER_CONFIG", "/nonexistent/nfd-master.yaml");
        let err = NfdMasterConfig::from_env_or_yaml().unwrap_err();
        assert!(err.to_string().contains("read NFD_MASTER_CONFIG"), "{err}");
    }

    #[test]
    fn bad_yaml_address_is_an_error() {
        let mut config = NfdMasterConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            metrics_bind: "127.0.0.1:0".parse().expect("addr"),
            ca_cert_path: "cert.pem".into(),
            ca_key_path: "key.pem".into(),
            server_name: "nfd".to_string(),
            leaf_validity_secs: 60,
            storage: StorageBackend::Memory,
            postgres: None,
            store_retry_interval_ms: 10,
            max_frame_bytes: 1024,
        };
        let err = config.apply_yaml("metrics_bind: nowhere\n").unwrap_err();
        assert!(err.to_string().contains("parse metrics_bind"), "{err}");
    }
}
