//! Named transport configurations and their pools.
//!
//! The manager owns the mapping from a target name to its transport
//! configuration, creates transports and pools on demand, and persists the
//! configuration set as a YAML document restored on load.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, atomic::{AtomicBool, Ordering}},
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::{Mutex, RwLock},
    tracing::info,
};

use crate::{
    Error, HttpAuth, HttpTransport, Result, SshAuth, SshTransport, Transport,
    pool::{ConnectFn, Pool, PoolConfig},
};

/// Declarative transport configuration, one variant per protocol. This is
/// the document shape persisted to disk; values here are config-at-rest.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TransportConfig {
    Ssh {
        host: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inline_key: Option<String>,
    },
    Http {
        base_url: String,
        #[serde(default)]
        auth: HttpAuth,
        #[serde(default = "default_verify_tls")]
        verify_tls: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca_path: Option<PathBuf>,
    },
}

fn default_verify_tls() -> bool {
    true
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfig::Ssh {
                host,
                port,
                user,
                key_file,
                passphrase,
                inline_key,
            } => f
                .debug_struct("Ssh")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("key_file", key_file)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .field("inline_key", &inline_key.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            TransportConfig::Http {
                base_url,
                auth,
                verify_tls,
                ca_path,
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("auth", auth)
                .field("verify_tls", verify_tls)
                .field("ca_path", ca_path)
                .finish(),
        }
    }
}

impl TransportConfig {
    /// Build an unconnected transport for this configuration.
    pub fn build(&self) -> Box<dyn Transport> {
        match self {
            TransportConfig::Ssh {
                host,
                port,
                user,
                key_file,
                passphrase,
                inline_key,
            } => {
                let auth = if let Some(path) = key_file {
                    SshAuth::KeyFile {
                        path: path.clone(),
                        passphrase: passphrase.clone(),
                    }
                } else if let Some(pem) = inline_key {
                    SshAuth::Inline { pem: pem.clone() }
                } else {
                    SshAuth::Agent
                };
                Box::new(SshTransport::new(host.clone(), *port, user.clone(), auth))
            },
            TransportConfig::Http {
                base_url,
                auth,
                verify_tls,
                ca_path,
            } => Box::new(
                HttpTransport::new(base_url.clone(), auth.clone())
                    .with_tls(*verify_tls, ca_path.clone()),
            ),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TransportsFile {
    transports: HashMap<String, TransportConfig>,
}

pub struct TransportManager {
    path: Option<PathBuf>,
    configs: RwLock<HashMap<String, TransportConfig>>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
    pool_config: PoolConfig,
    closed: AtomicBool,
}

impl TransportManager {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            path: None,
            configs: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            pool_config,
            closed: AtomicBool::new(false),
        }
    }

    /// Load the persisted configuration set, or start empty when the file
    /// does not exist yet.
    pub fn load(path: &Path, pool_config: PoolConfig) -> Result<Self> {
        let configs = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let file: TransportsFile = serde_yaml::from_str(&raw)?;
            file.transports
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            configs: RwLock::new(configs),
            pools: Mutex::new(HashMap::new()),
            pool_config,
            closed: AtomicBool::new(false),
        })
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = TransportsFile {
            transports: self.configs.read().await.clone(),
        };
        let raw = serde_yaml::to_string(&file)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Register (or replace) a named configuration and persist the set.
    pub async fn register(&self, name: impl Into<String>, config: TransportConfig) -> Result<()> {
        let name = name.into();
        self.configs.write().await.insert(name.clone(), config);
        // A replaced config invalidates any pool built from the old one.
        if let Some(pool) = self.pools.lock().await.remove(&name) {
            pool.close().await;
        }
        self.save().await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.configs.write().await.remove(name);
        if let Some(pool) = self.pools.lock().await.remove(name) {
            pool.close().await;
        }
        self.save().await
    }

    pub async fn get(&self, name: &str) -> Option<TransportConfig> {
        self.configs.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build an unconnected transport for a named configuration.
    pub async fn transport(&self, name: &str) -> Result<Box<dyn Transport>> {
        let config = self
            .get(name)
            .await
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))?;
        Ok(config.build())
    }

    /// Get or create the pool for a named configuration.
    pub async fn pool(&self, name: &str) -> Result<Arc<Pool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let config = self
            .get(name)
            .await
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))?;

        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }

        let connect: ConnectFn = Arc::new(move || {
            let config = config.clone();
            Box::pin(async move {
                let transport = config.build();
                transport.connect().await?;
                Ok(transport)
            })
        });
        let pool = Arc::new(Pool::new(self.pool_config.clone(), connect));
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Close every pool and forbid creating new ones. Safe to call twice.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools: Vec<Arc<Pool>> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
        info!("transport manager closed");
    }
}
