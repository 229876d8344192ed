use crate::errors::GatewayError;
use crate::types::{ConfigStatus, GlobalConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Seam to the external configuration database. The gateway only ever asks
/// for the active config of a domain; authoring and versioning live behind
/// the management plane.
#[async_trait]
pub trait ConfigStorage: Send + Sync {
    async fn get_active_config(&self, domain: &str) -> Result<GlobalConfig, GatewayError>;
}

/// File-backed storage: one JSON-or-YAML document per domain under the
/// config directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn read_document(&self, domain: &str) -> Result<GlobalConfig, GatewayError> {
        let mut path = self.dir.join(domain);
        path.set_extension("json");
        if !path.exists() {
            path.set_extension("yaml");
        }
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            GatewayError::Storage(format!("read config for {domain} at {path:?}: {err}"))
        })?;
        let config: GlobalConfig = serde_json::from_str(&raw)
            .or_else(|_| serde_yaml::from_str(&raw))
            .map_err(|err| GatewayError::Storage(format!("parse config for {domain}: {err}")))?;
        Ok(config)
    }
}

#[async_trait]
impl ConfigStorage for FileStorage {
    async fn get_active_config(&self, domain: &str) -> Result<GlobalConfig, GatewayError> {
        let config = self.read_document(domain)?;
        if config.status != ConfigStatus::Active {
            return Err(GatewayError::Storage(format!(
                "config for {domain} is not active"
            )));
        }
        Ok(config)
    }
}

/// In-memory storage used by the test harness and by embedders that manage
/// configs themselves.
#[derive(Default)]
pub struct StaticStorage {
    configs: DashMap<String, GlobalConfig>,
}

impl StaticStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, config: GlobalConfig) {
        self.configs.insert(config.domain.clone(), config);
    }
}

#[async_trait]
impl ConfigStorage for StaticStorage {
    async fn get_active_config(&self, domain: &str) -> Result<GlobalConfig, GatewayError> {
        self.configs
            .get(domain)
            .map(|entry| entry.clone())
            .ok_or_else(|| GatewayError::Storage(format!("no config for domain {domain}")))
    }
}
