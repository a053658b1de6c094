//! Couchbase module configuration: defaults, environment overrides, YAML files.

use crate::command::{CommandRenderer, CredentialStrategy, Invocation, DEFAULT_BUCKET_RAM_QUOTA_MB};
use dbcontainers_common::{ContainerError, InstanceConfig, PortBinding, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "couchbase/server:community-6.5.1";

/// Cluster manager REST port; the bootstrap port of the instance.
pub const REST_PORT: u16 = 8091;
pub const QUERY_PORT: u16 = 8093;
/// Ports SDK clients expect on their default numbers.
pub const PUBLISHED_PORTS: [u16; 7] = [8091, 8092, 8093, 8094, 8095, 8096, 11210];

pub const ENV_PREFIX: &str = "DBCONTAINERS_COUCHBASE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub name: String,
    #[serde(default = "default_bucket_quota")]
    pub ram_quota_mb: u32,
}

fn default_bucket_quota() -> u32 {
    DEFAULT_BUCKET_RAM_QUOTA_MB
}

impl BucketSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ram_quota_mb: DEFAULT_BUCKET_RAM_QUOTA_MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouchbaseConfig {
    pub image: String,
    pub container_name: Option<String>,
    pub username: String,
    pub password: String,
    pub cluster_ram_quota_mb: u32,
    pub index_ram_quota_mb: u32,
    pub services: Vec<String>,
    /// Created once the cluster is initialised.
    pub default_bucket: Option<BucketSpec>,
    pub credentials: CredentialStrategy,
    pub invocation: Invocation,
    pub startup_timeout_secs: u64,
}

impl Default for CouchbaseConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_name: None,
            username: "Administrator".to_string(),
            password: "password".to_string(),
            cluster_ram_quota_mb: 512,
            index_ram_quota_mb: 256,
            services: vec!["data".to_string(), "index".to_string(), "query".to_string()],
            default_bucket: None,
            credentials: CredentialStrategy::Arguments,
            invocation: Invocation::Direct,
            startup_timeout_secs: 120,
        }
    }
}

impl CouchbaseConfig {
    /// Defaults overridden by `DBCONTAINERS_COUCHBASE_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(image) = var("IMAGE") {
            config.image = image;
        }
        if let Some(name) = var("CONTAINER_NAME") {
            config.container_name = Some(name);
        }
        if let Some(username) = var("USERNAME") {
            config.username = username;
        }
        if let Some(password) = var("PASSWORD") {
            config.password = password;
        }
        if let Some(raw) = var("CLUSTER_RAMSIZE") {
            config.cluster_ram_quota_mb = parse_var("CLUSTER_RAMSIZE", &raw)?;
        }
        if let Some(raw) = var("INDEX_RAMSIZE") {
            config.index_ram_quota_mb = parse_var("INDEX_RAMSIZE", &raw)?;
        }
        if let Some(raw) = var("SERVICES") {
            config.services = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(name) = var("DEFAULT_BUCKET") {
            // empty disables
            config.default_bucket = (!name.is_empty()).then(|| BucketSpec::new(&name));
        }
        if let Some(raw) = var("CREDENTIALS") {
            config.credentials = match raw.to_ascii_lowercase().as_str() {
                "arguments" => CredentialStrategy::Arguments,
                "environment" => CredentialStrategy::Environment,
                other => {
                    return Err(ContainerError::Config(format!(
                        "{ENV_PREFIX}CREDENTIALS must be `arguments` or `environment`, got `{other}`"
                    )))
                }
            };
        }
        if let Some(raw) = var("INVOCATION") {
            config.invocation = match raw.to_ascii_lowercase().as_str() {
                "direct" => Invocation::Direct,
                "shell" => Invocation::Shell,
                other => {
                    return Err(ContainerError::Config(format!(
                        "{ENV_PREFIX}INVOCATION must be `direct` or `shell`, got `{other}`"
                    )))
                }
            };
        }
        if let Some(raw) = var("STARTUP_TIMEOUT_SECS") {
            config.startup_timeout_secs = parse_var("STARTUP_TIMEOUT_SECS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ContainerError::Config(format!("invalid Couchbase config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn with_default_bucket(mut self, bucket: BucketSpec) -> Self {
        self.default_bucket = Some(bucket);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialStrategy) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.invocation = invocation;
        self
    }

    /// Rejects configurations the node would refuse during startup anyway.
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(ContainerError::Config("image must not be empty".to_string()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ContainerError::Config(
                "username and password must not be empty".to_string(),
            ));
        }
        if !self.services.iter().any(|s| s == "data") {
            return Err(ContainerError::Config(
                "services must include `data`".to_string(),
            ));
        }
        if let Some(bucket) = &self.default_bucket {
            if bucket.ram_quota_mb > self.cluster_ram_quota_mb {
                return Err(ContainerError::Config(format!(
                    "default bucket quota {} MB exceeds cluster quota {} MB",
                    bucket.ram_quota_mb, self.cluster_ram_quota_mb
                )));
            }
        }
        Ok(())
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn renderer(&self) -> CommandRenderer {
        CommandRenderer::new()
            .with_credentials(self.credentials)
            .with_invocation(self.invocation)
    }

    pub fn instance_config(&self) -> InstanceConfig {
        let mut config = InstanceConfig::new(&self.image, REST_PORT)
            .with_credentials(&self.username, &self.password)
            .with_label("dbcontainers.module", "couchbase");
        for port in PUBLISHED_PORTS {
            config = config.with_port(PortBinding::fixed(port, port));
        }
        if let Some(name) = &self.container_name {
            config = config.with_name(name.clone());
        }
        config
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        ContainerError::Config(format!("{ENV_PREFIX}{name}=`{raw}` is invalid: {e}"))
    })
}
