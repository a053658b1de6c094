// Re-export dependencies used in public interfaces of common types

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Docker Error: {0}")]
    Docker(String),

    #[error("Instance Not Started: {0}")]
    NotStarted(String),

    #[error("Exec Error: {0}")]
    Exec(String),

    #[error("Readiness Error: {0}")]
    Readiness(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Startup Error: {0}")]
    Startup(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Define the primary Result type for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Who and where a running instance is, as seen from the test process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub hostname: String,
    /// Host port mapped to the engine's bootstrap port. `0` until started.
    pub exposed_port: u16,
    pub admin_username: String,
    pub admin_password: String,
}

/// A command to run inside an instance, as an argument vector.
///
/// `args[0]` is the program. Nothing here is ever joined into a shell string
/// unless the caller builds a `/bin/sh -c` vector on purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommand {
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` entries for the exec environment.
    #[serde(default)]
    pub env: Vec<String>,
}

impl ExecCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecResult {
    pub fn from_exit_code(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl Display for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecResult(exit_code: {}, stdout: {:?}, stderr: {:?})",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Container port to publish. `host_port: None` asks the engine for an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
}

impl PortBinding {
    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
        }
    }

    pub fn fixed(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port: Some(host_port),
        }
    }
}

// Configuration for one disposable instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// The engine port that `InstanceIdentity::exposed_port` reports.
    pub bootstrap_port: u16,
    pub admin_username: String,
    pub admin_password: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_auto_remove")]
    pub auto_remove: bool,
}

fn default_auto_remove() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(image: impl Into<String>, bootstrap_port: u16) -> Self {
        Self {
            image: image.into(),
            name: None,
            env: Vec::new(),
            ports: vec![PortBinding::ephemeral(bootstrap_port)],
            bootstrap_port,
            admin_username: String::new(),
            admin_password: String::new(),
            labels: HashMap::new(),
            auto_remove: true,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.admin_username = username.to_string();
        self.admin_password = password.to_string();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Adds a binding, replacing any existing one for the same container port.
    pub fn with_port(mut self, binding: PortBinding) -> Self {
        self.ports
            .retain(|p| p.container_port != binding.container_port);
        self.ports.push(binding);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// One running database engine instance that commands can be executed in.
#[async_trait]
pub trait InstanceHandle: Send + Sync {
    /// Current identity. Implementations must not cache a stale copy.
    fn identity(&self) -> InstanceIdentity;

    /// Host port published for `container_port`, if any.
    fn mapped_port(&self, _container_port: u16) -> Option<u16> {
        None
    }

    /// Runs `command` inside the instance and waits for it to exit.
    ///
    /// A non-zero exit code is an `Ok` result; `Err` means the command could
    /// not be run at all.
    async fn exec(&self, command: ExecCommand) -> Result<ExecResult>;
}

#[async_trait]
impl<T> InstanceHandle for Arc<T>
where
    T: InstanceHandle + ?Sized,
{
    fn identity(&self) -> InstanceIdentity {
        (**self).identity()
    }

    fn mapped_port(&self, container_port: u16) -> Option<u16> {
        (**self).mapped_port(container_port)
    }

    async fn exec(&self, command: ExecCommand) -> Result<ExecResult> {
        (**self).exec(command).await
    }
}
