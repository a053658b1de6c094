//! Renders administrative intents into `couchbase-cli` argument vectors.

use dbcontainers_common::{ExecCommand, InstanceIdentity};
use serde::{Deserialize, Serialize};

/// Administration tool inside the official Couchbase Server images.
pub const COUCHBASE_CLI: &str = "/opt/couchbase/bin/couchbase-cli";

/// REST address of the node as seen from inside its own container.
pub const LOOPBACK_ADMIN_ADDRESS: &str = "127.0.0.1:8091";

pub const DEFAULT_BUCKET_RAM_QUOTA_MB: u32 = 128;

/// Environment variables `couchbase-cli` reads credentials from.
pub const REST_USERNAME_ENV: &str = "CB_REST_USERNAME";
pub const REST_PASSWORD_ENV: &str = "CB_REST_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum AdminOperation {
    CreateBucket {
        name: String,
        ram_quota_mb: u32,
    },
    FlushBucket {
        name: String,
    },
    /// Turns a fresh node into a single-node cluster owned by the instance's admin user.
    ClusterInit {
        ram_quota_mb: u32,
        index_ram_quota_mb: u32,
        services: Vec<String>,
    },
}

impl AdminOperation {
    pub fn create_bucket(name: &str, ram_quota_mb: u32) -> Self {
        Self::CreateBucket {
            name: name.to_string(),
            ram_quota_mb,
        }
    }

    pub fn flush_bucket(name: &str) -> Self {
        Self::FlushBucket {
            name: name.to_string(),
        }
    }

    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::CreateBucket { .. } => "bucket-create",
            Self::FlushBucket { .. } => "bucket-flush",
            Self::ClusterInit { .. } => "cluster-init",
        }
    }
}

/// How the admin credentials reach `couchbase-cli`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStrategy {
    /// `--username` / `--password` flags. Visible in the process list of the instance.
    #[default]
    Arguments,
    /// `CB_REST_USERNAME` / `CB_REST_PASSWORD` in the exec environment.
    Environment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Invocation {
    /// Run the tool as `argv[0]`.
    #[default]
    Direct,
    /// Run through `/bin/sh -c` with every argument shell-quoted.
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRenderer {
    tool: String,
    admin_address: String,
    credentials: CredentialStrategy,
    invocation: Invocation,
}

impl Default for CommandRenderer {
    fn default() -> Self {
        Self {
            tool: COUCHBASE_CLI.to_string(),
            admin_address: LOOPBACK_ADMIN_ADDRESS.to_string(),
            credentials: CredentialStrategy::default(),
            invocation: Invocation::default(),
        }
    }
}

impl CommandRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn with_admin_address(mut self, address: impl Into<String>) -> Self {
        self.admin_address = address.into();
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

    pub fn credentials(&self) -> CredentialStrategy {
        self.credentials
    }

    pub fn invocation(&self) -> Invocation {
        self.invocation
    }

    pub fn render(&self, operation: &AdminOperation, identity: &InstanceIdentity) -> ExecCommand {
        let mut args = vec![
            self.tool.clone(),
            operation.subcommand().to_string(),
            "-c".to_string(),
            self.admin_address.clone(),
        ];
        let mut env = Vec::new();

        match operation {
            AdminOperation::CreateBucket { name, ram_quota_mb } => {
                self.push_credentials(&mut args, &mut env, identity);
                push_flags(
                    &mut args,
                    &[
                        ("--bucket", name.as_str()),
                        ("--bucket-type", "couchbase"),
                        ("--bucket-ramsize", &ram_quota_mb.to_string()),
                        ("--enable-flush", "1"),
                        ("--bucket-replica", "0"),
                    ],
                );
            }
            AdminOperation::FlushBucket { name } => {
                self.push_credentials(&mut args, &mut env, identity);
                push_flags(&mut args, &[("--bucket", name.as_str())]);
                args.push("--force".to_string());
            }
            AdminOperation::ClusterInit {
                ram_quota_mb,
                index_ram_quota_mb,
                services,
            } => {
                // These define the cluster's credentials rather than authenticate
                // against it, so they are arguments under every strategy.
                push_flags(
                    &mut args,
                    &[
                        ("--cluster-username", identity.admin_username.as_str()),
                        ("--cluster-password", identity.admin_password.as_str()),
                        ("--cluster-ramsize", &ram_quota_mb.to_string()),
                        ("--cluster-index-ramsize", &index_ram_quota_mb.to_string()),
                        ("--services", &services.join(",")),
                    ],
                );
                if services.iter().any(|s| s == "index") {
                    push_flags(&mut args, &[("--index-storage-setting", "default")]);
                }
            }
        }

        let args = match self.invocation {
            Invocation::Direct => args,
            Invocation::Shell => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                shell_words::join(&args),
            ],
        };
        ExecCommand { args, env }
    }

    fn push_credentials(
        &self,
        args: &mut Vec<String>,
        env: &mut Vec<String>,
        identity: &InstanceIdentity,
    ) {
        match self.credentials {
            CredentialStrategy::Arguments => push_flags(
                args,
                &[
                    ("--username", identity.admin_username.as_str()),
                    ("--password", identity.admin_password.as_str()),
                ],
            ),
            CredentialStrategy::Environment => {
                env.push(format!("{REST_USERNAME_ENV}={}", identity.admin_username));
                env.push(format!("{REST_PASSWORD_ENV}={}", identity.admin_password));
            }
        }
    }
}

fn push_flags(args: &mut Vec<String>, flags: &[(&str, &str)]) {
    for (flag, value) in flags {
        args.push((*flag).to_string());
        args.push((*value).to_string());
    }
}
