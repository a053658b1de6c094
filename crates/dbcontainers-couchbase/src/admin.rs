use crate::command::{AdminOperation, CommandRenderer, DEFAULT_BUCKET_RAM_QUOTA_MB};
use dbcontainers_common::{ExecCommand, ExecResult, InstanceHandle, Result};
use tracing::{debug, info, instrument, warn};

pub const CONNECTION_SCHEME: &str = "couchbase";

/// Administrative operations executed inside one running Couchbase instance.
///
/// Exit codes are returned as-is: a non-zero code is an `Ok` result and the
/// caller decides what it means. `Err` only comes from the instance handle
/// failing to run the command at all. Nothing is retried, timed out or
/// serialised here.
#[derive(Debug, Clone)]
pub struct CouchbaseAdmin<H> {
    instance: H,
    renderer: CommandRenderer,
}

impl<H: InstanceHandle> CouchbaseAdmin<H> {
    pub fn new(instance: H) -> Self {
        Self::with_renderer(instance, CommandRenderer::default())
    }

    pub fn with_renderer(instance: H, renderer: CommandRenderer) -> Self {
        Self { instance, renderer }
    }

    pub fn instance(&self) -> &H {
        &self.instance
    }

    pub fn renderer(&self) -> &CommandRenderer {
        &self.renderer
    }

    /// `couchbase://<hostname>`, read from the instance on every call.
    pub fn connection_string(&self) -> String {
        format!("{CONNECTION_SCHEME}://{}", self.instance.identity().hostname)
    }

    pub fn render(&self, operation: &AdminOperation) -> ExecCommand {
        self.renderer.render(operation, &self.instance.identity())
    }

    #[instrument(skip_all, fields(operation = operation.subcommand()))]
    pub async fn execute(&self, operation: &AdminOperation) -> Result<ExecResult> {
        let command = self.render(operation);
        debug!(arg_count = command.args.len(), "Submitting admin command");

        let result = self.instance.exec(command).await?;
        if result.is_success() {
            info!(exit_code = result.exit_code, "Admin command succeeded");
        } else {
            warn!(
                exit_code = result.exit_code,
                output = %result.stdout.trim(),
                "Admin command failed"
            );
        }
        Ok(result)
    }

    /// Creates a flushable, unreplicated bucket with the default 128 MB quota.
    pub async fn create_bucket(&self, name: &str) -> Result<ExecResult> {
        self.create_bucket_with_quota(name, DEFAULT_BUCKET_RAM_QUOTA_MB)
            .await
    }

    pub async fn create_bucket_with_quota(&self, name: &str, ram_quota_mb: u32) -> Result<ExecResult> {
        self.execute(&AdminOperation::create_bucket(name, ram_quota_mb))
            .await
    }

    /// Asks the node to delete every document in `name`.
    ///
    /// Success means the request was accepted. Reads may still see documents
    /// for a short while; poll if the test needs the bucket empty.
    pub async fn flush_bucket(&self, name: &str) -> Result<ExecResult> {
        self.execute(&AdminOperation::flush_bucket(name)).await
    }
}
