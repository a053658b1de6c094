use crate::admin::CouchbaseAdmin;
use crate::command::AdminOperation;
use crate::config::{CouchbaseConfig, QUERY_PORT, REST_PORT};
use bollard::Docker;
use dbcontainers_common::{ContainerError, ExecResult, InstanceHandle, InstanceIdentity, Result};
use dbcontainers_executor::{DockerInstance, ReadinessChecker, ReadinessConfig, ReadinessProbe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const UI_URL: &str = "http://127.0.0.1:8091/ui/index.html";
const QUERY_PING_URL: &str = "http://127.0.0.1:8093/admin/ping";

/// A started single-node Couchbase Server with an initialised cluster.
pub struct CouchbaseContainer {
    config: CouchbaseConfig,
    instance: Arc<DockerInstance>,
    admin: CouchbaseAdmin<Arc<DockerInstance>>,
}

impl CouchbaseContainer {
    /// Starts the container, initialises the cluster and creates the default
    /// bucket. The container is removed again if any step fails.
    #[instrument(skip_all, fields(image = %config.image))]
    pub async fn start(docker: Arc<Docker>, config: CouchbaseConfig) -> Result<Self> {
        config.validate()?;

        let instance = Arc::new(DockerInstance::new(docker, config.instance_config()));
        instance.start().await?;

        let admin = CouchbaseAdmin::with_renderer(instance.clone(), config.renderer());
        let container = Self {
            config,
            instance,
            admin,
        };

        if let Err(e) = bootstrap(&container.admin, &container.config).await {
            warn!(error = %e, "Couchbase bootstrap failed, removing container");
            if let Err(stop_err) = container.instance.stop().await {
                warn!(error = %stop_err, "Failed to remove container after bootstrap failure");
            }
            return Err(e);
        }

        info!(
            connection_string = %container.connection_string(),
            "Couchbase is ready"
        );
        Ok(container)
    }

    pub fn admin(&self) -> &CouchbaseAdmin<Arc<DockerInstance>> {
        &self.admin
    }

    pub fn config(&self) -> &CouchbaseConfig {
        &self.config
    }

    pub fn instance(&self) -> &Arc<DockerInstance> {
        &self.instance
    }

    pub fn identity(&self) -> InstanceIdentity {
        self.instance.identity()
    }

    pub fn connection_string(&self) -> String {
        self.admin.connection_string()
    }

    /// Cluster manager REST endpoint reachable from the test process.
    pub fn rest_url(&self) -> String {
        let identity = self.identity();
        format!("http://{}:{}", identity.hostname, identity.exposed_port)
    }

    /// N1QL endpoint, when the query service is published.
    pub fn query_url(&self) -> Option<String> {
        let port = self.instance.mapped_port(QUERY_PORT)?;
        Some(format!("http://{}:{}", self.identity().hostname, port))
    }

    pub async fn create_bucket(&self, name: &str) -> Result<ExecResult> {
        self.admin.create_bucket(name).await
    }

    pub async fn create_bucket_with_quota(&self, name: &str, ram_quota_mb: u32) -> Result<ExecResult> {
        self.admin.create_bucket_with_quota(name, ram_quota_mb).await
    }

    pub async fn flush_bucket(&self, name: &str) -> Result<ExecResult> {
        self.admin.flush_bucket(name).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.instance.stop().await?;
        Ok(())
    }
}

/// One-time node setup once the container is running: cluster-init, then the
/// default bucket. Every step must exit `0`, unlike calls made through
/// [`CouchbaseContainer::admin`].
async fn bootstrap<H: InstanceHandle>(admin: &CouchbaseAdmin<H>, config: &CouchbaseConfig) -> Result<()> {
    wait_for_endpoint(admin.instance(), config, UI_URL).await?;

    run_required(
        admin,
        &AdminOperation::ClusterInit {
            ram_quota_mb: config.cluster_ram_quota_mb,
            index_ram_quota_mb: config.index_ram_quota_mb,
            services: config.services.clone(),
        },
    )
    .await?;

    if config.has_service("query") {
        wait_for_endpoint(admin.instance(), config, QUERY_PING_URL).await?;
    }

    if let Some(bucket) = &config.default_bucket {
        run_required(
            admin,
            &AdminOperation::create_bucket(&bucket.name, bucket.ram_quota_mb),
        )
        .await?;
    }
    Ok(())
}

/// Polls `url` with curl from inside the instance.
async fn wait_for_endpoint<H: InstanceHandle>(
    instance: &H,
    config: &CouchbaseConfig,
    url: &str,
) -> Result<()> {
    let mut checker = ReadinessChecker::new(ReadinessConfig {
        check_interval: Duration::from_millis(500),
        timeout: config.startup_timeout(),
        failure_threshold: 0,
        probes: vec![ReadinessProbe::command(["curl", "-sf", "-o", "/dev/null", url])],
        ..Default::default()
    });
    let status = checker.wait_for_ready(instance).await?;
    debug!(url, checks = status.checks_performed, "Endpoint is up");
    Ok(())
}

async fn run_required<H: InstanceHandle>(
    admin: &CouchbaseAdmin<H>,
    operation: &AdminOperation,
) -> Result<ExecResult> {
    let result = admin.execute(operation).await?;
    if !result.is_success() {
        return Err(ContainerError::Startup(format!(
            "{} exited with {}: {}",
            operation.subcommand(),
            result.exit_code,
            first_non_empty(&result.stdout, &result.stderr)
        )));
    }
    Ok(result)
}

fn first_non_empty<'a>(stdout: &'a str, stderr: &'a str) -> &'a str {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        stderr.trim()
    } else {
        stdout
    }
}
