//! Docker-backed instance handle: one container, started once, exec'd into, removed.

use crate::readiness::{ReadinessChecker, ReadinessConfig, ReadinessStatus};
use crate::{ExecutorError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding as DockerPortBinding, PortMap};
use bollard::Docker;
use dbcontainers_common::{
    ExecCommand, ExecResult, InstanceConfig, InstanceHandle, InstanceIdentity,
    Result as CommonResult,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Label put on every container this crate creates.
pub const MANAGED_LABEL: &str = "dbcontainers.managed";

/// Overrides the hostname reported in `InstanceIdentity`.
pub const HOST_OVERRIDE_ENV: &str = "DBCONTAINERS_HOST";

#[derive(Debug, Clone)]
struct RunningState {
    container_id: String,
    identity: InstanceIdentity,
    ports: HashMap<u16, u16>,
}

pub struct DockerInstance {
    docker: Arc<Docker>,
    config: InstanceConfig,
    name: String,
    hostname: String,
    state: RwLock<Option<RunningState>>,
    // Serialises start and stop so one instance never owns two containers.
    lifecycle: Mutex<()>,
}

impl DockerInstance {
    pub fn new(docker: Arc<Docker>, config: InstanceConfig) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("dbcontainers-{}", Uuid::new_v4()));
        let hostname = resolve_hostname(
            std::env::var(HOST_OVERRIDE_ENV).ok().as_deref(),
            std::env::var("DOCKER_HOST").ok().as_deref(),
        );
        Self {
            docker,
            config,
            name,
            hostname,
            state: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn container_id(&self) -> Option<String> {
        self.read_state().as_ref().map(|s| s.container_id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.read_state().is_some()
    }

    /// Pull, create and start the container, then record its published ports.
    #[instrument(skip(self), fields(name = %self.name, image = %self.config.image))]
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            debug!("Instance already started");
            return Ok(());
        }

        self.pull_image().await?;

        let mut labels = self.config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .config
            .ports
            .iter()
            .map(|p| (port_key(p.container_port), HashMap::new()))
            .collect();

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(self.config.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings(&self.config)),
                auto_remove: Some(self.config.auto_remove),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(ExecutorError::CreationFailed)?;
        let container_id = created.id;
        info!(%container_id, "Container created.");

        if let Err(e) = self
            .docker
            .start_container::<String>(&container_id, None)
            .await
        {
            self.force_remove(&container_id).await;
            return Err(ExecutorError::StartFailed(e));
        }

        let inspected = match self.docker.inspect_container(&container_id, None).await {
            Ok(inspected) => inspected,
            Err(e) => {
                self.force_remove(&container_id).await;
                return Err(ExecutorError::InspectFailed(e));
            }
        };
        let ports = inspected
            .network_settings
            .and_then(|n| n.ports)
            .map(|map| published_ports(&map))
            .unwrap_or_default();

        let identity = InstanceIdentity {
            hostname: self.hostname.clone(),
            exposed_port: ports.get(&self.config.bootstrap_port).copied().unwrap_or(0),
            admin_username: self.config.admin_username.clone(),
            admin_password: self.config.admin_password.clone(),
        };
        info!(%container_id, ?ports, exposed_port = identity.exposed_port, "Container started.");

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(RunningState {
            container_id,
            identity,
            ports,
        });
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        info!("Pulling image...");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(%status, "Pull progress");
                    }
                }
                Err(source) => {
                    return Err(ExecutorError::PullFailed {
                        image: self.config.image.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Poll `config` against this instance until it reports ready.
    pub async fn wait_until_ready(&self, config: ReadinessConfig) -> CommonResult<ReadinessStatus> {
        if !self.is_running() {
            return Err(ExecutorError::NotStarted(self.name.clone()).into());
        }
        let mut checker = ReadinessChecker::new(config);
        let status = checker.wait_for_ready(self).await?;
        info!(name = %self.name, checks = status.checks_performed, "Instance is ready");
        Ok(status)
    }

    #[instrument(skip(self, command), fields(name = %self.name, program = ?command.program()))]
    async fn exec_inner(&self, command: ExecCommand) -> Result<ExecResult> {
        let container_id = self
            .container_id()
            .ok_or_else(|| ExecutorError::NotStarted(self.name.clone()))?;

        let exec_config = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.args),
            env: (!command.env.is_empty()).then_some(command.env),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&container_id, exec_config)
            .await
            .map_err(ExecutorError::ExecFailed)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(ExecutorError::ExecFailed)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(ExecutorError::ExecFailed)? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ExecutorError::Internal(
                    "exec started detached; no output to wait on".to_string(),
                ))
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(ExecutorError::ExecFailed)?;
        let exit_code = inspected.exit_code.ok_or_else(|| {
            ExecutorError::Internal(format!("exec {} finished without an exit code", exec.id))
        })?;

        if exit_code == 0 {
            debug!(%exit_code, "Exec finished");
        } else {
            warn!(%exit_code, "Exec exited with non-zero status");
        }

        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Stop and remove the container. Calling it again is a no-op.
    ///
    /// The instance only forgets its container once the daemon confirms it is
    /// gone, so a failed removal can be retried by calling `stop` again.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(container_id) = self.container_id() else {
            return Ok(());
        };

        info!(%container_id, "Stopping container...");
        if let Err(e) = self
            .docker
            .stop_container(&container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            // Already stopped or gone; removal below decides.
            debug!(%container_id, error = %e, "Stop request failed");
        }

        remove_container(&self.docker, &container_id)
            .await
            .map_err(ExecutorError::RemovalFailed)?;
        info!(%container_id, "Container removed.");

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    async fn force_remove(&self, container_id: &str) {
        if let Err(e) = remove_container(&self.docker, container_id).await {
            warn!(%container_id, error = %e, "Failed to remove container");
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<RunningState>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InstanceHandle for DockerInstance {
    fn identity(&self) -> InstanceIdentity {
        match self.read_state().as_ref() {
            Some(state) => state.identity.clone(),
            None => InstanceIdentity {
                hostname: self.hostname.clone(),
                exposed_port: 0,
                admin_username: self.config.admin_username.clone(),
                admin_password: self.config.admin_password.clone(),
            },
        }
    }

    fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.read_state()
            .as_ref()
            .and_then(|s| s.ports.get(&container_port).copied())
    }

    async fn exec(&self, command: ExecCommand) -> CommonResult<ExecResult> {
        Ok(self.exec_inner(command).await?)
    }
}

impl Drop for DockerInstance {
    fn drop(&mut self) {
        if !self.config.auto_remove {
            return;
        }
        let Some(state) = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let container_id = state.container_id;
        match remove_blocking(&self.docker, &container_id) {
            Ok(()) => info!(%container_id, "Container removed on drop."),
            Err(e) => warn!(%container_id, error = %e, "Failed to remove container on drop"),
        }
    }
}

/// Removes `container_id` before returning, so a test that bails out early
/// does not leave its ports bound for the next one.
///
/// On a multi-thread runtime the instance's own client is driven in place.
/// A current-thread runtime cannot make progress while it is blocked here, so
/// removal then runs on a private runtime with a fresh default connection.
fn remove_blocking(docker: &Arc<Docker>, container_id: &str) -> std::result::Result<(), String> {
    if let Ok(handle) = Handle::try_current() {
        if handle.runtime_flavor() == RuntimeFlavor::MultiThread {
            return tokio::task::block_in_place(|| {
                handle.block_on(remove_container(docker, container_id))
            })
            .map_err(|e| e.to_string());
        }
    }

    let container_id = container_id.to_string();
    std::thread::spawn(move || -> std::result::Result<(), String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| e.to_string())?;
        let _entered = runtime.enter();
        let docker = Docker::connect_with_defaults().map_err(|e| e.to_string())?;
        runtime
            .block_on(remove_container(&docker, &container_id))
            .map_err(|e| e.to_string())
    })
    .join()
    .unwrap_or_else(|_| Err("cleanup thread panicked".to_string()))
}

/// Force-removes a container; one that is already gone counts as removed.
async fn remove_container(docker: &Docker, container_id: &str) -> std::result::Result<(), BollardError> {
    match docker
        .remove_container(container_id, Some(remove_options()))
        .await
    {
        Ok(()) => Ok(()),
        // 404: no such container. 409: the daemon is already removing it.
        Err(BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }) => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_options() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    }
}

fn port_key(container_port: u16) -> String {
    format!("{container_port}/tcp")
}

fn port_bindings(config: &InstanceConfig) -> PortMap {
    config
        .ports
        .iter()
        .map(|p| {
            let binding = DockerPortBinding {
                host_ip: None,
                // Empty host port lets the daemon pick one.
                host_port: Some(p.host_port.map(|h| h.to_string()).unwrap_or_default()),
            };
            (port_key(p.container_port), Some(vec![binding]))
        })
        .collect()
}

/// Container port → host port, from an inspected container's port map.
fn published_ports(map: &PortMap) -> HashMap<u16, u16> {
    map.iter()
        .filter_map(|(key, bindings)| {
            let (port, proto) = key.split_once('/')?;
            if proto != "tcp" {
                return None;
            }
            let container_port = port.parse().ok()?;
            let host_port = bindings
                .as_ref()?
                .iter()
                .find_map(|b| b.host_port.as_deref()?.parse().ok())?;
            Some((container_port, host_port))
        })
        .collect()
}

/// Hostname test code should dial: explicit override, then the host of a
/// `tcp://` Docker endpoint, then loopback.
fn resolve_hostname(override_host: Option<&str>, docker_host: Option<&str>) -> String {
    if let Some(host) = override_host.filter(|h| !h.is_empty()) {
        return host.to_string();
    }
    docker_host
        .and_then(|raw| url::Url::parse(raw).ok())
        .filter(|url| matches!(url.scheme(), "tcp" | "http" | "https"))
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbcontainers_common::PortBinding;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal Docker Engine API stand-in: answers the calls `DockerInstance`
    /// makes and records each request line.
    #[derive(Clone)]
    struct FakeDaemon {
        addr: String,
        requests: Arc<StdMutex<Vec<String>>>,
        delete_statuses: Arc<StdMutex<VecDeque<u16>>>,
    }

    impl FakeDaemon {
        /// `delete_statuses` are returned by successive DELETE calls; 204 after that.
        async fn start(delete_statuses: impl IntoIterator<Item = u16>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let daemon = Self {
                addr: format!("http://{}", listener.local_addr().unwrap()),
                requests: Arc::default(),
                delete_statuses: Arc::new(StdMutex::new(delete_statuses.into_iter().collect())),
            };
            let server = daemon.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(server.clone().handle(stream));
                }
            });
            daemon
        }

        fn client(&self) -> Arc<Docker> {
            Arc::new(Docker::connect_with_http(&self.addr, 5, bollard::API_DEFAULT_VERSION).unwrap())
        }

        fn count(&self, method: &str, path_suffix: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.starts_with(method) && r.ends_with(path_suffix))
                .count()
        }

        async fn handle(self, mut stream: TcpStream) {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }

            let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default();
            let path = path.split('?').next().unwrap_or_default().to_string();
            self.requests.lock().unwrap().push(format!("{method} {path}"));

            let (status, body) = self.route(&method, &path);
            let response = format!(
                "HTTP/1.1 {status} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }

        fn route(&self, method: &str, path: &str) -> (u16, String) {
            match method {
                "POST" if path.ends_with("/images/create") => {
                    (200, r#"{"status":"Pulled"}"#.to_string())
                }
                "POST" if path.ends_with("/containers/create") => {
                    (201, r#"{"Id":"cid-1","Warnings":[]}"#.to_string())
                }
                "POST" if path.ends_with("/start") || path.ends_with("/stop") => (204, String::new()),
                "GET" if path.ends_with("/json") => (
                    200,
                    r#"{"Id":"cid-1","NetworkSettings":{"Ports":{"8091/tcp":[{"HostIp":"0.0.0.0","HostPort":"49153"}]}}}"#
                        .to_string(),
                ),
                "DELETE" => {
                    let status = self.delete_statuses.lock().unwrap().pop_front().unwrap_or(204);
                    if status == 204 {
                        (204, String::new())
                    } else {
                        (status, r#"{"message":"driver failed to remove root filesystem"}"#.to_string())
                    }
                }
                _ => (404, r#"{"message":"page not found"}"#.to_string()),
            }
        }
    }

    fn couchbase_config() -> InstanceConfig {
        InstanceConfig::new("couchbase/server:community-6.5.1", 8091)
            .with_credentials("Administrator", "password")
    }

    #[tokio::test]
    async fn test_start_records_published_ports() {
        let daemon = FakeDaemon::start([]).await;
        let instance = DockerInstance::new(daemon.client(), couchbase_config());

        instance.start().await.unwrap();
        assert_eq!(instance.container_id().as_deref(), Some("cid-1"));
        assert_eq!(instance.mapped_port(8091), Some(49153));
        assert_eq!(instance.identity().exposed_port, 49153);

        instance.stop().await.unwrap();
        assert!(!instance.is_running());
        assert_eq!(daemon.count("DELETE", "/containers/cid-1"), 1);
    }

    #[tokio::test]
    async fn test_failed_removal_can_be_retried() {
        let daemon = FakeDaemon::start([500]).await;
        let instance = DockerInstance::new(daemon.client(), couchbase_config());
        instance.start().await.unwrap();

        let err = instance.stop().await.unwrap_err();
        assert!(matches!(err, ExecutorError::RemovalFailed(_)));
        assert!(instance.is_running());
        assert_eq!(instance.container_id().as_deref(), Some("cid-1"));

        instance.stop().await.unwrap();
        assert!(!instance.is_running());
        assert_eq!(daemon.count("DELETE", "/containers/cid-1"), 2);

        // nothing left for drop to remove
        drop(instance);
        assert_eq!(daemon.count("DELETE", "/containers/cid-1"), 2);
    }

    #[tokio::test]
    async fn test_already_removed_container_counts_as_stopped() {
        let daemon = FakeDaemon::start([404]).await;
        let instance = DockerInstance::new(daemon.client(), couchbase_config());
        instance.start().await.unwrap();

        instance.stop().await.unwrap();
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_container() {
        let daemon = FakeDaemon::start([]).await;
        let instance = DockerInstance::new(daemon.client(), couchbase_config());

        let (first, second) = tokio::join!(instance.start(), instance.start());
        first.unwrap();
        second.unwrap();
        assert_eq!(daemon.count("POST", "/containers/create"), 1);

        instance.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_removes_container_before_returning() {
        let daemon = FakeDaemon::start([]).await;

        async fn start_then_bail(daemon: &FakeDaemon) -> Result<()> {
            let instance = DockerInstance::new(daemon.client(), couchbase_config());
            instance.start().await?;
            Err(ExecutorError::Internal("test gave up early".to_string()))
        }

        assert!(start_then_bail(&daemon).await.is_err());
        assert_eq!(daemon.count("DELETE", "/containers/cid-1"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_keeps_container_without_auto_remove() {
        let daemon = FakeDaemon::start([]).await;
        let mut config = couchbase_config();
        config.auto_remove = false;

        let instance = DockerInstance::new(daemon.client(), config);
        instance.start().await.unwrap();
        drop(instance);

        assert_eq!(daemon.count("DELETE", "/containers/cid-1"), 0);
    }

    #[test]
    fn test_resolve_hostname() {
        assert_eq!(resolve_hostname(None, None), "127.0.0.1");
        assert_eq!(
            resolve_hostname(None, Some("unix:///var/run/docker.sock")),
            "127.0.0.1"
        );
        assert_eq!(
            resolve_hostname(None, Some("tcp://10.0.0.5:2375")),
            "10.0.0.5"
        );
        assert_eq!(
            resolve_hostname(Some("docker.internal"), Some("tcp://10.0.0.5:2375")),
            "docker.internal"
        );
        assert_eq!(resolve_hostname(Some(""), None), "127.0.0.1");
    }

    #[test]
    fn test_port_bindings() {
        let config = InstanceConfig::new("couchbase/server:community-6.5.1", 8091)
            .with_port(PortBinding::fixed(11210, 11210));
        let map = port_bindings(&config);

        let ephemeral = map["8091/tcp"].as_ref().unwrap();
        assert_eq!(ephemeral[0].host_port.as_deref(), Some(""));
        let fixed = map["11210/tcp"].as_ref().unwrap();
        assert_eq!(fixed[0].host_port.as_deref(), Some("11210"));
    }

    #[test]
    fn test_published_ports() {
        let mut map: PortMap = HashMap::new();
        map.insert(
            "8091/tcp".to_string(),
            Some(vec![
                DockerPortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some("49153".to_string()),
                },
                DockerPortBinding {
                    host_ip: Some("::".to_string()),
                    host_port: Some("49153".to_string()),
                },
            ]),
        );
        map.insert("8092/tcp".to_string(), None);
        map.insert(
            "53/udp".to_string(),
            Some(vec![DockerPortBinding {
                host_ip: None,
                host_port: Some("5353".to_string()),
            }]),
        );

        let ports = published_ports(&map);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports.get(&8091), Some(&49153));
    }
}
