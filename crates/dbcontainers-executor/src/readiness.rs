use chrono::{DateTime, Utc};
use dbcontainers_common::{ContainerError, ExecCommand, InstanceHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Custom error type that implements Send for use with tokio::spawn
#[derive(Debug, Clone)]
pub struct ReadinessError {
    pub message: String,
}

impl std::fmt::Display for ReadinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReadinessError {}

impl From<String> for ReadinessError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ReadinessError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<ReadinessError> for ContainerError {
    fn from(err: ReadinessError) -> Self {
        ContainerError::Readiness(err.message)
    }
}

/// Readiness check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    pub check_interval: Duration,
    pub initial_delay: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    /// `0` disables the cut-off; only `timeout` ends the wait.
    pub failure_threshold: u32,
    pub probes: Vec<ReadinessProbe>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            initial_delay: Duration::from_secs(0),
            timeout: Duration::from_secs(60),
            success_threshold: 1,
            failure_threshold: 3,
            probes: vec![ReadinessProbe::default()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessProbe {
    pub probe_type: ProbeType,
    pub path: Option<String>,
    /// Container port; resolved to the published host port at check time.
    pub port: Option<u16>,
    pub command: Option<Vec<String>>,
    /// HTTP status for `Http`, exit code for `Command`.
    pub expected_status: Option<i64>,
    pub timeout: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            probe_type: ProbeType::Tcp,
            path: None,
            port: Some(80),
            command: None,
            expected_status: Some(0),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessProbe {
    pub fn tcp(port: u16) -> Self {
        Self {
            probe_type: ProbeType::Tcp,
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn http(port: u16, path: &str, expected_status: u16) -> Self {
        Self {
            probe_type: ProbeType::Http,
            port: Some(port),
            path: Some(path.to_string()),
            expected_status: Some(i64::from(expected_status)),
            ..Default::default()
        }
    }

    /// Runs `args` inside the instance; ready when it exits with `0`.
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            probe_type: ProbeType::Command,
            port: None,
            command: Some(args.into_iter().map(Into::into).collect()),
            expected_status: Some(0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Http,
    Tcp,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub checks_performed: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub message: String,
}

impl Default for ReadinessStatus {
    fn default() -> Self {
        Self {
            ready: false,
            checks_performed: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_check: None,
            message: "Not checked yet".to_string(),
        }
    }
}

/// Readiness checker for instances
pub struct ReadinessChecker {
    config: ReadinessConfig,
    status: ReadinessStatus,
}

impl ReadinessChecker {
    pub fn new(config: ReadinessConfig) -> Self {
        Self {
            config,
            status: ReadinessStatus::default(),
        }
    }

    pub fn status(&self) -> &ReadinessStatus {
        &self.status
    }

    /// Wait for instance to be ready
    pub async fn wait_for_ready(
        &mut self,
        instance: &dyn InstanceHandle,
    ) -> Result<ReadinessStatus, ReadinessError> {
        // Initial delay
        if self.config.initial_delay > Duration::ZERO {
            sleep(self.config.initial_delay).await;
        }

        let check_result = timeout(self.config.timeout, async {
            loop {
                let probe_result = self.perform_checks(instance).await;
                self.update_status(probe_result);

                if self.status.ready {
                    return Ok(self.status.clone());
                }

                if self.config.failure_threshold > 0
                    && self.status.consecutive_failures >= self.config.failure_threshold
                {
                    return Err(format!(
                        "Readiness check failed after {} consecutive failures",
                        self.config.failure_threshold
                    )
                    .into());
                }

                sleep(self.config.check_interval).await;
            }
        })
        .await;

        match check_result {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                Err(format!("Readiness check timed out after {:?}", self.config.timeout).into())
            }
        }
    }

    /// Perform all configured probes
    async fn perform_checks(&self, instance: &dyn InstanceHandle) -> bool {
        for probe in &self.config.probes {
            if !self.perform_single_probe(instance, probe).await {
                return false;
            }
        }
        true
    }

    /// Perform a single probe
    async fn perform_single_probe(&self, instance: &dyn InstanceHandle, probe: &ReadinessProbe) -> bool {
        let probe_timeout = timeout(probe.timeout, async {
            match probe.probe_type {
                ProbeType::Http => self.check_http(instance, probe).await,
                ProbeType::Tcp => self.check_tcp(instance, probe).await,
                ProbeType::Command => self.check_command(instance, probe).await,
            }
        })
        .await;

        match probe_timeout {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(probe = ?probe.probe_type, "Probe timed out");
                false
            }
        }
    }

    fn host_addr(&self, instance: &dyn InstanceHandle, probe: &ReadinessProbe) -> Option<String> {
        let port = probe.port?;
        let Some(host_port) = instance.mapped_port(port) else {
            tracing::debug!(container_port = port, "Probe port is not published");
            return None;
        };
        Some(format!("{}:{}", instance.identity().hostname, host_port))
    }

    /// HTTP readiness check
    async fn check_http(&self, instance: &dyn InstanceHandle, probe: &ReadinessProbe) -> bool {
        let Some(addr) = self.host_addr(instance, probe) else {
            return false;
        };
        let path = probe.path.as_deref().unwrap_or("/");
        let url = format!("http://{}{}", addr, path);

        match reqwest::get(&url).await {
            Ok(response) => {
                let expected = probe.expected_status.unwrap_or(200);
                i64::from(response.status().as_u16()) == expected
            }
            Err(e) => {
                tracing::debug!("HTTP check failed for {}: {}", url, e);
                false
            }
        }
    }

    /// TCP port readiness check
    async fn check_tcp(&self, instance: &dyn InstanceHandle, probe: &ReadinessProbe) -> bool {
        use tokio::net::TcpStream;

        let Some(addr) = self.host_addr(instance, probe) else {
            return false;
        };

        match TcpStream::connect(&addr).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("TCP check failed for {}: {}", addr, e);
                false
            }
        }
    }

    /// Command execution readiness check, run inside the instance
    async fn check_command(&self, instance: &dyn InstanceHandle, probe: &ReadinessProbe) -> bool {
        let command = match &probe.command {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => return false,
        };

        match instance.exec(ExecCommand::new(command.iter().cloned())).await {
            Ok(result) => {
                let expected = probe.expected_status.unwrap_or(0);
                result.exit_code == expected
            }
            Err(e) => {
                tracing::debug!("Command check failed for {:?}: {}", command, e);
                false
            }
        }
    }

    /// Update readiness status based on probe result
    fn update_status(&mut self, success: bool) {
        self.status.checks_performed += 1;
        self.status.last_check = Some(Utc::now());

        if success {
            self.status.consecutive_successes += 1;
            self.status.consecutive_failures = 0;

            if self.status.consecutive_successes >= self.config.success_threshold {
                self.status.ready = true;
                self.status.message = "Instance is ready".to_string();
            } else {
                self.status.message = format!(
                    "Waiting for {} more successful checks",
                    self.config.success_threshold - self.status.consecutive_successes
                );
            }
        } else {
            self.status.consecutive_successes = 0;
            self.status.consecutive_failures += 1;
            self.status.ready = false;
            self.status.message = format!(
                "Check failed ({}/{})",
                self.status.consecutive_failures, self.config.failure_threshold
            );
        }
    }
}
