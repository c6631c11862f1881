// Docker engine client
//
// REST calls go through bollard. Attaching is done on a raw socket with an
// HTTP `Upgrade: tcp` request, the same way the docker CLI hijacks the
// connection, so the sandbox gets the unparsed multiplexed stream and keeps
// control over stdin half-close.

use super::engine::{AttachStream, ContainerEngine, ContainerSpec, ContainerState};
use super::error::{Result, SandboxError};
use super::registry::RetryPolicy;
use crate::config::DockerConfig;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Largest accepted response head for the attach upgrade.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Where the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl Endpoint {
    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("unix://") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        for scheme in ["tcp://", "http://"] {
            if let Some(addr) = url.strip_prefix(scheme) {
                return Ok(Endpoint::Tcp(addr.trim_end_matches('/').to_string()));
            }
        }
        Err(SandboxError::InvalidArgument(format!(
            "Unsupported Docker URL '{}': expected unix://, tcp:// or http://",
            url
        )))
    }

    /// Configured URL, then `DOCKER_HOST`, then the local socket.
    pub fn from_config(config: &DockerConfig) -> Result<Self> {
        match config.url.clone().or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(url) => Self::parse(&url),
            None => Ok(Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET))),
        }
    }
}

/// Failure of one engine request, classified for the retry policy.
#[derive(Debug)]
enum Failure {
    Status(u16, String),
    Connect(String),
    Fatal(String),
}

impl Failure {
    fn message(self) -> String {
        match self {
            Failure::Status(_, m) | Failure::Connect(m) | Failure::Fatal(m) => m,
        }
    }
}

impl From<BollardError> for Failure {
    fn from(e: BollardError) -> Self {
        let message = e.to_string();
        match e {
            BollardError::DockerResponseServerError { status_code, .. } => Failure::Status(status_code, message),
            BollardError::RequestTimeoutError | BollardError::IOError { .. } => Failure::Connect(message),
            _ => Failure::Fatal(message),
        }
    }
}

/// Docker engine reached over a unix socket or plain TCP.
pub struct DockerEngine {
    docker: Docker,
    endpoint: Endpoint,
    policy: RetryPolicy,
    timeout: Duration,
}

impl DockerEngine {
    /// Create a client; no request is made until first use.
    pub fn connect(config: &DockerConfig, policy: RetryPolicy) -> Result<Self> {
        let endpoint = Endpoint::from_config(config)?;
        let docker = match &endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                config.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(SandboxError::InvalidArgument(format!(
                    "Unix socket {} is not supported on this platform",
                    path.display()
                )))
            }
            Endpoint::Tcp(addr) => Docker::connect_with_http(
                &format!("http://{}", addr),
                config.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
        };

        Ok(Self {
            docker,
            endpoint,
            policy,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Run `op` until it succeeds or the retry budget for its failure kind is spent.
    async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let policy = &self.policy;
        let (mut total, mut connect, mut read) = (0u32, 0u32, 0u32);

        loop {
            let failure = match op().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let retry = total < policy.total
                && match &failure {
                    Failure::Connect(_) => {
                        connect += 1;
                        connect <= policy.connect
                    }
                    Failure::Status(status, _) if policy.retries_status(*status) => {
                        read += 1;
                        read <= policy.read
                    }
                    _ => false,
                };
            if !retry {
                return Err(SandboxError::Engine(failure.message()));
            }

            total += 1;
            let delay = policy.backoff(total);
            warn!(operation, attempt = total, ?delay, error = ?failure, "Retrying Docker request");
            tokio::time::sleep(delay).await;
        }
    }

    /// Fresh connection to the engine endpoint.
    async fn open_socket(&self) -> std::result::Result<Box<dyn AttachStream>, Failure> {
        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let sock = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Failure::Connect(format!("Failed to connect to {}: {}", path.display(), e)))?;
                Ok(Box::new(sock))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(Failure::Fatal(format!(
                "Unix socket {} is not supported on this platform",
                path.display()
            ))),
            Endpoint::Tcp(addr) => {
                let sock = tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| Failure::Connect(format!("Failed to connect to {}: {}", addr, e)))?;
                sock.set_nodelay(true)
                    .map_err(|e| Failure::Connect(e.to_string()))?;
                Ok(Box::new(sock))
            }
        }
    }

    async fn open_attach(&self, id: &str) -> std::result::Result<Box<dyn AttachStream>, Failure> {
        let attach = async {
            let sock = self.open_socket().await?;
            upgrade_attach(sock, id).await
        };

        tokio::time::timeout(self.timeout, attach)
            .await
            .map_err(|_| Failure::Connect(format!("Timed out attaching to container {}", id)))?
    }

    async fn fetch_inspect(&self, id: &str) -> std::result::Result<InspectBody, Failure> {
        let inspect = async {
            let sock = self.open_socket().await?;
            request_inspect(sock, id).await
        };

        tokio::time::timeout(self.timeout, inspect)
            .await
            .map_err(|_| Failure::Connect(format!("Timed out inspecting container {}", id)))?
    }
}

/// The parts of `GET /containers/{id}/json` the sandbox reads.
///
/// bollard's inspect model has no `Node` field, which Swarm-style engines use
/// to report where a container was scheduled.
#[derive(Debug, Default, Deserialize)]
struct InspectBody {
    #[serde(rename = "State", default)]
    state: Option<InspectState>,
    #[serde(rename = "Node", default)]
    node: Option<InspectNode>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
    #[serde(rename = "StartedAt")]
    started_at: Option<String>,
    #[serde(rename = "FinishedAt")]
    finished_at: Option<String>,
    #[serde(rename = "OOMKilled")]
    oom_killed: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNode {
    #[serde(rename = "Name")]
    name: Option<String>,
}

impl InspectBody {
    fn into_container_state(self) -> ContainerState {
        let state = self.state.unwrap_or_default();
        ContainerState {
            running: state.running,
            exit_code: state.exit_code,
            started_at: state.started_at,
            finished_at: state.finished_at,
            oom_killed: state.oom_killed,
            node: self.node.and_then(|n| n.name).filter(|n| !n.is_empty()),
        }
    }
}

/// Inspect a container on `sock`.
///
/// HTTP/1.0 makes the engine answer without chunked encoding and close the
/// connection after the body.
async fn request_inspect<S>(mut sock: S, id: &str) -> std::result::Result<InspectBody, Failure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET /containers/{}/json HTTP/1.0\r\nHost: docker\r\n\r\n", id);
    sock.write_all(request.as_bytes())
        .await
        .map_err(|e| Failure::Connect(e.to_string()))?;

    let mut response = Vec::new();
    sock.read_to_end(&mut response)
        .await
        .map_err(|e| Failure::Connect(e.to_string()))?;

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Failure::Connect(format!("Incomplete inspect response for container {}", id)))?;
    let head = String::from_utf8_lossy(&response[..split]);
    let body = &response[split + 4..];
    let status_line = head.lines().next().unwrap_or_default();

    match parse_status(status_line) {
        Some(200) => serde_json::from_slice(body)
            .map_err(|e| Failure::Fatal(format!("Invalid inspect response for container {}: {}", id, e))),
        Some(status) => {
            let message = serde_json::from_slice::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| status_line.to_string());
            Err(Failure::Status(status, message))
        }
        None => Err(Failure::Fatal(format!("Malformed inspect response: {}", status_line))),
    }
}

/// Send the attach request on `sock` and consume the response head, leaving
/// the socket positioned at the first stream frame.
async fn upgrade_attach<S>(mut sock: S, id: &str) -> std::result::Result<S, Failure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Attach to stdin even without input so it can be closed explicitly.
    let request = format!(
        "POST /containers/{}/attach?stdin=1&stdout=1&stderr=1&stream=1&logs=0 HTTP/1.1\r\n\
         Host: docker\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: 0\r\n\r\n",
        id
    );
    sock.write_all(request.as_bytes())
        .await
        .map_err(|e| Failure::Connect(e.to_string()))?;

    // Byte by byte so nothing after the head is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Failure::Fatal("Attach response head is too large".to_string()));
        }
        let n = sock
            .read(&mut byte)
            .await
            .map_err(|e| Failure::Connect(e.to_string()))?;
        if n == 0 {
            return Err(Failure::Connect("Engine closed the connection during attach".to_string()));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match parse_status(status_line) {
        Some(101) | Some(200) => Ok(sock),
        Some(status) => Err(Failure::Status(
            status,
            format!("Failed to attach to container {}: {}", id, status_line),
        )),
        None => Err(Failure::Fatal(format!("Malformed attach response: {}", status_line))),
    }
}

/// Status code of an HTTP status line such as `HTTP/1.1 101 UPGRADED`.
fn parse_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn network_mode(spec: &ContainerSpec) -> String {
    if spec.network_disabled {
        "none".to_string()
    } else {
        "bridge".to_string()
    }
}

/// bollard create parameters for `spec`.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let ulimits = spec.ulimits.as_ref().map(|ulimits| {
        ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.clone()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect()
    });

    let host_config = HostConfig {
        network_mode: Some(network_mode(spec)),
        readonly_rootfs: Some(spec.read_only),
        memory: spec.memory,
        // Same as memory: no swap on top of the ceiling.
        memory_swap: spec.memory,
        pids_limit: spec.pids_limit,
        ulimits,
        binds: spec
            .volume
            .as_ref()
            .map(|v| vec![format!("{}:{}", v.volume, v.target)]),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        user: Some(spec.user.clone()),
        working_dir: Some(spec.working_dir.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        open_stdin: Some(true),
        stdin_once: Some(false),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        network_disabled: Some(spec.network_disabled),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let docker = &self.docker;
        let config = container_config(spec);
        let response = self
            .retry("create_container", || {
                let options = CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                };
                let config = config.clone();
                async move { docker.create_container(Some(options), config).await.map_err(Failure::from) }
            })
            .await?;

        for warning in &response.warnings {
            warn!(container = %response.id, warning = %warning, "Docker warning on container create");
        }
        debug!(container = %response.id, name = %spec.name, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let docker = &self.docker;
        self.retry("start_container", move || async move {
            docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
                .map_err(Failure::from)
        })
        .await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let docker = &self.docker;
        let t = grace.as_secs() as i64;
        self.retry("stop_container", move || async move {
            docker
                .stop_container(id, Some(StopContainerOptions { t }))
                .await
                .map_err(Failure::from)
        })
        .await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let docker = &self.docker;
        self.retry("remove_container", move || async move {
            let options = RemoveContainerOptions {
                v: true,
                force: true,
                ..Default::default()
            };
            docker.remove_container(id, Some(options)).await.map_err(Failure::from)
        })
        .await
    }

    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>> {
        let this = self;
        self.retry("attach", move || this.open_attach(id)).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let this = self;
        let body = self.retry("inspect_container", move || this.fetch_inspect(id)).await?;
        Ok(body.into_container_state())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let docker = &self.docker;
        self.retry("create_volume", move || async move {
            let options = CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            };
            docker.create_volume(options).await.map(|_| ()).map_err(Failure::from)
        })
        .await
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let docker = &self.docker;
        self.retry("remove_volume", move || async move {
            docker
                .remove_volume(name, None::<RemoveVolumeOptions>)
                .await
                .map_err(Failure::from)
        })
        .await
    }

    async fn upload_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let docker = &self.docker;
        let archive = Bytes::from(archive);
        self.retry("upload_archive", || {
            let options = UploadToContainerOptions {
                path: path.to_string(),
                ..Default::default()
            };
            let archive = archive.clone();
            async move {
                docker
                    .upload_to_container(id, Some(options), archive.into())
                    .await
                    .map_err(Failure::from)
            }
        })
        .await
    }
}
