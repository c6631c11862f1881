//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared test infrastructure including:
//! - proptest configuration presets
//! - an in-memory container engine whose programs speak the framed attach
//!   protocol, so the sandbox lifecycle runs without a Docker daemon
//! - builders for managers wired to that engine

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dockjail::config::Config;
use dockjail::sandbox::stream::encode_frame;
use dockjail::sandbox::{
    AttachStream, ContainerEngine, ContainerSpec, ContainerState, EngineRegistry, Profile, Result,
    SandboxError, SandboxManager,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Standard proptest configuration with minimum 100 iterations.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    }
}

const ATTACH_BUFFER: usize = 64 * 1024;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// One tar upload as seen by the engine.
#[derive(Debug, Clone)]
pub struct Upload {
    pub container: String,
    pub path: String,
    /// Entry path and mode, in archive order.
    pub entries: Vec<(String, u32)>,
}

struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
    /// Absolute path to content, for files outside any volume.
    files: BTreeMap<String, Vec<u8>>,
    attached: Option<DuplexStream>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    containers: HashMap<String, FakeContainer>,
    /// Volume name to relative file name to content.
    volumes: HashMap<String, BTreeMap<String, Vec<u8>>>,
    created: Vec<ContainerSpec>,
    removed_containers: Vec<String>,
    removed_volumes: Vec<String>,
    uploads: Vec<Upload>,
    starts: usize,
    stops: usize,
}

/// In-memory engine. The container command selects a built-in program:
///
/// | command | behaviour |
/// |---|---|
/// | `true` / `false` / `exit N` | exit 0 / 1 / N |
/// | `cat` | echo stdin to stdout until EOF |
/// | `echo TEXT` / `stderr TEXT` | print TEXT and a newline |
/// | `yes N` | print N bytes of `y` |
/// | `sleep SECS` | sleep, ignoring stdin |
/// | `ignore-input` | exit 0 without reading stdin |
/// | `linger SECS` | exit 0 but hold the output stream open for SECS |
/// | `cpu-burn` | killed by SIGKILL, as with a CPU ulimit |
/// | `oom` | killed by the OOM killer |
/// | `ls` / `cat-file NAME` / `write NAME TEXT` | working directory access |
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    node: Option<String>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine reporting every container on cluster node `node`.
    pub fn on_node(node: &str) -> Arc<Self> {
        Arc::new(Self {
            node: Some(node.to_string()),
            ..Self::default()
        })
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_containers.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_volumes.clone()
    }

    pub fn volume_files(&self, volume: &str) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().unwrap().volumes.get(volume).cloned().unwrap_or_default()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.state.running)
            .unwrap_or(false)
    }
}

fn no_such_container(id: &str) -> SandboxError {
    SandboxError::Engine(format!("No such container: {}", id))
}

/// Where a program looks for the working directory.
enum Workdir {
    Volume(String),
    Container(String, String),
}

struct Program {
    state: Arc<Mutex<FakeState>>,
    workdir: Workdir,
}

impl Program {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match &self.workdir {
            Workdir::Volume(volume) => state.volumes.get(volume)?.get(name).cloned(),
            Workdir::Container(id, dir) => state
                .containers
                .get(id)?
                .files
                .get(&format!("{}/{}", dir, name))
                .cloned(),
        }
    }

    fn write_file(&self, name: &str, content: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        match &self.workdir {
            Workdir::Volume(volume) => {
                state.volumes.entry(volume.clone()).or_default().insert(name.to_string(), content);
            }
            Workdir::Container(id, dir) => {
                if let Some(container) = state.containers.get_mut(id) {
                    container.files.insert(format!("{}/{}", dir, name), content);
                }
            }
        }
    }

    fn list_files(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        match &self.workdir {
            Workdir::Volume(volume) => state
                .volumes
                .get(volume)
                .map(|files| files.keys().cloned().collect())
                .unwrap_or_default(),
            Workdir::Container(id, dir) => {
                let prefix = format!("{}/", dir);
                state
                    .containers
                    .get(id)
                    .map(|c| {
                        c.files
                            .keys()
                            .filter_map(|path| path.strip_prefix(&prefix).map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }

    /// Run `command`; returns (exit code, OOM killed).
    async fn run(
        &self,
        command: &str,
        stdin: &mut Box<dyn AsyncRead + Send + Unpin>,
        out: &mut Box<dyn AsyncWrite + Send + Unpin>,
    ) -> (i64, bool) {
        let (program, arg) = command.split_once(' ').unwrap_or((command, ""));
        match program {
            "true" => (0, false),
            "false" => (1, false),
            "exit" => (arg.parse().unwrap_or(2), false),
            "cat" => {
                let mut buf = [0u8; 1024];
                loop {
                    match stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = out.write_all(&encode_frame(1, &buf[..n])).await;
                        }
                    }
                }
                (0, false)
            }
            "echo" => {
                let _ = out.write_all(&encode_frame(1, format!("{}\n", arg).as_bytes())).await;
                (0, false)
            }
            "stderr" => {
                let _ = out.write_all(&encode_frame(2, format!("{}\n", arg).as_bytes())).await;
                (0, false)
            }
            "yes" => {
                let count: usize = arg.parse().unwrap_or(0);
                let _ = out.write_all(&encode_frame(1, &vec![b'y'; count])).await;
                (0, false)
            }
            "sleep" => {
                let secs: f64 = arg.parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                (0, false)
            }
            "ignore-input" | "linger" => (0, false),
            "cpu-burn" => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                (137, false)
            }
            "oom" => {
                let _ = out.write_all(&encode_frame(1, b"allocating\n")).await;
                (137, true)
            }
            "ls" => {
                let listing: String = self.list_files().iter().map(|f| format!("{}\n", f)).collect();
                let _ = out.write_all(&encode_frame(1, listing.as_bytes())).await;
                (0, false)
            }
            "cat-file" => match self.read_file(arg) {
                Some(content) => {
                    let _ = out.write_all(&encode_frame(1, &content)).await;
                    (0, false)
                }
                None => {
                    let msg = format!("cat: {}: No such file or directory\n", arg);
                    let _ = out.write_all(&encode_frame(2, msg.as_bytes())).await;
                    (1, false)
                }
            },
            "write" => {
                let (name, text) = arg.split_once(' ').unwrap_or((arg, ""));
                self.write_file(name, text.as_bytes().to_vec());
                (0, false)
            }
            other => {
                let msg = format!("/bin/sh: {}: not found\n", other);
                let _ = out.write_all(&encode_frame(2, msg.as_bytes())).await;
                (127, false)
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if spec.image.starts_with("missing") {
            return Err(SandboxError::Engine(format!("No such image: {}", spec.image)));
        }
        if let Some(binding) = &spec.volume {
            if !state.volumes.contains_key(&binding.volume) {
                return Err(SandboxError::Engine(format!("No such volume: {}", binding.volume)));
            }
        }

        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ContainerState {
                    node: self.node.clone(),
                    ..Default::default()
                },
                files: BTreeMap::new(),
                attached: None,
                task: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        let container = state.containers.get_mut(id).ok_or_else(|| no_such_container(id))?;

        let command = container
            .spec
            .command
            .as_ref()
            .and_then(|c| c.get(2).cloned())
            .unwrap_or_else(|| "true".to_string());
        let workdir = match &container.spec.volume {
            Some(binding) => Workdir::Volume(binding.volume.clone()),
            None => Workdir::Container(id.to_string(), container.spec.working_dir.clone()),
        };
        let (mut stdin, mut out): (Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>) =
            match container.attached.take() {
                Some(sock) => {
                    let (r, w) = tokio::io::split(sock);
                    (Box::new(r), Box::new(w))
                }
                None => (Box::new(tokio::io::empty()), Box::new(tokio::io::sink())),
            };

        container.state.running = true;
        container.state.exit_code = None;
        container.state.oom_killed = None;
        container.state.started_at = Some(now());
        container.state.finished_at = None;

        let program = Program {
            state: self.state.clone(),
            workdir,
        };
        let shared = self.state.clone();
        let container_id = id.to_string();
        container.task = Some(tokio::spawn(async move {
            let (exit_code, oom_killed) = program.run(&command, &mut stdin, &mut out).await;
            // The state is final before the stream closes.
            {
                let mut state = shared.lock().unwrap();
                if let Some(container) = state.containers.get_mut(&container_id) {
                    container.state.running = false;
                    container.state.exit_code = Some(exit_code);
                    container.state.oom_killed = Some(oom_killed);
                    container.state.finished_at = Some(now());
                }
            }
            if let Some(secs) = command.strip_prefix("linger ") {
                tokio::time::sleep(Duration::from_secs_f64(secs.parse().unwrap_or(0.0))).await;
            }
            drop(stdin);
            drop(out);
        }));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        let container = state.containers.get_mut(id).ok_or_else(|| no_such_container(id))?;
        if let Some(task) = container.task.take() {
            task.abort();
        }
        if container.state.running {
            container.state.running = false;
            container.state.exit_code = Some(143);
            container.state.oom_killed = Some(false);
            container.state.finished_at = Some(now());
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state.containers.remove(id).ok_or_else(|| no_such_container(id))?;
        if let Some(task) = container.task {
            task.abort();
        }
        state.removed_containers.push(id.to_string());
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>> {
        let mut state = self.state.lock().unwrap();
        let container = state.containers.get_mut(id).ok_or_else(|| no_such_container(id))?;
        let (client, server) = tokio::io::duplex(ATTACH_BUFFER);
        container.attached = Some(server);
        Ok(Box::new(client))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(id)
            .map(|c| c.state.clone())
            .ok_or_else(|| no_such_container(id))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().volumes.contains_key(name))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.volumes.remove(name).is_none() {
            return Err(SandboxError::Engine(format!("No such volume: {}", name)));
        }
        state.removed_volumes.push(name.to_string());
        Ok(())
    }

    async fn upload_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let mut entries = Vec::new();
        let mut files = Vec::new();
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
            entries.push((name.clone(), entry.header().mode()?));
            if entry.header().entry_type().is_file() {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                files.push((name, content));
            }
        }

        let mut state = self.state.lock().unwrap();
        let container = state.containers.get(id).ok_or_else(|| no_such_container(id))?;
        let binding = container.spec.volume.clone();
        let base = path.trim_end_matches('/').to_string();

        for (name, content) in files {
            let full = format!("{}/{}", base, name);
            match &binding {
                Some(b) if full.starts_with(&format!("{}/", b.target)) => {
                    let relative = full[b.target.len() + 1..].to_string();
                    state.volumes.entry(b.volume.clone()).or_default().insert(relative, content);
                }
                _ => {
                    if let Some(container) = state.containers.get_mut(id) {
                        container.files.insert(full, content);
                    }
                }
            }
        }

        state.uploads.push(Upload {
            container: id.to_string(),
            path: path.to_string(),
            entries,
        });
        Ok(())
    }
}

/// Engine whose attach sockets fail on the first read; everything else goes
/// to the wrapped [`FakeEngine`].
pub struct FailingAttachEngine {
    pub inner: Arc<FakeEngine>,
    pub kind: std::io::ErrorKind,
    pub message: &'static str,
}

#[async_trait]
impl ContainerEngine for FailingAttachEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.inner.create_container(spec).await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.inner.start_container(id).await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        self.inner.stop_container(id, grace).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.inner.remove_container(id).await
    }

    async fn attach(&self, _id: &str) -> Result<Box<dyn AttachStream>> {
        let sock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(self.kind, self.message))
            .build();
        Ok(Box::new(sock))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        self.inner.inspect_container(id).await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.inner.create_volume(name).await
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.inner.volume_exists(name).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.inner.remove_volume(name).await
    }

    async fn upload_archive(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        self.inner.upload_archive(id, path, archive).await
    }
}

/// Config with a writable `python` profile and a read-only `locked` profile.
pub fn test_config() -> Config {
    let mut python = Profile::new("python", "python:3.12-alpine");
    python.user = Some("sandbox".to_string());

    let mut locked = Profile::new("locked", "alpine:3.20");
    locked.read_only = true;

    let mut config = Config::default();
    config.profiles = vec![python, locked, Profile::new("broken", "missing:latest")];
    config
}

pub fn manager_with_config(engine: &Arc<FakeEngine>, config: Config) -> SandboxManager {
    let engine: Arc<dyn ContainerEngine> = engine.clone();
    SandboxManager::new(Arc::new(config), EngineRegistry::with_engine(engine))
}

pub fn manager(engine: &Arc<FakeEngine>) -> SandboxManager {
    manager_with_config(engine, test_config())
}
