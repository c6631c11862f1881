// Sandbox Manager - creates, runs and destroys sandbox containers
//
// A sandbox is one container bound to one profile. It can be started any
// number of times while it is created or exited; each start is one attach
// session driven by the stream pump, after which the container state is
// inspected to fill in the result.

use super::engine::{ContainerEngine, ContainerSpec, VolumeBinding};
use super::error::{PumpError, Result, SandboxError};
use super::limits::{create_ulimits, memory_bytes, merge_limits, pids_limit};
use super::outcome::{inspect_exited, is_killed_by_signal, Outcome};
use super::profile::ProfileRegistry;
use super::pump::StreamPump;
use super::registry::{EngineRegistry, RetryPolicy};
use super::stream::demultiplex;
use super::truncation::{preview, truncate_result};
use super::types::{FileEntry, Limits, Profile, RunResult, SandboxState, WorkingDirectory};
use crate::config::Config;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters of [`SandboxManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Shell command run with `/bin/sh -c`; the profile's command when unset.
    pub command: Option<String>,
    /// Overrides on top of the profile and process defaults.
    pub limits: Option<Limits>,
    /// Files placed in the working directory before the first start.
    pub files: Vec<FileEntry>,
    /// Shared working directory from [`SandboxManager::working_directory`].
    pub workdir: Option<WorkingDirectory>,
}

impl CreateOptions {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(FileEntry::new(name, content));
        self
    }

    pub fn with_files(mut self, files: Vec<FileEntry>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn with_workdir(mut self, workdir: WorkingDirectory) -> Self {
        self.workdir = Some(workdir);
        self
    }
}

/// One container bound to one profile.
///
/// Obtained from [`SandboxManager::create`] and released with
/// [`SandboxManager::destroy`].
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    container_id: String,
    profile: String,
    limits: Limits,
    state: SandboxState,
    owned_workdir: Option<WorkingDirectory>,
}

impl Sandbox {
    /// Container name, also used as the sandbox id in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Effective limits after merging overrides onto the defaults.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Wall-clock limit of one start, in seconds.
    pub fn realtime_limit(&self) -> Option<u64> {
        self.limits.realtime
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Private working directory created for this sandbox, if any.
    pub fn owned_workdir(&self) -> Option<&WorkingDirectory> {
        self.owned_workdir.as_ref()
    }

    fn violation(&self, expected: &str) -> SandboxError {
        SandboxError::StateViolation {
            sandbox: self.id.clone(),
            expected: expected.to_string(),
            actual: self.state,
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state != SandboxState::Destroyed {
            warn!(
                sandbox = %self.id,
                container = %self.container_id,
                state = %self.state,
                "Sandbox dropped without being destroyed; the container is left behind"
            );
        }
    }
}

/// Entry point for running untrusted code.
pub struct SandboxManager {
    config: Arc<Config>,
    profiles: ProfileRegistry,
    engines: EngineRegistry,
    /// Engine-call policy for create, start, stop and remove.
    default_policy: RetryPolicy,
    /// Attach and inspect may race container creation, so 404 is retried too.
    lookup_policy: RetryPolicy,
    /// Process defaults with the configured overrides applied.
    defaults: Limits,
    /// Identifies working directories handed out by this manager.
    id: Uuid,
}

impl SandboxManager {
    pub fn new(config: Arc<Config>, engines: EngineRegistry) -> Self {
        let default_policy = RetryPolicy::from_config(&config.docker);
        let lookup_policy = default_policy.clone().retry_not_found();
        let defaults = merge_limits(
            &super::types::default_limits(),
            Some(&config.sandbox.default_limits),
            config.sandbox.cpu_to_realtime_factor,
        );

        Self {
            profiles: ProfileRegistry::from_profiles(config.profiles.iter().cloned()),
            config,
            engines,
            default_policy,
            lookup_policy,
            defaults,
            id: Uuid::new_v4(),
        }
    }

    /// Validate `config` and talk to the Docker engine it names.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SandboxError::InvalidArgument(e.to_string()))?;
        let engines = EngineRegistry::docker(config.docker.clone());
        Ok(Self::new(config, engines))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    /// Process-wide default limits.
    pub fn default_limits(&self) -> &Limits {
        &self.defaults
    }

    async fn engine(&self) -> Result<Arc<dyn ContainerEngine>> {
        self.engines.get(&self.default_policy).await
    }

    async fn lookup_engine(&self) -> Result<Arc<dyn ContainerEngine>> {
        self.engines.get(&self.lookup_policy).await
    }

    fn resource_name(&self, kind: &str) -> String {
        format!("{}-{}{}", self.config.sandbox.name_prefix, kind, Uuid::new_v4())
    }

    /// Effective limits for `profile` with caller `overrides`.
    pub fn effective_limits(&self, profile: &Profile, overrides: Option<&Limits>) -> Limits {
        let factor = self.config.sandbox.cpu_to_realtime_factor;
        let base = merge_limits(&self.defaults, profile.limits.as_ref(), factor);
        merge_limits(&base, overrides, factor)
    }

    /// Create a sandbox container for `profile`.
    ///
    /// Files are written before the container ever starts. The container is
    /// removed again if any step after its creation fails.
    pub async fn create(&self, profile: &str, options: CreateOptions) -> Result<Sandbox> {
        let profile = self.profiles.get(profile)?.clone();

        if let Some(workdir) = &options.workdir {
            if workdir.owner() != self.id || workdir.is_released() {
                return Err(SandboxError::InvalidArgument(format!(
                    "Working directory {} is not a live handle of this manager",
                    workdir.volume()
                )));
            }
        }
        for file in &options.files {
            validate_file_name(file)?;
        }

        let limits = self.effective_limits(&profile, options.limits.as_ref());
        if limits.memory == Some(0) {
            return Err(SandboxError::InvalidArgument(
                "Memory limit must be greater than 0 MB".to_string(),
            ));
        }

        let engine = self.engine().await?;

        // A read-only root filesystem cannot receive files, so they go to a
        // private volume instead.
        let owned_workdir = if options.workdir.is_none() && !options.files.is_empty() && profile.read_only {
            let volume = self.resource_name("workdir-");
            engine.create_volume(&volume).await?;
            debug!(volume = %volume, "Private working directory created");
            Some(WorkingDirectory::new(volume, self.id))
        } else {
            None
        };
        let workdir = options.workdir.as_ref().or(owned_workdir.as_ref());

        let name = self.resource_name("");
        let spec = self.container_spec(&name, &profile, &options, &limits, workdir);
        info!(
            sandbox = %name,
            profile = %profile.name,
            image = %profile.docker_image,
            command = ?spec.command,
            limits = ?limits,
            workdir = ?workdir.map(|w| w.volume()),
            "Creating sandbox"
        );

        let container_id = match engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(sandbox = %name, error = %e, "Failed to create the sandbox container");
                if let Some(owned) = &owned_workdir {
                    self.release_workdir(engine.as_ref(), owned).await;
                }
                return Err(e);
            }
        };

        let mut sandbox = Sandbox {
            id: name,
            container_id,
            profile: profile.name.clone(),
            limits,
            state: SandboxState::Created,
            owned_workdir,
        };

        if let Err(e) = self.prepare(engine.as_ref(), &sandbox, &options).await {
            error!(sandbox = %sandbox.id, error = %e, "Failed to prepare the sandbox, removing it");
            if let Err(cleanup) = self.destroy(&mut sandbox).await {
                warn!(sandbox = %sandbox.id, error = %cleanup, "Failed to remove a half-created sandbox");
                sandbox.state = SandboxState::Destroyed;
            }
            return Err(e);
        }

        info!(sandbox = %sandbox.id, container = %sandbox.container_id, "Sandbox created");
        Ok(sandbox)
    }

    fn container_spec(
        &self,
        name: &str,
        profile: &Profile,
        options: &CreateOptions,
        limits: &Limits,
        workdir: Option<&WorkingDirectory>,
    ) -> ContainerSpec {
        let command = options
            .command
            .clone()
            .or_else(|| profile.command.clone())
            .map(|cmd| vec!["/bin/sh".to_string(), "-c".to_string(), cmd]);

        let mut env = Vec::new();
        if let Some(node) = workdir.and_then(|w| w.node()) {
            env.push(format!("constraint:node=={}", node));
        }

        let labels = HashMap::from([
            ("dockjail.sandbox".to_string(), name.to_string()),
            ("dockjail.profile".to_string(), profile.name.clone()),
        ]);

        ContainerSpec {
            name: name.to_string(),
            image: profile.docker_image.clone(),
            command,
            user: profile
                .user
                .clone()
                .unwrap_or_else(|| self.config.sandbox.default_user.clone()),
            working_dir: self.config.sandbox.workdir.clone(),
            read_only: profile.read_only,
            network_disabled: profile.network_disabled,
            memory: memory_bytes(limits),
            pids_limit: pids_limit(limits),
            ulimits: create_ulimits(limits),
            volume: workdir.map(|w| VolumeBinding {
                volume: w.volume().to_string(),
                target: self.config.sandbox.workdir.clone(),
            }),
            env,
            labels,
        }
    }

    /// Post-create steps: pin the working directory node and upload files.
    async fn prepare(&self, engine: &dyn ContainerEngine, sandbox: &Sandbox, options: &CreateOptions) -> Result<()> {
        let workdir = options.workdir.as_ref().or(sandbox.owned_workdir.as_ref());

        if let Some(workdir) = workdir.filter(|w| w.node().is_none()) {
            let state = self
                .lookup_engine()
                .await?
                .inspect_container(&sandbox.container_id)
                .await?;
            if let Some(node) = state.node {
                debug!(volume = %workdir.volume(), node = %node, "Working directory pinned to node");
                workdir.pin_node(node);
            }
        }

        if !options.files.is_empty() {
            let target = &self.config.sandbox.workdir;
            let (path, archive) = if workdir.is_some() {
                (target.clone(), build_archive(&options.files, None)?)
            } else {
                let dir = target.trim_start_matches('/');
                ("/".to_string(), build_archive(&options.files, Some(dir))?)
            };
            engine.upload_archive(&sandbox.container_id, &path, archive).await?;
            debug!(
                sandbox = %sandbox.id,
                files = ?super::types::filter_filenames(&options.files),
                "Files written to the working directory"
            );
        }

        Ok(())
    }

    /// Start the sandbox and communicate with it until it exits or `timeout`
    /// (by default its realtime limit) elapses.
    ///
    /// A program failing, running out of time or memory is reported in the
    /// result, not as an error. When the deadline hits, the output is empty
    /// and the container may still be running; a later start waits for it to
    /// exit first, and [`SandboxManager::stop`] ends it.
    pub async fn start(&self, sandbox: &mut Sandbox, stdin: Option<&[u8]>, timeout: Option<Duration>) -> Result<RunResult> {
        let lookup = self.lookup_engine().await?;

        match sandbox.state {
            SandboxState::Created | SandboxState::Exited => {}
            SandboxState::Running => {
                let state = lookup.inspect_container(&sandbox.container_id).await?;
                if state.running {
                    return Err(sandbox.violation("created or exited"));
                }
                sandbox.state = SandboxState::Exited;
            }
            SandboxState::Destroyed => return Err(sandbox.violation("created or exited")),
        }

        let engine = self.engine().await?;
        let deadline = timeout.or_else(|| sandbox.realtime_limit().map(Duration::from_secs));
        debug!(sandbox = %sandbox.id, ?deadline, stdin_bytes = stdin.map_or(0, <[u8]>::len), "Starting sandbox");

        let sock = lookup.attach(&sandbox.container_id).await?;
        let session_started = Instant::now();
        let start = engine.start_container(&sandbox.container_id);
        let session = StreamPump::new(sock).communicate(stdin, Some(start), deadline).await;

        let result = match session {
            Ok(raw) => {
                let outcome = inspect_exited(lookup.as_ref(), &sandbox.container_id).await;
                sandbox.state = SandboxState::Exited;
                let outcome = outcome?;
                let (stdout, stderr) = demultiplex(&raw);
                RunResult {
                    exit_code: Some(outcome.exit_code),
                    stdout,
                    stderr,
                    duration: outcome.duration,
                    // A CPU ulimit kill shows up as SIGKILL/SIGXCPU.
                    timeout: is_killed_by_signal(outcome.exit_code) && !outcome.oom_killed,
                    oom_killed: outcome.oom_killed,
                }
            }
            Err(PumpError::DeadlineExceeded(limit)) => {
                warn!(sandbox = %sandbox.id, timeout = ?limit, "Sandbox did not finish before the deadline");
                sandbox.state = SandboxState::Running;
                let state = lookup.inspect_container(&sandbox.container_id).await?;
                if state.running {
                    RunResult {
                        exit_code: None,
                        duration: session_started.elapsed().as_secs_f64(),
                        timeout: true,
                        ..Default::default()
                    }
                } else {
                    let outcome = Outcome::from_state(&state);
                    sandbox.state = SandboxState::Exited;
                    RunResult {
                        exit_code: Some(outcome.exit_code),
                        duration: outcome.duration,
                        timeout: true,
                        oom_killed: outcome.oom_killed,
                        ..Default::default()
                    }
                }
            }
            Err(PumpError::Start(e)) => {
                error!(sandbox = %sandbox.id, error = %e, "Failed to start the sandbox container");
                return Err(e);
            }
            Err(PumpError::Io(e)) => {
                error!(sandbox = %sandbox.id, error = %e, "Attach stream failed");
                // The container may have been started; the next start re-checks.
                sandbox.state = SandboxState::Running;
                return Err(SandboxError::Engine(e.to_string()));
            }
        };

        info!(
            sandbox = %sandbox.id,
            exit_code = ?result.exit_code,
            duration = result.duration,
            timeout = result.timeout,
            oom_killed = result.oom_killed,
            stdout = %preview(&result.stdout),
            stderr = %preview(&result.stderr),
            "Sandbox run finished"
        );

        Ok(truncate_result(result, self.config.sandbox.max_output_bytes))
    }

    /// Stop a sandbox left running after a timed out start.
    ///
    /// The engine sends SIGTERM, then SIGKILL after `grace`.
    pub async fn stop(&self, sandbox: &mut Sandbox, grace: Duration) -> Result<()> {
        match sandbox.state {
            SandboxState::Running => {}
            SandboxState::Created | SandboxState::Exited => return Ok(()),
            SandboxState::Destroyed => return Err(sandbox.violation("created, running or exited")),
        }

        self.engine().await?.stop_container(&sandbox.container_id, grace).await?;
        let state = self.lookup_engine().await?.inspect_container(&sandbox.container_id).await?;
        if !state.running {
            sandbox.state = SandboxState::Exited;
        }
        info!(sandbox = %sandbox.id, state = %sandbox.state, "Sandbox stopped");
        Ok(())
    }

    /// Remove the container with its anonymous volumes, and the private
    /// working directory if the sandbox owns one.
    pub async fn destroy(&self, sandbox: &mut Sandbox) -> Result<()> {
        if sandbox.state == SandboxState::Destroyed {
            return Err(sandbox.violation("created, running or exited"));
        }

        let engine = self.engine().await?;
        engine.remove_container(&sandbox.container_id).await.map_err(|e| {
            error!(sandbox = %sandbox.id, container = %sandbox.container_id, error = %e, "Failed to remove the sandbox container");
            e
        })?;
        sandbox.state = SandboxState::Destroyed;
        info!(sandbox = %sandbox.id, "Sandbox destroyed");

        if let Some(workdir) = &sandbox.owned_workdir {
            workdir.mark_released();
            engine.remove_volume(workdir.volume()).await?;
            debug!(volume = %workdir.volume(), "Private working directory removed");
        }
        Ok(())
    }

    async fn release_workdir(&self, engine: &dyn ContainerEngine, workdir: &WorkingDirectory) {
        workdir.mark_released();
        if let Err(e) = engine.remove_volume(workdir.volume()).await {
            warn!(volume = %workdir.volume(), error = %e, "Failed to remove working directory");
        }
    }

    /// Create a sandbox, start it once and destroy it.
    ///
    /// The sandbox is destroyed on every path. An error from the run itself
    /// wins over a cleanup error.
    pub async fn run(&self, profile: &str, options: CreateOptions, stdin: Option<&[u8]>) -> Result<RunResult> {
        let mut sandbox = self.create(profile, options).await?;

        let outcome = AssertUnwindSafe(self.start(&mut sandbox, stdin, None))
            .catch_unwind()
            .await;
        let destroyed = self.destroy(&mut sandbox).await;

        match outcome {
            Ok(Ok(result)) => destroyed.map(|_| result),
            Ok(Err(e)) => {
                if let Err(cleanup) = destroyed {
                    warn!(sandbox = %sandbox.id, error = %cleanup, "Failed to destroy sandbox after a failed run");
                }
                Err(e)
            }
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Provide a fresh working directory to `f` and remove it afterwards.
    ///
    /// Sandboxes created with the handle share its files. The volume is
    /// removed whether `f` returns, fails or panics; the handle is rejected
    /// by [`SandboxManager::create`] from then on.
    pub async fn working_directory<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(WorkingDirectory) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<SandboxError>,
    {
        let engine = self.engine().await?;
        let volume = self.resource_name("workdir-");
        engine.create_volume(&volume).await?;
        info!(volume = %volume, "Working directory created");

        let workdir = WorkingDirectory::new(volume, self.id);
        let outcome = AssertUnwindSafe(f(workdir.clone())).catch_unwind().await;

        workdir.mark_released();
        let removed = engine.remove_volume(workdir.volume()).await;
        match &removed {
            Ok(()) => info!(volume = %workdir.volume(), "Working directory removed"),
            Err(e) => error!(volume = %workdir.volume(), error = %e, "Failed to remove working directory"),
        }

        match outcome {
            Ok(Ok(value)) => removed.map(|_| value).map_err(E::from),
            Ok(Err(e)) => Err(e),
            Err(panic) => resume_unwind(panic),
        }
    }
}

/// Names must be relative paths without `..`.
fn validate_file_name(file: &FileEntry) -> Result<()> {
    let name = file
        .name
        .as_deref()
        .ok_or_else(|| SandboxError::InvalidArgument("File entry without a name".to_string()))?;

    let path = Path::new(name);
    let valid = !name.is_empty()
        && path.components().any(|c| matches!(c, Component::Normal(_)))
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !valid {
        return Err(SandboxError::InvalidArgument(format!(
            "File name '{}' must be a relative path without '..'",
            name
        )));
    }
    Ok(())
}

/// Tar archive of `files`, optionally inside a `dir` entry with mode 755.
fn build_archive(files: &[FileEntry], dir: Option<&str>) -> Result<Vec<u8>> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    if let Some(dir) = dir.filter(|d| !d.is_empty()) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(mtime);
        builder.append_data(&mut header, format!("{}/", dir), std::io::empty())?;
    }

    for file in files {
        let name = file.name.as_deref().unwrap_or_default();
        let path = match dir.filter(|d| !d.is_empty()) {
            Some(dir) => format!("{}/{}", dir, name),
            None => name.to_string(),
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(file.content.len() as u64);
        header.set_mtime(mtime);
        builder.append_data(&mut header, path, file.content.as_slice())?;
    }

    Ok(builder.into_inner()?)
}
