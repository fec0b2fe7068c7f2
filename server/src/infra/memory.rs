//! In-memory collaborators
//!
//! Backend, tunnel, storage and tracker implementations that keep everything
//! in process. Selected with `ENVIRONMENT_BACKEND=memory` and used by the test
//! suite. The backend understands a small shell subset (`echo`, `cat`,
//! `printenv`, `rm`, `true`, `false`, `exit N`, joined with `&&`), enough to
//! exercise command-level failures and filesystem changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::backend::ContainerBackend;
use super::storage::RemoteStorage;
use super::tracker::Tracker;
use super::tunnel::HostTunnel;
use crate::domain::container::{
    ContainerHandle, ContainerId, ExecOptions, ExecOutput, PortForward, ServiceHandle,
    TunnelHandle,
};
use crate::domain::environment::{Environment, EnvironmentConfig, PersistedEnvironment};
use crate::domain::revision::{Revision, RevisionRecord};
use crate::error::{Error, Result};

const ID_SCHEME: &str = "memory://";

/// Contents of one in-memory container state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContainer {
    pub image: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<u16>,
}

impl MemoryContainer {
    fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            let base = if self.workdir.is_empty() { "/" } else { &self.workdir };
            let rel = path.trim_start_matches("./");
            if rel == "." || rel.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", base.trim_end_matches('/'), rel)
            }
        }
    }
}

/// Container backend holding every state in memory
#[derive(Default)]
pub struct MemoryBackend {
    states: DashMap<String, MemoryContainer>,
    services: DashMap<String, MemoryContainer>,
    counter: AtomicU64,
    exec_delay_ms: AtomicU64,
    fail_exec: AtomicBool,
    fail_sync: AtomicBool,
    terminals: AtomicUsize,
    published: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every exec, to widen race windows in tests
    pub fn set_exec_delay(&self, delay: Duration) {
        self.exec_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make execs fail as if the engine were unreachable
    pub fn set_fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Make state realization fail
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a state's contents
    pub fn inspect(&self, container: &ContainerHandle) -> Option<MemoryContainer> {
        self.states.get(container.as_str()).map(|s| s.clone())
    }

    /// Forget a state, as if the engine had garbage-collected it
    pub fn evict(&self, container: &ContainerHandle) {
        self.states.remove(container.as_str());
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn get(&self, container: &ContainerHandle) -> Result<MemoryContainer> {
        self.inspect(container)
            .ok_or_else(|| Error::Backend(format!("unknown container state {container}")))
    }

    fn insert(&self, state: MemoryContainer) -> ContainerHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let key = format!("mem-{n}");
        self.states.insert(key.clone(), state);
        ContainerHandle::new(key)
    }

    fn derive(
        &self,
        container: &ContainerHandle,
        change: impl FnOnce(&mut MemoryContainer),
    ) -> Result<ContainerHandle> {
        let mut state = self.get(container)?;
        change(&mut state);
        Ok(self.insert(state))
    }
}

#[async_trait]
impl ContainerBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn from_image(&self, image: &str) -> Result<ContainerHandle> {
        Ok(self.insert(MemoryContainer {
            image: image.to_string(),
            workdir: "/".to_string(),
            ..Default::default()
        }))
    }

    async fn with_workdir(
        &self,
        container: &ContainerHandle,
        workdir: &str,
    ) -> Result<ContainerHandle> {
        self.derive(container, |s| s.workdir = workdir.to_string())
    }

    async fn with_secret_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        secret_ref: &str,
    ) -> Result<ContainerHandle> {
        self.derive(container, |s| {
            s.secrets.insert(name.to_string(), secret_ref.to_string());
        })
    }

    async fn with_env_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        value: &str,
    ) -> Result<ContainerHandle> {
        self.derive(container, |s| {
            s.env.insert(name.to_string(), value.to_string());
        })
    }

    async fn with_directory(
        &self,
        container: &ContainerHandle,
        path: &str,
        source: &Path,
    ) -> Result<ContainerHandle> {
        let mut state = self.get(container)?;
        let base = state.resolve_path(path);
        let source = source.to_path_buf();
        let files = tokio::task::spawn_blocking(move || read_tree(&source))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        for (rel, content) in files {
            state
                .files
                .insert(format!("{}/{}", base.trim_end_matches('/'), rel), content);
        }
        Ok(self.insert(state))
    }

    async fn with_exec(
        &self,
        container: &ContainerHandle,
        args: &[String],
        _opts: ExecOptions,
    ) -> Result<ExecOutput> {
        let delay = self.exec_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(Error::Backend("memory engine unreachable".to_string()));
        }

        let mut state = self.get(container)?;
        let script = script_from_args(args);
        debug!("memory exec: {:?}", script);
        let (exit_code, stdout, stderr) = run_script(&mut state, &script);

        Ok(ExecOutput {
            state: self.insert(state),
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn with_exposed_port(
        &self,
        container: &ContainerHandle,
        port: u16,
    ) -> Result<ContainerHandle> {
        self.derive(container, |s| {
            s.exposed_ports.insert(port);
        })
    }

    async fn start_service(
        &self,
        container: &ContainerHandle,
        args: &[String],
        _opts: ExecOptions,
    ) -> Result<ServiceHandle> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(Error::Backend("memory engine unreachable".to_string()));
        }

        let mut state = self.get(container)?;
        let script = script_from_args(args);
        // A service that returns immediately with an error never came up
        let (exit_code, stdout, stderr) = run_script(&mut state, &script);
        if exit_code != 0 {
            return Err(Error::CommandFailed {
                exit_code,
                stdout,
                stderr,
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("svc-{n}");
        self.services.insert(id.clone(), state);
        Ok(ServiceHandle {
            host: id.clone(),
            id,
        })
    }

    async fn sync(&self, container: &ContainerHandle) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(Error::Backend("memory engine failed to sync".to_string()));
        }
        self.get(container).map(|_| ())
    }

    async fn id(&self, container: &ContainerHandle) -> Result<ContainerId> {
        self.get(container)?;
        Ok(ContainerId::new(format!("{ID_SCHEME}{container}")))
    }

    async fn load(&self, id: &ContainerId) -> Result<ContainerHandle> {
        let key = id
            .as_str()
            .strip_prefix(ID_SCHEME)
            .ok_or_else(|| Error::Backend(format!("not a memory container id: {id}")))?;
        let handle = ContainerHandle::new(key);
        self.get(&handle)?;
        Ok(handle)
    }

    async fn publish(&self, container: &ContainerHandle, target: &str) -> Result<String> {
        self.get(container)?;
        if let Ok(mut published) = self.published.lock() {
            published.push(target.to_string());
        }
        Ok(format!("{target}@{ID_SCHEME}{container}"))
    }

    async fn terminal(&self, container: &ContainerHandle) -> Result<()> {
        self.get(container)?;
        self.terminals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn script_from_args(args: &[String]) -> String {
    match args {
        [] => String::new(),
        [_, flag, script] if flag == "-c" => script.clone(),
        other => other.join(" "),
    }
}

fn read_tree(root: &Path) -> Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                let content = std::fs::read(&path)?;
                files.push((
                    rel.to_string_lossy().into_owned(),
                    String::from_utf8_lossy(&content).into_owned(),
                ));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
        .unwrap_or(text)
}

/// Interpret a `&&`-joined script, returning (exit code, stdout, stderr)
fn run_script(state: &mut MemoryContainer, script: &str) -> (i64, String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();

    for step in script.split("&&").map(str::trim).filter(|s| !s.is_empty()) {
        let (cmd, rest) = step.split_once(' ').unwrap_or((step, ""));
        let rest = rest.trim();
        let code = match cmd {
            "true" => 0,
            "false" => 1,
            "exit" => rest.parse::<i64>().unwrap_or(0),
            "echo" => {
                let (text, target) = match rest.split_once(">>") {
                    Some((text, file)) => (text, Some((file, true))),
                    None => match rest.split_once('>') {
                        Some((text, file)) => (text, Some((file, false))),
                        None => (rest, None),
                    },
                };
                let line = format!("{}\n", unquote(text));
                match target {
                    Some((file, append)) => {
                        let path = state.resolve_path(file.trim());
                        let entry = state.files.entry(path).or_default();
                        if !append {
                            entry.clear();
                        }
                        entry.push_str(&line);
                    }
                    None => stdout.push_str(&line),
                }
                0
            }
            "cat" => {
                let path = state.resolve_path(rest);
                match state.files.get(&path) {
                    Some(content) => {
                        stdout.push_str(content);
                        0
                    }
                    None => {
                        stderr.push_str(&format!("cat: {rest}: No such file or directory\n"));
                        1
                    }
                }
            }
            "rm" => {
                let path = state.resolve_path(rest);
                if state.files.remove(&path).is_some() {
                    0
                } else {
                    stderr.push_str(&format!("rm: cannot remove '{rest}': No such file\n"));
                    1
                }
            }
            "printenv" => match state.env.get(rest).or_else(|| state.secrets.get(rest)) {
                Some(value) => {
                    stdout.push_str(&format!("{value}\n"));
                    0
                }
                None => 1,
            },
            other => {
                stderr.push_str(&format!("sh: {other}: not found\n"));
                127
            }
        };

        if code != 0 || cmd == "exit" {
            return (code, stdout, stderr);
        }
    }

    (0, stdout, stderr)
}

/// Host tunnel that only records forwards
#[derive(Default)]
pub struct MemoryTunnel {
    counter: AtomicU64,
    fail: AtomicBool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make tunnel starts fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostTunnel for MemoryTunnel {
    async fn start(
        &self,
        _service: &ServiceHandle,
        forwards: &[PortForward],
    ) -> Result<TunnelHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tunnel("memory tunnel refused".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TunnelHandle {
            ids: vec![format!("tunnel-{n}")],
            host: "127.0.0.1".to_string(),
            forwards: forwards.to_vec(),
        })
    }

    async fn external_endpoint(&self, tunnel: &TunnelHandle, host_port: u16) -> Result<String> {
        if !tunnel.forwards.iter().any(|f| f.frontend == host_port) {
            return Err(Error::Tunnel(format!("port {host_port} is not forwarded")));
        }
        Ok(format!("{}:{}", tunnel.host, host_port))
    }

    async fn internal_endpoint(&self, service: &ServiceHandle, port: u16) -> Result<String> {
        Ok(format!("{}:{}", service.host, port))
    }
}

/// What [`MemoryStorage`] keeps for one environment
#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    pub project: String,
    pub config: Option<EnvironmentConfig>,
    pub revisions: Vec<RevisionRecord>,
    pub notes: Vec<String>,
    pub patches: Vec<String>,
}

/// Remote storage kept in process
#[derive(Default)]
pub struct MemoryStorage {
    projects: DashMap<String, ()>,
    records: DashMap<String, MemoryRecord>,
    save_delay_ms: AtomicU64,
    fail_delete: AtomicBool,
    fail_save: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every save, to make commit sections observable in tests
    pub fn set_save_delay(&self, delay: Duration) {
        self.save_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, env_id: &str) -> Option<MemoryRecord> {
        self.records.get(env_id).map(|r| r.clone())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Seed a persisted record, as a previous process would have left it
    pub fn insert_record(&self, env_id: &str, record: MemoryRecord) {
        self.projects.insert(record.project.clone(), ());
        self.records.insert(env_id.to_string(), record);
    }

    fn ensure_project(&self, project: &str) -> Result<()> {
        if self.projects.contains_key(project) {
            Ok(())
        } else {
            Err(Error::Storage(format!("no remote for project {project}")))
        }
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn remote_url(&self, project: &str) -> Result<String> {
        self.projects.insert(project.to_string(), ());
        Ok(format!("memory://{project}"))
    }

    async fn create(&self, env: &Environment) -> Result<()> {
        let project = env.repo_name();
        self.ensure_project(&project)?;
        self.records
            .entry(env.id().to_string())
            .or_insert_with(|| MemoryRecord {
                project,
                ..Default::default()
            });
        Ok(())
    }

    async fn save(&self, env: &Environment, revision: &Revision) -> Result<()> {
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory storage refused save".to_string()));
        }

        let mut config = env.config().await;
        config.instructions.clear();

        let mut record = self
            .records
            .get_mut(env.id())
            .ok_or_else(|| Error::RecordNotFound(env.id().to_string()))?;
        record.config = Some(config);
        record.revisions.push(RevisionRecord::from(revision));
        Ok(())
    }

    async fn note(&self, env: &Environment, text: &str) -> Result<()> {
        let mut record = self
            .records
            .get_mut(env.id())
            .ok_or_else(|| Error::RecordNotFound(env.id().to_string()))?;
        record.notes.push(text.to_string());
        Ok(())
    }

    async fn patch(&self, env: &Environment, diff: &str) -> Result<()> {
        let mut record = self
            .records
            .get_mut(env.id())
            .ok_or_else(|| Error::RecordNotFound(env.id().to_string()))?;
        record.patches.push(diff.to_string());
        Ok(())
    }

    async fn load(&self, env: &Environment) -> Result<PersistedEnvironment> {
        let record = self
            .records
            .get(env.id())
            .ok_or_else(|| Error::RecordNotFound(env.id().to_string()))?;
        let config = record
            .config
            .clone()
            .ok_or_else(|| Error::RecordNotFound(env.id().to_string()))?;
        Ok(PersistedEnvironment {
            config,
            revisions: record.revisions.clone(),
        })
    }

    async fn delete(&self, repo_name: &str, env_id: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "memory storage refused to delete {repo_name}/{env_id}"
            )));
        }
        self.records.remove(env_id);
        Ok(())
    }

    async fn base_project_dir(&self, env: &Environment) -> Result<PathBuf> {
        Ok(env.source().to_path_buf())
    }
}

/// Tracker that records every action in memory
#[derive(Default)]
pub struct MemoryTracker {
    messages: DashMap<String, Vec<String>>,
    notes: DashMap<String, Vec<String>>,
    diff: Mutex<String>,
    fail_delete: AtomicBool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff reported as uncommitted source changes
    pub fn set_diff(&self, diff: impl Into<String>) {
        if let Ok(mut current) = self.diff.lock() {
            *current = diff.into();
        }
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn is_tracked(&self, env_id: &str) -> bool {
        self.messages.contains_key(env_id)
    }

    pub fn messages(&self, env_id: &str) -> Vec<String> {
        self.messages
            .get(env_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn notes(&self, env_id: &str) -> Vec<String> {
        self.notes.get(env_id).map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn setup(&self, env: &Environment) -> Result<()> {
        self.messages.entry(env.id().to_string()).or_default();
        Ok(())
    }

    async fn propagate(&self, env: &Environment, message: &str, _explanation: &str) -> Result<()> {
        let mut messages = self
            .messages
            .get_mut(env.id())
            .ok_or_else(|| Error::Tracking(format!("no tracking reference for {}", env.id())))?;
        messages.push(message.to_string());
        Ok(())
    }

    async fn delete(&self, env: &Environment) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Tracking(format!(
                "cannot delete tracking reference for {}",
                env.id()
            )));
        }
        self.messages.remove(env.id());
        self.notes.remove(env.id());
        Ok(())
    }

    async fn append_note(&self, env: &Environment, text: &str) -> Result<()> {
        self.notes
            .entry(env.id().to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn uncommitted_diff(&self, _env: &Environment) -> Result<String> {
        Ok(self.diff.lock().map(|d| d.clone()).unwrap_or_default())
    }
}
