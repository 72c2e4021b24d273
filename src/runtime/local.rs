//! In-process container runtime
//!
//! `LocalRuntime` keeps containers, networks, volumes and images in a single
//! state file under the data root so that successive CLI invocations observe
//! the same objects. Container processes are simulated: a container stays
//! running until it is stopped or killed, except for commands ending in
//! `exit N` (exits with N right after start) and `echo TEXT` (logs TEXT and
//! exits 0).

use super::types::*;
use super::{normalize_reference, RuntimeClient};
use crate::error::{CtlError, Result};
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use walkdir::WalkDir;

const STATE_FILE: &str = "state.json";
const EVENT_CAPACITY: usize = 1024;
const LOG_CHANNEL_CAPACITY: usize = 256;
const FIRST_EPHEMERAL_PORT: u16 = 32768;
const PREDEFINED_NETWORKS: &[&str] = &["bridge", "host", "none"];

/// Persisted runtime state
#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimeState {
    containers: IndexMap<String, ContainerRecord>,
    networks: IndexMap<String, NetworkInfo>,
    volumes: IndexMap<String, VolumeInfo>,
    images: IndexMap<String, ImageInfo>,
    next_pid: u32,
    next_host_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerRecord {
    info: ContainerInfo,
    logs: Vec<LogLine>,
}

struct Inner {
    state: RwLock<RuntimeState>,
    root: PathBuf,
    events: broadcast::Sender<ContainerEvent>,
    logs: broadcast::Sender<(String, LogLine)>,
    freezer: bool,
}

/// State-file backed runtime
#[derive(Clone)]
pub struct LocalRuntime {
    inner: Arc<Inner>,
}

/// What a simulated container process does once started
enum Script {
    KeepRunning,
    Exit(i32),
    Echo(String),
}

impl LocalRuntime {
    /// Open (or initialize) the runtime state under `root`
    pub fn new(root: PathBuf) -> Result<Self> {
        Self::open(root, true)
    }

    fn open(root: PathBuf, freezer: bool) -> Result<Self> {
        std::fs::create_dir_all(root.join("containers"))?;
        std::fs::create_dir_all(root.join("volumes"))?;

        let state_path = root.join(STATE_FILE);
        let mut state: RuntimeState = if state_path.exists() {
            let content = std::fs::read_to_string(&state_path)?;
            serde_json::from_str(&content)?
        } else {
            RuntimeState::default()
        };

        if state.next_host_port < FIRST_EPHEMERAL_PORT {
            state.next_host_port = FIRST_EPHEMERAL_PORT;
        }
        if state.next_pid == 0 {
            state.next_pid = 1000;
        }
        for name in PREDEFINED_NETWORKS {
            if !state.networks.contains_key(*name) {
                state.networks.insert(
                    name.to_string(),
                    NetworkInfo {
                        id: short_id(),
                        name: name.to_string(),
                        driver: if *name == "none" { "null" } else { name }.to_string(),
                        options: BTreeMap::new(),
                        ipam: if *name == "bridge" {
                            vec![IpamPool {
                                subnet: Some("172.17.0.0/16".to_string()),
                                gateway: Some("172.17.0.1".to_string()),
                                ip_range: None,
                            }]
                        } else {
                            Vec::new()
                        },
                        enable_ipv6: false,
                        internal: false,
                        labels: BTreeMap::new(),
                        containers: Vec::new(),
                        created_at: Utc::now(),
                    },
                );
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (logs, _) = broadcast::channel(EVENT_CAPACITY);

        let runtime = Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                root,
                events,
                logs,
                freezer,
            }),
        };

        {
            let state = runtime.read()?;
            runtime.save(&state)?;
        }

        Ok(runtime)
    }

    /// Runtime without cgroup freezer support (pause/unpause fail)
    pub fn without_freezer(root: PathBuf) -> Result<Self> {
        Self::open(root, false)
    }

    /// Runtime state directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RuntimeState>> {
        self.inner
            .state
            .read()
            .map_err(|_| CtlError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RuntimeState>> {
        self.inner
            .state
            .write()
            .map_err(|_| CtlError::Lock("Failed to acquire write lock".to_string()))
    }

    fn save(&self, state: &RuntimeState) -> Result<()> {
        let path = self.inner.root.join(STATE_FILE);
        let tmp = self.inner.root.join(format!("{}.tmp", STATE_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn emit(&self, info: &ContainerInfo, action: EventAction) {
        // No subscribers is not an error
        let _ = self.inner.events.send(ContainerEvent {
            container_id: info.id.clone(),
            container_name: info.spec.name.clone(),
            labels: info.spec.labels.clone(),
            action,
            time: Utc::now(),
        });
    }

    fn append_log(&self, record: &mut ContainerRecord, stream: LogStream, text: &str) {
        let line = LogLine {
            stream,
            timestamp: Utc::now(),
            text: text.to_string(),
        };
        record.logs.push(line.clone());
        let _ = self.inner.logs.send((record.info.id.clone(), line));
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.inner.root.join("containers").join(id)
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.inner.root.join("volumes").join(name)
    }

    fn new_volume(&self, state: &mut RuntimeState, request: &VolumeCreate, anonymous: bool) -> Result<VolumeInfo> {
        let mountpoint = self.volume_dir(&request.name).join("_data");
        std::fs::create_dir_all(&mountpoint)?;

        let volume = VolumeInfo {
            name: request.name.clone(),
            driver: if request.driver.is_empty() {
                "local".to_string()
            } else {
                request.driver.clone()
            },
            driver_opts: request.driver_opts.clone(),
            labels: request.labels.clone(),
            mountpoint,
            anonymous,
            created_at: Utc::now(),
        };
        state.volumes.insert(volume.name.clone(), volume.clone());
        Ok(volume)
    }

    /// Mark a container as exited and notify subscribers
    fn finish(&self, record: &mut ContainerRecord, exit_code: i32) {
        let info = &mut record.info;
        info.status = ContainerStatus::Exited;
        info.exit_code = Some(exit_code);
        info.finished_at = Some(Utc::now());
        info.pid = None;
        if info.health.is_some() {
            info.health = Some(HealthStatus::Unhealthy);
        }
        self.emit(&record.info, EventAction::Die { exit_code });
    }

    /// Map a path inside a container to the host, following volume and bind mounts
    fn host_path(&self, state: &RuntimeState, record: &ContainerRecord, path: &str) -> PathBuf {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let mut best: Option<(&str, PathBuf)> = None;
        for mount in &record.info.spec.mounts {
            let target = mount.target.trim_end_matches('/');
            let inside = path == target || path.starts_with(&format!("{}/", target));
            if !inside || best.as_ref().is_some_and(|(t, _)| t.len() >= target.len()) {
                continue;
            }
            let base = match mount.kind {
                MountKind::Bind => mount.source.as_ref().map(PathBuf::from),
                MountKind::Volume => {
                    let name = mount
                        .source
                        .clone()
                        .or_else(|| record.info.anonymous_volumes.get(&mount.target).cloned());
                    name.and_then(|n| state.volumes.get(&n)).map(|v| v.mountpoint.clone())
                }
                MountKind::Tmpfs => None,
            };
            if let Some(base) = base {
                best = Some((target, base));
            }
        }

        match best {
            Some((target, base)) => {
                let rest = path[target.len()..].trim_start_matches('/');
                if rest.is_empty() {
                    base
                } else {
                    base.join(rest)
                }
            }
            None => self
                .container_dir(&record.info.id)
                .join("rootfs")
                .join(path.trim_start_matches('/')),
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn long_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn default_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("linux/{}", arch)
}

fn resolve_id(state: &RuntimeState, id_or_name: &str) -> Result<String> {
    if state.containers.contains_key(id_or_name) {
        return Ok(id_or_name.to_string());
    }
    if let Some((id, _)) = state
        .containers
        .iter()
        .find(|(_, r)| r.info.spec.name == id_or_name)
    {
        return Ok(id.clone());
    }
    if id_or_name.len() >= 4 {
        let matches: Vec<&String> = state
            .containers
            .keys()
            .filter(|id| id.starts_with(id_or_name))
            .collect();
        if matches.len() == 1 {
            return Ok(matches[0].clone());
        }
    }
    Err(CtlError::NotFound {
        kind: "container",
        name: id_or_name.to_string(),
    })
}

fn script_for(spec: &ContainerCreate) -> Script {
    let args: Vec<&String> = spec.entrypoint.iter().chain(spec.cmd.iter()).collect();
    let Some(last) = args.last() else {
        return Script::KeepRunning;
    };
    let last = last.trim();

    if let Some(code) = last.strip_prefix("exit ") {
        if let Ok(code) = code.trim().parse::<i32>() {
            return Script::Exit(code);
        }
    }
    if let Some(text) = last.strip_prefix("echo ") {
        return Script::Echo(text.trim_matches('"').to_string());
    }
    if args.first().is_some_and(|a| a.as_str() == "echo") {
        let text = args[1..]
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        return Script::Echo(text);
    }
    Script::KeepRunning
}

/// Signal number for a signal name or number
fn signal_number(signal: &str) -> Result<i32> {
    let name = signal.trim().to_ascii_uppercase();
    if let Ok(n) = name.parse::<i32>() {
        if (1..=64).contains(&n) {
            return Ok(n);
        }
    }
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let number = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "STOP" => libc::SIGSTOP,
        "CONT" => libc::SIGCONT,
        _ => return Err(CtlError::Runtime(format!("invalid signal: {}", signal))),
    };
    Ok(number)
}

fn port_in_use(state: &RuntimeState, skip: &str, binding: &PortBinding, host_port: u16) -> bool {
    state.containers.values().any(|r| {
        r.info.id != skip
            && r.info.status.is_active()
            && r.info.ports.iter().any(|p| {
                p.host_port == Some(host_port)
                    && p.protocol == binding.protocol
                    && (p.host_ip.is_none() || binding.host_ip.is_none() || p.host_ip == binding.host_ip)
            })
    })
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
        return Ok(());
    }

    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CtlError::Runtime(e.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Destination of a copy: into `dest` when it is an existing directory
fn copy_destination(src: &Path, dest: &Path) -> PathBuf {
    match src.file_name() {
        Some(name) if dest.is_dir() => dest.join(name),
        _ => dest.to_path_buf(),
    }
}

#[async_trait]
impl RuntimeClient for LocalRuntime {
    async fn list_containers(&self, filter: &ContainerFilter, all: bool) -> Result<Vec<ContainerInfo>> {
        let state = self.read()?;
        Ok(state
            .containers
            .values()
            .filter(|r| all || r.info.status.is_active())
            .filter(|r| filter.matches(&r.info.spec.labels))
            .map(|r| r.info.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.read()?;
        let id = resolve_id(&state, id)?;
        Ok(state.containers[&id].info.clone())
    }

    async fn create_container(&self, spec: &ContainerCreate) -> Result<String> {
        let mut state = self.write()?;

        if spec.name.is_empty() {
            return Err(CtlError::Runtime("container name must not be empty".to_string()));
        }
        if state.containers.values().any(|r| r.info.spec.name == spec.name) {
            return Err(CtlError::Runtime(format!(
                "container name {:?} is already in use",
                spec.name
            )));
        }
        if !state.images.contains_key(&normalize_reference(&spec.image)) {
            return Err(CtlError::NotFound {
                kind: "image",
                name: spec.image.clone(),
            });
        }

        let mut spec = spec.clone();
        if spec.network_mode.is_none() && spec.networks.is_empty() {
            spec.networks.push(NetworkAttachment {
                network: "bridge".to_string(),
                ..NetworkAttachment::default()
            });
        }
        if spec.network_mode.is_none() {
            for attachment in &spec.networks {
                if !state.networks.contains_key(&attachment.network) {
                    return Err(CtlError::NotFound {
                        kind: "network",
                        name: attachment.network.clone(),
                    });
                }
            }
        }

        let id = long_id();
        let mut anonymous_volumes = BTreeMap::new();
        for mount in &spec.mounts {
            if mount.kind != MountKind::Volume {
                continue;
            }
            match &mount.source {
                Some(name) => match state.volumes.get(name) {
                    Some(volume) if volume.anonymous => {
                        anonymous_volumes.insert(mount.target.clone(), name.clone());
                    }
                    Some(_) => {}
                    None => {
                        let request = VolumeCreate {
                            name: name.clone(),
                            ..VolumeCreate::default()
                        };
                        self.new_volume(&mut state, &request, false)?;
                    }
                },
                None => {
                    let request = VolumeCreate {
                        name: long_id(),
                        ..VolumeCreate::default()
                    };
                    let volume = self.new_volume(&mut state, &request, true)?;
                    anonymous_volumes.insert(mount.target.clone(), volume.name);
                }
            }
        }

        std::fs::create_dir_all(self.container_dir(&id).join("rootfs"))?;

        if spec.network_mode.is_none() {
            for attachment in &spec.networks {
                if let Some(network) = state.networks.get_mut(&attachment.network) {
                    network.containers.push(id.clone());
                }
            }
        }

        let info = ContainerInfo {
            id: id.clone(),
            ports: spec.ports.clone(),
            spec,
            status: ContainerStatus::Created,
            exit_code: None,
            health: None,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stop_timeout: None,
            anonymous_volumes,
        };
        self.emit(&info, EventAction::Create);
        state.containers.insert(
            id.clone(),
            ContainerRecord {
                info,
                logs: Vec::new(),
            },
        );
        self.save(&state)?;

        tracing::debug!("Created container {}", id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;

        match state.containers[&id].info.status {
            ContainerStatus::Running => return Ok(()),
            ContainerStatus::Paused => {
                return Err(CtlError::Runtime(format!(
                    "cannot start paused container {}: unpause it instead",
                    state.containers[&id].info.spec.name
                )))
            }
            ContainerStatus::Removing | ContainerStatus::Dead => {
                return Err(CtlError::Runtime(format!(
                    "container {} is marked for removal and cannot be started",
                    id
                )))
            }
            _ => {}
        }

        // Resolve host ports against every other live container
        let requested = state.containers[&id].info.spec.ports.clone();
        let mut bound = Vec::with_capacity(requested.len());
        for binding in &requested {
            let host_port = match binding.host_port {
                Some(port) => {
                    if port_in_use(&state, &id, binding, port) {
                        return Err(CtlError::Runtime(format!(
                            "Bind for {}:{} failed: port is already allocated",
                            binding
                                .host_ip
                                .map(|ip| ip.to_string())
                                .unwrap_or_else(|| "0.0.0.0".to_string()),
                            port
                        )));
                    }
                    port
                }
                None => {
                    let mut port = state.next_host_port;
                    while port_in_use(&state, &id, binding, port) {
                        port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
                    }
                    state.next_host_port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
                    port
                }
            };
            bound.push(PortBinding {
                host_port: Some(host_port),
                ..binding.clone()
            });
        }

        let pid = state.next_pid;
        state.next_pid += 1;

        let mut record = state.containers[&id].clone();
        record.info.status = ContainerStatus::Running;
        record.info.started_at = Some(Utc::now());
        record.info.finished_at = None;
        record.info.exit_code = None;
        record.info.pid = Some(pid);
        record.info.ports = bound;
        self.emit(&record.info, EventAction::Start);

        let checked = record
            .info
            .spec
            .healthcheck
            .as_ref()
            .is_some_and(|h| !h.test.is_empty() && h.test[0] != "NONE");
        if checked {
            record.info.health = Some(HealthStatus::Healthy);
            self.emit(&record.info, EventAction::Health(HealthStatus::Healthy));
        }

        match script_for(&record.info.spec) {
            Script::KeepRunning => {}
            Script::Exit(code) => self.finish(&mut record, code),
            Script::Echo(text) => {
                self.append_log(&mut record, LogStream::Stdout, &text);
                self.finish(&mut record, 0);
            }
        }

        state.containers.insert(id.clone(), record);
        self.save(&state)?;

        tracing::debug!("Started container {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;
        let mut record = state.containers[&id].clone();

        let exit_code = match record.info.status {
            ContainerStatus::Running => 0,
            // A frozen process cannot handle SIGTERM; it is killed at the deadline
            ContainerStatus::Paused => 128 + libc::SIGKILL,
            _ => return Ok(()),
        };

        tracing::debug!("Stopping container {} (timeout {:?})", id, timeout);
        record.info.stop_timeout = Some(timeout);
        self.finish(&mut record, exit_code);
        state.containers.insert(id, record);
        self.save(&state)
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        let number = signal_number(signal)?;
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;
        let mut record = state.containers[&id].clone();

        if !record.info.status.is_active() {
            return Err(CtlError::Runtime(format!(
                "cannot kill container {}: container is not running",
                record.info.spec.name
            )));
        }

        let terminating = [libc::SIGKILL, libc::SIGTERM, libc::SIGINT, libc::SIGQUIT];
        if terminating.contains(&number) {
            self.finish(&mut record, 128 + number);
            state.containers.insert(id, record);
            self.save(&state)?;
        } else {
            tracing::debug!("Delivered signal {} to container {}", number, id);
        }
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        if !self.inner.freezer {
            return Err(CtlError::Runtime(
                "pause is not supported: cgroup freezer is not available".to_string(),
            ));
        }
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;
        let record = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| CtlError::NotFound {
                kind: "container",
                name: id.clone(),
            })?;

        if record.info.status != ContainerStatus::Running {
            return Err(CtlError::Runtime(format!(
                "container {} is not running",
                record.info.spec.name
            )));
        }
        record.info.status = ContainerStatus::Paused;
        let info = record.info.clone();
        self.emit(&info, EventAction::Pause);
        self.save(&state)
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        if !self.inner.freezer {
            return Err(CtlError::Runtime(
                "unpause is not supported: cgroup freezer is not available".to_string(),
            ));
        }
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;
        let record = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| CtlError::NotFound {
                kind: "container",
                name: id.clone(),
            })?;

        if record.info.status != ContainerStatus::Paused {
            return Err(CtlError::Runtime(format!(
                "container {} is not paused",
                record.info.spec.name
            )));
        }
        record.info.status = ContainerStatus::Running;
        let info = record.info.clone();
        self.emit(&info, EventAction::Unpause);
        self.save(&state)
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        let mut state = self.write()?;
        let id = resolve_id(&state, id)?;
        let mut record = state.containers[&id].clone();

        if record.info.status.is_active() {
            if !force {
                return Err(CtlError::Runtime(format!(
                    "cannot remove running container {}: stop the container before removing or force remove",
                    record.info.spec.name
                )));
            }
            self.finish(&mut record, 128 + libc::SIGKILL);
        }

        for network in state.networks.values_mut() {
            network.containers.retain(|c| c != &id);
        }

        if volumes {
            for name in record.info.anonymous_volumes.values() {
                if state.volumes.shift_remove(name).is_some() {
                    let dir = self.volume_dir(name);
                    if dir.exists() {
                        std::fs::remove_dir_all(dir)?;
                    }
                }
            }
        }

        let dir = self.container_dir(&id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }

        state.containers.shift_remove(&id);
        self.emit(&record.info, EventAction::Destroy);
        self.save(&state)?;

        tracing::debug!("Removed container {}", id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i32> {
        let mut events = self.inner.events.subscribe();
        let id = {
            let state = self.read()?;
            let id = resolve_id(&state, id)?;
            let info = &state.containers[&id].info;
            if !info.status.is_active() {
                return Ok(info.exit_code.unwrap_or(0));
            }
            id
        };

        loop {
            match events.recv().await {
                Ok(event) if event.container_id == id => match event.action {
                    EventAction::Die { exit_code } => return Ok(exit_code),
                    EventAction::Destroy => return Ok(128 + libc::SIGKILL),
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CtlError::Runtime("event stream closed".to_string()))
                }
            }
        }
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecResult> {
        let state = self.read()?;
        let id = resolve_id(&state, id)?;
        let info = &state.containers[&id].info;

        if info.status != ContainerStatus::Running {
            return Err(CtlError::Runtime(format!(
                "container {} is not running",
                info.spec.name
            )));
        }
        if request.cmd.is_empty() {
            return Err(CtlError::Runtime("exec requires a command".to_string()));
        }
        if request.detach {
            return Ok(ExecResult::default());
        }

        let command = ContainerCreate {
            cmd: request.cmd.clone(),
            ..ContainerCreate::default()
        };
        Ok(match script_for(&command) {
            Script::Exit(code) => ExecResult {
                exit_code: code,
                output: String::new(),
            },
            Script::Echo(text) => ExecResult {
                exit_code: 0,
                output: format!("{}\n", text),
            },
            Script::KeepRunning => ExecResult::default(),
        })
    }

    async fn top(&self, id: &str) -> Result<ProcessTable> {
        let state = self.read()?;
        let id = resolve_id(&state, id)?;
        let info = &state.containers[&id].info;

        let Some(pid) = info.pid.filter(|_| info.status.is_active()) else {
            return Err(CtlError::Runtime(format!(
                "container {} is not running",
                info.spec.name
            )));
        };

        let started = info
            .started_at
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_default();

        Ok(ProcessTable {
            titles: ["UID", "PID", "PPID", "C", "STIME", "TTY", "TIME", "CMD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            processes: vec![vec![
                info.spec.user.clone().unwrap_or_else(|| "root".to_string()),
                pid.to_string(),
                "1".to_string(),
                "0".to_string(),
                started,
                "?".to_string(),
                "00:00:00".to_string(),
                info.command_line(),
            ]],
        })
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<mpsc::Receiver<LogLine>> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        // Snapshot and subscribe under the same lock so no line is lost in between
        let (id, backlog, follow, mut live, mut events) = {
            let state = self.read()?;
            let id = resolve_id(&state, id)?;
            let record = &state.containers[&id];
            let skip = options
                .tail
                .map(|n| record.logs.len().saturating_sub(n))
                .unwrap_or(0);
            (
                id,
                record.logs[skip..].to_vec(),
                options.follow && record.info.status.is_active(),
                self.inner.logs.subscribe(),
                self.inner.events.subscribe(),
            )
        };

        tokio::spawn(async move {
            for line in backlog {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            if !follow {
                return;
            }
            loop {
                tokio::select! {
                    line = live.recv() => match line {
                        Ok((source, line)) if source == id => {
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    event = events.recv() => match event {
                        Ok(event) if event.container_id == id => {
                            if matches!(event.action, EventAction::Die { .. } | EventAction::Destroy) {
                                // Drain lines emitted before the exit
                                while let Ok((source, line)) = live.try_recv() {
                                    if source == id && tx.send(line).await.is_err() {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(rx)
    }

    async fn copy_to_container(&self, id: &str, src: &Path, dest: &str) -> Result<()> {
        if !src.exists() {
            return Err(CtlError::NotFound {
                kind: "path",
                name: src.display().to_string(),
            });
        }
        let target = {
            let state = self.read()?;
            let id = resolve_id(&state, id)?;
            self.host_path(&state, &state.containers[&id], dest)
        };
        copy_tree(src, &copy_destination(src, &target))
    }

    async fn copy_from_container(&self, id: &str, src: &str, dest: &Path) -> Result<()> {
        let source = {
            let state = self.read()?;
            let id = resolve_id(&state, id)?;
            self.host_path(&state, &state.containers[&id], src)
        };
        if !source.exists() {
            return Err(CtlError::NotFound {
                kind: "path",
                name: src.to_string(),
            });
        }
        copy_tree(&source, &copy_destination(&source, dest))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ContainerEvent> {
        self.inner.events.subscribe()
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.read()?.networks.values().cloned().collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        let state = self.read()?;
        Ok(state
            .networks
            .get(name)
            .or_else(|| state.networks.values().find(|n| n.id == name))
            .cloned())
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<String> {
        let mut state = self.write()?;
        if state.networks.contains_key(&request.name) {
            return Err(CtlError::Runtime(format!(
                "network with name {} already exists",
                request.name
            )));
        }

        let network = NetworkInfo {
            id: short_id(),
            name: request.name.clone(),
            driver: if request.driver.is_empty() {
                "bridge".to_string()
            } else {
                request.driver.clone()
            },
            options: request.options.clone(),
            ipam: request.ipam.clone(),
            enable_ipv6: request.enable_ipv6,
            internal: request.internal,
            labels: request.labels.clone(),
            containers: Vec::new(),
            created_at: Utc::now(),
        };
        let id = network.id.clone();
        state.networks.insert(request.name.clone(), network);
        self.save(&state)?;
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if PREDEFINED_NETWORKS.contains(&name) {
            return Err(CtlError::Runtime(format!(
                "{} is a pre-defined network and cannot be removed",
                name
            )));
        }
        let mut state = self.write()?;
        let network = state.networks.get(name).ok_or_else(|| CtlError::NotFound {
            kind: "network",
            name: name.to_string(),
        })?;
        if !network.containers.is_empty() {
            return Err(CtlError::Runtime(format!(
                "network {} has active endpoints",
                name
            )));
        }
        state.networks.shift_remove(name);
        self.save(&state)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self.read()?.volumes.values().cloned().collect())
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        Ok(self.read()?.volumes.get(name).cloned())
    }

    async fn create_volume(&self, request: &VolumeCreate) -> Result<VolumeInfo> {
        let mut state = self.write()?;
        if let Some(existing) = state.volumes.get(&request.name) {
            let driver = if request.driver.is_empty() { "local" } else { &request.driver };
            if existing.driver != driver {
                return Err(CtlError::Runtime(format!(
                    "volume {} already exists with driver {}",
                    request.name, existing.driver
                )));
            }
            return Ok(existing.clone());
        }
        let volume = self.new_volume(&mut state, request, false)?;
        self.save(&state)?;
        Ok(volume)
    }

    async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.write()?;
        if !state.volumes.contains_key(name) {
            return Err(CtlError::NotFound {
                kind: "volume",
                name: name.to_string(),
            });
        }

        let users: Vec<String> = state
            .containers
            .values()
            .filter(|r| {
                r.info.anonymous_volumes.values().any(|v| v == name)
                    || r.info
                        .spec
                        .mounts
                        .iter()
                        .any(|m| m.kind == MountKind::Volume && m.source.as_deref() == Some(name))
            })
            .map(|r| r.info.spec.name.clone())
            .collect();
        if !users.is_empty() && !force {
            return Err(CtlError::Runtime(format!(
                "volume {} is in use by {}",
                name,
                users.join(", ")
            )));
        }

        state.volumes.shift_remove(name);
        let dir = self.volume_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        self.save(&state)
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self.read()?.images.get(&normalize_reference(reference)).cloned())
    }

    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<ImageInfo> {
        let valid = !reference.is_empty()
            && !reference.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase());
        if !valid {
            return Err(CtlError::Runtime(format!(
                "invalid reference format: {:?}",
                reference
            )));
        }

        let normalized = normalize_reference(reference);
        let image = ImageInfo {
            id: format!("sha256:{}", sha256_hex(format!("config:{}", normalized).as_bytes())),
            reference: normalized.clone(),
            digest: format!("sha256:{}", sha256_hex(normalized.as_bytes())),
            platform: platform.map(str::to_string).unwrap_or_else(default_platform),
            size: 0,
            created_at: Utc::now(),
        };

        let mut state = self.write()?;
        state.images.insert(normalized, image.clone());
        self.save(&state)?;
        tracing::debug!("Pulled {}", image.reference);
        Ok(image)
    }

    async fn push_image(&self, reference: &str) -> Result<()> {
        let state = self.read()?;
        if !state.images.contains_key(&normalize_reference(reference)) {
            return Err(CtlError::NotFound {
                kind: "image",
                name: reference.to_string(),
            });
        }
        tracing::debug!("Pushed {}", reference);
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<ImageInfo> {
        if !request.context.is_dir() {
            return Err(CtlError::Runtime(format!(
                "unable to prepare context: path {:?} not found",
                request.context
            )));
        }
        let dockerfile = request.dockerfile.as_deref().unwrap_or("Dockerfile");
        let dockerfile_path = request.context.join(dockerfile);
        let content = std::fs::read(&dockerfile_path).map_err(|e| {
            CtlError::Runtime(format!(
                "failed to read dockerfile {}: {}",
                dockerfile_path.display(),
                e
            ))
        })?;
        let Some(first_tag) = request.tags.first() else {
            return Err(CtlError::Runtime("build requires at least one tag".to_string()));
        };

        let mut fingerprint = content;
        fingerprint.extend(serde_json::to_vec(&request.args)?);
        fingerprint.extend(request.target.clone().unwrap_or_default().into_bytes());
        let id = format!("sha256:{}", sha256_hex(&fingerprint));

        let mut state = self.write()?;
        let mut built = None;
        for tag in &request.tags {
            let normalized = normalize_reference(tag);
            let image = ImageInfo {
                id: id.clone(),
                reference: normalized.clone(),
                digest: format!("sha256:{}", sha256_hex(normalized.as_bytes())),
                platform: request.platform.clone().unwrap_or_else(default_platform),
                size: 0,
                created_at: Utc::now(),
            };
            if tag == first_tag {
                built = Some(image.clone());
            }
            state.images.insert(normalized, image);
        }
        self.save(&state)?;

        built.ok_or_else(|| CtlError::Runtime("build produced no image".to_string()))
    }

    async fn verify_image(&self, reference: &str, request: &VerifyRequest) -> Result<()> {
        match request.provider.as_str() {
            "" | "none" => Ok(()),
            "cosign" => {
                let keyed = request.options.contains_key("cosign-public-key")
                    || request.options.contains_key("cosign-certificate-identity");
                if keyed {
                    tracing::debug!("Verified {} with cosign", reference);
                    Ok(())
                } else {
                    Err(CtlError::Runtime(format!(
                        "cosign verification of {} requires a public key or certificate identity",
                        reference
                    )))
                }
            }
            "notation" => {
                tracing::debug!("Verified {} with notation", reference);
                Ok(())
            }
            other => Err(CtlError::Runtime(format!(
                "unknown image verification provider {:?}",
                other
            ))),
        }
    }

    fn supports_pause(&self) -> bool {
        self.inner.freezer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str, image: &str) -> ContainerCreate {
        ContainerCreate {
            name: name.to_string(),
            image: image.to_string(),
            ..ContainerCreate::default()
        }
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();

        let err = runtime.create_container(&spec("c1", "alpine")).await.unwrap_err();
        assert!(err.is_not_found());

        runtime.pull_image("alpine", None).await.unwrap();
        let id = runtime.create_container(&spec("c1", "alpine")).await.unwrap();
        let info = runtime.inspect_container("c1").await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.status, ContainerStatus::Created);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("alpine", None).await.unwrap();

        runtime.create_container(&spec("c1", "alpine")).await.unwrap();
        let err = runtime.create_container(&spec("c1", "alpine")).await.unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn test_lifecycle_and_persistence() {
        let temp = tempdir().unwrap();
        {
            let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
            runtime.pull_image("alpine", None).await.unwrap();
            let id = runtime.create_container(&spec("c1", "alpine")).await.unwrap();
            runtime.start_container(&id).await.unwrap();
            runtime.pause_container(&id).await.unwrap();
        }

        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        let info = runtime.inspect_container("c1").await.unwrap();
        assert_eq!(info.status, ContainerStatus::Paused);

        assert!(runtime.start_container("c1").await.is_err());
        runtime.unpause_container("c1").await.unwrap();
        runtime.stop_container("c1", Duration::from_secs(1)).await.unwrap();

        let info = runtime.inspect_container("c1").await.unwrap();
        assert_eq!(info.status, ContainerStatus::Exited);
        assert_eq!(info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_exit_script_emits_die() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("alpine", None).await.unwrap();

        let mut failing = spec("c1", "alpine");
        failing.cmd = vec!["sh".into(), "-c".into(), "exit 3".into()];
        let id = runtime.create_container(&failing).await.unwrap();

        let mut events = runtime.subscribe_events();
        runtime.start_container(&id).await.unwrap();

        let mut exit = None;
        while let Ok(event) = events.try_recv() {
            if let EventAction::Die { exit_code } = event.action {
                exit = Some(exit_code);
            }
        }
        assert_eq!(exit, Some(3));
        assert_eq!(runtime.wait_container(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_port_conflict_on_start() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("nginx", None).await.unwrap();

        let binding = PortBinding {
            host_ip: None,
            host_port: Some(8080),
            container_port: 80,
            protocol: Protocol::Tcp,
        };
        let mut a = spec("a", "nginx");
        a.ports.push(binding.clone());
        let mut b = spec("b", "nginx");
        b.ports.push(binding);

        runtime.create_container(&a).await.unwrap();
        runtime.create_container(&b).await.unwrap();
        runtime.start_container("a").await.unwrap();
        let err = runtime.start_container("b").await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));
    }

    #[tokio::test]
    async fn test_ephemeral_port_assignment() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("nginx", None).await.unwrap();

        let mut a = spec("a", "nginx");
        a.ports.push(PortBinding {
            host_ip: None,
            host_port: None,
            container_port: 80,
            protocol: Protocol::Tcp,
        });
        runtime.create_container(&a).await.unwrap();
        runtime.start_container("a").await.unwrap();

        let info = runtime.inspect_container("a").await.unwrap();
        assert_eq!(info.ports[0].host_port, Some(FIRST_EPHEMERAL_PORT));
    }

    #[tokio::test]
    async fn test_anonymous_volume_removed_with_container() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("postgres", None).await.unwrap();

        let mut db = spec("db", "postgres");
        db.mounts.push(Mount {
            kind: MountKind::Volume,
            source: None,
            target: "/var/lib/postgresql/data".to_string(),
            read_only: false,
            options: Vec::new(),
            size: None,
            mode: None,
        });
        let id = runtime.create_container(&db).await.unwrap();
        let info = runtime.inspect_container(&id).await.unwrap();
        let volume = info.anonymous_volumes.values().next().unwrap().clone();
        assert!(runtime.inspect_volume(&volume).await.unwrap().unwrap().anonymous);

        runtime.remove_container(&id, false, true).await.unwrap();
        assert!(runtime.inspect_volume(&volume).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_with_endpoints_not_removable() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("alpine", None).await.unwrap();

        runtime
            .create_network(&NetworkCreate {
                name: "proj_default".to_string(),
                ..NetworkCreate::default()
            })
            .await
            .unwrap();

        let mut c = spec("c1", "alpine");
        c.networks.push(NetworkAttachment {
            network: "proj_default".to_string(),
            ..NetworkAttachment::default()
        });
        runtime.create_container(&c).await.unwrap();

        assert!(runtime.remove_network("proj_default").await.is_err());
        runtime.remove_container("c1", true, false).await.unwrap();
        runtime.remove_network("proj_default").await.unwrap();
        assert!(runtime.remove_network("bridge").await.is_err());
    }

    #[tokio::test]
    async fn test_logs_follow_until_exit() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.pull_image("alpine", None).await.unwrap();

        let mut hello = spec("hello", "alpine");
        hello.cmd = vec!["echo".into(), "hello".into(), "world".into()];
        runtime.create_container(&hello).await.unwrap();
        runtime.start_container("hello").await.unwrap();

        let mut rx = runtime
            .container_logs(
                "hello",
                &LogOptions {
                    follow: true,
                    ..LogOptions::default()
                },
            )
            .await
            .unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(line.text, "hello world");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pause_without_freezer() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::without_freezer(temp.path().to_path_buf()).unwrap();
        assert!(!runtime.supports_pause());
        assert!(runtime.pause_container("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_copy_into_volume_mount() {
        let temp = tempdir().unwrap();
        let runtime = LocalRuntime::new(temp.path().join("rt")).unwrap();
        runtime.pull_image("alpine", None).await.unwrap();

        let mut c = spec("c1", "alpine");
        c.mounts.push(Mount {
            kind: MountKind::Volume,
            source: Some("data".to_string()),
            target: "/data".to_string(),
            read_only: false,
            options: Vec::new(),
            size: None,
            mode: None,
        });
        runtime.create_container(&c).await.unwrap();

        let src = temp.path().join("hello.txt");
        std::fs::write(&src, "hi").unwrap();
        runtime.copy_to_container("c1", &src, "/data/hello.txt").await.unwrap();

        let volume = runtime.inspect_volume("data").await.unwrap().unwrap();
        let copied = std::fs::read_to_string(volume.mountpoint.join("hello.txt")).unwrap();
        assert_eq!(copied, "hi");
    }

    #[test]
    fn test_signal_number() {
        assert_eq!(signal_number("SIGKILL").unwrap(), libc::SIGKILL);
        assert_eq!(signal_number("term").unwrap(), libc::SIGTERM);
        assert_eq!(signal_number("9").unwrap(), 9);
        assert!(signal_number("SIGNOPE").is_err());
    }
}
