//! Runtime object model shared by the client interface and its implementations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CtlError;

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is frozen
    Paused,
    /// Container is being restarted by its restart policy
    Restarting,
    /// Container has exited
    Exited,
    /// Container is being removed
    Removing,
    /// Container is in an error state
    Dead,
}

impl ContainerStatus {
    /// Whether the container has a live process (running or frozen)
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "paused" => Ok(ContainerStatus::Paused),
            "restarting" => Ok(ContainerStatus::Restarting),
            "exited" => Ok(ContainerStatus::Exited),
            "removing" => Ok(ContainerStatus::Removing),
            "dead" => Ok(ContainerStatus::Dead),
            other => Err(CtlError::ConfigInvalid(format!(
                "invalid container status {:?}",
                other
            ))),
        }
    }
}

/// Network protocol of a published port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(CtlError::ConfigInvalid(format!(
                "invalid protocol {:?} (expected tcp, udp or sctp)",
                other
            ))),
        }
    }
}

/// A single published port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host address to bind, all interfaces when unset
    pub host_ip: Option<IpAddr>,
    /// Host port; the runtime picks one when unset
    pub host_port: Option<u16>,
    /// Port inside the container
    pub container_port: u16,
    /// Protocol
    pub protocol: Protocol,
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.host_port {
            Some(host_port) => {
                let ip = self
                    .host_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string());
                write!(
                    f,
                    "{}:{}->{}/{}",
                    ip, host_port, self.container_port, self.protocol
                )
            }
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// Mount of a host path, volume or tmpfs into a container
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mount {
    pub kind: MountKind,
    /// Host path or volume name; unset for anonymous volumes and tmpfs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
    /// Extra mount options (propagation, selinux relabel, nocopy)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// tmpfs size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// tmpfs file mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl Mount {
    /// Volume mount without a source
    pub fn is_anonymous(&self) -> bool {
        self.kind == MountKind::Volume && self.source.is_none()
    }
}

/// Attachment of a container to a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Qualified network name
    pub network: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Healthcheck definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}

/// Healthcheck status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Container creation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerCreate {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    /// host, none, bridge or container:<id>; project networks are ignored when set
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin_open: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default)]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub init: bool,
}

/// Container as reported by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// The creation request the container was made from
    pub spec: ContainerCreate,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub health: Option<HealthStatus>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Grace period of the last graceful stop
    #[serde(default)]
    pub stop_timeout: Option<std::time::Duration>,
    /// Effective port bindings, host ports resolved
    pub ports: Vec<PortBinding>,
    /// Anonymous volumes owned by this container, target path to volume name
    pub anonymous_volumes: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Container name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Value of a label
    pub fn label(&self, key: &str) -> Option<&str> {
        self.spec.labels.get(key).map(|s| s.as_str())
    }

    /// Command line as displayed by `ps`
    pub fn command_line(&self) -> String {
        self.spec
            .entrypoint
            .iter()
            .chain(self.spec.cmd.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Label filter for container listing; `None` matches any value
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub labels: BTreeMap<String, Option<String>>,
}

impl ContainerFilter {
    /// Empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a label with a specific value
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), Some(value.to_string()));
        self
    }

    /// Require a label to be present
    pub fn has_label(mut self, key: &str) -> Self {
        self.labels.insert(key.to_string(), None);
        self
    }

    /// Whether a label set satisfies the filter
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(key, want)| match (labels.get(key), want) {
            (Some(_), None) => true,
            (Some(have), Some(want)) => have == want,
            (None, _) => false,
        })
    }
}

/// IPAM pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,
}

/// Network creation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCreate {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub ipam: Vec<IpamPool>,
    #[serde(default)]
    pub enable_ipv6: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Network as reported by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub options: BTreeMap<String, String>,
    pub ipam: Vec<IpamPool>,
    pub enable_ipv6: bool,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
    /// IDs of attached containers
    pub containers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Volume creation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeCreate {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Volume as reported by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mountpoint: PathBuf,
    /// Created implicitly for a container mount without a source
    pub anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// Local image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image ID (sha256 digest of the config)
    pub id: String,
    /// Normalized reference (`name:tag`)
    pub reference: String,
    /// Repository digest
    pub digest: String,
    pub platform: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Image build request handed to the build service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: Option<String>,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub platform: Option<String>,
    pub no_cache: bool,
}

/// Image signature verification request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Provider name (none, cosign, notation)
    pub provider: String,
    /// Provider specific options
    pub options: BTreeMap<String, String>,
}

/// Exec request
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
}

/// Outcome of an exec
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
}

/// Process table of a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessTable {
    pub titles: Vec<String>,
    pub processes: Vec<Vec<String>>,
}

/// Log fetch options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    /// Number of trailing lines, all when unset
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// Output stream of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Container lifecycle event action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Die { exit_code: i32 },
    Health(HealthStatus),
    Pause,
    Unpause,
    Destroy,
}

/// Container lifecycle event
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub container_id: String,
    pub container_name: String,
    pub labels: BTreeMap<String, String>,
    pub action: EventAction,
    pub time: DateTime<Utc>,
}
