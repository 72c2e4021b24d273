//! Compose file model
//!
//! Serde types mirroring the compose file format. Maps keep declaration
//! order so that `config` renders services in the order they were written.
//! Keys starting with `x-` land in the `extensions` bag of the enclosing
//! object.

use indexmap::IndexMap;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compose file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file version (parsed, ignored)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
    /// Networks
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub networks: IndexMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, Option<VolumeConfig>>,
    /// Secrets
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub secrets: IndexMap<String, serde_yaml::Value>,
    /// Configs
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub configs: IndexMap<String, serde_yaml::Value>,
    /// Extension fields (`x-*`)
    #[serde(flatten)]
    pub extensions: IndexMap<String, serde_yaml::Value>,
}

/// String value that may be written as any YAML scalar
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Scalar(pub String);

impl Scalar {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar(s)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
                Ok(Scalar(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Environment files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    /// Exposed ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<Vec<Scalar>>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// tmpfs mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<StringOrList>,
    /// Networks to connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Network mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Deploy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    /// Replica count (alias of deploy.replicas)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<LabelsConfig>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// User
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Privileged mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// Read only root filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Stdin open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_open: Option<bool>,
    /// TTY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    /// Stop signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    /// Stop grace period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    /// Sysctls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysctls: Option<LabelsConfig>,
    /// Extra hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_hosts: Option<ExtraHostsConfig>,
    /// DNS servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<StringOrList>,
    /// Capabilities to add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,
    /// Capabilities to drop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_drop: Option<Vec<String>>,
    /// Init process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    /// Profiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    /// Pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    /// Platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Secrets (parsed, not mounted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<serde_yaml::Value>,
    /// Configs (parsed, not mounted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs: Option<serde_yaml::Value>,
    /// Remaining keys; `x-*` extensions and anything unrecognized
    #[serde(flatten)]
    pub extensions: IndexMap<String, serde_yaml::Value>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Dockerfile path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<EnvironmentConfig>,
    /// Target stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Cache from images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_from: Option<Vec<String>>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// No cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_cache: Option<bool>,
    /// Extension fields (`x-*`)
    #[serde(flatten)]
    pub extensions: IndexMap<String, serde_yaml::Value>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Single string or list of strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::List(list) => list.clone(),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(IndexMap<String, Option<Scalar>>),
}

/// Env file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    /// Single file
    Single(String),
    /// Multiple files
    Multiple(Vec<EnvFileEntry>),
}

/// Entry of an env_file list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileEntry {
    Path(String),
    Long {
        path: String,
        #[serde(default = "default_true")]
        required: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(Scalar),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port or range on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Scalar>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp/sctp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Mode (host/ingress)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "host:container:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs)
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Bind options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BindOptions>,
    /// Volume options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeOptions>,
    /// Tmpfs options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<TmpfsOptions>,
}

/// Bind mount options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindOptions {
    /// Propagation mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
    /// Create host path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_host_path: Option<bool>,
    /// SELinux relabeling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux: Option<String>,
}

/// Volume options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// No copy data from container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nocopy: Option<bool>,
}

/// Tmpfs options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TmpfsOptions {
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(IndexMap<String, Option<ServiceNetworkConfig>>),
}

/// Service network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    /// IPv4 address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    /// IPv6 address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(IndexMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default = "default_condition")]
    pub condition: String,
    /// Restart dependents when the dependency is updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
    /// Fail when the dependency is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

fn default_condition() -> String {
    "service_started".to_string()
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Deployment mode (replicated, global)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Remaining deploy keys (resources, placement, ...), kept for rendering
    #[serde(flatten)]
    pub other: IndexMap<String, serde_yaml::Value>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(IndexMap<String, Option<Scalar>>),
}

/// Extra hosts configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraHostsConfig {
    /// Array of "host:ip" strings
    Array(Vec<String>),
    /// Map of host to ip
    Map(IndexMap<String, String>),
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_opts: Option<IndexMap<String, Scalar>>,
    /// IPAM configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
    /// External network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    /// Internal network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// Attachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachable: Option<bool>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Enable IPv6
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_ipv6: Option<bool>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// IPAM configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Config blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Vec<IpamPoolConfig>>,
}

/// IPAM pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamPoolConfig {
    /// Subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// IP range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_opts: Option<IndexMap<String, Scalar>>,
    /// External volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name (legacy syntax)
    Named { name: String },
}

impl ExternalConfig {
    /// Whether the resource is external
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }

    /// Name given through the legacy `external: {name: ...}` syntax
    pub fn name(&self) -> Option<&str> {
        match self {
            ExternalConfig::Bool(_) => None,
            ExternalConfig::Named { name } => Some(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
      - 443
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
      PGPORT: 5432
      DEBUG:
"#;

        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.services.len(), 2);
        assert_eq!(
            file.services.keys().collect::<Vec<_>>(),
            vec!["web", "db"]
        );

        let ports = file.services["web"].ports.as_ref().unwrap();
        assert!(matches!(&ports[1], PortConfig::Short(s) if s.as_str() == "443"));

        match file.services["db"].environment.as_ref().unwrap() {
            EnvironmentConfig::Map(map) => {
                assert_eq!(map["PGPORT"].as_ref().unwrap().as_str(), "5432");
                assert!(map["DEBUG"].is_none());
            }
            other => panic!("unexpected environment {:?}", other),
        }
    }

    #[test]
    fn test_extension_fields() {
        let yaml = r#"
x-common: &common
  restart: always
services:
  app:
    image: app
    x-verify: cosign
    x-cosign-public-key: /keys/cosign.pub
"#;

        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        assert!(file.extensions.contains_key("x-common"));
        let app = &file.services["app"];
        assert_eq!(
            app.extensions["x-verify"],
            serde_yaml::Value::String("cosign".to_string())
        );
    }

    #[test]
    fn test_long_forms() {
        let yaml = r#"
services:
  app:
    image: app
    depends_on:
      db:
        condition: service_healthy
    volumes:
      - type: bind
        source: ./src
        target: /src
        read_only: true
    networks:
      front:
        aliases: [api]
volumes: {}
networks:
  front:
    external: true
"#;

        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        let app = &file.services["app"];
        assert!(matches!(app.depends_on, Some(DependsOnConfig::Map(_))));
        assert!(matches!(
            app.volumes.as_ref().unwrap()[0],
            VolumeMount::Long(_)
        ));
        let front = file.networks["front"].as_ref().unwrap();
        assert!(front.external.as_ref().unwrap().is_external());
    }
}
