//! Project and service specs
//!
//! A [`Project`] is the fully loaded, merged and substituted application:
//! its services parsed into [`ServiceSpec`]s and its networks and volumes
//! resolved to the names they carry in the runtime.

use super::interpolate::Environment;
use super::model::ComposeFile;
use crate::error::{CtlError, Result};
use crate::runtime::{Healthcheck, IpamPool, Mount, PortBinding, VerifyRequest};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Name of the network services join when they declare none
pub const DEFAULT_NETWORK: &str = "default";

/// Loaded compose project
#[derive(Debug, Clone)]
pub struct Project {
    /// Sanitized project name
    pub name: String,
    /// Project directory; relative paths resolve against it
    pub working_dir: PathBuf,
    /// Compose files in merge order
    pub config_files: Vec<PathBuf>,
    /// Variable lookup used for substitution
    pub environment: Environment,
    /// Active profiles
    pub profiles: Vec<String>,
    /// Services enabled by the active profiles, in declaration order
    pub services: IndexMap<String, ServiceSpec>,
    /// Services disabled by the active profiles
    pub disabled: IndexMap<String, ServiceSpec>,
    pub networks: IndexMap<String, NetworkSpec>,
    pub volumes: IndexMap<String, VolumeSpec>,
    /// Normalized compose model, rendered by `config`
    pub model: ComposeFile,
}

impl Project {
    /// Look up an enabled service
    pub fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services.get(name).ok_or_else(|| {
            if self.disabled.contains_key(name) {
                CtlError::ConfigInvalid(format!("service {:?} is not enabled by the active profiles", name))
            } else {
                CtlError::ConfigInvalid(format!("no such service: {}", name))
            }
        })
    }

    /// Look up a service whether or not its profile is active
    pub fn any_service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .get(name)
            .or_else(|| self.disabled.get(name))
            .ok_or_else(|| CtlError::ConfigInvalid(format!("no such service: {}", name)))
    }

    /// Names of the enabled services, in declaration order
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Validate a service selection; an empty selection means every service
    pub fn select(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(self.service_names());
        }
        for name in names {
            self.service(name)?;
        }
        Ok(self
            .services
            .keys()
            .filter(|s| names.contains(*s))
            .cloned()
            .collect())
    }

    /// Selection closed over `depends_on`, in declaration order
    pub fn with_dependencies(&self, names: &[String]) -> Result<Vec<String>> {
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = self.select(names)?;

        while let Some(name) = stack.pop() {
            if !wanted.insert(name.clone()) {
                continue;
            }
            if let Some(spec) = self.services.get(&name) {
                stack.extend(spec.depends_on.keys().cloned());
            }
        }

        Ok(self
            .services
            .keys()
            .filter(|s| wanted.contains(*s))
            .cloned()
            .collect())
    }

    /// Runtime name of a declared network
    pub fn network_name(&self, declared: &str) -> String {
        self.networks
            .get(declared)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| qualified_name(&self.name, declared))
    }

    /// Runtime name of a declared volume
    pub fn volume_name(&self, declared: &str) -> String {
        self.volumes
            .get(declared)
            .map(|v| v.name.clone())
            .unwrap_or_else(|| qualified_name(&self.name, declared))
    }
}

/// `{project}_{name}`
pub fn qualified_name(project: &str, name: &str) -> String {
    format!("{}_{}", project, name)
}

/// Parsed service, before replicas are materialized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    /// Resolved environment; env files first, inline entries win
    pub environment: BTreeMap<String, String>,
    /// Env files the environment was read from
    pub env_files: Vec<PathBuf>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub expose: Vec<String>,
    /// Declared network name to attachment options
    pub networks: BTreeMap<String, ServiceNetwork>,
    pub network_mode: Option<String>,
    pub profiles: Vec<String>,
    pub pull_policy: Option<PullPolicy>,
    pub restart: Option<String>,
    pub replicas: u32,
    pub depends_on: BTreeMap<String, Dependency>,
    pub annotations: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub privileged: bool,
    pub read_only: bool,
    pub init: bool,
    pub platform: Option<String>,
    pub sysctls: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub container_name: Option<String>,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub healthcheck: Option<Healthcheck>,
    pub stop_signal: Option<String>,
    pub stop_grace_period: Option<String>,
    /// `x-*` extension fields
    pub extensions: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceSpec {
    /// Whether the service is enabled by a set of active profiles
    pub fn is_enabled(&self, active: &[String]) -> bool {
        self.profiles.is_empty()
            || active.iter().any(|p| p == "*")
            || self.profiles.iter().any(|p| active.contains(p))
    }

    /// Grace period of `stop_grace_period`
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_grace_period
            .as_deref()
            .and_then(|period| super::service::parse_duration(period).ok())
    }

    /// Whether the container declares a healthcheck
    pub fn has_healthcheck(&self) -> bool {
        self.healthcheck
            .as_ref()
            .is_some_and(|h| !h.test.is_empty() && h.test[0] != "NONE")
    }

    /// Image verification requested through `x-verify` extensions
    ///
    /// `x-verify` names the provider; every other `x-<provider>-*` key is
    /// passed along as a provider option with the `x-` prefix stripped.
    pub fn verification(&self) -> Option<VerifyRequest> {
        let provider = self.extensions.get("x-verify")?.as_str()?.to_string();
        let prefix = format!("x-{}-", provider);
        let options = self
            .extensions
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let value = match v {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.trim_start_matches("x-").to_string(), value))
            })
            .collect();
        Some(VerifyRequest { provider, options })
    }
}

/// Build section of a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Absolute build context
    pub context: PathBuf,
    pub dockerfile: Option<String>,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub no_cache: bool,
}

/// Network attachment options of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNetwork {
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub mac_address: Option<String>,
}

/// Dependency condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    ServiceStarted,
    ServiceHealthy,
    ServiceCompletedSuccessfully,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::ServiceStarted => write!(f, "service_started"),
            Condition::ServiceHealthy => write!(f, "service_healthy"),
            Condition::ServiceCompletedSuccessfully => write!(f, "service_completed_successfully"),
        }
    }
}

impl FromStr for Condition {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(Condition::ServiceStarted),
            "service_healthy" => Ok(Condition::ServiceHealthy),
            "service_completed_successfully" => Ok(Condition::ServiceCompletedSuccessfully),
            other => Err(CtlError::ConfigInvalid(format!(
                "invalid depends_on condition {:?}",
                other
            ))),
        }
    }
}

/// Dependency on another service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub condition: Condition,
    /// Restart the dependent when the dependency is recreated
    pub restart: bool,
    /// Missing optional dependencies are skipped with a warning
    pub required: bool,
}

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    Always,
    Missing,
    Never,
    /// Build the image instead of pulling it
    Build,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullPolicy::Always => write!(f, "always"),
            PullPolicy::Missing => write!(f, "missing"),
            PullPolicy::Never => write!(f, "never"),
            PullPolicy::Build => write!(f, "build"),
        }
    }
}

impl FromStr for PullPolicy {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" | "if_not_present" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            "build" => Ok(PullPolicy::Build),
            other => Err(CtlError::ConfigInvalid(format!(
                "invalid pull policy {:?} (expected always, missing, never or build)",
                other
            ))),
        }
    }
}

/// Declared network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Name in the compose file
    pub declared: String,
    /// Name in the runtime
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub ipam: Vec<IpamPool>,
    pub enable_ipv6: bool,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
    pub external: bool,
}

/// Declared volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Name in the compose file
    pub declared: String,
    /// Name in the runtime
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub external: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        let mut services = IndexMap::new();
        let mut web = ServiceSpec {
            name: "web".to_string(),
            ..ServiceSpec::default()
        };
        web.depends_on.insert("api".to_string(), Dependency::default());
        let mut api = ServiceSpec {
            name: "api".to_string(),
            ..ServiceSpec::default()
        };
        api.depends_on.insert("db".to_string(), Dependency::default());
        services.insert("db".to_string(), ServiceSpec { name: "db".to_string(), ..ServiceSpec::default() });
        services.insert("api".to_string(), api);
        services.insert("web".to_string(), web);
        services.insert("cache".to_string(), ServiceSpec { name: "cache".to_string(), ..ServiceSpec::default() });

        let mut disabled = IndexMap::new();
        disabled.insert(
            "debug".to_string(),
            ServiceSpec {
                name: "debug".to_string(),
                profiles: vec!["dev".to_string()],
                ..ServiceSpec::default()
            },
        );

        Project {
            name: "proj".to_string(),
            working_dir: PathBuf::from("/srv/proj"),
            config_files: Vec::new(),
            environment: Environment::default(),
            profiles: Vec::new(),
            services,
            disabled,
            networks: IndexMap::new(),
            volumes: IndexMap::new(),
            model: ComposeFile::default(),
        }
    }

    #[test]
    fn test_with_dependencies() {
        let project = project();
        let names = project.with_dependencies(&["web".to_string()]).unwrap();
        assert_eq!(names, vec!["db", "api", "web"]);
        assert_eq!(project.select(&[]).unwrap().len(), 4);
    }

    #[test]
    fn test_unknown_and_disabled_services() {
        let project = project();
        assert!(project.select(&["nope".to_string()]).is_err());
        assert!(project.service("debug").is_err());
        assert!(project.any_service("debug").is_ok());
    }

    #[test]
    fn test_profiles() {
        let spec = ServiceSpec {
            profiles: vec!["dev".to_string()],
            ..ServiceSpec::default()
        };
        assert!(!spec.is_enabled(&[]));
        assert!(spec.is_enabled(&["dev".to_string()]));
        assert!(spec.is_enabled(&["*".to_string()]));
        assert!(ServiceSpec::default().is_enabled(&[]));
    }

    #[test]
    fn test_verification_extensions() {
        let mut spec = ServiceSpec::default();
        assert!(spec.verification().is_none());

        spec.extensions.insert("x-verify".to_string(), "cosign".into());
        spec.extensions.insert("x-cosign-public-key".to_string(), "/k.pub".into());
        spec.extensions.insert("x-other".to_string(), "ignored".into());

        let request = spec.verification().unwrap();
        assert_eq!(request.provider, "cosign");
        assert_eq!(request.options.len(), 1);
        assert_eq!(request.options["cosign-public-key"], "/k.pub");
    }

    #[test]
    fn test_parse_policies() {
        assert_eq!("if_not_present".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert!("sometimes".parse::<PullPolicy>().is_err());
        assert_eq!(
            "service_healthy".parse::<Condition>().unwrap(),
            Condition::ServiceHealthy
        );
    }
}
