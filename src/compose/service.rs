//! Service parsing
//!
//! Turns a merged, substituted [`ServiceConfig`] into a [`ServiceSpec`],
//! computes its config hash and derives the runtime creation request of
//! each replica.

use super::envfile;
use super::interpolate::Environment;
use super::labels;
use super::model::{
    BuildConfig, CommandConfig, DependsOnConfig, EnvFileConfig, EnvFileEntry, EnvironmentConfig,
    ExtraHostsConfig, HealthcheckTest, LabelsConfig, NetworksConfig, ServiceConfig,
};
use super::mounts;
use super::ports;
use super::project::{
    BuildSpec, Condition, Dependency, Project, PullPolicy, ServiceNetwork, ServiceSpec,
    DEFAULT_NETWORK,
};
use crate::error::{CtlError, Result};
use crate::runtime::{ContainerCreate, Healthcheck, MountKind, NetworkAttachment};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inputs shared by every service of a project
pub struct ParseContext<'a> {
    pub working_dir: &'a Path,
    pub environment: &'a Environment,
    /// Networks declared at the top level
    pub networks: &'a [String],
    /// Volumes declared at the top level
    pub volumes: &'a [String],
}

/// Parse one service entry
pub fn parse_service(name: &str, config: &ServiceConfig, ctx: &ParseContext) -> Result<ServiceSpec> {
    parse(name, config, ctx).map_err(|e| match e {
        CtlError::ConfigInvalid(msg) => CtlError::for_service(name, CtlError::ConfigInvalid(msg)),
        other => other,
    })
}

fn parse(name: &str, config: &ServiceConfig, ctx: &ParseContext) -> Result<ServiceSpec> {
    if config.image.is_none() && config.build.is_none() {
        return Err(CtlError::ConfigInvalid(
            "neither an image nor a build context specified".to_string(),
        ));
    }

    let mut spec = ServiceSpec {
        name: name.to_string(),
        image: config.image.clone(),
        build: config.build.as_ref().map(|b| parse_build(b, ctx)).transpose()?,
        entrypoint: config.entrypoint.as_ref().map(parse_command).transpose()?,
        command: config.command.as_ref().map(parse_command).transpose()?,
        hostname: config.hostname.clone(),
        user: config.user.clone(),
        working_dir: config.working_dir.clone(),
        restart: config.restart.clone(),
        tty: config.tty.unwrap_or(false),
        stdin_open: config.stdin_open.unwrap_or(false),
        privileged: config.privileged.unwrap_or(false),
        read_only: config.read_only.unwrap_or(false),
        init: config.init.unwrap_or(false),
        platform: config.platform.clone(),
        container_name: config.container_name.clone(),
        stop_signal: config.stop_signal.clone(),
        stop_grace_period: config
            .stop_grace_period
            .as_deref()
            .map(|period| parse_duration(period).map(|_| period.to_string()))
            .transpose()?,
        profiles: config.profiles.clone().unwrap_or_default(),
        cap_add: config.cap_add.clone().unwrap_or_default(),
        cap_drop: config.cap_drop.clone().unwrap_or_default(),
        dns: config.dns.as_ref().map(|d| d.to_vec()).unwrap_or_default(),
        expose: config
            .expose
            .iter()
            .flatten()
            .map(|e| e.as_str().to_string())
            .collect(),
        labels: parse_labels(config.labels.as_ref()),
        annotations: parse_labels(config.annotations.as_ref()),
        sysctls: parse_labels(config.sysctls.as_ref()),
        ..ServiceSpec::default()
    };

    // Environment: env files first, inline entries win
    for (path, required) in env_files(config.env_file.as_ref()) {
        let path = ctx.working_dir.join(path);
        if !path.exists() {
            if required {
                return Err(CtlError::ConfigInvalid(format!(
                    "env file {} not found",
                    path.display()
                )));
            }
            continue;
        }
        for (key, value) in envfile::read(&path)? {
            if let Some(value) = value.or_else(|| ctx.environment.get(&key).map(str::to_string)) {
                spec.environment.insert(key, value);
            }
        }
        spec.env_files.push(path);
    }
    spec.environment
        .extend(resolve_environment(config.environment.as_ref(), ctx.environment));

    for entry in config.volumes.iter().flatten() {
        let mount = mounts::parse_volume(entry, ctx.working_dir)?;
        if mount.kind == MountKind::Volume {
            if let Some(source) = &mount.source {
                if !ctx.volumes.contains(source) {
                    return Err(CtlError::ConfigInvalid(format!(
                        "refers to undefined volume {}",
                        source
                    )));
                }
            }
        }
        spec.mounts.push(mount);
    }
    for tmpfs in config.tmpfs.iter().flat_map(|t| t.to_vec()) {
        spec.mounts.push(mounts::parse_tmpfs(&tmpfs)?);
    }

    for port in config.ports.iter().flatten() {
        spec.ports.extend(ports::parse_port_config(port)?);
    }

    spec.network_mode = config.network_mode.clone();
    match (&spec.network_mode, &config.networks) {
        (Some(_), Some(_)) => {
            return Err(CtlError::ConfigInvalid(
                "network_mode and networks cannot be combined".to_string(),
            ))
        }
        (Some(_), None) => {}
        (None, networks) => {
            spec.networks = parse_networks(networks.as_ref());
            for network in spec.networks.keys() {
                if network != DEFAULT_NETWORK && !ctx.networks.contains(network) {
                    return Err(CtlError::ConfigInvalid(format!(
                        "refers to undefined network {}",
                        network
                    )));
                }
            }
        }
    }

    spec.depends_on = parse_depends_on(config.depends_on.as_ref())?;
    if let Some(target) = spec.network_mode.as_deref().and_then(|m| m.strip_prefix("service:")) {
        spec.depends_on
            .entry(target.to_string())
            .or_insert_with(|| Dependency {
                required: true,
                ..Dependency::default()
            });
    }
    if spec.depends_on.contains_key(name) {
        return Err(CtlError::ConfigInvalid("depends on itself".to_string()));
    }

    spec.pull_policy = config
        .pull_policy
        .as_deref()
        .map(str::parse::<PullPolicy>)
        .transpose()?;

    let deploy_replicas = config.deploy.as_ref().and_then(|d| d.replicas);
    spec.replicas = match (deploy_replicas, config.scale) {
        (Some(a), Some(b)) if a != b => {
            return Err(CtlError::ConfigInvalid(format!(
                "scale ({}) and deploy.replicas ({}) disagree",
                b, a
            )))
        }
        (Some(n), _) | (None, Some(n)) => n,
        (None, None) => 1,
    };
    if spec.container_name.is_some() && spec.replicas > 1 {
        return Err(CtlError::ConfigInvalid(
            "container_name cannot be used with more than one replica".to_string(),
        ));
    }

    spec.extra_hosts = match &config.extra_hosts {
        Some(ExtraHostsConfig::Array(hosts)) => hosts.clone(),
        Some(ExtraHostsConfig::Map(map)) => {
            map.iter().map(|(host, ip)| format!("{}:{}", host, ip)).collect()
        }
        None => Vec::new(),
    };

    spec.healthcheck = config.healthcheck.as_ref().map(|h| {
        let test = if h.disable.unwrap_or(false) {
            vec!["NONE".to_string()]
        } else {
            match &h.test {
                Some(HealthcheckTest::Command(cmd)) => vec!["CMD-SHELL".to_string(), cmd.clone()],
                Some(HealthcheckTest::Array(args)) => args.clone(),
                None => Vec::new(),
            }
        };
        Healthcheck {
            test,
            interval: h.interval.clone(),
            timeout: h.timeout.clone(),
            retries: h.retries,
            start_period: h.start_period.clone(),
        }
    });

    for (key, value) in &config.extensions {
        if key.starts_with("x-") {
            spec.extensions.insert(key.clone(), value.clone());
        } else {
            tracing::warn!("service {}: ignoring unsupported key {:?}", name, key);
        }
    }

    Ok(spec)
}

fn parse_build(build: &BuildConfig, ctx: &ParseContext) -> Result<BuildSpec> {
    let context_of = |path: &str| PathBuf::from(mounts::resolve_host_path(path, ctx.working_dir));

    Ok(match build {
        BuildConfig::Simple(context) => BuildSpec {
            context: context_of(context),
            ..BuildSpec::default()
        },
        BuildConfig::Full(full) => BuildSpec {
            context: context_of(full.context.as_deref().unwrap_or(".")),
            dockerfile: full.dockerfile.clone(),
            args: resolve_environment(full.args.as_ref(), ctx.environment),
            target: full.target.clone(),
            cache_from: full.cache_from.clone().unwrap_or_default(),
            labels: parse_labels(full.labels.as_ref()),
            tags: full.tags.clone().unwrap_or_default(),
            no_cache: full.no_cache.unwrap_or(false),
        },
    })
}

fn env_files(config: Option<&EnvFileConfig>) -> Vec<(String, bool)> {
    match config {
        None => Vec::new(),
        Some(EnvFileConfig::Single(path)) => vec![(path.clone(), true)],
        Some(EnvFileConfig::Multiple(entries)) => entries
            .iter()
            .map(|entry| match entry {
                EnvFileEntry::Path(path) => (path.clone(), true),
                EnvFileEntry::Long { path, required } => (path.clone(), *required),
            })
            .collect(),
    }
}

/// Resolve an environment block; entries without a value come from `env`
/// and are dropped when unset there
pub fn resolve_environment(
    config: Option<&EnvironmentConfig>,
    env: &Environment,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let lookup = |key: &str| env.get(key).map(str::to_string);

    match config {
        None => {}
        Some(EnvironmentConfig::Array(items)) => {
            for item in items {
                match item.split_once('=') {
                    Some((k, v)) => {
                        out.insert(k.to_string(), v.to_string());
                    }
                    None => {
                        if let Some(v) = lookup(item) {
                            out.insert(item.clone(), v);
                        }
                    }
                }
            }
        }
        Some(EnvironmentConfig::Map(map)) => {
            for (k, v) in map {
                match v {
                    Some(v) => {
                        out.insert(k.clone(), v.as_str().to_string());
                    }
                    None => {
                        if let Some(v) = lookup(k) {
                            out.insert(k.clone(), v);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Flatten a labels block (list or map form) into a map
pub fn parse_labels(config: Option<&LabelsConfig>) -> BTreeMap<String, String> {
    match config {
        None => BTreeMap::new(),
        Some(LabelsConfig::Array(items)) => items
            .iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.clone(), String::new()),
            })
            .collect(),
        Some(LabelsConfig::Map(map)) => map
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_ref().map(|v| v.as_str().to_string()).unwrap_or_default(),
                )
            })
            .collect(),
    }
}

fn parse_networks(config: Option<&NetworksConfig>) -> BTreeMap<String, ServiceNetwork> {
    match config {
        None => {
            let mut networks = BTreeMap::new();
            networks.insert(DEFAULT_NETWORK.to_string(), ServiceNetwork::default());
            networks
        }
        Some(NetworksConfig::Array(names)) => names
            .iter()
            .map(|n| (n.clone(), ServiceNetwork::default()))
            .collect(),
        Some(NetworksConfig::Map(map)) => map
            .iter()
            .map(|(n, cfg)| {
                let cfg = cfg.clone().unwrap_or_default();
                (
                    n.clone(),
                    ServiceNetwork {
                        aliases: cfg.aliases.unwrap_or_default(),
                        ipv4_address: cfg.ipv4_address,
                        ipv6_address: cfg.ipv6_address,
                        mac_address: cfg.mac_address,
                    },
                )
            })
            .collect(),
    }
}

fn parse_depends_on(config: Option<&DependsOnConfig>) -> Result<BTreeMap<String, Dependency>> {
    let mut deps = BTreeMap::new();
    match config {
        None => {}
        Some(DependsOnConfig::Array(names)) => {
            for name in names {
                deps.insert(
                    name.clone(),
                    Dependency {
                        condition: Condition::ServiceStarted,
                        restart: false,
                        required: true,
                    },
                );
            }
        }
        Some(DependsOnConfig::Map(map)) => {
            for (name, cond) in map {
                deps.insert(
                    name.clone(),
                    Dependency {
                        condition: cond.condition.parse()?,
                        restart: cond.restart.unwrap_or(false),
                        required: cond.required.unwrap_or(true),
                    },
                );
            }
        }
    }
    Ok(deps)
}

fn parse_command(config: &CommandConfig) -> Result<Vec<String>> {
    match config {
        CommandConfig::Exec(args) => Ok(args.clone()),
        CommandConfig::Shell(line) => split_command(line),
    }
}

/// Split a command line into words, honoring quotes and backslashes
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(unterminated(line)),
                        },
                        Some(c) => current.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unterminated(line: &str) -> CtlError {
    CtlError::ConfigInvalid(format!("unterminated quote in command {:?}", line))
}

/// Parse a duration such as `10s`, `1m30s` or `500ms`; a bare number is seconds
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = || CtlError::ConfigInvalid(format!("invalid duration {:?}", value));
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid());
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let amount: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += Duration::try_from_secs_f64(amount * scale).map_err(|_| invalid())?;
    }
    Ok(total)
}

/// Config hash of a service
///
/// The hash covers the canonical YAML of the parsed service. Fields that do not
/// change the resulting container are left out: replica count, build and
/// pull settings, profiles, dependencies, env file paths (their content is
/// part of the environment) and extension fields.
pub fn config_hash(spec: &ServiceSpec) -> Result<String> {
    let canonical = ServiceSpec {
        build: None,
        pull_policy: None,
        replicas: 0,
        profiles: Vec::new(),
        depends_on: BTreeMap::new(),
        env_files: Vec::new(),
        extensions: BTreeMap::new(),
        ..spec.clone()
    };
    let yaml = serde_yaml::to_string(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(yaml.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Config hashes of every enabled service
pub fn service_hashes(project: &Project) -> Result<IndexMap<String, String>> {
    project
        .services
        .iter()
        .map(|(name, spec)| Ok((name.clone(), config_hash(spec)?)))
        .collect()
}

/// Image a service runs; services with only a build section get `{project}-{service}`
pub fn image_name(project: &Project, spec: &ServiceSpec) -> String {
    spec.image
        .clone()
        .unwrap_or_else(|| format!("{}-{}", project.name, spec.name))
}

/// Default container name of a replica
pub fn container_name(project: &Project, spec: &ServiceSpec, number: u32) -> String {
    spec.container_name
        .clone()
        .unwrap_or_else(|| format!("{}-{}-{}", project.name, spec.name, number))
}

/// Runtime creation request for one replica
pub fn container_create(
    project: &Project,
    spec: &ServiceSpec,
    name: &str,
    number: u32,
    config_hash: &str,
    oneoff: bool,
) -> ContainerCreate {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| {
            let mut m = m.clone();
            if m.kind == MountKind::Volume {
                m.source = m.source.map(|s| project.volume_name(&s));
            }
            m
        })
        .collect();

    let networks = if spec.network_mode.is_some() {
        Vec::new()
    } else {
        spec.networks
            .iter()
            .map(|(declared, net)| {
                let mut aliases = vec![spec.name.clone()];
                aliases.extend(net.aliases.iter().cloned());
                NetworkAttachment {
                    network: project.network_name(declared),
                    aliases,
                    ipv4_address: net.ipv4_address.clone(),
                    ipv6_address: net.ipv6_address.clone(),
                    mac_address: net.mac_address.clone(),
                }
            })
            .collect()
    };

    let network_mode = spec.network_mode.as_ref().map(|mode| {
        match mode.strip_prefix("service:") {
            Some(target) => match project.any_service(target) {
                Ok(target) => format!("container:{}", container_name(project, target, 1)),
                Err(_) => mode.clone(),
            },
            None => mode.clone(),
        }
    });

    ContainerCreate {
        name: name.to_string(),
        image: image_name(project, spec),
        entrypoint: spec.entrypoint.clone().unwrap_or_default(),
        cmd: spec.command.clone().unwrap_or_default(),
        env: spec
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        hostname: spec.hostname.clone(),
        labels: labels::container_labels(project, spec, number, config_hash, oneoff),
        ports: spec.ports.clone(),
        mounts,
        networks,
        network_mode,
        tty: spec.tty,
        stdin_open: spec.stdin_open,
        privileged: spec.privileged,
        read_only: spec.read_only,
        platform: spec.platform.clone(),
        sysctls: spec.sysctls.clone(),
        extra_hosts: spec.extra_hosts.clone(),
        restart_policy: spec.restart.clone(),
        healthcheck: spec.healthcheck.clone(),
        stop_signal: spec.stop_signal.clone(),
        cap_add: spec.cap_add.clone(),
        cap_drop: spec.cap_drop.clone(),
        dns: spec.dns.clone(),
        init: spec.init,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::ComposeFile;
    use tempfile::tempdir;

    fn parse_yaml(yaml: &str, working_dir: &Path) -> Result<IndexMap<String, ServiceSpec>> {
        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        let networks: Vec<String> = file.networks.keys().cloned().collect();
        let volumes: Vec<String> = file.volumes.keys().cloned().collect();
        let mut process = BTreeMap::new();
        process.insert("FROM_ENV".to_string(), "env-value".to_string());
        let environment = Environment::new(process);
        let ctx = ParseContext {
            working_dir,
            environment: &environment,
            networks: &networks,
            volumes: &volumes,
        };
        file.services
            .iter()
            .map(|(name, config)| Ok((name.clone(), parse_service(name, config, &ctx)?)))
            .collect()
    }

    #[test]
    fn test_parse_service() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("web.env"), "A=from-file\nB=from-file\n").unwrap();

        let services = parse_yaml(
            r#"
services:
  web:
    image: nginx
    command: sh -c "exit 1"
    env_file: web.env
    environment:
      B: inline
      FROM_ENV:
      UNSET:
    ports: ["8080:80", "9000-9001:9000-9001/udp"]
    volumes: ["data:/data", "./html:/usr/share/nginx/html:ro", "/cache"]
    depends_on: [db]
    healthcheck:
      test: curl -f http://localhost
  db:
    image: postgres
    deploy:
      replicas: 2
volumes:
  data: {}
"#,
            temp.path(),
        )
        .unwrap();

        let web = &services["web"];
        assert_eq!(web.command.as_ref().unwrap(), &vec!["sh", "-c", "exit 1"]);
        assert_eq!(web.environment["A"], "from-file");
        assert_eq!(web.environment["B"], "inline");
        assert_eq!(web.environment["FROM_ENV"], "env-value");
        assert!(!web.environment.contains_key("UNSET"));
        assert_eq!(web.ports.len(), 3);
        assert_eq!(web.mounts.len(), 3);
        assert!(web.networks.contains_key(DEFAULT_NETWORK));
        assert_eq!(web.depends_on["db"].condition, Condition::ServiceStarted);
        assert!(web.has_healthcheck());
        assert_eq!(services["db"].replicas, 2);
    }

    #[test]
    fn test_validation_errors() {
        let wd = Path::new("/srv/app");
        let err = parse_yaml("services:\n  web:\n    ports: ['80']\n", wd).unwrap_err();
        assert!(err.to_string().contains("service web"));

        assert!(parse_yaml("services:\n  web:\n    image: x\n    volumes: ['nope:/data']\n", wd).is_err());
        assert!(parse_yaml("services:\n  web:\n    image: x\n    networks: [back]\n", wd).is_err());
        assert!(parse_yaml(
            "services:\n  web:\n    image: x\n    network_mode: host\n    networks: [default]\n",
            wd
        )
        .is_err());
        assert!(parse_yaml(
            "services:\n  web:\n    image: x\n    scale: 2\n    deploy:\n      replicas: 3\n",
            wd
        )
        .is_err());
        assert!(parse_yaml("services:\n  web:\n    image: x\n    env_file: missing.env\n", wd).is_err());
    }

    #[test]
    fn test_config_hash_ignores_replicas() {
        let wd = Path::new("/srv/app");
        let one = parse_yaml("services:\n  web:\n    image: nginx\n", wd).unwrap();
        let three = parse_yaml("services:\n  web:\n    image: nginx\n    scale: 3\n", wd).unwrap();
        let other = parse_yaml("services:\n  web:\n    image: nginx:2\n", wd).unwrap();

        let h1 = config_hash(&one["web"]).unwrap();
        assert_eq!(h1.len(), 64);
        assert_eq!(h1, config_hash(&three["web"]).unwrap());
        assert_ne!(h1, config_hash(&other["web"]).unwrap());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"sh -c "echo 'hi there'" x\ y"#).unwrap(),
            vec!["sh", "-c", "echo 'hi there'", "x y"]
        );
        assert_eq!(split_command("''").unwrap(), vec![""]);
        assert!(split_command("echo \"open").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h2m").unwrap(), Duration::from_secs(3720));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("s").is_err());

        let wd = Path::new("/srv/app");
        let services =
            parse_yaml("services:\n  web:\n    image: x\n    stop_grace_period: 2s\n", wd).unwrap();
        assert_eq!(services["web"].stop_timeout(), Some(Duration::from_secs(2)));
        assert!(parse_yaml("services:\n  web:\n    image: x\n    stop_grace_period: soon\n", wd).is_err());
    }
}
