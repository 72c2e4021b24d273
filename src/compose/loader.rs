//! Project loading
//!
//! Locates the compose files, reads them as YAML trees, merges them in
//! order, substitutes variables and finally materializes the [`Project`].

use super::envfile;
use super::interpolate::{interpolate_value, Environment};
use super::merge::merge;
use super::model::{
    BuildConfig, ComposeFile, DependsOnCondition, DependsOnConfig, EnvironmentConfig,
    NetworksConfig, Scalar, ServiceConfig, ServiceNetworkConfig, VolumeMount,
};
use super::mounts;
use super::project::{
    qualified_name, NetworkSpec, Project, ServiceSpec, VolumeSpec, DEFAULT_NETWORK,
};
use super::scheduler::DependencyGraph;
use super::service::{self, ParseContext};
use crate::error::{CtlError, Result};
use crate::runtime::IpamPool;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Compose file names looked up in the project directory, in order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Override files merged over the default file when present
pub const OVERRIDE_FILES: &[&str] = &[
    "compose.override.yaml",
    "compose.override.yml",
    "docker-compose.override.yaml",
    "docker-compose.override.yml",
];

/// Options that select and shape the project
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    /// Explicit `-f` files, resolved against the process working directory
    pub files: Vec<PathBuf>,
    /// `--project-directory`
    pub project_directory: Option<PathBuf>,
    /// `-p`
    pub project_name: Option<String>,
    /// `--env-file`, resolved against the process working directory
    pub env_files: Vec<PathBuf>,
    /// `--profile`
    pub profiles: Vec<String>,
    /// Process environment
    pub environment: BTreeMap<String, String>,
    /// Process working directory
    pub working_dir: PathBuf,
}

impl ProjectOptions {
    /// Options seeded from the current process
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            environment: std::env::vars().collect(),
            working_dir: std::env::current_dir()?,
            ..Self::default()
        })
    }

    fn env(&self, key: &str) -> Option<&str> {
        self.environment
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        mounts::clean_path(&self.working_dir.join(path))
    }
}

/// Load a project
pub fn load(options: &ProjectOptions) -> Result<Project> {
    let files = find_files(options)?;
    let working_dir = match &options.project_directory {
        Some(dir) => options.absolute(dir),
        None => files[0]
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| options.working_dir.clone()),
    };

    let environment = load_environment(options, &files[0])?;

    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    for file in &files {
        merged = merge(merged, read_file(file)?);
    }
    interpolate_value(&mut merged, &environment, "")?;

    let mut model: ComposeFile = serde_yaml::from_value(merged)
        .map_err(|e| CtlError::ConfigInvalid(e.to_string()))?;
    for key in model.extensions.keys() {
        if !key.starts_with("x-") {
            tracing::warn!("ignoring unsupported top-level key {:?}", key);
        }
    }

    let name = project_name(options, &environment, &model, &files[0])?;
    let profiles = active_profiles(options, &environment);
    tracing::debug!("loading project {} from {:?}", name, files);

    let networks = build_networks(&name, &model);
    let volumes = build_volumes(&name, &model);

    let declared_networks: Vec<String> = model.networks.keys().cloned().collect();
    let declared_volumes: Vec<String> = model.volumes.keys().cloned().collect();
    let ctx = ParseContext {
        working_dir: &working_dir,
        environment: &environment,
        networks: &declared_networks,
        volumes: &declared_volumes,
    };

    let mut services = IndexMap::new();
    let mut disabled = IndexMap::new();
    for (service_name, config) in &model.services {
        let spec = service::parse_service(service_name, config, &ctx)?;
        if spec.is_enabled(&profiles) {
            services.insert(service_name.clone(), spec);
        } else {
            disabled.insert(service_name.clone(), spec);
        }
    }

    check_dependencies(&mut services, &disabled)?;
    DependencyGraph::build(&services)?;

    normalize_model(&mut model, &name, &services);

    Ok(Project {
        name,
        working_dir,
        config_files: files,
        environment,
        profiles,
        services,
        disabled,
        networks,
        volumes,
        model,
    })
}

/// Resolve the compose files to load
pub fn find_files(options: &ProjectOptions) -> Result<Vec<PathBuf>> {
    if !options.files.is_empty() {
        let files: Vec<PathBuf> = options.files.iter().map(|f| options.absolute(f)).collect();
        for file in &files {
            if !file.is_file() {
                return Err(CtlError::ConfigInvalid(format!(
                    "compose file {} not found",
                    file.display()
                )));
            }
        }
        return Ok(files);
    }

    if let Some(list) = options.env("COMPOSE_FILE") {
        let separator = options.env("COMPOSE_PATH_SEPARATOR").unwrap_or(":");
        let files: Vec<PathBuf> = list
            .split(separator)
            .filter(|f| !f.is_empty())
            .map(|f| options.absolute(Path::new(f)))
            .collect();
        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(CtlError::ConfigInvalid(format!(
                "compose file {} not found",
                missing.display()
            )));
        }
        if !files.is_empty() {
            return Ok(files);
        }
    }

    let dir = match &options.project_directory {
        Some(dir) => options.absolute(dir),
        None => options.working_dir.clone(),
    };
    let first = DEFAULT_COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            CtlError::ConfigInvalid(format!(
                "no configuration file provided: none of {} found in {}",
                DEFAULT_COMPOSE_FILES.join(", "),
                dir.display()
            ))
        })?;

    let mut files = vec![first];
    files.extend(
        OVERRIDE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file()),
    );
    Ok(files)
}

/// Build the substitution environment
///
/// `--env-file` paths are resolved against the process working directory;
/// the implicit `.env` is read next to the first compose file.
fn load_environment(options: &ProjectOptions, first_file: &Path) -> Result<Environment> {
    let inherit = |vars: IndexMap<String, Option<String>>| -> BTreeMap<String, String> {
        vars.into_iter()
            .filter_map(|(k, v)| {
                let v = v.or_else(|| options.environment.get(&k).cloned())?;
                Some((k, v))
            })
            .collect()
    };

    let mut explicit = BTreeMap::new();
    for path in &options.env_files {
        let path = options.absolute(path);
        if !path.is_file() {
            return Err(CtlError::ConfigInvalid(format!(
                "env file {} not found",
                path.display()
            )));
        }
        explicit.extend(inherit(envfile::read(&path)?));
    }

    let mut dotenv = BTreeMap::new();
    if let Some(dir) = first_file.parent() {
        let path = dir.join(".env");
        if path.is_file() {
            dotenv = inherit(envfile::read(&path)?);
        }
    }

    Ok(Environment::new(options.environment.clone())
        .with_explicit(explicit)
        .with_dotenv(dotenv))
}

fn read_file(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CtlError::ConfigInvalid(format!("failed to read {}: {}", path.display(), e))
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&content)
        .map_err(|e| CtlError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;

    match value {
        serde_yaml::Value::Null => Ok(serde_yaml::Value::Mapping(serde_yaml::Mapping::new())),
        serde_yaml::Value::Mapping(_) => Ok(value),
        _ => Err(CtlError::ConfigInvalid(format!(
            "{}: top-level object must be a mapping",
            path.display()
        ))),
    }
}

fn project_name(
    options: &ProjectOptions,
    environment: &Environment,
    model: &ComposeFile,
    first_file: &Path,
) -> Result<String> {
    let basename = first_file
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned());

    let raw = options
        .project_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            environment
                .get("COMPOSE_PROJECT_NAME")
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        })
        .or_else(|| model.name.clone().filter(|n| !n.is_empty()))
        .or(basename)
        .unwrap_or_default();

    let name = sanitize_project_name(&raw);
    if name.is_empty() {
        return Err(CtlError::ConfigInvalid(format!(
            "project name {:?} is empty after normalization",
            raw
        )));
    }
    Ok(name)
}

/// Lowercase and keep `[a-z0-9_-]`, dropping leading separators
pub fn sanitize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect::<String>()
        .trim_start_matches(['_', '-'])
        .to_string()
}

fn active_profiles(options: &ProjectOptions, environment: &Environment) -> Vec<String> {
    let mut profiles = options.profiles.clone();
    if let Some(list) = environment.get("COMPOSE_PROFILES") {
        for profile in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if !profiles.iter().any(|p| p == profile) {
                profiles.push(profile.to_string());
            }
        }
    }
    profiles
}

fn build_networks(project: &str, model: &ComposeFile) -> IndexMap<String, NetworkSpec> {
    let mut networks = IndexMap::new();

    for (declared, config) in &model.networks {
        let config = config.clone().unwrap_or_default();
        let external = config.external.as_ref().is_some_and(|e| e.is_external());
        let name = if external {
            config
                .external
                .as_ref()
                .and_then(|e| e.name().map(str::to_string))
                .or(config.name.clone())
                .unwrap_or_else(|| declared.clone())
        } else {
            config
                .name
                .clone()
                .unwrap_or_else(|| qualified_name(project, declared))
        };

        let ipam = config
            .ipam
            .as_ref()
            .and_then(|i| i.config.as_ref())
            .map(|pools| {
                pools
                    .iter()
                    .map(|p| IpamPool {
                        subnet: p.subnet.clone(),
                        gateway: p.gateway.clone(),
                        ip_range: p.ip_range.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        networks.insert(
            declared.clone(),
            NetworkSpec {
                declared: declared.clone(),
                name,
                driver: config.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                driver_opts: scalar_map(config.driver_opts.as_ref()),
                ipam,
                enable_ipv6: config.enable_ipv6.unwrap_or(false),
                internal: config.internal.unwrap_or(false),
                labels: service::parse_labels(config.labels.as_ref()),
                external,
            },
        );
    }

    if !networks.contains_key(DEFAULT_NETWORK) {
        networks.insert(
            DEFAULT_NETWORK.to_string(),
            NetworkSpec {
                declared: DEFAULT_NETWORK.to_string(),
                name: qualified_name(project, DEFAULT_NETWORK),
                driver: "bridge".to_string(),
                ..NetworkSpec::default()
            },
        );
    }
    networks
}

fn build_volumes(project: &str, model: &ComposeFile) -> IndexMap<String, VolumeSpec> {
    model
        .volumes
        .iter()
        .map(|(declared, config)| {
            let config = config.clone().unwrap_or_default();
            let external = config.external.as_ref().is_some_and(|e| e.is_external());
            let name = if external {
                config
                    .external
                    .as_ref()
                    .and_then(|e| e.name().map(str::to_string))
                    .or(config.name.clone())
                    .unwrap_or_else(|| declared.clone())
            } else {
                config
                    .name
                    .clone()
                    .unwrap_or_else(|| qualified_name(project, declared))
            };

            (
                declared.clone(),
                VolumeSpec {
                    declared: declared.clone(),
                    name,
                    driver: config.driver.clone().unwrap_or_else(|| "local".to_string()),
                    driver_opts: scalar_map(config.driver_opts.as_ref()),
                    labels: service::parse_labels(config.labels.as_ref()),
                    external,
                },
            )
        })
        .collect()
}

fn scalar_map(map: Option<&IndexMap<String, Scalar>>) -> BTreeMap<String, String> {
    map.map(|m| {
        m.iter()
            .map(|(k, v)| (k.clone(), v.as_str().to_string()))
            .collect()
    })
    .unwrap_or_default()
}

/// Reject references to unknown or disabled services; optional ones are dropped
fn check_dependencies(
    services: &mut IndexMap<String, ServiceSpec>,
    disabled: &IndexMap<String, ServiceSpec>,
) -> Result<()> {
    let enabled: Vec<String> = services.keys().cloned().collect();

    for (name, spec) in services.iter_mut() {
        let mut dropped = Vec::new();
        for (dep, dependency) in &spec.depends_on {
            if enabled.contains(dep) {
                continue;
            }
            let reason = if disabled.contains_key(dep) {
                "disabled"
            } else {
                "undefined"
            };
            if dependency.required {
                return Err(CtlError::for_service(
                    name.clone(),
                    CtlError::ConfigInvalid(format!("depends on {} service {}", reason, dep)),
                ));
            }
            tracing::warn!("service {}: ignoring optional dependency on {} service {}", name, reason, dep);
            dropped.push(dep.clone());
        }
        for dep in dropped {
            spec.depends_on.remove(&dep);
        }
    }
    Ok(())
}

/// Rewrite the model into the form `config` renders
///
/// Disabled services are dropped, env files are folded into `environment`,
/// volumes are written in long syntax, build contexts become absolute and
/// list forms of `depends_on` and `networks` become maps.
fn normalize_model(model: &mut ComposeFile, name: &str, services: &IndexMap<String, ServiceSpec>) {
    model.version = None;
    model.name = Some(name.to_string());
    model.services.retain(|service, _| services.contains_key(service));

    for (service_name, config) in model.services.iter_mut() {
        let Some(spec) = services.get(service_name) else {
            continue;
        };
        normalize_service(config, spec);
    }
}

fn normalize_service(config: &mut ServiceConfig, spec: &ServiceSpec) {
    config.env_file = None;
    config.environment = (!spec.environment.is_empty()).then(|| {
        EnvironmentConfig::Map(
            spec.environment
                .iter()
                .map(|(k, v)| (k.clone(), Some(Scalar(v.clone()))))
                .collect(),
        )
    });

    // `tmpfs:` entries follow the `volumes:` entries in the parsed mounts
    if let Some(volumes) = &config.volumes {
        config.volumes = Some(
            spec.mounts
                .iter()
                .take(volumes.len())
                .map(|m| VolumeMount::Long(mounts::to_long(m)))
                .collect(),
        );
    }

    if let (Some(build), Some(build_spec)) = (&mut config.build, &spec.build) {
        let context = build_spec.context.display().to_string();
        match build {
            BuildConfig::Simple(ctx) => *ctx = context,
            BuildConfig::Full(full) => full.context = Some(context),
        }
    }

    if config.depends_on.is_some() || !spec.depends_on.is_empty() {
        config.depends_on = (!spec.depends_on.is_empty()).then(|| {
            DependsOnConfig::Map(
                spec.depends_on
                    .iter()
                    .map(|(dep, d)| {
                        (
                            dep.clone(),
                            DependsOnCondition {
                                condition: d.condition.to_string(),
                                restart: Some(d.restart),
                                required: Some(d.required),
                            },
                        )
                    })
                    .collect(),
            )
        });
    }

    if let Some(NetworksConfig::Array(names)) = &config.networks {
        config.networks = Some(NetworksConfig::Map(
            names
                .iter()
                .map(|n| (n.clone(), None::<ServiceNetworkConfig>))
                .collect(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::service::config_hash;
    use tempfile::tempdir;

    fn options(dir: &Path) -> ProjectOptions {
        ProjectOptions {
            working_dir: dir.to_path_buf(),
            ..ProjectOptions::default()
        }
    }

    #[test]
    fn test_load_default_file_and_override() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("My App");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join("compose.yaml"),
            "services:\n  web:\n    image: nginx\n    ports: ['8080:80']\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("docker-compose.override.yml"),
            "services:\n  web:\n    image: nginx:1.25\n    ports: ['9090:90']\n",
        )
        .unwrap();

        let project = load(&options(&dir)).unwrap();
        assert_eq!(project.name, "myapp");
        assert_eq!(project.config_files.len(), 2);
        let web = project.service("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(web.ports.len(), 2);
        assert_eq!(project.network_name(DEFAULT_NETWORK), "myapp_default");
    }

    #[test]
    fn test_missing_files() {
        let temp = tempdir().unwrap();
        assert!(matches!(load(&options(temp.path())), Err(CtlError::ConfigInvalid(_))));

        let mut opts = options(temp.path());
        opts.files.push(PathBuf::from("nope.yaml"));
        assert!(load(&opts).is_err());
    }

    #[test]
    fn test_compose_file_variable() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.yml"), "services:\n  a:\n    image: a\n").unwrap();
        std::fs::write(temp.path().join("b.yml"), "services:\n  b:\n    image: b\n").unwrap();

        let mut opts = options(temp.path());
        opts.environment.insert("COMPOSE_FILE".to_string(), "a.yml;b.yml".to_string());
        opts.environment.insert("COMPOSE_PATH_SEPARATOR".to_string(), ";".to_string());
        let project = load(&opts).unwrap();
        assert_eq!(project.service_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_substitution_layers() {
        let temp = tempdir().unwrap();
        let proj = temp.path().join("proj");
        std::fs::create_dir(&proj).unwrap();
        std::fs::write(
            proj.join("compose.yaml"),
            "services:\n  web:\n    image: ghcr.io/example/nginx:$TAG\n    environment:\n      WHO: ${WHO:-nobody}\n",
        )
        .unwrap();
        std::fs::write(proj.join(".env"), "TAG=1.19-alpine\nWHO=dotenv\n").unwrap();
        std::fs::write(temp.path().join("override.env"), "WHO=explicit\n").unwrap();

        let project = load(&options(&proj)).unwrap();
        let web = project.service("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("ghcr.io/example/nginx:1.19-alpine"));
        assert_eq!(web.environment["WHO"], "dotenv");

        // --env-file resolves against the process working directory
        let mut opts = options(temp.path());
        opts.project_directory = Some(PathBuf::from("proj"));
        opts.env_files.push(PathBuf::from("override.env"));
        let project = load(&opts).unwrap();
        assert_eq!(project.service("web").unwrap().environment["WHO"], "explicit");

        let mut opts = options(temp.path());
        opts.project_directory = Some(PathBuf::from("proj"));
        opts.env_files.push(PathBuf::from(".env"));
        assert!(matches!(load(&opts), Err(CtlError::ConfigInvalid(_))));
    }

    #[test]
    fn test_project_name_precedence() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "name: FromFile\nservices:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        assert_eq!(load(&options(temp.path())).unwrap().name, "fromfile");

        let mut opts = options(temp.path());
        opts.environment.insert("COMPOSE_PROJECT_NAME".to_string(), "from_env".to_string());
        assert_eq!(load(&opts).unwrap().name, "from_env");

        opts.project_name = Some("Flag.Name".to_string());
        assert_eq!(load(&opts).unwrap().name, "flagname");

        opts.project_name = Some("!!!".to_string());
        assert!(load(&opts).is_err());
    }

    #[test]
    fn test_project_name_from_first_file_directory() {
        let temp = tempdir().unwrap();
        let app = temp.path().join("app");
        let elsewhere = temp.path().join("elsewhere");
        std::fs::create_dir(&app).unwrap();
        std::fs::create_dir(&elsewhere).unwrap();
        std::fs::write(app.join("compose.yaml"), "services:\n  web:\n    image: nginx\n").unwrap();

        let mut opts = options(temp.path());
        opts.files.push(PathBuf::from("app/compose.yaml"));
        opts.project_directory = Some(PathBuf::from("elsewhere"));
        let project = load(&opts).unwrap();
        assert_eq!(project.name, "app");
        assert_eq!(project.working_dir, elsewhere);
    }

    #[test]
    fn test_sanitize_project_name() {
        assert_eq!(sanitize_project_name("My Project"), "myproject");
        assert_eq!(sanitize_project_name("__app-1"), "app-1");
        assert_eq!(sanitize_project_name("..."), "");
    }

    #[test]
    fn test_profiles_and_dependencies() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("compose.yaml");
        std::fs::write(
            &file,
            r#"
services:
  web:
    image: nginx
    depends_on: [db]
  db:
    image: postgres
  debug:
    image: busybox
    profiles: [dev]
"#,
        )
        .unwrap();

        let project = load(&options(temp.path())).unwrap();
        assert_eq!(project.service_names(), vec!["web", "db"]);
        assert!(project.disabled.contains_key("debug"));

        let mut opts = options(temp.path());
        opts.environment.insert("COMPOSE_PROFILES".to_string(), "dev".to_string());
        assert_eq!(load(&opts).unwrap().services.len(), 3);

        std::fs::write(
            &file,
            "services:\n  web:\n    image: nginx\n    depends_on: [debug]\n  debug:\n    image: busybox\n    profiles: [dev]\n",
        )
        .unwrap();
        assert!(load(&options(temp.path())).is_err());

        std::fs::write(
            &file,
            "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: x\n    depends_on: [a]\n",
        )
        .unwrap();
        assert!(matches!(
            load(&options(temp.path())).unwrap_err().root(),
            CtlError::DependencyCycle(_)
        ));
    }

    #[test]
    fn test_declared_resources() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            r#"
name: proj
services:
  web:
    image: nginx
    networks: [front, ext]
    volumes: ["data:/data"]
networks:
  front:
    ipam:
      config:
        - subnet: 10.5.0.0/16
  ext:
    external: true
volumes:
  data:
    driver_opts:
      size: 10
"#,
        )
        .unwrap();

        let project = load(&options(temp.path())).unwrap();
        assert_eq!(project.network_name("front"), "proj_front");
        assert_eq!(project.network_name("ext"), "ext");
        assert!(project.networks["ext"].external);
        assert_eq!(project.networks["front"].ipam[0].subnet.as_deref(), Some("10.5.0.0/16"));
        assert_eq!(project.volume_name("data"), "proj_data");
        assert_eq!(project.volumes["data"].driver_opts["size"], "10");
    }

    #[test]
    fn test_normalized_model_reloads_identically() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("web.env"), "A=1\n").unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            r#"
services:
  web:
    image: nginx
    env_file: web.env
    environment: [B=2]
    volumes: ["./html:/html:ro", "data:/data"]
    tmpfs: /run
    depends_on: [db]
  db:
    image: postgres
    networks: [default]
volumes:
  data: {}
"#,
        )
        .unwrap();

        let first = load(&options(temp.path())).unwrap();
        let rendered = serde_yaml::to_string(&first.model).unwrap();

        let other = tempdir().unwrap();
        std::fs::write(other.path().join("compose.yaml"), rendered).unwrap();
        let second = load(&options(other.path())).unwrap();

        assert_eq!(first.name, second.name);
        for (name, spec) in &first.services {
            assert_eq!(
                config_hash(spec).unwrap(),
                config_hash(second.service(name).unwrap()).unwrap(),
                "hash of {} changed",
                name
            );
        }
    }
}
