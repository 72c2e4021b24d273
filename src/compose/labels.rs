//! Labels identifying compose-managed objects
//!
//! All reasoning about existing containers goes through these labels; the
//! engine keeps no state of its own between invocations.

use super::project::{Dependency, Project, ServiceSpec};
use crate::runtime::{ContainerFilter, ContainerInfo};
use std::collections::BTreeMap;

pub const PROJECT: &str = "com.docker.compose.project";
pub const SERVICE: &str = "com.docker.compose.service";
pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
pub const CONFIG_HASH: &str = "com.docker.compose.config-hash";
pub const WORKING_DIR: &str = "com.docker.compose.project.working_dir";
pub const CONFIG_FILES: &str = "com.docker.compose.project.config_files";
pub const DEPENDS_ON: &str = "com.docker.compose.depends_on";
pub const VERSION: &str = "com.docker.compose.version";
pub const ONEOFF: &str = "com.docker.compose.oneoff";
pub const NETWORKS: &str = "com.docker.compose.networks";
pub const NETWORK: &str = "com.docker.compose.network";
pub const VOLUME: &str = "com.docker.compose.volume";
pub const IMAGE: &str = "com.docker.compose.image";

/// Engine version written on every container
pub const COMPOSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter matching every container of a project
pub fn project_filter(project: &str) -> ContainerFilter {
    ContainerFilter::new().label(PROJECT, project)
}

/// Filter matching the containers of one service
pub fn service_filter(project: &str, service: &str) -> ContainerFilter {
    project_filter(project).label(SERVICE, service)
}

/// Labels identifying a service container
pub fn container_labels(
    project: &Project,
    spec: &ServiceSpec,
    number: u32,
    config_hash: &str,
    oneoff: bool,
) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();

    let files = project
        .config_files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",");

    let networks = if spec.network_mode.is_some() {
        String::new()
    } else {
        spec.networks
            .keys()
            .map(|n| project.network_name(n))
            .collect::<Vec<_>>()
            .join(",")
    };

    labels.insert(PROJECT.to_string(), project.name.clone());
    labels.insert(SERVICE.to_string(), spec.name.clone());
    labels.insert(CONTAINER_NUMBER.to_string(), number.to_string());
    labels.insert(CONFIG_HASH.to_string(), config_hash.to_string());
    labels.insert(WORKING_DIR.to_string(), project.working_dir.display().to_string());
    labels.insert(CONFIG_FILES.to_string(), files);
    labels.insert(DEPENDS_ON.to_string(), depends_on_label(&spec.depends_on));
    labels.insert(VERSION.to_string(), COMPOSE_VERSION.to_string());
    labels.insert(ONEOFF.to_string(), if oneoff { "True" } else { "False" }.to_string());
    labels.insert(NETWORKS.to_string(), networks);
    labels
}

/// `name:condition:restart` entries joined by commas
pub fn depends_on_label(depends_on: &BTreeMap<String, Dependency>) -> String {
    depends_on
        .iter()
        .map(|(name, dep)| format!("{}:{}:{}", name, dep.condition, dep.restart))
        .collect::<Vec<_>>()
        .join(",")
}

/// Labels for a project network or volume
pub fn resource_labels(
    project: &str,
    key: &str,
    declared: &str,
    user: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = user.clone();
    labels.insert(PROJECT.to_string(), project.to_string());
    labels.insert(key.to_string(), declared.to_string());
    labels.insert(VERSION.to_string(), COMPOSE_VERSION.to_string());
    labels
}

/// Service name of a container
pub fn service_of(container: &ContainerInfo) -> Option<&str> {
    container.label(SERVICE)
}

/// Replica number of a container
pub fn number_of(container: &ContainerInfo) -> Option<u32> {
    container.label(CONTAINER_NUMBER)?.parse().ok()
}

/// Whether the container was created by `run`
pub fn is_oneoff(container: &ContainerInfo) -> bool {
    container.label(ONEOFF) == Some("True")
}

/// Stored config hash of a container
pub fn config_hash_of(container: &ContainerInfo) -> Option<&str> {
    container.label(CONFIG_HASH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::project::Condition;

    #[test]
    fn test_depends_on_label() {
        let mut deps = BTreeMap::new();
        deps.insert(
            "db".to_string(),
            Dependency {
                condition: Condition::ServiceHealthy,
                restart: true,
                required: true,
            },
        );
        deps.insert("cache".to_string(), Dependency::default());

        assert_eq!(
            depends_on_label(&deps),
            "cache:service_started:false,db:service_healthy:true"
        );
    }

    #[test]
    fn test_filters() {
        let filter = service_filter("proj", "web");
        let mut labels = BTreeMap::new();
        labels.insert(PROJECT.to_string(), "proj".to_string());
        assert!(!filter.matches(&labels));
        labels.insert(SERVICE.to_string(), "web".to_string());
        assert!(filter.matches(&labels));
    }
}
