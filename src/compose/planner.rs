//! Container planning
//!
//! Compares the containers the runtime reports for a service with the
//! replicas the project asks for and decides, per replica number, whether
//! to create, keep or recreate. Everything is derived from container labels.

use super::labels;
use super::project::Project;
use crate::runtime::ContainerInfo;
use std::collections::BTreeMap;

/// When to recreate an existing container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecreatePolicy {
    /// Recreate when the config hash differs
    #[default]
    Diverged,
    /// Always recreate (`--force-recreate`)
    Force,
    /// Never recreate (`--no-recreate`)
    Never,
}

/// Planned action for one container slot
#[derive(Debug, Clone)]
pub enum Action {
    /// No container at this number
    Create { number: u32 },
    /// Existing container is up to date
    Keep { container: ContainerInfo },
    /// Existing container must be replaced
    Recreate { container: ContainerInfo, number: u32 },
    /// Container beyond the wanted scale, or a duplicate number
    Remove { container: ContainerInfo },
}

/// Plan of one service
#[derive(Debug, Clone)]
pub struct ServicePlan {
    pub service: String,
    /// Removals first, then one action per replica in number order
    pub actions: Vec<Action>,
}

impl ServicePlan {
    /// Removal actions
    pub fn removals(&self) -> impl Iterator<Item = &ContainerInfo> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove { container } => Some(container),
            _ => None,
        })
    }
}

/// Plan the replicas of a service
///
/// `existing` are the containers carrying the project and service labels;
/// one-off containers are ignored.
pub fn plan_service(
    service: &str,
    replicas: u32,
    config_hash: &str,
    existing: Vec<ContainerInfo>,
    policy: RecreatePolicy,
) -> ServicePlan {
    let mut by_number: BTreeMap<u32, ContainerInfo> = BTreeMap::new();
    let mut removals = Vec::new();

    let mut existing: Vec<ContainerInfo> = existing
        .into_iter()
        .filter(|c| !labels::is_oneoff(c))
        .collect();
    existing.sort_by_key(|c| c.created_at);

    for container in existing {
        match labels::number_of(&container) {
            Some(n) if n >= 1 && n <= replicas && !by_number.contains_key(&n) => {
                by_number.insert(n, container);
            }
            _ => removals.push(container),
        }
    }

    let mut actions: Vec<Action> = removals
        .into_iter()
        .map(|container| Action::Remove { container })
        .collect();

    for number in 1..=replicas {
        let action = match by_number.remove(&number) {
            None => Action::Create { number },
            Some(container) => {
                let current = labels::config_hash_of(&container) == Some(config_hash);
                match policy {
                    RecreatePolicy::Force => Action::Recreate { container, number },
                    RecreatePolicy::Never => Action::Keep { container },
                    RecreatePolicy::Diverged if current => Action::Keep { container },
                    RecreatePolicy::Diverged => Action::Recreate { container, number },
                }
            }
        };
        tracing::debug!("plan {}: {:?}", service, describe(&action));
        actions.push(action);
    }

    ServicePlan {
        service: service.to_string(),
        actions,
    }
}

fn describe(action: &Action) -> String {
    match action {
        Action::Create { number } => format!("create #{}", number),
        Action::Keep { container } => format!("keep {}", container.name()),
        Action::Recreate { container, number } => {
            format!("recreate {} as #{}", container.name(), number)
        }
        Action::Remove { container } => format!("remove {}", container.name()),
    }
}

/// Project containers whose service is not part of the project any more
pub fn orphans(project: &Project, containers: &[ContainerInfo]) -> Vec<ContainerInfo> {
    containers
        .iter()
        .filter(|c| {
            labels::service_of(c).is_some_and(|s| {
                !project.services.contains_key(s) && !project.disabled.contains_key(s)
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerCreate, ContainerStatus};
    use chrono::{Duration, Utc};

    fn container(service: &str, number: u32, hash: &str, age: i64) -> ContainerInfo {
        let mut labels = BTreeMap::new();
        labels.insert(labels::PROJECT.to_string(), "proj".to_string());
        labels.insert(labels::SERVICE.to_string(), service.to_string());
        labels.insert(labels::CONTAINER_NUMBER.to_string(), number.to_string());
        labels.insert(labels::CONFIG_HASH.to_string(), hash.to_string());
        labels.insert(labels::ONEOFF.to_string(), "False".to_string());

        ContainerInfo {
            id: format!("{}-{}-{}", service, number, age),
            spec: ContainerCreate {
                name: format!("proj-{}-{}", service, number),
                labels,
                ..ContainerCreate::default()
            },
            status: ContainerStatus::Running,
            exit_code: None,
            health: None,
            pid: None,
            created_at: Utc::now() - Duration::seconds(age),
            started_at: None,
            finished_at: None,
            stop_timeout: None,
            ports: Vec::new(),
            anonymous_volumes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_scale_up_keeps_existing() {
        let existing = vec![container("web", 1, "h", 10), container("web", 2, "h", 10)];
        let plan = plan_service("web", 3, "h", existing, RecreatePolicy::Diverged);

        assert_eq!(plan.actions.len(), 3);
        assert!(matches!(plan.actions[0], Action::Keep { .. }));
        assert!(matches!(plan.actions[1], Action::Keep { .. }));
        assert!(matches!(plan.actions[2], Action::Create { number: 3 }));
    }

    #[test]
    fn test_scale_down_and_duplicates() {
        let existing = vec![
            container("web", 1, "h", 10),
            container("web", 1, "h", 5),
            container("web", 2, "h", 10),
            container("web", 3, "h", 10),
        ];
        let plan = plan_service("web", 1, "h", existing, RecreatePolicy::Diverged);

        assert_eq!(plan.removals().count(), 3);
        match plan.actions.last().unwrap() {
            Action::Keep { container } => assert_eq!(container.id, "web-1-10"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_recreate_policies() {
        let plan = plan_service("web", 1, "new", vec![container("web", 1, "old", 1)], RecreatePolicy::Diverged);
        assert!(matches!(plan.actions[0], Action::Recreate { number: 1, .. }));

        let plan = plan_service("web", 1, "new", vec![container("web", 1, "old", 1)], RecreatePolicy::Never);
        assert!(matches!(plan.actions[0], Action::Keep { .. }));
        assert_eq!(plan.actions.len(), 1);

        let plan = plan_service("web", 1, "same", vec![container("web", 1, "same", 1)], RecreatePolicy::Force);
        assert!(matches!(plan.actions[0], Action::Recreate { .. }));
    }

    #[test]
    fn test_oneoff_containers_are_ignored() {
        let mut oneoff = container("web", 1, "h", 1);
        oneoff
            .spec
            .labels
            .insert(labels::ONEOFF.to_string(), "True".to_string());
        let plan = plan_service("web", 1, "h", vec![oneoff], RecreatePolicy::Diverged);
        assert!(matches!(plan.actions[0], Action::Create { number: 1 }));
    }
}
