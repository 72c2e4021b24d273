//! Dependency scheduling
//!
//! [`DependencyGraph`] orders services so that every service comes after
//! the services it depends on. [`traverse`] walks a selection of that graph
//! with one task per service: a task runs once all its predecessors in the
//! walk have finished, so independent branches proceed in parallel.
//! [`ConditionBoard`] lets a service wait until a dependency is healthy or
//! has completed successfully.

use super::labels;
use super::project::{Condition, ServiceSpec};
use crate::error::{CtlError, Result};
use crate::runtime::{ContainerInfo, ContainerStatus, HealthStatus, RuntimeClient};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Services in dependency order
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Topological order, dependencies first
    order: Vec<String>,
    /// Service name to the services it depends on
    dependencies: HashMap<String, Vec<(String, Condition)>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting cycles
    ///
    /// Dependencies on services outside `services` are ignored; the loader
    /// has already rejected or dropped them.
    pub fn build(services: &IndexMap<String, ServiceSpec>) -> Result<Self> {
        let mut dependencies: HashMap<String, Vec<(String, Condition)>> = HashMap::new();
        let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, spec) in services {
            in_degree.entry(name.as_str()).or_insert(0);
            let deps: Vec<(String, Condition)> = spec
                .depends_on
                .iter()
                .filter(|(dep, _)| services.contains_key(*dep))
                .map(|(dep, d)| (dep.clone(), d.condition))
                .collect();

            for (dep, _) in &deps {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                if let Some((key, _)) = services.get_key_value(dep) {
                    dependents.entry(key.as_str()).or_default().push(name.as_str());
                }
            }
            dependencies.insert(name.clone(), deps);
        }

        // Seed in declaration order so the result is deterministic
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(services.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() != services.len() {
            let cycle = services
                .keys()
                .filter(|name| !order.contains(name))
                .cloned()
                .collect();
            return Err(CtlError::DependencyCycle(cycle));
        }

        Ok(Self {
            order,
            dependencies,
        })
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, service: &str) -> &[(String, Condition)] {
        self.dependencies
            .get(service)
            .map(|d| d.as_slice())
            .unwrap_or_default()
    }

    /// Services that directly depend on `service`
    pub fn dependents(&self, service: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.dependencies(name).iter().any(|(dep, _)| dep == service))
            .map(|name| name.as_str())
            .collect()
    }

    /// Restrict `selected` to known services, in launch order
    pub fn sort(&self, selected: &[String]) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| selected.contains(name))
            .cloned()
            .collect()
    }
}

/// Walk direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Dependencies before dependents
    Up,
    /// Dependents before dependencies
    Down,
}

/// Outcome of a visited service, as seen by its successors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Done,
    Failed,
}

/// Visit every selected service, respecting dependency order
///
/// A service is visited once all of its predecessors within the selection
/// have been visited. When a predecessor failed, the service is skipped.
/// Errors of every branch are collected into one aggregate error.
pub async fn traverse<F, Fut>(
    graph: &DependencyGraph,
    selected: &[String],
    direction: Direction,
    cancel: &CancellationToken,
    visit: F,
) -> Result<()>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let selected: BTreeSet<String> = graph.sort(selected).into_iter().collect();
    let visit = Arc::new(visit);

    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for name in &selected {
        let (tx, rx) = watch::channel(Outcome::Pending);
        senders.insert(name.clone(), tx);
        receivers.insert(name.clone(), rx);
    }

    let mut tasks = JoinSet::new();
    for name in &selected {
        let predecessors: Vec<String> = match direction {
            Direction::Up => graph
                .dependencies(name)
                .iter()
                .map(|(dep, _)| dep.clone())
                .collect(),
            Direction::Down => graph.dependents(name).into_iter().map(str::to_string).collect(),
        };
        let waits: Vec<(String, watch::Receiver<Outcome>)> = predecessors
            .into_iter()
            .filter_map(|p| receivers.get(&p).map(|rx| (p, rx.clone())))
            .collect();

        let Some(done) = senders.remove(name) else {
            continue;
        };
        let name = name.clone();
        let visit = Arc::clone(&visit);
        let cancel = cancel.clone();

        tasks.spawn(async move {
            for (predecessor, mut rx) in waits {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = done.send(Outcome::Failed);
                        return Err(CtlError::Cancelled);
                    }
                    outcome = rx.wait_for(|o| *o != Outcome::Pending) => {
                        outcome.map(|o| *o).unwrap_or(Outcome::Failed)
                    }
                };
                if outcome == Outcome::Failed {
                    tracing::warn!("Skipping {}: {} did not complete", name, predecessor);
                    let _ = done.send(Outcome::Failed);
                    return Ok(());
                }
            }

            if cancel.is_cancelled() {
                let _ = done.send(Outcome::Failed);
                return Err(CtlError::Cancelled);
            }

            let result = visit(name).await;
            let _ = done.send(if result.is_ok() {
                Outcome::Done
            } else {
                Outcome::Failed
            });
            result
        });
    }
    drop(receivers);

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(CtlError::Cancelled)) => {
                if !errors.iter().any(|e| matches!(e, CtlError::Cancelled)) {
                    errors.push(CtlError::Cancelled);
                }
            }
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(CtlError::Runtime(format!("task failed: {}", e))),
        }
    }
    CtlError::aggregate(errors)
}

type SignalKey = (String, Condition);

/// Completion signals keyed by (service, condition)
///
/// `service_started` is signalled by the engine once every replica of a
/// service has started. `service_healthy` and `service_completed_successfully`
/// are resolved by a watcher task that reads container state and follows
/// runtime events; the watcher is spawned by the first waiter.
pub struct ConditionBoard {
    runtime: Arc<dyn RuntimeClient>,
    project: String,
    cancel: CancellationToken,
    signals: Mutex<HashMap<SignalKey, watch::Sender<Option<bool>>>>,
    degraded: Mutex<BTreeSet<String>>,
}

impl ConditionBoard {
    pub fn new(runtime: Arc<dyn RuntimeClient>, project: &str, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            project: project.to_string(),
            cancel,
            signals: Mutex::new(HashMap::new()),
            degraded: Mutex::new(BTreeSet::new()),
        })
    }

    /// Sender for a key, and whether it was just created
    fn slot(&self, key: &SignalKey) -> Result<(watch::Sender<Option<bool>>, bool)> {
        let mut signals = self
            .signals
            .lock()
            .map_err(|_| CtlError::Lock("condition board poisoned".to_string()))?;
        if let Some(tx) = signals.get(key) {
            return Ok((tx.clone(), false));
        }
        let (tx, _) = watch::channel(None);
        signals.insert(key.clone(), tx.clone());
        Ok((tx, true))
    }

    /// Record that a condition was reached (or can no longer be reached)
    pub fn signal(&self, service: &str, condition: Condition, reached: bool) -> Result<()> {
        let (tx, _) = self.slot(&(service.to_string(), condition))?;
        tx.send_replace(Some(reached));
        Ok(())
    }

    /// Record that `service_healthy` on a service without a healthcheck degrades
    /// to `service_started`; returns true the first time per service
    pub fn degrade(&self, service: &str) -> bool {
        match self.degraded.lock() {
            Ok(mut degraded) => degraded.insert(service.to_string()),
            Err(_) => false,
        }
    }

    /// Wait until `service` reaches `condition`
    pub async fn wait(self: &Arc<Self>, service: &str, condition: Condition) -> Result<()> {
        let key = (service.to_string(), condition);
        let (tx, created) = self.slot(&key)?;
        let mut rx = tx.subscribe();

        if created && condition != Condition::ServiceStarted {
            let board = Arc::clone(self);
            tokio::spawn(async move { board.resolve(key).await });
        }

        let reached = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CtlError::Cancelled),
            value = rx.wait_for(|v| v.is_some()) => {
                value.ok().and_then(|v| *v).unwrap_or(false)
            }
        };

        if reached {
            Ok(())
        } else {
            Err(CtlError::for_service(
                service,
                CtlError::InvalidState(format!("dependency condition {} failed", condition)),
            ))
        }
    }

    /// Watch containers until a condition is decided
    async fn resolve(self: Arc<Self>, key: SignalKey) {
        let (service, condition) = &key;
        // Subscribe before the first read so no transition is missed
        let mut events = self.runtime.subscribe_events();
        let filter = labels::service_filter(&self.project, service);

        loop {
            match self.runtime.list_containers(&filter, true).await {
                Ok(containers) => {
                    let containers: Vec<ContainerInfo> = containers
                        .into_iter()
                        .filter(|c| !labels::is_oneoff(c))
                        .collect();
                    if let Some(reached) = evaluate(*condition, &containers) {
                        tracing::debug!("{} {}: {}", service, condition, reached);
                        let _ = self.signal(service, *condition, reached);
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to inspect {}: {}", service, e);
                    let _ = self.signal(service, *condition, false);
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event)
                        if event.labels.get(labels::PROJECT) == Some(&self.project)
                            && event.labels.get(labels::SERVICE) == Some(service) =>
                    {
                        break
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = self.signal(service, *condition, false);
                        return;
                    }
                }
            }
        }
    }
}

/// Decide a condition from container state; `None` while undecided
fn evaluate(condition: Condition, containers: &[ContainerInfo]) -> Option<bool> {
    if containers.is_empty() {
        return None;
    }
    match condition {
        Condition::ServiceStarted => containers
            .iter()
            .all(|c| c.started_at.is_some())
            .then_some(true),
        Condition::ServiceHealthy => {
            let failed = |c: &ContainerInfo| {
                c.health == Some(HealthStatus::Unhealthy)
                    || (matches!(c.status, ContainerStatus::Exited | ContainerStatus::Dead)
                        && c.health != Some(HealthStatus::Healthy))
            };
            if containers.iter().any(failed) {
                Some(false)
            } else if containers.iter().all(|c| c.health == Some(HealthStatus::Healthy)) {
                Some(true)
            } else {
                None
            }
        }
        Condition::ServiceCompletedSuccessfully => {
            if containers.iter().any(|c| c.status == ContainerStatus::Exited && c.exit_code != Some(0)) {
                Some(false)
            } else if containers.iter().all(|c| c.status == ContainerStatus::Exited) {
                Some(true)
            } else {
                None
            }
        }
    }
}
