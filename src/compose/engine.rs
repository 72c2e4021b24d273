//! Compose lifecycle engine
//!
//! [`ComposeEngine`] runs the compose operations against a
//! [`RuntimeClient`]. It keeps no state between invocations: every decision
//! is taken from the labels of the objects the runtime reports.
//!
//! Start-like operations walk the dependency graph forwards, stop-like
//! operations walk it backwards. Replicas of one service are fanned out in
//! parallel, bounded by the configured parallelism, and every walk shares
//! the engine's cancellation token.

use super::labels;
use super::lock::ProjectLock;
use super::model::VolumeMount;
use super::mounts;
use super::options::{
    BuildOptions, ConfigOptions, CopyDirection, CopyOptions, CreateOptions, DownOptions,
    ExecOptions, ImagesOptions, KillOptions, LogFormat, LogsOptions, PortOptions, PsOptions,
    PullOptions, PushOptions, RemoveOptions, RunOptions, StopOptions, UpOptions,
    DEFAULT_STOP_TIMEOUT,
};
use super::output::{self, LogPrinter, Sink};
use super::planner::{self, Action};
use super::ports;
use super::project::{Condition, Project, PullPolicy, ServiceSpec};
use super::reconciler::Reconciler;
use super::report::{self, ImageEntry};
use super::scheduler::{self, ConditionBoard, DependencyGraph, Direction};
use super::service;
use crate::config::Settings;
use crate::error::{CtlError, Result};
use crate::runtime::{
    ContainerCreate, ContainerEvent, ContainerInfo, ContainerStatus, EventAction, ExecRequest,
    LogOptions, RuntimeClient,
};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long attached log streams may drain after the last container exited
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code of an attached session interrupted by the user
const EXIT_INTERRUPTED: i32 = 130;

/// Compose engine
#[derive(Clone)]
pub struct ComposeEngine {
    runtime: Arc<dyn RuntimeClient>,
    settings: Settings,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
    limit: Arc<Semaphore>,
    output: Sink,
    terminal: bool,
}

impl ComposeEngine {
    /// Engine printing to stdout
    pub fn new(runtime: Arc<dyn RuntimeClient>, settings: Settings) -> Self {
        let (output, terminal) = output::stdout_sink();
        Self::with_output(runtime, settings, output, terminal)
    }

    /// Engine printing to `output`; `terminal` allows colored log prefixes
    pub fn with_output(
        runtime: Arc<dyn RuntimeClient>,
        settings: Settings,
        output: Sink,
        terminal: bool,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(Arc::clone(&runtime))),
            limit: Arc::new(Semaphore::new(settings.parallelism.max(1))),
            cancel: CancellationToken::new(),
            runtime,
            settings,
            output,
            terminal,
        }
    }

    /// Token cancelling every running operation of this engine
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    fn printer(&self, format: LogFormat) -> LogPrinter {
        LogPrinter::new(self.output.clone(), format, self.terminal)
    }

    fn print(&self, text: &str) {
        output::write_raw(&self.output, text);
    }

    async fn lock(&self, project: &Project) -> Result<ProjectLock> {
        ProjectLock::acquire(&self.settings.compose_dir(), &project.name).await
    }

    /// Containers of a project, sorted by service and replica number
    ///
    /// An empty `services` matches every service. Stopped containers are
    /// included with `all`, one-off containers with `oneoff`.
    async fn containers(
        &self,
        project: &str,
        services: &[String],
        all: bool,
        oneoff: bool,
    ) -> Result<Vec<ContainerInfo>> {
        let mut containers: Vec<ContainerInfo> = self
            .runtime
            .list_containers(&labels::project_filter(project), all)
            .await?
            .into_iter()
            .filter(|c| {
                services.is_empty()
                    || labels::service_of(c).is_some_and(|s| services.iter().any(|n| n == s))
            })
            .filter(|c| oneoff || !labels::is_oneoff(c))
            .collect();
        containers.sort_by(|a, b| {
            (labels::service_of(a), labels::number_of(a), a.name())
                .cmp(&(labels::service_of(b), labels::number_of(b), b.name()))
        });
        Ok(containers)
    }

    /// Container of replica `index` of a service
    async fn replica(&self, project: &Project, service: &str, index: u32) -> Result<ContainerInfo> {
        self.containers(&project.name, &[service.to_string()], true, false)
            .await?
            .into_iter()
            .find(|c| labels::number_of(c) == Some(index))
            .ok_or_else(|| {
                CtlError::for_service(
                    service,
                    CtlError::InvalidState(format!("no container with index {}", index)),
                )
            })
    }

    /// Run a task once a parallelism slot is free
    fn spawn_limited<Fut>(&self, tasks: &mut JoinSet<Result<()>>, cancellable: bool, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let limit = Arc::clone(&self.limit);
        let cancel = cancellable.then(|| self.cancel.clone());
        tasks.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|_| CtlError::Cancelled)?;
            match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => Err(CtlError::Cancelled),
                    result = task => result,
                },
                None => task.await,
            }
        });
    }

    /// Apply `op` to every container in parallel
    ///
    /// Cleanup after a cancellation passes `cancellable = false` so the
    /// operations still run.
    async fn fan_out<F, Fut>(&self, containers: Vec<ContainerInfo>, cancellable: bool, op: F) -> Result<()>
    where
        F: Fn(Arc<dyn RuntimeClient>, ContainerInfo) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for container in containers {
            let task = op(Arc::clone(&self.runtime), container);
            self.spawn_limited(&mut tasks, cancellable, task);
        }
        join_all(tasks).await
    }

    async fn stop_containers(
        &self,
        containers: Vec<ContainerInfo>,
        timeouts: &Arc<StopTimeouts>,
        cancellable: bool,
    ) -> Result<()> {
        let timeouts = Arc::clone(timeouts);
        self.fan_out(containers, cancellable, move |runtime, container| {
            let timeout = timeouts.for_container(&container);
            async move {
                if !container.status.is_active() {
                    return Ok(());
                }
                tracing::info!("Container {} Stopping", container.name());
                match runtime.stop_container(&container.id, timeout).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e),
                    Ok(()) => {
                        tracing::info!("Container {} Stopped", container.name());
                        Ok(())
                    }
                }
            }
        })
        .await
    }

    async fn remove_containers(
        &self,
        containers: Vec<ContainerInfo>,
        volumes: bool,
        cancellable: bool,
    ) -> Result<()> {
        self.fan_out(containers, cancellable, move |runtime, container| async move {
            tracing::info!("Container {} Removing", container.name());
            match runtime.remove_container(&container.id, true, volumes).await {
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
                Ok(()) => {
                    tracing::info!("Container {} Removed", container.name());
                    Ok(())
                }
            }
        })
        .await
    }

    /// Visit the selected services in dependency order
    async fn walk<F, Fut>(
        &self,
        project: &Project,
        selected: &[String],
        direction: Direction,
        op: F,
    ) -> Result<()>
    where
        F: Fn(ComposeEngine, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let graph = DependencyGraph::build(&project.services)?;
        let engine = self.clone();
        let project_name = project.name.clone();
        scheduler::traverse(&graph, selected, direction, &self.cancel, move |service| {
            op(engine.clone(), project_name.clone(), service)
        })
        .await
    }

    fn selection(project: &Project, services: &[String], no_deps: bool) -> Result<Vec<String>> {
        if no_deps {
            project.select(services)
        } else {
            project.with_dependencies(services)
        }
    }

    /// Create (and with [`Phase::Up`] start) the selected services
    async fn converge(
        &self,
        project: &Project,
        selected: &[String],
        options: &CreateOptions,
        phase: Phase,
    ) -> Result<()> {
        let graph = DependencyGraph::build(&project.services)?;
        self.reconciler.ensure_resources(project, selected).await?;
        self.handle_orphans(project, options.remove_orphans, options.timeout)
            .await?;
        let timeouts = StopTimeouts::new(project, options.timeout);

        let ctx = Arc::new(Converge {
            engine: self.clone(),
            project: project.clone(),
            graph: graph.clone(),
            selected: selected.iter().cloned().collect(),
            hashes: service::service_hashes(project)?,
            options: options.clone(),
            timeouts,
            phase,
            board: ConditionBoard::new(Arc::clone(&self.runtime), &project.name, self.cancel.clone()),
        });

        scheduler::traverse(&graph, selected, Direction::Up, &self.cancel, move |name| {
            let ctx = Arc::clone(&ctx);
            async move { ctx.service(&name).await }
        })
        .await
    }

    async fn handle_orphans(&self, project: &Project, remove: bool, timeout: Option<Duration>) -> Result<()> {
        let containers = self
            .runtime
            .list_containers(&labels::project_filter(&project.name), true)
            .await?;
        let orphans = planner::orphans(project, &containers);
        if orphans.is_empty() {
            return Ok(());
        }

        if remove {
            let timeouts = StopTimeouts::new(project, timeout);
            self.stop_containers(orphans.clone(), &timeouts, true).await?;
            self.remove_containers(orphans, false, true).await
        } else {
            let names = orphans
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                "Found orphan containers ({}) for this project. If you removed or renamed this service in your compose file, you can run this command with the --remove-orphans flag to clean it up.",
                names
            );
            Ok(())
        }
    }

    /// `up`: converge and start, then either return or stay attached
    ///
    /// Returns the process exit code of the session.
    pub async fn up(&self, project: &Project, services: &[String], options: &UpOptions) -> Result<i32> {
        options.validate()?;
        let mut selected = Self::selection(project, services, options.create.no_deps)?;
        if let Some(service) = &options.exit_code_from {
            project.service(service)?;
            if !selected.contains(service) {
                let requested = [services, std::slice::from_ref(service)].concat();
                selected = Self::selection(project, &requested, options.create.no_deps)?;
            }
        }

        // Exits can happen while starting, so subscribe first
        let events = (!options.detach).then(|| self.runtime.subscribe_events());
        {
            let _lock = self.lock(project).await?;
            tracing::info!("Starting compose project: {}", project.name);
            self.converge(project, &selected, &options.create, Phase::Up)
                .await?;
        }

        match events {
            None => Ok(0),
            Some(events) => self.attach(project, &selected, options, events).await,
        }
    }

    async fn attach(
        &self,
        project: &Project,
        selected: &[String],
        options: &UpOptions,
        mut events: broadcast::Receiver<ContainerEvent>,
    ) -> Result<i32> {
        let containers = self.containers(&project.name, selected, true, false).await?;
        let printer = self.printer(options.log);
        printer.align(containers.iter().map(|c| c.name()));
        printer.plain(&format!(
            "Attaching to {}",
            containers
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let mut streams = JoinSet::new();
        let log_options = LogOptions {
            follow: true,
            tail: None,
            timestamps: options.log.timestamps,
        };
        for container in &containers {
            streams.spawn(stream_logs(
                Arc::clone(&self.runtime),
                container.clone(),
                printer.clone(),
                log_options.clone(),
            ));
        }

        let mut watch = ExitWatch::new(containers);
        watch.drain(&mut events, &printer);

        let abort = options.aborts();
        let mut interrupted = false;
        loop {
            if watch.live.is_empty() || (abort && !watch.exits.is_empty()) {
                break;
            }
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                event = events.recv() => event,
            };
            match event {
                Ok(event) => watch.observe(&event, &printer),
                Err(RecvError::Lagged(_)) => {
                    let current = self.containers(&project.name, selected, true, false).await?;
                    for container in current.iter().filter(|c| !c.status.is_active()) {
                        watch.live.remove(&container.id);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        let aborting = abort && !watch.live.is_empty();
        if interrupted || aborting {
            printer.plain(if interrupted {
                "Gracefully stopping..."
            } else {
                "Aborting on container exit..."
            });
            let running = self.containers(&project.name, selected, false, false).await?;
            let timeouts = StopTimeouts::new(project, options.create.timeout);
            self.stop_containers(running, &timeouts, false).await?;
            watch.drain(&mut events, &printer);
        }

        let _ = tokio::time::timeout(LOG_DRAIN_TIMEOUT, async {
            while streams.join_next().await.is_some() {}
        })
        .await;
        streams.abort_all();

        if interrupted {
            return Ok(EXIT_INTERRUPTED);
        }
        match &options.exit_code_from {
            Some(service) => match watch.exit_code_of(service) {
                Some(code) => Ok(code),
                None => Ok(self
                    .containers(&project.name, std::slice::from_ref(service), true, false)
                    .await?
                    .iter()
                    .find_map(|c| c.exit_code)
                    .unwrap_or(0)),
            },
            None if abort => Ok(watch.exit_code()),
            None => Ok(0),
        }
    }

    /// `create`: converge without starting
    pub async fn create(&self, project: &Project, services: &[String], options: &CreateOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        let selected = Self::selection(project, services, options.no_deps)?;
        self.converge(project, &selected, options, Phase::Create).await
    }

    /// `start`: start existing containers in dependency order
    pub async fn start(&self, project: &Project, services: &[String]) -> Result<()> {
        let _lock = self.lock(project).await?;
        self.start_services(project, services).await
    }

    async fn start_services(&self, project: &Project, services: &[String]) -> Result<()> {
        let selected = project.select(services)?;
        let containers = self.containers(&project.name, &selected, true, false).await?;
        if let Some(paused) = containers.iter().find(|c| c.status == ContainerStatus::Paused) {
            return Err(CtlError::for_service(
                labels::service_of(paused).unwrap_or_default(),
                CtlError::InvalidState(format!(
                    "container {} is paused, unpause it instead",
                    paused.name()
                )),
            ));
        }
        self.converge_existing(project, &selected).await
    }

    async fn converge_existing(&self, project: &Project, selected: &[String]) -> Result<()> {
        let graph = DependencyGraph::build(&project.services)?;
        let ctx = Arc::new(Converge {
            engine: self.clone(),
            project: project.clone(),
            graph: graph.clone(),
            selected: selected.iter().cloned().collect(),
            hashes: IndexMap::new(),
            options: CreateOptions::default(),
            timeouts: StopTimeouts::new(project, None),
            phase: Phase::Start,
            board: ConditionBoard::new(Arc::clone(&self.runtime), &project.name, self.cancel.clone()),
        });
        scheduler::traverse(&graph, selected, Direction::Up, &self.cancel, move |name| {
            let ctx = Arc::clone(&ctx);
            async move { ctx.service(&name).await }
        })
        .await
    }

    /// `stop`: graceful stop in reverse dependency order
    pub async fn stop(&self, project: &Project, services: &[String], options: &StopOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        self.stop_services(project, services, options.timeout).await
    }

    async fn stop_services(
        &self,
        project: &Project,
        services: &[String],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let selected = project.select(services)?;
        let timeouts = StopTimeouts::new(project, timeout);
        self.walk(project, &selected, Direction::Down, move |engine, project_name, service| {
            let timeouts = Arc::clone(&timeouts);
            async move {
                let containers = engine.containers(&project_name, &[service], false, true).await?;
                engine.stop_containers(containers, &timeouts, true).await
            }
        })
        .await
    }

    /// `restart`: stop, then start again
    pub async fn restart(&self, project: &Project, services: &[String], options: &StopOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        self.stop_services(project, services, options.timeout).await?;
        self.start_services(project, services).await
    }

    /// `kill`: signal every running container
    pub async fn kill(&self, project: &Project, services: &[String], options: &KillOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        let selected = project.select(services)?;
        let signal = options.signal.clone();

        self.walk(project, &selected, Direction::Down, move |engine, project_name, service| {
            let signal = signal.clone();
            async move {
                let containers = engine.containers(&project_name, &[service], false, true).await?;
                engine
                    .fan_out(containers, true, move |runtime, container| {
                        let signal = signal.clone();
                        async move {
                            tracing::info!("Container {} Killing", container.name());
                            runtime.kill_container(&container.id, &signal).await
                        }
                    })
                    .await
            }
        })
        .await?;

        if options.remove_orphans {
            self.handle_orphans(project, true, None).await?;
        }
        Ok(())
    }

    fn require_freezer(&self) -> Result<()> {
        if self.runtime.supports_pause() {
            Ok(())
        } else {
            Err(CtlError::Runtime(
                "pause is not supported by this runtime: cgroup freezer is not available".to_string(),
            ))
        }
    }

    /// `pause`: freeze running containers
    pub async fn pause(&self, project: &Project, services: &[String]) -> Result<()> {
        self.require_freezer()?;
        let _lock = self.lock(project).await?;
        let selected = project.select(services)?;
        let containers = self
            .containers(&project.name, &selected, false, false)
            .await?
            .into_iter()
            .filter(|c| c.status == ContainerStatus::Running)
            .collect();
        self.fan_out(containers, true, |runtime, container| async move {
            runtime.pause_container(&container.id).await?;
            tracing::info!("Container {} Paused", container.name());
            Ok(())
        })
        .await
    }

    /// `unpause`: thaw paused containers
    pub async fn unpause(&self, project: &Project, services: &[String]) -> Result<()> {
        self.require_freezer()?;
        let _lock = self.lock(project).await?;
        let selected = project.select(services)?;
        let containers = self
            .containers(&project.name, &selected, false, false)
            .await?
            .into_iter()
            .filter(|c| c.status == ContainerStatus::Paused)
            .collect();
        self.fan_out(containers, true, |runtime, container| async move {
            runtime.unpause_container(&container.id).await?;
            tracing::info!("Container {} Unpaused", container.name());
            Ok(())
        })
        .await
    }

    /// `rm`: remove stopped containers
    pub async fn rm(&self, project: &Project, services: &[String], options: &RemoveOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        let selected = project.select(services)?;
        if options.stop {
            self.stop_services(project, &selected, options.timeout).await?;
        }

        let containers = self.containers(&project.name, &selected, true, false).await?;
        let (active, removable): (Vec<ContainerInfo>, Vec<ContainerInfo>) =
            containers.into_iter().partition(|c| c.status.is_active());

        let mut errors = Vec::new();
        for container in active {
            errors.push(CtlError::for_service(
                labels::service_of(&container).unwrap_or_default(),
                CtlError::InvalidState(format!(
                    "container {} is running: stop it first or pass --stop",
                    container.name()
                )),
            ));
        }

        if removable.is_empty() && errors.is_empty() {
            tracing::info!("No stopped containers");
        }
        let volumes = options.volumes;
        if let Err(e) = self
            .fan_out(removable, true, move |runtime, container| async move {
                runtime.remove_container(&container.id, false, volumes).await?;
                tracing::info!("Container {} Removed", container.name());
                Ok(())
            })
            .await
        {
            errors.push(e);
        }
        CtlError::aggregate(errors)
    }

    /// Names of the containers `rm` would remove; running ones only with `stop`
    pub async fn removable(&self, project: &Project, services: &[String], stop: bool) -> Result<Vec<String>> {
        let selected = project.select(services)?;
        Ok(self
            .containers(&project.name, &selected, true, false)
            .await?
            .into_iter()
            .filter(|c| stop || !c.status.is_active())
            .map(|c| c.name().to_string())
            .collect())
    }

    /// `down`: remove containers, networks and optionally volumes
    ///
    /// Objects that are already gone count as removed.
    pub async fn down(&self, project: &Project, options: &DownOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        let timeouts = StopTimeouts::new(project, options.timeout);
        let volumes = options.volumes;
        let mut errors = Vec::new();

        let services = project.service_names();
        let walk_timeouts = Arc::clone(&timeouts);
        let removed = self
            .walk(project, &services, Direction::Down, move |engine, project_name, service| {
                let timeouts = Arc::clone(&walk_timeouts);
                async move {
                    let containers = engine.containers(&project_name, &[service], true, true).await?;
                    engine.stop_and_remove(containers, &timeouts, volumes).await
                }
            })
            .await;
        if let Err(e) = removed {
            errors.push(e);
        }

        let disabled: Vec<String> = project.disabled.keys().cloned().collect();
        if !disabled.is_empty() {
            let containers = self.containers(&project.name, &disabled, true, true).await?;
            if let Err(e) = self.stop_and_remove(containers, &timeouts, volumes).await {
                errors.push(e);
            }
        }

        let all = self
            .runtime
            .list_containers(&labels::project_filter(&project.name), true)
            .await?;
        let orphans = planner::orphans(project, &all);
        if options.remove_orphans {
            if let Err(e) = self.stop_and_remove(orphans, &timeouts, volumes).await {
                errors.push(e);
            }
        } else if !orphans.is_empty() {
            tracing::warn!(
                "Found orphan containers ({}) for this project. Run down with --remove-orphans to remove them.",
                orphans.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
            );
        }

        // A container that failed to go away already explains a busy network
        let containers_failed = !errors.is_empty();
        if let Err(e) = self.remove_networks(project, containers_failed).await {
            errors.push(e);
        }
        if options.volumes {
            if let Err(e) = self.remove_volumes(project).await {
                errors.push(e);
            }
        }
        CtlError::aggregate(errors)
    }

    async fn stop_and_remove(
        &self,
        containers: Vec<ContainerInfo>,
        timeouts: &Arc<StopTimeouts>,
        volumes: bool,
    ) -> Result<()> {
        self.stop_containers(containers.clone(), timeouts, true).await?;
        self.remove_containers(containers, volumes, true).await
    }

    /// Remove the project's networks; with `skip_busy`, networks still in use
    /// are left in place without an error
    async fn remove_networks(&self, project: &Project, skip_busy: bool) -> Result<()> {
        let external: BTreeSet<&str> = project
            .networks
            .values()
            .filter(|n| n.external)
            .map(|n| n.name.as_str())
            .collect();

        let mut errors = Vec::new();
        for network in self.runtime.list_networks().await? {
            if network.labels.get(labels::PROJECT) != Some(&project.name)
                || external.contains(network.name.as_str())
            {
                continue;
            }

            let mut users = Vec::new();
            for id in &network.containers {
                match self.runtime.inspect_container(id).await {
                    Ok(container) => users.push(container.name().to_string()),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            if !users.is_empty() && skip_busy {
                tracing::warn!("Network {} is still in use by {}", network.name, users.join(", "));
                continue;
            }
            if !users.is_empty() {
                errors.push(CtlError::ResourceInUse(format!(
                    "network {} is still in use by {}",
                    network.name,
                    users.join(", ")
                )));
                continue;
            }

            tracing::info!("Network {} Removing", network.name);
            match self.runtime.remove_network(&network.name).await {
                Ok(()) => tracing::info!("Network {} Removed", network.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e),
            }
        }
        CtlError::aggregate(errors)
    }

    async fn remove_volumes(&self, project: &Project) -> Result<()> {
        let mut errors = Vec::new();
        for volume in self.runtime.list_volumes().await? {
            if volume.anonymous || volume.labels.get(labels::PROJECT) != Some(&project.name) {
                continue;
            }
            match self.runtime.remove_volume(&volume.name, false).await {
                Ok(()) => tracing::info!("Volume {} Removed", volume.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e),
            }
        }
        CtlError::aggregate(errors)
    }

    /// `run`: one-off container of a service
    ///
    /// Returns the exit code of the container, 0 when detached.
    pub async fn run(&self, project: &Project, options: &RunOptions) -> Result<i32> {
        options.validate()?;
        let spec = project.any_service(&options.service)?.clone();

        let (id, name) = {
            let _lock = self.lock(project).await?;
            let dependencies: Vec<String> = spec
                .depends_on
                .keys()
                .filter(|d| project.services.contains_key(*d))
                .cloned()
                .collect();
            if !options.no_deps && !dependencies.is_empty() {
                let selected = project.with_dependencies(&dependencies)?;
                let create = CreateOptions {
                    build: options.build,
                    pull: options.pull,
                    ..CreateOptions::default()
                };
                self.converge(project, &selected, &create, Phase::Up).await?;
            }

            self.reconciler
                .ensure_resources(project, std::slice::from_ref(&spec.name))
                .await?;
            self.reconciler
                .ensure_image(project, &spec, options.build, options.pull)
                .await
                .map_err(|e| attribute(&spec.name, e))?;

            let create = self.oneoff_container(project, &spec, options).await?;
            let id = self.runtime.create_container(&create).await?;
            tracing::info!("Container {} Created", create.name);
            (id, create.name)
        };

        self.runtime.start_container(&id).await?;
        if options.detach {
            self.print(&format!("{}\n", name));
            return Ok(0);
        }

        let mut lines = self
            .runtime
            .container_logs(
                &id,
                &LogOptions {
                    follow: true,
                    ..LogOptions::default()
                },
            )
            .await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let timeout = spec.stop_timeout().unwrap_or(DEFAULT_STOP_TIMEOUT);
                    let _ = self.runtime.stop_container(&id, timeout).await;
                    break;
                }
                line = lines.recv() => match line {
                    Some(line) => self.print(&format!("{}\n", line.text.trim_end_matches('\n'))),
                    None => break,
                },
            }
        }

        let exit_code = self.runtime.wait_container(&id).await?;
        if options.rm {
            self.runtime.remove_container(&id, true, true).await?;
            tracing::debug!("Removed one-off container {}", name);
        }
        Ok(exit_code)
    }

    async fn oneoff_container(
        &self,
        project: &Project,
        spec: &ServiceSpec,
        options: &RunOptions,
    ) -> Result<ContainerCreate> {
        let hash = service::config_hash(spec)?;
        let mut spec = spec.clone();

        if !options.command.is_empty() {
            spec.command = Some(options.command.clone());
        }
        if let Some(entrypoint) = &options.entrypoint {
            spec.entrypoint = Some(service::split_command(entrypoint)?);
        }
        for entry in &options.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    spec.environment.insert(key.to_string(), value.to_string());
                }
                None => {
                    if let Some(value) = project.environment.get(entry) {
                        spec.environment.insert(entry.clone(), value.to_string());
                    }
                }
            }
        }
        for entry in &options.labels {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            spec.labels.insert(key.to_string(), value.to_string());
        }
        for entry in &options.volumes {
            spec.mounts
                .push(mounts::parse_volume(&VolumeMount::Short(entry.clone()), &project.working_dir)?);
        }
        if options.workdir.is_some() {
            spec.working_dir = options.workdir.clone();
        }
        if options.user.is_some() {
            spec.user = options.user.clone();
        }
        if !options.service_ports {
            let mut published = Vec::new();
            for entry in &options.publish {
                published.extend(ports::parse_port_spec(entry)?);
            }
            spec.ports = published;
        }
        spec.tty = options.tty;
        spec.stdin_open = options.interactive;
        spec.restart = None;
        spec.container_name = None;

        let number = self
            .runtime
            .list_containers(&labels::service_filter(&project.name, &spec.name), true)
            .await?
            .iter()
            .filter(|c| labels::is_oneoff(c))
            .filter_map(labels::number_of)
            .max()
            .unwrap_or(0)
            + 1;
        let name = options.name.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}-run-{}", project.name, spec.name, &suffix[..12])
        });

        Ok(service::container_create(project, &spec, &name, number, &hash, true))
    }

    /// `exec`: run a command in a running replica; returns its exit code
    pub async fn exec(&self, project: &Project, options: &ExecOptions) -> Result<i32> {
        options.validate()?;
        project.service(&options.service)?;
        let container = self.replica(project, &options.service, options.index).await?;
        if container.status != ContainerStatus::Running {
            return Err(CtlError::for_service(
                &options.service,
                CtlError::InvalidState(format!("container {} is not running", container.name())),
            ));
        }

        let result = self
            .runtime
            .exec(
                &container.id,
                &ExecRequest {
                    cmd: options.command.clone(),
                    tty: options.tty,
                    interactive: options.interactive,
                    detach: options.detach,
                    env: options.env.clone(),
                    working_dir: options.workdir.clone(),
                    user: options.user.clone(),
                    privileged: options.privileged,
                },
            )
            .await?;
        if !result.output.is_empty() {
            self.print(&result.output);
        }
        Ok(result.exit_code)
    }

    /// `logs`: multiplex the logs of the selected services
    pub async fn logs(&self, project: &Project, services: &[String], options: &LogsOptions) -> Result<()> {
        let selected = project.select(services)?;
        let containers: Vec<ContainerInfo> = self
            .containers(&project.name, &selected, true, false)
            .await?
            .into_iter()
            .filter(|c| options.index.is_none() || labels::number_of(c) == options.index)
            .collect();

        let printer = self.printer(options.log);
        printer.align(containers.iter().map(|c| c.name()));

        let log_options = LogOptions {
            follow: options.follow,
            tail: options.tail,
            timestamps: options.log.timestamps,
        };
        let mut streams = JoinSet::new();
        for container in containers {
            streams.spawn(stream_logs(
                Arc::clone(&self.runtime),
                container,
                printer.clone(),
                log_options.clone(),
            ));
        }

        let mut errors = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    streams.abort_all();
                    break;
                }
                joined = streams.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => errors.push(e),
                    Some(Err(e)) => errors.push(CtlError::Runtime(format!("log stream failed: {}", e))),
                },
            }
        }
        CtlError::aggregate(errors)
    }

    /// `ps`
    pub async fn ps(&self, project: &Project, services: &[String], options: &PsOptions) -> Result<String> {
        let selected = if services.is_empty() {
            Vec::new()
        } else {
            project.select(services)?
        };
        let all = options.all || !options.status.is_empty();
        let containers: Vec<ContainerInfo> = self
            .containers(&project.name, &selected, all, true)
            .await?
            .into_iter()
            .filter(|c| options.status.is_empty() || options.status.contains(&c.status))
            .collect();
        report::ps(&containers, options)
    }

    /// `images`: images used by the project's containers
    pub async fn images(&self, project: &Project, services: &[String], options: &ImagesOptions) -> Result<String> {
        let selected = if services.is_empty() {
            Vec::new()
        } else {
            project.select(services)?
        };
        let mut entries = Vec::new();
        for container in self.containers(&project.name, &selected, true, true).await? {
            let entry = match self.runtime.inspect_image(&container.spec.image).await? {
                Some(image) => ImageEntry::new(&container, &image.reference, &image.id, image.size),
                None => ImageEntry::new(&container, &container.spec.image, "", 0),
            };
            entries.push(entry);
        }
        report::images(&entries, options.quiet, options.format)
    }

    /// `top`: process tables of running containers
    pub async fn top(&self, project: &Project, services: &[String]) -> Result<String> {
        let selected = project.select(services)?;
        let mut sections = Vec::new();
        for container in self.containers(&project.name, &selected, false, false).await? {
            if !container.status.is_active() {
                continue;
            }
            let table = self.runtime.top(&container.id).await?;
            let title = labels::service_of(&container).unwrap_or(container.name());
            sections.push(report::top(title, &table));
        }
        Ok(sections.join("\n"))
    }

    /// `port`: public address of a published port
    pub async fn port(&self, project: &Project, options: &PortOptions) -> Result<String> {
        project.service(&options.service)?;
        let container = self.replica(project, &options.service, options.index).await?;
        let published = container.ports.iter().find_map(|p| {
            (p.container_port == options.private_port && p.protocol == options.protocol)
                .then_some(p.host_port)
                .flatten()
                .map(|host_port| (p.host_ip, host_port))
        });

        match published {
            Some((ip, host_port)) => Ok(format!(
                "{}:{}\n",
                ip.map(|ip| ip.to_string()).unwrap_or_else(|| "0.0.0.0".to_string()),
                host_port
            )),
            None => Err(CtlError::for_service(
                &options.service,
                CtlError::NotFound {
                    kind: "port binding",
                    name: format!("{}/{}", options.private_port, options.protocol),
                },
            )),
        }
    }

    /// `config`
    pub fn config(&self, project: &Project, options: &ConfigOptions) -> Result<String> {
        report::config(project, options)
    }

    /// `build`: build every selected service with a build section
    pub async fn build(&self, project: &Project, services: &[String], options: &BuildOptions) -> Result<()> {
        let _lock = self.lock(project).await?;
        let mut errors = Vec::new();
        for name in project.select(services)? {
            let spec = project.service(&name)?;
            if spec.build.is_none() {
                tracing::debug!("{} uses an image, skipping", name);
                continue;
            }
            match self.reconciler.build_service(project, spec, options).await {
                Ok(image) if !options.quiet => self.print(&format!("Image {} Built\n", image.reference)),
                Ok(_) => {}
                Err(e) => errors.push(attribute(&name, e)),
            }
        }
        CtlError::aggregate(errors)
    }

    /// `pull`: pull the images of the selected services
    pub async fn pull(&self, project: &Project, services: &[String], options: &PullOptions) -> Result<()> {
        let mut errors = Vec::new();
        for name in project.select(services)? {
            let spec = project.service(&name)?;
            if spec.pull_policy == Some(PullPolicy::Build) {
                continue;
            }
            let Some(image) = &spec.image else {
                continue;
            };
            match self.reconciler.pull(image, spec).await {
                Ok(info) if !options.quiet => self.print(&format!("Image {} Pulled\n", info.reference)),
                Ok(_) => {}
                // Images that can be built locally may legitimately be absent from the registry
                Err(e) if spec.build.is_some() || options.ignore_pull_failures => {
                    tracing::warn!("Pulling {} failed: {}", image, e);
                }
                Err(e) => errors.push(e),
            }
        }
        CtlError::aggregate(errors)
    }

    /// `push`: push images of services with an explicit `image:`
    pub async fn push(&self, project: &Project, services: &[String], options: &PushOptions) -> Result<()> {
        let mut errors = Vec::new();
        for name in project.select(services)? {
            let spec = project.service(&name)?;
            let Some(image) = &spec.image else {
                tracing::debug!("{} has no image name, skipping", name);
                continue;
            };
            tracing::info!("Image {} Pushing", image);
            match self.runtime.push_image(image).await {
                Ok(()) => tracing::info!("Image {} Pushed", image),
                Err(e) if options.ignore_push_failures => {
                    tracing::warn!("Pushing {} failed: {}", image, e);
                }
                Err(e) => errors.push(e),
            }
        }
        CtlError::aggregate(errors)
    }

    /// `cp`: copy between a service container and the local filesystem
    pub async fn cp(&self, project: &Project, options: &CopyOptions) -> Result<()> {
        match &options.direction {
            CopyDirection::FromContainer { service, path, dest } => {
                project.service(service)?;
                let container = self.replica(project, service, options.index).await?;
                self.runtime.copy_from_container(&container.id, path, dest).await
            }
            CopyDirection::ToContainer { src, service, path } => {
                project.service(service)?;
                let targets = if options.all {
                    self.containers(&project.name, std::slice::from_ref(service), true, false)
                        .await?
                } else {
                    vec![self.replica(project, service, options.index).await?]
                };
                if targets.is_empty() {
                    return Err(CtlError::for_service(
                        service,
                        CtlError::InvalidState("no container to copy to".to_string()),
                    ));
                }
                for container in targets {
                    self.runtime.copy_to_container(&container.id, src, path).await?;
                }
                Ok(())
            }
        }
    }
}

/// Stop timeout per service
///
/// An explicit `--timeout` wins over `stop_grace_period`; services declaring
/// neither, and containers of unknown services, get the default.
#[derive(Debug)]
struct StopTimeouts {
    explicit: Option<Duration>,
    services: HashMap<String, Duration>,
}

impl StopTimeouts {
    fn new(project: &Project, explicit: Option<Duration>) -> Arc<Self> {
        let services = project
            .services
            .values()
            .chain(project.disabled.values())
            .filter_map(|spec| Some((spec.name.clone(), spec.stop_timeout()?)))
            .collect();
        Arc::new(Self { explicit, services })
    }

    fn for_service(&self, service: &str) -> Duration {
        self.explicit
            .or_else(|| self.services.get(service).copied())
            .unwrap_or(DEFAULT_STOP_TIMEOUT)
    }

    fn for_container(&self, container: &ContainerInfo) -> Duration {
        self.for_service(labels::service_of(container).unwrap_or_default())
    }
}

/// What a converge walk does to each service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Create or recreate containers
    Create,
    /// Create or recreate, then start
    Up,
    /// Start existing containers only
    Start,
}

/// Shared state of one converge walk
struct Converge {
    engine: ComposeEngine,
    project: Project,
    graph: DependencyGraph,
    selected: BTreeSet<String>,
    hashes: IndexMap<String, String>,
    options: CreateOptions,
    timeouts: Arc<StopTimeouts>,
    phase: Phase,
    board: Arc<ConditionBoard>,
}

impl Converge {
    async fn service(&self, name: &str) -> Result<()> {
        if self.phase != Phase::Create {
            self.wait_dependencies(name).await?;
        }
        match self.phase {
            Phase::Start => self.start_existing(name).await?,
            Phase::Create | Phase::Up => self.apply_plan(name).await?,
        }
        if self.phase != Phase::Create {
            self.board.signal(name, Condition::ServiceStarted, true)?;
        }
        Ok(())
    }

    async fn wait_dependencies(&self, name: &str) -> Result<()> {
        for (dependency, condition) in self.graph.dependencies(name) {
            if !self.selected.contains(dependency) {
                continue;
            }
            let mut condition = *condition;
            let checked = self
                .project
                .services
                .get(dependency)
                .is_some_and(|s| s.has_healthcheck());
            if condition == Condition::ServiceHealthy && !checked {
                if self.board.degrade(dependency) {
                    tracing::warn!(
                        "{} depends on {} being healthy but {} declares no healthcheck; waiting for it to start instead",
                        name,
                        dependency,
                        dependency
                    );
                }
                condition = Condition::ServiceStarted;
            }
            tracing::debug!("{} waiting for {} ({})", name, dependency, condition);
            self.board.wait(dependency, condition).await?;
        }
        Ok(())
    }

    async fn start_existing(&self, name: &str) -> Result<()> {
        let containers = self
            .engine
            .containers(&self.project.name, &[name.to_string()], true, false)
            .await?;
        if containers.is_empty() {
            return Err(CtlError::for_service(
                name,
                CtlError::InvalidState("no container to start".to_string()),
            ));
        }
        let pending = containers
            .into_iter()
            .filter(|c| c.status != ContainerStatus::Running)
            .collect();
        self.engine
            .fan_out(pending, true, |runtime, container| async move {
                runtime.start_container(&container.id).await?;
                tracing::info!("Container {} Started", container.name());
                Ok(())
            })
            .await
    }

    async fn apply_plan(&self, name: &str) -> Result<()> {
        let spec = self.project.service(name)?;
        self.engine
            .reconciler
            .ensure_image(&self.project, spec, self.options.build, self.options.pull)
            .await
            .map_err(|e| attribute(name, e))?;

        let replicas = self.options.scale.get(name).copied().unwrap_or(spec.replicas);
        let hash = self
            .hashes
            .get(name)
            .cloned()
            .ok_or_else(|| CtlError::ConfigInvalid(format!("no such service: {}", name)))?;
        let existing = self
            .engine
            .runtime
            .list_containers(&labels::service_filter(&self.project.name, name), true)
            .await?;
        let plan = planner::plan_service(name, replicas, &hash, existing, self.options.recreate);

        let removals: Vec<ContainerInfo> = plan.removals().cloned().collect();
        if !removals.is_empty() {
            self.engine
                .stop_and_remove(removals, &self.timeouts, false)
                .await?;
        }

        let start = self.phase == Phase::Up;
        let timeout = self.timeouts.for_service(name);
        let mut tasks = JoinSet::new();
        for action in plan.actions {
            let runtime = Arc::clone(&self.engine.runtime);
            match action {
                Action::Remove { .. } => {}
                Action::Keep { container } => {
                    let stopped = matches!(
                        container.status,
                        ContainerStatus::Created | ContainerStatus::Exited
                    );
                    if start && stopped {
                        self.engine.spawn_limited(&mut tasks, true, async move {
                            runtime.start_container(&container.id).await?;
                            tracing::info!("Container {} Started", container.name());
                            Ok(())
                        });
                    } else {
                        tracing::info!("Container {} Running", container.name());
                    }
                }
                Action::Create { number } => {
                    let create = self.replica_spec(spec, number, &hash);
                    self.engine.spawn_limited(
                        &mut tasks,
                        true,
                        converge_replica(runtime, create, None, start, timeout),
                    );
                }
                Action::Recreate { container, number } => {
                    let create = self.replica_spec(spec, number, &hash);
                    self.engine.spawn_limited(
                        &mut tasks,
                        true,
                        converge_replica(runtime, create, Some(container), start, timeout),
                    );
                }
            }
        }
        join_all(tasks).await
    }

    fn replica_spec(&self, spec: &ServiceSpec, number: u32, hash: &str) -> ContainerCreate {
        let name = service::container_name(&self.project, spec, number);
        service::container_create(&self.project, spec, &name, number, hash, false)
    }
}

/// Create one replica, replacing `previous` when given
///
/// A replaced container hands its anonymous volumes to the new one.
async fn converge_replica(
    runtime: Arc<dyn RuntimeClient>,
    mut create: ContainerCreate,
    previous: Option<ContainerInfo>,
    start: bool,
    timeout: Duration,
) -> Result<()> {
    if let Some(old) = &previous {
        for mount in create.mounts.iter_mut().filter(|m| m.is_anonymous()) {
            mount.source = old.anonymous_volumes.get(&mount.target).cloned();
        }
        tracing::info!("Container {} Recreate", old.name());
        runtime.stop_container(&old.id, timeout).await?;
        runtime.remove_container(&old.id, true, false).await?;
    }

    let id = runtime.create_container(&create).await?;
    if previous.is_some() {
        tracing::info!("Container {} Recreated", create.name);
    } else {
        tracing::info!("Container {} Created", create.name);
    }

    if start {
        runtime.start_container(&id).await?;
        tracing::info!("Container {} Started", create.name);
    }
    Ok(())
}

async fn stream_logs(
    runtime: Arc<dyn RuntimeClient>,
    container: ContainerInfo,
    printer: LogPrinter,
    options: LogOptions,
) -> Result<()> {
    let service = labels::service_of(&container).unwrap_or_default().to_string();
    let mut lines = runtime.container_logs(&container.id, &options).await?;
    while let Some(line) = lines.recv().await {
        printer.line(&service, container.name(), &line);
    }
    Ok(())
}

/// Exits of the containers an attached `up` watches
struct ExitWatch {
    targets: HashMap<String, ContainerInfo>,
    live: BTreeSet<String>,
    /// Service and exit code, in the order the containers exited
    exits: Vec<(String, i32)>,
}

impl ExitWatch {
    fn new(containers: Vec<ContainerInfo>) -> Self {
        let live = containers
            .iter()
            .filter(|c| c.status.is_active())
            .map(|c| c.id.clone())
            .collect();
        Self {
            targets: containers.into_iter().map(|c| (c.id.clone(), c)).collect(),
            live,
            exits: Vec::new(),
        }
    }

    fn observe(&mut self, event: &ContainerEvent, printer: &LogPrinter) {
        let EventAction::Die { exit_code } = event.action else {
            return;
        };
        let Some(container) = self.targets.get(&event.container_id) else {
            return;
        };
        let service = labels::service_of(container).unwrap_or_default();
        self.live.remove(&event.container_id);
        self.exits.push((service.to_string(), exit_code));
        printer.event(service, container.name(), &format!("exited with code {}", exit_code));
    }

    /// Process every event already queued
    fn drain(&mut self, events: &mut broadcast::Receiver<ContainerEvent>, printer: &LogPrinter) {
        loop {
            match events.try_recv() {
                Ok(event) => self.observe(&event, printer),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    /// Exit code of an aborted session
    ///
    /// The code of the first container to exit; when that is 0 but another
    /// container failed on its own (not by our SIGTERM/SIGKILL), 1.
    fn exit_code(&self) -> i32 {
        let Some(((_, first), rest)) = self.exits.split_first() else {
            return 0;
        };
        if *first != 0 {
            return *first;
        }
        if rest.iter().any(|&(_, code)| code != 0 && code != 137 && code != 143) {
            1
        } else {
            0
        }
    }

    /// Exit code of the first container of `service` to exit
    fn exit_code_of(&self, service: &str) -> Option<i32> {
        self.exits
            .iter()
            .find(|(name, _)| name == service)
            .map(|&(_, code)| code)
    }
}

/// Prefix internal errors with the service name; runtime errors stay as they are
fn attribute(service: &str, err: CtlError) -> CtlError {
    match err {
        CtlError::Runtime(_)
        | CtlError::NotFound { .. }
        | CtlError::Service { .. }
        | CtlError::Aggregate(_)
        | CtlError::Cancelled => err,
        other => CtlError::for_service(service, other),
    }
}

async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::loader::{load, ProjectOptions};
    use crate::compose::output::tests::Buffer;
    use crate::compose::planner::RecreatePolicy;
    use crate::runtime::LocalRuntime;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        runtime: Arc<LocalRuntime>,
        engine: ComposeEngine,
        output: Buffer,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(temp.path().join("state")).unwrap());
        let output = Buffer::default();
        let engine = ComposeEngine::with_output(
            runtime.clone(),
            Settings::with_root(temp.path()),
            output.sink(),
            false,
        );
        Fixture {
            temp,
            runtime,
            engine,
            output,
        }
    }

    fn project(dir: &Path, yaml: &str) -> Project {
        let dir = dir.join("project");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("compose.yaml"), yaml).unwrap();
        load(&ProjectOptions {
            working_dir: dir,
            ..ProjectOptions::default()
        })
        .unwrap()
    }

    fn detached() -> UpOptions {
        UpOptions {
            detach: true,
            ..UpOptions::default()
        }
    }

    async fn service_containers(runtime: &LocalRuntime, service: &str) -> Vec<ContainerInfo> {
        let mut containers = runtime
            .list_containers(&labels::service_filter("proj", service), true)
            .await
            .unwrap();
        containers.sort_by_key(|c| labels::number_of(c));
        containers
    }

    #[tokio::test]
    async fn test_up_recreates_on_config_change() {
        let f = fixture();
        let first = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    volumes: [\"/cache\"]\n",
        );
        f.engine.up(&first, &[], &detached()).await.unwrap();
        let before = service_containers(&f.runtime, "web").await;
        assert_eq!(before.len(), 1);
        let volume = before[0].anonymous_volumes["/cache"].clone();

        // Same config: nothing changes
        f.engine.up(&first, &[], &detached()).await.unwrap();
        assert_eq!(service_containers(&f.runtime, "web").await[0].id, before[0].id);

        let second = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    volumes: [\"/cache\"]\n    environment: [MODE=prod]\n",
        );
        f.engine.up(&second, &[], &detached()).await.unwrap();
        let after = service_containers(&f.runtime, "web").await;
        assert_eq!(after.len(), 1);
        assert_ne!(after[0].id, before[0].id);
        assert_eq!(after[0].status, ContainerStatus::Running);
        assert_eq!(after[0].anonymous_volumes["/cache"], volume);
    }

    #[tokio::test]
    async fn test_force_and_no_recreate() {
        let f = fixture();
        let p = project(f.temp.path(), "name: proj\nservices:\n  web:\n    image: nginx\n");
        f.engine.up(&p, &[], &detached()).await.unwrap();
        let original = service_containers(&f.runtime, "web").await[0].id.clone();

        let mut options = detached();
        options.create.recreate = RecreatePolicy::Force;
        f.engine.up(&p, &[], &options).await.unwrap();
        let forced = service_containers(&f.runtime, "web").await[0].id.clone();
        assert_ne!(forced, original);

        let changed = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    command: [\"nginx\", \"-g\", \"daemon off;\"]\n",
        );
        options.create.recreate = RecreatePolicy::Never;
        f.engine.up(&changed, &[], &options).await.unwrap();
        assert_eq!(service_containers(&f.runtime, "web").await[0].id, forced);
    }

    #[tokio::test]
    async fn test_start_rejects_paused_containers() {
        let f = fixture();
        let p = project(f.temp.path(), "name: proj\nservices:\n  web:\n    image: nginx\n");
        f.engine.up(&p, &[], &detached()).await.unwrap();
        f.engine.pause(&p, &[]).await.unwrap();

        let err = f.engine.start(&p, &[]).await.unwrap_err();
        assert!(matches!(err.root(), CtlError::InvalidState(_)));

        f.engine.unpause(&p, &[]).await.unwrap();
        f.engine.stop(&p, &[], &StopOptions::default()).await.unwrap();
        assert_eq!(
            service_containers(&f.runtime, "web").await[0].status,
            ContainerStatus::Exited
        );
        f.engine.start(&p, &[]).await.unwrap();
        assert_eq!(
            service_containers(&f.runtime, "web").await[0].status,
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_stop_uses_grace_period() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    stop_grace_period: 2s\n  db:\n    image: postgres\n",
        );
        f.engine.up(&p, &[], &detached()).await.unwrap();
        f.engine.stop(&p, &[], &StopOptions::default()).await.unwrap();
        assert_eq!(
            service_containers(&f.runtime, "web").await[0].stop_timeout,
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            service_containers(&f.runtime, "db").await[0].stop_timeout,
            Some(DEFAULT_STOP_TIMEOUT)
        );

        // --timeout wins over the service's grace period
        f.engine.start(&p, &[]).await.unwrap();
        let options = StopOptions {
            timeout: Some(Duration::from_secs(1)),
        };
        f.engine.restart(&p, &["web".to_string()], &options).await.unwrap();
        assert_eq!(
            service_containers(&f.runtime, "web").await[0].stop_timeout,
            Some(Duration::from_secs(1))
        );

        f.engine.down(&p, &DownOptions::default()).await.unwrap();
        assert!(service_containers(&f.runtime, "web").await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_requires_freezer() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::without_freezer(temp.path().join("state")).unwrap());
        let engine = ComposeEngine::with_output(
            runtime,
            Settings::with_root(temp.path()),
            Buffer::default().sink(),
            false,
        );
        let p = project(temp.path(), "name: proj\nservices:\n  web:\n    image: nginx\n");
        engine.up(&p, &[], &detached()).await.unwrap();
        assert!(matches!(engine.pause(&p, &[]).await, Err(CtlError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_rm_refuses_running_containers() {
        let f = fixture();
        let p = project(f.temp.path(), "name: proj\nservices:\n  web:\n    image: nginx\n");
        f.engine.up(&p, &[], &detached()).await.unwrap();

        let err = f.engine.rm(&p, &[], &RemoveOptions::default()).await.unwrap_err();
        assert!(matches!(err.root(), CtlError::InvalidState(_)));
        assert_eq!(service_containers(&f.runtime, "web").await.len(), 1);
        assert!(f.engine.removable(&p, &[], false).await.unwrap().is_empty());
        assert_eq!(f.engine.removable(&p, &[], true).await.unwrap(), vec!["proj-web-1"]);

        f.engine
            .rm(
                &p,
                &[],
                &RemoveOptions {
                    stop: true,
                    ..RemoveOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(service_containers(&f.runtime, "web").await.is_empty());
    }

    #[tokio::test]
    async fn test_busy_network_after_failed_removal() {
        let f = fixture();
        let p = project(f.temp.path(), "name: proj\nservices:\n  web:\n    image: nginx\n");
        f.engine.up(&p, &[], &detached()).await.unwrap();

        let err = f.engine.remove_networks(&p, false).await.unwrap_err();
        assert!(matches!(err, CtlError::ResourceInUse(_)));

        f.engine.remove_networks(&p, true).await.unwrap();
        let networks = f.runtime.list_networks().await.unwrap();
        assert!(networks.iter().any(|n| n.name == "proj_default"));

        f.engine.down(&p, &DownOptions::default()).await.unwrap();
        let networks = f.runtime.list_networks().await.unwrap();
        assert!(!networks.iter().any(|n| n.name == "proj_default"));
    }

    #[tokio::test]
    async fn test_top_sections_are_titled_by_service() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n  db:\n    image: postgres\n",
        );
        f.engine.up(&p, &[], &detached()).await.unwrap();

        let out = f.engine.top(&p, &["web".to_string()]).await.unwrap();
        assert!(out.starts_with("web\nUID"));
        assert!(!out.contains("proj-web-1"));
    }

    #[tokio::test]
    async fn test_healthy_dependency_without_healthcheck_degrades() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            r#"
name: proj
services:
  db:
    image: postgres
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
"#,
        );
        f.engine.up(&p, &[], &detached()).await.unwrap();
        assert_eq!(service_containers(&f.runtime, "web").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            r#"
name: proj
services:
  migrate:
    image: alpine
    command: ["sh", "-c", "exit 3"]
  web:
    image: nginx
    depends_on:
      migrate:
        condition: service_completed_successfully
"#,
        );
        let err = f.engine.up(&p, &[], &detached()).await.unwrap_err();
        assert!(matches!(err.root(), CtlError::InvalidState(_)));
        assert!(service_containers(&f.runtime, "web").await.is_empty());
    }

    #[tokio::test]
    async fn test_run_oneoff() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    ports: [\"8080:80\"]\n",
        );

        let code = f
            .engine
            .run(
                &p,
                &RunOptions {
                    service: "web".to_string(),
                    command: vec!["echo".to_string(), "hello".to_string()],
                    rm: true,
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(f.output.contents().contains("hello\n"));
        assert!(service_containers(&f.runtime, "web").await.is_empty());

        let code = f
            .engine
            .run(
                &p,
                &RunOptions {
                    service: "web".to_string(),
                    command: vec!["sh".to_string(), "-c".to_string(), "exit 4".to_string()],
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(code, 4);
        let oneoff = &service_containers(&f.runtime, "web").await[0];
        assert!(labels::is_oneoff(oneoff));
        assert!(oneoff.name().starts_with("proj-web-run-"));
        // Service ports are not published without --service-ports
        assert!(oneoff.spec.ports.is_empty());
    }

    #[tokio::test]
    async fn test_exec_and_port() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    ports: [\"127.0.0.1:8080:80/udp\"]\n",
        );
        f.engine.up(&p, &[], &detached()).await.unwrap();

        let code = f
            .engine
            .exec(
                &p,
                &ExecOptions {
                    service: "web".to_string(),
                    command: vec!["echo".to_string(), "hi".to_string()],
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(f.output.contents().contains("hi\n"));

        let address = f
            .engine
            .port(
                &p,
                &PortOptions {
                    service: "web".to_string(),
                    private_port: 80,
                    protocol: crate::runtime::Protocol::Udp,
                    index: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(address, "127.0.0.1:8080\n");

        let missing = f
            .engine
            .port(
                &p,
                &PortOptions {
                    service: "web".to_string(),
                    private_port: 80,
                    index: 1,
                    ..PortOptions::default()
                },
            )
            .await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_logs_are_prefixed() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            "name: proj\nservices:\n  hello:\n    image: alpine\n    command: echo hello world\n",
        );
        f.engine.up(&p, &[], &detached()).await.unwrap();
        f.engine
            .logs(&p, &[], &LogsOptions::default())
            .await
            .unwrap();
        assert!(f.output.contents().contains("proj-hello-1 | hello world\n"));
    }

    #[test]
    fn test_exit_code_of_aborted_session() {
        let watch = |exits: Vec<i32>| ExitWatch {
            targets: HashMap::new(),
            live: BTreeSet::new(),
            exits: exits.into_iter().map(|code| ("svc".to_string(), code)).collect(),
        };
        assert_eq!(watch(vec![]).exit_code(), 0);
        assert_eq!(watch(vec![2, 1]).exit_code(), 2);
        assert_eq!(watch(vec![0, 143]).exit_code(), 0);
        assert_eq!(watch(vec![0, 137, 5]).exit_code(), 1);

        let mixed = ExitWatch {
            targets: HashMap::new(),
            live: BTreeSet::new(),
            exits: vec![("worker".to_string(), 2), ("web".to_string(), 0), ("web".to_string(), 7)],
        };
        assert_eq!(mixed.exit_code_of("web"), Some(0));
        assert_eq!(mixed.exit_code_of("worker"), Some(2));
        assert_eq!(mixed.exit_code_of("db"), None);
    }

    #[tokio::test]
    async fn test_exit_code_from_service() {
        let f = fixture();
        let p = project(
            f.temp.path(),
            r#"
name: proj
services:
  tests:
    image: alpine
    command: ["sh", "-c", "exit 5"]
  app:
    image: nginx
"#,
        );
        let options = UpOptions {
            exit_code_from: Some("tests".to_string()),
            ..UpOptions::default()
        };
        let code = f.engine.up(&p, &[], &options).await.unwrap();
        assert_eq!(code, 5);
        assert_eq!(
            service_containers(&f.runtime, "app").await[0].status,
            ContainerStatus::Exited
        );

        let missing = UpOptions {
            exit_code_from: Some("nope".to_string()),
            ..UpOptions::default()
        };
        assert!(f.engine.up(&p, &[], &missing).await.is_err());
    }
}
