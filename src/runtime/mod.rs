//! Runtime client interface
//!
//! The Compose engine never talks to a container daemon directly. Everything
//! goes through [`RuntimeClient`], which hides the transport. `LocalRuntime`
//! is the in-process implementation used by the CLI and the test suite.

pub mod local;
pub mod types;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

pub use local::LocalRuntime;
pub use types::{
    BuildRequest, ContainerCreate, ContainerEvent, ContainerFilter, ContainerInfo,
    ContainerStatus, EventAction, ExecRequest, ExecResult, HealthStatus, Healthcheck, ImageInfo,
    IpamPool, LogLine, LogOptions, LogStream, Mount, MountKind, NetworkAttachment, NetworkCreate,
    NetworkInfo, PortBinding, ProcessTable, Protocol, VerifyRequest, VolumeCreate, VolumeInfo,
};

/// Operations the Compose engine needs from a container runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// List containers matching a label filter; stopped ones only with `all`
    async fn list_containers(&self, filter: &ContainerFilter, all: bool)
        -> Result<Vec<ContainerInfo>>;

    /// Inspect a container by ID or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Create a container, returning its ID
    async fn create_container(&self, spec: &ContainerCreate) -> Result<String>;

    /// Start a created or exited container
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop gracefully, force-killing after `timeout`
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Send a signal to the container's main process
    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;

    /// Freeze all processes of a container
    async fn pause_container(&self, id: &str) -> Result<()>;

    /// Thaw a frozen container
    async fn unpause_container(&self, id: &str) -> Result<()>;

    /// Remove a container, optionally with its anonymous volumes
    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()>;

    /// Wait for a container to exit and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i32>;

    /// Run a command inside a running container
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecResult>;

    /// Process table of a running container
    async fn top(&self, id: &str) -> Result<ProcessTable>;

    /// Stream the logs of a container
    async fn container_logs(&self, id: &str, options: &LogOptions)
        -> Result<mpsc::Receiver<LogLine>>;

    /// Copy a host path into a container
    async fn copy_to_container(&self, id: &str, src: &Path, dest: &str) -> Result<()>;

    /// Copy a container path to the host
    async fn copy_from_container(&self, id: &str, src: &str, dest: &Path) -> Result<()>;

    /// Subscribe to container lifecycle events
    fn subscribe_events(&self) -> broadcast::Receiver<ContainerEvent>;

    /// List networks
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    /// Inspect a network by name, `None` if absent
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>>;

    /// Create a network, returning its ID
    async fn create_network(&self, request: &NetworkCreate) -> Result<String>;

    /// Remove a network
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// List volumes
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Inspect a volume by name, `None` if absent
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>>;

    /// Create a volume
    async fn create_volume(&self, request: &VolumeCreate) -> Result<VolumeInfo>;

    /// Remove a volume
    async fn remove_volume(&self, name: &str, force: bool) -> Result<()>;

    /// Look up a local image, `None` if absent
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Pull an image from its registry
    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<ImageInfo>;

    /// Push a local image to its registry
    async fn push_image(&self, reference: &str) -> Result<()>;

    /// Build an image through the build service
    async fn build_image(&self, request: &BuildRequest) -> Result<ImageInfo>;

    /// Verify the signature of an image
    async fn verify_image(&self, reference: &str, request: &VerifyRequest) -> Result<()>;

    /// Whether pause/unpause is supported (cgroup freezer available)
    fn supports_pause(&self) -> bool;
}

/// Normalize an image reference to `name:tag` form
pub fn normalize_reference(reference: &str) -> String {
    if reference.contains('@') {
        return reference.to_string();
    }

    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reference() {
        assert_eq!(normalize_reference("alpine"), "alpine:latest");
        assert_eq!(normalize_reference("alpine:3.13"), "alpine:3.13");
        assert_eq!(
            normalize_reference("localhost:5000/app"),
            "localhost:5000/app:latest"
        );
        assert_eq!(
            normalize_reference("ghcr.io/example/nginx@sha256:abc"),
            "ghcr.io/example/nginx@sha256:abc"
        );
    }
}
