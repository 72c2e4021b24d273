//! Resource reconciliation
//!
//! Makes sure the networks, volumes and images a set of services needs
//! exist before any container is created. Create-or-reuse decisions for a
//! qualified name, and pulls or builds of one image, are serialized through
//! an in-process advisory lock.

use super::labels;
use super::options::{BuildOptions, BuildPolicy};
use super::project::{NetworkSpec, Project, PullPolicy, ServiceSpec, VolumeSpec};
use super::service;
use crate::error::{CtlError, Result};
use crate::runtime::{BuildRequest, ImageInfo, MountKind, NetworkCreate, RuntimeClient, VolumeCreate};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Ensures project resources exist
pub struct Reconciler {
    runtime: Arc<dyn RuntimeClient>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| CtlError::Lock("resource lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Ensure every network and volume referenced by `services`
    pub async fn ensure_resources(&self, project: &Project, services: &[String]) -> Result<()> {
        let mut networks = BTreeSet::new();
        let mut volumes = BTreeSet::new();
        for name in services {
            let spec = project.any_service(name)?;
            if spec.network_mode.is_none() {
                networks.extend(spec.networks.keys().cloned());
            }
            volumes.extend(
                spec.mounts
                    .iter()
                    .filter(|m| m.kind == MountKind::Volume)
                    .filter_map(|m| m.source.clone()),
            );
        }

        let mut errors = Vec::new();
        for declared in &networks {
            let Some(spec) = project.networks.get(declared) else {
                errors.push(CtlError::ConfigInvalid(format!("undefined network {}", declared)));
                continue;
            };
            if let Err(e) = self.ensure_network(&project.name, spec).await {
                errors.push(e);
            }
        }
        for declared in &volumes {
            let Some(spec) = project.volumes.get(declared) else {
                errors.push(CtlError::ConfigInvalid(format!("undefined volume {}", declared)));
                continue;
            };
            if let Err(e) = self.ensure_volume(&project.name, spec).await {
                errors.push(e);
            }
        }
        CtlError::aggregate(errors)
    }

    /// Verify an external network or create-or-reuse a project network
    pub async fn ensure_network(&self, project: &str, spec: &NetworkSpec) -> Result<()> {
        if spec.external {
            return match self.runtime.inspect_network(&spec.name).await? {
                Some(_) => Ok(()),
                None => Err(CtlError::ExternalResourceMissing {
                    kind: "network",
                    name: spec.name.clone(),
                }),
            };
        }

        let _guard = self.lock(&format!("network:{}", spec.name)).await?;
        match self.runtime.inspect_network(&spec.name).await? {
            Some(existing) => {
                if existing.driver != spec.driver {
                    return Err(CtlError::ResourceConflict(format!(
                        "network {} exists with driver {:?}, declared {:?}",
                        spec.name, existing.driver, spec.driver
                    )));
                }
                if !spec.ipam.is_empty() && existing.ipam != spec.ipam {
                    return Err(CtlError::ResourceConflict(format!(
                        "network {} exists with a different IPAM configuration",
                        spec.name
                    )));
                }
                if existing.labels.get(labels::PROJECT).map(|p| p.as_str()) != Some(project) {
                    tracing::warn!(
                        "network {} was not created by project {}, reusing it",
                        spec.name,
                        project
                    );
                }
                Ok(())
            }
            None => {
                tracing::info!("Network {} Creating", spec.name);
                self.runtime
                    .create_network(&NetworkCreate {
                        name: spec.name.clone(),
                        driver: spec.driver.clone(),
                        options: spec.driver_opts.clone(),
                        ipam: spec.ipam.clone(),
                        enable_ipv6: spec.enable_ipv6,
                        internal: spec.internal,
                        labels: labels::resource_labels(
                            project,
                            labels::NETWORK,
                            &spec.declared,
                            &spec.labels,
                        ),
                    })
                    .await?;
                tracing::info!("Network {} Created", spec.name);
                Ok(())
            }
        }
    }

    /// Verify an external volume or create-or-reuse a project volume
    pub async fn ensure_volume(&self, project: &str, spec: &VolumeSpec) -> Result<()> {
        if spec.external {
            return match self.runtime.inspect_volume(&spec.name).await? {
                Some(_) => Ok(()),
                None => Err(CtlError::ExternalResourceMissing {
                    kind: "volume",
                    name: spec.name.clone(),
                }),
            };
        }

        let _guard = self.lock(&format!("volume:{}", spec.name)).await?;
        match self.runtime.inspect_volume(&spec.name).await? {
            Some(existing) => {
                if existing.driver != spec.driver {
                    return Err(CtlError::ResourceConflict(format!(
                        "volume {} exists with driver {:?}, declared {:?}",
                        spec.name, existing.driver, spec.driver
                    )));
                }
                Ok(())
            }
            None => {
                tracing::info!("Volume {} Creating", spec.name);
                self.runtime
                    .create_volume(&VolumeCreate {
                        name: spec.name.clone(),
                        driver: spec.driver.clone(),
                        driver_opts: spec.driver_opts.clone(),
                        labels: labels::resource_labels(
                            project,
                            labels::VOLUME,
                            &spec.declared,
                            &spec.labels,
                        ),
                    })
                    .await?;
                tracing::info!("Volume {} Created", spec.name);
                Ok(())
            }
        }
    }

    /// Make the image of a service available, honoring pull and build policy
    pub async fn ensure_image(
        &self,
        project: &Project,
        spec: &ServiceSpec,
        build: BuildPolicy,
        pull: Option<PullPolicy>,
    ) -> Result<()> {
        let image = service::image_name(project, spec);
        let policy = spec.pull_policy.or(pull).unwrap_or(PullPolicy::Missing);
        // Replicas and services sharing an image fetch it once
        let _guard = self.lock(&image_lock(&image)).await?;
        let present = self.runtime.inspect_image(&image).await?.is_some();

        if spec.build.is_some() {
            let must_build = match build {
                BuildPolicy::Always => true,
                BuildPolicy::Never => {
                    if !present {
                        return Err(CtlError::ImageMissing(format!(
                            "{} must be built but --no-build was given",
                            image
                        )));
                    }
                    false
                }
                BuildPolicy::Missing => policy == PullPolicy::Build || !present,
            };
            if must_build {
                self.build_service(project, spec, &BuildOptions::default()).await?;
            } else if policy == PullPolicy::Always && spec.image.is_some() {
                self.pull(&image, spec).await?;
            }
        } else {
            match policy {
                PullPolicy::Always => {
                    self.pull(&image, spec).await?;
                }
                PullPolicy::Missing if !present => {
                    self.pull(&image, spec).await?;
                }
                PullPolicy::Missing => {}
                PullPolicy::Never if !present => {
                    return Err(CtlError::ImageMissing(format!(
                        "{} is not present locally and pull_policy is never",
                        image
                    )));
                }
                PullPolicy::Never => {}
                PullPolicy::Build => {
                    return Err(CtlError::ImageMissing(format!(
                        "{} has pull_policy build but no build section",
                        image
                    )));
                }
            }
        }

        if let Some(request) = spec.verification() {
            tracing::debug!("verifying {} with {}", image, request.provider);
            self.runtime.verify_image(&image, &request).await?;
        }
        Ok(())
    }

    /// Pull the image of a service
    pub async fn pull(&self, image: &str, spec: &ServiceSpec) -> Result<ImageInfo> {
        tracing::info!("Image {} Pulling", image);
        let info = self.runtime.pull_image(image, spec.platform.as_deref()).await?;
        tracing::info!("Image {} Pulled", image);
        Ok(info)
    }

    /// Build the image of a service through the build service
    pub async fn build_service(
        &self,
        project: &Project,
        spec: &ServiceSpec,
        options: &BuildOptions,
    ) -> Result<ImageInfo> {
        let build = spec.build.as_ref().ok_or_else(|| {
            CtlError::ConfigInvalid(format!("service {} has no build section", spec.name))
        })?;

        let image = service::image_name(project, spec);
        let mut tags = vec![image.clone()];
        tags.extend(build.tags.iter().filter(|t| **t != image).cloned());

        let mut args = build.args.clone();
        args.extend(options.args.clone());

        let mut build_labels = build.labels.clone();
        build_labels.insert(labels::PROJECT.to_string(), project.name.clone());
        build_labels.insert(labels::SERVICE.to_string(), spec.name.clone());

        tracing::info!("Image {} Building", image);
        let info = self
            .runtime
            .build_image(&BuildRequest {
                context: build.context.clone(),
                dockerfile: build.dockerfile.clone(),
                args,
                target: build.target.clone(),
                cache_from: build.cache_from.clone(),
                tags,
                labels: build_labels,
                platform: spec.platform.clone(),
                no_cache: build.no_cache || options.no_cache,
            })
            .await?;
        tracing::info!("Image {} Built", image);
        Ok(info)
    }
}

fn image_lock(image: &str) -> String {
    format!("image:{}", image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::loader::{load, ProjectOptions};
    use crate::runtime::LocalRuntime;
    use tempfile::tempdir;

    fn project(dir: &std::path::Path, yaml: &str) -> Project {
        std::fs::write(dir.join("compose.yaml"), yaml).unwrap();
        load(&ProjectOptions {
            working_dir: dir.to_path_buf(),
            ..ProjectOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_resources() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(temp.path().join("state")).unwrap());
        let project = project(
            temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    volumes: [\"data:/data\"]\nvolumes:\n  data: {}\n",
        );

        let reconciler = Reconciler::new(runtime.clone());
        let names = project.service_names();
        reconciler.ensure_resources(&project, &names).await.unwrap();
        // A second pass reuses what exists
        reconciler.ensure_resources(&project, &names).await.unwrap();

        let network = runtime.inspect_network("proj_default").await.unwrap().unwrap();
        assert_eq!(network.labels[labels::PROJECT], "proj");
        assert!(runtime.inspect_volume("proj_data").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_external_and_conflicting_resources() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(temp.path().join("state")).unwrap());
        let project = project(
            temp.path(),
            "name: proj\nservices:\n  web:\n    image: nginx\n    networks: [shared]\nnetworks:\n  shared:\n    external: true\n",
        );
        let reconciler = Reconciler::new(runtime.clone());

        let err = reconciler
            .ensure_resources(&project, &project.service_names())
            .await
            .unwrap_err();
        assert!(matches!(err, CtlError::ExternalResourceMissing { kind: "network", .. }));

        runtime
            .create_network(&NetworkCreate {
                name: "shared".to_string(),
                driver: "bridge".to_string(),
                ..NetworkCreate::default()
            })
            .await
            .unwrap();
        reconciler
            .ensure_resources(&project, &project.service_names())
            .await
            .unwrap();

        runtime
            .create_volume(&VolumeCreate {
                name: "proj_cache".to_string(),
                driver: "nfs".to_string(),
                ..VolumeCreate::default()
            })
            .await
            .unwrap();
        let spec = VolumeSpec {
            declared: "cache".to_string(),
            name: "proj_cache".to_string(),
            driver: "local".to_string(),
            ..VolumeSpec::default()
        };
        assert!(matches!(
            reconciler.ensure_volume("proj", &spec).await,
            Err(CtlError::ResourceConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_image_policies() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(temp.path().join("state")).unwrap());
        std::fs::create_dir(temp.path().join("app")).unwrap();
        std::fs::write(temp.path().join("app/Dockerfile"), "FROM alpine\n").unwrap();
        let project = project(
            temp.path(),
            r#"
name: proj
services:
  pulled:
    image: alpine:3.13
  pinned:
    image: busybox
    pull_policy: never
  built:
    build: ./app
"#,
        );
        let reconciler = Reconciler::new(runtime.clone());

        reconciler
            .ensure_image(&project, project.service("pulled").unwrap(), BuildPolicy::Missing, None)
            .await
            .unwrap();
        assert!(runtime.inspect_image("alpine:3.13").await.unwrap().is_some());

        let err = reconciler
            .ensure_image(&project, project.service("pinned").unwrap(), BuildPolicy::Missing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CtlError::ImageMissing(_)));

        let built = project.service("built").unwrap();
        assert!(matches!(
            reconciler.ensure_image(&project, built, BuildPolicy::Never, None).await,
            Err(CtlError::ImageMissing(_))
        ));
        reconciler
            .ensure_image(&project, built, BuildPolicy::Missing, None)
            .await
            .unwrap();
        assert!(runtime.inspect_image("proj-built").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_image_fetch_is_serialized() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(LocalRuntime::new(temp.path().join("state")).unwrap());
        let project = project(
            temp.path(),
            "name: proj\nservices:\n  a:\n    image: redis:7\n  b:\n    image: redis:7\n",
        );
        let reconciler = Arc::new(Reconciler::new(runtime.clone()));

        let held = reconciler.lock(&image_lock("redis:7")).await.unwrap();
        let mut tasks = tokio::task::JoinSet::new();
        for name in ["a", "b"] {
            let reconciler = Arc::clone(&reconciler);
            let project = project.clone();
            tasks.spawn(async move {
                let spec = project.service(name)?.clone();
                reconciler
                    .ensure_image(&project, &spec, BuildPolicy::Missing, None)
                    .await
            });
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(runtime.inspect_image("redis:7").await.unwrap().is_none());

        drop(held);
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        let image = runtime.inspect_image("redis:7").await.unwrap().unwrap();
        assert_eq!(image.reference, "redis:7");
    }
}
