//! End-to-end compose scenarios against the in-process runtime

use runectl::compose::labels;
use runectl::compose::options::{
    ConfigOptions, CreateOptions, DownOptions, PortOptions, UpOptions,
};
use runectl::compose::service::service_hashes;
use runectl::compose::{load, ComposeEngine, Project, ProjectOptions};
use runectl::config::Settings;
use runectl::runtime::{
    ContainerFilter, ContainerInfo, ContainerStatus, LocalRuntime, Protocol, RuntimeClient,
};
use runectl::CtlError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

struct Harness {
    temp: TempDir,
    runtime: Arc<LocalRuntime>,
    engine: ComposeEngine,
    output: Captured,
}

impl Harness {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let settings = Settings::with_root(&temp.path().join("data"));
        let runtime = Arc::new(LocalRuntime::new(settings.runtime_dir()).unwrap());
        let output = Captured::default();
        let sink: Box<dyn Write + Send> = Box::new(output.clone());
        let engine = ComposeEngine::with_output(
            runtime.clone(),
            settings,
            Arc::new(Mutex::new(sink)),
            false,
        );
        Self {
            temp,
            runtime,
            engine,
            output,
        }
    }

    /// Project directory named `proj` holding `compose.yaml`
    fn write_project(&self, yaml: &str) -> PathBuf {
        let dir = self.temp.path().join("proj");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("compose.yaml"), yaml).unwrap();
        dir
    }

    fn load(&self, dir: &Path) -> Project {
        load(&ProjectOptions {
            working_dir: dir.to_path_buf(),
            ..ProjectOptions::default()
        })
        .unwrap()
    }

    async fn containers(&self) -> Vec<ContainerInfo> {
        let mut containers = self
            .runtime
            .list_containers(&labels::project_filter("proj"), true)
            .await
            .unwrap();
        containers.sort_by(|a, b| a.name().cmp(b.name()));
        containers
    }

    async fn service(&self, service: &str) -> Vec<ContainerInfo> {
        self.containers()
            .await
            .into_iter()
            .filter(|c| labels::service_of(c) == Some(service))
            .collect()
    }
}

fn detached() -> UpOptions {
    UpOptions {
        detach: true,
        ..UpOptions::default()
    }
}

fn scaled(service: &str, replicas: u32) -> UpOptions {
    let mut options = detached();
    options.create = CreateOptions {
        scale: [(service.to_string(), replicas)].into_iter().collect(),
        ..CreateOptions::default()
    };
    options
}

#[tokio::test]
async fn test_dependency_order_and_down() {
    let h = Harness::new();
    let dir = h.write_project(
        r#"
services:
  svc0:
    image: alpine:3.13
  svc1:
    image: alpine:3.13
    depends_on: [svc0]
"#,
    );
    let project = h.load(&dir);
    assert_eq!(project.name, "proj");

    assert_eq!(h.engine.up(&project, &[], &detached()).await.unwrap(), 0);
    let svc0 = &h.service("svc0").await[0];
    let svc1 = &h.service("svc1").await[0];
    assert_eq!(svc0.status, ContainerStatus::Running);
    assert_eq!(svc1.status, ContainerStatus::Running);
    assert!(svc1.created_at >= svc0.started_at.unwrap());

    // Every container carries the hash of the loaded project
    let hashes = service_hashes(&project).unwrap();
    for container in h.containers().await {
        let service = labels::service_of(&container).unwrap();
        assert_eq!(labels::config_hash_of(&container), Some(hashes[service].as_str()));
    }

    h.engine.down(&project, &DownOptions::default()).await.unwrap();
    assert!(h.containers().await.is_empty());
    let networks = h.runtime.list_networks().await.unwrap();
    assert!(networks.iter().all(|n| n.name != "proj_default"));
}

#[tokio::test]
async fn test_scale_up_keeps_existing_replicas() {
    let h = Harness::new();
    let dir = h.write_project(
        r#"
services:
  svc0:
    image: alpine:3.13
    deploy:
      replicas: 3
"#,
    );
    let project = h.load(&dir);

    h.engine.up(&project, &[], &scaled("svc0", 2)).await.unwrap();
    let first = h.service("svc0").await;
    let names: Vec<&str> = first.iter().map(|c| c.name()).collect();
    assert_eq!(names, ["proj-svc0-1", "proj-svc0-2"]);

    h.engine.up(&project, &[], &scaled("svc0", 3)).await.unwrap();
    let second = h.service("svc0").await;
    let names: Vec<&str> = second.iter().map(|c| c.name()).collect();
    assert_eq!(names, ["proj-svc0-1", "proj-svc0-2", "proj-svc0-3"]);
    for (before, after) in first.iter().zip(&second) {
        assert_eq!(before.id, after.id);
        assert_eq!(labels::config_hash_of(before), labels::config_hash_of(after));
    }

    // Exactly one container per replica index
    for index in 1..=3 {
        let filter = ContainerFilter::new()
            .label(labels::PROJECT, "proj")
            .label(labels::SERVICE, "svc0")
            .label(labels::CONTAINER_NUMBER, &index.to_string());
        assert_eq!(h.runtime.list_containers(&filter, true).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_dependency_is_not_recreated() {
    let h = Harness::new();
    let dir = h.write_project(
        r#"
services:
  foo:
    image: nginx
  bar:
    image: nginx
    depends_on: [foo]
"#,
    );
    let project = h.load(&dir);

    h.engine
        .up(&project, &["foo".to_string()], &detached())
        .await
        .unwrap();
    let foo = h.service("foo").await[0].id.clone();
    assert!(h.service("bar").await.is_empty());

    h.engine
        .up(&project, &["bar".to_string()], &detached())
        .await
        .unwrap();
    assert_eq!(h.service("foo").await[0].id, foo);
    assert_eq!(h.service("bar").await.len(), 1);
}

#[tokio::test]
async fn test_env_file_substitution() {
    let h = Harness::new();
    let dir = h.write_project(
        "services:\n  web:\n    image: ghcr.io/example/nginx:$TAG\n",
    );
    std::fs::write(dir.join(".env"), "TAG=1.19-alpine\n").unwrap();
    std::fs::write(dir.join("envFile"), "TAG=1.21\n").unwrap();

    let project = h.load(&dir);
    h.engine.up(&project, &[], &detached()).await.unwrap();
    assert_eq!(
        h.service("web").await[0].spec.image,
        "ghcr.io/example/nginx:1.19-alpine"
    );

    // --env-file resolves against the process working directory
    let cwd = h.temp.path().join("elsewhere");
    std::fs::create_dir_all(&cwd).unwrap();
    let err = load(&ProjectOptions {
        files: vec![dir.join("compose.yaml")],
        env_files: vec![PathBuf::from("envFile")],
        working_dir: cwd,
        ..ProjectOptions::default()
    })
    .unwrap_err();
    assert!(matches!(err, CtlError::ConfigInvalid(_)));
}

#[tokio::test]
async fn test_abort_on_container_exit() {
    let h = Harness::new();
    let dir = h.write_project(
        r#"
services:
  service_exit:
    image: alpine
    command: sh -c "exit 1"
  service_regular:
    image: alpine
    command: sleep infinity
"#,
    );
    let project = h.load(&dir);

    let options = UpOptions {
        abort_on_container_exit: true,
        ..UpOptions::default()
    };
    let code = h.engine.up(&project, &[], &options).await.unwrap();
    assert_eq!(code, 1);
    for container in h.containers().await {
        assert_eq!(container.status, ContainerStatus::Exited, "{}", container.name());
    }
    let output = h.output.text();
    assert!(output.contains("Attaching to"));
    assert!(output.contains("proj-service_exit-1"));
    assert!(output.contains("exited with code 1"));
}

#[tokio::test]
async fn test_abort_flag_conflicts_with_detach() {
    let h = Harness::new();
    let dir = h.write_project("services:\n  web:\n    image: nginx\n");
    let project = h.load(&dir);

    let options = UpOptions {
        detach: true,
        abort_on_container_exit: true,
        ..UpOptions::default()
    };
    let err = h.engine.up(&project, &[], &options).await.unwrap_err();
    assert!(matches!(err, CtlError::FlagConflict(_)));
    assert_eq!(err.exit_code(), 125);
}

const WITH_VOLUMES: &str = r#"
services:
  db:
    image: postgres
    volumes:
      - data:/var/lib/postgresql/data
      - /cache
volumes:
  data: {}
"#;

#[tokio::test]
async fn test_down_keeps_named_volumes() {
    let h = Harness::new();
    let project = h.load(&h.write_project(WITH_VOLUMES));
    h.engine.up(&project, &[], &detached()).await.unwrap();

    h.engine.down(&project, &DownOptions::default()).await.unwrap();
    assert!(h.containers().await.is_empty());
    let volumes = h.runtime.list_volumes().await.unwrap();
    assert!(volumes.iter().any(|v| v.name == "proj_data"));
    let networks = h.runtime.list_networks().await.unwrap();
    assert!(networks
        .iter()
        .all(|n| n.labels.get(labels::PROJECT).map(String::as_str) != Some("proj")));

    // down is idempotent
    h.engine.down(&project, &DownOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_down_volumes_removes_everything() {
    let h = Harness::new();
    let project = h.load(&h.write_project(WITH_VOLUMES));
    h.engine.up(&project, &[], &detached()).await.unwrap();
    let anonymous = h.service("db").await[0].anonymous_volumes["/cache"].clone();

    let options = DownOptions {
        volumes: true,
        ..DownOptions::default()
    };
    h.engine.down(&project, &options).await.unwrap();
    let volumes = h.runtime.list_volumes().await.unwrap();
    assert!(volumes.iter().all(|v| v.name != "proj_data"));
    assert!(volumes.iter().all(|v| v.name != anonymous));
}

#[tokio::test]
async fn test_config_round_trip_keeps_hashes() {
    let h = Harness::new();
    let dir = h.write_project(
        r#"
services:
  web:
    image: nginx:${VERSION:-1.25}
    env_file: [web.env]
    environment:
      GREETING: "cost: $$5"
    volumes:
      - ./html:/usr/share/nginx/html:ro
    ports:
      - "8080:80"
"#,
    );
    std::fs::write(dir.join("web.env"), "MODE=prod\n").unwrap();
    let project = h.load(&dir);

    let rendered = h
        .engine
        .config(&project, &ConfigOptions::default())
        .unwrap();
    let copy = dir.join("rendered.yaml");
    std::fs::write(&copy, &rendered).unwrap();

    let reloaded = load(&ProjectOptions {
        files: vec![copy],
        working_dir: dir.clone(),
        ..ProjectOptions::default()
    })
    .unwrap();
    assert_eq!(
        service_hashes(&reloaded).unwrap(),
        service_hashes(&project).unwrap()
    );
}

#[tokio::test]
async fn test_port_reports_advertised_binding() {
    let h = Harness::new();
    let project = h.load(&h.write_project(
        "services:\n  web:\n    image: nginx\n    ports: [\"9000:90/tcp\", \"9053:53/udp\"]\n",
    ));
    h.engine.up(&project, &[], &detached()).await.unwrap();

    let port = |private_port, protocol| PortOptions {
        service: "web".to_string(),
        private_port,
        protocol,
        index: 1,
    };
    assert_eq!(
        h.engine.port(&project, &port(90, Protocol::Tcp)).await.unwrap(),
        "0.0.0.0:9000\n"
    );
    assert_eq!(
        h.engine.port(&project, &port(53, Protocol::Udp)).await.unwrap(),
        "0.0.0.0:9053\n"
    );
    assert!(h.engine.port(&project, &port(53, Protocol::Tcp)).await.is_err());
}
