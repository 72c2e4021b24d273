//! Query output
//!
//! Rendering of `ps`, `images`, `top` and `config`. The engine gathers the
//! data from the runtime; everything here is pure formatting.

use super::labels;
use super::options::{ConfigFormat, ConfigOptions, Format, PsOptions};
use super::project::Project;
use super::service;
use crate::error::{CtlError, Result};
use crate::runtime::{ContainerInfo, ContainerStatus, ProcessTable};
use serde::Serialize;
use std::collections::BTreeSet;

/// Width of the `ps` command column
const COMMAND_WIDTH: usize = 20;

/// Render rows as left-aligned columns separated by three spaces
pub fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let mut out = render_row(&widths, headers);
    out.push('\n');
    for row in rows {
        let cells: Vec<&str> = row.iter().map(|s| s.as_str()).collect();
        out.push_str(&render_row(&widths, &cells));
        out.push('\n');
    }
    out
}

fn render_row(widths: &[usize], cells: &[&str]) -> String {
    let last = cells.len().saturating_sub(1);
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        line.push_str(cell);
        if i != last {
            let width = widths.get(i).copied().unwrap_or(0);
            let pad = width.saturating_sub(cell.chars().count());
            line.push_str(&" ".repeat(pad + 3));
        }
    }
    line.trim_end().to_string()
}

/// Published port of a `ps` entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Publisher {
    #[serde(rename = "URL")]
    pub url: String,
    pub target_port: u16,
    pub published_port: u16,
    pub protocol: String,
}

/// One container as listed by `ps`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PsEntry {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub command: String,
    pub project: String,
    pub service: String,
    pub state: String,
    pub health: String,
    pub exit_code: i32,
    pub status: String,
    pub publishers: Vec<Publisher>,
}

impl PsEntry {
    pub fn from_container(container: &ContainerInfo) -> Self {
        let publishers = container
            .ports
            .iter()
            .map(|p| Publisher {
                url: p
                    .host_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                target_port: p.container_port,
                published_port: p.host_port.unwrap_or(0),
                protocol: p.protocol.to_string(),
            })
            .collect();

        Self {
            id: container.id.clone(),
            name: container.name().to_string(),
            command: container.command_line(),
            project: container.label(labels::PROJECT).unwrap_or_default().to_string(),
            service: labels::service_of(container).unwrap_or_default().to_string(),
            state: container.status.to_string(),
            health: container.health.map(|h| h.to_string()).unwrap_or_default(),
            exit_code: container.exit_code.unwrap_or(0),
            status: status_text(container),
            publishers,
        }
    }
}

fn status_text(container: &ContainerInfo) -> String {
    match (container.status, container.health) {
        (ContainerStatus::Exited, _) => {
            format!("exited ({})", container.exit_code.unwrap_or(0))
        }
        (status, Some(health)) if status.is_active() => format!("{} ({})", status, health),
        (status, _) => status.to_string(),
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut short: String = text.chars().take(width - 1).collect();
    short.push('…');
    short
}

/// Render `ps` output
pub fn ps(containers: &[ContainerInfo], options: &PsOptions) -> Result<String> {
    if options.services {
        let services: BTreeSet<&str> = containers.iter().filter_map(labels::service_of).collect();
        return Ok(services.into_iter().map(|s| format!("{}\n", s)).collect());
    }
    if options.quiet {
        return Ok(containers.iter().map(|c| format!("{}\n", c.id)).collect());
    }

    match options.format {
        Format::Json => {
            let entries: Vec<PsEntry> = containers.iter().map(PsEntry::from_container).collect();
            Ok(format!("{}\n", serde_json::to_string(&entries)?))
        }
        Format::Table => {
            let rows: Vec<Vec<String>> = containers
                .iter()
                .map(|c| {
                    vec![
                        c.name().to_string(),
                        format!("\"{}\"", truncate(&c.command_line(), COMMAND_WIDTH)),
                        labels::service_of(c).unwrap_or_default().to_string(),
                        status_text(c),
                        c.ports
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ]
                })
                .collect();
            Ok(table(&["NAME", "COMMAND", "SERVICE", "STATUS", "PORTS"], &rows))
        }
    }
}

/// Image used by one container of the project
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageEntry {
    pub container_name: String,
    pub service: String,
    pub repository: String,
    pub tag: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub size: u64,
}

impl ImageEntry {
    /// Split `reference` into repository and tag
    pub fn new(container: &ContainerInfo, reference: &str, id: &str, size: u64) -> Self {
        let (repository, tag) = split_reference(reference);
        Self {
            container_name: container.name().to_string(),
            service: labels::service_of(container).unwrap_or_default().to_string(),
            repository,
            tag,
            id: id.to_string(),
            size,
        }
    }
}

fn split_reference(reference: &str) -> (String, String) {
    if let Some((repo, digest)) = reference.split_once('@') {
        return (repo.to_string(), digest.to_string());
    }
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[slash..].rfind(':') {
        Some(colon) => (
            reference[..slash + colon].to_string(),
            reference[slash + colon + 1..].to_string(),
        ),
        None => (reference.to_string(), "latest".to_string()),
    }
}

/// `1.5kB`, `23.1MB`, in decimal units
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// Render `images` output
pub fn images(entries: &[ImageEntry], quiet: bool, format: Format) -> Result<String> {
    if quiet {
        let ids: BTreeSet<&str> = entries
            .iter()
            .map(|e| e.id.as_str())
            .filter(|id| !id.is_empty())
            .collect();
        return Ok(ids.into_iter().map(|id| format!("{}\n", id)).collect());
    }
    match format {
        Format::Json => Ok(format!("{}\n", serde_json::to_string(entries)?)),
        Format::Table => {
            let rows: Vec<Vec<String>> = entries
                .iter()
                .map(|e| {
                    vec![
                        e.container_name.clone(),
                        e.repository.clone(),
                        e.tag.clone(),
                        short_id(&e.id),
                        human_size(e.size),
                    ]
                })
                .collect();
            Ok(table(
                &["CONTAINER", "REPOSITORY", "TAG", "IMAGE ID", "SIZE"],
                &rows,
            ))
        }
    }
}

fn short_id(id: &str) -> String {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.chars().take(12).collect()
}

/// Render the process table of one container under a title line
pub fn top(title: &str, processes: &ProcessTable) -> String {
    let titles: Vec<&str> = processes.titles.iter().map(|s| s.as_str()).collect();
    format!("{}\n{}", title, table(&titles, &processes.processes))
}

/// Render `config` output
pub fn config(project: &Project, options: &ConfigOptions) -> Result<String> {
    if options.services {
        return Ok(project.services.keys().map(|s| format!("{}\n", s)).collect());
    }
    if options.volumes {
        return Ok(project.volumes.keys().map(|v| format!("{}\n", v)).collect());
    }
    if let Some(hash) = &options.hash {
        let hashes = service::service_hashes(project)?;
        if hash == "*" {
            return Ok(hashes
                .iter()
                .map(|(name, h)| format!("{} {}\n", name, h))
                .collect());
        }
        let mut out = String::new();
        for name in hash.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let h = hashes.get(name).ok_or_else(|| {
                CtlError::ConfigInvalid(format!("no such service: {}", name))
            })?;
            out.push_str(&format!("{} {}\n", name, h));
        }
        return Ok(out);
    }

    let mut value = serde_yaml::to_value(&project.model)?;
    escape_dollars(&mut value);
    match options.format {
        ConfigFormat::Yaml => Ok(serde_yaml::to_string(&value)?),
        ConfigFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(&value)?)),
    }
}

/// Escape `$` so the rendered model substitutes back to itself
fn escape_dollars(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) if s.contains('$') => *s = s.replace('$', "$$"),
        serde_yaml::Value::Sequence(seq) => seq.iter_mut().for_each(escape_dollars),
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                escape_dollars(v);
            }
        }
        serde_yaml::Value::Tagged(tagged) => escape_dollars(&mut tagged.value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::loader::{load, ProjectOptions};
    use crate::runtime::{ContainerCreate, PortBinding, Protocol};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn container(name: &str, service: &str, status: ContainerStatus) -> ContainerInfo {
        let mut container_labels = BTreeMap::new();
        container_labels.insert(labels::PROJECT.to_string(), "proj".to_string());
        container_labels.insert(labels::SERVICE.to_string(), service.to_string());
        ContainerInfo {
            id: format!("id-{}", name),
            spec: ContainerCreate {
                name: name.to_string(),
                image: "nginx".to_string(),
                cmd: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
                labels: container_labels,
                ..ContainerCreate::default()
            },
            status,
            exit_code: (status == ContainerStatus::Exited).then_some(1),
            health: None,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stop_timeout: None,
            ports: vec![PortBinding {
                host_ip: None,
                host_port: Some(8080),
                container_port: 80,
                protocol: Protocol::Tcp,
            }],
            anonymous_volumes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_ps_table() {
        let containers = vec![
            container("proj-web-1", "web", ContainerStatus::Running),
            container("proj-worker-1", "worker", ContainerStatus::Exited),
        ];
        let out = ps(&containers, &PsOptions::default()).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].contains("\"nginx -g daemon off;\""));
        assert!(lines[1].contains("0.0.0.0:8080->80/tcp"));
        assert!(lines[2].contains("exited (1)"));

        let services = ps(
            &containers,
            &PsOptions {
                services: true,
                ..PsOptions::default()
            },
        )
        .unwrap();
        assert_eq!(services, "web\nworker\n");
    }

    #[test]
    fn test_ps_json() {
        let containers = vec![container("proj-web-1", "web", ContainerStatus::Running)];
        let out = ps(
            &containers,
            &PsOptions {
                format: Format::Json,
                ..PsOptions::default()
            },
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["Service"], "web");
        assert_eq!(parsed[0]["Publishers"][0]["PublishedPort"], 8080);
    }

    #[test]
    fn test_truncate_and_sizes() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("abcdefghij", 5).chars().count(), 5);
        assert_eq!(human_size(999), "999B");
        assert_eq!(human_size(1_500_000), "1.5MB");
        assert_eq!(
            split_reference("localhost:5000/app:1.0"),
            ("localhost:5000/app".to_string(), "1.0".to_string())
        );
        assert_eq!(
            split_reference("alpine"),
            ("alpine".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_config_outputs() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "name: proj\nservices:\n  web:\n    image: nginx\n    command: echo $$HOME\n  db:\n    image: postgres\nvolumes:\n  data: {}\n",
        )
        .unwrap();
        let project = load(&ProjectOptions {
            working_dir: temp.path().to_path_buf(),
            ..ProjectOptions::default()
        })
        .unwrap();

        let services = config(
            &project,
            &ConfigOptions {
                services: true,
                ..ConfigOptions::default()
            },
        )
        .unwrap();
        assert_eq!(services, "web\ndb\n");

        let volumes = config(
            &project,
            &ConfigOptions {
                volumes: true,
                ..ConfigOptions::default()
            },
        )
        .unwrap();
        assert_eq!(volumes, "data\n");

        let all = config(
            &project,
            &ConfigOptions {
                hash: Some("*".to_string()),
                ..ConfigOptions::default()
            },
        )
        .unwrap();
        assert_eq!(all.lines().count(), 2);
        assert!(all.starts_with("web "));

        assert!(config(
            &project,
            &ConfigOptions {
                hash: Some("nope".to_string()),
                ..ConfigOptions::default()
            },
        )
        .is_err());

        let yaml = config(&project, &ConfigOptions::default()).unwrap();
        assert!(yaml.contains("$$HOME"));
    }
}
