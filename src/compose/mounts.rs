//! Service volume specs
//!
//! Short syntax is `[SRC:]DST[:MODE]`. A source starting with `/`, `.` or
//! `~` is a bind mount, anything else names a volume declared at the top
//! level. An entry without a source is an anonymous volume owned by the
//! container.

use super::model::{BindOptions, TmpfsOptions, VolumeMount, VolumeMountLong, VolumeOptions};
use crate::error::{CtlError, Result};
use crate::runtime::{Mount, MountKind};
use std::path::{Component, Path, PathBuf};

const PROPAGATION: &[&str] = &["shared", "rshared", "slave", "rslave", "private", "rprivate"];

/// Parse a service `volumes:` entry, resolving bind sources against `working_dir`
pub fn parse_volume(entry: &VolumeMount, working_dir: &Path) -> Result<Mount> {
    match entry {
        VolumeMount::Short(spec) => parse_short(spec, working_dir),
        VolumeMount::Long(long) => parse_long(long, working_dir),
    }
}

fn parse_short(spec: &str, working_dir: &Path) -> Result<Mount> {
    let invalid = |reason: &str| CtlError::ConfigInvalid(format!("invalid volume spec {:?}: {}", spec, reason));

    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [target] => (None, *target, None),
        [source, target] => (Some(*source), *target, None),
        [source, target, mode] => (Some(*source), *target, Some(*mode)),
        _ => return Err(invalid("too many colons")),
    };

    if target.is_empty() || !target.starts_with('/') {
        return Err(invalid("target must be an absolute path"));
    }

    let mut read_only = false;
    let mut propagation = None;
    let mut selinux = None;
    let mut nocopy = false;
    for flag in mode.unwrap_or_default().split(',').filter(|f| !f.is_empty()) {
        match flag {
            "ro" => read_only = true,
            "rw" => read_only = false,
            "z" | "Z" => selinux = Some(flag.to_string()),
            "nocopy" => nocopy = true,
            p if PROPAGATION.contains(&p) => propagation = Some(p.to_string()),
            other => return Err(invalid(&format!("unknown mode {:?}", other))),
        }
    }

    let (kind, source) = match source {
        None => (MountKind::Volume, None),
        Some(s) if is_host_path(s) => (MountKind::Bind, Some(resolve_host_path(s, working_dir))),
        Some(s) if s.is_empty() => return Err(invalid("empty source")),
        Some(s) => (MountKind::Volume, Some(s.to_string())),
    };

    Ok(Mount {
        kind,
        source,
        target: target.to_string(),
        read_only,
        options: mount_options(propagation, selinux, nocopy),
        size: None,
        mode: None,
    })
}

fn parse_long(long: &VolumeMountLong, working_dir: &Path) -> Result<Mount> {
    let invalid = |reason: &str| {
        CtlError::ConfigInvalid(format!("invalid volume {}: {}", long.target, reason))
    };

    if !long.target.starts_with('/') {
        return Err(invalid("target must be an absolute path"));
    }

    let (kind, source) = match long.mount_type.as_str() {
        "bind" => {
            let source = long
                .source
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid("bind mount requires a source"))?;
            (MountKind::Bind, Some(resolve_host_path(source, working_dir)))
        }
        "volume" => (
            MountKind::Volume,
            long.source.clone().filter(|s| !s.is_empty()),
        ),
        "tmpfs" => {
            if long.source.as_deref().is_some_and(|s| !s.is_empty()) {
                return Err(invalid("tmpfs mount must not have a source"));
            }
            (MountKind::Tmpfs, None)
        }
        other => return Err(invalid(&format!("unsupported mount type {:?}", other))),
    };

    let bind = long.bind.clone().unwrap_or_default();
    if let Some(p) = &bind.propagation {
        if !PROPAGATION.contains(&p.as_str()) {
            return Err(invalid(&format!("unknown propagation {:?}", p)));
        }
    }
    let nocopy = long.volume.as_ref().and_then(|v| v.nocopy).unwrap_or(false);
    let tmpfs = long.tmpfs.clone().unwrap_or_default();

    Ok(Mount {
        kind,
        source,
        target: long.target.clone(),
        read_only: long.read_only.unwrap_or(false),
        options: mount_options(bind.propagation, bind.selinux, nocopy),
        size: tmpfs.size,
        mode: tmpfs.mode,
    })
}

/// Parse a service `tmpfs:` entry (`/run[:size=64m,mode=1777]`)
pub fn parse_tmpfs(spec: &str) -> Result<Mount> {
    let invalid = |reason: &str| CtlError::ConfigInvalid(format!("invalid tmpfs {:?}: {}", spec, reason));

    let (target, opts) = match spec.split_once(':') {
        Some((target, opts)) => (target, opts),
        None => (spec, ""),
    };
    if !target.starts_with('/') {
        return Err(invalid("target must be an absolute path"));
    }

    let mut size = None;
    let mut mode = None;
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt.split_once('=') {
            Some(("size", v)) => size = Some(parse_size(v).ok_or_else(|| invalid("bad size"))?),
            Some(("mode", v)) => {
                mode = Some(u32::from_str_radix(v, 8).map_err(|_| invalid("bad mode"))?)
            }
            _ => return Err(invalid(&format!("unknown option {:?}", opt))),
        }
    }

    Ok(Mount {
        kind: MountKind::Tmpfs,
        source: None,
        target: target.to_string(),
        read_only: false,
        options: Vec::new(),
        size,
        mode,
    })
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value.as_str(), ""),
    };
    let n: u64 = digits.parse().ok()?;
    let factor = match unit.trim_end_matches('b') {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        _ => return None,
    };
    n.checked_mul(factor)
}

fn mount_options(propagation: Option<String>, selinux: Option<String>, nocopy: bool) -> Vec<String> {
    let mut options = Vec::new();
    options.extend(propagation);
    options.extend(selinux);
    if nocopy {
        options.push("nocopy".to_string());
    }
    options
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// Resolve a bind source to an absolute, lexically clean path
pub fn resolve_host_path(source: &str, working_dir: &Path) -> String {
    let path = if let Some(rest) = source.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        home.join(rest.trim_start_matches('/'))
    } else {
        working_dir.join(source)
    };
    clean_path(&path).to_string_lossy().into_owned()
}

/// Lexically normalize `.` and `..` components
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Render a mount in long syntax
pub fn to_long(mount: &Mount) -> VolumeMountLong {
    let propagation = mount
        .options
        .iter()
        .find(|o| PROPAGATION.contains(&o.as_str()))
        .cloned();
    let selinux = mount
        .options
        .iter()
        .find(|o| o.as_str() == "z" || o.as_str() == "Z")
        .cloned();
    let nocopy = mount.options.iter().any(|o| o == "nocopy");

    VolumeMountLong {
        mount_type: mount.kind.to_string(),
        source: mount.source.clone(),
        target: mount.target.clone(),
        read_only: mount.read_only.then_some(true),
        bind: (propagation.is_some() || selinux.is_some()).then(|| BindOptions {
            propagation,
            create_host_path: None,
            selinux,
        }),
        volume: nocopy.then(|| VolumeOptions { nocopy: Some(true) }),
        tmpfs: (mount.size.is_some() || mount.mode.is_some()).then(|| TmpfsOptions {
            size: mount.size,
            mode: mount.mode,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms() {
        let wd = Path::new("/srv/app");

        let m = parse_volume(&VolumeMount::Short("./data:/data:ro".into()), wd).unwrap();
        assert_eq!(m.kind, MountKind::Bind);
        assert_eq!(m.source.as_deref(), Some("/srv/app/data"));
        assert!(m.read_only);

        let m = parse_volume(&VolumeMount::Short("db-data:/var/lib/db".into()), wd).unwrap();
        assert_eq!(m.kind, MountKind::Volume);
        assert_eq!(m.source.as_deref(), Some("db-data"));

        let m = parse_volume(&VolumeMount::Short("/cache".into()), wd).unwrap();
        assert!(m.is_anonymous());

        let m = parse_volume(&VolumeMount::Short("../shared:/shared:rw,z,rslave".into()), wd).unwrap();
        assert_eq!(m.source.as_deref(), Some("/srv/shared"));
        assert_eq!(m.options, vec!["rslave".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_invalid_specs() {
        let wd = Path::new("/srv/app");
        assert!(parse_volume(&VolumeMount::Short("data:relative".into()), wd).is_err());
        assert!(parse_volume(&VolumeMount::Short("a:/b:c:d".into()), wd).is_err());
        assert!(parse_volume(&VolumeMount::Short("a:/b:bogus".into()), wd).is_err());
    }

    #[test]
    fn test_long_form_matches_short_form() {
        let wd = Path::new("/srv/app");
        let short = parse_volume(&VolumeMount::Short("./conf:/etc/conf:ro,z".into()), wd).unwrap();
        let long = parse_volume(&VolumeMount::Long(to_long(&short)), wd).unwrap();
        assert_eq!(short, long);
    }

    #[test]
    fn test_tmpfs() {
        let m = parse_tmpfs("/run:size=64m,mode=1777").unwrap();
        assert_eq!(m.kind, MountKind::Tmpfs);
        assert_eq!(m.size, Some(64 << 20));
        assert_eq!(m.mode, Some(0o1777));
        assert!(parse_tmpfs("run").is_err());
    }
}
