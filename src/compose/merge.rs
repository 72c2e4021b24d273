//! Merging of compose files
//!
//! Later files override earlier ones. Mappings merge key by key and scalars
//! are replaced. Lists of primitives are replaced, except for the service
//! keys listed below which are merged by a natural key:
//!
//! - `ports`: by the full binding, short and long forms normalized alike
//! - `volumes`: by the mount target
//! - `environment`, `labels`, `annotations`, `sysctls`, `extra_hosts`,
//!   `build.args`: list and map forms are both turned into maps
//! - `depends_on`, `networks`: list form is turned into a map of names

use super::ports;
use crate::runtime::PortBinding;
use serde_yaml::{Mapping, Value};

/// Merge `overlay` over `base`
pub fn merge(base: Value, overlay: Value) -> Value {
    merge_at(&[], base, overlay)
}

fn merge_at(path: &[&str], base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            Value::Mapping(merge_mappings(path, base, overlay))
        }
        (base, overlay) => merge_service_key(path, base, overlay),
    }
}

fn merge_mappings(path: &[&str], mut base: Mapping, overlay: Mapping) -> Mapping {
    for (key, value) in overlay {
        let name = key.as_str().unwrap_or_default().to_string();
        let mut child: Vec<&str> = path.to_vec();
        child.push(&name);

        let merged = match base.remove(&key) {
            Some(existing) => merge_at(&child, existing, value),
            None => value,
        };
        base.insert(key, merged);
    }
    base
}

/// Service-level keys with non-replacing list semantics
fn merge_service_key(path: &[&str], base: Value, overlay: Value) -> Value {
    let key = match path {
        ["services", _, key] => *key,
        ["services", _, "build", "args"] => "args",
        _ => return overlay,
    };

    match key {
        "ports" => merge_keyed_list(base, overlay, port_key),
        "volumes" => merge_keyed_list(base, overlay, volume_key),
        "environment" | "labels" | "annotations" | "sysctls" | "args" => Value::Mapping(
            merge_mappings(path, to_mapping(base, '='), to_mapping(overlay, '=')),
        ),
        "extra_hosts" => Value::Mapping(merge_mappings(
            path,
            to_mapping(base, ':'),
            to_mapping(overlay, ':'),
        )),
        "depends_on" | "networks" => Value::Mapping(merge_mappings(
            path,
            names_to_mapping(base),
            names_to_mapping(overlay),
        )),
        _ => overlay,
    }
}

fn merge_keyed_list(base: Value, overlay: Value, key: fn(&Value) -> Option<String>) -> Value {
    let (mut base, overlay) = match (base, overlay) {
        (Value::Sequence(base), Value::Sequence(overlay)) => (base, overlay),
        (_, overlay) => return overlay,
    };

    for item in overlay {
        let item_key = key(&item);
        match base
            .iter()
            .position(|existing| item_key.is_some() && key(existing) == item_key)
        {
            Some(idx) => base[idx] = item,
            None => base.push(item),
        }
    }
    Value::Sequence(base)
}

fn port_key(value: &Value) -> Option<String> {
    let short = |spec: String| match ports::parse_port_spec(&spec) {
        Ok(bindings) => bindings.iter().map(binding_key).collect::<Vec<_>>().join(","),
        // Left for validation to reject
        Err(_) => spec,
    };
    match value {
        Value::String(s) => Some(short(s.clone())),
        Value::Number(n) => Some(short(n.to_string())),
        Value::Mapping(m) => {
            let field = |name: &str| match m.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            let protocol = Some(field("protocol"))
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "tcp".to_string());
            Some(format!(
                "{}:{}:{}/{}",
                field("host_ip"),
                field("published"),
                field("target"),
                protocol.to_lowercase()
            ))
        }
        _ => None,
    }
}

fn binding_key(binding: &PortBinding) -> String {
    format!(
        "{}:{}:{}/{}",
        binding.host_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        binding.host_port.map(|p| p.to_string()).unwrap_or_default(),
        binding.container_port,
        binding.protocol
    )
}

fn volume_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            match parts.len() {
                1 => Some(parts[0].to_string()),
                _ => Some(parts[1].to_string()),
            }
        }
        Value::Mapping(m) => m.get("target").and_then(|t| t.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Turn a `KEY=VALUE` list (or an existing map) into a map
fn to_mapping(value: Value, separator: char) -> Mapping {
    match value {
        Value::Mapping(m) => m,
        Value::Sequence(items) => {
            let mut map = Mapping::new();
            for item in items {
                if let Value::String(entry) = item {
                    match entry.split_once(separator) {
                        Some((k, v)) => {
                            map.insert(Value::String(k.to_string()), Value::String(v.to_string()))
                        }
                        None => map.insert(Value::String(entry), Value::Null),
                    };
                }
            }
            map
        }
        _ => Mapping::new(),
    }
}

/// Turn a list of names into a map with empty entries
fn names_to_mapping(value: Value) -> Mapping {
    match value {
        Value::Mapping(m) => m,
        Value::Sequence(items) => items
            .into_iter()
            .map(|name| (name, Value::Null))
            .collect(),
        _ => Mapping::new(),
    }
}
