//! Port publishing specs
//!
//! Short syntax: `CTR`, `HOST:CTR`, `IP:HOST:CTR`, `IP::CTR`, each with an
//! optional `/PROTO` suffix. Host and container parts may be ranges
//! (`A-B`); a range expands into one binding per port. Host ports are never
//! pre-allocated here: an unset host port is left for the runtime to pick.

use super::model::{PortConfig, PortConfigLong};
use crate::error::{CtlError, Result};
use crate::runtime::{PortBinding, Protocol};
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

static RANGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap());

/// Parse a service `ports:` entry
pub fn parse_port_config(config: &PortConfig) -> Result<Vec<PortBinding>> {
    match config {
        PortConfig::Short(spec) => parse_port_spec(spec.as_str()),
        PortConfig::Long(long) => parse_long(long),
    }
}

/// Parse a short port spec
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortBinding>> {
    let spec = spec.trim();
    let (addr, protocol) = match spec.rsplit_once('/') {
        Some((addr, proto)) => (addr, proto.parse::<Protocol>()?),
        None => (spec, Protocol::Tcp),
    };

    let (host_ip, host, container) = split_address(addr)
        .ok_or_else(|| CtlError::ConfigInvalid(format!("invalid port spec {:?}", spec)))?;

    let host_ip = match host_ip {
        Some(ip) if !ip.is_empty() => Some(parse_ip(ip, spec)?),
        _ => None,
    };
    let host = match host {
        Some(h) if !h.is_empty() => Some(parse_range(h, spec)?),
        _ => None,
    };
    let container = parse_range(container, spec)?;

    expand(spec, host_ip, host, container, protocol)
}

/// Split `[IP:][HOST:]CTR`, honoring bracketed IPv6 addresses
fn split_address(addr: &str) -> Option<(Option<&str>, Option<&str>, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (ip, rest) = rest.split_once(']')?;
        let rest = rest.strip_prefix(':')?;
        let (host, container) = rest.split_once(':')?;
        return Some((Some(ip), Some(host), container));
    }

    let parts: Vec<&str> = addr.split(':').collect();
    match parts.len() {
        1 => Some((None, None, parts[0])),
        2 => Some((None, Some(parts[0]), parts[1])),
        3 => Some((Some(parts[0]), Some(parts[1]), parts[2])),
        n => {
            // Unbracketed IPv6: the last two parts are host and container
            let ip_len = addr.len() - parts[n - 1].len() - parts[n - 2].len() - 2;
            Some((Some(&addr[..ip_len]), Some(parts[n - 2]), parts[n - 1]))
        }
    }
}

fn parse_long(long: &PortConfigLong) -> Result<Vec<PortBinding>> {
    let spec = format!("{:?}", long);
    let protocol = match &long.protocol {
        Some(p) => p.parse::<Protocol>()?,
        None => Protocol::Tcp,
    };
    let host_ip = match long.host_ip.as_deref() {
        Some(ip) if !ip.is_empty() => Some(parse_ip(ip, &spec)?),
        _ => None,
    };
    let host = match &long.published {
        Some(p) if !p.as_str().is_empty() => Some(parse_range(p.as_str(), &spec)?),
        _ => None,
    };
    if long.target == 0 {
        return Err(CtlError::ConfigInvalid(format!(
            "invalid port spec {}: container port must not be 0",
            spec
        )));
    }

    expand(&spec, host_ip, host, (long.target, long.target), protocol)
}

fn parse_ip(ip: &str, spec: &str) -> Result<IpAddr> {
    ip.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| {
            CtlError::ConfigInvalid(format!(
                "invalid port spec {:?}: invalid host IP {:?}",
                spec, ip
            ))
        })
}

fn parse_range(part: &str, spec: &str) -> Result<(u16, u16)> {
    let invalid = || CtlError::ConfigInvalid(format!("invalid port spec {:?}", spec));

    let caps = RANGE_PATTERN.captures(part).ok_or_else(invalid)?;
    let start: u16 = caps[1].parse().map_err(|_| invalid())?;
    let end: u16 = match caps.get(2) {
        Some(end) => end.as_str().parse().map_err(|_| invalid())?,
        None => start,
    };

    if start == 0 || end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

fn expand(
    spec: &str,
    host_ip: Option<IpAddr>,
    host: Option<(u16, u16)>,
    container: (u16, u16),
    protocol: Protocol,
) -> Result<Vec<PortBinding>> {
    let width = container.1 - container.0;

    if let Some((start, end)) = host {
        if end - start != width {
            return Err(CtlError::ConfigInvalid(format!(
                "invalid port spec {:?}: host and container port ranges must have the same width",
                spec
            )));
        }
    }

    Ok((0..=width)
        .map(|offset| PortBinding {
            host_ip,
            host_port: host.map(|(start, _)| start + offset),
            container_port: container.0 + offset,
            protocol,
        })
        .collect())
}

/// Render a binding back into short syntax
pub fn to_short_spec(binding: &PortBinding) -> String {
    let mut out = String::new();
    if let Some(ip) = binding.host_ip {
        match ip {
            IpAddr::V6(v6) => out.push_str(&format!("[{}]:", v6)),
            IpAddr::V4(v4) => out.push_str(&format!("{}:", v4)),
        }
    }
    if let Some(port) = binding.host_port {
        out.push_str(&format!("{}:", port));
    } else if binding.host_ip.is_some() {
        out.push(':');
    }
    out.push_str(&format!("{}/{}", binding.container_port, binding.protocol));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms() {
        let ports = parse_port_spec("8080:80").unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].host_port, Some(8080));
        assert_eq!(ports[0].container_port, 80);
        assert_eq!(ports[0].protocol, Protocol::Tcp);

        let ports = parse_port_spec("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(ports[0].host_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(ports[0].protocol, Protocol::Udp);

        let ports = parse_port_spec("9000/sctp").unwrap();
        assert_eq!(ports[0].host_port, None);
        assert_eq!(ports[0].protocol, Protocol::Sctp);

        let ports = parse_port_spec("127.0.0.1::80").unwrap();
        assert_eq!(ports[0].host_port, None);
        assert!(ports[0].host_ip.is_some());

        let ports = parse_port_spec("[::1]:8080:80").unwrap();
        assert_eq!(ports[0].host_ip, Some("::1".parse().unwrap()));
    }

    #[test]
    fn test_range_expansion() {
        let ports = parse_port_spec("32000-32060:32000-32060").unwrap();
        assert_eq!(ports.len(), 61);
        assert_eq!(ports[60].host_port, Some(32060));
        assert_eq!(ports[60].container_port, 32060);

        let ports = parse_port_spec("3000-3002").unwrap();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().all(|p| p.host_port.is_none()));
    }

    #[test]
    fn test_invalid_specs() {
        assert!(parse_port_spec("8000-8010:80-81").is_err());
        assert!(parse_port_spec("notanip:8080:80").is_err());
        assert!(parse_port_spec("80/icmp").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("abc").is_err());
    }

    #[test]
    fn test_long_form() {
        let long = PortConfigLong {
            target: 80,
            published: Some("8080".into()),
            host_ip: Some("0.0.0.0".to_string()),
            protocol: Some("tcp".to_string()),
            mode: None,
        };
        let ports = parse_port_config(&PortConfig::Long(long)).unwrap();
        assert_eq!(ports[0].to_string(), "0.0.0.0:8080->80/tcp");
    }

    #[test]
    fn test_short_spec_round_trip() {
        for spec in ["8080:80/tcp", "127.0.0.1:5353:53/udp", "9000/sctp", "[::1]:8080:80/tcp"] {
            let binding = &parse_port_spec(spec).unwrap()[0];
            assert_eq!(to_short_spec(binding), spec);
        }
    }
}
