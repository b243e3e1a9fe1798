// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small free functions shared across modules.
//!
//! Grounded on `original_source/loadsbroker/util.py`: `join_host_port` and
//! the environment-variable substitution helper (`Docker.substitute_names`
//! in `original_source/loadsbroker/extensions.py`) are carried over with
//! the same semantics, expressed idiomatically.

use std::collections::HashMap;

/// Joins a host and port, bracketing the host if it looks like an IPv6
/// literal (contains `:` or `%`).
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') || host.contains('%') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parses newline-delimited `KEY=VALUE` environment data into a map,
/// skipping blank lines and lines that don't contain a separator.
pub fn parse_env(env: &str) -> HashMap<String, String> {
    env.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Expands `$NAME` / `${NAME}` references in `template` using `env`.
/// Unknown names are left untouched, matching `string.Template.substitute`
/// on partial dictionaries closely enough for this use: we never raise on
/// missing keys here, deployment environments for a container are
/// additive and a left-over `$NAME` is a configuration error the user will
/// see in their container's argv, not a crash in the orchestrator.
pub fn substitute_names(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let rest = &template[i + 1..];
        if let Some(braced) = rest.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                if let Some(val) = env.get(name) {
                    out.push_str(val);
                } else {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
                for _ in 0..(name.len() + 2) {
                    chars.next();
                }
                continue;
            }
        }
        let name_len = rest
            .char_indices()
            .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
            .count();
        if name_len == 0 {
            out.push('$');
            continue;
        }
        let name = &rest[..name_len];
        if let Some(val) = env.get(name) {
            out.push_str(val);
        } else {
            out.push('$');
            out.push_str(name);
        }
        for _ in 0..name_len {
            chars.next();
        }
    }
    out
}

/// Parses a `"host:cont,host:cont,..."` port mapping string into pairs.
pub fn parse_port_mapping(spec: &str) -> Vec<(u16, u16)> {
    spec.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let mut parts = entry.splitn(2, ':');
            let host = parts.next()?.parse().ok()?;
            let cont = parts.next()?.parse().ok()?;
            Some((host, cont))
        })
        .collect()
}

/// A parsed volume mapping entry: host path bound to container path,
/// optionally read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Parses a `"/host:/cont[:ro],..."` volume mapping string.
pub fn parse_volume_mapping(spec: &str) -> Vec<VolumeMapping> {
    spec.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let parts: Vec<&str> = entry.split(':').collect();
            if parts.len() < 2 {
                return None;
            }
            Some(VolumeMapping {
                host_path: parts[0].to_string(),
                container_path: parts[1].to_string(),
                read_only: parts.get(2).map(|m| *m == "ro").unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_host_port_plain() {
        assert_eq!(join_host_port("10.0.0.1", 4352), "10.0.0.1:4352");
    }

    #[test]
    fn join_host_port_ipv6() {
        assert_eq!(join_host_port("::1", 4352), "[::1]:4352");
    }

    #[test]
    fn substitute_names_basic() {
        let mut env = HashMap::new();
        env.insert("HOST_IP".to_string(), "10.0.0.5".to_string());
        assert_eq!(
            substitute_names("--host=$HOST_IP", &env),
            "--host=10.0.0.5"
        );
        assert_eq!(
            substitute_names("--host=${HOST_IP}:8080", &env),
            "--host=10.0.0.5:8080"
        );
    }

    #[test]
    fn substitute_names_leaves_unknown() {
        let env = HashMap::new();
        assert_eq!(substitute_names("--host=$NOPE", &env), "--host=$NOPE");
    }

    #[test]
    fn parse_port_mapping_multiple() {
        assert_eq!(
            parse_port_mapping("8080:80,9090:90"),
            vec![(8080, 80), (9090, 90)]
        );
    }

    #[test]
    fn parse_volume_mapping_ro() {
        let vols = parse_volume_mapping("/data:/srv:ro,/tmp:/tmp");
        assert_eq!(
            vols,
            vec![
                VolumeMapping {
                    host_path: "/data".into(),
                    container_path: "/srv".into(),
                    read_only: true
                },
                VolumeMapping {
                    host_path: "/tmp".into(),
                    container_path: "/tmp".into(),
                    read_only: false
                },
            ]
        );
    }
}
