// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! DNSMasq side-car: launches a local DNS resolver per collection and
//! records its container IP on each instance so `run_containers` can
//! wire it in as the instance's DNS server. Grounded on `DNSMasq` in
//! `original_source/loadsbroker/extensions.py`.

use std::collections::HashMap;
use std::time::Duration;

use crate::collection::{InstanceCollection, MapOutcome};
use crate::extensions::docker_bootstrap::DockerBootstrap;
use crate::extensions::ContainerInfo;

pub struct DnsMasq {
    info: ContainerInfo,
}

impl DnsMasq {
    pub fn new(info: ContainerInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    /// `hostmap` is `hostname -> [ip, ...]`; each pair becomes one
    /// `--host-record=name,ip` dnsmasq argument.
    pub async fn start(&self, collection: &InstanceCollection, docker: &DockerBootstrap, hostmap: &HashMap<String, Vec<String>>) {
        let mut records = Vec::new();
        for (name, ips) in hostmap {
            for ip in ips {
                records.push(format!("--host-record={name},{ip}"));
            }
        }
        let cmd = format!("/usr/sbin/dnsmasq -k {}", records.join(" "));
        let mut ports = HashMap::new();
        ports.insert("53/udp".to_string(), "53".to_string());

        let results = docker
            .run_containers(collection, &self.info.name, "", &cmd, HashMap::new(), ports, Duration::ZERO, None)
            .await;

        for (member, outcome) in collection.live_members().await.into_iter().zip(results) {
            let MapOutcome::Ok(run_info) = outcome else { continue };
            let mut state = member.state.write().await;
            if state.dns_server_ip.is_some() {
                continue;
            }
            state.dns_server_ip = run_info.ip_address;
        }
    }

    pub async fn stop(&self, collection: &InstanceCollection, docker: &DockerBootstrap) {
        docker.stop_containers(collection, &self.info.name, 15).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_host_record_args() {
        let mut hostmap = HashMap::new();
        hostmap.insert("loader-1".to_string(), vec!["10.0.0.5".to_string()]);
        let mut records = Vec::new();
        for (name, ips) in &hostmap {
            for ip in ips {
                records.push(format!("--host-record={name},{ip}"));
            }
        }
        assert_eq!(records, vec!["--host-record=loader-1,10.0.0.5"]);
    }
}
