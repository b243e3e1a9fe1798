// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Thin façade over a per-host container daemon (C1). Grounded on
//! `DockerDaemon` (referenced from `original_source/loadsbroker/aws.py`
//! and `extensions.py`), reimplemented over `bollard` -- the Docker API
//! crate already used for the agent-side container surface in the
//! broader example pack -- rather than hand-rolling the wire protocol.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::ssh::SshRunner;

/// Inspection data returned after a container is created and started.
pub struct RunInfo {
    pub container_id: String,
    pub ip_address: Option<String>,
}

/// Per-host façade addressing `tcp://<ip>:2375`.
pub struct ContainerRuntime {
    docker: Docker,
    host: String,
    /// Set after the first successful `list_containers`; the RunManager
    /// uses this to prune instances whose daemon never comes up.
    pub responded: bool,
}

impl ContainerRuntime {
    /// Connects to the daemon at `host` (e.g. `tcp://10.0.0.1:2375`, or a
    /// local loopback address for testing).
    pub fn connect(host: &str) -> Result<Self> {
        let docker = Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| OrchestratorError::Runtime(format!("connect to {host}: {e}")))?;
        Ok(Self { docker, host: host.to_string(), responded: false })
    }

    /// Imports a pre-exported image tarball from `url`, fetched and piped
    /// straight into `docker load` on the remote host over an SSH
    /// session -- the URL is frequently only reachable from inside the
    /// instance's network, so the download happens there rather than on
    /// the broker (spec section 4.1).
    pub async fn import_from_url(&self, ssh: &SshRunner, ssh_address: &str, url: &str) -> Result<Vec<u8>> {
        let cmd = format!("curl -fsSL {url} | docker -H {} load", self.host);
        ssh.exec(ssh_address, &cmd).await.map_err(|e| OrchestratorError::Runtime(format!("import_from_url {url}: {e}")))
    }

    pub async fn has_image(&self, name: &str) -> Result<bool> {
        let images = self
            .docker
            .list_images::<String>(None)
            .await
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;
        Ok(images.iter().any(|img| img.repo_tags.iter().any(|t| t == name)))
    }

    pub async fn pull(&self, name: &str) -> Result<String> {
        let options = Some(CreateImageOptions { from_image: name, ..Default::default() });
        let mut stream = self.docker.create_image(options, None, None);
        let mut log = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log.push_str(&status);
                        log.push('\n');
                    }
                }
                Err(e) => return Err(OrchestratorError::Runtime(format!("pull {name}: {e}"))),
            }
        }
        Ok(log)
    }

    pub async fn list_containers(&mut self) -> Result<HashMap<String, String>> {
        let options = Some(ListContainersOptions::<String> { all: true, ..Default::default() });
        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;
        self.responded = true;
        Ok(containers
            .into_iter()
            .filter_map(|c| Some((c.id?, c.image.unwrap_or_default())))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        image: &str,
        env: &[String],
        argv: &[String],
        volumes: &HashMap<String, (String, bool)>,
        ports: &HashMap<String, String>,
        dns: &[String],
        pid_mode: Option<&str>,
    ) -> Result<RunInfo> {
        let binds: Vec<String> = volumes
            .iter()
            .map(|(host, (container, ro))| format!("{host}:{container}:{}", if *ro { "ro" } else { "rw" }))
            .collect();

        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in ports {
            port_bindings.insert(
                container_port.clone(),
                Some(vec![PortBinding { host_ip: None, host_port: Some(host_port.clone()) }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            dns: Some(dns.to_vec()),
            pid_mode: pid_mode.map(|m| m.to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            env: Some(env.to_vec()),
            cmd: Some(argv.to_vec()),
            host_config: Some(host_config),
            ..Default::default()
        };

        // Named after the image, not a generated id: `stop`/`kill` are
        // later called with this same `image` string, and need it to
        // resolve to the container `run` actually created.
        let name = image.to_string();
        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("create {image}: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("start {image}: {e}")))?;

        let inspect: ContainerInspectResponse = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("inspect {image}: {e}")))?;

        let ip_address = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        debug!(container_id = %created.id, image, "container running");
        Ok(RunInfo { container_id: created.id, ip_address })
    }

    pub async fn stop(&self, name: &str, timeout_s: i64) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_s }))
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("stop {name}: {e}")))?;
        Ok(())
    }

    pub async fn kill(&self, name: &str) -> Result<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("kill {name}: {e}")))?;
        Ok(())
    }
}

/// Builds the `tcp://<ip>:2375` (or loopback) address for a host, per
/// `Instance::docker_host`.
pub fn daemon_address(ip: Option<&str>) -> String {
    match ip {
        Some(ip) => format!("tcp://{ip}:2375"),
        None => "tcp://127.0.0.1:2375".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_address_uses_loopback_without_ip() {
        assert_eq!(daemon_address(None), "tcp://127.0.0.1:2375");
        assert_eq!(daemon_address(Some("10.0.0.5")), "tcp://10.0.0.5:2375");
    }
}
