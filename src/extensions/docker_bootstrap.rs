// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Container runtime bootstrap: attaches a runtime client per instance,
//! waits for daemons to respond, and loads/runs/stops/kills images
//! across a collection. Grounded on the `Docker` class in
//! `original_source/loadsbroker/extensions.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::collection::{InstanceCollection, InstanceStateBag, MapOutcome};
use crate::container_runtime::{self, ContainerRuntime};
use crate::error::Result;
use crate::instance::Instance;
use crate::ssh::SshRunner;
use crate::util::substitute_names;

const LOAD_RETRIES: u32 = 3;
const RUN_RETRIES: u32 = 3;

pub struct DockerBootstrap {
    ssh: Arc<SshRunner>,
}

impl DockerBootstrap {
    pub fn new(ssh: Arc<SshRunner>) -> Self {
        Self { ssh }
    }

    /// Attaches a `ContainerRuntime` to every instance that doesn't
    /// already have one.
    pub async fn setup_collection(&self, collection: &InstanceCollection) -> Result<()> {
        for member in collection.members() {
            let mut state = member.state.write().await;
            if state.docker.is_some() {
                continue;
            }
            let address = container_runtime::daemon_address(member.instance.ip_address.as_deref());
            let runtime = ContainerRuntime::connect(&address)?;
            state.docker = Some(Arc::new(Mutex::new(runtime)));
        }
        Ok(())
    }

    /// Polls `list_containers` on every non-responding instance every
    /// `interval` until all respond or `timeout` elapses, then prunes
    /// the stragglers from the collection (spec section 4.6).
    pub async fn wait_until_ready(
        &self,
        collection: &mut InstanceCollection,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let not_responded = self.not_responding(collection).await;
            if not_responded.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                for provider_id in &not_responded {
                    let timed_out = crate::error::OrchestratorError::Timeout(timeout, format!("docker daemon on {provider_id}"))
                        .into_instance_unavailable();
                    debug!(provider_id, error = %timed_out, "pruning non-responding instance after deadline");
                }
                collection.remove_instances(&not_responded);
                return Ok(());
            }
            for provider_id in &not_responded {
                self.probe_one(collection, provider_id).await;
            }
            collection.wait(interval).await;
        }
    }

    async fn not_responding(&self, collection: &InstanceCollection) -> Vec<String> {
        let mut out = Vec::new();
        for member in collection.members() {
            let state = member.state.read().await;
            let responded = match &state.docker {
                Some(docker) => docker.lock().await.responded,
                None => false,
            };
            if !responded {
                out.push(member.instance.provider_id.clone());
            }
        }
        out
    }

    async fn probe_one(&self, collection: &InstanceCollection, provider_id: &str) {
        let Some(member) = collection.members().iter().find(|m| m.instance.provider_id == provider_id) else {
            return;
        };
        let docker = { member.state.read().await.docker.clone() };
        if let Some(docker) = docker {
            if let Err(e) = docker.lock().await.list_containers().await {
                debug!(provider_id, error = %e, "docker daemon not yet responding");
            }
        }
    }

    /// Ensures `container_name` is present on every live instance,
    /// importing from `container_image_url` over SSH when set, else
    /// pulling from the registry. Retries up to [`LOAD_RETRIES`] times.
    pub async fn load_containers(
        &self,
        collection: &InstanceCollection,
        container_name: &str,
        container_image_url: Option<&str>,
    ) -> Vec<MapOutcome<()>> {
        let ssh = self.ssh.clone();
        let container_name = container_name.to_string();
        let container_image_url = container_image_url.map(str::to_string);
        collection
            .map(
                move |instance, state| {
                    let ssh = ssh.clone();
                    let container_name = container_name.clone();
                    let container_image_url = container_image_url.clone();
                    async move { load_one(&ssh, &instance, &state, &container_name, container_image_url.as_deref()).await }
                },
                Duration::ZERO,
            )
            .await
    }

    /// Runs `container_name` on every live instance with env/argv/volume
    /// `$NAME` substitution applied, injecting `HOST_IP`, `PRIVATE_IP`,
    /// `STATSD_HOST`, `STATSD_PORT` first (spec section 4.6). Up to
    /// [`RUN_RETRIES`] retries per instance, stopping the container
    /// between attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_containers(
        &self,
        collection: &InstanceCollection,
        container_name: &str,
        env: &str,
        command_args: &str,
        volumes: HashMap<String, (String, bool)>,
        ports: HashMap<String, String>,
        delay: Duration,
        pid_mode: Option<&str>,
    ) -> Vec<MapOutcome<container_runtime::RunInfo>> {
        let container_name = container_name.to_string();
        let env = env.to_string();
        let command_args = command_args.to_string();
        let pid_mode = pid_mode.map(str::to_string);
        collection
            .map(
                move |instance, state| {
                    let container_name = container_name.clone();
                    let env = env.clone();
                    let command_args = command_args.clone();
                    let volumes = volumes.clone();
                    let ports = ports.clone();
                    let pid_mode = pid_mode.clone();
                    async move {
                        run_one(&instance, &state, &container_name, &env, &command_args, volumes, ports, pid_mode.as_deref())
                            .await
                    }
                },
                delay,
            )
            .await
    }

    pub async fn stop_containers(&self, collection: &InstanceCollection, container_name: &str, timeout_s: i64) -> Vec<MapOutcome<()>> {
        let container_name = container_name.to_string();
        collection
            .map(
                move |_instance, state| {
                    let container_name = container_name.clone();
                    async move { stop_one(&state, &container_name, timeout_s).await }
                },
                Duration::ZERO,
            )
            .await
    }

    pub async fn kill_containers(&self, collection: &InstanceCollection, container_name: &str) -> Vec<MapOutcome<()>> {
        let container_name = container_name.to_string();
        collection
            .map(
                move |_instance, state| {
                    let container_name = container_name.clone();
                    async move { kill_one(&state, &container_name).await }
                },
                Duration::ZERO,
            )
            .await
    }

    /// Checks whether `container_name` is running anywhere in the
    /// collection's currently-live instances; marks instances it loses
    /// contact with as `nonresponsive`.
    pub async fn is_running(&self, collection: &InstanceCollection, container_name: &str) -> bool {
        let mut any = false;
        for member in collection.running_instances().await {
            let docker = { member.state.read().await.docker.clone() };
            let Some(docker) = docker else { continue };
            match docker.lock().await.list_containers().await {
                Ok(containers) => {
                    if containers.values().any(|image| image.contains(container_name)) {
                        any = true;
                    }
                }
                Err(_) => {
                    debug!(provider_id = %member.instance.provider_id, "lost contact with a container, marking dead");
                    member.state.write().await.nonresponsive = true;
                }
            }
        }
        any
    }
}

async fn load_one(
    ssh: &SshRunner,
    instance: &Instance,
    state: &Arc<RwLock<InstanceStateBag>>,
    container_name: &str,
    url: Option<&str>,
) -> std::result::Result<(), String> {
    let docker = state.read().await.docker.clone().ok_or("docker runtime not attached")?;

    for attempt in 0..=LOAD_RETRIES {
        let has_image = docker.lock().await.has_image(container_name).await.map_err(|e| e.to_string())?;
        if has_image && !container_name.contains("latest") {
            return Ok(());
        }

        let load_result = if let Some(url) = url {
            let address = instance.ssh_address().ok_or("instance has no ip address")?;
            docker.lock().await.import_from_url(ssh, &address, url).await
        } else {
            docker.lock().await.pull(container_name).await
        };

        if let Err(e) = &load_result {
            debug!(provider_id = %instance.provider_id, attempt, error = %e, "load_containers attempt failed");
        }

        let now_present = docker.lock().await.has_image(container_name).await.map_err(|e| e.to_string())?;
        if now_present {
            return Ok(());
        }
        if attempt == LOAD_RETRIES {
            return Err(format!("could not load {container_name} after {LOAD_RETRIES} retries"));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    instance: &Instance,
    state: &Arc<RwLock<InstanceStateBag>>,
    container_name: &str,
    env: &str,
    command_args: &str,
    volumes: HashMap<String, (String, bool)>,
    ports: HashMap<String, String>,
    pid_mode: Option<&str>,
) -> std::result::Result<container_runtime::RunInfo, String> {
    let private_ip = instance.private_ip_address.clone().unwrap_or_default();
    let added_env = format!(
        "HOST_IP={}\nPRIVATE_IP={}\nSTATSD_HOST={}\nSTATSD_PORT=8125",
        instance.ip_address.clone().unwrap_or_default(),
        private_ip,
        private_ip,
    );
    let full_env = if env.is_empty() { added_env } else { format!("{env}\n{added_env}") };
    // Self-substitute so entries that reference other entries (e.g.
    // `FOO=$HOST_IP`) resolve before being used as the dictionary for
    // argv/volume substitution below (spec section 4.6).
    let full_env = substitute_names(&full_env, &crate::util::parse_env(&full_env));
    let env_map = crate::util::parse_env(&full_env);

    let container_env: Vec<String> = full_env.lines().filter(|l| !l.is_empty()).map(str::to_string).collect();
    let container_args = substitute_names(command_args, &env_map);

    let container_volumes: HashMap<String, (String, bool)> = volumes
        .into_iter()
        .map(|(host, (container, ro))| (substitute_names(&host, &env_map), (substitute_names(&container, &env_map), ro)))
        .collect();

    let dns = {
        let s = state.read().await;
        s.dns_server_ip.clone().into_iter().collect::<Vec<_>>()
    };

    let docker = state.read().await.docker.clone().ok_or("docker runtime not attached")?;

    for attempt in 0..=RUN_RETRIES {
        let result = docker
            .lock()
            .await
            .run(container_name, &container_env, &[container_args.clone()], &container_volumes, &ports, &dns, pid_mode)
            .await;
        match result {
            Ok(info) => return Ok(info),
            Err(e) => {
                debug!(provider_id = %instance.provider_id, attempt, error = %e, "run_container attempt failed");
                if attempt == RUN_RETRIES {
                    return Err(format!("giving up running {container_name}: {e}"));
                }
                let _ = docker.lock().await.stop(container_name, 5).await;
            }
        }
    }
    unreachable!()
}

async fn stop_one(state: &Arc<RwLock<InstanceStateBag>>, container_name: &str, timeout_s: i64) -> std::result::Result<(), String> {
    let docker = state.read().await.docker.clone();
    if let Some(docker) = docker {
        if docker.lock().await.stop(container_name, timeout_s).await.is_err() {
            state.write().await.nonresponsive = true;
        }
    }
    Ok(())
}

async fn kill_one(state: &Arc<RwLock<InstanceStateBag>>, container_name: &str) -> std::result::Result<(), String> {
    let docker = state.read().await.docker.clone();
    if let Some(docker) = docker {
        if docker.lock().await.kill(container_name).await.is_err() {
            state.write().await.nonresponsive = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_holds_ssh_handle() {
        let ssh = Arc::new(SshRunner::new("core", "/keys/loads.pem"));
        let _bootstrap = DockerBootstrap::new(ssh);
    }
}
