// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! CAdvisor metrics side-car. Grounded on `EC2Instance.start_cadvisor` /
//! `EC2Collection.start_cadvisors` in `original_source/loadsbroker/aws.py`:
//! a no-op when no InfluxDB sink is configured, otherwise launched with
//! `-storage_driver=influxdb` plus host/db/credential flags, same shape
//! as the Heka side-car's configured/unconfigured split.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::collection::InstanceCollection;
use crate::extensions::docker_bootstrap::DockerBootstrap;
use crate::extensions::ContainerInfo;
use crate::ping::Pinger;
use crate::settings::InfluxOptions;

pub struct CAdvisor {
    info: ContainerInfo,
    influx: Option<InfluxOptions>,
}

impl CAdvisor {
    pub fn new(info: ContainerInfo, influx: Option<InfluxOptions>) -> Self {
        Self { info, influx }
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn is_configured(&self) -> bool {
        self.influx.is_some()
    }

    pub async fn start(&self, collection: &InstanceCollection, docker: &DockerBootstrap, pinger: &Pinger, database_name: &str) {
        let Some(influx) = &self.influx else {
            debug!("influxdb not configured; skipping cadvisor");
            return;
        };

        let mut volumes = HashMap::new();
        volumes.insert("/".to_string(), ("/rootfs".to_string(), true));
        volumes.insert("/var/run".to_string(), ("/var/run".to_string(), false));
        volumes.insert("/sys".to_string(), ("/sys".to_string(), true));
        volumes.insert("/var/lib/docker".to_string(), ("/var/lib/docker".to_string(), true));

        let mut ports = HashMap::new();
        ports.insert("8080/tcp".to_string(), "8080".to_string());

        let args = format!(
            "-storage_driver=influxdb -log_dir=/ -storage_driver_db={} -storage_driver_host={}:{} -storage_driver_user={} -storage_driver_password={} -storage_driver_secure={}",
            database_name,
            influx.host,
            influx.port,
            influx.user,
            influx.password,
            influx.secure as u8,
        );

        debug!("launching cadvisor");
        docker.run_containers(collection, &self.info.name, "", &args, volumes, ports, Duration::ZERO, None).await;

        for member in collection.members() {
            let Some(ip) = &member.instance.ip_address else { continue };
            let health_url = format!("http://{ip}:8080/healthz");
            if let Err(e) = pinger.ping(&health_url).await {
                debug!(provider_id = %member.instance.provider_id, error = %e, "cadvisor did not respond to ping");
            }
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
    fn builds_with_and_without_influx() {
        let _no_sink = CAdvisor::new(ContainerInfo::new("google/cadvisor"), None);
        let with_sink = CAdvisor::new(
            ContainerInfo::new("google/cadvisor"),
            Some(InfluxOptions { host: "i".into(), port: 8086, secure: false, user: "u".into(), password: "p".into() }),
        );
        assert!(with_sink.is_configured());
        assert!(!_no_sink.is_configured());
    }
}
