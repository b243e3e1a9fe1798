// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Heka log-forwarder side-car. Grounded on `Heka` in
//! `original_source/loadsbroker/extensions.py`: renders a config from
//! one of two templates depending on whether an InfluxDB sink is
//! configured, uploads it per-instance, launches the container in
//! `pid_mode=host`, then confirms it answers its health endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::extensions::docker_bootstrap::DockerBootstrap;
use crate::extensions::ContainerInfo;
use crate::collection::InstanceCollection;
use crate::ping::Pinger;
use crate::settings::{HekaOptions, InfluxOptions};
use crate::ssh::SshRunner;
use crate::util::join_host_port;

/// Renders the two Heka config variants the original templates produced.
/// The real deployment ships these as files under a `heka/` config
/// directory; they're reproduced here as literal templates scoped to this
/// module so the crate has no runtime dependency on an external asset
/// directory.
pub struct HekaConfig;

impl HekaConfig {
    pub fn render(options: &HekaOptions, influx: Option<(&InfluxOptions, &str)>, hostname: &str) -> String {
        let remote_addr = join_host_port(&options.host, options.port);
        let remote_secure = options.secure;
        match influx {
            Some((influx, database_name)) => {
                let influx_addr = join_host_port(&influx.host, influx.port);
                format!(
                    "[TcpOutput]\naddress = \"{remote_addr}\"\nuse_tls = {remote_secure}\n\n[InfluxOutput]\naddress = \"{influx_addr}\"\ndatabase = \"{database_name}\"\n\n[hostname]\nvalue = \"{hostname}\"\n"
                )
            }
            None => format!(
                "[TcpOutput]\naddress = \"{remote_addr}\"\nuse_tls = {remote_secure}\n\n[hostname]\nvalue = \"{hostname}\"\n"
            ),
        }
    }
}

pub struct Heka {
    info: ContainerInfo,
    ssh: Arc<SshRunner>,
    options: Option<HekaOptions>,
    influx: Option<InfluxOptions>,
}

impl Heka {
    pub fn new(info: ContainerInfo, ssh: Arc<SshRunner>, options: Option<HekaOptions>, influx: Option<InfluxOptions>) -> Self {
        Self { info, ssh, options, influx }
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn is_configured(&self) -> bool {
        self.options.is_some()
    }

    pub async fn start(
        &self,
        collection: &InstanceCollection,
        docker: &DockerBootstrap,
        pinger: &Pinger,
        database_name: &str,
        series: Option<&str>,
    ) {
        let Some(options) = &self.options else {
            debug!("heka not configured");
            return;
        };

        let mut volumes = HashMap::new();
        volumes.insert("/home/core/heka".to_string(), ("/heka".to_string(), false));
        let mut ports = HashMap::new();
        ports.insert("8125/udp".to_string(), "8125".to_string());
        ports.insert("4352/tcp".to_string(), "4352".to_string());

        let series_prefix = series.map(|s| format!("{s}.")).unwrap_or_default();

        for member in collection.members() {
            let Some(ip) = member.instance.ip_address.clone() else { continue };
            let hostname = format!("{series_prefix}{}", ip.replace('.', "_"));
            let config = HekaConfig::render(options, self.influx.as_ref().map(|i| (i, database_name)), &hostname);
            let address = format!("{ip}:22");
            if let Err(e) = self.ssh.upload_file(&address, config.as_bytes(), "/home/core/heka/config.toml").await {
                debug!(provider_id = %member.instance.provider_id, error = %e, "failed to upload heka config");
            }
        }

        debug!("launching heka");
        docker
            .run_containers(
                collection,
                &self.info.name,
                "",
                "hekad -config=/heka/config.toml",
                volumes,
                ports,
                std::time::Duration::ZERO,
                Some("host"),
            )
            .await;

        for member in collection.members() {
            let Some(ip) = &member.instance.ip_address else { continue };
            let health_url = format!("http://{ip}:4352/");
            if let Err(e) = pinger.ping(&health_url).await {
                debug!(provider_id = %member.instance.provider_id, error = %e, "heka did not respond to ping");
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

    fn heka_options() -> HekaOptions {
        HekaOptions { host: "heka.example.com".into(), port: 4353, secure: true }
    }

    #[test]
    fn renders_no_influx_variant_without_sink() {
        let config = HekaConfig::render(&heka_options(), None, "run.10_0_0_5");
        assert!(config.contains("heka.example.com:4353"));
        assert!(!config.contains("InfluxOutput"));
    }

    #[test]
    fn renders_influx_variant_when_configured() {
        let influx = InfluxOptions {
            host: "influx.example.com".into(),
            port: 8086,
            secure: false,
            user: "loads".into(),
            password: "secret".into(),
        };
        let config = HekaConfig::render(&heka_options(), Some((&influx, "loadsdb")), "run.10_0_0_5");
        assert!(config.contains("InfluxOutput"));
        assert!(config.contains("loadsdb"));
    }
}
