// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Watcher side-car: a per-instance agent that self-describes the
//! local Docker state back to AWS, given credentials. Grounded on
//! `Watcher` in `original_source/loadsbroker/extensions.py` (spec
//! section 3's supplemented features: named in spec.md's component
//! table but not elaborated in the distilled spec body).

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::collection::InstanceCollection;
use crate::extensions::docker_bootstrap::DockerBootstrap;
use crate::extensions::ContainerInfo;
use crate::settings::AwsCredentials;

pub struct Watcher {
    info: ContainerInfo,
    credentials: Option<AwsCredentials>,
}

impl Watcher {
    pub fn new(info: ContainerInfo, credentials: Option<AwsCredentials>) -> Self {
        Self { info, credentials }
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn start(&self, collection: &InstanceCollection, docker: &DockerBootstrap) {
        let Some(creds) = &self.credentials else {
            debug!("watcher not configured");
            return;
        };

        let mut volumes = HashMap::new();
        volumes.insert("/var/run/docker.sock".to_string(), ("/var/run/docker.sock".to_string(), false));

        let env = format!(
            "AWS_ACCESS_KEY_ID={}\nAWS_SECRET_ACCESS_KEY={}",
            creds.access_key_id.clone().unwrap_or_default(),
            creds.secret_access_key.clone().unwrap_or_default(),
        );

        debug!("launching watcher");
        docker
            .run_containers(
                collection,
                &self.info.name,
                &env,
                "python ./watch.py",
                volumes,
                HashMap::new(),
                Duration::ZERO,
                Some("host"),
            )
            .await;
    }

    pub async fn stop(&self, collection: &InstanceCollection, docker: &DockerBootstrap) {
        docker.stop_containers(collection, &self.info.name, 15).await;
    }
}
