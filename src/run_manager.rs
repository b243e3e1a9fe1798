// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! State machine driving one Run (C7). Grounded on `RunManager` /
//! `RunHelpers` referenced by `original_source/loadsbroker/broker.py`
//! and exercised by `original_source/loadsbroker/tests/test_units/test_broker.py`
//! (which is the only surviving record of `RunManager`'s public shape --
//! `broker.py` itself only stubs construction). The `release_run` call
//! in that stub invokes a method `EC2Pool` never defines; this
//! implementation calls `release_instances` directly instead of
//! replicating that defect (spec section 9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collection::InstanceCollection;
use crate::extensions::cadvisor::CAdvisor;
use crate::extensions::dnsmasq::DnsMasq;
use crate::extensions::docker_bootstrap::DockerBootstrap;
use crate::extensions::heka::Heka;
use crate::extensions::watcher::Watcher;
use crate::model::{ContainerGroup, Run, RunState};
use crate::ping::Pinger;
use crate::pool::InstancePool;
use crate::run_store::RunStore;
use crate::ssh::SshRunner;
use crate::util::{parse_port_mapping, parse_volume_mapping};

const DEFAULT_SLEEP_SECS: u64 = 5;
const DOCKER_READY_INTERVAL: Duration = Duration::from_secs(5);
const DOCKER_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Extension handles threaded through `RunManager`, breaking the cyclic
/// RunManager/Extensions/Collection collaborator graph named in spec
/// section 9: extensions mutate the collection they're given and never
/// call back into the manager.
pub struct RunHelpers {
    pub ping: Pinger,
    pub ssh: Arc<SshRunner>,
    pub docker: DockerBootstrap,
    pub dns: DnsMasq,
    pub heka: Heka,
    pub cadvisor: CAdvisor,
    pub watcher: Watcher,
}

/// Links one ContainerGroup to the collection currently running its
/// workload.
struct GroupLink {
    container_group_index: usize,
    collection: InstanceCollection,
}

pub struct RunManager {
    pub run: Run,
    plan_groups: Vec<ContainerGroup>,
    pool: Arc<Mutex<InstancePool>>,
    run_store: Arc<dyn RunStore>,
    helpers: RunHelpers,
    links: Vec<GroupLink>,
    pub sleep_time: Duration,
}

impl RunManager {
    pub fn new(
        run: Run,
        plan_groups: Vec<ContainerGroup>,
        pool: Arc<Mutex<InstancePool>>,
        run_store: Arc<dyn RunStore>,
        helpers: RunHelpers,
    ) -> Self {
        Self {
            run,
            plan_groups,
            pool,
            run_store,
            helpers,
            links: Vec::new(),
            sleep_time: Duration::from_secs(DEFAULT_SLEEP_SECS),
        }
    }

    /// Requests a Collection per ContainerGroup, brings each to
    /// readiness (runtime bootstrap, image load, sysctl, side-cars), and
    /// transitions the run to RUNNING.
    pub async fn initialize(&mut self) -> crate::error::Result<()> {
        for (index, group) in self.plan_groups.clone().into_iter().enumerate() {
            let collection = {
                let mut pool = self.pool.lock().await;
                pool.request_instances(self.run.uuid, Uuid::new_v4(), group.instance_count, &group.instance_type, &group.region)
                    .await?
            };
            let collection = InstanceCollection::new(collection.run_id, collection.uuid, collection.instances);
            self.bring_up_group(&group, collection, index).await;
        }

        self.run.started_at = Some(Utc::now());
        self.run.state = RunState::Running;
        self.run_store.save_run(&self.run).await?;
        Ok(())
    }

    async fn bring_up_group(&mut self, group: &ContainerGroup, mut collection: InstanceCollection, index: usize) {
        if let Err(e) = self.helpers.docker.setup_collection(&collection).await {
            warn!(group = %group.name, error = %e, "setup_collection failed");
        }
        if let Err(e) = self.helpers.docker.wait_until_ready(&mut collection, DOCKER_READY_INTERVAL, DOCKER_READY_TIMEOUT).await {
            warn!(group = %group.name, error = %e, "wait_until_ready failed");
        }

        self.helpers.docker.load_containers(&collection, &group.container_image, group.container_image_url.as_deref()).await;

        // Side-car images are pulled/imported the same way as the user
        // workload, as configured (spec section 4.7, `_initialize` step
        // 2); an unconfigured side-car is skipped entirely.
        if self.helpers.heka.is_configured() {
            let info = self.helpers.heka.info().clone();
            self.helpers.docker.load_containers(&collection, &info.name, info.url.as_deref()).await;
        }
        if self.helpers.cadvisor.is_configured() {
            let info = self.helpers.cadvisor.info().clone();
            self.helpers.docker.load_containers(&collection, &info.name, info.url.as_deref()).await;
        }
        if group.dns_name.is_some() {
            let info = self.helpers.dns.info().clone();
            self.helpers.docker.load_containers(&collection, &info.name, info.url.as_deref()).await;
        }

        if let Some(dns_name) = &group.dns_name {
            let mut hostmap = HashMap::new();
            let ips: Vec<String> = collection.members().iter().filter_map(|m| m.instance.ip_address.clone()).collect();
            hostmap.insert(dns_name.clone(), ips);
            self.helpers.dns.start(&collection, &self.helpers.docker, &hostmap).await;
        }

        for member in collection.members() {
            if let Some(address) = member.instance.ssh_address() {
                if let Err(e) = self.helpers.ssh.reload_sysctl(&address).await {
                    debug!(provider_id = %member.instance.provider_id, error = %e, "reload_sysctl failed");
                }
            }
        }

        self.helpers.heka.start(&collection, &self.helpers.docker, &self.helpers.ping, &self.run.uuid.to_string(), group.metric_series.as_deref()).await;
        self.helpers.cadvisor.start(&collection, &self.helpers.docker, &self.helpers.ping, &format!("{}-cadvisor", self.run.uuid)).await;
        self.helpers.watcher.start(&collection, &self.helpers.docker).await;

        self.links.push(GroupLink { container_group_index: index, collection });
    }

    /// Ticks every `sleep_time` until every RunningGroup has completed,
    /// then transitions to TERMINATING.
    pub async fn run_loop(&mut self) -> crate::error::Result<()> {
        loop {
            self.tick().await;
            if self.run.all_groups_completed() {
                break;
            }
            tokio::time::sleep(self.sleep_time).await;
        }
        self.run.state = RunState::Terminating;
        self.run_store.save_run(&self.run).await?;
        Ok(())
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        let run_started_at = self.run.started_at.unwrap_or(now);

        for link in &self.links {
            let group = &self.plan_groups[link.container_group_index];
            let running_group = &mut self.run.running_groups[link.container_group_index];

            if running_group.is_completed() {
                continue;
            }

            if link.collection.is_empty() || link.collection.is_drained().await {
                running_group.mark_completed(now);
                self.run.aborted = true;
                continue;
            }

            if running_group.should_start(run_started_at, group.run_delay_secs, now) {
                self.start_group_workload(group, &link.collection).await;
                running_group.mark_started(now);
            } else if running_group.started_at.is_some() {
                let should_stop = running_group.should_stop(group.run_max_time_secs, now);
                let still_running = self.helpers.docker.is_running(&link.collection, &group.container_image).await;
                if should_stop || !still_running {
                    self.helpers.docker.stop_containers(&link.collection, &group.container_image, 15).await;
                    running_group.mark_completed(now);
                }
            }
        }
    }

    async fn start_group_workload(&self, group: &ContainerGroup, collection: &InstanceCollection) {
        let volumes: HashMap<String, (String, bool)> = parse_volume_mapping(&group.volume_mappings)
            .into_iter()
            .map(|v| (v.host_path, (v.container_path, v.read_only)))
            .collect();
        let ports: HashMap<String, String> = parse_port_mapping(&group.port_mappings)
            .into_iter()
            .map(|(host, cont)| (format!("{cont}/tcp"), host.to_string()))
            .collect();

        self.helpers
            .docker
            .run_containers(
                collection,
                &group.container_image,
                &group.environment,
                &group.command_args,
                volumes,
                ports,
                Duration::ZERO,
                None,
            )
            .await;
    }

    /// Stops side-cars and user containers, releases every Collection
    /// back to the pool, reaps stale free instances, and transitions to
    /// COMPLETED.
    pub async fn shutdown(&mut self) -> crate::error::Result<()> {
        for link in &self.links {
            let group = &self.plan_groups[link.container_group_index];
            self.helpers.heka.stop(&link.collection, &self.helpers.docker).await;
            self.helpers.cadvisor.stop(&link.collection, &self.helpers.docker).await;
            self.helpers.dns.stop(&link.collection, &self.helpers.docker).await;
            self.helpers.watcher.stop(&link.collection, &self.helpers.docker).await;
            self.helpers.docker.kill_containers(&link.collection, &group.container_image).await;
        }

        let mut pool = self.pool.lock().await;
        for link in self.links.drain(..) {
            let collection = link.collection;
            let instances: Vec<_> = collection.members().iter().map(|m| m.instance.clone()).collect();
            let pool_collection = crate::pool::Collection {
                run_id: collection.run_id,
                uuid: collection.uuid,
                region: instances.first().map(|i| i.region.clone()).unwrap_or_default(),
                instance_type: instances.first().map(|i| i.instance_type.clone()).unwrap_or_default(),
                instances,
            };
            if let Err(e) = pool.release_instances(pool_collection).await {
                warn!(error = %e, "failed to release collection back to pool");
            }
        }
        pool.reap_stale(Duration::from_secs(3600)).await;
        drop(pool);

        self.run.completed_at = Some(Utc::now());
        self.run.state = RunState::Completed;
        self.run_store.save_run(&self.run).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_helpers(ssh: Arc<SshRunner>) -> (DnsMasq, Heka, CAdvisor, Watcher) {
        use crate::extensions::ContainerInfo;
        (
            DnsMasq::new(ContainerInfo::new("andyshinn/dnsmasq")),
            Heka::new(ContainerInfo::new("mozilla/heka"), ssh.clone(), None, None),
            CAdvisor::new(ContainerInfo::new("google/cadvisor"), None),
            Watcher::new(ContainerInfo::new("loads/watcher"), None),
        )
    }

    fn plan_groups() -> Vec<ContainerGroup> {
        vec![ContainerGroup {
            name: "loaders".into(),
            region: "us-west-2".into(),
            instance_type: "t1.micro".into(),
            instance_count: 0,
            container_image: "user/load:latest".into(),
            container_image_url: None,
            environment: String::new(),
            command_args: String::new(),
            volume_mappings: String::new(),
            port_mappings: String::new(),
            run_delay_secs: 0,
            run_max_time_secs: 5,
            dns_name: None,
            metric_series: None,
        }]
    }

    #[tokio::test]
    async fn initialize_with_zero_instance_groups_reaches_running() {
        use crate::model::Plan;
        use crate::pool::fakes::FakeCloudApi;
        use crate::run_store::InMemoryRunStore;
        use crate::settings::Settings;

        let settings = Settings {
            broker_id: "1234".into(),
            credentials: Default::default(),
            regions: vec!["us-west-2".into()],
            key_pair: "loads".into(),
            security_group: "loads".into(),
            user_data: None,
            use_filters: false,
            ami_owner_id: "595879546273".into(),
            max_idle: Duration::from_secs(600),
            ssh_user: "core".into(),
            ssh_key_path: "/keys/loads.pem".into(),
            heka: None,
            influx: None,
            watcher_aws_credentials: None,
        };
        let mut pool = InstancePool::new(settings, Box::new(FakeCloudApi::with_stable_images()));
        pool.initialize().await.unwrap();
        let pool = Arc::new(Mutex::new(pool));

        let ssh = Arc::new(SshRunner::new("core", "/keys/loads.pem"));
        let (dns, heka, cadvisor, watcher) = dns_helpers(ssh.clone());
        let helpers = RunHelpers {
            ping: Pinger::new(),
            ssh: ssh.clone(),
            docker: DockerBootstrap::new(ssh),
            dns,
            heka,
            cadvisor,
            watcher,
        };

        let plan = Plan { uuid: Uuid::new_v4(), name: "smoke".into(), container_groups: plan_groups() };
        let run = Run::new(&plan, Utc::now());
        let run_store = Arc::new(InMemoryRunStore::new());
        let mut manager = RunManager::new(run, plan_groups(), pool, run_store, helpers);

        manager.initialize().await.unwrap();
        assert_eq!(manager.run.state, RunState::Running);
    }

    fn instance(id: &str) -> crate::instance::Instance {
        crate::instance::Instance {
            provider_id: id.to_string(),
            region: "us-west-2".into(),
            instance_type: "t1.micro".into(),
            ip_address: Some("10.0.0.1".into()),
            private_ip_address: Some("192.168.0.1".into()),
            state: crate::instance::InstanceState::Running,
            launch_time: Utc::now(),
            tags: HashMap::new(),
        }
    }

    // Spec section 7: a collection drained to zero live members marks its
    // RunningGroup completed with `aborted=true`, and other groups are
    // unaffected.
    #[tokio::test]
    async fn tick_marks_group_exhausted_aborted_when_all_members_nonresponsive() {
        use crate::pool::fakes::FakeCloudApi;
        use crate::run_store::InMemoryRunStore;
        use crate::settings::Settings;

        let settings = Settings {
            broker_id: "1234".into(),
            credentials: Default::default(),
            regions: vec!["us-west-2".into()],
            key_pair: "loads".into(),
            security_group: "loads".into(),
            user_data: None,
            use_filters: false,
            ami_owner_id: "595879546273".into(),
            max_idle: Duration::from_secs(600),
            ssh_user: "core".into(),
            ssh_key_path: "/keys/loads.pem".into(),
            heka: None,
            influx: None,
            watcher_aws_credentials: None,
        };
        let pool = Arc::new(Mutex::new(InstancePool::new(settings, Box::new(FakeCloudApi::with_stable_images()))));

        let ssh = Arc::new(SshRunner::new("core", "/keys/loads.pem"));
        let (dns, heka, cadvisor, watcher) = dns_helpers(ssh.clone());
        let helpers = RunHelpers {
            ping: Pinger::new(),
            ssh: ssh.clone(),
            docker: DockerBootstrap::new(ssh),
            dns,
            heka,
            cadvisor,
            watcher,
        };

        let groups = plan_groups();
        let plan = crate::model::Plan { uuid: Uuid::new_v4(), name: "smoke".into(), container_groups: groups.clone() };
        let mut run = Run::new(&plan, Utc::now());
        run.started_at = Some(Utc::now());
        let run_store = Arc::new(InMemoryRunStore::new());
        let mut manager = RunManager::new(run, groups, pool, run_store, helpers);

        let collection = InstanceCollection::new(manager.run.uuid, Uuid::new_v4(), vec![instance("i-1"), instance("i-2")]);
        collection.mark_nonresponsive("i-1").await;
        collection.mark_nonresponsive("i-2").await;
        manager.links.push(GroupLink { container_group_index: 0, collection });

        manager.tick().await;

        assert!(manager.run.running_groups[0].is_completed());
        assert!(manager.run.aborted);
    }
}
