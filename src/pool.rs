// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-region instance pool (C4). Grounded on `EC2Pool` in
//! `original_source/loadsbroker/aws.py`.
//!
//! Not safe for concurrent invocation (spec section 4.4 / 5): the caller
//! (`RunManager`, or a broker serializing callers) must never invoke two
//! pool methods concurrently. This matches the single-loop model in spec
//! section 5 and is asserted informally by the absence of any internal
//! locking.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::instance::{available_instance, virtualization_for, Instance, Virtualization};
use crate::retry::retry_async;
use crate::settings::Settings;

/// The cloud-provider surface the pool needs. Kept narrow and
/// trait-object-friendly so tests substitute an in-memory fake instead of
/// talking to AWS (mirrors how the original tests used `moto` to fake
/// EC2, but expressed as a Rust seam rather than HTTP interception).
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_images(&self, region: &str, owner_id: &str) -> Result<Vec<(String, String, String)>>;
    async fn list_instances(&self, region: &str, filters: &HashMap<String, String>) -> Result<Vec<Instance>>;
    async fn run_instances(
        &self,
        region: &str,
        ami_id: &str,
        count: usize,
        instance_type: &str,
        key_pair: &str,
        security_group: &str,
        user_data: Option<&str>,
    ) -> Result<Vec<Instance>>;
    async fn create_tags(&self, region: &str, ids: &[String], tags: &HashMap<String, String>) -> Result<()>;
    async fn terminate_instances(&self, region: &str, ids: &[String]) -> Result<()>;
}

/// Live AWS implementation, backed by `aws-sdk-ec2`. The heavy lifting of
/// translating SDK types is kept here so the rest of the crate only deals
/// in `Instance`.
pub struct AwsCloudApi {
    clients: tokio::sync::Mutex<HashMap<String, aws_sdk_ec2::Client>>,
    shared_config: aws_config::SdkConfig,
}

impl AwsCloudApi {
    pub async fn new() -> Self {
        let shared_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            clients: tokio::sync::Mutex::new(HashMap::new()),
            shared_config,
        }
    }

    async fn client_for(&self, region: &str) -> aws_sdk_ec2::Client {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(region) {
            return c.clone();
        }
        let config = aws_sdk_ec2::config::Builder::from(&self.shared_config)
            .region(aws_sdk_ec2::config::Region::new(region.to_string()))
            .build();
        let client = aws_sdk_ec2::Client::from_conf(config);
        clients.insert(region.to_string(), client.clone());
        client
    }
}

#[async_trait]
impl CloudApi for AwsCloudApi {
    async fn list_images(&self, region: &str, owner_id: &str) -> Result<Vec<(String, String, String)>> {
        let client = self.client_for(region).await;
        let resp = client
            .describe_images()
            .owners(owner_id)
            .send()
            .await
            .map_err(|e| OrchestratorError::Provision(e.to_string()))?;
        Ok(resp
            .images()
            .iter()
            .filter_map(|img| {
                let name = img.name()?.to_string();
                let id = img.image_id()?.to_string();
                let virt = img.virtualization_type()?.as_str().to_string();
                Some((name, id, virt))
            })
            .collect())
    }

    async fn list_instances(&self, region: &str, filters: &HashMap<String, String>) -> Result<Vec<Instance>> {
        let client = self.client_for(region).await;
        let mut request = client.describe_instances();
        for (key, value) in filters {
            request = request.filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name(format!("tag:{key}"))
                    .values(value)
                    .build(),
            );
        }
        let resp = request
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientApi {
                attempt: 1,
                max_attempts: 1,
                source: eyre::eyre!(e.to_string()),
            })?;

        let mut out = Vec::new();
        for reservation in resp.reservations() {
            for sdk_inst in reservation.instances() {
                out.push(sdk_instance_to_instance(sdk_inst, region));
            }
        }
        Ok(out)
    }

    async fn run_instances(
        &self,
        region: &str,
        ami_id: &str,
        count: usize,
        instance_type: &str,
        key_pair: &str,
        security_group: &str,
        user_data: Option<&str>,
    ) -> Result<Vec<Instance>> {
        let client = self.client_for(region).await;
        let mut request = client
            .run_instances()
            .image_id(ami_id)
            .min_count(count as i32)
            .max_count(count as i32)
            .key_name(key_pair)
            .security_groups(security_group)
            .instance_type(instance_type.into());
        if let Some(data) = user_data {
            request = request.user_data(data);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| OrchestratorError::Provision(e.to_string()))?;
        Ok(resp
            .instances()
            .iter()
            .map(|i| sdk_instance_to_instance(i, region))
            .collect())
    }

    async fn create_tags(&self, region: &str, ids: &[String], tags: &HashMap<String, String>) -> Result<()> {
        let client = self.client_for(region).await;
        let tag_specs: Vec<_> = tags
            .iter()
            .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
            .collect();
        client
            .create_tags()
            .set_resources(Some(ids.to_vec()))
            .set_tags(Some(tag_specs))
            .send()
            .await
            .map_err(|e| OrchestratorError::TransientApi {
                attempt: 1,
                max_attempts: 1,
                source: eyre::eyre!(e.to_string()),
            })?;
        Ok(())
    }

    async fn terminate_instances(&self, region: &str, ids: &[String]) -> Result<()> {
        let client = self.client_for(region).await;
        client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| OrchestratorError::Provision(e.to_string()))?;
        Ok(())
    }
}

fn sdk_instance_to_instance(i: &aws_sdk_ec2::types::Instance, region: &str) -> Instance {
    let tags: HashMap<String, String> = i
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect();
    let state = i
        .state()
        .and_then(|s| s.name())
        .map(|n| crate::instance::InstanceState::from_provider_str(n.as_str()))
        .unwrap_or(crate::instance::InstanceState::Other);
    let launch_time = i
        .launch_time()
        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
        .unwrap_or_else(Utc::now);
    Instance {
        provider_id: i.instance_id().unwrap_or_default().to_string(),
        region: region.to_string(),
        instance_type: i.instance_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
        ip_address: i.public_ip_address().map(|s| s.to_string()),
        private_ip_address: i.private_ip_address().map(|s| s.to_string()),
        state,
        launch_time,
        tags,
    }
}

/// Per-broker, multi-region instance cache. Mirrors `EC2Pool`.
pub struct InstancePool {
    settings: Settings,
    cloud: Box<dyn CloudApi>,
    /// AMI cache keyed by region (spec design note: relocated from a
    /// module-level global into the pool instance).
    ami_cache: HashMap<String, HashMap<Virtualization, String>>,
    /// Free instances per region, not currently assigned to any run.
    free: HashMap<String, Vec<Instance>>,
    /// Instances recovered from a prior process's run, keyed by
    /// `(run_id, collection_uuid)`, awaiting a matching `request_instances`.
    recovered: HashMap<(Uuid, Uuid), Vec<Instance>>,
}

/// A group of instances owned by one run, returned by `request_instances`.
pub struct Collection {
    pub run_id: Uuid,
    pub uuid: Uuid,
    pub region: String,
    pub instance_type: String,
    pub instances: Vec<Instance>,
}

impl InstancePool {
    pub fn new(settings: Settings, cloud: Box<dyn CloudApi>) -> Self {
        Self {
            settings,
            cloud,
            ami_cache: HashMap::new(),
            free: HashMap::new(),
            recovered: HashMap::new(),
        }
    }

    /// Resolves the latest stable AMI per region x virtualization type,
    /// then recovers any tagged survivors from a prior process.
    pub async fn initialize(&mut self) -> Result<()> {
        for region in self.settings.regions.clone() {
            debug!(region, "pulling stable AMI info");
            let images = self.cloud.list_images(&region, &self.settings.ami_owner_id).await?;
            let mut stable: Vec<_> = images.into_iter().filter(|(name, _, _)| name.contains("stable")).collect();
            stable.sort_by(|a, b| a.0.cmp(&b.0));
            // The last two highest-sorted names are the pvm and hvm AMIs.
            let chosen = stable.into_iter().rev().take(2);
            let mut by_virt = HashMap::new();
            for (_, id, virt) in chosen {
                let virt = if virt == "paravirtual" {
                    Virtualization::Paravirtual
                } else {
                    Virtualization::Hvm
                };
                by_virt.insert(virt, id);
            }
            self.ami_cache.insert(region, by_virt);
        }
        self.recover().await
    }

    /// Returns the AMI id to use for `instance_type` in `region`.
    pub fn get_ami(&self, region: &str, instance_type: &str) -> Result<&str> {
        let virt = virtualization_for(instance_type);
        self.ami_cache
            .get(region)
            .and_then(|by_virt| by_virt.get(&virt))
            .map(|s| s.as_str())
            .ok_or_else(|| OrchestratorError::MissingAmi {
                region: region.to_string(),
                virtualization: virt.as_str().to_string(),
            })
    }

    /// Lists each region's tagged instances and routes them to the free
    /// pool or the recovery bucket.
    pub async fn recover(&mut self) -> Result<()> {
        let filters: HashMap<String, String> = if self.settings.use_filters {
            HashMap::from([
                ("Name".to_string(), format!("loads-{}", self.settings.broker_id)),
                ("Project".to_string(), "loads".to_string()),
            ])
        } else {
            HashMap::new()
        };

        let mut total = 0;
        for region in self.settings.regions.clone() {
            let instances = self.cloud.list_instances(&region, &filters).await?;
            total += instances.len();
            for instance in instances {
                let now = Utc::now();
                if !available_instance(&instance, now) {
                    self.free.entry(region.clone()).or_default().push(instance);
                    continue;
                }
                match (instance.run_id_tag(), instance.uuid_tag()) {
                    (Some(run_id), Some(uuid)) => {
                        if let (Ok(run_id), Ok(uuid)) = (Uuid::parse_str(run_id), Uuid::parse_str(uuid)) {
                            self.recovered.entry((run_id, uuid)).or_default().push(instance);
                            continue;
                        }
                        self.free.entry(region.clone()).or_default().push(instance);
                    }
                    _ => self.free.entry(region.clone()).or_default().push(instance),
                }
            }
        }
        debug!(total, "recovered instances across all regions");
        Ok(())
    }

    fn locate_recovered_instances(&mut self, run_id: Uuid, uuid: Uuid) -> Vec<Instance> {
        self.recovered.remove(&(run_id, uuid)).unwrap_or_default()
    }

    /// Pulls up to `count` available, type-matching instances out of the
    /// region's free pool, leaving non-matches untouched.
    ///
    /// `original_source/loadsbroker/aws.py::_locate_existing_instances`
    /// compares `len(instances) > count` inside the accumulation loop
    /// and then slices the free list by `removed = len(instances) +
    /// len(remaining)`, which double-counts the boundary instance and can
    /// drop one unrelated instance from the pool. We preserve the
    /// observed intent -- never return more than `count` -- without
    /// replicating the off-by-one drop (documented in DESIGN.md).
    fn locate_existing_instances(&mut self, region: &str, count: usize, instance_type: &str) -> Vec<Instance> {
        let region_instances = self.free.remove(region).unwrap_or_default();
        let mut matched = Vec::new();
        let mut remaining = Vec::new();
        let now = Utc::now();

        for inst in region_instances {
            if matched.len() < count && available_instance(&inst, now) && inst.instance_type == instance_type {
                matched.push(inst);
            } else {
                remaining.push(inst);
            }
        }

        self.free.insert(region.to_string(), remaining);
        matched
    }

    /// Allocates a collection of instances, preferring recovered and
    /// pooled instances over fresh cloud allocation.
    pub async fn request_instances(
        &mut self,
        run_id: Uuid,
        uuid: Uuid,
        count: usize,
        instance_type: &str,
        region: &str,
    ) -> Result<Collection> {
        if !self.settings.is_known_region(region) {
            return Err(OrchestratorError::UnknownRegion(region.to_string()));
        }

        let mut instances = self.locate_recovered_instances(run_id, uuid);
        let remaining = count.saturating_sub(instances.len());
        instances.extend(self.locate_existing_instances(region, remaining, instance_type));

        let shortfall = count.saturating_sub(instances.len());
        if shortfall > 0 {
            let ami_id = self.get_ami(region, instance_type)?.to_string();
            let settings = self.settings.clone();
            let cloud = &self.cloud;
            let region_owned = region.to_string();
            let instance_type_owned = instance_type.to_string();
            let new_instances = retry_async(3, move |attempt| {
                let ami_id = ami_id.clone();
                let region_owned = region_owned.clone();
                let instance_type_owned = instance_type_owned.clone();
                let settings = settings.clone();
                async move {
                    cloud
                        .run_instances(
                            &region_owned,
                            &ami_id,
                            shortfall,
                            &instance_type_owned,
                            &settings.key_pair,
                            &settings.security_group,
                            settings.user_data.as_deref(),
                        )
                        .await
                        .map_err(|e| {
                            warn!(attempt, "run_instances failed");
                            e
                        })
                }
            })
            .await?;
            debug!(count = new_instances.len(), "allocated new instances");
            instances.extend(new_instances);
        }

        if self.settings.use_filters {
            let ids: Vec<String> = instances.iter().map(|i| i.provider_id.clone()).collect();
            let tags = HashMap::from([
                ("Name".to_string(), format!("loads-{}", self.settings.broker_id)),
                ("Project".to_string(), "loads".to_string()),
                ("RunId".to_string(), run_id.to_string()),
                ("Uuid".to_string(), uuid.to_string()),
            ]);
            self.cloud.create_tags(region, &ids, &tags).await?;
            for inst in &mut instances {
                for (k, v) in &tags {
                    inst.tags.insert(k.clone(), v.clone());
                }
            }
        }

        Ok(Collection {
            run_id,
            uuid,
            region: region.to_string(),
            instance_type: instance_type.to_string(),
            instances,
        })
    }

    /// Untags `RunId`/`Uuid` (emptying, not removing, the tags) and
    /// returns the collection's instances to the region's free pool.
    pub async fn release_instances(&mut self, collection: Collection) -> Result<()> {
        if collection.instances.is_empty() {
            return Ok(());
        }
        if self.settings.use_filters {
            let ids: Vec<String> = collection.instances.iter().map(|i| i.provider_id.clone()).collect();
            let tags = HashMap::from([("RunId".to_string(), String::new()), ("Uuid".to_string(), String::new())]);
            self.cloud.create_tags(&collection.region, &ids, &tags).await?;
        }
        let mut instances = collection.instances;
        for inst in &mut instances {
            inst.tags.insert("RunId".to_string(), String::new());
            inst.tags.insert("Uuid".to_string(), String::new());
        }
        self.free.entry(collection.region).or_default().extend(instances);
        Ok(())
    }

    /// Atomically swaps the free-pool map to empty and issues
    /// termination per region. Termination errors are logged but do not
    /// roll back the swap.
    pub async fn reap_instances(&mut self) {
        let all = std::mem::take(&mut self.free);
        for (region, instances) in all {
            if instances.is_empty() {
                continue;
            }
            let ids: Vec<String> = instances.iter().map(|i| i.provider_id.clone()).collect();
            if let Err(e) = self.cloud.terminate_instances(&region, &ids).await {
                warn!(region, error = ?e, "failed to terminate instances during reap");
            }
        }
    }

    /// Reaps idle free instances that have been idle beyond `max_idle`,
    /// used by `RunManager::_shutdown`. The free pool carries no idle
    /// timestamp of its own; we treat presence in the free pool at
    /// shutdown time as eligible once `max_idle` has elapsed since launch
    /// as a conservative proxy, matching the "max_idle" knob described in
    /// `original_source/loadsbroker/aws.py::EC2Pool.__init__` (the field
    /// exists there but `reap_instances` in the original simply reaps
    /// everything; a staleness threshold was implied by the `max_idle`
    /// parameter without a dedicated method).
    pub async fn reap_stale(&mut self, max_idle: Duration) {
        let now = Utc::now();
        let mut to_reap: HashMap<String, Vec<Instance>> = HashMap::new();
        for (region, instances) in self.free.iter_mut() {
            let mut remaining = Vec::new();
            for inst in instances.drain(..) {
                let idle = now - inst.launch_time;
                if idle > chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)) {
                    to_reap.entry(region.clone()).or_default().push(inst);
                } else {
                    remaining.push(inst);
                }
            }
            *instances = remaining;
        }
        for (region, instances) in to_reap {
            let ids: Vec<String> = instances.iter().map(|i| i.provider_id.clone()).collect();
            if let Err(e) = self.cloud.terminate_instances(&region, &ids).await {
                warn!(region, error = ?e, "failed to terminate stale instances");
            }
        }
    }

    #[cfg(test)]
    pub fn free_count(&self, region: &str) -> usize {
        self.free.get(region).map(|v| v.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn seed_recovered(&mut self, run_id: Uuid, uuid: Uuid, instances: Vec<Instance>) {
        self.recovered.insert((run_id, uuid), instances);
    }

    #[cfg(test)]
    pub fn seed_free(&mut self, region: &str, instances: Vec<Instance>) {
        self.free.entry(region.to_string()).or_default().extend(instances);
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeCloudApi;
    use super::*;

    fn settings() -> Settings {
        Settings {
            broker_id: "1234".into(),
            credentials: Default::default(),
            regions: vec!["us-west-2".to_string()],
            key_pair: "loads".into(),
            security_group: "loads".into(),
            user_data: None,
            use_filters: true,
            ami_owner_id: "595879546273".into(),
            max_idle: Duration::from_secs(600),
            ssh_user: "core".into(),
            ssh_key_path: "/keys/loads.pem".into(),
            heka: None,
            influx: None,
            watcher_aws_credentials: None,
        }
    }

    async fn pool() -> InstancePool {
        let mut pool = InstancePool::new(settings(), Box::new(FakeCloudApi::with_stable_images()));
        pool.initialize().await.unwrap();
        pool
    }

    // E1: empty pool provisions 3.
    #[tokio::test]
    async fn empty_pool_provisions_exactly_the_shortfall() {
        let mut pool = pool().await;
        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let collection = pool
            .request_instances(run_id, uuid, 3, "t1.micro", "us-west-2")
            .await
            .unwrap();
        assert_eq!(collection.instances.len(), 3);
        for inst in &collection.instances {
            assert_eq!(inst.tags.get("RunId").unwrap(), &run_id.to_string());
            assert_eq!(inst.tags.get("Uuid").unwrap(), &uuid.to_string());
        }
    }

    // E2: recovery preferred over allocation.
    #[tokio::test]
    async fn recovery_preferred_over_fresh_allocation() {
        let mut pool = pool().await;
        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let recovered = vec![
            Instance {
                provider_id: "i-rec1".into(),
                region: "us-west-2".into(),
                instance_type: "t1.micro".into(),
                ip_address: None,
                private_ip_address: None,
                state: crate::instance::InstanceState::Running,
                launch_time: Utc::now(),
                tags: HashMap::new(),
            },
            Instance {
                provider_id: "i-rec2".into(),
                region: "us-west-2".into(),
                instance_type: "t1.micro".into(),
                ip_address: None,
                private_ip_address: None,
                state: crate::instance::InstanceState::Running,
                launch_time: Utc::now(),
                tags: HashMap::new(),
            },
        ];
        pool.seed_recovered(run_id, uuid, recovered);

        let collection = pool
            .request_instances(run_id, uuid, 3, "t1.micro", "us-west-2")
            .await
            .unwrap();
        assert_eq!(collection.instances.len(), 3);
        let ids: Vec<_> = collection.instances.iter().map(|i| i.provider_id.as_str()).collect();
        assert!(ids.contains(&"i-rec1"));
        assert!(ids.contains(&"i-rec2"));
    }

    // E3: type mismatch leaves non-matching instance in the pool.
    #[tokio::test]
    async fn type_mismatch_leaves_other_instance_pooled() {
        let mut pool = pool().await;
        pool.seed_free(
            "us-west-2",
            vec![Instance {
                provider_id: "i-small".into(),
                region: "us-west-2".into(),
                instance_type: "m1.small".into(),
                ip_address: None,
                private_ip_address: None,
                state: crate::instance::InstanceState::Running,
                launch_time: Utc::now(),
                tags: HashMap::new(),
            }],
        );

        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let collection = pool
            .request_instances(run_id, uuid, 1, "t1.micro", "us-west-2")
            .await
            .unwrap();
        assert_eq!(collection.instances.len(), 1);
        assert_eq!(collection.instances[0].instance_type, "t1.micro");
        assert_eq!(pool.free_count("us-west-2"), 1);
    }

    #[tokio::test]
    async fn unknown_region_is_rejected() {
        let mut pool = pool().await;
        let err = pool
            .request_instances(Uuid::new_v4(), Uuid::new_v4(), 1, "t1.micro", "eu-west-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownRegion(_)));
    }

    #[tokio::test]
    async fn release_instances_clears_run_tags() {
        let mut pool = pool().await;
        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let collection = pool
            .request_instances(run_id, uuid, 2, "t1.micro", "us-west-2")
            .await
            .unwrap();
        pool.release_instances(collection).await.unwrap();
        assert_eq!(pool.free_count("us-west-2"), 2);
    }

    // E4: a pending instance stalled beyond 2 minutes is routed to the
    // free pool by `recover`, then reaped by `reap_instances`.
    #[tokio::test]
    async fn recover_routes_stalled_pending_to_free_pool() {
        let cloud = FakeCloudApi::with_stable_images();
        cloud
            .seed_listed(
                "us-west-2",
                vec![Instance {
                    provider_id: "i-stalled".into(),
                    region: "us-west-2".into(),
                    instance_type: "t1.micro".into(),
                    ip_address: None,
                    private_ip_address: None,
                    state: crate::instance::InstanceState::Pending,
                    launch_time: Utc::now() - chrono::Duration::minutes(3),
                    tags: HashMap::new(),
                }],
            )
            .await;
        let mut pool = InstancePool::new(settings(), Box::new(cloud));
        pool.initialize().await.unwrap();

        assert_eq!(pool.free_count("us-west-2"), 1);
        pool.reap_instances().await;
        assert_eq!(pool.free_count("us-west-2"), 0);
    }

    // Testable property 2: recovery completeness. An instance listed with
    // a matching (RunId, Uuid) tag and a running state is handed back by
    // a subsequent `request_instances` rather than provisioned anew.
    #[tokio::test]
    async fn recover_then_request_returns_tagged_survivor_without_provisioning() {
        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let cloud = FakeCloudApi::with_stable_images();
        cloud
            .seed_listed(
                "us-west-2",
                vec![Instance {
                    provider_id: "i-survivor".into(),
                    region: "us-west-2".into(),
                    instance_type: "t1.micro".into(),
                    ip_address: Some("10.0.0.9".into()),
                    private_ip_address: Some("192.168.0.9".into()),
                    state: crate::instance::InstanceState::Running,
                    launch_time: Utc::now(),
                    tags: HashMap::from([
                        ("RunId".to_string(), run_id.to_string()),
                        ("Uuid".to_string(), uuid.to_string()),
                    ]),
                }],
            )
            .await;
        let mut pool = InstancePool::new(settings(), Box::new(cloud));
        pool.initialize().await.unwrap();

        // Recovered, not free: nothing to allocate from the region yet.
        assert_eq!(pool.free_count("us-west-2"), 0);

        let collection = pool.request_instances(run_id, uuid, 1, "t1.micro", "us-west-2").await.unwrap();
        assert_eq!(collection.instances.len(), 1);
        assert_eq!(collection.instances[0].provider_id, "i-survivor");
    }

    // Instances with a RunId/Uuid tag pair but stalled-pending state go
    // to the free pool, not the recovery bucket -- they're not usable by
    // anyone until they're either reaped or they recover on their own.
    #[tokio::test]
    async fn recover_prefers_staleness_over_recovery_tagging() {
        let run_id = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let cloud = FakeCloudApi::with_stable_images();
        cloud
            .seed_listed(
                "us-west-2",
                vec![Instance {
                    provider_id: "i-stalled-tagged".into(),
                    region: "us-west-2".into(),
                    instance_type: "t1.micro".into(),
                    ip_address: None,
                    private_ip_address: None,
                    state: crate::instance::InstanceState::Pending,
                    launch_time: Utc::now() - chrono::Duration::minutes(5),
                    tags: HashMap::from([
                        ("RunId".to_string(), run_id.to_string()),
                        ("Uuid".to_string(), uuid.to_string()),
                    ]),
                }],
            )
            .await;
        let mut pool = InstancePool::new(settings(), Box::new(cloud));
        pool.initialize().await.unwrap();
        assert_eq!(pool.free_count("us-west-2"), 1);
    }

    #[test]
    fn ami_selection_errors_when_missing() {
        let pool = InstancePool::new(settings(), Box::new(FakeCloudApi::default()));
        let err = pool.get_ami("us-west-2", "t1.micro").unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingAmi { .. }));
    }
}
