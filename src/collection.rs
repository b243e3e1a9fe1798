// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory association of a set of instances with `(run_id,
//! collection_uuid)` plus a per-instance mutable state bag, and the
//! fan-out `map`/`execute` primitives extensions are built on (C5).
//!
//! Grounded on `EC2Collection` in `original_source/loadsbroker/aws.py`
//! and the `collection.map`/`collection.execute` calls throughout
//! `original_source/loadsbroker/extensions.py`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::container_runtime::ContainerRuntime;
use crate::instance::{Instance, InstanceState};

/// Per-instance scratch record extensions attach data to. A typed record
/// replaces the duck-typed attribute attachment of the original
/// `state.docker` / `state.dns_server` / `state.nonresponsive` pattern
/// (spec design note 9).
#[derive(Default, Clone)]
pub struct InstanceStateBag {
    /// Set once by `docker_bootstrap::setup_collection`; `None` until then.
    pub docker: Option<Arc<Mutex<ContainerRuntime>>>,
    pub dns_server_ip: Option<String>,
    pub nonresponsive: bool,
    pub last_response_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl std::fmt::Debug for InstanceStateBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStateBag")
            .field("docker_attached", &self.docker.is_some())
            .field("dns_server_ip", &self.dns_server_ip)
            .field("nonresponsive", &self.nonresponsive)
            .field("last_response_at", &self.last_response_at)
            .finish()
    }
}

/// One instance plus its mutable state, shared via `Arc<RwLock<_>>` so
/// fan-out closures can mutate it concurrently without taking the whole
/// collection lock.
pub struct Member {
    pub instance: Instance,
    pub state: Arc<RwLock<InstanceStateBag>>,
}

/// The outcome of one `fn(inst)` invocation inside a fan-out. Failures are
/// captured here rather than aborting siblings (spec section 4.5 /
/// testable property 6).
pub enum MapOutcome<T> {
    Ok(T),
    Err(String),
}

/// Group of instances owned by one run (C5).
pub struct InstanceCollection {
    pub run_id: Uuid,
    pub uuid: Uuid,
    members: Vec<Member>,
}

impl InstanceCollection {
    pub fn new(run_id: Uuid, uuid: Uuid, instances: Vec<Instance>) -> Self {
        let members = instances
            .into_iter()
            .map(|instance| Member {
                instance,
                state: Arc::new(RwLock::new(InstanceStateBag::default())),
            })
            .collect();
        Self { run_id, uuid, members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Instances not marked `nonresponsive` and whose cloud state is
    /// `running`.
    pub async fn running_instances(&self) -> Vec<&Member> {
        let mut out = Vec::new();
        for m in &self.members {
            let state = m.state.read().await;
            if !state.nonresponsive && m.instance.state == InstanceState::Running {
                out.push(m);
            }
        }
        out
    }

    /// Instances whose state bag does not have `nonresponsive = true`.
    pub async fn live_members(&self) -> Vec<&Member> {
        let mut out = Vec::new();
        for m in &self.members {
            if !m.state.read().await.nonresponsive {
                out.push(m);
            }
        }
        out
    }

    /// `true` once every member is either removed or marked
    /// `nonresponsive` -- the collection has no live instance left to
    /// drive the workload (spec section 7, `GroupExhausted`).
    pub async fn is_drained(&self) -> bool {
        self.live_members().await.is_empty()
    }

    /// Removes the given instances (by provider id) from the collection;
    /// they are not returned to the pool here, only dropped from further
    /// fan-out and recorded for the caller to reap later.
    pub fn remove_instances(&mut self, provider_ids: &[String]) -> Vec<Member> {
        let (kept, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.members)
            .into_iter()
            .partition(|m| !provider_ids.contains(&m.instance.provider_id));
        self.members = kept;
        gone
    }

    /// Applies `op` to every live instance concurrently. When `delay >
    /// 0`, successive invocations are spaced by `delay` (a scheduled-tick
    /// primitive, not a per-task sleep, so fairness is preserved: we stay
    /// on one logical timeline rather than each task sleeping
    /// independently). Failures are caught, logged, and returned as
    /// `MapOutcome::Err` rather than aborting peers.
    pub async fn map<T, F, Fut>(&self, op: F, delay: Duration) -> Vec<MapOutcome<T>>
    where
        F: Fn(Instance, Arc<RwLock<InstanceStateBag>>) -> Fut + Clone,
        Fut: Future<Output = Result<T, String>>,
        T: Send + 'static,
    {
        let live = self.live_members().await;
        let mut handles = Vec::with_capacity(live.len());

        for (i, member) in live.into_iter().enumerate() {
            if delay > Duration::ZERO && i > 0 {
                tokio::time::sleep(delay).await;
            }
            let instance = member.instance.clone();
            let state = member.state.clone();
            let op = op.clone();
            handles.push(tokio::spawn(async move { op(instance, state).await }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(v)) => results.push(MapOutcome::Ok(v)),
                Ok(Err(e)) => {
                    debug!(error = %e, "fan-out operation failed for instance");
                    results.push(MapOutcome::Err(e));
                }
                Err(join_err) => {
                    debug!(error = %join_err, "fan-out task panicked");
                    results.push(MapOutcome::Err(join_err.to_string()));
                }
            }
        }
        results
    }

    /// Single-instance variant used when the caller already knows the
    /// target (by provider id).
    pub async fn execute<T, F, Fut>(&self, provider_id: &str, op: F) -> Option<MapOutcome<T>>
    where
        F: FnOnce(Instance, Arc<RwLock<InstanceStateBag>>) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let member = self.members.iter().find(|m| m.instance.provider_id == provider_id)?;
        let instance = member.instance.clone();
        let state = member.state.clone();
        match op(instance, state).await {
            Ok(v) => Some(MapOutcome::Ok(v)),
            Err(e) => Some(MapOutcome::Err(e)),
        }
    }

    /// Cooperative sleep, used between fan-out rounds (e.g. polling
    /// loops in `wait_until_ready`).
    pub async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    pub async fn mark_nonresponsive(&self, provider_id: &str) {
        if let Some(m) = self.members.iter().find(|m| m.instance.provider_id == provider_id) {
            m.state.write().await.nonresponsive = true;
        }
    }
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        Instance {
            provider_id: self.provider_id.clone(),
            region: self.region.clone(),
            instance_type: self.instance_type.clone(),
            ip_address: self.ip_address.clone(),
            private_ip_address: self.private_ip_address.clone(),
            state: self.state,
            launch_time: self.launch_time,
            tags: self.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance(id: &str) -> Instance {
        Instance {
            provider_id: id.to_string(),
            region: "us-west-2".into(),
            instance_type: "t1.micro".into(),
            ip_address: Some("10.0.0.1".into()),
            private_ip_address: Some("192.168.0.1".into()),
            state: InstanceState::Running,
            launch_time: chrono::Utc::now(),
            tags: Map::new(),
        }
    }

    // Testable property 6: fan-out isolation.
    #[tokio::test]
    async fn map_isolates_failures_and_preserves_count() {
        let collection = InstanceCollection::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![instance("i-1"), instance("i-2"), instance("i-3")],
        );

        let results = collection
            .map(
                |inst, _state| async move {
                    if inst.provider_id == "i-2" {
                        Err("boom".to_string())
                    } else {
                        Ok(inst.provider_id)
                    }
                },
                Duration::ZERO,
            )
            .await;

        assert_eq!(results.len(), 3);
        let ok_count = results.iter().filter(|r| matches!(r, MapOutcome::Ok(_))).count();
        let err_count = results.iter().filter(|r| matches!(r, MapOutcome::Err(_))).count();
        assert_eq!(ok_count, 2);
        assert_eq!(err_count, 1);
    }

    #[tokio::test]
    async fn map_skips_nonresponsive_instances() {
        let collection = InstanceCollection::new(Uuid::new_v4(), Uuid::new_v4(), vec![instance("i-1"), instance("i-2")]);
        collection.mark_nonresponsive("i-1").await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let results = collection
            .map(
                move |_inst, _state| {
                    let calls = calls2.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), String>(())
                    }
                },
                Duration::ZERO,
            )
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn is_drained_once_every_member_is_nonresponsive() {
        let collection = InstanceCollection::new(Uuid::new_v4(), Uuid::new_v4(), vec![instance("i-1"), instance("i-2")]);
        assert!(!collection.is_drained().await);
        collection.mark_nonresponsive("i-1").await;
        assert!(!collection.is_drained().await);
        collection.mark_nonresponsive("i-2").await;
        assert!(collection.is_drained().await);
    }

    #[tokio::test]
    async fn remove_instances_drops_from_collection() {
        let mut collection =
            InstanceCollection::new(Uuid::new_v4(), Uuid::new_v4(), vec![instance("i-1"), instance("i-2")]);
        let removed = collection.remove_instances(&["i-1".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(collection.len(), 1);
    }
}
