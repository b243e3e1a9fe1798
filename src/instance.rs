// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cloud VM representation and the AMI-selection / availability rules
//! from `original_source/loadsbroker/aws.py`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    Terminated,
    Other,
}

impl InstanceState {
    pub fn from_provider_str(s: &str) -> Self {
        match s {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "terminated" | "shutting-down" | "stopped" | "stopping" => InstanceState::Terminated,
            _ => InstanceState::Other,
        }
    }
}

/// A cloud VM, owned by exactly one of: the free pool, a collection, or a
/// recovery bucket (spec section 3, invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub provider_id: String,
    pub region: String,
    pub instance_type: String,
    pub ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub state: InstanceState,
    pub launch_time: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

impl Instance {
    pub fn run_id_tag(&self) -> Option<&str> {
        self.tags.get("RunId").map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    pub fn uuid_tag(&self) -> Option<&str> {
        self.tags.get("Uuid").map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    pub fn ssh_address(&self) -> Option<String> {
        self.ip_address.as_ref().map(|ip| format!("{ip}:22"))
    }

    pub fn docker_host(&self) -> String {
        match &self.ip_address {
            // Loopback fallback for instances whose provider IP isn't
            // known yet (e.g. unit tests against a local daemon).
            Some(ip) => format!("tcp://{ip}:2375"),
            None => "tcp://127.0.0.1:2375".to_string(),
        }
    }
}

/// Returns `true` iff `state = running`, or `state = pending` and
/// `now - launch_time < 2 min`. Pending beyond 2 minutes is perpetually
/// stalled (spec section 4.4, property 8).
pub fn available_instance(instance: &Instance, now: DateTime<Utc>) -> bool {
    match instance.state {
        InstanceState::Running => true,
        InstanceState::Pending => now - instance.launch_time < ChronoDuration::minutes(2),
        _ => false,
    }
}

/// Instance-type family prefixes that require the paravirtual AMI
/// variant; everything else uses HVM (spec section 4.4, property 7).
const PARAVIRTUAL_FAMILIES: &[&str] = &["m1", "m2", "c1", "t1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Virtualization {
    Paravirtual,
    Hvm,
}

impl Virtualization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Virtualization::Paravirtual => "paravirtual",
            Virtualization::Hvm => "hvm",
        }
    }
}

/// Which AMI virtualization type a given instance type requires.
pub fn virtualization_for(instance_type: &str) -> Virtualization {
    let family = &instance_type.get(..2).unwrap_or("");
    if PARAVIRTUAL_FAMILIES.contains(family) {
        Virtualization::Paravirtual
    } else {
        Virtualization::Hvm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(state: InstanceState, launch_time: DateTime<Utc>) -> Instance {
        Instance {
            provider_id: "i-1".into(),
            region: "us-west-2".into(),
            instance_type: "t1.micro".into(),
            ip_address: None,
            private_ip_address: None,
            state,
            launch_time,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn running_is_always_available() {
        assert!(available_instance(&inst(InstanceState::Running, Utc::now()), Utc::now()));
    }

    #[test]
    fn pending_under_two_minutes_is_available() {
        let now = Utc::now();
        let i = inst(InstanceState::Pending, now - ChronoDuration::seconds(119));
        assert!(available_instance(&i, now));
    }

    #[test]
    fn pending_over_two_minutes_is_stalled() {
        let now = Utc::now();
        let i = inst(InstanceState::Pending, now - ChronoDuration::minutes(3));
        assert!(!available_instance(&i, now));
    }

    #[test]
    fn terminated_is_never_available() {
        assert!(!available_instance(&inst(InstanceState::Terminated, Utc::now()), Utc::now()));
    }

    #[test]
    fn virtualization_selection() {
        assert_eq!(virtualization_for("t1.micro"), Virtualization::Paravirtual);
        assert_eq!(virtualization_for("m1.small"), Virtualization::Paravirtual);
        assert_eq!(virtualization_for("c1.medium"), Virtualization::Paravirtual);
        assert_eq!(virtualization_for("m3.large"), Virtualization::Hvm);
        assert_eq!(virtualization_for("t2.micro"), Virtualization::Hvm);
    }
}
