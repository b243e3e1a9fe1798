// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data model (spec section 3), independent of any persistence or
//! wire format. Grounded on `original_source/loadsbroker/db.py`
//! (`Strategy`, `ContainerSet`, `Run`, `RunningContainerSet`); names are
//! adapted to spec.md's vocabulary (`Plan`, `ContainerGroup`,
//! `RunningGroup`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One homogeneous batch of instances running one container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerGroup {
    pub name: String,
    pub region: String,
    pub instance_type: String,
    pub instance_count: usize,
    pub container_image: String,
    pub container_image_url: Option<String>,
    /// Newline-delimited `KEY=VALUE` pairs, interpolated at run time.
    pub environment: String,
    /// Interpolated at run time.
    pub command_args: String,
    pub volume_mappings: String,
    pub port_mappings: String,
    pub run_delay_secs: u64,
    pub run_max_time_secs: u64,
    pub dns_name: Option<String>,
    pub metric_series: Option<String>,
}

/// An immutable description of one or more groups of container workloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: Uuid,
    pub name: String,
    pub container_groups: Vec<ContainerGroup>,
}

/// Run lifecycle state (spec section 6: persisted as an integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RunState {
    Initializing = 0,
    Running = 1,
    Terminating = 2,
    Completed = 3,
}

/// Links a Run to a ContainerGroup with per-execution timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningGroup {
    pub container_group_index: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunningGroup {
    pub fn new(container_group_index: usize, now: DateTime<Utc>) -> Self {
        Self {
            container_group_index,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// `now >= run.started_at + group.run_delay`.
    pub fn should_start(&self, run_started_at: DateTime<Utc>, run_delay_secs: u64, now: DateTime<Utc>) -> bool {
        self.started_at.is_none() && now >= run_started_at + chrono::Duration::seconds(run_delay_secs as i64)
    }

    /// `now >= self.started_at + group.run_max_time`.
    pub fn should_stop(&self, run_max_time_secs: u64, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) if self.completed_at.is_none() => {
                now >= started + chrono::Duration::seconds(run_max_time_secs as i64)
            }
            _ => false,
        }
    }

    /// Marks the group started; a no-op if already started (monotonic
    /// transition, invariant 3 in spec section 3).
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Marks the group completed; once set, never cleared.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One execution of a Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub uuid: Uuid,
    pub plan_uuid: Uuid,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub running_groups: Vec<RunningGroup>,
    /// Extra key/value bindings merged into every group's substitution
    /// environment (`RunManager.run_env` in the original implementation).
    pub run_env: HashMap<String, String>,
}

impl Run {
    pub fn new(plan: &Plan, now: DateTime<Utc>) -> Self {
        let running_groups = (0..plan.container_groups.len())
            .map(|i| RunningGroup::new(i, now))
            .collect();
        Self {
            uuid: Uuid::new_v4(),
            plan_uuid: plan.uuid,
            state: RunState::Initializing,
            created_at: now,
            started_at: None,
            completed_at: None,
            aborted: false,
            running_groups,
            run_env: HashMap::new(),
        }
    }

    pub fn all_groups_completed(&self) -> bool {
        self.running_groups.iter().all(RunningGroup::is_completed)
    }
}
