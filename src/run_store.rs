// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence port for run/group state (spec section 3: "Supplemented
//! features"). The original system persists `Run`/`RunningContainerSet`
//! rows through SQLAlchemy (`original_source/loadsbroker/db.py`); the
//! SQL ORM layer itself is explicitly out of scope here, but the
//! orchestrator still needs *somewhere* to durably record run and group
//! state across ticks so a crash mid-run doesn't lose track of what was
//! already started. `RunStore` is that seam: a trait the core depends
//! on, with an in-memory implementation for tests and single-process
//! use, leaving a real SQL-backed implementation to the binary crate
//! that wires this orchestrator up to a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Run, RunState};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, run_uuid: Uuid) -> Result<Option<Run>>;
    async fn set_state(&self, run_uuid: Uuid, state: RunState) -> Result<()>;
    async fn all_runs(&self) -> Result<Vec<Run>>;
    async fn delete_run(&self, run_uuid: Uuid) -> Result<()>;
}

/// Process-local store backed by a `Mutex<HashMap>`. Sufficient for
/// tests and for a single-broker deployment that tolerates losing state
/// across restarts; a durable implementation plugs into the same trait.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<Uuid, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs.lock().unwrap().insert(run.uuid, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_uuid: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.lock().unwrap().get(&run_uuid).cloned())
    }

    async fn set_state(&self, run_uuid: Uuid, state: RunState) -> Result<()> {
        if let Some(run) = self.runs.lock().unwrap().get_mut(&run_uuid) {
            run.state = state;
        }
        Ok(())
    }

    async fn all_runs(&self) -> Result<Vec<Run>> {
        Ok(self.runs.lock().unwrap().values().cloned().collect())
    }

    async fn delete_run(&self, run_uuid: Uuid) -> Result<()> {
        self.runs.lock().unwrap().remove(&run_uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Plan;
    use uuid::Uuid;

    fn plan() -> Plan {
        Plan { uuid: Uuid::new_v4(), name: "smoke".into(), container_groups: Vec::new() }
    }

    #[tokio::test]
    async fn round_trips_run_state() {
        let store = InMemoryRunStore::new();
        let run = Run::new(&plan(), chrono::Utc::now());
        store.save_run(&run).await.unwrap();

        store.set_state(run.uuid, RunState::Running).await.unwrap();
        let loaded = store.load_run(run.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Running);
    }

    #[tokio::test]
    async fn delete_removes_run() {
        let store = InMemoryRunStore::new();
        let run = Run::new(&plan(), chrono::Utc::now());
        store.save_run(&run).await.unwrap();
        store.delete_run(run.uuid).await.unwrap();
        assert!(store.load_run(run.uuid).await.unwrap().is_none());
    }
}
