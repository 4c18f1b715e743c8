//! In-memory PublixStore implementation.
//!
//! All tables live behind one lock so that `apply` is atomic; reads hand out
//! clones.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::Deserialize;

use crate::error::StoreError;
use crate::identity::{
    BatchId, ComponentId, ComponentRunId, GroupId, RunId, StudyId, WorkerId,
};
use crate::models::{Batch, Component, ComponentRun, Group, GroupState, Run, Study, Worker};
use crate::store::{ChangeSet, EntityKind, PublixStore};

/// Static records an in-memory store is bootstrapped from (studies,
/// components, batches and pre-provisioned workers such as operator
/// previews).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub studies: Vec<Study>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub batches: Vec<Batch>,
    #[serde(default)]
    pub workers: Vec<Worker>,
}

impl StoreSeed {
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Backend(format!("invalid seed: {}", e)))
    }
}

#[derive(Default)]
struct Tables {
    workers: BTreeMap<WorkerId, Worker>,
    batches: BTreeMap<BatchId, Batch>,
    studies: BTreeMap<StudyId, Study>,
    components: BTreeMap<ComponentId, Component>,
    runs: BTreeMap<RunId, Run>,
    component_runs: BTreeMap<ComponentRunId, ComponentRun>,
    groups: BTreeMap<GroupId, Group>,
    /// Last id handed out per entity family.
    counters: HashMap<EntityKind, u64>,
}

impl Tables {
    fn check(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        for component_run in &changes.component_runs {
            let known = self.runs.contains_key(&component_run.run_id)
                || changes.runs.iter().any(|r| r.id == component_run.run_id);
            if !known {
                return Err(StoreError::Conflict(format!(
                    "component run {} references unknown run {}",
                    component_run.id, component_run.run_id
                )));
            }
        }
        for run in &changes.runs {
            let known = self.workers.contains_key(&run.worker_id)
                || changes.workers.iter().any(|w| w.id == run.worker_id);
            if !known {
                return Err(StoreError::Conflict(format!(
                    "run {} references unknown worker {}",
                    run.id, run.worker_id
                )));
            }
        }
        Ok(())
    }

    fn bump(&mut self, kind: EntityKind, id: u64) {
        let counter = self.counters.entry(kind).or_insert(0);
        if id > *counter {
            *counter = id;
        }
    }
}

/// In-memory store: ids are allocated per entity family, starting after the
/// highest seeded id.
pub struct InMemoryPublixStore {
    tables: RwLock<Tables>,
}

impl InMemoryPublixStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let mut tables = Tables::default();
        for study in seed.studies {
            tables.bump(EntityKind::Study, study.id);
            tables.studies.insert(study.id, study);
        }
        for component in seed.components {
            tables.bump(EntityKind::Component, component.id);
            tables.components.insert(component.id, component);
        }
        for batch in seed.batches {
            tables.bump(EntityKind::Batch, batch.id);
            tables.batches.insert(batch.id, batch);
        }
        for worker in seed.workers {
            tables.bump(EntityKind::Worker, worker.id);
            tables.workers.insert(worker.id, worker);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(f(&tables))
    }
}

impl Default for InMemoryPublixStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PublixStore for InMemoryPublixStore {
    fn find_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        self.read(|t| t.workers.get(&id).cloned())
    }

    fn find_worker_by_platform_id(
        &self,
        platform_worker_id: &str,
    ) -> Result<Option<Worker>, StoreError> {
        self.read(|t| {
            t.workers
                .values()
                .find(|w| w.platform_worker_id.as_deref() == Some(platform_worker_id))
                .cloned()
        })
    }

    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        self.read(|t| t.batches.get(&id).cloned())
    }

    fn find_study(&self, id: StudyId) -> Result<Option<Study>, StoreError> {
        self.read(|t| t.studies.get(&id).cloned())
    }

    fn find_component(&self, id: ComponentId) -> Result<Option<Component>, StoreError> {
        self.read(|t| t.components.get(&id).cloned())
    }

    fn find_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        self.read(|t| t.runs.get(&id).cloned())
    }

    fn find_component_run(&self, id: ComponentRunId) -> Result<Option<ComponentRun>, StoreError> {
        self.read(|t| t.component_runs.get(&id).cloned())
    }

    fn find_group(&self, id: GroupId) -> Result<Option<Group>, StoreError> {
        self.read(|t| t.groups.get(&id).cloned())
    }

    fn list_runs_for_worker(&self, worker_id: WorkerId) -> Result<Vec<Run>, StoreError> {
        self.read(|t| {
            t.runs
                .values()
                .filter(|r| r.worker_id == worker_id)
                .cloned()
                .collect()
        })
    }

    fn list_component_runs(&self, run_id: RunId) -> Result<Vec<ComponentRun>, StoreError> {
        self.read(|t| {
            let mut out: Vec<ComponentRun> = t
                .component_runs
                .values()
                .filter(|c| c.run_id == run_id)
                .cloned()
                .collect();
            out.sort_by_key(|c| c.seq);
            out
        })
    }

    fn find_first_incomplete_group(&self, study_id: StudyId) -> Result<Option<Group>, StoreError> {
        self.read(|t| {
            t.groups
                .values()
                .find(|g| g.study_id == study_id && g.state == GroupState::Incomplete)
                .cloned()
        })
    }

    fn next_id(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let counter = tables.counters.entry(kind).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tables.check(&changes)?;
        for worker in changes.workers {
            tables.bump(EntityKind::Worker, worker.id);
            tables.workers.insert(worker.id, worker);
        }
        for batch in changes.batches {
            tables.bump(EntityKind::Batch, batch.id);
            tables.batches.insert(batch.id, batch);
        }
        for run in changes.runs {
            tables.bump(EntityKind::Run, run.id);
            tables.runs.insert(run.id, run);
        }
        for component_run in changes.component_runs {
            tables.bump(EntityKind::ComponentRun, component_run.id);
            tables.component_runs.insert(component_run.id, component_run);
        }
        for group in changes.groups {
            tables.bump(EntityKind::Group, group.id);
            tables.groups.insert(group.id, group);
        }
        for group_id in changes.removed_groups {
            tables.groups.remove(&group_id);
        }
        Ok(())
    }
}
