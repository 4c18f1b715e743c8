//! Persistence façade for the study-execution engine.

use crate::error::StoreError;
use crate::identity::{
    BatchId, ComponentId, ComponentRunId, GroupId, RunId, StudyId, WorkerId,
};
use crate::models::{Batch, Component, ComponentRun, Group, Run, Study, Worker};

/// Entity families with their own id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Worker,
    Batch,
    Study,
    Component,
    Run,
    ComponentRun,
    Group,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Worker => "worker",
            EntityKind::Batch => "batch",
            EntityKind::Study => "study",
            EntityKind::Component => "component",
            EntityKind::Run => "run",
            EntityKind::ComponentRun => "component run",
            EntityKind::Group => "group",
        };
        f.write_str(name)
    }
}

/// Records to upsert (and groups to delete) in one atomic commit.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub workers: Vec<Worker>,
    pub batches: Vec<Batch>,
    pub runs: Vec<Run>,
    pub component_runs: Vec<ComponentRun>,
    pub groups: Vec<Group>,
    pub removed_groups: Vec<GroupId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(mut self, worker: Worker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn batch(mut self, batch: Batch) -> Self {
        self.batches.push(batch);
        self
    }

    pub fn run(mut self, run: Run) -> Self {
        self.runs.push(run);
        self
    }

    pub fn component_run(mut self, component_run: ComponentRun) -> Self {
        self.component_runs.push(component_run);
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    pub fn remove_group(mut self, group_id: GroupId) -> Self {
        self.removed_groups.push(group_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
            && self.batches.is_empty()
            && self.runs.is_empty()
            && self.component_runs.is_empty()
            && self.groups.is_empty()
            && self.removed_groups.is_empty()
    }
}

/// Store contract used by the run state machine, the group coordinator and
/// the result sink.
///
/// Implementations must make `apply` all-or-nothing: either every record in
/// the change set becomes visible or none does. Reads return owned snapshots;
/// callers serialize read-modify-write cycles themselves.
pub trait PublixStore: Send + Sync {
    fn find_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError>;

    /// Lookup of platform-bound workers by their marketplace identity.
    fn find_worker_by_platform_id(
        &self,
        platform_worker_id: &str,
    ) -> Result<Option<Worker>, StoreError>;

    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    fn find_study(&self, id: StudyId) -> Result<Option<Study>, StoreError>;

    fn find_component(&self, id: ComponentId) -> Result<Option<Component>, StoreError>;

    fn find_run(&self, id: RunId) -> Result<Option<Run>, StoreError>;

    fn find_component_run(&self, id: ComponentRunId) -> Result<Option<ComponentRun>, StoreError>;

    fn find_group(&self, id: GroupId) -> Result<Option<Group>, StoreError>;

    /// Runs of a worker in creation order.
    fn list_runs_for_worker(&self, worker_id: WorkerId) -> Result<Vec<Run>, StoreError>;

    /// Component-runs of a run ordered by `seq`.
    fn list_component_runs(&self, run_id: RunId) -> Result<Vec<ComponentRun>, StoreError>;

    /// Oldest group of the study that still has a free seat.
    fn find_first_incomplete_group(&self, study_id: StudyId) -> Result<Option<Group>, StoreError>;

    /// Allocates a fresh id for the given entity family.
    fn next_id(&self, kind: EntityKind) -> Result<u64, StoreError>;

    /// Atomically commits a change set.
    fn apply(&self, changes: ChangeSet) -> Result<(), StoreError>;

    fn update_run(&self, run: Run) -> Result<(), StoreError> {
        self.apply(ChangeSet::new().run(run))
    }

    fn update_component_run(&self, component_run: ComponentRun) -> Result<(), StoreError> {
        self.apply(ChangeSet::new().component_run(component_run))
    }

    fn update_group(&self, group: Group) -> Result<(), StoreError> {
        self.apply(ChangeSet::new().group(group))
    }

    fn remove_group(&self, group_id: GroupId) -> Result<(), StoreError> {
        self.apply(ChangeSet::new().remove_group(group_id))
    }

    fn require_run(&self, id: RunId) -> Result<Run, StoreError> {
        self.find_run(id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Run, id))
    }

    fn require_study(&self, id: StudyId) -> Result<Study, StoreError> {
        self.find_study(id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Study, id))
    }

    fn require_worker(&self, id: WorkerId) -> Result<Worker, StoreError> {
        self.find_worker(id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Worker, id))
    }
}
