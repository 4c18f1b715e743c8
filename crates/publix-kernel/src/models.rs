//! Entity records for the study-execution engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{
    BatchId, ComponentId, ComponentRunId, GroupId, RunId, Seq, StudyId, WorkerId,
};

/// Kind of participant identity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Open link, one run per browser.
    AnonymousSingle,
    /// Open link, any number of runs.
    AnonymousRepeatable,
    /// Invitation-bound, one run.
    PersonalSingle,
    /// Invitation-bound, any number of runs.
    PersonalMultiple,
    /// Crowd-sourcing platform worker (live marketplace).
    Platform,
    /// Crowd-sourcing platform worker coming from the platform's sandbox.
    PlatformSandbox,
    /// Operator preview; pre-provisioned, never created on first contact.
    Preview,
}

/// Static capability table consulted by authorization and flow policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerCapabilities {
    /// A second attempt at the same study is rejected.
    pub single_run: bool,
    /// May start a run in `PRE` state and repeat the first component.
    pub preview_capable: bool,
    /// Identity is owned by an external crowd-sourcing platform.
    pub platform_bound: bool,
    /// Operator identity; bypasses batch admission.
    pub operator: bool,
    /// Honors a study's strictly-forward navigation flag.
    pub linear_flow: bool,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 7] = [
        WorkerKind::AnonymousSingle,
        WorkerKind::AnonymousRepeatable,
        WorkerKind::PersonalSingle,
        WorkerKind::PersonalMultiple,
        WorkerKind::Platform,
        WorkerKind::PlatformSandbox,
        WorkerKind::Preview,
    ];

    pub fn capabilities(&self) -> WorkerCapabilities {
        let base = WorkerCapabilities {
            single_run: false,
            preview_capable: false,
            platform_bound: false,
            operator: false,
            linear_flow: true,
        };
        match self {
            WorkerKind::AnonymousSingle | WorkerKind::PersonalSingle => WorkerCapabilities {
                single_run: true,
                preview_capable: true,
                ..base
            },
            WorkerKind::AnonymousRepeatable | WorkerKind::PersonalMultiple => base,
            WorkerKind::Platform => WorkerCapabilities {
                single_run: true,
                platform_bound: true,
                ..base
            },
            // Sandbox assignments are test runs and may be repeated.
            WorkerKind::PlatformSandbox => WorkerCapabilities {
                platform_bound: true,
                ..base
            },
            WorkerKind::Preview => WorkerCapabilities {
                operator: true,
                linear_flow: false,
                ..base
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::AnonymousSingle => "anonymous_single",
            WorkerKind::AnonymousRepeatable => "anonymous_repeatable",
            WorkerKind::PersonalSingle => "personal_single",
            WorkerKind::PersonalMultiple => "personal_multiple",
            WorkerKind::Platform => "platform",
            WorkerKind::PlatformSandbox => "platform_sandbox",
            WorkerKind::Preview => "preview",
        }
    }

    /// Confirmation code handed out on a successful finish. Unique per call.
    pub fn confirmation_code(&self) -> String {
        let code = uuid::Uuid::new_v4();
        match self {
            WorkerKind::PlatformSandbox => format!("sandbox-{}", code),
            WorkerKind::Preview => format!("preview-{}", code),
            _ => code.to_string(),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub kind: WorkerKind,
    /// Worker id assigned by the crowd-sourcing platform, if platform-bound.
    #[serde(default)]
    pub platform_worker_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Runs in creation order; append-only.
    #[serde(default)]
    pub run_ids: Vec<RunId>,
}

/// Admission policy for a study.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub study_id: StudyId,
    pub title: String,
    pub active: bool,
    pub allowed_kinds: BTreeSet<WorkerKind>,
    /// Upper bound on distinct workers admitted; `None` is unlimited.
    pub max_total_workers: Option<u32>,
    /// Workers that started at least one run in this batch.
    #[serde(default)]
    pub worker_ids: BTreeSet<WorkerId>,
}

impl Batch {
    pub fn allows(&self, kind: WorkerKind) -> bool {
        self.allowed_kinds.contains(&kind)
    }

    pub fn is_full_for(&self, worker_id: WorkerId) -> bool {
        match self.max_total_workers {
            Some(max) => {
                !self.worker_ids.contains(&worker_id) && self.worker_ids.len() as u64 >= max as u64
            }
            None => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Study {
    pub id: StudyId,
    pub title: String,
    /// Components in presentation order.
    pub component_ids: Vec<ComponentId>,
    #[serde(default)]
    pub group_study: bool,
    #[serde(default = "default_max_group_size")]
    pub max_group_size: u32,
    /// Only strictly forward navigation between components is permitted.
    #[serde(default)]
    pub linear_flow: bool,
}

fn default_max_group_size() -> u32 {
    2
}

impl Study {
    /// 1-based position of the component in this study.
    pub fn position_of(&self, component_id: ComponentId) -> Option<usize> {
        self.component_ids
            .iter()
            .position(|id| *id == component_id)
            .map(|index| index + 1)
    }

    pub fn component_at(&self, position: usize) -> Option<ComponentId> {
        position
            .checked_sub(1)
            .and_then(|index| self.component_ids.get(index))
            .copied()
    }

    pub fn first_component_id(&self) -> Option<ComponentId> {
        self.component_ids.first().copied()
    }

    pub fn next_component_id(&self, after: ComponentId) -> Option<ComponentId> {
        let position = self.position_of(after)?;
        self.component_at(position + 1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub id: ComponentId,
    pub study_id: StudyId,
    pub title: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub reloadable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pre,
    Started,
    DataRetrieved,
    Finished,
    Aborted,
    Fail,
}

impl RunState {
    pub fn is_done(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Aborted | RunState::Fail)
    }
}

/// One worker's attempt at one study.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub study_id: StudyId,
    pub batch_id: BatchId,
    pub worker_id: WorkerId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub confirmation_code: Option<String>,
    pub session_data: Option<String>,
    pub error_msg: Option<String>,
    pub abort_msg: Option<String>,
    pub group_id: Option<GroupId>,
    /// Seq handed to the next component-run started in this run.
    pub next_component_seq: Seq,
}

impl Run {
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentRunState {
    Started,
    DataRetrieved,
    ResultdataPosted,
    Finished,
    Reloaded,
    Aborted,
    Fail,
}

impl ComponentRunState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ComponentRunState::Finished
                | ComponentRunState::Reloaded
                | ComponentRunState::Aborted
                | ComponentRunState::Fail
        )
    }
}

/// One execution of one component within a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ComponentRun {
    pub id: ComponentRunId,
    pub run_id: RunId,
    pub component_id: ComponentId,
    pub seq: Seq,
    pub state: ComponentRunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub data: Option<String>,
}

impl ComponentRun {
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Moves into a terminal state and stamps the end time.
    pub fn terminate(&mut self, state: ComponentRunState, now: DateTime<Utc>) {
        self.state = state;
        self.ended_at = Some(now);
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    Incomplete,
    Complete,
}

/// Synchronized set of runs of one group study.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub study_id: StudyId,
    pub state: GroupState,
    pub member_run_ids: Vec<RunId>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn recompute_state(&mut self, max_group_size: u32) {
        self.state = if self.member_run_ids.len() as u64 >= max_group_size as u64 {
            GroupState::Complete
        } else {
            GroupState::Incomplete
        };
    }
}
