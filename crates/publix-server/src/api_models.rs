//! API DTOs for the publix HTTP surface.

use publix_kernel::{
    BatchId, ComponentId, ComponentRunId, GroupId, GroupState, RunId, RunState, StudyId, WorkerId,
    WorkerKind,
};
use publix_runtime::{ComponentStart, GroupMembership, InitData, StartRunRequest, WorkerRequest};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub meta: ApiMeta,
    pub request_id: String,
    pub data: T,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiMeta {
    pub status: &'static str,
    pub api_version: &'static str,
}

impl ApiMeta {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            api_version: "v1",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StartRunBody {
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub platform_worker_id: Option<String>,
    #[serde(default)]
    pub preview: bool,
}

impl StartRunBody {
    pub fn into_request(self) -> StartRunRequest {
        StartRunRequest {
            worker: WorkerRequest {
                kind: self.worker_kind,
                worker_id: self.worker_id,
                platform_worker_id: self.platform_worker_id,
            },
            preview: self.preview,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentStartResponse {
    pub worker_id: WorkerId,
    pub study_id: StudyId,
    pub run_id: RunId,
    pub run_state: RunState,
    pub component_id: ComponentId,
    pub component_run_id: ComponentRunId,
    pub position: usize,
}

impl From<&ComponentStart> for ComponentStartResponse {
    fn from(start: &ComponentStart) -> Self {
        Self {
            worker_id: start.run.worker_id,
            study_id: start.run.study_id,
            run_id: start.run.id,
            run_state: start.run.state,
            component_id: start.component_run.component_id,
            component_run_id: start.component_run.id,
            position: start.position,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitDataResponse {
    pub worker_id: WorkerId,
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub run_id: RunId,
    pub component_id: ComponentId,
    pub component_run_id: ComponentRunId,
    pub component_position: usize,
    pub group_id: Option<GroupId>,
    pub study_session_data: Option<String>,
}

impl From<&InitData> for InitDataResponse {
    fn from(init: &InitData) -> Self {
        Self {
            worker_id: init.worker_id,
            batch_id: init.batch_id,
            study_id: init.study_id,
            run_id: init.run_id,
            component_id: init.component_id,
            component_run_id: init.component_run_id,
            component_position: init.position,
            group_id: init.group_id,
            study_session_data: init.study_session_data.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultDataResponse {
    pub component_run_id: ComponentRunId,
    pub size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub component_run_id: ComponentRunId,
    pub filename: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupResponse {
    pub group_id: GroupId,
    pub state: GroupState,
    pub member_run_ids: Vec<RunId>,
}

impl From<&GroupMembership> for GroupResponse {
    fn from(membership: &GroupMembership) -> Self {
        Self {
            group_id: membership.group.id,
            state: membership.group.state,
            member_run_ids: membership.group.member_run_ids.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub component_run_id: Option<ComponentRunId>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FinishQuery {
    #[serde(default = "default_successful")]
    pub successful: bool,
    pub message: Option<String>,
}

fn default_successful() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AbortQuery {
    pub message: Option<String>,
}
