//! Resolution of the worker behind a study start.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use publix_kernel::{EntityKind, PublixStore, Worker, WorkerId, WorkerKind};

use crate::error::PublixError;

/// Identity a participant presents when starting a study.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WorkerRequest {
    pub kind: WorkerKind,
    /// Known worker (returning participant, invitation, preview).
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// Marketplace identity for platform-bound kinds.
    #[serde(default)]
    pub platform_worker_id: Option<String>,
}

/// A resolved worker; `created` workers are not stored yet and get committed
/// together with their first run.
#[derive(Clone, Debug)]
pub struct ResolvedWorker {
    pub worker: Worker,
    pub created: bool,
}

pub struct WorkerCreator<S: PublixStore + ?Sized> {
    store: Arc<S>,
}

impl<S: PublixStore + ?Sized> Clone for WorkerCreator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: PublixStore + ?Sized> WorkerCreator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn fresh(&self, kind: WorkerKind, platform_worker_id: Option<String>) -> Result<ResolvedWorker, PublixError> {
        let worker = Worker {
            id: self.store.next_id(EntityKind::Worker)?,
            kind,
            platform_worker_id,
            created_at: Utc::now(),
            run_ids: Vec::new(),
        };
        tracing::debug!(worker_id = worker.id, kind = %kind, "worker created");
        Ok(ResolvedWorker {
            worker,
            created: true,
        })
    }

    fn existing(&self, worker_id: WorkerId, kind: WorkerKind) -> Result<ResolvedWorker, PublixError> {
        let worker = self
            .store
            .find_worker(worker_id)?
            .ok_or_else(|| PublixError::not_found(format!("worker {} doesn't exist", worker_id)))?;
        if worker.kind != kind {
            return Err(PublixError::forbidden(format!(
                "worker {} is a {} worker, not {}",
                worker_id, worker.kind, kind
            )));
        }
        Ok(ResolvedWorker {
            worker,
            created: false,
        })
    }

    pub fn resolve(&self, request: &WorkerRequest) -> Result<ResolvedWorker, PublixError> {
        let kind = request.kind;
        match kind {
            WorkerKind::Preview => {
                let worker_id = request.worker_id.ok_or_else(|| {
                    PublixError::bad_request("preview workers must be provisioned in advance")
                })?;
                self.existing(worker_id, kind)
            }
            WorkerKind::Platform | WorkerKind::PlatformSandbox => {
                let platform_worker_id = request
                    .platform_worker_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| PublixError::bad_request("platform worker id is missing"))?;
                match self.store.find_worker_by_platform_id(platform_worker_id)? {
                    Some(worker) if worker.kind != kind => Err(PublixError::forbidden(format!(
                        "platform worker {} is a {} worker, not {}",
                        platform_worker_id, worker.kind, kind
                    ))),
                    Some(worker) => Ok(ResolvedWorker {
                        worker,
                        created: false,
                    }),
                    None => self.fresh(kind, Some(platform_worker_id.to_string())),
                }
            }
            _ => match request.worker_id {
                Some(worker_id) => self.existing(worker_id, kind),
                None => self.fresh(kind, None),
            },
        }
    }
}
