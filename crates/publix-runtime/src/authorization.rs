//! Worker authorization.
//!
//! Whether a worker may start, or keep going with, a study through a batch.
//! Decisions are driven by the worker kind's capability table; another
//! policy plugs in by implementing [`WorkerAuthorizer`].

use publix_kernel::{Batch, Run, RunState, Study, Worker};

use crate::error::PublixError;

/// Everything an authorization decision looks at.
#[derive(Clone, Copy, Debug)]
pub struct AuthorizationContext<'a> {
    pub worker: &'a Worker,
    pub study: &'a Study,
    pub batch: &'a Batch,
    /// All runs of the worker, any study.
    pub worker_runs: &'a [Run],
    /// Marketplace identity presented with the request, if any.
    pub platform_worker_id: Option<&'a str>,
}

impl<'a> AuthorizationContext<'a> {
    fn runs_of_study(&self) -> impl Iterator<Item = &'a Run> + 'a {
        let study_id = self.study.id;
        self.worker_runs
            .iter()
            .filter(move |run| run.study_id == study_id)
    }
}

pub trait WorkerAuthorizer: Send + Sync {
    /// Checked before a new run is created. `preview` asks for a run in
    /// `PRE` state.
    fn check_allowed_to_start(
        &self,
        ctx: &AuthorizationContext<'_>,
        preview: bool,
    ) -> Result<(), PublixError>;

    /// Checked on every request that continues the run `run`.
    fn check_allowed_to_continue(
        &self,
        ctx: &AuthorizationContext<'_>,
        run: &Run,
    ) -> Result<(), PublixError>;
}

/// Authorization by worker-kind capabilities.
#[derive(Clone, Debug, Default)]
pub struct CapabilityAuthorizer;

impl CapabilityAuthorizer {
    fn check_batch(&self, ctx: &AuthorizationContext<'_>) -> Result<(), PublixError> {
        let kind = ctx.worker.kind;
        if ctx.batch.study_id != ctx.study.id {
            return Err(PublixError::forbidden(format!(
                "batch {} doesn't belong to study {}",
                ctx.batch.id, ctx.study.id
            )));
        }
        if kind.capabilities().operator {
            return Ok(());
        }
        if !ctx.batch.active {
            return Err(PublixError::forbidden(format!(
                "batch {} is inactive",
                ctx.batch.id
            )));
        }
        if !ctx.batch.allows(kind) {
            return Err(PublixError::forbidden(format!(
                "worker type {} isn't allowed in batch {}",
                kind, ctx.batch.id
            )));
        }
        Ok(())
    }

    fn check_platform_identity(&self, ctx: &AuthorizationContext<'_>) -> Result<(), PublixError> {
        if !ctx.worker.kind.capabilities().platform_bound {
            return Ok(());
        }
        match (ctx.platform_worker_id, ctx.worker.platform_worker_id.as_deref()) {
            (Some(presented), Some(known)) if presented == known => Ok(()),
            _ => Err(PublixError::forbidden(format!(
                "platform identity doesn't match worker {}",
                ctx.worker.id
            ))),
        }
    }
}

impl WorkerAuthorizer for CapabilityAuthorizer {
    fn check_allowed_to_start(
        &self,
        ctx: &AuthorizationContext<'_>,
        preview: bool,
    ) -> Result<(), PublixError> {
        let caps = ctx.worker.kind.capabilities();
        self.check_batch(ctx)?;
        if !caps.operator && ctx.batch.is_full_for(ctx.worker.id) {
            return Err(PublixError::forbidden(format!(
                "batch {} has reached its maximum number of workers",
                ctx.batch.id
            )));
        }
        self.check_platform_identity(ctx)?;
        if caps.single_run {
            let last = ctx.runs_of_study().last();
            let repeating_preview = preview
                && caps.preview_capable
                && last.is_some_and(|run| run.state == RunState::Pre);
            if last.is_some() && !repeating_preview {
                return Err(PublixError::StudyCanBeDoneOnlyOnce(ctx.study.id));
            }
        }
        Ok(())
    }

    fn check_allowed_to_continue(
        &self,
        ctx: &AuthorizationContext<'_>,
        run: &Run,
    ) -> Result<(), PublixError> {
        self.check_batch(ctx)?;
        if ctx.worker.kind.capabilities().single_run {
            let done_before = ctx
                .runs_of_study()
                .any(|other| other.id != run.id && other.is_done());
            if done_before {
                return Err(PublixError::StudyCanBeDoneOnlyOnce(ctx.study.id));
            }
        }
        Ok(())
    }
}
