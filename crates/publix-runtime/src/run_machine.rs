//! Run / component-run lifecycle.
//!
//! A run moves `PRE -> STARTED -> DATA_RETRIEVED -> FINISHED | ABORTED | FAIL`;
//! within a run at most one component-run is non-terminal at a time. Every
//! mutation of a run happens under that run's lock and is committed as one
//! change set.

use std::sync::Arc;

use chrono::Utc;

use publix_kernel::{
    AuditEntry, AuditLog, Batch, ChangeSet, Component, ComponentId, ComponentRun,
    ComponentRunId, ComponentRunState, EntityKind, PublixStore, Run, RunId, RunState, Study,
    StudyId, Worker,
};

use crate::error::PublixError;
use crate::locks::EngineLocks;

pub const NEVER_FINISHED_MSG: &str =
    "Never finished: a new run of this study was started by the same worker";

/// Result of a finish or abort call.
#[derive(Clone, Debug)]
pub struct RunTransition {
    pub run: Run,
    /// `false` when the run was already done and nothing changed.
    pub transitioned: bool,
}

pub struct RunMachine<S: PublixStore + ?Sized> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    locks: Arc<EngineLocks>,
}

impl<S: PublixStore + ?Sized> Clone for RunMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            audit: self.audit.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: PublixStore + ?Sized> RunMachine<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>, locks: Arc<EngineLocks>) -> Self {
        Self {
            store,
            audit,
            locks,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn audit_run(&self, run: &Run, message: impl Into<String>) {
        self.audit
            .record(AuditEntry::new(run.study_id, message).with_run(run.id, run.worker_id));
    }

    /// Creates a run for `worker` in `batch`. The worker's run list and the
    /// batch's worker set are committed together with the run.
    pub fn create_run(
        &self,
        worker: &Worker,
        batch: &Batch,
        pre: bool,
    ) -> Result<Run, PublixError> {
        let now = Utc::now();
        let run = Run {
            id: self.store.next_id(EntityKind::Run)?,
            study_id: batch.study_id,
            batch_id: batch.id,
            worker_id: worker.id,
            state: if pre { RunState::Pre } else { RunState::Started },
            started_at: now,
            ended_at: None,
            last_seen_at: now,
            confirmation_code: None,
            session_data: None,
            error_msg: None,
            abort_msg: None,
            group_id: None,
            next_component_seq: 1,
        };
        let mut worker = worker.clone();
        worker.run_ids.push(run.id);
        let mut batch = batch.clone();
        batch.worker_ids.insert(worker.id);
        self.store.apply(
            ChangeSet::new()
                .worker(worker.clone())
                .batch(batch)
                .run(run.clone()),
        )?;
        tracing::info!(
            run_id = run.id,
            study_id = run.study_id,
            worker_id = worker.id,
            state = ?run.state,
            "study run created"
        );
        self.audit_run(&run, format!("Started study run with {} worker", worker.kind));
        Ok(run)
    }

    /// Loads a run and checks it is open and owned by `worker` on `study_id`.
    pub fn retrieve_open_run(
        &self,
        worker: &Worker,
        study_id: StudyId,
        run_id: RunId,
    ) -> Result<Run, PublixError> {
        let run = self
            .store
            .find_run(run_id)?
            .ok_or_else(|| PublixError::not_found(format!("study run {} doesn't exist", run_id)))?;
        if run.worker_id != worker.id {
            return Err(PublixError::forbidden(format!(
                "study run {} doesn't belong to worker {}",
                run_id, worker.id
            )));
        }
        if run.study_id != study_id {
            return Err(PublixError::forbidden(format!(
                "study run {} doesn't belong to study {}",
                run_id, study_id
            )));
        }
        if run.is_done() {
            return Err(PublixError::forbidden(format!(
                "study run {} is finished already",
                run_id
            )));
        }
        Ok(run)
    }

    /// Component of `study` that a participant may start.
    pub fn retrieve_component(
        &self,
        study: &Study,
        component_id: ComponentId,
    ) -> Result<Component, PublixError> {
        let component = self.store.find_component(component_id)?.ok_or_else(|| {
            PublixError::not_found(format!("component {} doesn't exist", component_id))
        })?;
        if component.study_id != study.id {
            return Err(PublixError::bad_request(format!(
                "component {} doesn't belong to study {}",
                component_id, study.id
            )));
        }
        if !component.active {
            return Err(PublixError::forbidden(format!(
                "component {} isn't active",
                component_id
            )));
        }
        Ok(component)
    }

    /// Component at a 1-based position of `study`.
    pub fn retrieve_component_by_position(
        &self,
        study: &Study,
        position: Option<usize>,
    ) -> Result<Component, PublixError> {
        let position = position
            .ok_or_else(|| PublixError::bad_request("component position is missing"))?;
        let component_id = study.component_at(position).ok_or_else(|| {
            PublixError::not_found(format!(
                "study {} has no component at position {}",
                study.id, position
            ))
        })?;
        self.retrieve_component(study, component_id)
    }

    pub fn first_active_component(&self, study: &Study) -> Result<Component, PublixError> {
        self.active_components_from(study, 0)?
            .ok_or(PublixError::NoActiveComponents(study.id))
    }

    /// Next active component after the run's most recent one; the first
    /// active component when nothing was started yet. `None` at the end.
    pub fn next_active_component(
        &self,
        study: &Study,
        run_id: RunId,
    ) -> Result<Option<Component>, PublixError> {
        let last = self.store.list_component_runs(run_id)?.pop();
        let from = match last {
            Some(last) => study.position_of(last.component_id).unwrap_or(0),
            None => 0,
        };
        self.active_components_from(study, from)
    }

    fn active_components_from(
        &self,
        study: &Study,
        skip: usize,
    ) -> Result<Option<Component>, PublixError> {
        for component_id in study.component_ids.iter().skip(skip) {
            if let Some(component) = self.store.find_component(*component_id)? {
                if component.active {
                    return Ok(Some(component));
                }
            }
        }
        Ok(None)
    }

    /// Most recent component-run of the run iff it is non-terminal.
    pub fn retrieve_current_component_run(
        &self,
        run_id: RunId,
    ) -> Result<Option<ComponentRun>, PublixError> {
        Ok(self
            .store
            .list_component_runs(run_id)?
            .pop()
            .filter(|c| !c.is_done()))
    }

    /// Most recent component-run of the run, whatever its state.
    pub fn retrieve_last_component_run(
        &self,
        run_id: RunId,
    ) -> Result<Option<ComponentRun>, PublixError> {
        Ok(self.store.list_component_runs(run_id)?.pop())
    }

    /// Starts `component` in the run, resolving the current component-run
    /// first. A refused reload marks the current component-run `FAIL` and
    /// leaves the run open.
    pub fn start_component(
        &self,
        run_id: RunId,
        component: &Component,
    ) -> Result<ComponentRun, PublixError> {
        self.locks
            .runs
            .with(run_id, || self.start_component_locked(run_id, component))
    }

    fn start_component_locked(
        &self,
        run_id: RunId,
        component: &Component,
    ) -> Result<ComponentRun, PublixError> {
        let mut run = self.store.require_run(run_id)?;
        if run.is_done() {
            return Err(PublixError::forbidden(format!(
                "study run {} is finished already",
                run_id
            )));
        }
        let study = self.store.require_study(run.study_id)?;
        let worker = self.store.require_worker(run.worker_id)?;
        let component_runs = self.store.list_component_runs(run_id)?;

        let requested = study.position_of(component.id).ok_or_else(|| {
            PublixError::bad_request(format!(
                "component {} doesn't belong to study {}",
                component.id, study.id
            ))
        })?;
        if study.linear_flow && worker.kind.capabilities().linear_flow {
            let current = component_runs
                .last()
                .and_then(|last| study.position_of(last.component_id));
            if let Some(current) = current {
                if requested < current {
                    self.audit_run(
                        &run,
                        format!(
                            "Refused non-linear start of component {} (position {} after {})",
                            component.id, requested, current
                        ),
                    );
                    return Err(PublixError::ForbiddenNonLinearFlow {
                        study_id: study.id,
                        requested,
                        current,
                    });
                }
            }
        }

        let first_active = self.first_active_component(&study)?;
        let preview_repeat = run.state == RunState::Pre && component.id == first_active.id;
        let now = Utc::now();
        let mut changes = ChangeSet::new();

        if let Some(mut current) = component_runs.last().filter(|c| !c.is_done()).cloned() {
            if current.component_id == component.id {
                if component.reloadable || preview_repeat {
                    current.terminate(ComponentRunState::Reloaded, now);
                    changes = changes.component_run(current);
                } else {
                    current.terminate(ComponentRunState::Fail, now);
                    self.store.update_component_run(current)?;
                    tracing::warn!(
                        run_id,
                        component_id = component.id,
                        "reload of non-reloadable component refused"
                    );
                    self.audit_run(
                        &run,
                        format!("Refused reload of component {}", component.id),
                    );
                    return Err(PublixError::ForbiddenReload {
                        study_id: study.id,
                        component_id: component.id,
                    });
                }
            } else {
                current.terminate(ComponentRunState::Finished, now);
                changes = changes.component_run(current);
            }
        }

        if run.state == RunState::Pre && component.id != first_active.id {
            run.state = RunState::Started;
        }
        let component_run = ComponentRun {
            id: self.store.next_id(EntityKind::ComponentRun)?,
            run_id,
            component_id: component.id,
            seq: run.next_component_seq,
            state: ComponentRunState::Started,
            started_at: now,
            ended_at: None,
            data: None,
        };
        run.next_component_seq += 1;
        run.last_seen_at = now;
        self.store
            .apply(changes.run(run.clone()).component_run(component_run.clone()))?;

        tracing::info!(
            run_id,
            study_id = run.study_id,
            component_id = component.id,
            component_run_id = component_run.id,
            seq = component_run.seq,
            "component started"
        );
        self.audit.record(
            AuditEntry::new(run.study_id, format!("Started component {}", component.id))
                .with_run(run.id, run.worker_id)
                .with_component_run(component_run.id),
        );
        Ok(component_run)
    }

    /// Resolves the component-run to hand init data to: the current one if it
    /// belongs to `component`, otherwise a freshly started one. Marks both the
    /// run (unless `PRE`) and the component-run `DATA_RETRIEVED`.
    pub fn retrieve_init_data(
        &self,
        run_id: RunId,
        component: &Component,
    ) -> Result<(Run, ComponentRun), PublixError> {
        self.locks.runs.with(run_id, || {
            let current = self
                .retrieve_current_component_run(run_id)?
                .filter(|c| c.component_id == component.id);
            let mut component_run = match current {
                Some(current) => current,
                None => self.start_component_locked(run_id, component)?,
            };
            let mut run = self.store.require_run(run_id)?;
            if run.is_done() {
                return Err(PublixError::forbidden(format!(
                    "study run {} is finished already",
                    run_id
                )));
            }
            if run.state != RunState::Pre {
                run.state = RunState::DataRetrieved;
            }
            run.last_seen_at = Utc::now();
            component_run.state = ComponentRunState::DataRetrieved;
            self.store.apply(
                ChangeSet::new()
                    .run(run.clone())
                    .component_run(component_run.clone()),
            )?;
            Ok((run, component_run))
        })
    }

    pub fn set_session_data(&self, run_id: RunId, data: String) -> Result<Run, PublixError> {
        self.locks.runs.with(run_id, || {
            let mut run = self.store.require_run(run_id)?;
            if run.is_done() {
                return Err(PublixError::forbidden(format!(
                    "study run {} is finished already",
                    run_id
                )));
            }
            run.session_data = Some(data);
            run.last_seen_at = Utc::now();
            self.store.update_run(run.clone())?;
            Ok(run)
        })
    }

    /// Stamps the run's liveness timestamp.
    pub fn heartbeat(&self, run_id: RunId) -> Result<Run, PublixError> {
        self.locks.runs.with(run_id, || {
            let mut run = self.store.require_run(run_id)?;
            run.last_seen_at = Utc::now();
            self.store.update_run(run.clone())?;
            Ok(run)
        })
    }

    /// Ends the run. Successful: every open component-run is finished and a
    /// confirmation code is issued. Unsuccessful: state `FAIL`, component-runs
    /// untouched. Already done runs are returned unchanged.
    pub fn finish_run(
        &self,
        run_id: RunId,
        successful: bool,
        message: Option<String>,
    ) -> Result<RunTransition, PublixError> {
        self.locks.runs.with(run_id, || {
            let mut run = self.store.require_run(run_id)?;
            if run.is_done() {
                return Ok(RunTransition {
                    run,
                    transitioned: false,
                });
            }
            let now = Utc::now();
            let mut changes = ChangeSet::new();
            if successful {
                let worker = self.store.require_worker(run.worker_id)?;
                for mut component_run in self.store.list_component_runs(run_id)? {
                    if !component_run.is_done() {
                        component_run.terminate(ComponentRunState::Finished, now);
                        changes = changes.component_run(component_run);
                    }
                }
                run.state = RunState::Finished;
                run.confirmation_code = Some(worker.kind.confirmation_code());
            } else {
                run.state = RunState::Fail;
            }
            run.error_msg = message;
            run.session_data = None;
            run.ended_at = Some(now);
            run.last_seen_at = now;
            self.store.apply(changes.run(run.clone()))?;

            tracing::info!(
                run_id,
                study_id = run.study_id,
                worker_id = run.worker_id,
                state = ?run.state,
                "study run finished"
            );
            let note = match (&run.state, &run.error_msg) {
                (RunState::Finished, _) => "Finished study run".to_string(),
                (_, Some(msg)) => format!("Failed study run: {}", msg),
                (_, None) => "Failed study run".to_string(),
            };
            self.audit_run(&run, note);
            Ok(RunTransition {
                run,
                transitioned: true,
            })
        })
    }

    /// Aborts the run: the current component-run ends `ABORTED`, any other open
    /// one `FINISHED`, and every component-run's data is erased.
    pub fn abort_run(
        &self,
        run_id: RunId,
        message: Option<String>,
    ) -> Result<RunTransition, PublixError> {
        self.locks.runs.with(run_id, || {
            let mut run = self.store.require_run(run_id)?;
            if run.is_done() {
                return Ok(RunTransition {
                    run,
                    transitioned: false,
                });
            }
            let now = Utc::now();
            let mut component_runs = self.store.list_component_runs(run_id)?;
            let current_id = component_runs
                .last()
                .filter(|c| !c.is_done())
                .map(|c| c.id);
            let mut changes = ChangeSet::new();
            for component_run in component_runs.iter_mut() {
                if Some(component_run.id) == current_id {
                    component_run.terminate(ComponentRunState::Aborted, now);
                } else if !component_run.is_done() {
                    component_run.terminate(ComponentRunState::Finished, now);
                }
                component_run.data = None;
                changes = changes.component_run(component_run.clone());
            }
            run.state = RunState::Aborted;
            run.abort_msg = message;
            run.session_data = None;
            run.ended_at = Some(now);
            run.last_seen_at = now;
            self.store.apply(changes.run(run.clone()))?;

            tracing::info!(
                run_id,
                study_id = run.study_id,
                worker_id = run.worker_id,
                "study run aborted"
            );
            self.audit_run(&run, "Aborted study run");
            Ok(RunTransition {
                run,
                transitioned: true,
            })
        })
    }

    /// Fails every open run of `worker` on `study_id`; returns the runs that
    /// were closed.
    pub fn finish_stale_runs(
        &self,
        worker: &Worker,
        study_id: StudyId,
    ) -> Result<Vec<Run>, PublixError> {
        let mut closed = Vec::new();
        for run in self.store.list_runs_for_worker(worker.id)? {
            if run.study_id != study_id || run.is_done() {
                continue;
            }
            let outcome = self.finish_run(run.id, false, Some(NEVER_FINISHED_MSG.to_string()))?;
            if outcome.transitioned {
                closed.push(outcome.run);
            }
        }
        Ok(closed)
    }

    /// Records a client log line against the run's study.
    pub fn log(&self, run: &Run, component_run_id: Option<ComponentRunId>, message: &str) {
        tracing::info!(
            run_id = run.id,
            study_id = run.study_id,
            worker_id = run.worker_id,
            "client log: {}",
            message
        );
        let mut entry = AuditEntry::new(run.study_id, format!("Logging from client: {}", message))
            .with_run(run.id, run.worker_id);
        if let Some(id) = component_run_id {
            entry = entry.with_component_run(id);
        }
        self.audit.record(entry);
    }
}
