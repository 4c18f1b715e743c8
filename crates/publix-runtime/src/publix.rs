//! Request-level flows of the study-execution engine.
//!
//! Every call except `start_run` arrives with an identity token. The token is
//! decoded, matched against the addressed run and re-authorized before
//! anything is touched; state-advancing calls hand back a fresh token.

use std::sync::Arc;

use publix_kernel::{
    AuditLog, Batch, BatchId, ComponentId, ComponentRun, ComponentRunId, Group, GroupChannel,
    GroupId, NoopGroupChannel, PublixStore, Run, RunId, RunState, Study, StudyId,
    TracingAuditLog, Worker, WorkerId,
};

use crate::authorization::{AuthorizationContext, CapabilityAuthorizer, WorkerAuthorizer};
use crate::config::PublixConfig;
use crate::error::{ErrorKind, PublixError};
use crate::group::GroupCoordinator;
use crate::id_token::{IdToken, IdTokenCodec};
use crate::locks::EngineLocks;
use crate::payload::single_line;
use crate::result_files::{
    FsResultFileStore, InMemoryResultFileStore, ResultFileStore, StoredFile,
};
use crate::result_sink::ResultSink;
use crate::run_machine::RunMachine;
use crate::worker_creator::{WorkerCreator, WorkerRequest};

/// Parameters of a study start.
#[derive(Clone, Debug)]
pub struct StartRunRequest {
    pub worker: WorkerRequest,
    /// Ask for a preview run (`PRE`); honored for preview-capable kinds.
    pub preview: bool,
}

/// A started component plus the token that now identifies the client.
#[derive(Clone, Debug)]
pub struct ComponentStart {
    pub token: String,
    pub run: Run,
    pub component_run: ComponentRun,
    pub position: usize,
}

/// Everything a component needs to initialize itself.
#[derive(Clone, Debug)]
pub struct InitData {
    pub token: String,
    pub worker_id: WorkerId,
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub run_id: RunId,
    pub component_id: ComponentId,
    pub component_run_id: ComponentRunId,
    pub position: usize,
    pub group_id: Option<GroupId>,
    pub study_session_data: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GroupMembership {
    pub token: String,
    pub group: Group,
}

/// Authenticated request context.
#[derive(Clone, Debug)]
struct Session {
    worker: Worker,
    study: Study,
    batch: Batch,
    run: Run,
}

pub struct Publix<S: PublixStore + ?Sized> {
    store: Arc<S>,
    codec: IdTokenCodec,
    runs: RunMachine<S>,
    groups: GroupCoordinator<S>,
    sink: ResultSink<S>,
    workers: WorkerCreator<S>,
    authorizer: Arc<dyn WorkerAuthorizer>,
    channel: Arc<dyn GroupChannel>,
    locks: Arc<EngineLocks>,
}

pub struct PublixBuilder<S: PublixStore + ?Sized> {
    store: Arc<S>,
    config: PublixConfig,
    audit: Arc<dyn AuditLog>,
    channel: Arc<dyn GroupChannel>,
    authorizer: Arc<dyn WorkerAuthorizer>,
    files: Option<Arc<dyn ResultFileStore>>,
    codec: Option<IdTokenCodec>,
}

impl<S: PublixStore + ?Sized> PublixBuilder<S> {
    pub fn config(mut self, config: PublixConfig) -> Self {
        self.config = config;
        self
    }

    pub fn audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn group_channel(mut self, channel: Arc<dyn GroupChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn WorkerAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn file_store(mut self, files: Arc<dyn ResultFileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn token_codec(mut self, codec: IdTokenCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<Publix<S>, PublixError> {
        let files: Arc<dyn ResultFileStore> = match (self.files, &self.config.uploads_dir) {
            (Some(files), _) => files,
            (None, Some(dir)) => Arc::new(FsResultFileStore::new(dir.clone())?),
            (None, None) => Arc::new(InMemoryResultFileStore::new()),
        };
        let codec = match (self.codec, &self.config.token_secret) {
            (Some(codec), _) => codec,
            (None, Some(secret)) => IdTokenCodec::new(secret.as_bytes().to_vec()),
            (None, None) => IdTokenCodec::random(),
        };
        let locks = Arc::new(EngineLocks::new());
        Ok(Publix {
            codec,
            runs: RunMachine::new(self.store.clone(), self.audit.clone(), locks.clone()),
            groups: GroupCoordinator::new(self.store.clone(), self.audit.clone(), locks.clone()),
            sink: ResultSink::new(
                self.store.clone(),
                files,
                self.audit.clone(),
                locks.clone(),
                self.config.result_data_max_size,
                self.config.uploads.clone(),
            ),
            workers: WorkerCreator::new(self.store.clone()),
            authorizer: self.authorizer,
            channel: self.channel,
            locks,
            store: self.store,
        })
    }
}

impl<S: PublixStore + ?Sized> Publix<S> {
    pub fn builder(store: Arc<S>) -> PublixBuilder<S> {
        PublixBuilder {
            store,
            config: PublixConfig::default(),
            audit: Arc::new(TracingAuditLog),
            channel: Arc::new(NoopGroupChannel),
            authorizer: Arc::new(CapabilityAuthorizer),
            files: None,
            codec: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> &IdTokenCodec {
        &self.codec
    }

    /// Logs broken invariants with the run's ancestry before handing the
    /// error back.
    fn traced<T>(
        &self,
        run_id: Option<RunId>,
        op: &'static str,
        f: impl FnOnce() -> Result<T, PublixError>,
    ) -> Result<T, PublixError> {
        f().map_err(|err| {
            if err.kind() == ErrorKind::InternalServerError {
                let run = run_id.and_then(|id| self.store.find_run(id).ok().flatten());
                tracing::error!(
                    op,
                    run_id = ?run_id,
                    study_id = ?run.as_ref().map(|r| r.study_id),
                    worker_id = ?run.as_ref().map(|r| r.worker_id),
                    batch_id = ?run.as_ref().map(|r| r.batch_id),
                    error = %err,
                    "publix invariant violated"
                );
            }
            err
        })
    }

    fn authorize_continue(&self, session: &Session) -> Result<(), PublixError> {
        let worker_runs = self.store.list_runs_for_worker(session.worker.id)?;
        let ctx = AuthorizationContext {
            worker: &session.worker,
            study: &session.study,
            batch: &session.batch,
            worker_runs: &worker_runs,
            platform_worker_id: session.worker.platform_worker_id.as_deref(),
        };
        self.authorizer.check_allowed_to_continue(&ctx, &session.run)
    }

    /// Decodes the token and loads the context of `run_id`. With `open_only`
    /// a done run is refused.
    fn authenticate(
        &self,
        raw_token: &str,
        run_id: RunId,
        open_only: bool,
    ) -> Result<Session, PublixError> {
        let token = self.codec.decode(raw_token)?;
        if token.run_id != run_id {
            return Err(PublixError::forbidden(format!(
                "identity token doesn't belong to study run {}",
                run_id
            )));
        }
        let worker = self.store.find_worker(token.worker_id)?.ok_or_else(|| {
            PublixError::forbidden(format!("worker {} doesn't exist", token.worker_id))
        })?;
        let study = self.store.find_study(token.study_id)?.ok_or_else(|| {
            PublixError::not_found(format!("study {} doesn't exist", token.study_id))
        })?;
        let batch = self.store.find_batch(token.batch_id)?.ok_or_else(|| {
            PublixError::not_found(format!("batch {} doesn't exist", token.batch_id))
        })?;
        let run = if open_only {
            self.runs.retrieve_open_run(&worker, study.id, run_id)?
        } else {
            let run = self.store.require_run(run_id)?;
            if run.worker_id != worker.id || run.study_id != study.id {
                return Err(PublixError::forbidden(format!(
                    "study run {} doesn't belong to this identity",
                    run_id
                )));
            }
            run
        };
        if run.batch_id != batch.id {
            return Err(PublixError::forbidden(format!(
                "study run {} doesn't belong to batch {}",
                run_id, batch.id
            )));
        }
        let session = Session {
            worker,
            study,
            batch,
            run,
        };
        if !session.run.is_done() {
            self.authorize_continue(&session)?;
        }
        Ok(session)
    }

    fn issue(
        &self,
        session: &Session,
        run: &Run,
        component_run: &ComponentRun,
    ) -> Result<(String, usize), PublixError> {
        let position = session
            .study
            .position_of(component_run.component_id)
            .ok_or_else(|| {
                PublixError::Internal(format!(
                    "component {} of run {} isn't part of study {}",
                    component_run.component_id, run.id, session.study.id
                ))
            })?;
        let token = self.codec.encode(&IdToken {
            worker_id: session.worker.id,
            batch_id: session.batch.id,
            study_id: session.study.id,
            run_id: run.id,
            group_id: run.group_id,
            component_id: component_run.component_id,
            component_run_id: component_run.id,
            component_position: position,
        })?;
        Ok((token, position))
    }

    fn issue_for_last(&self, session: &Session) -> Result<(String, Run), PublixError> {
        let run = self.store.require_run(session.run.id)?;
        let last = self
            .runs
            .retrieve_last_component_run(run.id)?
            .ok_or_else(|| {
                PublixError::Internal(format!("study run {} has no component result", run.id))
            })?;
        let (token, _) = self.issue(session, &run, &last)?;
        Ok((token, run))
    }

    /// Closes the run's group channel and takes it out of its group.
    fn close_group_channel_and_leave(&self, run: &Run) -> Result<(), PublixError> {
        self.channel.close_and_leave(run);
        if run.group_id.is_some() {
            self.groups.leave(run.id)?;
        }
        Ok(())
    }

    /// Ends the run unsuccessfully after a reload or flow violation so the
    /// participant lands on a regular end state. The violation is what the
    /// caller gets back; a failure to end the run is only logged and leaves the
    /// run open.
    fn end_after_violation(&self, run_id: RunId, err: PublixError) -> PublixError {
        if !err.ends_run() {
            return err;
        }
        let ended = self
            .runs
            .finish_run(run_id, false, Some(err.to_string()))
            .and_then(|outcome| {
                if outcome.transitioned {
                    self.close_group_channel_and_leave(&outcome.run)?;
                }
                Ok(())
            });
        if let Err(finish_err) = ended {
            tracing::error!(run_id, error = %finish_err, "could not end run after violation");
        }
        err
    }

    fn start_in_session(
        &self,
        session: &Session,
        component_id: ComponentId,
    ) -> Result<ComponentStart, PublixError> {
        let component = self.runs.retrieve_component(&session.study, component_id)?;
        let component_run = self
            .runs
            .start_component(session.run.id, &component)
            .map_err(|err| self.end_after_violation(session.run.id, err))?;
        let run = self.store.require_run(session.run.id)?;
        let (token, position) = self.issue(session, &run, &component_run)?;
        Ok(ComponentStart {
            token,
            run,
            component_run,
            position,
        })
    }

    /// Starts (or, for a repeated preview, resumes) a run of the batch's study
    /// and its first active component.
    pub fn start_run(
        &self,
        batch_id: BatchId,
        request: &StartRunRequest,
    ) -> Result<ComponentStart, PublixError> {
        self.traced(None, "start_run", || {
            let study_id = self
                .store
                .find_batch(batch_id)?
                .ok_or_else(|| PublixError::not_found(format!("batch {} doesn't exist", batch_id)))?
                .study_id;
            let study = self.store.require_study(study_id)?;
            let (worker, batch, run, stale, first) = self.locks.studies.with(study_id, || {
                let batch = self.store.find_batch(batch_id)?.ok_or_else(|| {
                    PublixError::not_found(format!("batch {} doesn't exist", batch_id))
                })?;
                let resolved = self.workers.resolve(&request.worker)?;
                let worker = resolved.worker;
                let worker_runs = if resolved.created {
                    Vec::new()
                } else {
                    self.store.list_runs_for_worker(worker.id)?
                };
                let ctx = AuthorizationContext {
                    worker: &worker,
                    study: &study,
                    batch: &batch,
                    worker_runs: &worker_runs,
                    platform_worker_id: request.worker.platform_worker_id.as_deref().map(str::trim),
                };
                self.authorizer.check_allowed_to_start(&ctx, request.preview)?;
                // Nothing is committed before this point.
                let first = self.runs.first_active_component(&study)?;

                let caps = worker.kind.capabilities();
                let preview = request.preview && caps.preview_capable;
                let repeat = worker_runs
                    .iter()
                    .filter(|r| r.study_id == study_id)
                    .last()
                    .filter(|r| preview && r.state == RunState::Pre)
                    .cloned();
                match repeat {
                    Some(run) => Ok((worker, batch, run, Vec::new(), first)),
                    None => {
                        let stale = self.runs.finish_stale_runs(&worker, study_id)?;
                        let run = self.runs.create_run(&worker, &batch, preview)?;
                        Ok((worker, batch, run, stale, first))
                    }
                }
            })?;
            for old in &stale {
                self.close_group_channel_and_leave(old)?;
            }
            let session = Session {
                worker,
                study,
                batch,
                run,
            };
            self.start_in_session(&session, first.id)
        })
    }

    pub fn start_component(
        &self,
        raw_token: &str,
        run_id: RunId,
        component_id: ComponentId,
    ) -> Result<ComponentStart, PublixError> {
        self.traced(Some(run_id), "start_component", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            self.start_in_session(&session, component_id)
        })
    }

    /// Starts the component at a 1-based position of the study.
    pub fn start_component_by_position(
        &self,
        raw_token: &str,
        run_id: RunId,
        position: Option<usize>,
    ) -> Result<ComponentStart, PublixError> {
        self.traced(Some(run_id), "start_component_by_position", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            let component = self
                .runs
                .retrieve_component_by_position(&session.study, position)?;
            self.start_in_session(&session, component.id)
        })
    }

    /// Starts the next active component; `None` once the study has no more.
    pub fn start_next_component(
        &self,
        raw_token: &str,
        run_id: RunId,
    ) -> Result<Option<ComponentStart>, PublixError> {
        self.traced(Some(run_id), "start_next_component", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            match self.runs.next_active_component(&session.study, run_id)? {
                Some(component) => self.start_in_session(&session, component.id).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn retrieve_init_data(
        &self,
        raw_token: &str,
        run_id: RunId,
        component_id: ComponentId,
    ) -> Result<InitData, PublixError> {
        self.traced(Some(run_id), "retrieve_init_data", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            let component = self.runs.retrieve_component(&session.study, component_id)?;
            let (run, component_run) = self
                .runs
                .retrieve_init_data(run_id, &component)
                .map_err(|err| self.end_after_violation(run_id, err))?;
            let (token, position) = self.issue(&session, &run, &component_run)?;
            Ok(InitData {
                token,
                worker_id: session.worker.id,
                batch_id: session.batch.id,
                study_id: session.study.id,
                run_id,
                component_id,
                component_run_id: component_run.id,
                position,
                group_id: run.group_id,
                study_session_data: run.session_data,
            })
        })
    }

    pub fn set_session_data(
        &self,
        raw_token: &str,
        run_id: RunId,
        data: String,
    ) -> Result<(), PublixError> {
        self.traced(Some(run_id), "set_session_data", || {
            self.authenticate(raw_token, run_id, true)?;
            self.runs.set_session_data(run_id, data)?;
            Ok(())
        })
    }

    pub fn heartbeat(&self, raw_token: &str, run_id: RunId) -> Result<(), PublixError> {
        self.traced(Some(run_id), "heartbeat", || {
            self.authenticate(raw_token, run_id, true)?;
            self.runs.heartbeat(run_id)?;
            Ok(())
        })
    }

    pub fn submit_result_data(
        &self,
        raw_token: &str,
        run_id: RunId,
        component_id: ComponentId,
        payload: &str,
        append: bool,
    ) -> Result<ComponentRun, PublixError> {
        self.traced(Some(run_id), "submit_result_data", || {
            self.authenticate(raw_token, run_id, true)?;
            self.sink.submit(run_id, component_id, payload, append)
        })
    }

    pub fn upload_file(
        &self,
        raw_token: &str,
        run_id: RunId,
        component_id: ComponentId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, PublixError> {
        self.traced(Some(run_id), "upload_file", || {
            self.authenticate(raw_token, run_id, true)?;
            self.sink.upload_file(run_id, component_id, filename, bytes)
        })
    }

    pub fn download_file(
        &self,
        raw_token: &str,
        run_id: RunId,
        filename: &str,
        component_run_id: Option<ComponentRunId>,
    ) -> Result<Vec<u8>, PublixError> {
        self.traced(Some(run_id), "download_file", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            self.sink
                .download_file(&session.run, filename, component_run_id)
        })
    }

    pub fn join_group(&self, raw_token: &str, run_id: RunId) -> Result<GroupMembership, PublixError> {
        self.traced(Some(run_id), "join_group", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            let group = self.groups.join(run_id)?;
            let (token, _) = self.issue_for_last(&session)?;
            Ok(GroupMembership { token, group })
        })
    }

    /// Leaves the run's group; returns the reissued token.
    pub fn leave_group(&self, raw_token: &str, run_id: RunId) -> Result<String, PublixError> {
        self.traced(Some(run_id), "leave_group", || {
            let session = self.authenticate(raw_token, run_id, true)?;
            self.close_group_channel_and_leave(&session.run)?;
            let (token, _) = self.issue_for_last(&session)?;
            Ok(token)
        })
    }

    /// Finishes the run. Returns the confirmation code for platform-bound
    /// workers, also when the run was finished before.
    pub fn finish_run(
        &self,
        raw_token: &str,
        run_id: RunId,
        successful: bool,
        message: Option<String>,
    ) -> Result<Option<String>, PublixError> {
        self.traced(Some(run_id), "finish_run", || {
            let session = self.authenticate(raw_token, run_id, false)?;
            let run = if session.run.is_done() {
                session.run
            } else {
                let message = message.as_deref().map(single_line);
                let outcome = self.runs.finish_run(run_id, successful, message)?;
                if outcome.transitioned {
                    self.close_group_channel_and_leave(&outcome.run)?;
                }
                outcome.run
            };
            if session.worker.kind.capabilities().platform_bound {
                Ok(run.confirmation_code)
            } else {
                Ok(None)
            }
        })
    }

    pub fn abort_run(
        &self,
        raw_token: &str,
        run_id: RunId,
        message: Option<String>,
    ) -> Result<(), PublixError> {
        self.traced(Some(run_id), "abort_run", || {
            let session = self.authenticate(raw_token, run_id, false)?;
            if session.run.is_done() {
                return Ok(());
            }
            let message = message.as_deref().map(single_line);
            let outcome = self.runs.abort_run(run_id, message)?;
            if outcome.transitioned {
                self.close_group_channel_and_leave(&outcome.run)?;
            }
            Ok(())
        })
    }

    /// Relays a client log message as one line.
    pub fn log(&self, raw_token: &str, run_id: RunId, message: &str) -> Result<(), PublixError> {
        self.traced(Some(run_id), "log", || {
            let session = self.authenticate(raw_token, run_id, false)?;
            let component_run_id = self
                .runs
                .retrieve_last_component_run(run_id)?
                .map(|c| c.id);
            self.runs
                .log(&session.run, component_run_id, &single_line(message));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use publix_kernel::{
        Component, ComponentRunState, GroupState, InMemoryPublixStore, MemoryAuditLog, StoreSeed,
        WorkerKind,
    };

    use super::*;
    use crate::id_token::IdTokenError;

    #[derive(Default)]
    struct RecordingChannel {
        closed: Mutex<Vec<RunId>>,
    }

    impl GroupChannel for RecordingChannel {
        fn close_and_leave(&self, run: &Run) {
            self.closed.lock().expect("channel lock").push(run.id);
        }
    }

    fn seed(group_study: bool, linear_flow: bool) -> StoreSeed {
        let component = |id, reloadable| Component {
            id,
            study_id: 1,
            title: format!("c{}", id),
            active: true,
            reloadable,
        };
        StoreSeed {
            studies: vec![Study {
                id: 1,
                title: "study".into(),
                component_ids: vec![10, 20, 30],
                group_study,
                max_group_size: 2,
                linear_flow,
            }],
            components: vec![component(10, false), component(20, true), component(30, false)],
            batches: vec![Batch {
                id: 1,
                study_id: 1,
                title: "default".into(),
                active: true,
                allowed_kinds: WorkerKind::ALL.into_iter().collect(),
                max_total_workers: None,
                worker_ids: BTreeSet::new(),
            }],
            workers: vec![],
        }
    }

    struct Harness {
        publix: Publix<InMemoryPublixStore>,
        audit: Arc<MemoryAuditLog>,
        channel: Arc<RecordingChannel>,
    }

    fn harness(seed: StoreSeed) -> Harness {
        let audit = Arc::new(MemoryAuditLog::new());
        let channel = Arc::new(RecordingChannel::default());
        let publix = Publix::builder(Arc::new(InMemoryPublixStore::from_seed(seed)))
            .audit_log(audit.clone())
            .group_channel(channel.clone())
            .token_codec(IdTokenCodec::new(b"test".to_vec()))
            .build()
            .expect("build publix");
        Harness {
            publix,
            audit,
            channel,
        }
    }

    fn start(h: &Harness, kind: WorkerKind) -> ComponentStart {
        h.publix
            .start_run(
                1,
                &StartRunRequest {
                    worker: WorkerRequest {
                        kind,
                        worker_id: None,
                        platform_worker_id: match kind {
                            WorkerKind::Platform | WorkerKind::PlatformSandbox => {
                                Some("MT-1".into())
                            }
                            _ => None,
                        },
                    },
                    preview: false,
                },
            )
            .expect("start run")
    }

    #[test]
    fn start_run_starts_first_component_and_issues_token() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::AnonymousRepeatable);
        assert_eq!(started.component_run.component_id, 10);
        assert_eq!(started.position, 1);
        let token = h.publix.codec().decode(&started.token).unwrap();
        assert_eq!(token.run_id, started.run.id);
        assert_eq!(token.group_id, None);
        assert_eq!(token.batch_id, 1);
    }

    #[test]
    fn start_without_active_components_stores_nothing() {
        let mut inactive = seed(false, false);
        for component in inactive.components.iter_mut() {
            component.active = false;
        }
        inactive.batches[0].max_total_workers = Some(1);
        let h = harness(inactive);
        let request = StartRunRequest {
            worker: WorkerRequest {
                kind: WorkerKind::Platform,
                worker_id: None,
                platform_worker_id: Some("MT-1".into()),
            },
            preview: false,
        };

        for _ in 0..2 {
            let err = h.publix.start_run(1, &request).unwrap_err();
            assert!(matches!(err, PublixError::NoActiveComponents(1)));
        }
        let store = h.publix.store();
        assert!(store.find_worker_by_platform_id("MT-1").unwrap().is_none());
        assert!(store.find_batch(1).unwrap().unwrap().worker_ids.is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[test]
    fn token_must_match_the_addressed_run() {
        let h = harness(seed(false, false));
        let a = start(&h, WorkerKind::AnonymousRepeatable);
        let b = start(&h, WorkerKind::AnonymousRepeatable);
        let err = h.publix.heartbeat(&a.token, b.run.id).unwrap_err();
        assert!(matches!(err, PublixError::Forbidden(_)));
        let err = h.publix.heartbeat("nonsense", a.run.id).unwrap_err();
        assert!(matches!(err, PublixError::Token(IdTokenError::Malformed(_))));
    }

    #[test]
    fn refused_reload_ends_the_run_unsuccessfully() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::AnonymousRepeatable);
        let err = h
            .publix
            .start_component(&started.token, started.run.id, 10)
            .unwrap_err();
        assert!(matches!(err, PublixError::ForbiddenReload { .. }));
        let run = h.publix.store().require_run(started.run.id).unwrap();
        assert_eq!(run.state, RunState::Fail);
        assert!(run.error_msg.unwrap().contains("can't be reloaded"));
        assert_eq!(h.channel.closed.lock().unwrap().as_slice(), &[started.run.id]);
    }

    #[test]
    fn component_navigation_reissues_tokens() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::PersonalMultiple);
        let next = h
            .publix
            .start_next_component(&started.token, started.run.id)
            .unwrap()
            .expect("second component");
        assert_eq!(next.component_run.component_id, 20);
        assert_ne!(next.token, started.token);
        let third = h
            .publix
            .start_component_by_position(&next.token, started.run.id, Some(3))
            .unwrap();
        assert_eq!(third.component_run.component_id, 30);
        assert!(h
            .publix
            .start_next_component(&third.token, started.run.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn init_data_and_session_data_flow() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::AnonymousRepeatable);
        let run_id = started.run.id;
        h.publix
            .set_session_data(&started.token, run_id, "{\"k\":1}".into())
            .unwrap();
        let init = h
            .publix
            .retrieve_init_data(&started.token, run_id, 10)
            .unwrap();
        assert_eq!(init.component_run_id, started.component_run.id);
        assert_eq!(init.position, 1);
        assert_eq!(init.study_session_data.as_deref(), Some("{\"k\":1}"));
        let run = h.publix.store().require_run(run_id).unwrap();
        assert_eq!(run.state, RunState::DataRetrieved);
    }

    #[test]
    fn finish_returns_code_for_platform_workers_only() {
        let h = harness(seed(false, false));
        let mt = start(&h, WorkerKind::Platform);
        let code = h
            .publix
            .finish_run(&mt.token, mt.run.id, true, None)
            .unwrap()
            .expect("confirmation code");
        let again = h
            .publix
            .finish_run(&mt.token, mt.run.id, true, None)
            .unwrap();
        assert_eq!(again.as_deref(), Some(code.as_str()));

        let anon = start(&h, WorkerKind::AnonymousRepeatable);
        assert!(h
            .publix
            .finish_run(&anon.token, anon.run.id, true, None)
            .unwrap()
            .is_none());
        assert!(h
            .publix
            .store()
            .require_run(anon.run.id)
            .unwrap()
            .confirmation_code
            .is_some());
    }

    #[test]
    fn single_run_worker_cannot_restart_with_old_identity() {
        let h = harness(seed(false, false));
        let first = start(&h, WorkerKind::PersonalSingle);
        let request = StartRunRequest {
            worker: WorkerRequest {
                kind: WorkerKind::PersonalSingle,
                worker_id: Some(first.run.worker_id),
                platform_worker_id: None,
            },
            preview: false,
        };
        let err = h.publix.start_run(1, &request).unwrap_err();
        assert!(matches!(err, PublixError::StudyCanBeDoneOnlyOnce(1)));
    }

    #[test]
    fn preview_start_reuses_pre_run() {
        let h = harness(seed(false, false));
        let mut request = StartRunRequest {
            worker: WorkerRequest {
                kind: WorkerKind::AnonymousSingle,
                worker_id: None,
                platform_worker_id: None,
            },
            preview: true,
        };
        let first = h.publix.start_run(1, &request).unwrap();
        assert_eq!(first.run.state, RunState::Pre);
        request.worker.worker_id = Some(first.run.worker_id);
        let again = h.publix.start_run(1, &request).unwrap();
        assert_eq!(again.run.id, first.run.id);
        assert_eq!(
            h.publix
                .store()
                .find_component_run(first.component_run.id)
                .unwrap()
                .unwrap()
                .state,
            ComponentRunState::Reloaded
        );
    }

    #[test]
    fn repeatable_restart_fails_previous_open_run() {
        let h = harness(seed(false, false));
        let first = start(&h, WorkerKind::PersonalMultiple);
        let request = StartRunRequest {
            worker: WorkerRequest {
                kind: WorkerKind::PersonalMultiple,
                worker_id: Some(first.run.worker_id),
                platform_worker_id: None,
            },
            preview: false,
        };
        let second = h.publix.start_run(1, &request).unwrap();
        assert_ne!(second.run.id, first.run.id);
        let old = h.publix.store().require_run(first.run.id).unwrap();
        assert_eq!(old.state, RunState::Fail);
        assert!(matches!(
            h.publix.heartbeat(&first.token, first.run.id),
            Err(PublixError::Forbidden(_))
        ));
    }

    #[test]
    fn group_join_reissues_token_and_abort_leaves() {
        let h = harness(seed(true, false));
        let a = start(&h, WorkerKind::AnonymousRepeatable);
        let b = start(&h, WorkerKind::AnonymousRepeatable);
        let joined_a = h.publix.join_group(&a.token, a.run.id).unwrap();
        let joined_b = h.publix.join_group(&b.token, b.run.id).unwrap();
        assert_eq!(joined_b.group.state, GroupState::Complete);
        let token = h.publix.codec().decode(&joined_a.token).unwrap();
        assert_eq!(token.group_id, Some(joined_a.group.id));

        h.publix
            .abort_run(&joined_a.token, a.run.id, Some("bye\nnow".into()))
            .unwrap();
        let aborted = h.publix.store().require_run(a.run.id).unwrap();
        assert_eq!(aborted.state, RunState::Aborted);
        assert_eq!(aborted.abort_msg.as_deref(), Some("bye now"));
        assert_eq!(aborted.group_id, None);
        let group = h
            .publix
            .store()
            .find_group(joined_b.group.id)
            .unwrap()
            .unwrap();
        assert_eq!(group.member_run_ids, vec![b.run.id]);
        assert_eq!(group.state, GroupState::Incomplete);

        let token = h.publix.leave_group(&joined_b.token, b.run.id).unwrap();
        assert_eq!(h.publix.codec().decode(&token).unwrap().group_id, None);
        assert!(h.publix.store().find_group(joined_b.group.id).unwrap().is_none());
    }

    #[test]
    fn result_data_and_log_are_audited() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::AnonymousRepeatable);
        let cr = h
            .publix
            .submit_result_data(&started.token, started.run.id, 10, "abc", false)
            .unwrap();
        assert_eq!(cr.state, ComponentRunState::ResultdataPosted);
        h.publix
            .log(&started.token, started.run.id, "line one\n\tline two")
            .unwrap();
        let entries = h.audit.entries();
        assert!(entries
            .iter()
            .any(|e| e.message == "Logging from client: line one line two"));
        assert!(entries.iter().any(|e| e.message.starts_with("Submitted result data")));
    }

    #[test]
    fn files_round_trip_through_the_facade() {
        let h = harness(seed(false, false));
        let started = start(&h, WorkerKind::AnonymousRepeatable);
        h.publix
            .upload_file(&started.token, started.run.id, 10, "notes.txt", b"hi")
            .unwrap();
        let bytes = h
            .publix
            .download_file(&started.token, started.run.id, "notes.txt", None)
            .unwrap();
        assert_eq!(bytes, b"hi".to_vec());
    }
}
