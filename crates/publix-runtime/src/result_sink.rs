//! Result data and result file intake.

use std::sync::Arc;

use publix_kernel::{
    AuditEntry, AuditLog, ComponentId, ComponentRun, ComponentRunId, ComponentRunState,
    PublixStore, Run, RunId,
};

use crate::config::UploadLimits;
use crate::error::PublixError;
use crate::locks::EngineLocks;
use crate::result_files::{check_filename, ResultFileStore, StoredFile};

pub struct ResultSink<S: PublixStore + ?Sized> {
    store: Arc<S>,
    files: Arc<dyn ResultFileStore>,
    audit: Arc<dyn AuditLog>,
    locks: Arc<EngineLocks>,
    result_data_max_size: usize,
    uploads: UploadLimits,
}

impl<S: PublixStore + ?Sized> Clone for ResultSink<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            files: self.files.clone(),
            audit: self.audit.clone(),
            locks: self.locks.clone(),
            result_data_max_size: self.result_data_max_size,
            uploads: self.uploads.clone(),
        }
    }
}

impl<S: PublixStore + ?Sized> ResultSink<S> {
    pub fn new(
        store: Arc<S>,
        files: Arc<dyn ResultFileStore>,
        audit: Arc<dyn AuditLog>,
        locks: Arc<EngineLocks>,
        result_data_max_size: usize,
        uploads: UploadLimits,
    ) -> Self {
        Self {
            store,
            files,
            audit,
            locks,
            result_data_max_size,
            uploads,
        }
    }

    /// The run's open component-run, which must belong to `component_id`.
    fn current_for(
        &self,
        run: &Run,
        component_id: ComponentId,
    ) -> Result<ComponentRun, PublixError> {
        self.store
            .list_component_runs(run.id)?
            .pop()
            .filter(|c| !c.is_done() && c.component_id == component_id)
            .ok_or_else(|| {
                PublixError::forbidden(format!(
                    "there is no current component result for component {} in study run {}",
                    component_id, run.id
                ))
            })
    }

    fn open_run(&self, run_id: RunId) -> Result<Run, PublixError> {
        let run = self.store.require_run(run_id)?;
        if run.is_done() {
            return Err(PublixError::forbidden(format!(
                "study run {} is finished already",
                run_id
            )));
        }
        Ok(run)
    }

    /// Stores result data for the run's current component-run, replacing it or
    /// appending to it. The size ceiling applies to the resulting data.
    pub fn submit(
        &self,
        run_id: RunId,
        component_id: ComponentId,
        payload: &str,
        append: bool,
    ) -> Result<ComponentRun, PublixError> {
        self.locks.runs.with(run_id, || {
            let run = self.open_run(run_id)?;
            let mut component_run = self.current_for(&run, component_id)?;
            let data = if append {
                let mut data = component_run.data.clone().unwrap_or_default();
                data.push_str(payload);
                data
            } else {
                payload.to_string()
            };
            if data.len() > self.result_data_max_size {
                return Err(PublixError::PayloadTooLarge {
                    size: data.len(),
                    limit: self.result_data_max_size,
                });
            }
            let size = data.len();
            component_run.data = Some(data);
            component_run.state = ComponentRunState::ResultdataPosted;
            self.store.update_component_run(component_run.clone())?;

            tracing::debug!(
                run_id,
                component_run_id = component_run.id,
                size,
                append,
                "result data stored"
            );
            self.audit.record(
                AuditEntry::new(
                    run.study_id,
                    format!(
                        "{} result data, now {} bytes",
                        if append { "Appended" } else { "Submitted" },
                        size
                    ),
                )
                .with_run(run.id, run.worker_id)
                .with_component_run(component_run.id),
            );
            Ok(component_run)
        })
    }

    /// Stores an uploaded file for the run's current component-run.
    /// Checks run in order: feature switch, current component-run, file size,
    /// per-run quota, filename.
    pub fn upload_file(
        &self,
        run_id: RunId,
        component_id: ComponentId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, PublixError> {
        if !self.uploads.enabled {
            return Err(PublixError::UploadsDisabled);
        }
        self.locks.runs.with(run_id, || {
            let run = self.open_run(run_id)?;
            let component_run = self.current_for(&run, component_id)?;
            let size = bytes.len() as u64;
            if size > self.uploads.max_file_size {
                return Err(PublixError::FileTooLarge {
                    size,
                    limit: self.uploads.max_file_size,
                });
            }
            // A same-name upload replaces the component-run's earlier file.
            let replaced = match check_filename(filename) {
                Ok(()) => self
                    .files
                    .file_size(run_id, component_run.id, filename)?
                    .unwrap_or(0),
                Err(_) => 0,
            };
            let used = self.files.run_usage(run_id)?.saturating_sub(replaced);
            if used + size > self.uploads.limit_per_run {
                return Err(PublixError::QuotaExceeded {
                    used,
                    limit: self.uploads.limit_per_run,
                });
            }
            check_filename(filename)?;
            let stored = self.files.put(run_id, component_run.id, filename, bytes)?;

            tracing::info!(
                run_id,
                component_run_id = component_run.id,
                filename,
                size,
                "result file uploaded"
            );
            self.audit.record(
                AuditEntry::new(
                    run.study_id,
                    format!("Uploaded result file '{}' ({} bytes)", filename, size),
                )
                .with_run(run.id, run.worker_id)
                .with_component_run(component_run.id),
            );
            Ok(stored)
        })
    }

    /// Latest upload of `filename` in the run, optionally from one
    /// component-run only.
    pub fn download_file(
        &self,
        run: &Run,
        filename: &str,
        component_run_id: Option<ComponentRunId>,
    ) -> Result<Vec<u8>, PublixError> {
        check_filename(filename)?;
        if let Some(id) = component_run_id {
            let owned = self
                .store
                .find_component_run(id)?
                .is_some_and(|c| c.run_id == run.id);
            if !owned {
                return Err(PublixError::forbidden(format!(
                    "component result {} doesn't belong to study run {}",
                    id, run.id
                )));
            }
        }
        self.files
            .latest(run.id, filename, component_run_id)?
            .ok_or_else(|| {
                PublixError::not_found(format!(
                    "result file '{}' doesn't exist in study run {}",
                    filename, run.id
                ))
            })
    }
}
