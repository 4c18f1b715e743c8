//! Group coordinator for group studies.
//!
//! Membership changes run under the study lock (then the run lock), and both
//! sides of the run/group relation are committed in one change set.

use std::sync::Arc;

use chrono::Utc;

use publix_kernel::{
    AuditEntry, AuditLog, ChangeSet, EntityKind, Group, GroupState, PublixStore, Run, RunId,
};

use crate::error::PublixError;
use crate::locks::EngineLocks;

pub struct GroupCoordinator<S: PublixStore + ?Sized> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    locks: Arc<EngineLocks>,
}

impl<S: PublixStore + ?Sized> Clone for GroupCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            audit: self.audit.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: PublixStore + ?Sized> GroupCoordinator<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>, locks: Arc<EngineLocks>) -> Self {
        Self {
            store,
            audit,
            locks,
        }
    }

    fn audit_run(&self, run: &Run, message: String) {
        self.audit
            .record(AuditEntry::new(run.study_id, message).with_run(run.id, run.worker_id));
    }

    /// Puts the run into the study's first incomplete group, creating one when
    /// none has a free seat. A run that already has a group keeps it.
    pub fn join(&self, run_id: RunId) -> Result<Group, PublixError> {
        let study_id = self.store.require_run(run_id)?.study_id;
        self.locks.studies.with(study_id, || {
            self.locks.runs.with(run_id, || {
                let mut run = self.store.require_run(run_id)?;
                if let Some(group_id) = run.group_id {
                    return self.store.find_group(group_id)?.ok_or_else(|| {
                        PublixError::Internal(format!(
                            "run {} references missing group {}",
                            run_id, group_id
                        ))
                    });
                }
                if run.is_done() {
                    return Err(PublixError::forbidden(format!(
                        "study run {} is finished already",
                        run_id
                    )));
                }
                let study = self.store.require_study(study_id)?;
                if !study.group_study {
                    return Err(PublixError::forbidden(format!(
                        "study {} isn't a group study",
                        study_id
                    )));
                }
                let max_size = study.max_group_size.max(1);
                let mut group = match self.store.find_first_incomplete_group(study_id)? {
                    Some(group) => group,
                    None => Group {
                        id: self.store.next_id(EntityKind::Group)?,
                        study_id,
                        state: GroupState::Incomplete,
                        member_run_ids: Vec::new(),
                        created_at: Utc::now(),
                    },
                };
                if group.member_run_ids.len() as u64 >= max_size as u64 {
                    return Err(PublixError::Internal(format!(
                        "group {} is full but marked incomplete",
                        group.id
                    )));
                }
                group.member_run_ids.push(run_id);
                group.recompute_state(max_size);
                run.group_id = Some(group.id);
                self.store
                    .apply(ChangeSet::new().group(group.clone()).run(run.clone()))?;

                tracing::info!(
                    run_id,
                    study_id,
                    group_id = group.id,
                    members = group.member_run_ids.len(),
                    state = ?group.state,
                    "run joined group"
                );
                self.audit_run(&run, format!("Joined group {}", group.id));
                Ok(group)
            })
        })
    }

    /// Takes the run out of its group; the group is deleted once empty.
    /// Returns the group as it is after the change, `None` when the run had no
    /// group or the group is gone.
    pub fn leave(&self, run_id: RunId) -> Result<Option<Group>, PublixError> {
        let study_id = self.store.require_run(run_id)?.study_id;
        self.locks.studies.with(study_id, || {
            self.locks.runs.with(run_id, || {
                let mut run = self.store.require_run(run_id)?;
                let Some(group_id) = run.group_id.take() else {
                    return Ok(None);
                };
                let study = self.store.require_study(study_id)?;
                let group = self.store.find_group(group_id)?;
                let mut changes = ChangeSet::new().run(run.clone());
                let remaining = match group {
                    Some(mut group) => {
                        group.member_run_ids.retain(|id| *id != run_id);
                        if group.member_run_ids.is_empty() {
                            changes = changes.remove_group(group.id);
                            None
                        } else {
                            group.recompute_state(study.max_group_size.max(1));
                            changes = changes.group(group.clone());
                            Some(group)
                        }
                    }
                    None => None,
                };
                self.store.apply(changes)?;

                tracing::info!(
                    run_id,
                    study_id,
                    group_id,
                    dissolved = remaining.is_none(),
                    "run left group"
                );
                self.audit_run(&run, format!("Left group {}", group_id));
                Ok(remaining)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use publix_kernel::{
        InMemoryPublixStore, MemoryAuditLog, RunState, StoreSeed, Study, Worker, WorkerKind,
    };

    use super::*;

    fn setup(group_study: bool) -> (GroupCoordinator<InMemoryPublixStore>, Arc<InMemoryPublixStore>) {
        let store = Arc::new(InMemoryPublixStore::from_seed(StoreSeed {
            studies: vec![Study {
                id: 1,
                title: "g".into(),
                component_ids: vec![],
                group_study,
                max_group_size: 2,
                linear_flow: false,
            }],
            ..StoreSeed::default()
        }));
        let now = Utc::now();
        let mut changes = ChangeSet::new().worker(Worker {
            id: 1,
            kind: WorkerKind::AnonymousRepeatable,
            platform_worker_id: None,
            created_at: now,
            run_ids: vec![],
        });
        for id in 1..=3 {
            changes = changes.run(Run {
                id,
                study_id: 1,
                batch_id: 1,
                worker_id: 1,
                state: RunState::Started,
                started_at: now,
                ended_at: None,
                last_seen_at: now,
                confirmation_code: None,
                session_data: None,
                error_msg: None,
                abort_msg: None,
                group_id: None,
                next_component_seq: 1,
            });
        }
        store.apply(changes).unwrap();
        let coordinator = GroupCoordinator::new(
            store.clone(),
            Arc::new(MemoryAuditLog::new()),
            Arc::new(EngineLocks::new()),
        );
        (coordinator, store)
    }

    #[test]
    fn join_fills_groups_in_order() {
        let (groups, store) = setup(true);
        let g1 = groups.join(1).unwrap();
        assert_eq!(g1.state, GroupState::Incomplete);
        let g1 = groups.join(2).unwrap();
        assert_eq!(g1.state, GroupState::Complete);
        assert_eq!(g1.member_run_ids, vec![1, 2]);
        let g2 = groups.join(3).unwrap();
        assert_ne!(g2.id, g1.id);
        assert_eq!(store.require_run(3).unwrap().group_id, Some(g2.id));
    }

    #[test]
    fn join_is_idempotent() {
        let (groups, _) = setup(true);
        let first = groups.join(1).unwrap();
        let again = groups.join(1).unwrap();
        assert_eq!(first, again);
        assert_eq!(again.member_run_ids, vec![1]);
    }

    #[test]
    fn leave_reopens_then_dissolves() {
        let (groups, store) = setup(true);
        let group = groups.join(1).unwrap();
        groups.join(2).unwrap();
        let after = groups.leave(2).unwrap().unwrap();
        assert_eq!(after.state, GroupState::Incomplete);
        assert_eq!(store.require_run(2).unwrap().group_id, None);
        assert!(groups.leave(1).unwrap().is_none());
        assert!(store.find_group(group.id).unwrap().is_none());
        assert!(groups.leave(1).unwrap().is_none());
    }

    #[test]
    fn non_group_study_cannot_join() {
        let (groups, _) = setup(false);
        assert!(matches!(groups.join(1), Err(PublixError::Forbidden(_))));
    }
}
