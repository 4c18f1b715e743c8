//! Publix runtime: the study-execution engine.
//!
//! [`Publix`] drives a participant through a study. It issues signed identity
//! tokens, moves runs and component-runs through their state machines,
//! authorizes workers by kind, places runs of group studies into groups and
//! accepts result data and result files. Persistence, audit logging and group
//! messaging are reached through the interfaces in `publix_kernel`.

pub mod authorization;
pub mod config;
pub mod error;
pub mod group;
pub mod id_token;
pub mod locks;
pub mod payload;
pub mod publix;
pub mod result_files;
pub mod result_sink;
pub mod run_machine;
pub mod worker_creator;

pub use authorization::{AuthorizationContext, CapabilityAuthorizer, WorkerAuthorizer};
pub use config::{PublixConfig, UploadLimits};
pub use error::{ErrorKind, PublixError};
pub use group::GroupCoordinator;
pub use id_token::{IdToken, IdTokenCodec, IdTokenError};
pub use locks::{EngineLocks, KeyedLocks};
pub use payload::{normalize_request_body, single_line};
pub use publix::{
    ComponentStart, GroupMembership, InitData, Publix, PublixBuilder, StartRunRequest,
};
pub use result_files::{
    FileStoreError, FsResultFileStore, InMemoryResultFileStore, ResultFileStore, StoredFile,
};
pub use result_sink::ResultSink;
pub use run_machine::{RunMachine, RunTransition, NEVER_FINISHED_MSG};
pub use worker_creator::{ResolvedWorker, WorkerCreator, WorkerRequest};
