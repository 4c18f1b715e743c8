//! Identifier types for publix entities.
//!
//! All ids are assigned by the persistence layer. Seq orders component-runs
//! within one run and is never reused.

pub type WorkerId = u64;

pub type BatchId = u64;

pub type StudyId = u64;

pub type ComponentId = u64;

/// Identifies one worker's attempt at one study (a study result).
pub type RunId = u64;

/// Identifies one execution of one component within a run.
pub type ComponentRunId = u64;

pub type GroupId = u64;

/// Monotonically increasing component-run sequence number per run.
pub type Seq = u64;
