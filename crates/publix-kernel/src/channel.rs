//! Group messaging channel seam.
//!
//! Live group channels (websocket fan-out between members) are owned by the
//! host. The engine only tells the host when a run's channel must go away.

use crate::models::Run;

pub trait GroupChannel: Send + Sync {
    /// Closes the run's channel, if any, and detaches it from its group's
    /// broadcast set.
    fn close_and_leave(&self, run: &Run);
}

/// Channel for hosts without live group messaging.
#[derive(Clone, Debug, Default)]
pub struct NoopGroupChannel;

impl GroupChannel for NoopGroupChannel {
    fn close_and_leave(&self, run: &Run) {
        tracing::debug!(run_id = run.id, "no group channel to close");
    }
}
