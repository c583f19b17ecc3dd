use std::sync::Arc;

use crate::hook::{RawRegion, TransferInfo};
use crate::memory::block::BlockId;
use crate::memory::view::MemView;
use crate::stream::Task;

/// One in-flight request on the deferred device.
///
/// Owns its memory block while active and carries the list of observer views
/// notified on completion. Created when a view requests a transfer on a
/// not-busy block; destroyed exactly once per completion, after observers are
/// collected. Access always happens under the device lock.
pub(crate) struct LowLevelTransfer {
    pub info: TransferInfo,
    pub block: BlockId,
    /// Task that initiated the transfer; its descriptor is the one passed to
    /// the backend's cancel.
    pub owner: Task,
    /// Views sharing this transfer. At least one while the transfer lives.
    pub observers: Vec<Arc<MemView>>,
    /// Set when the request was pushed to the backend, to avoid pushing it
    /// more than once.
    pub was_sent_to_llio: bool,
    /// Set when the backend's cancel was called, to avoid calling it more
    /// than once.
    pub was_llio_cancel_called: bool,
    pub write: bool,
    pub region: RawRegion,
}

impl LowLevelTransfer {
    /// A transfer may only be truly cancelled when its single observer is the
    /// caller's view and that view belongs to the transfer's own task;
    /// otherwise cancellation would race other tasks' lock scopes.
    pub fn can_cancel(&self, view: &Arc<MemView>) -> bool {
        if self.observers.len() != 1 {
            return false;
        }
        let only = &self.observers[0];
        if !Arc::ptr_eq(only, view) {
            return false;
        }
        match &only.owner {
            Some(owner) => owner.same_as(&self.owner),
            None => false,
        }
    }
}
