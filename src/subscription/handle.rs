use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use super::types::SubscriptionId;

/// Operations a handle forwards to the client that issued it
pub trait SubscriptionControl: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId);
    fn pause(&self, id: SubscriptionId);
    fn resume(&self, id: SubscriptionId);
}

/// Capability to remove exactly one handler registration.
///
/// Dropping the handle unsubscribes; call [`detach`](Self::detach) to keep
/// the handler registered for the lifetime of the client instead.
#[must_use = "dropping a SubscriptionHandle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    channel: String,
    control: Weak<dyn SubscriptionControl>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriptionId,
        channel: String,
        control: Weak<dyn SubscriptionControl>,
    ) -> Self {
        Self {
            id,
            channel,
            control,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove this handler. Idempotent; the handler is not invoked after
    /// the first call returns.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(control) = self.control.upgrade() {
            control.unsubscribe(self.id);
        }
    }

    pub fn pause(&self) {
        if let Some(control) = self.control.upgrade() {
            control.pause(self.id);
        }
    }

    /// Deliver anything buffered while paused, then resume live delivery.
    pub fn resume(&self) {
        if let Some(control) = self.control.upgrade() {
            control.resume(self.id);
        }
    }

    /// Give up the handle without unsubscribing.
    pub fn detach(self) -> SubscriptionId {
        self.released.store(true, Ordering::Release);
        self.id
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
