//! FIFO wait tickets for callers parked at capacity

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::resource::PooledResource;

/// What a parked caller is woken with
pub(crate) enum Grant<H> {
    /// A released handle, passed over without returning to the idle set
    Handle(PooledResource<H>),
    /// A freed capacity slot; the waiter creates its own handle
    Slot,
    /// The pool shut down
    Closed,
}

/// A caller waiting for capacity. Grants are only ever sent while the pool
/// lock is held, and a ticket is always removed from the queue under that
/// same lock, so a ticket is either still queued or already granted.
pub(crate) struct WaitTicket<H> {
    pub(crate) id: u64,
    pub(crate) requested_at: Instant,
    pub(crate) deadline: Instant,
    notify: oneshot::Sender<Grant<H>>,
}

impl<H> WaitTicket<H> {
    pub(crate) fn new(id: u64, requested_at: Instant, deadline: Instant) -> (Self, oneshot::Receiver<Grant<H>>) {
        let (notify, rx) = oneshot::channel();
        (
            Self {
                id,
                requested_at,
                deadline,
                notify,
            },
            rx,
        )
    }

    /// Wake the waiter. Gives the grant back if the waiter is gone.
    pub(crate) fn grant(self, grant: Grant<H>) -> Result<(), Grant<H>> {
        self.notify.send(grant)
    }
}
