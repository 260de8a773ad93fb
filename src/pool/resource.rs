//! Pooled resource wrapper and lifecycle state

use tokio::time::Instant;

/// Lifecycle of a pooled handle.
///
/// `Idle → Active → Idle`, or `Active → Invalid → Closed`. A closed handle is
/// never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Parked in the pool
    Idle,
    /// Held by exactly one caller
    Active,
    /// Failed validation or reported broken, about to be closed
    Invalid,
    /// Closed by the manager
    Closed,
}

/// A backend handle plus the bookkeeping the pool keeps about it
#[derive(Debug)]
pub struct PooledResource<H> {
    id: u64,
    handle: H,
    state: ResourceState,
    created_at: Instant,
    last_validated_at: Option<Instant>,
}

impl<H> PooledResource<H> {
    pub(crate) fn new(id: u64, handle: H) -> Self {
        Self {
            id,
            handle,
            state: ResourceState::Active,
            created_at: Instant::now(),
            last_validated_at: None,
        }
    }

    /// Pool-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last successful validation, if any
    pub fn last_validated_at(&self) -> Option<Instant> {
        self.last_validated_at
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    pub(crate) fn mark_validated(&mut self) {
        self.last_validated_at = Some(Instant::now());
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}
