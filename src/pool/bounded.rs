//! Bounded Resource Pool
//!
//! Hands out at most `max_handles` backend handles. Callers arriving at
//! capacity park in a FIFO queue and are woken directly by a release, so
//! no time is spent polling.
//!
//! # Accounting
//!
//! ```text
//! active + idle <= total <= max_handles
//! ```
//!
//! `total` counts live handles plus slots reserved for handles still being
//! created. Every path that gives up a handle or a reservation either passes
//! the slot to the oldest waiter or decrements `total`.
//!
//! # Cancellation
//!
//! Dropping an `acquire` future, or a `Pooled` guard, never leaks capacity:
//! tickets withdraw themselves, grants that were already sent are returned,
//! and half-finished releases discard their handle.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::HandleManager;
use super::metrics::PoolMetrics;
use super::resource::{PooledResource, ResourceState};
use super::waiter::{Grant, WaitTicket};
use super::PoolConfig;
use crate::error::{Error, Result};

/// Deadline used when `now + timeout` overflows
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live handles, including ones being created
    pub total: usize,
    /// Handles held by callers
    pub active: usize,
    /// Handles parked in the pool
    pub idle: usize,
    /// Callers queued for a handle
    pub waiting: usize,
}

/// Outcome of [`ResourcePool::health_check`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle handles validated
    pub checked: usize,
    /// Handles closed because they failed validation or no longer fit
    pub closed: usize,
}

// =============================================================================
// Shared State
// =============================================================================

struct PoolState<H> {
    idle: VecDeque<PooledResource<H>>,
    waiters: VecDeque<WaitTicket<H>>,
    total: usize,
    active: usize,
    closed: bool,
}

impl<H> PoolState<H> {
    /// Pass a handle to the oldest waiter; returns it if nobody is waiting
    fn offer_handle(&mut self, mut res: PooledResource<H>) -> Option<PooledResource<H>> {
        while let Some(ticket) = self.waiters.pop_front() {
            let waited = ticket.requested_at.elapsed();
            match ticket.grant(Grant::Handle(res)) {
                Ok(()) => {
                    debug!(?waited, "Handle passed to waiter");
                    return None;
                }
                Err(Grant::Handle(back)) => res = back,
                Err(_) => return None,
            }
        }
        Some(res)
    }

    /// Pass a capacity slot to the oldest waiter
    fn offer_slot(&mut self) -> bool {
        while let Some(ticket) = self.waiters.pop_front() {
            if ticket.grant(Grant::Slot).is_ok() {
                return true;
            }
        }
        false
    }

    /// Give up one unit of `total`, unless a waiter can take it over
    fn free_slot(&mut self) {
        if self.closed || !self.offer_slot() {
            self.total -= 1;
        }
    }

    fn withdraw(&mut self, ticket_id: u64) -> bool {
        match self.waiters.iter().position(|t| t.id == ticket_id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

enum Admission<H> {
    Ready(PooledResource<H>),
    Create,
    Wait {
        ticket_id: u64,
        deadline: Instant,
        rx: oneshot::Receiver<Grant<H>>,
    },
}

struct Shared<M: HandleManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Handle>>,
    metrics: PoolMetrics,
    next_resource_id: AtomicU64,
    next_ticket_id: AtomicU64,
}

impl<M: HandleManager> Shared<M> {
    fn admit(&self, timeout: Duration) -> Result<Admission<M::Handle>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        if let Some(mut res) = state.idle.pop_back() {
            state.active += 1;
            res.set_state(ResourceState::Active);
            return Ok(Admission::Ready(res));
        }

        if state.total < self.config.max_handles {
            state.total += 1;
            return Ok(Admission::Create);
        }

        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let ticket_id = self.next_ticket_id.fetch_add(1, Ordering::Relaxed);
        let (ticket, rx) = WaitTicket::new(ticket_id, now, deadline);
        let deadline = ticket.deadline;
        state.waiters.push_back(ticket);
        Ok(Admission::Wait {
            ticket_id,
            deadline,
            rx,
        })
    }

    fn withdraw_ticket(&self, ticket_id: u64) -> bool {
        self.state.lock().withdraw(ticket_id)
    }

    /// Turn a fresh handle into an active one; false when the pool closed
    /// while it was being created
    fn activate_created(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            state.total -= 1;
            false
        } else {
            state.active += 1;
            true
        }
    }

    /// Give back a creation reservation that will not be used
    fn release_slot(&self) {
        self.state.lock().free_slot();
    }

    /// Forget an active handle that is leaving service
    fn retire_active(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        state.free_slot();
    }

    /// Pass an active handle straight to a waiter
    fn hand_to_waiter(&self, slot: &mut Option<PooledResource<M::Handle>>) -> bool {
        let Some(res) = slot.take() else {
            return true;
        };
        let mut state = self.state.lock();
        if state.closed || state.waiters.is_empty() {
            *slot = Some(res);
            return false;
        }
        match state.offer_handle(res) {
            None => {
                self.metrics.record_handoff();
                true
            }
            Some(back) => {
                *slot = Some(back);
                false
            }
        }
    }

    /// Return an active handle to service: to a waiter that arrived in the
    /// meantime, else to the idle set if there is room
    fn park(&self, slot: &mut Option<PooledResource<M::Handle>>) -> bool {
        let Some(res) = slot.take() else {
            return true;
        };
        let mut state = self.state.lock();
        if state.closed {
            *slot = Some(res);
            return false;
        }

        let mut res = match state.offer_handle(res) {
            None => {
                self.metrics.record_handoff();
                return true;
            }
            Some(res) => res,
        };

        if state.idle.len() < self.config.max_idle() {
            res.set_state(ResourceState::Idle);
            state.active -= 1;
            state.idle.push_back(res);
            true
        } else {
            *slot = Some(res);
            false
        }
    }

    fn shut_down(&self) -> Option<Vec<PooledResource<M::Handle>>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;

        for ticket in state.waiters.drain(..) {
            let _ = ticket.grant(Grant::Closed);
        }
        let idle: Vec<_> = state.idle.drain(..).collect();
        state.total -= idle.len();
        Some(idle)
    }

    /// Take every idle handle out for checking; they count as active until
    /// they are checked back in
    fn check_out_idle(&self) -> Vec<PooledResource<M::Handle>> {
        let mut state = self.state.lock();
        let batch: Vec<_> = state.idle.drain(..).collect();
        state.active += batch.len();
        batch
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            total: state.total,
            active: state.active,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    // =========================================================================
    // Async paths
    // =========================================================================

    /// Create a handle for a slot already counted in `total`
    async fn create_reserved(self: &Arc<Self>) -> Result<Pooled<M>> {
        let mut reservation = Reservation {
            shared: self,
            armed: true,
        };
        let created = self.manager.create().await;
        reservation.armed = false;

        match created {
            Ok(handle) => {
                let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
                let res = PooledResource::new(id, handle);
                if !self.activate_created() {
                    self.manager.close(res.into_handle()).await;
                    self.metrics.record_closed();
                    return Err(Error::PoolClosed);
                }
                self.metrics.record_created();
                self.metrics.record_acquired();
                debug!(resource = id, "Created pooled handle");
                Ok(Pooled::new(self.clone(), res))
            }
            Err(e) => {
                self.release_slot();
                self.metrics.record_create_failure();
                warn!(error = %e, "Failed to create pooled handle");
                Err(match e {
                    Error::HandleCreation(reason) => Error::HandleCreation(reason),
                    other => Error::HandleCreation(other.to_string()),
                })
            }
        }
    }

    async fn redeem(self: &Arc<Self>, grant: Grant<M::Handle>) -> Result<Pooled<M>> {
        match grant {
            Grant::Handle(mut res) => {
                res.set_state(ResourceState::Active);
                self.metrics.record_acquired();
                Ok(Pooled::new(self.clone(), res))
            }
            Grant::Slot => self.create_reserved().await,
            Grant::Closed => Err(Error::PoolClosed),
        }
    }

    /// Bring an active handle back. Returns whether it stayed in service.
    async fn check_in(
        self: &Arc<Self>,
        res: PooledResource<M::Handle>,
        invalid: bool,
        handoff_first: bool,
    ) -> bool {
        let mut returning = Returning {
            shared: self,
            res: Some(res),
        };

        if !invalid {
            // Waiters take the handle as-is
            if handoff_first && self.hand_to_waiter(&mut returning.res) {
                return true;
            }

            let valid = match returning.res.as_ref() {
                Some(res) => self.manager.validate(res.handle()).await,
                None => return true,
            };

            if valid {
                if let Some(res) = returning.res.as_mut() {
                    res.mark_validated();
                }
                if self.park(&mut returning.res) {
                    return true;
                }
            } else {
                self.metrics.record_validation_failure();
                if let Some(res) = returning.res.as_mut() {
                    res.set_state(ResourceState::Invalid);
                }
            }
        }

        if let Some(res) = returning.res.take() {
            self.retire(res).await;
        }
        false
    }

    async fn retire(&self, mut res: PooledResource<M::Handle>) {
        self.retire_active();
        res.set_state(ResourceState::Closed);
        let id = res.id();
        self.manager.close(res.into_handle()).await;
        self.metrics.record_closed();
        debug!(resource = id, "Closed pooled handle");
    }

    /// Synchronous fallback when no runtime is available to run a release
    fn check_in_blocking(self: &Arc<Self>, res: PooledResource<M::Handle>, invalid: bool) {
        let mut slot = Some(res);
        if !invalid && (self.hand_to_waiter(&mut slot) || self.park(&mut slot)) {
            return;
        }
        if let Some(res) = slot {
            self.discard(res);
        }
    }

    /// Take an active handle out of service without awaiting
    fn discard(self: &Arc<Self>, mut res: PooledResource<M::Handle>) {
        self.retire_active();
        res.set_state(ResourceState::Closed);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let shared = self.clone();
                rt.spawn(async move {
                    shared.manager.close(res.into_handle()).await;
                    shared.metrics.record_closed();
                });
            }
            Err(_) => debug!(resource = res.id(), "No runtime, dropping handle without close"),
        }
    }

    /// Put back a grant whose receiver went away
    fn return_grant(self: &Arc<Self>, grant: Grant<M::Handle>) {
        match grant {
            Grant::Handle(res) => self.check_in_blocking(res, false),
            Grant::Slot => self.release_slot(),
            Grant::Closed => {}
        }
    }
}

// =============================================================================
// Drop Guards
// =============================================================================

/// A creation slot reserved in `total`; freed if creation never completes
struct Reservation<'a, M: HandleManager> {
    shared: &'a Arc<Shared<M>>,
    armed: bool,
}

impl<M: HandleManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// A queued ticket; withdraws itself or returns an unclaimed grant
struct TicketGuard<'a, M: HandleManager> {
    shared: &'a Arc<Shared<M>>,
    ticket_id: u64,
    rx: oneshot::Receiver<Grant<M::Handle>>,
    armed: bool,
}

impl<M: HandleManager> Drop for TicketGuard<'_, M> {
    fn drop(&mut self) {
        if !self.armed || self.shared.withdraw_ticket(self.ticket_id) {
            return;
        }
        if let Ok(grant) = self.rx.try_recv() {
            self.shared.return_grant(grant);
        }
    }
}

/// A handle on its way back into the pool
struct Returning<'a, M: HandleManager> {
    shared: &'a Arc<Shared<M>>,
    res: Option<PooledResource<M::Handle>>,
}

impl<M: HandleManager> Drop for Returning<'_, M> {
    fn drop(&mut self) {
        if let Some(res) = self.res.take() {
            self.shared.discard(res);
        }
    }
}

// =============================================================================
// Resource Pool
// =============================================================================

/// Bounded pool of backend handles with FIFO waiting.
///
/// Cheap to clone; clones share the same pool.
pub struct ResourcePool<M: HandleManager> {
    shared: Arc<Shared<M>>,
}

impl<M: HandleManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: HandleManager> ResourcePool<M> {
    /// Create an empty pool. Handles are created on demand.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    active: 0,
                    closed: false,
                }),
                metrics: PoolMetrics::new(),
                next_resource_id: AtomicU64::new(0),
                next_ticket_id: AtomicU64::new(0),
            }),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The handle manager
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Get metrics
    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Acquire with the configured timeout
    pub async fn acquire_default(&self) -> Result<Pooled<M>> {
        self.acquire(self.shared.config.acquire_timeout).await
    }

    /// Acquire a handle, waiting at most `timeout` for one to free up
    pub async fn acquire(&self, timeout: Duration) -> Result<Pooled<M>> {
        let shared = &self.shared;
        let started = Instant::now();

        let (ticket_id, deadline, rx) = match shared.admit(timeout)? {
            Admission::Ready(res) => {
                shared.metrics.record_acquired();
                return Ok(Pooled::new(shared.clone(), res));
            }
            Admission::Create => return shared.create_reserved().await,
            Admission::Wait {
                ticket_id,
                deadline,
                rx,
            } => (ticket_id, deadline, rx),
        };

        shared.metrics.record_wait();
        debug!(ticket = ticket_id, ?timeout, "Pool at capacity, waiting");

        let mut guard = TicketGuard {
            shared,
            ticket_id,
            rx,
            armed: true,
        };

        let grant = match tokio::time::timeout_at(deadline, &mut guard.rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => {
                guard.armed = false;
                return Err(Error::PoolClosed);
            }
            Err(_) => {
                if shared.withdraw_ticket(ticket_id) {
                    guard.armed = false;
                    shared.metrics.record_timeout();
                    let waited = started.elapsed();
                    debug!(ticket = ticket_id, ?waited, "Acquire timed out");
                    return Err(Error::AcquireTimeout { waited });
                }
                // Granted just as the deadline passed
                match guard.rx.try_recv() {
                    Ok(grant) => grant,
                    Err(_) => {
                        guard.armed = false;
                        return Err(Error::PoolClosed);
                    }
                }
            }
        };
        guard.armed = false;
        drop(guard);

        shared.redeem(grant).await
    }

    /// Validate every idle handle, closing the ones that fail
    pub async fn health_check(&self) -> HealthReport {
        let batch = self.shared.check_out_idle();
        let mut report = HealthReport {
            checked: batch.len(),
            closed: 0,
        };

        // Guard the whole batch so a cancelled check frees every slot
        let mut pending: VecDeque<Returning<'_, M>> = batch
            .into_iter()
            .map(|res| Returning {
                shared: &self.shared,
                res: Some(res),
            })
            .collect();

        while let Some(mut returning) = pending.pop_front() {
            let Some(res) = returning.res.take() else {
                continue;
            };
            if !self.shared.check_in(res, false, false).await {
                report.closed += 1;
            }
        }

        if report.closed > 0 {
            info!(checked = report.checked, closed = report.closed, "Pool health check closed handles");
        }
        report
    }

    /// Shut the pool down. Idle handles are closed, waiters fail with
    /// [`Error::PoolClosed`] and handles still held are closed on release.
    pub async fn close(&self) {
        let Some(idle) = self.shared.shut_down() else {
            return;
        };
        for res in idle {
            self.shared.manager.close(res.into_handle()).await;
            self.shared.metrics.record_closed();
        }
        info!("Resource pool closed");
    }
}

// =============================================================================
// Pooled Guard
// =============================================================================

/// A handle checked out of a [`ResourcePool`]. Returned to the pool by
/// [`Pooled::release`] or when dropped.
pub struct Pooled<M: HandleManager> {
    shared: Arc<Shared<M>>,
    res: Option<PooledResource<M::Handle>>,
    invalid: bool,
}

impl<M: HandleManager> Pooled<M> {
    fn new(shared: Arc<Shared<M>>, res: PooledResource<M::Handle>) -> Self {
        Self {
            shared,
            res: Some(res),
            invalid: false,
        }
    }

    fn resource(&self) -> &PooledResource<M::Handle> {
        self.res
            .as_ref()
            .expect("pooled resource is present until released")
    }

    /// Pool-unique id of the underlying handle
    pub fn id(&self) -> u64 {
        self.resource().id()
    }

    /// When the underlying handle was created
    pub fn created_at(&self) -> Instant {
        self.resource().created_at()
    }

    /// Report the handle as broken; it is closed on release instead of
    /// being validated
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    /// Return the handle now, waiting for validation to finish
    pub async fn release(mut self) {
        if let Some(res) = self.res.take() {
            self.shared.check_in(res, self.invalid, true).await;
        }
    }
}

impl<M: HandleManager> Deref for Pooled<M> {
    type Target = M::Handle;

    fn deref(&self) -> &M::Handle {
        self.resource().handle()
    }
}

impl<M: HandleManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut M::Handle {
        self.res
            .as_mut()
            .expect("pooled resource is present until released")
            .handle_mut()
    }
}

impl<M: HandleManager> std::fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.res.as_ref().map(|r| r.id()))
            .field("invalid", &self.invalid)
            .finish()
    }
}

impl<M: HandleManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        let Some(res) = self.res.take() else {
            return;
        };
        let invalid = self.invalid;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let shared = self.shared.clone();
                rt.spawn(async move {
                    shared.check_in(res, invalid, true).await;
                });
            }
            Err(_) => self.shared.check_in_blocking(res, invalid),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Debug)]
    struct Conn {
        serial: usize,
    }

    #[derive(Default)]
    struct MockManager {
        created: AtomicUsize,
        closed: AtomicUsize,
        validations: AtomicUsize,
        fail_create: AtomicBool,
        fail_validate: AtomicBool,
    }

    #[async_trait]
    impl HandleManager for MockManager {
        type Handle = Conn;

        async fn create(&self) -> Result<Conn> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::HandleCreation("backend refused".into()));
            }
            let serial = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn { serial })
        }

        async fn validate(&self, _handle: &Conn) -> bool {
            self.validations.fetch_add(1, Ordering::SeqCst);
            !self.fail_validate.load(Ordering::SeqCst)
        }

        async fn close(&self, _handle: Conn) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max_handles: usize) -> ResourcePool<MockManager> {
        ResourcePool::new(
            MockManager::default(),
            PoolConfig {
                max_handles,
                idle_fraction: 0.5,
                acquire_timeout: Duration::from_secs(1),
            },
        )
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let pool = pool(2);

        let first = pool.acquire(SHORT).await.unwrap();
        let id = first.id();
        assert_eq!(first.serial, 0);
        first.release().await;

        let again = pool.acquire(SHORT).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.manager().created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().active, 1);
    }

    #[tokio::test]
    async fn test_waiter_receives_released_handle_without_validation() {
        let pool = pool(1);
        let held = pool.acquire(SHORT).await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }

        held.release().await;
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), held_id);
        assert_eq!(pool.manager().validations.load(Ordering::SeqCst), 0);
        assert_eq!(pool.metrics().snapshot().handoffs, 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_residue() {
        let pool = pool(1);
        let _held = pool.acquire(SHORT).await.unwrap();

        let err = pool.acquire(SHORT).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            pool.status(),
            PoolStatus {
                total: 1,
                active: 1,
                idle: 0,
                waiting: 0
            }
        );
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast_at_capacity() {
        let pool = pool(1);
        let _held = pool.acquire(SHORT).await.unwrap();
        assert!(pool.acquire(Duration::ZERO).await.unwrap_err().is_timeout());
        assert_eq!(pool.status().waiting, 0);
    }

    #[tokio::test]
    async fn test_creation_failure_rolls_back() {
        let pool = pool(2);
        pool.manager().fail_create.store(true, Ordering::SeqCst);

        let err = pool.acquire(SHORT).await.unwrap_err();
        assert!(matches!(err, Error::HandleCreation(_)));
        assert_eq!(pool.status().total, 0);

        pool.manager().fail_create.store(false, Ordering::SeqCst);
        assert!(pool.acquire(SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_handle_closed_on_release() {
        let pool = pool(2);
        let held = pool.acquire(SHORT).await.unwrap();
        pool.manager().fail_validate.store(true, Ordering::SeqCst);

        held.release().await;
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.metrics().snapshot().validation_failures, 1);
    }

    #[tokio::test]
    async fn test_invalidate_skips_validation() {
        let pool = pool(2);
        let mut held = pool.acquire(SHORT).await.unwrap();
        held.invalidate();
        held.release().await;

        assert_eq!(pool.manager().validations.load(Ordering::SeqCst), 0);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn test_idle_set_capped_at_max_idle() {
        // max_idle = floor(4 * 0.5) = 2
        let pool = pool(4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(SHORT).await.unwrap());
        }
        for h in held {
            h.release().await;
        }

        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.total, 2);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_returns_handle() {
        let pool = pool(1);
        {
            let _held = pool.acquire(SHORT).await.unwrap();
        }
        // Release runs on a spawned task
        let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.serial, 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_withdraws_ticket() {
        let pool = pool(1);
        let held = pool.acquire(SHORT).await.unwrap();

        let waiting = pool.acquire(Duration::from_secs(10));
        assert!(tokio::time::timeout(SHORT, waiting).await.is_err());
        assert_eq!(pool.status().waiting, 0);

        held.release().await;
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_health_check_closes_invalid_idle_handles() {
        let pool = pool(4);
        let a = pool.acquire(SHORT).await.unwrap();
        let b = pool.acquire(SHORT).await.unwrap();
        a.release().await;
        b.release().await;
        assert_eq!(pool.status().idle, 2);

        pool.manager().fail_validate.store(true, Ordering::SeqCst);
        let report = pool.health_check().await;
        assert_eq!(report, HealthReport { checked: 2, closed: 2 });
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_later_acquires() {
        let pool = pool(1);
        let held = pool.acquire(SHORT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }

        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        assert!(matches!(pool.acquire(SHORT).await, Err(Error::PoolClosed)));

        held.release().await;
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.manager().closed.load(Ordering::SeqCst), 1);
    }
}
