//! Actor types and the wait/wake protocol
//!
//! An actor consists of:
//! - Identity (ActorId)
//! - Lifecycle state (start → active → closed, never backwards)
//! - A FIFO queue of waiters parked on it
//! - A pending result (encoded values) handed to waiters when it rouses them
//!
//! Variants (main, coroutine, process, stream) implement [`Actor`] and share
//! the bookkeeping in [`ActorCore`].
//!
//! # Await / Rouse
//!
//! `a.await_on(b)` queues `a` on `b` and parks the calling context on a
//! one-shot signal. `b.rouse(..)` pops one or all of the waiters present at
//! that moment (the variant decides) and hands each a copy of the encoded
//! pending result. `b.close()` wakes every remaining waiter with
//! [`Wake::Closed`] instead.

use crate::error::{Error, Result};
use crate::runtime::{LoopRefs, REGISTRY};
use crate::value::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// Unique identifier for an actor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId(pub Uuid);

impl ActorId {
    /// Create a new random actor ID
    pub fn new() -> Self {
        ActorId(Uuid::new_v4())
    }

    /// Get the UUID as a string
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// First 8 hex digits, for thread names and logs
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActorState {
    /// Constructed, not yet registered with the loop
    Start,
    /// Registered and running
    Active,
    /// Released; never reused
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Main,
    Coroutine,
    Process,
    Stream,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorKind::Main => "main",
            ActorKind::Coroutine => "coroutine",
            ActorKind::Process => "process",
            ActorKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// How many waiters a rouse wakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePolicy {
    One,
    All,
}

/// What a parked waiter receives: encoded values, or the closed signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    Values(Vec<u8>),
    Closed,
}

/// Result of an await, decoded into the waiter's own context
#[derive(Debug)]
pub enum Outcome {
    Values(Vec<Value>),
    Closed,
}

impl Outcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, Outcome::Closed)
    }

    /// The delivered values; empty if the target was closed
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Outcome::Values(values) => values,
            Outcome::Closed => Vec::new(),
        }
    }
}

/// Result of registering a waiter
pub(crate) enum Enqueued {
    Parked(oneshot::Receiver<Wake>),
    /// The target already settled; here is its result
    Ready(Vec<u8>),
    Closed,
}

struct Waiter {
    actor: ActorId,
    tx: oneshot::Sender<Wake>,
}

struct CoreState {
    state: ActorState,
    queue: VecDeque<Waiter>,
    pending: Option<Vec<u8>>,
    /// Final result of a completed actor, handed to late awaiters
    settled: Option<Vec<u8>>,
    /// Whether this actor currently keeps the loop alive
    referenced: bool,
}

/// Queue and flag bookkeeping shared by every actor variant
pub struct ActorCore {
    id: ActorId,
    kind: ActorKind,
    refs: Arc<LoopRefs>,
    inner: Mutex<CoreState>,
}

impl fmt::Debug for ActorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ActorCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("waiting", &inner.queue.len())
            .finish()
    }
}

impl ActorCore {
    pub(crate) fn new(kind: ActorKind, refs: Arc<LoopRefs>) -> Self {
        ActorCore {
            id: ActorId::new(),
            kind,
            refs,
            inner: Mutex::new(CoreState {
                state: ActorState::Start,
                queue: VecDeque::new(),
                pending: None,
                settled: None,
                referenced: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn kind(&self) -> ActorKind {
        self.kind
    }

    pub fn state(&self) -> ActorState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ActorState::Closed
    }

    /// Number of parked waiters
    pub fn waiting(&self) -> usize {
        self.lock().queue.len()
    }

    /// Ids of parked waiters, in wake order
    pub fn waiters(&self) -> Vec<ActorId> {
        self.lock().queue.iter().map(|w| w.actor.clone()).collect()
    }

    /// start → active. No effect once active or closed.
    pub(crate) fn activate(&self) {
        let mut inner = self.lock();
        if inner.state == ActorState::Start {
            inner.state = ActorState::Active;
            REGISTRY.register(self.id.clone(), self.kind);
            debug!(actor = %self.id, kind = %self.kind, "actor active");
        }
    }

    /// Keep the loop alive until `unreference` or `close`
    pub(crate) fn reference(&self) {
        let mut inner = self.lock();
        if !inner.referenced && inner.state != ActorState::Closed {
            inner.referenced = true;
            self.refs.acquire();
        }
    }

    pub(crate) fn unreference(&self) {
        let mut inner = self.lock();
        if inner.referenced {
            inner.referenced = false;
            self.refs.release();
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.lock().referenced
    }

    pub(crate) fn enqueue(&self, waiter: &ActorId) -> Enqueued {
        let mut inner = self.lock();
        if inner.state == ActorState::Closed {
            return Enqueued::Closed;
        }
        if let Some(settled) = &inner.settled {
            return Enqueued::Ready(settled.clone());
        }
        let (tx, rx) = oneshot::channel();
        inner.queue.push_back(Waiter {
            actor: waiter.clone(),
            tx,
        });
        Enqueued::Parked(rx)
    }

    /// Replace the pending result. Ignored once closed.
    pub(crate) fn set_pending(&self, bytes: Vec<u8>) {
        let mut inner = self.lock();
        if inner.state != ActorState::Closed {
            inner.pending = Some(bytes);
        }
    }

    /// Record a final result: delivered on the next wake and to every
    /// later awaiter
    pub(crate) fn settle(&self, bytes: Vec<u8>) {
        let mut inner = self.lock();
        if inner.state != ActorState::Closed {
            inner.settled = Some(bytes.clone());
            inner.pending = Some(bytes);
        }
    }

    /// Pop waiters present right now and hand each the pending result.
    /// Returns the woken waiters in delivery order.
    pub(crate) fn wake(&self, policy: WakePolicy) -> Vec<ActorId> {
        let mut inner = self.lock();
        if inner.state == ActorState::Closed || inner.queue.is_empty() {
            return Vec::new();
        }
        let bytes = match inner.pending.take() {
            Some(bytes) => bytes,
            None => EMPTY_STREAM.to_vec(),
        };
        let count = match policy {
            WakePolicy::One => 1,
            WakePolicy::All => inner.queue.len(),
        };
        let mut woken = Vec::with_capacity(count);
        for waiter in inner.queue.drain(..count) {
            trace!(actor = %self.id, waiter = %waiter.actor, "rouse");
            // a dropped receiver means the waiter is gone; nothing to deliver
            if waiter.tx.send(Wake::Values(bytes.clone())).is_ok() {
                woken.push(waiter.actor);
            }
        }
        woken
    }

    /// Mark closed and wake every waiter with the closed signal.
    /// Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ActorState::Closed {
            return false;
        }
        inner.state = ActorState::Closed;
        inner.pending = None;
        inner.settled = None;
        if inner.referenced {
            inner.referenced = false;
            self.refs.release();
        }
        for waiter in inner.queue.drain(..) {
            trace!(actor = %self.id, waiter = %waiter.actor, "closed signal");
            let _ = waiter.tx.send(Wake::Closed);
        }
        drop(inner);
        REGISTRY.unregister(&self.id);
        debug!(actor = %self.id, kind = %self.kind, "actor closed");
        true
    }
}

/// An encoded stream of zero values
const EMPTY_STREAM: [u8; 1] = [0];

/// The capability set every actor variant provides
pub trait Actor: Send + Sync + fmt::Debug {
    fn core(&self) -> &ActorCore;

    fn id(&self) -> &ActorId {
        self.core().id()
    }

    fn kind(&self) -> ActorKind {
        self.core().kind()
    }

    fn state(&self) -> ActorState {
        self.core().state()
    }

    /// Suspend the calling context (`self`) until `that` rouses it.
    /// Returns at once with [`Wake::Closed`] if `that` is closed.
    fn await_on(&self, that: &dyn Actor) -> Result<Wake> {
        park(self.core(), that)
    }

    /// Wake waiters parked on `self`, delivering the pending result
    fn rouse(&self, from: Option<&ActorId>) -> usize;

    /// Release the actor. A second call is a no-op returning false.
    fn close(&self) -> bool;

    /// Called after a waiter has been queued on `self`
    fn on_waiter(&self) {}
}

/// Queue `me` on `that` and block until woken
pub(crate) fn park(me: &ActorCore, that: &dyn Actor) -> Result<Wake> {
    if me.id() == that.id() {
        return Err(Error::AwaitSelf(me.id().clone()));
    }
    trace!(waiter = %me.id(), target = %that.id(), "await");
    match that.core().enqueue(me.id()) {
        Enqueued::Closed => Ok(Wake::Closed),
        Enqueued::Ready(bytes) => Ok(Wake::Values(bytes)),
        Enqueued::Parked(rx) => {
            that.on_waiter();
            // sender dropped without a wake: the target is gone
            Ok(rx.blocking_recv().unwrap_or(Wake::Closed))
        }
    }
}

/// The root context: the host thread that owns the scheduler
#[derive(Debug)]
pub struct MainActor {
    core: ActorCore,
}

impl MainActor {
    pub(crate) fn new(refs: Arc<LoopRefs>) -> Self {
        let core = ActorCore::new(ActorKind::Main, refs);
        core.activate();
        MainActor { core }
    }
}

impl Actor for MainActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn rouse(&self, from: Option<&ActorId>) -> usize {
        trace!(actor = %self.core.id(), from = ?from, "rouse main");
        self.core.wake(WakePolicy::One).len()
    }

    fn close(&self) -> bool {
        self.core.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use tokio::sync::oneshot::error::TryRecvError;

    fn core() -> ActorCore {
        ActorCore::new(ActorKind::Coroutine, Arc::new(LoopRefs::new()))
    }

    fn parked(core: &ActorCore, waiter: &ActorId) -> oneshot::Receiver<Wake> {
        match core.enqueue(waiter) {
            Enqueued::Parked(rx) => rx,
            _ => panic!("expected waiter to park"),
        }
    }

    #[test]
    fn test_actor_id_creation() {
        let id1 = ActorId::new();
        let id2 = ActorId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_state_is_monotonic() {
        let c = core();
        assert_eq!(c.state(), ActorState::Start);
        c.activate();
        assert_eq!(c.state(), ActorState::Active);
        assert!(c.close());
        assert_eq!(c.state(), ActorState::Closed);
        c.activate();
        assert_eq!(c.state(), ActorState::Closed);
        assert!(!c.close());
    }

    #[test]
    fn test_wake_one_is_fifo() {
        let c = core();
        let (a, b) = (ActorId::new(), ActorId::new());
        let mut rx_a = parked(&c, &a);
        let mut rx_b = parked(&c, &b);
        assert_eq!(c.waiters(), vec![a.clone(), b.clone()]);

        c.set_pending(codec::encode(&[Value::from(1)]).unwrap());
        assert_eq!(c.wake(WakePolicy::One), vec![a]);
        assert!(matches!(rx_a.try_recv(), Ok(Wake::Values(_))));
        assert_eq!(rx_b.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(c.wake(WakePolicy::One), vec![b]);
        assert_eq!(rx_b.try_recv(), Ok(Wake::Values(vec![0])));
    }

    #[test]
    fn test_wake_all_delivers_in_registration_order() {
        let c = core();
        let ids: Vec<ActorId> = (0..4).map(|_| ActorId::new()).collect();
        let mut rxs: Vec<_> = ids.iter().map(|id| parked(&c, id)).collect();

        // a waiter that gave up is skipped, the rest keep their order
        drop(rxs.remove(1));
        let expected = vec![ids[0].clone(), ids[2].clone(), ids[3].clone()];
        assert_eq!(c.wake(WakePolicy::All), expected);
        for rx in &mut rxs {
            assert_eq!(rx.try_recv(), Ok(Wake::Values(vec![0])));
        }

        // waiters registered after the rouse are not woken by it
        let late = ActorId::new();
        let _rx = parked(&c, &late);
        assert_eq!(c.waiters(), vec![late]);
    }

    #[test]
    fn test_wake_all_delivers_copies() {
        let c = core();
        let mut rx_a = parked(&c, &ActorId::new());
        let mut rx_b = parked(&c, &ActorId::new());

        let bytes = codec::encode(&[Value::str("x")]).unwrap();
        c.set_pending(bytes.clone());
        assert_eq!(c.wake(WakePolicy::All).len(), 2);
        assert_eq!(rx_a.try_recv(), Ok(Wake::Values(bytes.clone())));
        assert_eq!(rx_b.try_recv(), Ok(Wake::Values(bytes)));
        assert_eq!(c.waiting(), 0);
    }

    #[test]
    fn test_late_waiter_must_await_again() {
        let c = core();
        let mut early = parked(&c, &ActorId::new());
        assert_eq!(c.wake(WakePolicy::All).len(), 1);
        assert!(early.try_recv().is_ok());

        let mut late = parked(&c, &ActorId::new());
        assert_eq!(late.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_close_sends_closed_signal_not_result() {
        let c = core();
        let mut rx_a = parked(&c, &ActorId::new());
        let mut rx_b = parked(&c, &ActorId::new());
        c.set_pending(codec::encode(&[Value::from(5)]).unwrap());

        assert!(c.close());
        assert_eq!(rx_a.try_recv(), Ok(Wake::Closed));
        assert_eq!(rx_b.try_recv(), Ok(Wake::Closed));
        assert!(c.wake(WakePolicy::All).is_empty());
        assert!(matches!(c.enqueue(&ActorId::new()), Enqueued::Closed));
    }

    #[test]
    fn test_settled_result_serves_late_awaiters() {
        let c = core();
        let bytes = codec::encode(&[Value::Boolean(true)]).unwrap();
        c.settle(bytes.clone());
        match c.enqueue(&ActorId::new()) {
            Enqueued::Ready(got) => assert_eq!(got, bytes),
            _ => panic!("expected settled result"),
        }
    }

    #[test]
    fn test_loop_references_released_on_close() {
        let refs = Arc::new(LoopRefs::new());
        let c = ActorCore::new(ActorKind::Process, refs.clone());
        c.reference();
        c.reference();
        assert_eq!(refs.count(), 1);
        c.close();
        assert_eq!(refs.count(), 0);
        c.reference();
        assert_eq!(refs.count(), 0);
    }

    #[test]
    fn test_outcome_values() {
        assert!(Outcome::Closed.is_closed());
        assert!(Outcome::Closed.into_values().is_empty());
        let out = Outcome::Values(vec![Value::from(3)]);
        assert!(!out.is_closed());
        assert_eq!(out.into_values(), vec![Value::from(3)]);
    }
}
