//! Actor Runtime - cooperative actors driven by one event loop
//!
//! This module binds actors to the event loop and hands each execution
//! context a [`Context`] for awaiting and rousing other actors.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Scheduler                     │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │   main   │  │coroutine │  │ process  │ ... │
//! │  │ ┌──────┐ │  │ ┌──────┐ │  │ ┌──────┐ │     │
//! │  │ │waiter│ │  │ │waiter│ │  │ │waiter│ │     │
//! │  │ │queue │ │  │ │queue │ │  │ │queue │ │     │
//! │  │ └──────┘ │  │ └──────┘ │  │ └──────┘ │     │
//! │  └──────────┘  └──────────┘  └──────────┘     │
//! │                                               │
//! │        event loop thread (loop callbacks)      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Wake Flow
//!
//! 1. A context calls `await_actor(target)` and parks on a one-shot signal
//! 2. The loop observes an event (process exit, data ready)
//! 3. Its callback stores the encoded result on the target and rouses it
//! 4. Waiters wake in FIFO order and decode the result in their own context
//!
//! Loop callbacks all run on the single loop thread, one at a time.

use crate::actor::{Actor, ActorId, ActorKind, MainActor, Outcome, Wake};
use crate::codec::Codec;
use crate::coroutine::CoroutineActor;
use crate::error::Result;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

/// Actor entry in the registry
#[derive(Debug)]
struct ActorEntry {
    kind: ActorKind,
}

/// Global registry of live actors
///
/// Maps ActorId → ActorEntry. An actor is listed from activation until close.
pub(crate) struct ActorRegistry {
    actors: RwLock<HashMap<ActorId, ActorEntry>>,
}

impl ActorRegistry {
    fn new() -> Self {
        ActorRegistry {
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, id: ActorId, kind: ActorKind) {
        let mut actors = self.actors.write().unwrap_or_else(PoisonError::into_inner);
        actors.insert(id, ActorEntry { kind });
    }

    pub(crate) fn unregister(&self, id: &ActorId) {
        let mut actors = self.actors.write().unwrap_or_else(PoisonError::into_inner);
        actors.remove(id);
    }

    fn kind_of(&self, id: &ActorId) -> Option<ActorKind> {
        let actors = self.actors.read().unwrap_or_else(PoisonError::into_inner);
        actors.get(id).map(|e| e.kind)
    }
}

// Global registry instance
lazy_static::lazy_static! {
    pub(crate) static ref REGISTRY: ActorRegistry = ActorRegistry::new();
}

/// Is the actor registered and not yet closed?
pub fn is_live(id: &ActorId) -> bool {
    REGISTRY.kind_of(id).is_some()
}

/// Kind of a live actor
pub fn live_kind(id: &ActorId) -> Option<ActorKind> {
    REGISTRY.kind_of(id)
}

/// Count of handles keeping the loop alive
pub(crate) struct LoopRefs {
    count: Mutex<usize>,
    idle: Condvar,
}

impl LoopRefs {
    pub(crate) fn new() -> Self {
        LoopRefs {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    pub(crate) fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Actor runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Initial capacity of codec buffers
    pub buffer_capacity: usize,
    /// Deepest table/function nesting the codec accepts
    pub codec_max_depth: usize,
    /// Most arguments a spawned process may receive
    pub max_args: usize,
    /// Bytes requested per stream read
    pub read_chunk_size: usize,
    /// Name of the event loop thread
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
            codec_max_depth: crate::codec::DEFAULT_MAX_DEPTH,
            max_args: 4096,
            read_chunk_size: 64 * 1024,
            thread_name: "rouse-loop".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn codec(&self) -> Codec {
        Codec::new(self.codec_max_depth, self.buffer_capacity)
    }
}

struct SchedulerInner {
    config: RuntimeConfig,
    handle: Handle,
    refs: Arc<LoopRefs>,
    main: Arc<MainActor>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        self.main.close();
    }
}

/// Owns the event loop and the main actor
///
/// Cloning is cheap; the loop stops when the last clone is dropped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Start the event loop on its own thread
    pub fn new(config: RuntimeConfig) -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        let (tx, rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                rt.block_on(async {
                    let _ = rx.await;
                });
                // reads parked on a still-open pipe never return
                rt.shutdown_background();
                debug!("event loop stopped");
            })?;

        let refs = Arc::new(LoopRefs::new());
        let main = Arc::new(MainActor::new(refs.clone()));
        debug!(main = %main.id(), "event loop started");

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                handle,
                refs,
                main,
                shutdown: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> std::io::Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> Codec {
        self.inner.config.codec()
    }

    pub fn main(&self) -> Arc<MainActor> {
        self.inner.main.clone()
    }

    /// Context for the calling (host) thread, acting as the main actor
    pub fn main_context(&self) -> Context {
        set_current_actor(self.inner.main.id().clone());
        Context::new(self.clone(), self.inner.main.clone())
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn refs(&self) -> Arc<LoopRefs> {
        self.inner.refs.clone()
    }

    /// Number of handles currently keeping the loop alive
    pub fn referenced(&self) -> usize {
        self.inner.refs.count()
    }

    /// Block until no referenced handle remains (running coroutines,
    /// attached processes). Detached processes do not count.
    pub fn run(&self) {
        self.inner.refs.wait_idle();
    }
}

/// An execution context: the actor a thread of host code runs as
pub struct Context {
    scheduler: Scheduler,
    actor: Arc<dyn Actor>,
}

impl Context {
    pub(crate) fn new(scheduler: Scheduler, actor: Arc<dyn Actor>) -> Self {
        Context { scheduler, actor }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn actor(&self) -> &Arc<dyn Actor> {
        &self.actor
    }

    pub fn id(&self) -> &ActorId {
        self.actor.id()
    }

    /// Suspend this context until `that` rouses it, then decode the
    /// delivered values here
    pub fn await_actor(&self, that: &dyn Actor) -> Result<Outcome> {
        match self.actor.await_on(that)? {
            Wake::Closed => Ok(Outcome::Closed),
            Wake::Values(bytes) => Ok(Outcome::Values(self.scheduler.codec().decode(&bytes)?)),
        }
    }

    /// Copy `values` into `that` as its pending result and rouse it.
    /// Returns the number of waiters woken.
    pub fn notify(&self, that: &dyn Actor, values: &[Value]) -> Result<usize> {
        let bytes = self.scheduler.codec().encode(values)?;
        that.core().set_pending(bytes);
        Ok(that.rouse(Some(self.id())))
    }

    /// Run `body` as a new coroutine actor; `args` are copied into it
    pub fn spawn<F>(&self, body: F, args: &[Value]) -> Result<Arc<CoroutineActor>>
    where
        F: FnOnce(&Context, Vec<Value>) -> Result<Vec<Value>> + Send + 'static,
    {
        CoroutineActor::spawn(self, body, args)
    }
}

// Thread-local storage for current actor context
thread_local! {
    static CURRENT_ACTOR_ID: std::cell::RefCell<Option<ActorId>> = const { std::cell::RefCell::new(None) };
}

/// Set the current actor ID (called when entering an actor's context)
pub fn set_current_actor(id: ActorId) {
    CURRENT_ACTOR_ID.with(|cell| {
        *cell.borrow_mut() = Some(id);
    });
}

/// Get the current actor ID
pub fn get_current_actor() -> Option<ActorId> {
    CURRENT_ACTOR_ID.with(|cell| cell.borrow().clone())
}

/// Clear the current actor ID (called when leaving an actor's context)
pub fn clear_current_actor() {
    CURRENT_ACTOR_ID.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorState;
    use crate::error::Error;
    use crate::value::TableRef;
    use std::time::Duration;

    fn wait_for_waiters(actor: &dyn Actor, n: usize) {
        while actor.core().waiting() < n {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_registry_operations() {
        let id = ActorId::new();
        REGISTRY.register(id.clone(), ActorKind::Stream);

        assert!(is_live(&id));
        assert_eq!(live_kind(&id), Some(ActorKind::Stream));

        REGISTRY.unregister(&id);
        assert!(!is_live(&id));
    }

    #[test]
    fn test_current_actor_thread_local() {
        let id = ActorId::new();

        assert!(get_current_actor().is_none());

        set_current_actor(id.clone());
        assert_eq!(get_current_actor().unwrap(), id);

        clear_current_actor();
        assert!(get_current_actor().is_none());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"max_args": 8}"#).unwrap();
        assert_eq!(config.max_args, 8);
        assert_eq!(config.codec_max_depth, 200);
        assert_eq!(config.thread_name, "rouse-loop");
    }

    #[test]
    fn test_main_actor_is_active() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        assert_eq!(ctx.actor().state(), ActorState::Active);
        assert_eq!(ctx.actor().kind(), ActorKind::Main);
        assert!(is_live(ctx.id()));
        assert_eq!(get_current_actor().as_ref(), Some(ctx.id()));
        clear_current_actor();
    }

    #[test]
    fn test_await_self_rejected() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let main = sched.main();
        assert!(matches!(ctx.await_actor(&*main), Err(Error::AwaitSelf(_))));
    }

    #[test]
    fn test_notify_main_wakes_coroutine() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let main = sched.main();

        let target = main.clone();
        let co = ctx
            .spawn(
                move |ctx, _| {
                    let got = ctx.await_actor(&*target)?.into_values();
                    Ok(got)
                },
                &[],
            )
            .unwrap();

        wait_for_waiters(&*main, 1);
        assert_eq!(ctx.notify(&*main, &[Value::str("go")]).unwrap(), 1);

        let out = ctx.await_actor(&*co).unwrap();
        assert_eq!(out.into_values(), vec![Value::str("go")]);
    }

    #[test]
    fn test_notify_copies_values() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let main = sched.main();

        let target = main.clone();
        let co = ctx
            .spawn(
                move |ctx, _| {
                    let got = ctx.await_actor(&*target)?.into_values();
                    let table = got[0].as_table().cloned().unwrap_or_default();
                    table.set("touched", true);
                    Ok(vec![Value::Table(table)])
                },
                &[],
            )
            .unwrap();

        let original = TableRef::new();
        original.set("n", 1);
        wait_for_waiters(&*main, 1);
        ctx.notify(&*main, &[Value::Table(original.clone())]).unwrap();

        let out = ctx.await_actor(&*co).unwrap().into_values();
        let returned = out[0].as_table().unwrap();
        assert_eq!(returned.get_str("touched"), Value::Boolean(true));
        assert!(original.get_str("touched").is_nil());
        assert!(!returned.ptr_eq(&original));
    }

    #[test]
    fn test_run_waits_for_referenced_coroutines() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let co = ctx
            .spawn(
                |_, _| {
                    thread::sleep(Duration::from_millis(50));
                    Ok(vec![])
                },
                &[],
            )
            .unwrap();

        sched.run();
        assert_eq!(sched.referenced(), 0);
        assert!(!co.core().is_referenced());
    }
}
