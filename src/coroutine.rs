//! Generic coroutine-backed actor
//!
//! Runs a host body in its own execution context. Arguments are copied in
//! through the codec when spawned; the body's return values are copied out
//! to every context that awaits (joins) it.

use crate::actor::{park, Actor, ActorCore, ActorId, ActorKind, Wake, WakePolicy};
use crate::error::Result;
use crate::runtime::{clear_current_actor, set_current_actor, Context, Scheduler};
use crate::value::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct CoroutineActor {
    core: ActorCore,
    suspended: AtomicBool,
}

impl CoroutineActor {
    pub(crate) fn spawn<F>(ctx: &Context, body: F, args: &[Value]) -> Result<Arc<Self>>
    where
        F: FnOnce(&Context, Vec<Value>) -> Result<Vec<Value>> + Send + 'static,
    {
        let scheduler = ctx.scheduler().clone();
        let args = scheduler.codec().encode(args)?;

        let actor = Arc::new(CoroutineActor {
            core: ActorCore::new(ActorKind::Coroutine, scheduler.refs()),
            suspended: AtomicBool::new(false),
        });
        actor.core.reference();

        let me = actor.clone();
        let spawned = thread::Builder::new()
            .name(format!("rouse-co-{}", actor.id().short()))
            .spawn(move || me.run(scheduler, body, args));

        if let Err(e) = spawned {
            actor.core.close();
            return Err(e.into());
        }
        debug!(actor = %actor.id(), parent = %ctx.id(), "coroutine spawned");
        Ok(actor)
    }

    fn run<F>(self: Arc<Self>, scheduler: Scheduler, body: F, args: Vec<u8>)
    where
        F: FnOnce(&Context, Vec<Value>) -> Result<Vec<Value>>,
    {
        self.core.activate();
        set_current_actor(self.id().clone());
        let codec = scheduler.codec();
        let ctx = Context::new(scheduler, self.clone());

        let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Vec<u8>> {
            let args = codec.decode(&args)?;
            let out = body(&ctx, args)?;
            Ok(codec.encode(&out)?)
        }));
        clear_current_actor();
        drop(ctx);

        match result {
            Ok(Ok(bytes)) => {
                self.core.settle(bytes);
                self.core.unreference();
                self.rouse(None);
                debug!(actor = %self.id(), "coroutine finished");
            }
            Ok(Err(e)) => {
                warn!(actor = %self.id(), error = %e, "coroutine failed");
                self.close();
            }
            Err(_) => {
                warn!(actor = %self.id(), "coroutine panicked");
                self.close();
            }
        }
    }

    /// Is this coroutine parked in an await?
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

impl Actor for CoroutineActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn await_on(&self, that: &dyn Actor) -> Result<Wake> {
        self.suspended.store(true, Ordering::Release);
        let wake = park(&self.core, that);
        self.suspended.store(false, Ordering::Release);
        wake
    }

    fn rouse(&self, from: Option<&ActorId>) -> usize {
        trace!(actor = %self.core.id(), from = ?from, "rouse coroutine");
        self.core.wake(WakePolicy::All).len()
    }

    fn close(&self) -> bool {
        self.core.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorState;
    use crate::error::Error;
    use crate::runtime::{get_current_actor, Scheduler};
    use crate::value::TableRef;
    use std::time::Duration;

    #[test]
    fn test_join_returns_copied_results() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let co = ctx
            .spawn(
                |_, args| {
                    let n = args[0].as_number().unwrap_or(0.0);
                    Ok(vec![Value::Number(n * 2.0), Value::str("done")])
                },
                &[Value::from(21)],
            )
            .unwrap();

        let out = ctx.await_actor(&*co).unwrap();
        assert_eq!(out.into_values(), vec![Value::from(42), Value::str("done")]);
    }

    #[test]
    fn test_args_are_copies() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let table = TableRef::new();
        table.set("count", 1);
        let co = ctx
            .spawn(
                |_, args| {
                    let copy = args[0].as_table().cloned().unwrap_or_default();
                    copy.set("count", 2);
                    Ok(vec![copy.get_str("count")])
                },
                &[Value::Table(table.clone())],
            )
            .unwrap();

        let out = ctx.await_actor(&*co).unwrap().into_values();
        assert_eq!(out, vec![Value::from(2)]);
        assert_eq!(table.get_str("count"), Value::from(1));
    }

    #[test]
    fn test_late_join_gets_settled_result() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let co = ctx.spawn(|_, _| Ok(vec![Value::from(7)]), &[]).unwrap();
        sched.run();

        let first = ctx.await_actor(&*co).unwrap().into_values();
        let second = ctx.await_actor(&*co).unwrap().into_values();
        assert_eq!(first, vec![Value::from(7)]);
        assert_eq!(second, vec![Value::from(7)]);
        assert_eq!(co.state(), ActorState::Active);
    }

    #[test]
    fn test_joiners_queue_in_registration_order() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let main = sched.main();

        // C parks on main until released
        let gate = main.clone();
        let c = ctx
            .spawn(
                move |ctx, _| {
                    ctx.await_actor(&*gate)?;
                    Ok(vec![Value::str("c")])
                },
                &[],
            )
            .unwrap();
        while main.core().waiting() < 1 {
            thread::sleep(Duration::from_millis(5));
        }

        let mut joiners = Vec::new();
        for name in ["a", "b"] {
            let target = c.clone();
            let joiner = ctx
                .spawn(
                    move |ctx, _| {
                        let got = ctx.await_actor(&*target)?.into_values();
                        Ok(vec![Value::str(name), got[0].clone()])
                    },
                    &[],
                )
                .unwrap();
            while c.core().waiting() < joiners.len() + 1 {
                thread::sleep(Duration::from_millis(5));
            }
            joiners.push(joiner);
        }

        let ids: Vec<ActorId> = joiners.iter().map(|j| j.id().clone()).collect();
        assert_eq!(c.core().waiters(), ids);

        ctx.notify(&*main, &[]).unwrap();
        for (joiner, name) in joiners.iter().zip(["a", "b"]) {
            let out = ctx.await_actor(&**joiner).unwrap().into_values();
            assert_eq!(out, vec![Value::str(name), Value::str("c")]);
        }
        assert_eq!(c.core().waiting(), 0);
    }

    #[test]
    fn test_body_error_closes_actor() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let co = ctx
            .spawn(
                |_, _| {
                    fn native(_: &[Value]) -> Vec<Value> {
                        Vec::new()
                    }
                    // returning a native function cannot be copied out
                    Ok(vec![Value::Function(crate::value::FunctionRef::native("n", native))])
                },
                &[],
            )
            .unwrap();

        let out = ctx.await_actor(&*co).unwrap();
        assert!(out.is_closed());
        assert_eq!(co.state(), ActorState::Closed);
        assert_eq!(sched.referenced(), 0);
    }

    #[test]
    fn test_panic_closes_actor() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let co = ctx.spawn(|_, _| panic!("boom"), &[]).unwrap();
        assert!(ctx.await_actor(&*co).unwrap().is_closed());
    }

    #[test]
    fn test_spawn_rejects_native_args() {
        fn native(_: &[Value]) -> Vec<Value> {
            Vec::new()
        }
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let f = crate::value::FunctionRef::native("print", native);

        let err = ctx.spawn(|_, _| Ok(vec![]), &[Value::Function(f)]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        assert_eq!(sched.referenced(), 0);
    }

    #[test]
    fn test_context_knows_current_actor() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let co = ctx
            .spawn(
                |ctx, _| {
                    let same = get_current_actor().as_ref() == Some(ctx.id());
                    Ok(vec![Value::Boolean(same)])
                },
                &[],
            )
            .unwrap();
        let out = ctx.await_actor(&*co).unwrap().into_values();
        assert_eq!(out, vec![Value::Boolean(true)]);
    }

    #[test]
    fn test_suspended_while_awaiting() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let main = sched.main();

        let gate = main.clone();
        let co = ctx
            .spawn(
                move |ctx, _| {
                    ctx.await_actor(&*gate)?;
                    Ok(vec![])
                },
                &[],
            )
            .unwrap();
        while main.core().waiting() < 1 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(co.is_suspended());

        ctx.notify(&*main, &[]).unwrap();
        ctx.await_actor(&*co).unwrap();
        assert!(!co.is_suspended());
    }
}
