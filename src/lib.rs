//! rouse: cooperative actors with an await/rouse protocol
//!
//! Independent execution contexts ("actors") suspend and resume each other
//! through explicit `await` / `rouse` calls driven by an event loop, and
//! exchange values by copying them through a binary codec rather than by
//! sharing memory.
//!
//! # Architecture
//!
//! - **Actors**: Identity, lifecycle state, a FIFO wait queue and a pending result
//! - **Scheduler**: Owns the event loop; loop callbacks rouse actors on I/O events
//! - **Codec**: Cycle and sharing preserving serialization of host values,
//!   including scripted closures
//! - **Process Manager**: Spawns OS processes as actors that rouse on exit
//! - **Streams**: Pipe/file actors that rouse when data is ready
//!
//! # Serialization
//!
//! Values never cross between actors by reference. Every hand-off is an
//! encode in the sender's context and a decode in the receiver's, so the
//! receiver always gets a fresh copy with the same graph shape.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rouse::{Scheduler, Value};
//!
//! let sched = Scheduler::with_defaults()?;
//! let ctx = sched.main_context();
//!
//! let co = ctx.spawn(|_, args| Ok(args), &[Value::str("hi")])?;
//! let out = ctx.await_actor(&*co)?.into_values();
//! ```

pub mod actor;
pub mod buffer;
pub mod codec;
pub mod coroutine;
pub mod error;
pub mod process;
pub mod runtime;
pub mod stream;
pub mod value;

// Re-exports
pub use actor::{Actor, ActorId, ActorKind, ActorState, MainActor, Outcome};
pub use codec::{decode, encode, Codec};
pub use coroutine::CoroutineActor;
pub use error::{CodecError, Error, ProcessError, Result};
pub use process::{ProcessActor, ProcessExit, SpawnOptions, Spawned, StdioBinding};
pub use runtime::{Context, RuntimeConfig, Scheduler};
pub use stream::StreamActor;
pub use value::{FunctionRef, TableRef, Value};
