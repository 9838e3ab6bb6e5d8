//! Process Manager
//!
//! A process actor owns one OS child process. The loop awaits the child's
//! exit, stores `(exit status, terminating signal)` as the actor's settled
//! result and rouses every waiter. Attached processes keep the loop
//! referenced until they exit; detached ones start in a new session and never
//! hold the loop.
//!
//! ```text
//! spawn(cmd, opts) ──► start ──► detach? ──yes──► Spawned::Detached(handle)
//!                                   │
//!                                   no
//!                                   ▼
//!                      await process actor ──► Spawned::Exited(status, signal)
//! ```

use crate::actor::{Actor, ActorCore, ActorId, ActorKind, Outcome, WakePolicy};
use crate::error::{ProcessError, Result};
use crate::runtime::{Context, Scheduler};
use crate::stream::StreamActor;
use crate::value::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Where one of the child's standard streams goes
#[derive(Debug, Clone, Default)]
pub enum StdioBinding {
    /// Connected to the null device
    #[default]
    Ignore,
    /// Inherits a duplicate of the stream's handle
    Stream(Arc<StreamActor>),
}

impl StdioBinding {
    fn to_stdio(&self, which: &str) -> std::result::Result<Stdio, ProcessError> {
        match self {
            StdioBinding::Ignore => Ok(Stdio::null()),
            StdioBinding::Stream(stream) => stream.stdio().map_err(|e| {
                ProcessError::InvalidArgument(format!("{} stream {}: {}", which, stream.id(), e))
            }),
        }
    }
}

/// Options for [`ProcessActor::start`] and [`ProcessActor::spawn`]
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub args: Vec<String>,
    /// Replaces the inherited environment when set
    pub env: Option<BTreeMap<String, String>>,
    /// Inherited when unset
    pub cwd: Option<PathBuf>,
    pub stdin: StdioBinding,
    pub stdout: StdioBinding,
    pub stderr: StdioBinding,
    pub detach: bool,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, stream: Arc<StreamActor>) -> Self {
        self.stdin = StdioBinding::Stream(stream);
        self
    }

    pub fn stdout(mut self, stream: Arc<StreamActor>) -> Self {
        self.stdout = StdioBinding::Stream(stream);
        self
    }

    pub fn stderr(mut self, stream: Arc<StreamActor>) -> Self {
        self.stderr = StdioBinding::Stream(stream);
        self
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    fn validate(&self, command: &str, max_args: usize) -> std::result::Result<(), ProcessError> {
        if command.is_empty() {
            return Err(ProcessError::InvalidArgument("empty command".to_string()));
        }
        if self.args.len() > max_args {
            return Err(ProcessError::InvalidArgument(format!(
                "{} arguments exceeds the limit of {}",
                self.args.len(),
                max_args
            )));
        }
        if command.contains('\0') || self.args.iter().any(|a| a.contains('\0')) {
            return Err(ProcessError::InvalidArgument(
                "command or argument contains a NUL byte".to_string(),
            ));
        }
        for (key, value) in self.env.iter().flatten() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ProcessError::InvalidArgument(format!(
                    "invalid environment variable name {:?}",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(ProcessError::InvalidArgument(format!(
                    "environment variable {} contains a NUL byte",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// How a child finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; 0 when terminated by a signal
    pub status: i32,
    /// Terminating signal; 0 on a normal exit
    pub signal: i32,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status == 0 && self.signal == 0
    }

    fn to_values(self) -> [Value; 2] {
        [
            Value::Number(f64::from(self.status)),
            Value::Number(f64::from(self.signal)),
        ]
    }

    fn from_values(values: &[Value]) -> Self {
        let field = |i: usize| values.get(i).and_then(Value::as_number).unwrap_or(0.0) as i32;
        ProcessExit {
            status: field(0),
            signal: field(1),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    #[cfg(unix)]
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit { status: code, signal: 0 },
            (None, Some(signal)) => ProcessExit { status: 0, signal },
            (None, None) => ProcessExit { status: 0, signal: 0 },
        }
    }

    #[cfg(not(unix))]
    fn from(status: ExitStatus) -> Self {
        ProcessExit {
            status: status.code().unwrap_or(0),
            signal: 0,
        }
    }
}

/// Start the child as the leader of a new session
#[cfg(unix)]
fn new_session(cmd: &mut Command) {
    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_session(_cmd: &mut Command) {}

/// Block until `pid` has exited, leaving it unreaped
#[cfg(unix)]
fn wait_exited(pid: u32) -> io::Result<()> {
    let id = libc::id_t::from(pid);
    loop {
        // SAFETY: siginfo_t is plain data and waitid only writes into it
        let rc = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
async fn exit_watch(pid: u32) -> io::Result<()> {
    tokio::task::spawn_blocking(move || wait_exited(pid))
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
}

#[cfg(not(unix))]
async fn exit_watch(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// Result of [`ProcessActor::spawn`]
#[derive(Debug)]
pub enum Spawned {
    /// Attached spawn: the process ran to completion
    Exited(ProcessExit),
    /// Detached spawn: returned immediately
    Detached(Arc<ProcessActor>),
    /// The actor was closed before the process exited
    Closed,
}

#[derive(Debug)]
pub struct ProcessActor {
    core: ActorCore,
    command: String,
    pid: Option<u32>,
    detached: bool,
    exit: Mutex<Option<ProcessExit>>,
    /// Set once the child has exited, before it is reaped. Held while
    /// signalling so a reaped pid is never signalled.
    exited: Mutex<bool>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessActor {
    /// Launch `command` and return without waiting for it
    pub fn start(
        scheduler: &Scheduler,
        command: &str,
        opts: &SpawnOptions,
    ) -> std::result::Result<Arc<Self>, ProcessError> {
        opts.validate(command, scheduler.config().max_args)?;

        let mut cmd = Command::new(command);
        cmd.args(&opts.args);
        if let Some(env) = &opts.env {
            cmd.env_clear().envs(env);
        }
        if let Some(dir) = &opts.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(opts.stdin.to_stdio("stdin")?)
            .stdout(opts.stdout.to_stdio("stdout")?)
            .stderr(opts.stderr.to_stdio("stderr")?);

        if opts.detach {
            new_session(&mut cmd);
        }

        let mut child = {
            let _guard = scheduler.handle().enter();
            cmd.spawn().map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?
        };
        drop(cmd);

        let actor = Arc::new(ProcessActor {
            core: ActorCore::new(ActorKind::Process, scheduler.refs()),
            command: command.to_string(),
            pid: child.id(),
            detached: opts.detach,
            exit: Mutex::new(None),
            exited: Mutex::new(false),
            waiter: Mutex::new(None),
        });
        actor.core.activate();
        if !opts.detach {
            actor.core.reference();
        }
        debug!(
            actor = %actor.id(),
            command = %actor.command,
            pid = ?actor.pid,
            detached = actor.detached,
            "process spawned"
        );

        let codec = scheduler.codec();
        let me = actor.clone();
        let task = scheduler.handle().spawn(async move {
            if let Some(pid) = me.pid {
                if let Err(e) = exit_watch(pid).await {
                    debug!(actor = %me.id(), error = %e, "exit watch failed");
                }
            }
            *me.exited_flag() = true;

            match child.wait().await {
                Ok(status) => {
                    let exit = ProcessExit::from(status);
                    match codec.encode(&exit.to_values()) {
                        Ok(bytes) => me.on_exit(exit, bytes),
                        Err(e) => {
                            warn!(actor = %me.id(), error = %e, "process exit not deliverable");
                            me.close();
                        }
                    }
                }
                Err(e) => {
                    warn!(actor = %me.id(), error = %e, "process wait failed");
                    me.close();
                }
            }
        });
        *actor.waiter_slot() = Some(task);
        if actor.core.is_closed() {
            actor.release_waiter();
        }

        Ok(actor)
    }

    /// Loop callback for the child's exit
    fn on_exit(&self, exit: ProcessExit, bytes: Vec<u8>) {
        *self.exit_slot() = Some(exit);
        debug!(
            actor = %self.id(),
            pid = ?self.pid,
            status = exit.status,
            signal = exit.signal,
            "process exited"
        );
        self.core.settle(bytes);
        self.core.unreference();
        self.rouse(None);
    }

    /// `start`, then either hand back the detached handle or await the exit
    pub fn spawn(ctx: &Context, command: &str, opts: &SpawnOptions) -> Result<Spawned> {
        let process = Self::start(ctx.scheduler(), command, opts)?;
        if opts.detach {
            return Ok(Spawned::Detached(process));
        }
        Ok(match process.wait(ctx)? {
            Some(exit) => Spawned::Exited(exit),
            None => Spawned::Closed,
        })
    }

    /// Await the exit from `ctx`. `None` if the actor was closed first.
    pub fn wait(&self, ctx: &Context) -> Result<Option<ProcessExit>> {
        match ctx.await_actor(self)? {
            Outcome::Closed => Ok(None),
            Outcome::Values(values) => Ok(Some(ProcessExit::from_values(&values))),
        }
    }

    /// Send `signal` to the running process
    #[cfg(unix)]
    pub fn kill(&self, signal: i32) -> std::result::Result<(), ProcessError> {
        let pid = self.pid.unwrap_or(0);
        let not_running = || ProcessError::Kill {
            pid,
            source: io::Error::from_raw_os_error(libc::ESRCH),
        };
        let exited = self.exited_flag();
        if *exited || self.core.is_closed() {
            return Err(not_running());
        }
        let raw = match self.pid.map(libc::pid_t::try_from) {
            Some(Ok(raw)) if raw > 0 => raw,
            _ => return Err(not_running()),
        };

        trace!(actor = %self.id(), pid, signal, "kill");
        // SAFETY: plain syscall; `exited` is held, so the pid is still ours
        if unsafe { libc::kill(raw, signal) } == -1 {
            return Err(ProcessError::Kill {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        drop(exited);
        Ok(())
    }

    fn exited_flag(&self) -> MutexGuard<'_, bool> {
        self.exited.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiter_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop watching the child. Dropping the `Child` hands it to tokio's
    /// orphan reaper.
    fn release_waiter(&self) {
        if let Some(task) = self.waiter_slot().take() {
            task.abort();
        }
    }

    fn exit_slot(&self) -> MutexGuard<'_, Option<ProcessExit>> {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// OS process id while the child is running and the actor is open
    pub fn pid(&self) -> Option<u32> {
        if *self.exited_flag() || self.core.is_closed() {
            None
        } else {
            self.pid
        }
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_slot()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

impl Actor for ProcessActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn rouse(&self, from: Option<&ActorId>) -> usize {
        trace!(actor = %self.core.id(), from = ?from, "rouse process");
        self.core.wake(WakePolicy::All).len()
    }

    fn close(&self) -> bool {
        let closed = self.core.close();
        if closed {
            self.release_waiter();
        }
        closed
    }
}
