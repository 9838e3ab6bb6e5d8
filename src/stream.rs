//! Pipe/stream actor
//!
//! Wraps an OS file handle: a pipe end, a regular file, or a duplicate of
//! this process's stdin/stdout/stderr. Reading awaits the stream; the loop
//! issues one read per waiter and hands each chunk to a single waiter as a
//! string value. End of file closes the stream, so pending readers observe
//! the closed signal.
//!
//! A stream can also be bound to a spawned process's stdio, which gives the
//! child its own duplicate of the handle.

use crate::actor::{Actor, ActorCore, ActorId, ActorKind, Outcome, WakePolicy};
use crate::codec::Codec;
use crate::error::Result;
use crate::runtime::{Context, Scheduler};
use crate::value::Value;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct StreamActor {
    core: ActorCore,
    file: Mutex<Option<File>>,
    reading: AtomicBool,
    handle: Handle,
    codec: Codec,
    chunk_size: usize,
    me: Weak<StreamActor>,
}

impl StreamActor {
    /// Wrap an open file
    pub fn from_file(scheduler: &Scheduler, file: File) -> Arc<Self> {
        let stream = Arc::new_cyclic(|me| StreamActor {
            core: ActorCore::new(ActorKind::Stream, scheduler.refs()),
            file: Mutex::new(Some(file)),
            reading: AtomicBool::new(false),
            handle: scheduler.handle().clone(),
            codec: scheduler.codec(),
            chunk_size: scheduler.config().read_chunk_size.max(1),
            me: me.clone(),
        });
        stream.core.activate();
        stream
    }

    /// A connected `(reader, writer)` pair
    #[cfg(unix)]
    pub fn pipe(scheduler: &Scheduler) -> io::Result<(Arc<Self>, Arc<Self>)> {
        use std::os::fd::OwnedFd;

        let (reader, writer) = io::pipe()?;
        let reader = File::from(OwnedFd::from(reader));
        let writer = File::from(OwnedFd::from(writer));
        Ok((
            Self::from_file(scheduler, reader),
            Self::from_file(scheduler, writer),
        ))
    }

    /// A duplicate of this process's standard input
    #[cfg(unix)]
    pub fn stdin(scheduler: &Scheduler) -> io::Result<Arc<Self>> {
        use std::os::fd::AsFd;
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::from_file(scheduler, File::from(fd)))
    }

    /// A duplicate of this process's standard output
    #[cfg(unix)]
    pub fn stdout(scheduler: &Scheduler) -> io::Result<Arc<Self>> {
        use std::os::fd::AsFd;
        let fd = io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self::from_file(scheduler, File::from(fd)))
    }

    /// A duplicate of this process's standard error
    #[cfg(unix)]
    pub fn stderr(scheduler: &Scheduler) -> io::Result<Arc<Self>> {
        use std::os::fd::AsFd;
        let fd = io::stderr().as_fd().try_clone_to_owned()?;
        Ok(Self::from_file(scheduler, File::from(fd)))
    }

    fn file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clone_file(&self) -> io::Result<File> {
        match &*self.file() {
            Some(file) => file.try_clone(),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed")),
        }
    }

    /// Await the next chunk. `None` once the stream is closed or at EOF.
    pub fn read(&self, ctx: &Context) -> Result<Option<Vec<u8>>> {
        match ctx.await_actor(self)? {
            Outcome::Closed => Ok(None),
            Outcome::Values(values) => Ok(Some(
                values
                    .first()
                    .and_then(Value::as_bytes)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
            )),
        }
    }

    /// Read chunks until the stream closes
    pub fn read_to_end(&self, ctx: &Context) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read(ctx)? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        match &mut *self.file() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed")),
        }
    }

    /// A duplicate handle for a child process's stdio
    pub fn stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(self.clone_file()?))
    }

    fn start_read(&self) {
        if self.core.is_closed() || self.reading.swap(true, Ordering::AcqRel) {
            return;
        }
        let file = match self.clone_file() {
            Ok(file) => file,
            Err(e) => {
                self.reading.store(false, Ordering::Release);
                warn!(actor = %self.id(), error = %e, "stream read not started");
                self.close();
                return;
            }
        };

        let me = self.me.clone();
        let chunk_size = self.chunk_size;
        trace!(actor = %self.id(), "stream read issued");
        self.handle.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let mut file = file;
                let mut buf = vec![0u8; chunk_size];
                let n = file.read(&mut buf)?;
                buf.truncate(n);
                Ok::<_, io::Error>(buf)
            })
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));

            if let Some(stream) = me.upgrade() {
                stream.on_read(result);
            }
        });
    }

    /// Loop callback for a completed read
    fn on_read(&self, result: io::Result<Vec<u8>>) {
        self.reading.store(false, Ordering::Release);
        match result {
            Ok(buf) if buf.is_empty() => {
                debug!(actor = %self.id(), "stream reached end of file");
                self.close();
            }
            Ok(buf) => {
                trace!(actor = %self.id(), bytes = buf.len(), "stream data ready");
                match self.codec.encode(&[Value::String(buf)]) {
                    Ok(bytes) => {
                        self.core.set_pending(bytes);
                        self.rouse(None);
                    }
                    Err(e) => {
                        warn!(actor = %self.id(), error = %e, "stream chunk not deliverable");
                        self.close();
                        return;
                    }
                }
                if self.core.waiting() > 0 {
                    self.start_read();
                }
            }
            Err(e) => {
                warn!(actor = %self.id(), error = %e, "stream read failed");
                self.close();
            }
        }
    }
}

impl Actor for StreamActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn rouse(&self, from: Option<&ActorId>) -> usize {
        trace!(actor = %self.core.id(), from = ?from, "rouse stream");
        self.core.wake(WakePolicy::One).len()
    }

    fn close(&self) -> bool {
        self.file().take();
        self.core.close()
    }

    fn on_waiter(&self) {
        self.start_read();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::actor::ActorState;
    use std::io::Seek;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempfile;

    #[test]
    fn test_pipe_write_then_read() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let (reader, writer) = StreamActor::pipe(&sched).unwrap();

        writer.write(b"ping").unwrap();
        assert_eq!(reader.read(&ctx).unwrap(), Some(b"ping".to_vec()));

        writer.close();
        assert_eq!(reader.read(&ctx).unwrap(), None);
        assert_eq!(reader.state(), ActorState::Closed);
    }

    #[test]
    fn test_file_stream_reads_to_end() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();

        let mut file = tempfile().unwrap();
        file.write_all(b"line one\nline two\n").unwrap();
        file.rewind().unwrap();

        let stream = StreamActor::from_file(&sched, file);
        assert_eq!(stream.read_to_end(&ctx).unwrap(), b"line one\nline two\n".to_vec());
    }

    #[test]
    fn test_close_wakes_all_readers() {
        let sched = Scheduler::with_defaults().unwrap();
        let ctx = sched.main_context();
        let (reader, _writer) = StreamActor::pipe(&sched).unwrap();

        let mut readers = Vec::new();
        for _ in 0..2 {
            let target = reader.clone();
            readers.push(
                ctx.spawn(
                    move |ctx, _| {
                        let got = target.read(ctx)?;
                        Ok(vec![Value::Boolean(got.is_none())])
                    },
                    &[],
                )
                .unwrap(),
            );
        }
        while reader.core().waiting() < 2 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(reader.close());
        assert!(!reader.close());
        for co in &readers {
            let out = ctx.await_actor(&**co).unwrap().into_values();
            assert_eq!(out, vec![Value::Boolean(true)]);
        }
    }

    #[test]
    fn test_write_after_close_fails() {
        let sched = Scheduler::with_defaults().unwrap();
        let (_reader, writer) = StreamActor::pipe(&sched).unwrap();
        writer.close();
        assert_eq!(
            writer.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert!(writer.stdio().is_err());
    }
}
