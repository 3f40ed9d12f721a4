//! Adapter that exposes an external byte producer (file descriptor, socket,
//! subprocess pipe) as a readable byte stream.
//!
//! The native handle is owned by [`NativeReadableSource`] and released through
//! [`NativeSource::deinit`], which consumes it. Every release path takes the
//! handle out of its `Option` first, so it is deinitialized exactly once.

use super::{
    byte_source_trait::ReadableByteSource,
    byte_state::{ReadableByteStreamBuilder, ReadableByteStreamController},
    readable::ReadableStream,
    StreamResult,
};
use crate::platform::{MaybeSend, PlatformBoxFutureStatic};
use futures::future::poll_fn;
use std::{future::Future, task::Poll};
use tracing::{debug, trace};

/// Bytes produced by an asynchronous native read.
#[derive(Debug, Default)]
pub struct NativeChunk {
    pub bytes: Vec<u8>,
    /// The source has nothing more to give after these bytes.
    pub done: bool,
}

/// Outcome of [`NativeSource::pull`].
pub enum NativePull {
    /// `n` bytes were written into the supplied view.
    Written(usize),
    /// The source produced its own buffer.
    Chunk(Vec<u8>),
    /// The read completes later.
    Pending(PlatformBoxFutureStatic<StreamResult<NativeChunk>>),
}

/// Entry points of an external byte producer.
pub trait NativeSource: MaybeSend + Sized + 'static {
    /// Prepare the source and report the preferred chunk size; `0` means it
    /// is already exhausted.
    fn start(&mut self) -> StreamResult<usize>;

    /// Read into `view`. Set `closed` when no more bytes will follow.
    fn pull(&mut self, view: &mut [u8], closed: &mut bool) -> StreamResult<NativePull>;

    fn cancel(&mut self, reason: Option<String>);

    /// Keep the host event loop alive while a read is outstanding.
    fn set_ref(&mut self, keep_alive: bool) {
        let _ = keep_alive;
    }

    /// Bytes already buffered at construction time, delivered before any pull.
    fn drain(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Release the native resource.
    fn deinit(self);
}

/// [`ReadableByteSource`] over a [`NativeSource`].
pub struct NativeReadableSource<N: NativeSource> {
    handle: Option<N>,
    chunk_size: Option<usize>,
    pending_drain: Option<Vec<u8>>,
}

impl<N: NativeSource> NativeReadableSource<N> {
    pub fn new(mut native: N) -> Self {
        let pending_drain = native.drain().filter(|bytes| !bytes.is_empty());
        Self {
            handle: Some(native),
            chunk_size: None,
            pending_drain,
        }
    }

    fn release(&mut self) {
        if let Some(native) = self.handle.take() {
            debug!("native source deinit");
            native.deinit();
        }
    }

    /// Close the stream and let go of the handle.
    fn finish(&mut self, controller: &ReadableByteStreamController) -> StreamResult<()> {
        self.release();
        controller.close()
    }

    fn deliver(
        &mut self,
        controller: &ReadableByteStreamController,
        chunk: NativeChunk,
    ) -> StreamResult<()> {
        if !chunk.bytes.is_empty() {
            controller.enqueue(chunk.bytes)?;
        }
        if chunk.done {
            self.finish(controller)?;
        }
        Ok(())
    }
}

impl<N: NativeSource> NativeReadableSource<N> {
    /// One read from the native side. Returns `false` when it produced no
    /// bytes and did not close, so the caller has to ask again.
    async fn pull_once(&mut self, controller: &ReadableByteStreamController) -> StreamResult<bool> {
        let Some(native) = self.handle.as_mut() else {
            return Ok(true);
        };

        let chunk_size = match self.chunk_size {
            Some(size) => size,
            None => {
                let size = native.start()?;
                trace!(size, "native source started");
                self.chunk_size = Some(size);
                if size == 0 {
                    let drained = self.pending_drain.take().unwrap_or_default();
                    self.deliver(
                        controller,
                        NativeChunk {
                            bytes: drained,
                            done: true,
                        },
                    )?;
                    return Ok(true);
                }
                size
            }
        };

        if let Some(drained) = self.pending_drain.take() {
            controller.enqueue(drained)?;
            return Ok(true);
        }

        let mut closed = false;
        let outcome = match controller.byob_request() {
            Some(mut request) => {
                let pulled = match request.view() {
                    Some(view) => native.pull(view, &mut closed)?,
                    None => native.pull(&mut [], &mut closed)?,
                };
                match pulled {
                    NativePull::Written(n) if n > 0 => {
                        request.respond(n)?;
                        None
                    }
                    other => Some(other),
                }
            }
            None => {
                let mut buffer = vec![0u8; chunk_size];
                match native.pull(&mut buffer, &mut closed)? {
                    NativePull::Written(n) => {
                        buffer.truncate(n);
                        Some(NativePull::Chunk(buffer))
                    }
                    other => Some(other),
                }
            }
        };

        let progressed = match outcome {
            None => true,
            // Nothing written: the buffer goes back to the read untouched.
            Some(NativePull::Written(_)) => false,
            Some(NativePull::Chunk(bytes)) => {
                let progressed = !bytes.is_empty();
                self.deliver(controller, NativeChunk { bytes, done: false })?;
                progressed
            }
            Some(NativePull::Pending(read)) => {
                native.set_ref(true);
                let result = read.await;
                if let Some(native) = self.handle.as_mut() {
                    native.set_ref(false);
                }
                let chunk = result?;
                let progressed = chunk.done || !chunk.bytes.is_empty();
                self.deliver(controller, chunk)?;
                progressed
            }
        };

        if closed && self.handle.is_some() {
            self.finish(controller)?;
        }
        Ok(progressed || closed)
    }
}

/// Returns `Pending` once after waking the task, letting other work run.
fn yield_once() -> impl Future<Output = ()> {
    let mut yielded = false;
    poll_fn(move |cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
}

impl<N: NativeSource> ReadableByteSource for NativeReadableSource<N> {
    async fn pull(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
        while !self.pull_once(controller).await? {
            trace!("native source gave no bytes, pulling again");
            yield_once().await;
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        if let Some(mut native) = self.handle.take() {
            debug!(?reason, "canceling native source");
            native.cancel(reason);
            native.deinit();
        }
        Ok(())
    }
}

impl<N: NativeSource> Drop for NativeReadableSource<N> {
    fn drop(&mut self) {
        self.release();
    }
}

impl ReadableStream<Vec<u8>> {
    /// Byte stream backed by a native source.
    pub fn from_native<N: NativeSource>(
        native: N,
    ) -> ReadableByteStreamBuilder<NativeReadableSource<N>> {
        ReadableStream::builder_bytes(NativeReadableSource::new(native))
    }
}
