use super::{
    byte_source_trait::ReadableByteSource,
    error::StreamError,
    queue::SizedQueue,
    readable::{
        DriverEvent, PullState, ReadableStream, ReadableStreamOps, ReaderCore, StreamState,
    },
    signal::{race, DriverSignal, PendingOp, Settle},
    validate_high_water_mark, StreamResult,
};
use crate::platform::{PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{poll_fn, Either},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    task::{Context, Poll},
};
use tracing::{debug, trace};

/// Outcome of a BYOB read.
///
/// `buffer` is the caller's buffer handed back; its first `bytes_read` bytes
/// hold the data. `done` is set once the stream has closed; a closing stream
/// may still deliver a short, partially filled read with `done = true`.
#[derive(Debug)]
pub struct ReadIntoResult {
    pub buffer: Vec<u8>,
    pub bytes_read: usize,
    pub done: bool,
}

impl ReadIntoResult {
    pub fn filled(&self) -> &[u8] {
        &self.buffer[..self.bytes_read]
    }

    pub fn into_filled(mut self) -> Vec<u8> {
        self.buffer.truncate(self.bytes_read);
        self.buffer
    }
}

/// Shape of a BYOB read: the buffer is treated as `len / element_size`
/// elements and the read only completes once `min` whole elements are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIntoOptions {
    pub element_size: usize,
    pub min: usize,
}

impl Default for ReadIntoOptions {
    fn default() -> Self {
        Self {
            element_size: 1,
            min: 1,
        }
    }
}

type ReadIntoRequest = oneshot::Sender<StreamResult<ReadIntoResult>>;

enum ReaderKind {
    /// Buffer auto-allocated for a default read.
    Default,
    Byob(ReadIntoRequest),
}

struct PullIntoDescriptor {
    id: u64,
    /// `None` while lent to a [`ReadableStreamBYOBRequest`].
    buffer: Option<Vec<u8>>,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    kind: ReaderKind,
    lent: bool,
    invalidated: bool,
}

struct ByteChunk {
    buffer: Vec<u8>,
    offset: usize,
}

impl ByteChunk {
    fn remaining(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut buffer = self.buffer;
        buffer.drain(..self.offset);
        buffer
    }
}

/// Copies as many queued bytes into `desc` as fit. Returns `true` when the
/// descriptor reached its minimum fill; only whole elements are taken then.
fn fill_pull_into_from_queue(
    queue: &mut SizedQueue<ByteChunk>,
    desc: &mut PullIntoDescriptor,
) -> bool {
    let Some(buffer) = desc.buffer.as_mut() else {
        return false;
    };
    let available = queue.total_size() as usize;
    let max_bytes_to_copy = available.min(desc.byte_length - desc.bytes_filled);
    let max_bytes_filled = desc.bytes_filled + max_bytes_to_copy;
    let max_aligned_bytes = max_bytes_filled - max_bytes_filled % desc.element_size;

    let mut remaining = max_bytes_to_copy;
    let mut ready = false;
    if max_aligned_bytes >= desc.minimum_fill {
        remaining = max_aligned_bytes - desc.bytes_filled;
        ready = true;
    }

    while remaining > 0 {
        let Some(head) = queue.peek_mut() else {
            break;
        };
        let chunk = head.remaining();
        let n = remaining.min(chunk.len());
        let dest = desc.bytes_filled;
        buffer[dest..dest + n].copy_from_slice(&chunk[..n]);
        if n == chunk.len() {
            queue.dequeue();
        } else {
            head.offset += n;
            queue.consume_head(n as f64);
        }
        desc.bytes_filled += n;
        remaining -= n;
    }
    ready
}

pub(crate) struct ByteInner {
    core: ReaderCore<Vec<u8>>,
    queue: SizedQueue<ByteChunk>,
    high_water_mark: f64,
    auto_allocate_chunk_size: Option<usize>,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    close_requested: bool,
    pull: PullState,
    next_request_id: u64,
}

impl ByteInner {
    fn desired_size(&self) -> Option<f64> {
        match self.core.state {
            StreamState::Readable => Some(self.high_water_mark - self.queue.total_size()),
            _ => None,
        }
    }

    fn num_read_into_requests(&self) -> usize {
        self.pending_pull_intos
            .iter()
            .filter(|d| matches!(&d.kind, ReaderKind::Byob(tx) if !tx.is_canceled()))
            .count()
    }

    fn should_call_pull(&mut self) -> bool {
        if self.core.state != StreamState::Readable || self.close_requested {
            return false;
        }
        if self.pull == PullState::Starting {
            return false;
        }
        if self.core.num_read_requests() > 0 || self.num_read_into_requests() > 0 {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    fn call_pull_if_needed(&mut self, signal: &DriverSignal) {
        if self.should_call_pull() && self.pull.request() {
            signal.wake();
        }
    }

    fn handle_queue_drain(&mut self, signal: &DriverSignal) {
        if self.queue.is_empty() && self.close_requested {
            self.close_stream();
        } else {
            self.call_pull_if_needed(signal);
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn enqueue_chunk(&mut self, buffer: Vec<u8>) {
        let size = buffer.len() as f64;
        if let Err((_, e)) = self.queue.enqueue(ByteChunk { buffer, offset: 0 }, size) {
            self.error(e);
        }
    }

    /// Settles a descriptor that has left the pending list.
    fn commit(&mut self, desc: PullIntoDescriptor, done: bool) {
        let PullIntoDescriptor {
            buffer,
            bytes_filled,
            kind,
            ..
        } = desc;
        let mut buffer = buffer.unwrap_or_default();
        match kind {
            ReaderKind::Default => {
                if bytes_filled > 0 {
                    buffer.truncate(bytes_filled);
                    if let Some(unclaimed) = self.core.fulfill_read_request(buffer) {
                        self.enqueue_chunk(unclaimed);
                    }
                }
            }
            ReaderKind::Byob(tx) => {
                let _ = tx.send(Ok(ReadIntoResult {
                    buffer,
                    bytes_read: bytes_filled,
                    done,
                }));
            }
        }
    }

    fn process_read_requests_using_queue(&mut self) {
        while self.core.num_read_requests() > 0 {
            let Some(chunk) = self.queue.dequeue() else {
                break;
            };
            if let Some(unclaimed) = self.core.fulfill_read_request(chunk.into_bytes()) {
                self.enqueue_chunk(unclaimed);
                break;
            }
        }
    }

    fn process_pull_intos_using_queue(&mut self) {
        while self.queue.total_size() > 0.0 {
            let Some(head) = self.pending_pull_intos.front_mut() else {
                break;
            };
            if head.lent || !fill_pull_into_from_queue(&mut self.queue, head) {
                break;
            }
            if let Some(desc) = self.pending_pull_intos.pop_front() {
                self.commit(desc, false);
            }
        }
    }

    fn enqueue(&mut self, chunk: Vec<u8>, signal: &DriverSignal) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::type_error("cannot enqueue after close was requested"));
        }
        if self.core.state != StreamState::Readable {
            return Err(StreamError::type_error(
                "cannot enqueue into a stream that is not readable",
            ));
        }
        if chunk.is_empty() {
            return Err(StreamError::type_error("chunk must have a non-zero byte length"));
        }

        // An outstanding BYOB request can no longer be answered once fresh
        // bytes arrive ahead of it.
        if let Some(head) = self.pending_pull_intos.front_mut() {
            if head.lent {
                head.invalidated = true;
            }
        }

        self.process_read_requests_using_queue();
        if self.core.num_read_requests() > 0 {
            if matches!(
                self.pending_pull_intos.front().map(|d| &d.kind),
                Some(ReaderKind::Default)
            ) {
                self.pending_pull_intos.pop_front();
            }
            if let Some(unclaimed) = self.core.fulfill_read_request(chunk) {
                self.enqueue_chunk(unclaimed);
            }
        } else {
            self.enqueue_chunk(chunk);
            self.process_pull_intos_using_queue();
        }
        self.handle_queue_drain(signal);
        Ok(())
    }

    fn close(&mut self) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::type_error("close was already requested"));
        }
        if self.core.state != StreamState::Readable {
            return Err(StreamError::type_error("cannot close a stream that is not readable"));
        }
        if self.queue.total_size() > 0.0 {
            self.close_requested = true;
            return Ok(());
        }
        if let Some(head) = self.pending_pull_intos.front() {
            if head.bytes_filled % head.element_size != 0 {
                let e = StreamError::type_error(
                    "insufficient bytes to fill elements in the given buffer",
                );
                self.error(e.clone());
                return Err(e);
            }
        }
        self.close_requested = true;
        self.close_stream();
        Ok(())
    }

    /// Closes the stream. BYOB reads in hand settle with what they have and
    /// `done = true`; a lent descriptor settles when its request comes back.
    fn close_stream(&mut self) {
        debug!("readable byte stream closed");
        self.core.close();
        let pending = std::mem::take(&mut self.pending_pull_intos);
        for desc in pending {
            if desc.lent {
                self.pending_pull_intos.push_back(desc);
            } else if matches!(desc.kind, ReaderKind::Byob(_)) {
                self.commit(desc, true);
            }
        }
    }

    fn error(&mut self, error: StreamError) {
        if self.core.state != StreamState::Readable {
            return;
        }
        debug!(%error, "readable byte stream errored");
        self.queue.reset();
        for desc in self.pending_pull_intos.drain(..) {
            if let ReaderKind::Byob(tx) = desc.kind {
                let _ = tx.send(Err(error.clone()));
            }
        }
        self.core.error(error);
    }

    fn read(&mut self, signal: &DriverSignal) -> Settle<Option<Vec<u8>>> {
        match self.core.state {
            StreamState::Closed => return Settle::ready(Ok(None)),
            StreamState::Errored => return Settle::ready(Err(self.core.stored_error())),
            StreamState::Readable => {}
        }

        if let Some(chunk) = self.queue.dequeue() {
            self.handle_queue_drain(signal);
            return Settle::ready(Ok(Some(chunk.into_bytes())));
        }

        let rx = self.core.add_read_request();
        if let Some(size) = self.auto_allocate_chunk_size {
            let id = self.next_id();
            self.pending_pull_intos.push_back(PullIntoDescriptor {
                id,
                buffer: Some(vec![0; size]),
                byte_length: size,
                bytes_filled: 0,
                minimum_fill: 1,
                element_size: 1,
                kind: ReaderKind::Default,
                lent: false,
                invalidated: false,
            });
        }
        self.call_pull_if_needed(signal);
        Settle::Waiting(rx)
    }

    fn read_into(
        &mut self,
        buffer: Vec<u8>,
        options: ReadIntoOptions,
        signal: &DriverSignal,
    ) -> Settle<ReadIntoResult> {
        let ReadIntoOptions { element_size, min } = options;
        if element_size == 0 {
            return Settle::ready(Err(StreamError::type_error(
                "element size must be greater than 0",
            )));
        }
        if buffer.is_empty() {
            return Settle::ready(Err(StreamError::type_error(
                "buffer must have a non-zero byte length",
            )));
        }
        if buffer.len() % element_size != 0 {
            return Settle::ready(Err(StreamError::range_error(
                "buffer length must be a multiple of the element size",
            )));
        }
        if min == 0 {
            return Settle::ready(Err(StreamError::type_error("min must be greater than 0")));
        }
        let minimum_fill = match min.checked_mul(element_size) {
            Some(bytes) if bytes <= buffer.len() => bytes,
            _ => {
                return Settle::ready(Err(StreamError::range_error(format!(
                    "min {} exceeds the {} elements the buffer holds",
                    min,
                    buffer.len() / element_size
                ))))
            }
        };

        match self.core.state {
            StreamState::Errored => return Settle::ready(Err(self.core.stored_error())),
            StreamState::Closed => {
                return Settle::ready(Ok(ReadIntoResult {
                    buffer,
                    bytes_read: 0,
                    done: true,
                }))
            }
            StreamState::Readable => {}
        }

        let (tx, rx) = oneshot::channel();
        let byte_length = buffer.len();
        let mut desc = PullIntoDescriptor {
            id: self.next_id(),
            buffer: Some(buffer),
            byte_length,
            bytes_filled: 0,
            minimum_fill,
            element_size,
            kind: ReaderKind::Byob(tx),
            lent: false,
            invalidated: false,
        };

        if !self.pending_pull_intos.is_empty() {
            self.pending_pull_intos.push_back(desc);
            return Settle::Waiting(rx);
        }

        if self.queue.total_size() > 0.0 {
            if fill_pull_into_from_queue(&mut self.queue, &mut desc) {
                self.commit(desc, false);
                self.handle_queue_drain(signal);
                return Settle::Waiting(rx);
            }
            if self.close_requested {
                let e = StreamError::type_error(
                    "insufficient bytes to fill elements in the given buffer",
                );
                self.error(e.clone());
                return Settle::ready(Err(e));
            }
        }

        self.pending_pull_intos.push_back(desc);
        self.call_pull_if_needed(signal);
        Settle::Waiting(rx)
    }

    /// Lends the head descriptor's buffer out as a BYOB request.
    fn lend_head(&mut self) -> Option<(u64, Vec<u8>, usize)> {
        let head = self.pending_pull_intos.front_mut()?;
        if head.lent {
            return None;
        }
        let buffer = head.buffer.take()?;
        head.lent = true;
        Some((head.id, buffer, head.bytes_filled))
    }

    /// Puts a lent buffer back on the head descriptor. Returns whether the
    /// request had been invalidated by an enqueue in the meantime.
    fn take_back(&mut self, id: u64, buffer: Vec<u8>) -> Option<bool> {
        let head = self.pending_pull_intos.front_mut().filter(|d| d.id == id && d.lent)?;
        head.buffer = Some(buffer);
        head.lent = false;
        Some(std::mem::take(&mut head.invalidated))
    }

    fn restore(&mut self, id: u64, buffer: Vec<u8>, signal: &DriverSignal) {
        let Some(invalidated) = self.take_back(id, buffer) else {
            return;
        };
        if self.core.state == StreamState::Closed {
            if let Some(desc) = self.pending_pull_intos.pop_front() {
                self.commit(desc, true);
            }
        } else if invalidated {
            self.process_pull_intos_using_queue();
            self.handle_queue_drain(signal);
        }
    }

    fn respond(
        &mut self,
        id: u64,
        buffer: Vec<u8>,
        bytes_written: usize,
        signal: &DriverSignal,
    ) -> StreamResult<()> {
        let Some(invalidated) = self.take_back(id, buffer) else {
            return Err(StreamError::type_error("BYOB request is no longer pending"));
        };
        if invalidated {
            self.process_pull_intos_using_queue();
            self.handle_queue_drain(signal);
            return Err(StreamError::type_error(
                "BYOB request was invalidated by a later enqueue",
            ));
        }

        match self.core.state {
            StreamState::Closed => {
                if let Some(desc) = self.pending_pull_intos.pop_front() {
                    self.commit(desc, true);
                }
                if bytes_written != 0 {
                    return Err(StreamError::type_error(
                        "bytes written must be 0 once the stream is closed",
                    ));
                }
                Ok(())
            }
            StreamState::Errored => Err(self.core.stored_error()),
            StreamState::Readable => {
                let capacity = self
                    .pending_pull_intos
                    .front()
                    .map(|d| d.byte_length - d.bytes_filled)
                    .unwrap_or(0);
                if bytes_written == 0 {
                    return Err(StreamError::type_error(
                        "bytes written must be greater than 0 while the stream is readable",
                    ));
                }
                if bytes_written > capacity {
                    return Err(StreamError::range_error(format!(
                        "bytes written {} exceed the remaining capacity {}",
                        bytes_written, capacity
                    )));
                }
                self.respond_in_readable_state(bytes_written);
                self.handle_queue_drain(signal);
                Ok(())
            }
        }
    }

    fn respond_in_readable_state(&mut self, bytes_written: usize) {
        let Some(head) = self.pending_pull_intos.front_mut() else {
            return;
        };
        head.bytes_filled += bytes_written;
        if head.bytes_filled < head.minimum_fill {
            return;
        }

        // Trailing bytes of an incomplete element go back to the queue.
        let remainder = head.bytes_filled % head.element_size;
        let mut leftover = None;
        if remainder > 0 {
            let end = head.bytes_filled;
            leftover = head
                .buffer
                .as_ref()
                .map(|buffer| buffer[end - remainder..end].to_vec());
            head.bytes_filled -= remainder;
        }

        if let Some(desc) = self.pending_pull_intos.pop_front() {
            self.commit(desc, false);
        }
        if let Some(rest) = leftover {
            self.enqueue_chunk(rest);
        }
        self.process_pull_intos_using_queue();
    }

    fn view_lost(&mut self, id: u64) {
        let lost = self
            .pending_pull_intos
            .front()
            .is_some_and(|d| d.id == id && d.lent);
        if lost {
            self.error(StreamError::type_error(
                "BYOB view was taken and never handed back",
            ));
        }
    }
}

/// Shared state of a byte stream: controller, queue and the pull-into list.
pub(crate) struct ByteStreamState {
    inner: Mutex<ByteInner>,
    signal: SharedPtr<DriverSignal>,
}

impl ByteStreamState {
    fn new(high_water_mark: f64, auto_allocate_chunk_size: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(ByteInner {
                core: ReaderCore::new(),
                queue: SizedQueue::new(),
                high_water_mark,
                auto_allocate_chunk_size,
                pending_pull_intos: VecDeque::new(),
                close_requested: false,
                pull: PullState::Starting,
                next_request_id: 1,
            }),
            signal: DriverSignal::new(),
        }
    }

    fn start_settled(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.pull = PullState::Idle;
                inner.call_pull_if_needed(&self.signal);
            }
            Err(e) => {
                debug!(error = %e, "readable byte source failed to start");
                inner.error(e);
            }
        }
    }

    fn pull_settled(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        let again = inner.pull.finish();
        match result {
            Ok(()) if again => inner.call_pull_if_needed(&self.signal),
            Ok(()) => {}
            Err(e) => inner.error(e),
        }
    }

    fn poll_event(&self, cx: &mut Context<'_>) -> Poll<DriverEvent> {
        let mut inner = self.inner.lock();
        if let Some(request) = inner.core.cancel.take() {
            return Poll::Ready(DriverEvent::Cancel(request));
        }
        if inner.pull == PullState::Requested {
            inner.pull = PullState::Pulling;
            return Poll::Ready(DriverEvent::Pull);
        }
        if inner.core.state != StreamState::Readable || self.signal.is_abandoned() {
            return Poll::Ready(DriverEvent::Finished);
        }
        self.signal.register(cx.waker());
        if self.signal.is_abandoned() {
            return Poll::Ready(DriverEvent::Finished);
        }
        Poll::Pending
    }

    fn poll_interrupt(&self, cx: &mut Context<'_>) -> Poll<()> {
        let inner = self.inner.lock();
        if inner.core.cancel.is_some() || self.signal.is_abandoned() {
            return Poll::Ready(());
        }
        self.signal.register(cx.waker());
        if self.signal.is_abandoned() {
            return Poll::Ready(());
        }
        Poll::Pending
    }

    fn abandon(&self) {
        let mut inner = self.inner.lock();
        if !inner.close_requested {
            inner.error(StreamError::TaskDropped);
        }
    }
}

impl ReadableStreamOps<Vec<u8>> for ByteStreamState {
    fn signal(&self) -> &SharedPtr<DriverSignal> {
        &self.signal
    }

    fn acquire_lock(&self) -> StreamResult<u64> {
        self.inner.lock().core.acquire_lock()
    }

    fn release_lock(&self, lock_id: u64) {
        self.inner.lock().core.release_lock(lock_id);
    }

    fn is_locked(&self) -> bool {
        self.inner.lock().core.is_locked()
    }

    fn state(&self) -> StreamState {
        self.inner.lock().core.state
    }

    fn read(&self, lock_id: u64) -> Settle<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.core.check_lock(lock_id) {
            return Settle::ready(Err(e));
        }
        inner.read(&self.signal)
    }

    fn cancel(&self, lock_id: Option<u64>, reason: Option<String>) -> Settle<()> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.core.check_cancel_caller(lock_id) {
            return Settle::ready(Err(e));
        }
        let was_readable = inner.core.state == StreamState::Readable;
        let settle = inner.core.begin_cancel(reason, &self.signal);
        if was_readable {
            inner.queue.reset();
            for desc in inner.pending_pull_intos.drain(..) {
                if let ReaderKind::Byob(tx) = desc.kind {
                    let _ = tx.send(Ok(ReadIntoResult {
                        buffer: desc.buffer.unwrap_or_default(),
                        bytes_read: 0,
                        done: true,
                    }));
                }
            }
        }
        settle
    }

    fn poll_closed(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.inner.lock().core.poll_closed(lock_id, cx)
    }
}

// ----------- Byte Controller -----------

/// Handle given to a [`ReadableByteSource`].
#[derive(Clone)]
pub struct ReadableByteStreamController {
    shared: SharedPtr<ByteStreamState>,
}

impl ReadableByteStreamController {
    /// `high_water_mark - queued bytes`, or `None` once closed or errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.inner.lock().desired_size()
    }

    /// Push an owned chunk. Empty chunks are rejected with a `TypeError`.
    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        self.shared.inner.lock().enqueue(chunk, &self.shared.signal)
    }

    pub fn close(&self) -> StreamResult<()> {
        self.shared.inner.lock().close()
    }

    pub fn error(&self, error: StreamError) {
        self.shared.inner.lock().error(error);
    }

    /// Borrow the buffer of the oldest pending read, if there is one and it
    /// is not already lent out.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        let (id, buffer, bytes_filled) = self.shared.inner.lock().lend_head()?;
        Some(ReadableStreamBYOBRequest {
            shared: SharedPtr::clone(&self.shared),
            id,
            byte_length: buffer.len(),
            buffer: Some(buffer),
            bytes_filled,
            settled: false,
        })
    }
}

// ----------- BYOB Request -----------

/// A reader's buffer lent to the source.
///
/// The buffer travels by value: it goes back to the pending read on
/// [`respond`](Self::respond), [`respond_with_new_view`](Self::respond_with_new_view)
/// or drop. Dropping the request without responding leaves the read pending,
/// except on a closed stream where it acts as `respond(0)`.
pub struct ReadableStreamBYOBRequest {
    shared: SharedPtr<ByteStreamState>,
    id: u64,
    buffer: Option<Vec<u8>>,
    byte_length: usize,
    bytes_filled: usize,
    settled: bool,
}

impl ReadableStreamBYOBRequest {
    /// The unfilled part of the lent buffer.
    pub fn view(&mut self) -> Option<&mut [u8]> {
        let from = self.bytes_filled;
        self.buffer.as_mut().map(|buffer| &mut buffer[from..])
    }

    /// Bytes that can still be written.
    pub fn capacity(&self) -> usize {
        self.byte_length - self.bytes_filled
    }

    /// Move the buffer out so it can be filled elsewhere, e.g. by a native
    /// read. Hand it back with [`respond_with_new_view`](Self::respond_with_new_view).
    pub fn take_view(&mut self) -> Option<ByobView> {
        let buffer = self.buffer.take()?;
        Some(ByobView {
            buffer,
            byte_offset: self.bytes_filled,
            byte_length: self.byte_length - self.bytes_filled,
        })
    }

    /// Report that `bytes_written` bytes were written into [`view`](Self::view).
    ///
    /// More than [`capacity`](Self::capacity) fails with a `RangeError` and the
    /// buffer goes back to the read untouched.
    pub fn respond(mut self, bytes_written: usize) -> StreamResult<()> {
        let Some(buffer) = self.buffer.take() else {
            return Err(StreamError::type_error(
                "the view was taken; hand it back with respond_with_new_view",
            ));
        };
        self.settled = true;
        self.shared
            .inner
            .lock()
            .respond(self.id, buffer, bytes_written, &self.shared.signal)
    }

    /// Hand back a view taken with [`take_view`](Self::take_view), possibly
    /// truncated to the bytes actually written.
    pub fn respond_with_new_view(mut self, view: ByobView) -> StreamResult<()> {
        self.settled = true;
        self.buffer = None;
        let ByobView {
            buffer,
            byte_offset,
            byte_length,
        } = view;

        let mut inner = self.shared.inner.lock();
        let invalid = if buffer.len() != self.byte_length {
            Some("view buffer length does not match the BYOB request")
        } else if byte_offset != self.bytes_filled {
            Some("view offset does not match the BYOB request")
        } else if byte_length > self.byte_length - self.bytes_filled {
            Some("view is larger than the BYOB request")
        } else {
            None
        };
        if let Some(message) = invalid {
            inner.restore(self.id, buffer, &self.shared.signal);
            return Err(StreamError::range_error(message));
        }
        inner.respond(self.id, buffer, byte_length, &self.shared.signal)
    }
}

impl Drop for ReadableStreamBYOBRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.shared.inner.lock();
        match self.buffer.take() {
            Some(buffer) => inner.restore(self.id, buffer, &self.shared.signal),
            None => inner.view_lost(self.id),
        }
    }
}

/// Owned window over a lent BYOB buffer.
#[derive(Debug)]
pub struct ByobView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
}

impl ByobView {
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// Shrink the view to the first `len` bytes, e.g. to what a read produced.
    pub fn truncate(&mut self, len: usize) {
        self.byte_length = self.byte_length.min(len);
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }
}

// ----------- BYOB Reader -----------

pub struct ReadableStreamBYOBReader {
    shared: SharedPtr<ByteStreamState>,
    lock_id: u64,
}

impl ReadableStreamBYOBReader {
    /// Fill `buffer` with at least one byte.
    pub fn read_into(&self, buffer: Vec<u8>) -> PendingOp<ReadIntoResult> {
        self.read_into_with(buffer, ReadIntoOptions::default())
    }

    pub fn read_into_with(
        &self,
        buffer: Vec<u8>,
        options: ReadIntoOptions,
    ) -> PendingOp<ReadIntoResult> {
        let settle = {
            let mut inner = self.shared.inner.lock();
            match inner.core.check_lock(self.lock_id) {
                Err(e) => Settle::ready(Err(e)),
                Ok(()) => inner.read_into(buffer, options, &self.shared.signal),
            }
        };
        PendingOp::detached(settle)
    }

    pub fn cancel(&self, reason: Option<String>) -> PendingOp<()> {
        PendingOp::detached(ReadableStreamOps::cancel(&*self.shared, Some(self.lock_id), reason))
    }

    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| self.shared.poll_closed(self.lock_id, cx)).await
    }

    pub fn release_lock(&self) {
        ReadableStreamOps::release_lock(&*self.shared, self.lock_id);
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        ReadableStreamOps::release_lock(&*self.shared, self.lock_id);
    }
}

impl ReadableStream<Vec<u8>> {
    /// Builder for a byte stream over `source`.
    pub fn builder_bytes<Source: ReadableByteSource>(
        source: Source,
    ) -> ReadableByteStreamBuilder<Source> {
        ReadableByteStreamBuilder::new(source)
    }

    /// Lock the stream to a BYOB reader. Only byte streams support one.
    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader> {
        let shared = self
            .byte_state
            .as_ref()
            .ok_or_else(|| StreamError::type_error("BYOB readers need a readable byte stream"))?;
        let lock_id = ReadableStreamOps::acquire_lock(&**shared)?;
        Ok(ReadableStreamBYOBReader {
            shared: SharedPtr::clone(shared),
            lock_id,
        })
    }
}

// ----------- Driver -----------

fn interrupted(shared: &ByteStreamState) -> impl Future<Output = ()> + '_ {
    poll_fn(move |cx| shared.poll_interrupt(cx))
}

async fn readable_byte_stream_task<Source>(shared: SharedPtr<ByteStreamState>, mut source: Source)
where
    Source: ReadableByteSource,
{
    let mut controller = ReadableByteStreamController {
        shared: SharedPtr::clone(&shared),
    };

    if let Either::Left(result) = race(source.start(&mut controller), interrupted(&shared)).await {
        shared.start_settled(result);
    }

    loop {
        match poll_fn(|cx| shared.poll_event(cx)).await {
            DriverEvent::Pull => {
                trace!("pulling from readable byte source");
                if let Either::Left(result) =
                    race(source.pull(&mut controller), interrupted(&shared)).await
                {
                    shared.pull_settled(result);
                }
            }
            DriverEvent::Cancel(request) => {
                let result = source.cancel(request.reason).await;
                let _ = request.completion.send(result);
                break;
            }
            DriverEvent::Finished => break,
        }
    }
    if shared.signal.is_abandoned() {
        shared.abandon();
    }
    trace!("readable byte stream driver finished");
}

// ----------- Builder -----------

pub struct ReadableByteStreamBuilder<Source> {
    source: Source,
    high_water_mark: f64,
    auto_allocate_chunk_size: Option<usize>,
}

impl<Source: ReadableByteSource> ReadableByteStreamBuilder<Source> {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            high_water_mark: 0.0,
            auto_allocate_chunk_size: None,
        }
    }

    /// Bytes to buffer ahead of reads. Defaults to 0.
    pub fn high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Give default reads a buffer of `size` bytes so the source always sees a
    /// BYOB request.
    pub fn auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }

    pub fn prepare(self) -> StreamResult<(ReadableStream<Vec<u8>>, impl Future<Output = ()>)> {
        let high_water_mark = validate_high_water_mark(self.high_water_mark)?;
        if self.auto_allocate_chunk_size == Some(0) {
            return Err(StreamError::type_error("auto allocate chunk size must be greater than 0"));
        }
        let shared = SharedPtr::new(ByteStreamState::new(
            high_water_mark,
            self.auto_allocate_chunk_size,
        ));
        let ops: SharedPtr<dyn ReadableStreamOps<Vec<u8>>> = shared.clone();
        let stream = ReadableStream::from_ops(ops, Some(SharedPtr::clone(&shared)));
        Ok((stream, readable_byte_stream_task(shared, self.source)))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<Vec<u8>>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    type Log = SharedPtr<Mutex<Vec<String>>>;

    struct OneShotBytes;

    impl ReadableByteSource for OneShotBytes {
        async fn pull(
            &mut self,
            controller: &mut ReadableByteStreamController,
        ) -> StreamResult<()> {
            controller.enqueue(vec![1, 2, 3])?;
            controller.close()
        }
    }

    #[tokio_localset_test::localset_test]
    async fn default_reader_sees_chunk_then_end_of_stream() {
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(OneShotBytes)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        assert!(stream.is_byte_stream());
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(reader.read().await.unwrap(), None);
        reader.closed().await.unwrap();
    }

    /// Writes an increasing byte pattern straight into the lent buffer.
    struct Counter {
        next: u8,
        limit: u8,
    }

    impl ReadableByteSource for Counter {
        async fn pull(
            &mut self,
            controller: &mut ReadableByteStreamController,
        ) -> StreamResult<()> {
            if self.next >= self.limit {
                return controller.close();
            }
            let Some(mut request) = controller.byob_request() else {
                return controller.enqueue(vec![self.next]).map(|_| self.next += 1);
            };
            let view = request.view().unwrap();
            let mut written = 0;
            for slot in view.iter_mut() {
                if self.next >= self.limit {
                    break;
                }
                *slot = self.next;
                self.next += 1;
                written += 1;
            }
            request.respond(written)
        }
    }

    #[tokio_localset_test::localset_test]
    async fn byob_reader_fills_caller_buffer() {
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(Counter { next: 0, limit: 6 })
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let first = reader.read_into(vec![0; 4]).await.unwrap();
        assert!(!first.done);
        assert_eq!(first.filled(), &[0, 1, 2, 3]);

        let second = reader.read_into(first.buffer).await.unwrap();
        assert_eq!(second.filled(), &[4, 5]);

        let last = reader.read_into(second.buffer).await.unwrap();
        assert!(last.done);
        assert_eq!(last.bytes_read, 0);
        assert_eq!(last.buffer.len(), 4);
    }

    #[tokio_localset_test::localset_test]
    async fn respond_beyond_capacity_leaves_buffer_untouched() {
        struct Overflowing {
            log: Log,
        }

        impl ReadableByteSource for Overflowing {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                let request = controller.byob_request().unwrap();
                let capacity = request.capacity();
                match request.respond(capacity + 1) {
                    Err(StreamError::Range(_)) => self.log.lock().push("range".into()),
                    other => self.log.lock().push(format!("unexpected {:?}", other)),
                }

                let mut request = controller.byob_request().unwrap();
                let view = request.view().unwrap();
                self.log.lock().push(format!("{:?}", view));
                view[0] = 42;
                request.respond(1)?;
                controller.close()
            }
        }

        let log: Log = SharedPtr::new(Mutex::new(Vec::new()));
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(Overflowing { log: log.clone() })
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_byob_reader().unwrap();
        let result = reader.read_into(vec![7; 3]).await.unwrap();
        assert_eq!(result.filled(), &[42]);
        assert_eq!(result.buffer, vec![42, 7, 7]);
        assert_eq!(*log.lock(), vec!["range".to_string(), "[7, 7, 7]".to_string()]);
    }

    struct Capture(SharedPtr<Mutex<Option<ReadableByteStreamController>>>);

    impl ReadableByteSource for Capture {
        async fn start(
            &mut self,
            controller: &mut ReadableByteStreamController,
        ) -> StreamResult<()> {
            *self.0.lock() = Some(controller.clone());
            Ok(())
        }

        async fn pull(
            &mut self,
            _controller: &mut ReadableByteStreamController,
        ) -> StreamResult<()> {
            Ok(())
        }
    }

    async fn captured_stream(
        high_water_mark: f64,
    ) -> (ReadableStream<Vec<u8>>, ReadableByteStreamController) {
        let slot = SharedPtr::new(Mutex::new(None));
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(Capture(slot.clone()))
            .high_water_mark(high_water_mark)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        let controller = slot.lock().clone().unwrap();
        (stream, controller)
    }

    #[tokio_localset_test::localset_test]
    async fn byob_reads_drain_the_queue_in_order() {
        let (stream, controller) = captured_stream(16.0).await;
        controller.enqueue((1..=10).collect()).unwrap();
        assert_eq!(controller.desired_size(), Some(6.0));

        let reader = stream.get_byob_reader().unwrap();
        let first = reader.read_into(vec![0; 4]).await.unwrap();
        assert_eq!(first.filled(), &[1, 2, 3, 4]);
        assert_eq!(controller.desired_size(), Some(10.0));

        let second = reader.read_into(vec![0; 10]).await.unwrap();
        assert_eq!(second.filled(), &[5, 6, 7, 8, 9, 10]);
        assert_eq!(controller.desired_size(), Some(16.0));
    }

    #[tokio_localset_test::localset_test]
    async fn read_waits_for_minimum_whole_elements() {
        let (stream, controller) = captured_stream(0.0).await;
        let reader = stream.get_byob_reader().unwrap();
        let pending = reader.read_into_with(
            vec![0; 8],
            ReadIntoOptions {
                element_size: 4,
                min: 2,
            },
        );

        controller.enqueue(vec![1, 2, 3]).unwrap();
        controller.enqueue(vec![4, 5, 6, 7, 8, 9]).unwrap();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(result.filled(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        // The byte that did not fit stays queued for the next read.
        let rest = reader.read_into(vec![0; 4]).await.unwrap();
        assert_eq!(rest.filled(), &[9]);
    }

    #[tokio_localset_test::localset_test]
    async fn close_delivers_short_read() {
        struct Partial {
            pulls: usize,
        }

        impl ReadableByteSource for Partial {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                self.pulls += 1;
                if self.pulls == 1 {
                    let mut request = controller.byob_request().unwrap();
                    request.view().unwrap()[..2].copy_from_slice(&[9, 9]);
                    request.respond(2)
                } else {
                    controller.close()
                }
            }
        }

        let stream = ReadableStream::<Vec<u8>>::builder_bytes(Partial { pulls: 0 })
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_byob_reader().unwrap();
        let result = reader
            .read_into_with(vec![0; 4], ReadIntoOptions { element_size: 1, min: 4 })
            .await
            .unwrap();
        assert!(result.done);
        assert_eq!(result.filled(), &[9, 9]);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio_localset_test::localset_test]
    async fn byob_reader_requires_byte_stream() {
        let stream = ReadableStream::from_vec(vec![vec![1u8]])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        assert!(matches!(stream.get_byob_reader(), Err(StreamError::Type(_))));
    }

    #[tokio_localset_test::localset_test]
    async fn byob_and_default_readers_share_the_lock() {
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(OneShotBytes)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_byob_reader().unwrap();
        assert!(matches!(stream.get_reader(), Err(StreamError::Locked)));
        reader.release_lock();
        assert!(matches!(
            reader.read_into(vec![0; 1]).await,
            Err(StreamError::Released)
        ));
        let _default = stream.get_reader().unwrap();
    }

    #[tokio_localset_test::localset_test]
    async fn rejects_empty_chunks_and_buffers() {
        let (stream, controller) = captured_stream(4.0).await;
        assert!(matches!(controller.enqueue(Vec::new()), Err(StreamError::Type(_))));

        let reader = stream.get_byob_reader().unwrap();
        assert!(matches!(reader.read_into(Vec::new()).await, Err(StreamError::Type(_))));
        assert!(matches!(
            reader
                .read_into_with(vec![0; 4], ReadIntoOptions { element_size: 2, min: 3 })
                .await,
            Err(StreamError::Range(_))
        ));
        assert_eq!(stream.state(), StreamState::Readable);
    }

    #[tokio_localset_test::localset_test]
    async fn auto_allocation_gives_default_reads_a_byob_request() {
        struct Lengths {
            seen: SharedPtr<Mutex<Vec<usize>>>,
        }

        impl ReadableByteSource for Lengths {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                let mut request = controller.byob_request().unwrap();
                let view = request.view().unwrap();
                self.seen.lock().push(view.len());
                view[..3].copy_from_slice(b"abc");
                request.respond(3)
            }
        }

        let seen = SharedPtr::new(Mutex::new(Vec::new()));
        let stream = ReadableStream::<Vec<u8>>::builder_bytes(Lengths { seen: seen.clone() })
            .auto_allocate_chunk_size(16)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(*seen.lock(), vec![16]);
    }

    #[tokio_localset_test::localset_test]
    async fn take_view_and_respond_with_new_view() {
        struct ViaView;

        impl ReadableByteSource for ViaView {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                let mut request = controller.byob_request().unwrap();
                let mut view = request.take_view().unwrap();
                view.as_mut_slice()[..2].copy_from_slice(&[5, 6]);
                view.truncate(2);
                request.respond_with_new_view(view)
            }
        }

        let stream = ReadableStream::<Vec<u8>>::builder_bytes(ViaView)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let reader = stream.get_byob_reader().unwrap();
        let result = reader.read_into(vec![0; 8]).await.unwrap();
        assert_eq!(result.into_filled(), vec![5, 6]);
    }

    #[tokio_localset_test::localset_test]
    async fn cancel_settles_pending_byob_read_as_done() {
        let (stream, _controller) = captured_stream(0.0).await;
        let reader = stream.get_byob_reader().unwrap();
        let pending = reader.read_into(vec![3; 5]);
        reader.cancel(Some("stop".into())).await.unwrap();

        let result = pending.await.unwrap();
        assert!(result.done);
        assert_eq!(result.bytes_read, 0);
        assert_eq!(result.buffer, vec![3; 5]);
    }

    #[tokio_localset_test::localset_test]
    async fn error_rejects_pending_byob_read() {
        let (stream, controller) = captured_stream(0.0).await;
        let reader = stream.get_byob_reader().unwrap();
        let pending = reader.read_into(vec![0; 5]);
        controller.error("device lost".into());
        assert_eq!(pending.await.unwrap_err().to_string(), "device lost");
        assert_eq!(reader.closed().await.unwrap_err().to_string(), "device lost");
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio_localset_test::localset_test]
    async fn overflowing_min_is_a_range_error() {
        let (stream, _controller) = captured_stream(0.0).await;
        let reader = stream.get_byob_reader().unwrap();
        let options = ReadIntoOptions {
            element_size: 2,
            min: usize::MAX / 2 + 1,
        };
        let err = reader.read_into_with(vec![0; 4], options).await.unwrap_err();
        assert!(matches!(err, StreamError::Range(_)));
        assert_eq!(stream.state(), StreamState::Readable);
    }

    #[tokio_localset_test::localset_test]
    async fn pull_that_closes_the_byte_stream_runs_to_completion() {
        struct CloseThenFinish {
            finished: SharedPtr<Mutex<bool>>,
        }

        impl ReadableByteSource for CloseThenFinish {
            async fn pull(
                &mut self,
                controller: &mut ReadableByteStreamController,
            ) -> StreamResult<()> {
                controller.enqueue(vec![1])?;
                controller.close()?;
                sleep(Duration::from_millis(5)).await;
                *self.finished.lock() = true;
                Ok(())
            }
        }

        let finished = SharedPtr::new(Mutex::new(false));
        let (stream, driver) = ReadableStream::<Vec<u8>>::builder_bytes(CloseThenFinish {
            finished: finished.clone(),
        })
        .prepare()
        .unwrap();
        let handle = tokio::task::spawn_local(driver);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(vec![1]));
        assert_eq!(reader.read().await.unwrap(), None);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(*finished.lock());
    }

    #[tokio_localset_test::localset_test]
    async fn byob_read_fails_once_the_stream_is_dropped() {
        let (stream, _controller) = captured_stream(0.0).await;
        let reader = stream.get_byob_reader().unwrap();
        let pending = reader.read_into(vec![0; 4]);
        drop(stream);

        let err = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::TaskDropped));
    }
}
