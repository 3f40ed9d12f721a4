use super::{
    error::StreamError,
    queue::SizedQueue,
    signal::{race, DriverSignal, LiveToken, PendingOp, Settle, WakerSet},
    validate_high_water_mark, CountQueuingStrategy, QueuingStrategy, StreamResult,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{poll_fn, Either},
    task::AtomicWaker,
    AsyncWrite,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    io::{Error as IoError, ErrorKind},
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    Writable,
    /// An error or abort is pending while a sink operation finishes.
    Erroring,
    Errored,
    Closed,
}

pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        futures::future::ready(Ok(()))
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink once every queued write has finished.
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        futures::future::ready(Ok(()))
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        futures::future::ready(Ok(()))
    }
}

type WriteCompletion = oneshot::Sender<StreamResult<()>>;

enum WriteRecord<T> {
    Chunk(T, WriteCompletion),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Idle,
    Write,
    Close,
    Abort,
}

struct PendingAbort {
    reason: Option<String>,
    was_already_erroring: bool,
    completions: Vec<WriteCompletion>,
}

enum SinkEvent<T> {
    Write(T),
    Close,
    Abort(Option<String>),
    Finished,
}

// ----------- Abort signal -----------

/// Flag the sink's controller watches to learn about aborts.
#[derive(Default)]
struct AbortSignal {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    waker: AtomicWaker,
}

impl AbortSignal {
    fn trigger(&self, reason: Option<String>) {
        *self.reason.lock() = reason;
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake();
    }
}

// ----------- Shared state -----------

pub(crate) struct WritableInner<T> {
    state: WritableStreamState,
    stored_error: Option<StreamError>,
    queue: SizedQueue<WriteRecord<T>>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    started: bool,
    in_flight: InFlight,
    in_flight_size: f64,
    in_flight_write: Option<WriteCompletion>,
    close_requested: bool,
    close_completion: Option<WriteCompletion>,
    pending_abort: Option<PendingAbort>,
    abort_job: Option<PendingAbort>,
    lock_owner: Option<u64>,
    next_lock_id: u64,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    flush_wakers: WakerSet,
}

impl<T> WritableInner<T> {
    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("stream is errored"))
    }

    fn check_lock(&self, lock_id: u64) -> StreamResult<()> {
        if self.lock_owner == Some(lock_id) {
            Ok(())
        } else {
            Err(StreamError::Released)
        }
    }

    fn check_caller(&self, lock_id: Option<u64>) -> StreamResult<()> {
        match lock_id {
            Some(id) => self.check_lock(id),
            None if self.lock_owner.is_some() => Err(StreamError::Locked),
            None => Ok(()),
        }
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            WritableStreamState::Writable => {
                Some(self.high_water_mark - self.queue.total_size() - self.in_flight_size)
            }
            _ => None,
        }
    }

    fn wake_all(&self) {
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        self.flush_wakers.wake_all();
    }

    fn write(&mut self, chunk: T, signal: &DriverSignal) -> Settle<()> {
        match self.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                return Settle::ready(Err(self.stored_error()))
            }
            WritableStreamState::Closed => return Settle::ready(Err(StreamError::Closed)),
            WritableStreamState::Writable => {}
        }
        if self.close_requested {
            return Settle::ready(Err(StreamError::Closing));
        }

        let size = self.strategy.size(&chunk);
        let (tx, rx) = oneshot::channel();
        if let Err((_, e)) = self.queue.enqueue(WriteRecord::Chunk(chunk, tx), size) {
            self.start_erroring(e.clone(), signal);
            return Settle::ready(Err(e));
        }
        signal.wake();
        Settle::Waiting(rx)
    }

    fn close(&mut self, signal: &DriverSignal) -> Settle<()> {
        match self.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                return Settle::ready(Err(self.stored_error()))
            }
            WritableStreamState::Closed => return Settle::ready(Err(StreamError::Closed)),
            WritableStreamState::Writable => {}
        }
        if self.close_requested {
            return Settle::ready(Err(StreamError::Closing));
        }

        let (tx, rx) = oneshot::channel();
        self.close_requested = true;
        self.close_completion = Some(tx);
        if let Err((_, e)) = self.queue.enqueue(WriteRecord::Close, 0.0) {
            self.start_erroring(e, signal);
        }
        // A closing stream no longer applies backpressure.
        self.ready_wakers.wake_all();
        signal.wake();
        Settle::Waiting(rx)
    }

    fn abort(
        &mut self,
        reason: Option<String>,
        abort_signal: &AbortSignal,
        signal: &DriverSignal,
    ) -> Settle<()> {
        if matches!(
            self.state,
            WritableStreamState::Closed | WritableStreamState::Errored
        ) {
            return Settle::ready(Ok(()));
        }
        abort_signal.trigger(reason.clone());

        let (tx, rx) = oneshot::channel();
        if let Some(pending) = self.pending_abort.as_mut() {
            pending.completions.push(tx);
            return Settle::Waiting(rx);
        }

        debug!(?reason, "aborting writable stream");
        let was_already_erroring = self.state == WritableStreamState::Erroring;
        self.pending_abort = Some(PendingAbort {
            reason: reason.clone(),
            was_already_erroring,
            completions: vec![tx],
        });
        if !was_already_erroring {
            self.start_erroring(StreamError::Aborted(reason), signal);
        }
        Settle::Waiting(rx)
    }

    fn start_erroring(&mut self, error: StreamError, signal: &DriverSignal) {
        if self.state != WritableStreamState::Writable {
            return;
        }
        debug!(%error, "writable stream erroring");
        self.state = WritableStreamState::Erroring;
        self.stored_error = Some(error);
        self.ready_wakers.wake_all();
        if self.started && self.in_flight == InFlight::Idle {
            self.finish_erroring();
        }
        signal.wake();
    }

    /// Moves an erroring stream to errored once no sink operation is running.
    fn finish_erroring(&mut self) {
        self.state = WritableStreamState::Errored;
        let error = self.stored_error();
        while let Some(record) = self.queue.dequeue() {
            if let WriteRecord::Chunk(_, tx) = record {
                let _ = tx.send(Err(error.clone()));
            }
        }

        match self.pending_abort.take() {
            Some(abort) if !abort.was_already_erroring => {
                // The driver runs the sink's abort, then settles the rest.
                self.abort_job = Some(abort);
            }
            Some(abort) => {
                for tx in abort.completions {
                    let _ = tx.send(Err(error.clone()));
                }
                self.reject_close_and_closed();
            }
            None => self.reject_close_and_closed(),
        }
        self.wake_all();
    }

    fn reject_close_and_closed(&mut self) {
        if let Some(tx) = self.close_completion.take() {
            let _ = tx.send(Err(self.stored_error()));
        }
        debug!("writable stream errored");
        self.wake_all();
    }

    /// A rejected sink operation errors the stream.
    fn deal_with_rejection(&mut self, error: StreamError, signal: &DriverSignal) {
        if self.state == WritableStreamState::Writable {
            self.start_erroring(error, signal);
        } else if self.state == WritableStreamState::Erroring {
            self.finish_erroring();
        }
    }

    fn start_settled(&mut self, result: StreamResult<()>, signal: &DriverSignal) {
        self.started = true;
        match result {
            Ok(()) => {
                if self.state == WritableStreamState::Erroring {
                    self.finish_erroring();
                }
                self.ready_wakers.wake_all();
            }
            Err(e) => {
                debug!(error = %e, "writable sink failed to start");
                self.deal_with_rejection(e, signal);
            }
        }
    }

    fn write_settled(&mut self, result: StreamResult<()>, signal: &DriverSignal) {
        self.in_flight = InFlight::Idle;
        self.in_flight_size = 0.0;
        let completion = self.in_flight_write.take();
        match result {
            Ok(()) => {
                if let Some(tx) = completion {
                    let _ = tx.send(Ok(()));
                }
                if self.state == WritableStreamState::Erroring {
                    self.finish_erroring();
                }
                self.ready_wakers.wake_all();
                self.flush_wakers.wake_all();
            }
            Err(e) => {
                if let Some(tx) = completion {
                    let _ = tx.send(Err(e.clone()));
                }
                self.deal_with_rejection(e, signal);
            }
        }
    }

    fn close_settled(&mut self, result: StreamResult<()>, signal: &DriverSignal) {
        self.in_flight = InFlight::Idle;
        match result {
            Ok(()) => {
                // Close wins over an abort that arrived while it ran.
                if self.state == WritableStreamState::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        for tx in abort.completions {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
                self.state = WritableStreamState::Closed;
                if let Some(tx) = self.close_completion.take() {
                    let _ = tx.send(Ok(()));
                }
                debug!("writable stream closed");
                self.wake_all();
            }
            Err(e) => {
                if let Some(tx) = self.close_completion.take() {
                    let _ = tx.send(Err(e.clone()));
                }
                if let Some(abort) = self.pending_abort.take() {
                    for tx in abort.completions {
                        let _ = tx.send(Err(e.clone()));
                    }
                }
                self.deal_with_rejection(e, signal);
            }
        }
    }

    /// Every stream handle is gone; fails whatever is still waiting on the sink.
    fn abandon(&mut self) {
        if self.state == WritableStreamState::Closed {
            return;
        }
        if self.state == WritableStreamState::Writable {
            self.stored_error = Some(StreamError::TaskDropped);
        }
        self.state = WritableStreamState::Errored;
        self.in_flight = InFlight::Idle;
        self.in_flight_size = 0.0;
        let error = self.stored_error();
        if let Some(tx) = self.in_flight_write.take() {
            let _ = tx.send(Err(error.clone()));
        }
        while let Some(record) = self.queue.dequeue() {
            if let WriteRecord::Chunk(_, tx) = record {
                let _ = tx.send(Err(error.clone()));
            }
        }
        for abort in self.pending_abort.take().into_iter().chain(self.abort_job.take()) {
            for tx in abort.completions {
                let _ = tx.send(Err(error.clone()));
            }
        }
        self.reject_close_and_closed();
    }

    fn abort_settled(&mut self, result: StreamResult<()>) {
        self.in_flight = InFlight::Idle;
        if let Some(abort) = self.abort_job.take() {
            for tx in abort.completions {
                let _ = tx.send(result.clone());
            }
        }
        self.reject_close_and_closed();
    }

    fn next_event(&mut self) -> Option<SinkEvent<T>> {
        if self.in_flight != InFlight::Idle || !self.started {
            return None;
        }
        match self.state {
            WritableStreamState::Writable => match self.queue.peek()? {
                WriteRecord::Close => {
                    self.queue.dequeue();
                    self.in_flight = InFlight::Close;
                    Some(SinkEvent::Close)
                }
                WriteRecord::Chunk(..) => match self.queue.dequeue_entry()? {
                    (WriteRecord::Chunk(chunk, tx), size) => {
                        self.in_flight = InFlight::Write;
                        self.in_flight_size = size;
                        self.in_flight_write = Some(tx);
                        Some(SinkEvent::Write(chunk))
                    }
                    (WriteRecord::Close, _) => None,
                },
            },
            WritableStreamState::Erroring => {
                self.finish_erroring();
                self.next_event()
            }
            WritableStreamState::Errored => {
                let reason = self.abort_job.as_ref()?.reason.clone();
                self.in_flight = InFlight::Abort;
                Some(SinkEvent::Abort(reason))
            }
            WritableStreamState::Closed => Some(SinkEvent::Finished),
        }
    }

    fn poll_ready(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.check_lock(lock_id)?;
        match self.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                Poll::Ready(Err(self.stored_error()))
            }
            WritableStreamState::Closed => Poll::Ready(Ok(())),
            WritableStreamState::Writable => {
                if self.close_requested || self.desired_size().is_some_and(|size| size > 0.0) {
                    return Poll::Ready(Ok(()));
                }
                self.ready_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    fn poll_closed(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.check_lock(lock_id)?;
        match self.state {
            WritableStreamState::Closed => Poll::Ready(Ok(())),
            // An abort settles `closed` only after the sink's abort has run.
            WritableStreamState::Errored
                if self.abort_job.is_none() && self.in_flight != InFlight::Abort =>
            {
                Poll::Ready(Err(self.stored_error()))
            }
            _ => {
                self.closed_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    /// Ready once every write issued so far has been handed to the sink and settled.
    fn poll_flush(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.check_lock(lock_id)?;
        match self.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => {
                Poll::Ready(Err(self.stored_error()))
            }
            WritableStreamState::Closed => Poll::Ready(Ok(())),
            WritableStreamState::Writable => {
                let writes_pending = self.in_flight == InFlight::Write
                    || matches!(self.queue.peek(), Some(WriteRecord::Chunk(..)));
                if !writes_pending {
                    return Poll::Ready(Ok(()));
                }
                self.flush_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

pub(crate) struct WritableShared<T> {
    inner: Mutex<WritableInner<T>>,
    signal: SharedPtr<DriverSignal>,
    abort_signal: SharedPtr<AbortSignal>,
}

impl<T> WritableShared<T> {
    fn new(strategy: BoxedStrategy<T>, high_water_mark: f64) -> Self {
        Self {
            inner: Mutex::new(WritableInner {
                state: WritableStreamState::Writable,
                stored_error: None,
                queue: SizedQueue::new(),
                strategy,
                high_water_mark,
                started: false,
                in_flight: InFlight::Idle,
                in_flight_size: 0.0,
                in_flight_write: None,
                close_requested: false,
                close_completion: None,
                pending_abort: None,
                abort_job: None,
                lock_owner: None,
                next_lock_id: 1,
                ready_wakers: WakerSet::new(),
                closed_wakers: WakerSet::new(),
                flush_wakers: WakerSet::new(),
            }),
            signal: DriverSignal::new(),
            abort_signal: SharedPtr::new(AbortSignal::default()),
        }
    }

    fn acquire_lock(&self) -> StreamResult<u64> {
        let mut inner = self.inner.lock();
        if inner.lock_owner.is_some() {
            return Err(StreamError::Locked);
        }
        let id = inner.next_lock_id;
        inner.next_lock_id += 1;
        inner.lock_owner = Some(id);
        Ok(id)
    }

    fn release_lock(&self, lock_id: u64) {
        let mut inner = self.inner.lock();
        if inner.lock_owner == Some(lock_id) {
            inner.lock_owner = None;
            inner.wake_all();
        }
    }

    fn write(&self, lock_id: u64, chunk: T) -> Settle<()> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.check_lock(lock_id) {
            return Settle::ready(Err(e));
        }
        inner.write(chunk, &self.signal)
    }

    fn close(&self, lock_id: Option<u64>) -> Settle<()> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.check_caller(lock_id) {
            return Settle::ready(Err(e));
        }
        inner.close(&self.signal)
    }

    fn abort(&self, lock_id: Option<u64>, reason: Option<String>) -> Settle<()> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.check_caller(lock_id) {
            return Settle::ready(Err(e));
        }
        inner.abort(reason, &self.abort_signal, &self.signal)
    }

    fn poll_event(&self, cx: &mut Context<'_>) -> Poll<SinkEvent<T>> {
        let mut inner = self.inner.lock();
        if self.signal.is_abandoned() {
            return Poll::Ready(SinkEvent::Finished);
        }
        if let Some(event) = inner.next_event() {
            return Poll::Ready(event);
        }
        if inner.state == WritableStreamState::Errored && inner.abort_job.is_none() {
            return Poll::Ready(SinkEvent::Finished);
        }
        self.signal.register(cx.waker());
        if self.signal.is_abandoned() {
            return Poll::Ready(SinkEvent::Finished);
        }
        Poll::Pending
    }
}

/// Lets the non-generic controller reach the typed stream state.
pub(crate) trait WritableErrorTarget: MaybeSend + MaybeSync {
    fn error(&self, error: StreamError);
}

impl<T: MaybeSend> WritableErrorTarget for WritableShared<T> {
    fn error(&self, error: StreamError) {
        self.inner.lock().start_erroring(error, &self.signal);
    }
}

// ----------- Controller -----------

/// Handle given to a [`WritableSink`].
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    target: SharedPtr<dyn WritableErrorTarget>,
    abort: SharedPtr<AbortSignal>,
}

impl WritableStreamDefaultController {
    /// Signal an error on the stream. Ignored unless the stream is still writable.
    pub fn error(&self, error: StreamError) {
        self.target.error(error);
    }

    /// Returns `true` if the stream has been aborted.
    ///
    /// This is a synchronous check of the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.abort.requested.load(Ordering::SeqCst)
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// Sinks can race this against long running work so an abort does not
    /// have to wait for it; [`with_abort`](Self::with_abort) wraps that pattern.
    pub fn abort_future(&self) -> impl Future<Output = ()> {
        let abort = SharedPtr::clone(&self.abort);
        poll_fn(move |cx| {
            if abort.requested.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            abort.waker.register(cx.waker());
            if abort.requested.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)` carrying
    /// the abort reason. Otherwise, returns the result of the future wrapped in `Ok`.
    pub fn with_abort<F, R>(&self, fut: F) -> impl Future<Output = StreamResult<R>>
    where
        F: Future<Output = R>,
    {
        let abort = SharedPtr::clone(&self.abort);
        let aborted = self.abort_future();
        async move {
            match race(fut, aborted).await {
                Either::Left(value) => Ok(value),
                Either::Right(()) => Err(StreamError::Aborted(abort.reason.lock().clone())),
            }
        }
    }
}

// ----------- Stream -----------

pub struct WritableStream<T: MaybeSend + 'static> {
    shared: SharedPtr<WritableShared<T>>,
    live: LiveToken,
}

impl<T: MaybeSend + 'static> WritableStream<T> {
    /// Returns a builder for this writable stream
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    pub fn locked(&self) -> bool {
        self.shared.inner.lock().lock_owner.is_some()
    }

    pub fn state(&self) -> WritableStreamState {
        self.shared.inner.lock().state
    }

    /// Lock the stream to a new writer.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        let lock_id = self.shared.acquire_lock()?;
        Ok(WritableStreamDefaultWriter {
            shared: SharedPtr::clone(&self.shared),
            lock_id,
            close_op: None,
        })
    }

    pub(crate) fn live_token(&self) -> LiveToken {
        self.live.clone()
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController {
        WritableStreamDefaultController {
            target: self.shared.clone(),
            abort: SharedPtr::clone(&self.shared.abort_signal),
        }
    }

    /// Abort an unlocked stream.
    pub fn abort(&self, reason: Option<String>) -> PendingOp<()> {
        PendingOp::new(self.shared.abort(None, reason), self.live.clone())
    }

    /// Close an unlocked stream after its queued writes.
    pub fn close(&self) -> PendingOp<()> {
        PendingOp::new(self.shared.close(None), self.live.clone())
    }
}

// ----------- Writer -----------

/// Exclusive writer over a [`WritableStream`].
///
/// Writes are queued the moment [`write`](Self::write) is called and handed to
/// the sink one at a time, in order. `ready` stays pending while the queue is
/// at or above the high-water mark.
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    shared: SharedPtr<WritableShared<T>>,
    lock_id: u64,
    close_op: Option<PendingOp<()>>,
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    /// Queue `chunk`; the returned future settles once the sink has written it.
    ///
    /// Dropping the future does not withdraw the write. Await
    /// [`ready`](Self::ready) first to respect backpressure.
    pub fn write(&self, chunk: T) -> PendingOp<()> {
        PendingOp::detached(self.shared.write(self.lock_id, chunk))
    }

    /// Queue a chunk without tracking its completion.
    ///
    /// Fails straight away if the stream cannot take writes; later sink
    /// failures surface through `closed`, `ready` and the next calls.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        match self.shared.write(self.lock_id, chunk) {
            Settle::Ready(Some(Err(e))) => Err(e),
            _ => Ok(()),
        }
    }

    /// Waits for [`ready`](Self::ready), then queues the chunk like
    /// [`enqueue`](Self::enqueue).
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        self.ready().await?;
        self.enqueue(chunk)
    }

    /// Close once every queued write has been written.
    pub fn close(&self) -> PendingOp<()> {
        PendingOp::detached(self.shared.close(Some(self.lock_id)))
    }

    pub fn abort(&self, reason: Option<String>) -> PendingOp<()> {
        PendingOp::detached(self.shared.abort(Some(self.lock_id), reason))
    }

    /// `high_water_mark` minus queued and in-flight sizes; `None` unless writable.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.inner.lock().desired_size()
    }

    pub async fn ready(&self) -> StreamResult<()> {
        poll_fn(|cx| self.shared.inner.lock().poll_ready(self.lock_id, cx)).await
    }

    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| self.shared.inner.lock().poll_closed(self.lock_id, cx)).await
    }

    /// Wait until every write issued so far has settled.
    pub async fn flush(&self) -> StreamResult<()> {
        poll_fn(|cx| self.shared.inner.lock().poll_flush(self.lock_id, cx)).await
    }

    pub fn release_lock(&self) {
        self.shared.release_lock(self.lock_id);
    }

    fn poll_close_op(&mut self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if self.close_op.is_none() {
            if self.shared.inner.lock().state == WritableStreamState::Closed {
                return Poll::Ready(Ok(()));
            }
            self.close_op = Some(self.close());
        }
        match self.close_op.as_mut() {
            Some(op) => Pin::new(op).poll(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<T: MaybeSend + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.shared.release_lock(self.lock_id);
    }
}

impl<T: MaybeSend + 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.shared.inner.lock().poll_ready(self.lock_id, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.enqueue(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.shared.inner.lock().poll_flush(self.lock_id, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_close_op(cx)
    }
}

fn to_io_error(error: StreamError) -> IoError {
    IoError::new(ErrorKind::Other, error)
}

impl AsyncWrite for WritableStreamDefaultWriter<Vec<u8>> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, IoError>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.shared.inner.lock().poll_ready(self.lock_id, cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        Poll::Ready(self.enqueue(buf.to_vec()).map(|()| buf.len()).map_err(to_io_error))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        self.shared
            .inner
            .lock()
            .poll_flush(self.lock_id, cx)
            .map_err(to_io_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        self.get_mut().poll_close_op(cx).map_err(to_io_error)
    }
}

// ----------- Driver -----------

fn abandoned(signal: &DriverSignal) -> impl Future<Output = ()> + '_ {
    poll_fn(move |cx| {
        if signal.is_abandoned() {
            return Poll::Ready(());
        }
        signal.register(cx.waker());
        if signal.is_abandoned() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
}

async fn writable_stream_task<T, Sink>(shared: SharedPtr<WritableShared<T>>, sink: Sink)
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let mut controller = WritableStreamDefaultController {
        target: shared.clone(),
        abort: SharedPtr::clone(&shared.abort_signal),
    };
    let mut sink = Some(sink);

    if let Some(s) = sink.as_mut() {
        if let Either::Left(result) =
            race(s.start(&mut controller), abandoned(&shared.signal)).await
        {
            shared.inner.lock().start_settled(result, &shared.signal);
        }
    }

    loop {
        match poll_fn(|cx| shared.poll_event(cx)).await {
            SinkEvent::Write(chunk) => {
                trace!("writing chunk to sink");
                let Some(s) = sink.as_mut() else { break };
                match race(s.write(chunk, &mut controller), abandoned(&shared.signal)).await {
                    Either::Left(result) => {
                        shared.inner.lock().write_settled(result, &shared.signal)
                    }
                    Either::Right(()) => break,
                }
            }
            SinkEvent::Close => {
                trace!("closing sink");
                let result = match sink.take() {
                    Some(s) => match race(s.close(), abandoned(&shared.signal)).await {
                        Either::Left(result) => result,
                        Either::Right(()) => break,
                    },
                    None => Ok(()),
                };
                shared.inner.lock().close_settled(result, &shared.signal);
            }
            SinkEvent::Abort(reason) => {
                let result = match sink.as_mut() {
                    Some(s) => s.abort(reason).await,
                    None => Ok(()),
                };
                shared.inner.lock().abort_settled(result);
            }
            SinkEvent::Finished => break,
        }
    }
    if shared.signal.is_abandoned() {
        shared.inner.lock().abandon();
    }
    trace!("writable stream driver finished");
}

// ----------- Builder -----------

pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> StreamResult<(WritableStream<T>, impl Future<Output = ()>)> {
        let high_water_mark = validate_high_water_mark(self.strategy.high_water_mark())?;
        let shared = SharedPtr::new(WritableShared::new(self.strategy, high_water_mark));
        let live = LiveToken::new(&shared.signal);
        let stream = WritableStream {
            shared: SharedPtr::clone(&shared),
            live,
        };
        Ok((stream, writable_stream_task(shared, self.sink)))
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}
