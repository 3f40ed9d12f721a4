use super::{
    byte_state::ByteStreamState,
    error::StreamError,
    queue::SizedQueue,
    signal::{race, DriverSignal, LiveToken, PendingOp, Settle, WakerSet},
    validate_high_water_mark, CountQueuingStrategy, QueuingStrategy, StreamResult,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{poll_fn, Either},
    stream::{Stream, StreamExt},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Traits -----------
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

// ----------- Pull state -----------

/// Where a readable controller is in its start/pull cycle.
///
/// `Requested` means the driver has been woken to call `pull`; `PullingAgain`
/// records that another pull became necessary while one was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullState {
    Starting,
    Idle,
    Requested,
    Pulling,
    PullingAgain,
}

impl PullState {
    /// Transition taken when the controller decides a pull is needed.
    /// Returns `true` if the driver has to be woken.
    pub(crate) fn request(&mut self) -> bool {
        match *self {
            PullState::Idle => {
                *self = PullState::Requested;
                true
            }
            PullState::Pulling => {
                *self = PullState::PullingAgain;
                false
            }
            PullState::Starting | PullState::Requested | PullState::PullingAgain => false,
        }
    }

    /// Transition taken when a pull settles; returns whether to pull again.
    pub(crate) fn finish(&mut self) -> bool {
        let again = *self == PullState::PullingAgain;
        *self = PullState::Idle;
        again
    }
}

pub(crate) enum DriverEvent {
    Pull,
    Cancel(CancelRequest),
    Finished,
}

pub(crate) struct CancelRequest {
    pub(crate) reason: Option<String>,
    pub(crate) completion: oneshot::Sender<StreamResult<()>>,
}

pub(crate) type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;

// ----------- Reader-facing core -----------

/// State every readable stream kind shares: terminal state, stored error,
/// lock slot, pending default read requests and a pending cancel.
pub(crate) struct ReaderCore<T> {
    pub(crate) state: StreamState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) cancel: Option<CancelRequest>,
    lock_owner: Option<u64>,
    next_lock_id: u64,
    read_requests: VecDeque<ReadRequest<T>>,
    closed_wakers: WakerSet,
}

impl<T> ReaderCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::Readable,
            stored_error: None,
            cancel: None,
            lock_owner: None,
            next_lock_id: 1,
            read_requests: VecDeque::new(),
            closed_wakers: WakerSet::new(),
        }
    }

    pub(crate) fn acquire_lock(&mut self) -> StreamResult<u64> {
        if self.lock_owner.is_some() {
            return Err(StreamError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id += 1;
        self.lock_owner = Some(id);
        Ok(id)
    }

    pub(crate) fn release_lock(&mut self, lock_id: u64) {
        if self.lock_owner == Some(lock_id) {
            self.lock_owner = None;
            self.closed_wakers.wake_all();
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub(crate) fn check_lock(&self, lock_id: u64) -> StreamResult<()> {
        if self.lock_owner == Some(lock_id) {
            Ok(())
        } else {
            Err(StreamError::Released)
        }
    }

    /// Error to hand back to calls made against a terminal stream.
    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("stream is errored"))
    }

    pub(crate) fn add_read_request(&mut self) -> oneshot::Receiver<StreamResult<Option<T>>> {
        let (tx, rx) = oneshot::channel();
        self.read_requests.push_back(tx);
        rx
    }

    /// Pending reads whose futures are still alive.
    pub(crate) fn num_read_requests(&mut self) -> usize {
        self.read_requests.retain(|tx| !tx.is_canceled());
        self.read_requests.len()
    }

    /// Hands `chunk` to the oldest live read request. Gives the chunk back when
    /// nobody is waiting.
    pub(crate) fn fulfill_read_request(&mut self, chunk: T) -> Option<T> {
        let mut chunk = chunk;
        while let Some(tx) = self.read_requests.pop_front() {
            match tx.send(Ok(Some(chunk))) {
                Ok(()) => return None,
                Err(Ok(Some(returned))) => chunk = returned,
                Err(_) => return None,
            }
        }
        Some(chunk)
    }

    pub(crate) fn close(&mut self) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Closed;
        for tx in self.read_requests.drain(..) {
            let _ = tx.send(Ok(None));
        }
        self.closed_wakers.wake_all();
    }

    pub(crate) fn error(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        self.state = StreamState::Errored;
        self.stored_error = Some(error.clone());
        for tx in self.read_requests.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
        self.closed_wakers.wake_all();
    }

    pub(crate) fn poll_closed(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if self.lock_owner != Some(lock_id) {
            return Poll::Ready(Err(StreamError::Released));
        }
        match self.state {
            StreamState::Closed => Poll::Ready(Ok(())),
            StreamState::Errored => Poll::Ready(Err(self.stored_error())),
            StreamState::Readable => {
                self.closed_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    /// Validates who is cancelling; `None` means the stream handle itself.
    pub(crate) fn check_cancel_caller(&self, lock_id: Option<u64>) -> StreamResult<()> {
        match lock_id {
            Some(id) => self.check_lock(id),
            None if self.is_locked() => Err(StreamError::Locked),
            None => Ok(()),
        }
    }

    /// Common part of cancel: close the stream and queue the request for the driver.
    pub(crate) fn begin_cancel(
        &mut self,
        reason: Option<String>,
        signal: &DriverSignal,
    ) -> Settle<()> {
        match self.state {
            StreamState::Closed => return Settle::ready(Ok(())),
            StreamState::Errored => return Settle::ready(Err(self.stored_error())),
            StreamState::Readable => {}
        }
        debug!(?reason, "canceling readable stream");
        self.close();
        let (tx, rx) = oneshot::channel();
        self.cancel = Some(CancelRequest {
            reason,
            completion: tx,
        });
        signal.wake();
        Settle::Waiting(rx)
    }
}

/// Operations a reader or stream handle performs without knowing which
/// controller kind backs the stream.
pub(crate) trait ReadableStreamOps<T>: MaybeSend + MaybeSync {
    fn signal(&self) -> &SharedPtr<DriverSignal>;
    fn acquire_lock(&self) -> StreamResult<u64>;
    fn release_lock(&self, lock_id: u64);
    fn is_locked(&self) -> bool;
    fn state(&self) -> StreamState;
    fn read(&self, lock_id: u64) -> Settle<Option<T>>;
    fn cancel(&self, lock_id: Option<u64>, reason: Option<String>) -> Settle<()>;
    fn poll_closed(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>>;
}

// ----------- Default controller state -----------

pub(crate) struct DefaultInner<T> {
    core: ReaderCore<T>,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    close_requested: bool,
    pull: PullState,
}

impl<T> DefaultInner<T> {
    fn desired_size(&self) -> Option<f64> {
        match self.core.state {
            StreamState::Readable => Some(self.high_water_mark - self.queue.total_size()),
            _ => None,
        }
    }

    fn should_call_pull(&mut self) -> bool {
        if self.core.state != StreamState::Readable || self.close_requested {
            return false;
        }
        if self.pull == PullState::Starting {
            return false;
        }
        if self.core.num_read_requests() > 0 {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    fn call_pull_if_needed(&mut self, signal: &DriverSignal) {
        if self.should_call_pull() && self.pull.request() {
            signal.wake();
        }
    }

    fn enqueue(&mut self, chunk: T, signal: &DriverSignal) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::type_error("cannot enqueue after close was requested"));
        }
        if self.core.state != StreamState::Readable {
            return Err(StreamError::type_error(
                "cannot enqueue into a stream that is not readable",
            ));
        }

        if let Some(chunk) = self.core.fulfill_read_request(chunk) {
            let size = self.strategy.size(&chunk);
            if let Err((_, e)) = self.queue.enqueue(chunk, size) {
                self.error(e.clone());
                return Err(e);
            }
        }
        self.call_pull_if_needed(signal);
        Ok(())
    }

    fn close(&mut self) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::type_error("close was already requested"));
        }
        if self.core.state != StreamState::Readable {
            return Err(StreamError::type_error("cannot close a stream that is not readable"));
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            debug!("readable stream closed");
            self.core.close();
        }
        Ok(())
    }

    fn error(&mut self, error: StreamError) {
        if self.core.state != StreamState::Readable {
            return;
        }
        debug!(%error, "readable stream errored");
        self.queue.reset();
        self.core.error(error);
    }

    fn read(&mut self, signal: &DriverSignal) -> Settle<Option<T>> {
        match self.core.state {
            StreamState::Closed => return Settle::ready(Ok(None)),
            StreamState::Errored => return Settle::ready(Err(self.core.stored_error())),
            StreamState::Readable => {}
        }

        if let Some(chunk) = self.queue.dequeue() {
            if self.close_requested && self.queue.is_empty() {
                debug!("readable stream drained and closed");
                self.core.close();
            } else {
                self.call_pull_if_needed(signal);
            }
            return Settle::ready(Ok(Some(chunk)));
        }

        let rx = self.core.add_read_request();
        self.call_pull_if_needed(signal);
        Settle::Waiting(rx)
    }
}

pub(crate) struct DefaultShared<T> {
    inner: Mutex<DefaultInner<T>>,
    signal: SharedPtr<DriverSignal>,
}

impl<T> DefaultShared<T> {
    fn new(strategy: BoxedStrategy<T>, high_water_mark: f64) -> Self {
        Self {
            inner: Mutex::new(DefaultInner {
                core: ReaderCore::new(),
                queue: SizedQueue::new(),
                strategy,
                high_water_mark,
                close_requested: false,
                pull: PullState::Starting,
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
                debug!(error = %e, "readable source failed to start");
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

    /// Ready once an in-flight start or pull no longer matters.
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

    /// Every stream handle is gone, so nothing will feed the queue again.
    fn abandon(&self) {
        let mut inner = self.inner.lock();
        if !inner.close_requested {
            inner.error(StreamError::TaskDropped);
        }
    }
}

impl<T: MaybeSend> ReadableStreamOps<T> for DefaultShared<T> {
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

    fn read(&self, lock_id: u64) -> Settle<Option<T>> {
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
        let settle = inner.core.begin_cancel(reason, &self.signal);
        inner.queue.reset();
        settle
    }

    fn poll_closed(&self, lock_id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.inner.lock().core.poll_closed(lock_id, cx)
    }
}

// ----------- Default Controller -----------

/// Handle given to a [`ReadableSource`] to push chunks into its stream.
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    shared: SharedPtr<DefaultShared<T>>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: SharedPtr::clone(&self.shared),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    /// `high_water_mark - queued size`, or `None` once the stream is closed or errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.inner.lock().desired_size()
    }

    /// Queue a chunk, or hand it straight to a waiting read.
    ///
    /// Fails after `close()` or once the stream is closed or errored. A chunk
    /// the strategy sizes as negative, NaN or infinite errors the whole stream.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.shared.inner.lock().enqueue(chunk, &self.shared.signal)
    }

    /// Close once everything already queued has been read.
    pub fn close(&self) -> StreamResult<()> {
        self.shared.inner.lock().close()
    }

    /// Error the stream. Only the first error is kept; later calls do nothing.
    pub fn error(&self, error: StreamError) {
        self.shared.inner.lock().error(error);
    }
}

// ----------- Stream -----------

pub struct ReadableStream<T: MaybeSend + 'static> {
    pub(crate) ops: SharedPtr<dyn ReadableStreamOps<T>>,
    pub(crate) byte_state: Option<SharedPtr<ByteStreamState>>,
    live: LiveToken,
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    pub(crate) fn from_ops(
        ops: SharedPtr<dyn ReadableStreamOps<T>>,
        byte_state: Option<SharedPtr<ByteStreamState>>,
    ) -> Self {
        let live = LiveToken::new(ops.signal());
        Self {
            ops,
            byte_state,
            live,
        }
    }

    pub(crate) fn live_token(&self) -> LiveToken {
        self.live.clone()
    }

    /// Returns a builder for this readable stream
    pub fn builder<Source: ReadableSource<T>>(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    pub fn locked(&self) -> bool {
        self.ops.is_locked()
    }

    pub fn state(&self) -> StreamState {
        self.ops.state()
    }

    pub fn is_byte_stream(&self) -> bool {
        self.byte_state.is_some()
    }

    /// Lock the stream to a new default reader.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        let lock_id = self.ops.acquire_lock()?;
        Ok(ReadableStreamDefaultReader {
            ops: SharedPtr::clone(&self.ops),
            lock_id,
        })
    }

    /// Cancel an unlocked stream; fails with [`StreamError::Locked`] while a reader holds it.
    pub fn cancel(&self, reason: Option<String>) -> PendingOp<()> {
        PendingOp::new(self.ops.cancel(None, reason), self.live.clone())
    }
}

// Shortcut methods on ReadableStream for common cases
impl<T: MaybeSend + 'static> ReadableStream<T> {
    /// Create from Vec - shortcut for ReadableStreamBuilder::from_vec()
    pub fn from_vec(
        vec: Vec<T>,
    ) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::from_vec(vec)
    }

    /// Create from Iterator - shortcut for ReadableStreamBuilder::from_iterator()
    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + MaybeSend + 'static,
    {
        ReadableStreamBuilder::from_iterator(iter)
    }

    /// Create from Stream - shortcut for ReadableStreamBuilder::from_stream()
    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        ReadableStreamBuilder::from_stream(stream)
    }
}

// ----------- Built-in sources -----------

pub struct IteratorSource<I> {
    iter: I,
}

impl<I, T: MaybeSend + 'static> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.iter.next() {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<S, T: MaybeSend + 'static> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.stream.next().await {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

// ----------- Default Reader -----------

/// Exclusive reader over a [`ReadableStream`].
///
/// Reads are registered with the stream as soon as [`read`](Self::read) is
/// called, so a read issued before [`release_lock`](Self::release_lock) still
/// settles afterwards. Calls made after the release fail with
/// [`StreamError::Released`].
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static> {
    ops: SharedPtr<dyn ReadableStreamOps<T>>,
    lock_id: u64,
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultReader<T> {
    /// Next chunk, `None` at end of stream.
    pub fn read(&self) -> PendingOp<Option<T>> {
        PendingOp::detached(self.ops.read(self.lock_id))
    }

    pub fn cancel(&self, reason: Option<String>) -> PendingOp<()> {
        PendingOp::detached(self.ops.cancel(Some(self.lock_id), reason))
    }

    /// Resolves when the stream closes, fails with the stored error when it errors.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| self.ops.poll_closed(self.lock_id, cx)).await
    }

    pub fn release_lock(&self) {
        self.ops.release_lock(self.lock_id);
    }

    /// Consume the reader as a [`Stream`] of chunks. An error ends the stream
    /// after being yielded once.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T: MaybeSend + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.ops.release_lock(self.lock_id);
    }
}

// ----------- Stream Task Implementation -----------

fn interrupted<T>(shared: &DefaultShared<T>) -> impl Future<Output = ()> + '_ {
    poll_fn(move |cx| shared.poll_interrupt(cx))
}

async fn readable_stream_task<T, Source>(shared: SharedPtr<DefaultShared<T>>, mut source: Source)
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    let mut controller = ReadableStreamDefaultController {
        shared: SharedPtr::clone(&shared),
    };

    if let Either::Left(result) = race(source.start(&mut controller), interrupted(&shared)).await {
        shared.start_settled(result);
    }

    loop {
        match poll_fn(|cx| shared.poll_event(cx)).await {
            DriverEvent::Pull => {
                trace!("pulling from readable source");
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
    trace!("readable stream driver finished");
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + 'static, Source: ReadableSource<T>> ReadableStreamBuilder<T, Source> {
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> StreamResult<(ReadableStream<T>, impl Future<Output = ()>)> {
        let high_water_mark = validate_high_water_mark(self.strategy.high_water_mark())?;
        let shared = SharedPtr::new(DefaultShared::new(self.strategy, high_water_mark));
        let stream = ReadableStream::from_ops(shared.clone(), None);
        Ok((stream, readable_stream_task(shared, self.source)))
    }

    /// Like `prepare`, also handing back the controller for sources wired up by hand.
    pub(crate) fn prepare_with_controller(
        self,
    ) -> StreamResult<(
        ReadableStream<T>,
        ReadableStreamDefaultController<T>,
        impl Future<Output = ()>,
    )> {
        let high_water_mark = validate_high_water_mark(self.strategy.high_water_mark())?;
        let shared = SharedPtr::new(DefaultShared::new(self.strategy, high_water_mark));
        let stream = ReadableStream::from_ops(shared.clone(), None);
        let controller = ReadableStreamDefaultController {
            shared: SharedPtr::clone(&shared),
        };
        Ok((stream, controller, readable_stream_task(shared, self.source)))
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

// Convenience constructors as static methods on the builder
impl<T: MaybeSend + 'static> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
    /// Create a builder from a Vec
    pub fn from_vec(vec: Vec<T>) -> Self {
        Self::new(IteratorSource {
            iter: vec.into_iter(),
        })
    }
}

impl<T: MaybeSend + 'static, I> ReadableStreamBuilder<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// Create a builder from an Iterator
    pub fn from_iterator(iter: I) -> Self {
        Self::new(IteratorSource { iter })
    }
}

impl<T: MaybeSend + 'static, S> ReadableStreamBuilder<T, AsyncStreamSource<S>>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// Create a builder from a Stream
    pub fn from_stream(stream: S) -> Self {
        Self::new(AsyncStreamSource { stream })
    }
}
