use super::{
    error::StreamError,
    readable::{ReadableSource, ReadableStream, ReadableStreamDefaultController},
    signal::WakerSet,
    writable::{WritableSink, WritableStream, WritableStreamDefaultController},
    CountQueuingStrategy, QueuingStrategy, StreamResult,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::future::{self, poll_fn};
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    task::{Context, Poll},
};
use tracing::{debug, trace};

/// Transformer trait
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }
}

// ----------- Coupling between the two sides -----------

struct CouplingState {
    backpressure: bool,
    /// Set once writes can no longer reach the readable side.
    terminated: Option<StreamError>,
}

struct Coupling {
    state: Mutex<CouplingState>,
    wakers: WakerSet,
    writable: Mutex<Option<WritableStreamDefaultController>>,
}

impl Coupling {
    fn new() -> Self {
        Self {
            state: Mutex::new(CouplingState {
                backpressure: true,
                terminated: None,
            }),
            wakers: WakerSet::new(),
            writable: Mutex::new(None),
        }
    }

    fn set_backpressure(&self, backpressure: bool) {
        let mut state = self.state.lock();
        if state.backpressure != backpressure {
            trace!(backpressure, "transform backpressure changed");
            state.backpressure = backpressure;
        }
        drop(state);
        if !backpressure {
            self.wakers.wake_all();
        }
    }

    /// Unblocks a write waiting on backpressure; later writes fail with `error`.
    fn terminate(&self, error: StreamError) {
        let mut state = self.state.lock();
        if state.terminated.is_none() {
            state.terminated = Some(error);
        }
        drop(state);
        self.wakers.wake_all();
    }

    fn terminated(&self) -> Option<StreamError> {
        self.state.lock().terminated.clone()
    }

    fn error_writable(&self, error: StreamError) {
        if let Some(writable) = self.writable.lock().as_ref() {
            writable.error(error.clone());
        }
        self.terminate(error);
    }

    fn poll_writable(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let state = self.state.lock();
        if let Some(error) = &state.terminated {
            return Poll::Ready(Err(error.clone()));
        }
        if !state.backpressure {
            return Poll::Ready(Ok(()));
        }
        self.wakers.register(cx.waker());
        Poll::Pending
    }
}

// ----------- Controller -----------

/// Handle given to a [`Transformer`] to produce output on the readable side.
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    readable: ReadableStreamDefaultController<O>,
    coupling: SharedPtr<Coupling>,
}

impl<O: MaybeSend + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            coupling: SharedPtr::clone(&self.coupling),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    /// Enqueue to readable side
    ///
    /// If the readable side refuses the chunk the writable side is errored
    /// with the same error.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        if let Err(e) = self.readable.enqueue(chunk) {
            self.coupling.error_writable(e.clone());
            return Err(e);
        }
        let backpressure = self.readable.desired_size().map_or(true, |size| size <= 0.0);
        self.coupling.set_backpressure(backpressure);
        Ok(())
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        debug!(%error, "transform stream errored");
        self.readable.error(error.clone());
        self.coupling.error_writable(error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        debug!("transform stream terminated");
        let _ = self.readable.close();
        self.coupling
            .error_writable(StreamError::type_error("transform stream terminated"));
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }
}

// ----------- Readable side -----------

/// Readable source for the transform stream
pub struct TransformReadableSource<O> {
    coupling: SharedPtr<Coupling>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: MaybeSend + 'static> ReadableSource<O> for TransformReadableSource<O> {
    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> StreamResult<()> {
        self.coupling.set_backpressure(false);
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        debug!(?reason, "transform readable side canceled");
        self.coupling.error_writable(StreamError::Canceled);
        Ok(())
    }
}

impl<O> Drop for TransformReadableSource<O> {
    fn drop(&mut self) {
        self.coupling
            .terminate(StreamError::type_error("transform readable side is gone"));
    }
}

// ----------- Writable side -----------

/// Writable sink
pub struct TransformWritableSink<I, O: MaybeSend + 'static, T> {
    transformer: T,
    controller: TransformStreamDefaultController<O>,
    _marker: PhantomData<fn(I)>,
}

/// Waits until the readable side wants more output. The future owns what it
/// polls, so the sink's `write` future stays `Send` whenever the chunk is.
fn wait_for_pull(
    coupling: &SharedPtr<Coupling>,
    writable: &WritableStreamDefaultController,
) -> impl Future<Output = StreamResult<()>> + MaybeSend {
    let coupling = SharedPtr::clone(coupling);
    let wait = writable.with_abort(poll_fn(move |cx| coupling.poll_writable(cx)));
    async move { wait.await? }
}

impl<I, O, T> WritableSink<I> for TransformWritableSink<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    async fn start(
        &mut self,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let result = self.transformer.start(&mut self.controller).await;
        if let Err(e) = &result {
            self.controller.readable.error(e.clone());
        }
        result
    }

    async fn write(
        &mut self,
        chunk: I,
        controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let pulled = wait_for_pull(&self.controller.coupling, controller);
        pulled.await?;
        trace!("running transform");
        let result = self.transformer.transform(chunk, &mut self.controller).await;
        if let Err(e) = &result {
            self.controller.readable.error(e.clone());
            self.controller.coupling.terminate(e.clone());
        }
        result
    }

    async fn close(self) -> StreamResult<()> {
        let mut this = self;
        if let Err(e) = this.transformer.flush(&mut this.controller).await {
            this.controller.readable.error(e.clone());
            this.controller.coupling.terminate(e.clone());
            return Err(e);
        }
        if let Some(e) = this.controller.coupling.terminated() {
            return Err(e);
        }
        let _ = this.controller.readable.close();
        debug!("transform stream flushed and closed");
        Ok(())
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        let error = StreamError::Aborted(reason);
        self.controller.readable.error(error.clone());
        self.controller.coupling.terminate(error);
        Ok(())
    }
}

// ----------- Stream -----------

/// TransformStream connecting readable and writable sides
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    pub fn builder<T: Transformer<I, O>>(transformer: T) -> TransformStreamBuilder<I, O, T> {
        TransformStreamBuilder::new(transformer)
    }

    /// Build with the default strategies, returning the stream and its driver.
    pub fn new<T: Transformer<I, O>>(
        transformer: T,
    ) -> StreamResult<(Self, impl Future<Output = ()>)> {
        TransformStreamBuilder::new(transformer).prepare()
    }

    /// Get the readable side
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Get the writable side
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// Split into both sides
    pub fn split(self) -> (ReadableStream<O>, WritableStream<I>) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// Builder for a transform that passes chunks through unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::default()
    }
}

/// An identity transformer that passes chunks through unchanged.
pub struct IdentityTransformer<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk))
    }
}

// ----------- Builder -----------

/// Builds a [`TransformStream`]. The writable side defaults to a high-water
/// mark of 1 and the readable side to 0, so a transform only runs once the
/// readable side is read.
pub struct TransformStreamBuilder<I: MaybeSend + 'static, O: MaybeSend + 'static, T> {
    transformer: T,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
}

impl<T: MaybeSend + 'static> Default for TransformStreamBuilder<T, T, IdentityTransformer<T>> {
    fn default() -> Self {
        Self::new(IdentityTransformer::new())
    }
}

impl<I, O, T> TransformStreamBuilder<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    fn new(transformer: T) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(1.0)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0.0)),
        }
    }

    pub fn writable_strategy<S: QueuingStrategy<I> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.writable_strategy = Box::new(s);
        self
    }

    pub fn readable_strategy<S: QueuingStrategy<O> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.readable_strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning
    ///
    /// The driver runs both sides and finishes once both have.
    pub fn prepare(self) -> StreamResult<(TransformStream<I, O>, impl Future<Output = ()>)> {
        let coupling = SharedPtr::new(Coupling::new());

        let source = TransformReadableSource {
            coupling: SharedPtr::clone(&coupling),
            _marker: PhantomData,
        };
        let (readable, readable_controller, readable_driver) = ReadableStream::builder(source)
            .strategy(StrategyBox(self.readable_strategy))
            .prepare_with_controller()?;

        let sink = TransformWritableSink {
            transformer: self.transformer,
            controller: TransformStreamDefaultController {
                readable: readable_controller,
                coupling: SharedPtr::clone(&coupling),
            },
            _marker: PhantomData,
        };
        let (writable, writable_driver) = WritableStream::builder(sink)
            .strategy(StrategyBox(self.writable_strategy))
            .prepare()?;
        *coupling.writable.lock() = Some(writable.controller());

        let driver = async move {
            future::join(readable_driver, writable_driver).await;
        };
        Ok((TransformStream { readable, writable }, driver))
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<TransformStream<I, O>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

/// Forwards to a boxed strategy so it can be handed to the side builders.
struct StrategyBox<C>(BoxedStrategy<C>);

impl<C> QueuingStrategy<C> for StrategyBox<C> {
    fn size(&self, chunk: &C) -> f64 {
        self.0.size(chunk)
    }

    fn high_water_mark(&self) -> f64 {
        self.0.high_water_mark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamState;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct LengthTransformer;

    impl Transformer<String, usize> for LengthTransformer {
        fn transform(
            &mut self,
            chunk: String,
            controller: &mut TransformStreamDefaultController<usize>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.enqueue(chunk.len()))
        }
    }

    // Test transformer that filters out even numbers and passes odd ones
    struct OddFilterTransformer;

    impl Transformer<i32, i32> for OddFilterTransformer {
        async fn transform(
            &mut self,
            chunk: i32,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            if chunk % 2 != 0 {
                controller.enqueue(chunk)?;
            }
            Ok(())
        }

        async fn flush(
            &mut self,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            controller.enqueue(-1)
        }
    }

    #[tokio_localset_test::localset_test]
    async fn maps_strings_to_their_lengths() {
        let transform = TransformStream::builder(LengthTransformer)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let (readable, writable) = transform.split();
        let writer = writable.get_writer().unwrap();
        let reader = readable.get_reader().unwrap();

        let writes = async {
            for word in ["a", "bb", "ccc"] {
                writer.write(word.to_string()).await.unwrap();
            }
            writer.close().await.unwrap();
        };
        let reads = async {
            let mut out = Vec::new();
            while let Some(len) = reader.read().await.unwrap() {
                out.push(len);
            }
            out
        };
        let ((), lengths) = timeout(Duration::from_secs(1), future::join(writes, reads))
            .await
            .unwrap();
        assert_eq!(lengths, vec![1, 2, 3]);
    }

    #[tokio_localset_test::localset_test]
    async fn transform_waits_for_readable_pull() {
        let transform = TransformStream::<u8, u8>::identity()
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let write = writer.write(7);
        sleep(Duration::from_millis(5)).await;
        // Nothing has read yet, so the write is still held back.
        assert_eq!(writer.desired_size(), Some(0.0));

        let reader = transform.readable().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(7));
        write.await.unwrap();
        assert_eq!(writer.desired_size(), Some(1.0));
    }

    #[tokio_localset_test::localset_test]
    async fn flush_output_precedes_close() {
        let transform = TransformStream::builder(OddFilterTransformer)
            .readable_strategy(CountQueuingStrategy::new(8.0))
            .writable_strategy(CountQueuingStrategy::new(8.0))
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        for n in 1..=5 {
            writer.enqueue(n).unwrap();
        }
        writer.close().await.unwrap();

        let reader = transform.readable().get_reader().unwrap();
        let mut out = Vec::new();
        while let Some(n) = reader.read().await.unwrap() {
            out.push(n);
        }
        assert_eq!(out, vec![1, 3, 5, -1]);
    }

    #[tokio_localset_test::localset_test]
    async fn transform_error_errors_both_sides() {
        struct FailOnThree;

        impl Transformer<i32, i32> for FailOnThree {
            async fn transform(
                &mut self,
                chunk: i32,
                controller: &mut TransformStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                if chunk == 3 {
                    return Err("three".into());
                }
                controller.enqueue(chunk)
            }
        }

        let transform = TransformStream::builder(FailOnThree)
            .readable_strategy(CountQueuingStrategy::new(4.0))
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();

        writer.write(1).await.unwrap();
        assert_eq!(writer.write(3).await.unwrap_err().to_string(), "three");
        assert_eq!(reader.read().await.unwrap_err().to_string(), "three");
        assert_eq!(writer.closed().await.unwrap_err().to_string(), "three");
    }

    #[tokio_localset_test::localset_test]
    async fn terminate_closes_readable_and_errors_writable() {
        struct TakeTwo(u8);

        impl Transformer<u8, u8> for TakeTwo {
            async fn transform(
                &mut self,
                chunk: u8,
                controller: &mut TransformStreamDefaultController<u8>,
            ) -> StreamResult<()> {
                controller.enqueue(chunk)?;
                self.0 += 1;
                if self.0 == 2 {
                    controller.terminate();
                }
                Ok(())
            }
        }

        let transform = TransformStream::builder(TakeTwo(0))
            .readable_strategy(CountQueuingStrategy::new(4.0))
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        writer.write(1).await.unwrap();
        writer.write(2).await.unwrap();
        assert!(matches!(writer.write(3).await, Err(StreamError::Type(_))));

        let reader = transform.readable().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio_localset_test::localset_test]
    async fn readable_cancel_unblocks_waiting_write() {
        let transform = TransformStream::<u8, u8>::identity()
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let write = writer.write(1);
        sleep(Duration::from_millis(5)).await;

        transform.readable().cancel(Some("done".into())).await.unwrap();
        let result = timeout(Duration::from_secs(1), write).await.unwrap();
        assert!(matches!(result, Err(StreamError::Canceled)));
        assert!(matches!(writer.closed().await, Err(StreamError::Canceled)));
    }

    #[tokio_localset_test::localset_test]
    async fn writable_abort_errors_readable_side() {
        let transform = TransformStream::<u8, u8>::identity()
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();
        let blocked = writer.write(1);
        sleep(Duration::from_millis(5)).await;

        timeout(Duration::from_secs(1), writer.abort(Some("stop".into())))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(blocked.await, Err(StreamError::Aborted(_))));
        assert!(
            matches!(reader.read().await, Err(StreamError::Aborted(Some(ref r))) if r == "stop")
        );
        assert_eq!(transform.readable().state(), StreamState::Errored);
    }

    #[tokio_localset_test::localset_test]
    async fn start_failure_errors_both_sides() {
        struct NoStart;

        impl Transformer<u8, u8> for NoStart {
            async fn start(
                &mut self,
                _controller: &mut TransformStreamDefaultController<u8>,
            ) -> StreamResult<()> {
                Err("not today".into())
            }

            async fn transform(
                &mut self,
                _chunk: u8,
                _controller: &mut TransformStreamDefaultController<u8>,
            ) -> StreamResult<()> {
                Ok(())
            }
        }

        let transform = TransformStream::builder(NoStart)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();
        assert_eq!(writer.closed().await.unwrap_err().to_string(), "not today");
        assert_eq!(reader.read().await.unwrap_err().to_string(), "not today");
    }

    #[test]
    fn invalid_strategy_fails_construction() {
        let result = TransformStream::<u8, u8>::identity()
            .readable_strategy(CountQueuingStrategy::new(-1.0))
            .prepare();
        assert!(matches!(result, Err(StreamError::Range(_))));
    }
}
