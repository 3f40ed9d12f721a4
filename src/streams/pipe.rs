use super::{
    error::StreamError,
    readable::{ReadableStream, ReadableStreamDefaultReader},
    signal::{race, LiveToken},
    transform::TransformStream,
    writable::{WritableStream, WritableStreamDefaultWriter},
    StreamResult,
};
use crate::platform::{MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    future::{self, AbortRegistration, Abortable, Either},
    FutureExt,
};
use std::future::Future;
use tracing::{debug, trace};

#[derive(Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination open when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Aborting the matching handle stops the pipe, aborting the destination
    /// and canceling the source whatever the flags above say.
    pub signal: Option<AbortRegistration>,
}

/// Whatever ended the read/write loop; the first one observed wins.
#[derive(Debug)]
enum Shutdown {
    SourceClosed,
    SourceErrored(StreamError),
    DestErrored(StreamError),
    DestClosed,
}

fn destination_failure(error: StreamError) -> Shutdown {
    match error {
        StreamError::Closing | StreamError::Closed => Shutdown::DestClosed,
        other => Shutdown::DestErrored(other),
    }
}

async fn watch_source<T: MaybeSend + 'static>(reader: &ReadableStreamDefaultReader<T>) -> Shutdown {
    match reader.closed().await {
        Ok(()) => Shutdown::SourceClosed,
        Err(e) => Shutdown::SourceErrored(e),
    }
}

async fn watch_destination<T: MaybeSend + 'static>(
    writer: &WritableStreamDefaultWriter<T>,
) -> Shutdown {
    match writer.closed().await {
        Ok(()) => Shutdown::DestClosed,
        Err(e) => destination_failure(e),
    }
}

/// Moves chunks until either side closes or errors.
async fn pump<T: MaybeSend + 'static>(
    reader: &ReadableStreamDefaultReader<T>,
    writer: &WritableStreamDefaultWriter<T>,
) -> Shutdown {
    loop {
        let progress = async {
            writer.ready().await.map_err(destination_failure)?;
            match reader.read().await {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => Err(Shutdown::SourceClosed),
                Err(e) => Err(Shutdown::SourceErrored(e)),
            }
        };
        let watch = race(watch_source(reader), watch_destination(writer));
        futures::pin_mut!(progress, watch);

        let chunk = match future::select(progress, watch).await {
            Either::Left((Ok(chunk), _)) => chunk,
            Either::Left((Err(shutdown), _)) => return shutdown,
            Either::Right((Either::Left(shutdown) | Either::Right(shutdown), progress)) => {
                // A read that already took a chunk delivers it before the shutdown runs.
                if matches!(shutdown, Shutdown::SourceClosed | Shutdown::SourceErrored(_)) {
                    if let Some(Ok(chunk)) = progress.now_or_never() {
                        trace!("piping last chunk");
                        if let Err(e) = writer.enqueue(chunk) {
                            return destination_failure(e);
                        }
                    }
                }
                return shutdown;
            }
        };
        trace!("piping chunk");
        if let Err(e) = writer.enqueue(chunk) {
            return destination_failure(e);
        }
    }
}

/// `keep_alive` holds both streams open while the pipe runs, even if the
/// caller drops its handles.
async fn run_pipe<T: MaybeSend + 'static>(
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    options: StreamPipeOptions,
    keep_alive: (LiveToken, LiveToken),
) -> StreamResult<()> {
    let StreamPipeOptions {
        prevent_close,
        prevent_abort,
        prevent_cancel,
        signal,
    } = options;

    let outcome = match signal {
        Some(registration) => Abortable::new(pump(&reader, &writer), registration).await,
        None => Ok(pump(&reader, &writer).await),
    };

    let result = match outcome {
        Ok(Shutdown::SourceClosed) => {
            debug!(prevent_close, "pipe source closed");
            if prevent_close {
                Ok(())
            } else {
                writer.close().await
            }
        }
        Ok(Shutdown::SourceErrored(error)) => {
            debug!(%error, prevent_abort, "pipe source errored");
            if !prevent_abort {
                // Chunks already handed over are written before the abort.
                let _ = writer.flush().await;
                let _ = writer.abort(error.clone().into_reason()).await;
            }
            Err(error)
        }
        Ok(Shutdown::DestErrored(error)) => {
            debug!(%error, prevent_cancel, "pipe destination errored");
            if !prevent_cancel {
                let _ = reader.cancel(error.clone().into_reason()).await;
            }
            Err(error)
        }
        Ok(Shutdown::DestClosed) => {
            let error = StreamError::type_error("pipe destination closed");
            debug!(prevent_cancel, "pipe destination closed");
            if !prevent_cancel {
                let _ = reader.cancel(error.clone().into_reason()).await;
            }
            Err(error)
        }
        Err(future::Aborted) => {
            debug!("pipe aborted by signal");
            let error = StreamError::Aborted(Some("pipe aborted".into()));
            let reason = Some("pipe aborted".to_string());
            let _ = writer.flush().await;
            let _ = future::join(writer.abort(reason.clone()), reader.cancel(reason)).await;
            Err(error)
        }
    };

    reader.release_lock();
    writer.release_lock();
    drop(keep_alive);
    result
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    /// Pipe every chunk into `destination`.
    ///
    /// Both locks are taken before this returns, so the returned future fails
    /// with [`StreamError::Locked`] if either stream is already locked. The
    /// future settles once, with the error that stopped the pipe if any.
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T>,
        options: Option<StreamPipeOptions>,
    ) -> impl Future<Output = StreamResult<()>> {
        match self.start_pipe(destination, options.unwrap_or_default()) {
            Ok(pipe) => Either::Left(pipe),
            Err(e) => Either::Right(future::ready(Err(e))),
        }
    }

    fn start_pipe(
        &self,
        destination: &WritableStream<T>,
        options: StreamPipeOptions,
    ) -> StreamResult<impl Future<Output = StreamResult<()>>> {
        if self.locked() || destination.locked() {
            return Err(StreamError::Locked);
        }
        let reader = self.get_reader()?;
        let writer = destination.get_writer()?;
        let keep_alive = (self.live_token(), destination.live_token());
        Ok(run_pipe(reader, writer, options, keep_alive))
    }

    /// Pipe this stream through `transform`, handing back its readable side.
    pub fn pipe_through<O: MaybeSend + 'static>(
        &self,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> PipeBuilder<T, O> {
        PipeBuilder {
            source: ReadableStream::from_ops(SharedPtr::clone(&self.ops), self.byte_state.clone()),
            transform,
            options,
        }
    }
}

/// Pending `pipe_through`: the pipe into the transform's writable side still
/// has to be driven.
pub struct PipeBuilder<T: MaybeSend + 'static, O: MaybeSend + 'static> {
    source: ReadableStream<T>,
    transform: TransformStream<T, O>,
    options: Option<StreamPipeOptions>,
}

impl<T: MaybeSend + 'static, O: MaybeSend + 'static> PipeBuilder<T, O> {
    /// Prepare without spawning: returns the readable and the unspawned pipe future
    pub fn prepare(
        self,
    ) -> StreamResult<(ReadableStream<O>, impl Future<Output = StreamResult<()>>)> {
        let (readable, writable) = self.transform.split();
        let pipe = self
            .source
            .start_pipe(&writable, self.options.unwrap_or_default())?;
        Ok((readable, pipe))
    }

    /// Spawn the pipeline with an owned spawner closure
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<O>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (readable, pipe) = self.prepare()?;
        spawn_fn(Box::pin(async move {
            if let Err(error) = pipe.await {
                debug!(%error, "pipe_through finished with an error");
            }
        }));
        Ok(readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CountQueuingStrategy, ReadableSource, ReadableStreamDefaultController, StreamState,
        TransformStreamDefaultController, Transformer, WritableSink,
        WritableStreamDefaultController, WritableStreamState,
    };
    use futures::future::AbortHandle;
    use parking_lot::Mutex;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::{sleep, timeout};

    #[derive(Clone, Default)]
    struct TestSink {
        written: SharedPtr<Mutex<Vec<u32>>>,
        closed: SharedPtr<AtomicBool>,
        aborted: SharedPtr<Mutex<Option<Option<String>>>>,
        fail_on: Option<u32>,
    }

    impl WritableSink<u32> for TestSink {
        async fn write(
            &mut self,
            chunk: u32,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err("sink rejected chunk".into());
            }
            self.written.lock().push(chunk);
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            *self.aborted.lock() = Some(reason);
            Ok(())
        }
    }

    /// Emits `0..limit`, then errors if `fail` is set or closes otherwise.
    #[derive(Clone)]
    struct TestSource {
        next: u32,
        limit: u32,
        fail: bool,
        cancels: SharedPtr<AtomicUsize>,
    }

    impl TestSource {
        fn new(limit: u32, fail: bool) -> Self {
            Self {
                next: 0,
                limit,
                fail,
                cancels: SharedPtr::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ReadableSource<u32> for TestSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            if self.next < self.limit {
                controller.enqueue(self.next)?;
                self.next += 1;
                Ok(())
            } else if self.fail {
                Err("source broke".into())
            } else {
                controller.close()
            }
        }

        async fn cancel(&mut self, _reason: Option<String>) -> StreamResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn_sink(sink: TestSink) -> WritableStream<u32> {
        WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(4.0))
            .spawn(tokio::task::spawn_local)
            .unwrap()
    }

    #[tokio_localset_test::localset_test]
    async fn pipes_all_chunks_then_closes_destination() {
        let readable = ReadableStream::from_vec(vec![1u32, 2, 3])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        readable.pipe_to(&writable, None).await.unwrap();
        assert_eq!(*sink.written.lock(), vec![1, 2, 3]);
        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(!readable.locked());
        assert!(!writable.locked());
    }

    #[tokio_localset_test::localset_test]
    async fn prevent_close_leaves_destination_open() {
        let readable = ReadableStream::from_vec(vec![7u32, 8])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        let options = StreamPipeOptions {
            prevent_close: true,
            ..Default::default()
        };
        readable.pipe_to(&writable, Some(options)).await.unwrap();
        assert!(!sink.closed.load(Ordering::SeqCst));
        assert_eq!(writable.state(), WritableStreamState::Writable);

        let writer = writable.get_writer().unwrap();
        writer.write(9).await.unwrap();
        assert_eq!(*sink.written.lock(), vec![7, 8, 9]);
    }

    #[tokio_localset_test::localset_test]
    async fn source_error_with_prevent_abort_keeps_destination_open() {
        let readable = ReadableStream::builder(TestSource::new(2, true))
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        let options = StreamPipeOptions {
            prevent_abort: true,
            ..Default::default()
        };
        let result = readable.pipe_to(&writable, Some(options)).await;
        assert_eq!(result.unwrap_err().to_string(), "source broke");
        assert!(sink.aborted.lock().is_none());
        assert_eq!(writable.state(), WritableStreamState::Writable);
        assert!(!writable.locked());
    }

    #[tokio_localset_test::localset_test]
    async fn source_error_aborts_destination() {
        let readable = ReadableStream::builder(TestSource::new(2, true))
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        let result = readable.pipe_to(&writable, None).await;
        assert_eq!(result.unwrap_err().to_string(), "source broke");
        assert_eq!(*sink.aborted.lock(), Some(Some("source broke".to_string())));
        assert_eq!(writable.state(), WritableStreamState::Errored);
    }

    #[tokio_localset_test::localset_test]
    async fn destination_error_cancels_source() {
        let source = TestSource::new(10, false);
        let cancels = source.cancels.clone();
        let readable = ReadableStream::builder(source)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink {
            fail_on: Some(3),
            ..Default::default()
        };
        let writable = spawn_sink(sink.clone());

        let result = readable.pipe_to(&writable, None).await;
        assert_eq!(result.unwrap_err().to_string(), "sink rejected chunk");
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(readable.state(), StreamState::Closed);
        assert_eq!(*sink.written.lock(), vec![0, 1, 2]);
    }

    #[tokio_localset_test::localset_test]
    async fn destination_error_with_prevent_cancel_leaves_source() {
        let source = TestSource::new(10, false);
        let cancels = source.cancels.clone();
        let readable = ReadableStream::builder(source)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writable = spawn_sink(TestSink {
            fail_on: Some(0),
            ..Default::default()
        });

        let options = StreamPipeOptions {
            prevent_cancel: true,
            ..Default::default()
        };
        assert!(readable.pipe_to(&writable, Some(options)).await.is_err());
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
        assert_eq!(readable.state(), StreamState::Readable);
        assert!(!readable.locked());
    }

    #[tokio_localset_test::localset_test]
    async fn closed_destination_cancels_source() {
        let source = TestSource::new(10, false);
        let cancels = source.cancels.clone();
        let readable = ReadableStream::builder(source)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writable = spawn_sink(TestSink::default());
        writable.close().await.unwrap();

        let result = readable.pipe_to(&writable, None).await;
        assert!(matches!(result, Err(StreamError::Type(_))));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio_localset_test::localset_test]
    async fn signal_abort_overrides_prevent_flags() {
        struct Stalled {
            canceled: SharedPtr<AtomicBool>,
        }

        impl ReadableSource<u32> for Stalled {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<u32>,
            ) -> StreamResult<()> {
                futures::future::pending::<()>().await;
                Ok(())
            }

            async fn cancel(&mut self, _reason: Option<String>) -> StreamResult<()> {
                self.canceled.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let canceled = SharedPtr::new(AtomicBool::new(false));
        let readable = ReadableStream::builder(Stalled {
            canceled: canceled.clone(),
        })
        .spawn(tokio::task::spawn_local)
        .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        let (handle, registration) = AbortHandle::new_pair();
        let options = StreamPipeOptions {
            prevent_abort: true,
            prevent_cancel: true,
            signal: Some(registration),
            ..Default::default()
        };
        let pipe = readable.pipe_to(&writable, Some(options));
        let abort_later = async {
            sleep(Duration::from_millis(5)).await;
            handle.abort();
        };
        let (result, ()) = timeout(Duration::from_secs(1), future::join(pipe, abort_later))
            .await
            .unwrap();

        assert!(matches!(result, Err(StreamError::Aborted(_))));
        assert!(canceled.load(Ordering::SeqCst));
        assert!(sink.aborted.lock().is_some());
    }

    #[tokio_localset_test::localset_test]
    async fn pipe_to_rejects_locked_streams() {
        let readable = ReadableStream::from_vec(vec![1u32])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let writable = spawn_sink(TestSink::default());

        let reader = readable.get_reader().unwrap();
        assert!(matches!(readable.pipe_to(&writable, None).await, Err(StreamError::Locked)));
        drop(reader);

        let _writer = writable.get_writer().unwrap();
        assert!(matches!(readable.pipe_to(&writable, None).await, Err(StreamError::Locked)));
        // A failed pipe does not leave the source locked.
        assert!(!readable.locked());
    }

    #[tokio_localset_test::localset_test]
    async fn pipe_through_transform() {
        struct Double;

        impl Transformer<u32, u32> for Double {
            async fn transform(
                &mut self,
                chunk: u32,
                controller: &mut TransformStreamDefaultController<u32>,
            ) -> StreamResult<()> {
                controller.enqueue(chunk * 2)
            }
        }

        let readable = ReadableStream::from_vec(vec![1u32, 2, 3])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let transform = TransformStream::builder(Double)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let doubled = readable
            .pipe_through(transform, None)
            .spawn(tokio::task::spawn_local)
            .unwrap();
        assert!(readable.locked());

        let reader = doubled.get_reader().unwrap();
        let mut out = Vec::new();
        while let Some(n) = timeout(Duration::from_secs(1), reader.read()).await.unwrap().unwrap() {
            out.push(n);
        }
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[tokio_localset_test::localset_test]
    async fn last_chunk_enqueued_with_close_is_written() {
        /// Hands out `0..limit`, closing in the same pull as the last chunk.
        struct CloseWithLast {
            next: u32,
            limit: u32,
        }

        impl ReadableSource<u32> for CloseWithLast {
            async fn pull(
                &mut self,
                controller: &mut ReadableStreamDefaultController<u32>,
            ) -> StreamResult<()> {
                controller.enqueue(self.next)?;
                self.next += 1;
                if self.next == self.limit {
                    controller.close()?;
                }
                Ok(())
            }
        }

        for limit in 1..=20 {
            let readable = ReadableStream::builder(CloseWithLast { next: 0, limit })
                .strategy(CountQueuingStrategy::new(0.0))
                .spawn(tokio::task::spawn_local)
                .unwrap();
            let sink = TestSink::default();
            let writable = spawn_sink(sink.clone());

            timeout(Duration::from_secs(1), readable.pipe_to(&writable, None))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(*sink.written.lock(), (0..limit).collect::<Vec<_>>());
            assert!(sink.closed.load(Ordering::SeqCst));
        }
    }

    #[tokio_localset_test::localset_test]
    async fn pipe_outlives_dropped_stream_handles() {
        let readable = ReadableStream::from_vec(vec![1u32, 2, 3])
            .spawn(tokio::task::spawn_local)
            .unwrap();
        let sink = TestSink::default();
        let writable = spawn_sink(sink.clone());

        let pipe = readable.pipe_to(&writable, None);
        drop(readable);
        drop(writable);

        timeout(Duration::from_secs(1), pipe).await.unwrap().unwrap();
        assert_eq!(*sink.written.lock(), vec![1, 2, 3]);
        assert!(sink.closed.load(Ordering::SeqCst));
    }
}
