//! Small synchronisation pieces shared by every stream kind: waker sets, the
//! driver wake-up signal, liveness tokens and one-shot settlement futures.

use super::{error::StreamError, StreamResult};
use crate::platform::SharedPtr;
use futures::{
    channel::oneshot,
    future::{select, Either},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll, Waker},
};

/// A lightweight, thread-safe set storing multiple wakers.
/// It ensures wakers are stored without duplicates (based on `will_wake`).
#[derive(Clone, Default, Debug)]
pub(crate) struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub(crate) fn new() -> Self {
        Self(SharedPtr::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        let wakers: Vec<Waker> = self.0.lock().drain(..).collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Wake-up line between the public handles and a stream's driver future.
///
/// `live` counts stream handles and the operations started on them. Readers
/// and writers are not counted. When it reaches zero the driver stops, drops
/// the source or sink it owns and fails whatever is still pending.
#[derive(Debug, Default)]
pub(crate) struct DriverSignal {
    waker: AtomicWaker,
    live: AtomicUsize,
    abandoned: AtomicBool,
}

impl DriverSignal {
    pub(crate) fn new() -> SharedPtr<Self> {
        SharedPtr::new(Self::default())
    }

    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Keeps a stream's driver alive; cloning adds a holder, dropping the last one
/// marks the driver abandoned.
#[derive(Debug)]
pub(crate) struct LiveToken(SharedPtr<DriverSignal>);

impl LiveToken {
    pub(crate) fn new(signal: &SharedPtr<DriverSignal>) -> Self {
        signal.live.fetch_add(1, Ordering::SeqCst);
        Self(SharedPtr::clone(signal))
    }
}

impl Clone for LiveToken {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.abandoned.store(true, Ordering::SeqCst);
            self.0.wake();
        }
    }
}

/// Result of an operation that either finished synchronously or waits on a
/// completion sent later by the stream state or the driver.
#[pin_project(project = SettleProj)]
pub(crate) enum Settle<R> {
    Ready(Option<StreamResult<R>>),
    Waiting(#[pin] oneshot::Receiver<StreamResult<R>>),
}

impl<R> Settle<R> {
    pub(crate) fn ready(result: StreamResult<R>) -> Self {
        Settle::Ready(Some(result))
    }
}

impl<R> Future for Settle<R> {
    type Output = StreamResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            SettleProj::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(StreamError::TaskDropped)))
            }
            SettleProj::Waiting(rx) => rx
                .poll(cx)
                .map(|r| r.unwrap_or(Err(StreamError::TaskDropped))),
        }
    }
}

/// Completion future of a stream operation.
///
/// Operations started on a stream handle keep its driver alive until they
/// resolve. Operations started through a reader or writer do not: if every
/// stream handle is gone, they settle with [`StreamError::TaskDropped`].
#[pin_project]
pub struct PendingOp<R> {
    #[pin]
    settle: Settle<R>,
    _live: Option<LiveToken>,
}

impl<R> PendingOp<R> {
    pub(crate) fn new(settle: Settle<R>, live: LiveToken) -> Self {
        Self {
            settle,
            _live: Some(live),
        }
    }

    pub(crate) fn detached(settle: Settle<R>) -> Self {
        Self { settle, _live: None }
    }
}

impl<R> Future for PendingOp<R> {
    type Output = StreamResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().settle.poll(cx)
    }
}

/// Polls `primary` and `interrupt` together, reporting whichever finishes first.
pub(crate) async fn race<A, B>(primary: A, interrupt: B) -> Either<A::Output, B::Output>
where
    A: Future,
    B: Future,
{
    futures::pin_mut!(primary, interrupt);
    match select(primary, interrupt).await {
        Either::Left((value, _)) => Either::Left(value),
        Either::Right((value, _)) => Either::Right(value),
    }
}
