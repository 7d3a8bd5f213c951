//! Shared destroy/finish/close bookkeeping and the driver loop every stream
//! runs on.
//!
//! A driver owns the transport primitives of one stream (both directions for
//! a duplex) and is the only place where observable signals are emitted.
//! Handle operations mutate state and wake the driver, so nothing a caller
//! does can be observed before the call returns.

use super::error::{StreamError, StreamResult};
use super::observer::{ListenerId, Observers, WakerSet};
use super::signal::AbortSignal;
use crate::platform::{MaybeSend, PlatformBoxFutureStatic, SharedPtr};
use futures::future::{Either, poll_fn};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

/// Iterations a driver may spend in one poll before yielding to the executor.
const DRIVER_BUDGET: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Readable,
    Writable,
}

#[derive(Default)]
struct LifecycleState {
    destroyed: bool,
    errored: Option<StreamError>,
    error_emitted: bool,
    close_emitted: bool,
    auto_destroy: bool,
    has_readable: bool,
    has_writable: bool,
    readable_done: bool,
    writable_done: bool,
    signal: Option<(AbortSignal, ListenerId)>,
}

pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    driver: AtomicWaker,
    wakers: WakerSet,
    pub(crate) on_error: Observers<StreamError>,
    pub(crate) on_close: Observers<()>,
}

impl Lifecycle {
    pub(crate) fn new(has_readable: bool, has_writable: bool, auto_destroy: bool) -> Self {
        Self {
            state: Mutex::new(LifecycleState {
                auto_destroy,
                has_readable,
                has_writable,
                ..LifecycleState::default()
            }),
            driver: AtomicWaker::new(),
            wakers: WakerSet::new(),
            on_error: Observers::new(),
            on_close: Observers::new(),
        }
    }

    /// Mark the stream destroyed. Only the first call records its error;
    /// returns whether this call was the one that destroyed the stream.
    pub(crate) fn destroy(&self, error: Option<StreamError>) -> bool {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                if let Some(err) = &error {
                    warn!(error = %err, "ignoring error for an already destroyed stream");
                }
                return false;
            }
            state.destroyed = true;
            state.errored = error;
        }
        debug!("stream destroy requested");
        self.wake_driver();
        self.notify();
        true
    }

    /// Keep an error raised during teardown unless one is already recorded.
    fn record_error(&self, error: StreamError) {
        let mut state = self.state.lock();
        if state.errored.is_none() {
            state.errored = Some(error);
        } else {
            debug!(error = %error, "dropping teardown error, stream already errored");
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn errored(&self) -> Option<StreamError> {
        self.state.lock().errored.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().close_emitted
    }

    /// Error for operations already in flight when teardown started.
    pub(crate) fn error_or_destroyed(&self, op: &'static str) -> StreamError {
        self.errored().unwrap_or(StreamError::Destroyed(op))
    }

    /// Record that one direction completed gracefully, destroying the stream
    /// once every direction did and auto-destroy is on.
    pub(crate) fn side_done(&self, side: Side) {
        let destroy = {
            let mut state = self.state.lock();
            match side {
                Side::Readable => state.readable_done = true,
                Side::Writable => state.writable_done = true,
            }
            state.auto_destroy
                && !state.destroyed
                && (!state.has_readable || state.readable_done)
                && (!state.has_writable || state.writable_done)
        };
        if destroy {
            debug!("auto-destroying stream after graceful completion");
            self.destroy(None);
        }
    }

    pub(crate) fn wake_driver(&self) {
        self.driver.wake();
    }

    /// Register a task waiting for any state change.
    pub(crate) fn register(&self, waker: &Waker) {
        self.wakers.register(waker);
    }

    pub(crate) fn notify(&self) {
        self.wakers.wake_all();
    }

    fn emit_close(&self) {
        let (error, signal) = {
            let mut state = self.state.lock();
            let error = if state.error_emitted {
                None
            } else {
                state.error_emitted = true;
                state.errored.clone()
            };
            (error, state.signal.take())
        };
        if let Some((signal, id)) = signal {
            signal.off(id);
        }
        if let Some(err) = error {
            if self.on_error.is_empty() {
                warn!(error = %err, "stream destroyed with an error nobody observed");
            } else {
                debug!(error = %err, "emitting error");
            }
            self.on_error.emit(err);
        }

        self.state.lock().close_emitted = true;
        debug!("emitting close");
        self.on_close.emit(());
        self.on_error.clear();
        self.on_close.clear();
        self.notify();
    }
}

/// Destroy `lifecycle` with a cancellation error when `signal` fires.
pub(crate) fn watch_signal(lifecycle: &SharedPtr<Lifecycle>, signal: &AbortSignal) {
    if let Some(err) = signal.error() {
        lifecycle.destroy(Some(err));
        return;
    }
    let target = lifecycle.clone();
    let id = signal.on_abort(move |err| {
        target.destroy(Some(err));
    });
    lifecycle.state.lock().signal = Some((signal.clone(), id));
    if let Some(err) = signal.error() {
        lifecycle.destroy(Some(err));
    }
}

/// Run `fut` until it completes or the stream is destroyed.
pub(crate) async fn until_destroyed<F: Future>(
    lifecycle: SharedPtr<Lifecycle>,
    fut: F,
) -> Option<F::Output> {
    let destroyed = poll_fn(|cx| {
        lifecycle.register(cx.waker());
        if lifecycle.is_destroyed() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    });
    match futures::future::select(pin!(fut), pin!(destroyed)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// Resolves after `close` was emitted, with the recorded error if any.
pub(crate) fn closed(
    lifecycle: SharedPtr<Lifecycle>,
) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
    poll_fn(move |cx| {
        lifecycle.register(cx.waker());
        if !lifecycle.is_closed() {
            return Poll::Pending;
        }
        Poll::Ready(match lifecycle.errored() {
            Some(err) => Err(err),
            None => Ok(()),
        })
    })
}

/// One direction (or both) of a stream as seen by the driver.
pub(crate) trait Engine: MaybeSend + 'static {
    /// Advance primitives and deliver pending signals. Returns whether
    /// anything changed.
    fn poll_work(&mut self, cx: &mut Context<'_>) -> bool;

    /// A primitive that teardown has to wait for is still running.
    fn is_busy(&self) -> bool;

    /// Settle everything still waiting for an outcome, oldest first.
    fn fail_pending(&mut self, error: Option<&StreamError>);

    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> Option<PlatformBoxFutureStatic<StreamResult<()>>>;

    /// Drop buffers and observers once `close` went out.
    fn release(&mut self);
}

enum Phase {
    Running,
    Settling,
    Destroying(PlatformBoxFutureStatic<StreamResult<()>>),
    Closing,
}

/// Drive `engine` until the stream emitted `close`.
///
/// Teardown order: in-flight primitives settle, queued callbacks fail in
/// submission order, the destroy primitive runs, `error` is emitted (at most
/// once) and `close` goes out last.
pub(crate) async fn drive<E: Engine>(lifecycle: SharedPtr<Lifecycle>, mut engine: E) {
    let mut phase = Phase::Running;
    poll_fn(move |cx| {
        lifecycle.driver.register(cx.waker());
        let mut budget = DRIVER_BUDGET;
        loop {
            if budget == 0 {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            budget -= 1;

            let progressed = engine.poll_work(cx);
            if progressed {
                lifecycle.notify();
            }
            match &mut phase {
                Phase::Running => {
                    if lifecycle.is_destroyed() {
                        trace!("driver waiting for in-flight primitives");
                        phase = Phase::Settling;
                    } else if !progressed {
                        return Poll::Pending;
                    }
                }
                Phase::Settling => {
                    if engine.is_busy() {
                        if !progressed {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    let error = lifecycle.errored();
                    engine.fail_pending(error.as_ref());
                    lifecycle.notify();
                    phase = match engine.destroy(error) {
                        Some(fut) => Phase::Destroying(fut),
                        None => Phase::Closing,
                    };
                    // Let tasks waiting on the failed completions run first.
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Phase::Destroying(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        if let Err(err) = result {
                            warn!(error = %err, "destroy primitive failed");
                            lifecycle.record_error(err);
                        }
                        phase = Phase::Closing;
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Closing => {
                    lifecycle.emit_close();
                    engine.release();
                    return Poll::Ready(());
                }
            }
        }
    })
    .await
}
