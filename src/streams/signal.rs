use super::error::{StreamError, StreamResult};
use super::observer::{ListenerId, Observers, WakerSet};
use crate::platform::{MaybeSend, SharedPtr};
use parking_lot::Mutex;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<String>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    observers: Observers<StreamError>,
    wakers: WakerSet,
}

/// Read side of an [`AbortController`]. Cheap to clone.
///
/// Streams built with a signal destroy themselves with
/// [`StreamError::Aborted`] when it fires; pipes given a signal tear down
/// both ends.
#[derive(Clone)]
pub struct AbortSignal {
    inner: SharedPtr<SignalInner>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: SharedPtr::new(SignalInner {
                state: Mutex::new(SignalState::default()),
                observers: Observers::new(),
                wakers: WakerSet::new(),
            }),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    /// The cancellation error this signal stands for, once it fired.
    pub fn error(&self) -> Option<StreamError> {
        let state = self.inner.state.lock();
        state
            .aborted
            .then(|| StreamError::Aborted(state.reason.clone()))
    }

    /// Run `f` once when the signal fires. Registering on an already aborted
    /// signal does nothing; check [`AbortSignal::is_aborted`] first.
    pub fn on_abort<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(StreamError) + MaybeSend + 'static,
    {
        self.inner.observers.add_once(Box::new(f))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.observers.remove(id)
    }

    /// Resolves once the signal fires.
    pub fn cancelled(&self) -> impl Future<Output = StreamError> + MaybeSend + 'static {
        let signal = self.clone();
        futures::future::poll_fn(move |cx| {
            signal.inner.wakers.register(cx.waker());
            match signal.error() {
                Some(err) => Poll::Ready(err),
                None => Poll::Pending,
            }
        })
    }

    /// Race `fut` against this signal.
    pub fn wrap<F: Future>(&self, fut: F) -> Cancellable<F> {
        Cancellable {
            fut,
            signal: self.clone(),
        }
    }

    fn abort(&self, reason: Option<String>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.aborted {
                return false;
            }
            state.aborted = true;
            state.reason = reason.clone();
        }
        debug!(reason = ?reason, "abort signal fired");
        self.inner.observers.emit(StreamError::Aborted(reason));
        self.inner.wakers.wake_all();
        true
    }
}

/// Owner side of an abort signal.
#[derive(Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Only the first call has an effect; returns whether
    /// this call was it.
    pub fn abort(&self, reason: Option<String>) -> bool {
        self.signal.abort(reason)
    }
}

/// Future returned by [`AbortSignal::wrap`].
#[pin_project]
pub struct Cancellable<F> {
    #[pin]
    fut: F,
    signal: AbortSignal,
}

impl<F, T> Future for Cancellable<F>
where
    F: Future<Output = StreamResult<T>>,
{
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.fut.poll(cx) {
            return Poll::Ready(output);
        }
        this.signal.inner.wakers.register(cx.waker());
        match this.signal.error() {
            Some(err) => Poll::Ready(Err(err)),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn abort_is_idempotent() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let hits = SharedPtr::new(AtomicUsize::new(0));
        let counter = hits.clone();
        signal.on_abort(move |err| {
            assert!(matches!(err, StreamError::Aborted(Some(ref r)) if r == "stop"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(controller.abort(Some("stop".into())));
        assert!(!controller.abort(Some("again".into())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.reason().as_deref(), Some("stop"));
    }

    #[test]
    fn removed_abort_listener_is_not_called() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let hits = SharedPtr::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = signal.on_abort(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(signal.off(id));
        controller.abort(None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrapped_future_resolves_with_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let pending = futures::future::pending::<StreamResult<()>>();
        let wrapped = signal.wrap(pending);

        let (result, _) = futures::join!(wrapped, async {
            tokio::task::yield_now().await;
            controller.abort(None);
        });
        assert!(matches!(result, Err(StreamError::Aborted(None))));
        assert!(matches!(signal.cancelled().await, StreamError::Aborted(None)));
    }
}
