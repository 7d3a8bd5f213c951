use super::error::{StreamError, StreamResult};
use super::lifecycle::{self, Engine, Lifecycle, Side};
use super::observer::{ListenerId, Observers, once_listener};
use super::queue::ChunkQueue;
use super::signal::AbortSignal;
use super::{
    ByteChunk, ByteLengthQueuingStrategy, Chunk, CountQueuingStrategy, Encoding, QueuingStrategy,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use futures::channel::oneshot;
use futures::future::{self, poll_fn};
use futures::Sink;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace};

type Completion = oneshot::Sender<StreamResult<()>>;

/// Transport side of a writable: commits chunks somewhere.
pub trait WritableSink<T: Chunk>: MaybeSend + Sized + 'static {
    /// Runs once before the first commit.
    fn start(
        &mut self,
        controller: &mut WritableController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Commit one chunk. An error is fatal to the stream.
    fn write(
        &mut self,
        chunk: T,
        encoding: Encoding,
        controller: &mut WritableController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Whether [`WritableSink::write_vectored`] should receive batches.
    fn is_vectored(&self) -> bool {
        false
    }

    /// Commit several buffered chunks at once; they share the outcome.
    fn write_vectored(
        &mut self,
        chunks: Vec<(T, Encoding)>,
        controller: &mut WritableController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async move {
            for (chunk, encoding) in chunks {
                self.write(chunk, encoding, controller).await?;
            }
            Ok(())
        }
    }

    /// Runs once after every write committed, before `finish`.
    fn finalize(
        &mut self,
        controller: &mut WritableController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Release resources; runs once during teardown.
    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = error;
        future::ready(Ok(())) // default no-op
    }
}

/// Passed to [`WritableSink`] primitives.
#[derive(Clone)]
pub struct WritableController {
    lifecycle: SharedPtr<Lifecycle>,
}

impl WritableController {
    pub(crate) fn new(lifecycle: SharedPtr<Lifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Destroy the stream with `error`.
    pub fn error(&self, error: StreamError) {
        self.lifecycle.destroy(Some(error));
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle.is_destroyed()
    }
}

/// Completion slot of one accepted write.
struct PendingWrite {
    completion: Option<Completion>,
    /// Accepted while a drain was pending; its completion waits for `drain`.
    gated: bool,
}

fn settle(completion: Option<Completion>, result: StreamResult<()>) {
    if let Some(tx) = completion {
        let _ = tx.send(result);
    }
}

pub(crate) struct WritableState<T> {
    buffer: ChunkQueue<T, PendingWrite>,
    strategy: BoxedStrategy<T>,
    high_water_mark: usize,
    object_mode: bool,
    default_encoding: Encoding,
    in_flight_len: usize,
    writing: bool,
    corked: usize,
    ending: bool,
    final_started: bool,
    finished: bool,
    need_drain: bool,
    end_waiters: Vec<Completion>,
    parked: Vec<Completion>,
}

impl<T> WritableState<T> {
    fn length(&self) -> usize {
        self.buffer.len() + self.in_flight_len
    }
}

pub(crate) struct WritableConfig<T> {
    strategy: BoxedStrategy<T>,
    high_water_mark: Option<usize>,
    object_mode: bool,
    default_encoding: Encoding,
}

impl<T: Chunk> WritableConfig<T> {
    pub(crate) fn objects() -> Self {
        Self {
            strategy: Box::new(CountQueuingStrategy::default()),
            high_water_mark: None,
            object_mode: true,
            default_encoding: Encoding::default(),
        }
    }

    pub(crate) fn bytes() -> Self
    where
        T: ByteChunk,
    {
        Self {
            strategy: Box::new(ByteLengthQueuingStrategy::default()),
            high_water_mark: None,
            object_mode: false,
            default_encoding: Encoding::default(),
        }
    }

    pub(crate) fn set_strategy<Q: QueuingStrategy<T> + MaybeSend + 'static>(&mut self, strategy: Q) {
        self.strategy = Box::new(strategy);
    }

    pub(crate) fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = Some(high_water_mark);
    }

    pub(crate) fn set_default_encoding(&mut self, encoding: Encoding) {
        self.default_encoding = encoding;
    }

    /// Switch to byte accounting, keeping an explicit high-water mark.
    pub(crate) fn into_bytes(self) -> Self
    where
        T: ByteChunk,
    {
        Self {
            high_water_mark: self.high_water_mark,
            default_encoding: self.default_encoding,
            ..Self::bytes()
        }
    }

    fn into_state(self) -> WritableState<T> {
        let high_water_mark = self
            .high_water_mark
            .unwrap_or_else(|| self.strategy.high_water_mark());
        WritableState {
            buffer: ChunkQueue::new(),
            strategy: self.strategy,
            high_water_mark,
            object_mode: self.object_mode,
            default_encoding: self.default_encoding,
            in_flight_len: 0,
            writing: false,
            corked: 0,
            ending: false,
            final_started: false,
            finished: false,
            need_drain: false,
            end_waiters: Vec::new(),
            parked: Vec::new(),
        }
    }
}

pub(crate) struct WritableShared<T> {
    state: Mutex<WritableState<T>>,
    drain: Observers<()>,
    finish: Observers<()>,
    pub(crate) lifecycle: SharedPtr<Lifecycle>,
}

/// Handle to the writable side of a stream. Clones share the same stream.
pub struct Writable<T: Chunk> {
    pub(crate) shared: SharedPtr<WritableShared<T>>,
    closing: Option<EndCompletion>,
}

impl<T: Chunk> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closing: None,
        }
    }
}

impl<T: Chunk> Writable<T> {
    pub(crate) fn with_lifecycle(config: WritableConfig<T>, lifecycle: SharedPtr<Lifecycle>) -> Self {
        Self {
            shared: SharedPtr::new(WritableShared {
                state: Mutex::new(config.into_state()),
                drain: Observers::new(),
                finish: Observers::new(),
                lifecycle,
            }),
            closing: None,
        }
    }

    /// Returns a builder for a writable committing into `sink`
    pub fn builder<S: WritableSink<T>>(sink: S) -> WritableBuilder<T, S> {
        WritableBuilder::new(sink)
    }

    /// Queue `chunk` for commit, discarding its outcome.
    ///
    /// Returns `false` once the buffered length reached the high-water mark;
    /// wait for `drain` before writing more.
    pub fn write(&self, chunk: T) -> bool {
        self.write_with(chunk, None).accepted()
    }

    /// Queue `chunk` for commit. The returned completion resolves once the
    /// chunk committed, or with the error that prevented it.
    pub fn write_with(&self, chunk: T, encoding: Option<Encoding>) -> WriteCompletion {
        let (tx, rx) = oneshot::channel();
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.is_destroyed() {
            let _ = tx.send(Err(StreamError::Destroyed("write")));
            return WriteCompletion::new(rx, false);
        }
        let mut state = self.shared.state.lock();
        if state.ending {
            drop(state);
            debug!("write after end rejected");
            let _ = tx.send(Err(StreamError::WriteAfterEnd));
            return WriteCompletion::new(rx, false);
        }
        let accepted = self.enqueue(&mut state, chunk, encoding, Some(tx));
        drop(state);
        lifecycle.wake_driver();
        WriteCompletion::new(rx, accepted)
    }

    fn enqueue(
        &self,
        state: &mut WritableState<T>,
        chunk: T,
        encoding: Option<Encoding>,
        completion: Option<Completion>,
    ) -> bool {
        let size = state.strategy.size(&chunk);
        let encoding = encoding.unwrap_or(state.default_encoding);
        let accepted = state.length() + size.max(1) < state.high_water_mark;
        if !accepted {
            state.need_drain = true;
        }
        let gated = state.need_drain;
        state.buffer.push_back(chunk, size, encoding, PendingWrite { completion, gated });
        trace!(length = state.length(), accepted, "write buffered");
        accepted
    }

    /// Write an optional final chunk and stop accepting writes. The returned
    /// completion resolves on `finish`.
    pub fn end(&self, chunk: Option<T>) -> EndCompletion {
        let (tx, rx) = oneshot::channel();
        let completion = EndCompletion::new(rx);
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.is_destroyed() {
            let _ = tx.send(Err(StreamError::Destroyed("end")));
            return completion;
        }
        let mut state = self.shared.state.lock();
        if state.finished {
            let _ = tx.send(Err(StreamError::AlreadyFinished("end")));
            return completion;
        }
        if state.ending {
            if chunk.is_some() {
                let _ = tx.send(Err(StreamError::WriteAfterEnd));
            } else {
                state.end_waiters.push(tx);
            }
            return completion;
        }
        if let Some(chunk) = chunk {
            self.enqueue(&mut state, chunk, None, None);
        }
        state.corked = 0;
        state.ending = true;
        state.end_waiters.push(tx);
        debug!(length = state.length(), "writable ending");
        drop(state);
        lifecycle.wake_driver();
        lifecycle.notify();
        completion
    }

    /// Buffer writes without committing them until the matching
    /// [`Writable::uncork`]. Calls nest.
    pub fn cork(&self) {
        self.shared.state.lock().corked += 1;
    }

    pub fn uncork(&self) {
        let mut state = self.shared.state.lock();
        if state.corked == 0 {
            return;
        }
        state.corked -= 1;
        if state.corked == 0 {
            trace!(buffered = state.buffer.entry_count(), "writable uncorked");
            drop(state);
            self.shared.lifecycle.wake_driver();
        }
    }

    pub fn set_default_encoding(&self, encoding: Encoding) {
        self.shared.state.lock().default_encoding = encoding;
    }

    pub fn on_drain<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.drain.add(Box::new(f))
    }

    pub fn on_finish<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.finish.add(Box::new(f))
    }

    pub fn on_error<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(StreamError) + MaybeSend + 'static,
    {
        self.shared.lifecycle.on_error.add(Box::new(f))
    }

    pub fn on_close<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.lifecycle.on_close.add(Box::new(f))
    }

    pub fn once_drain<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.shared.drain.add_once(once_listener(f))
    }

    pub fn once_finish<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.shared.finish.add_once(once_listener(f))
    }

    pub fn once_error<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(StreamError) + MaybeSend + 'static,
    {
        self.shared.lifecycle.on_error.add_once(once_listener(f))
    }

    pub fn once_close<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.shared.lifecycle.on_close.add_once(once_listener(f))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.drain.remove(id)
            || self.shared.finish.remove(id)
            || self.shared.lifecycle.on_error.remove(id)
            || self.shared.lifecycle.on_close.remove(id)
    }

    /// Destroy the stream. Idempotent; only the first error is kept.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.shared.lifecycle.destroy(error);
    }

    /// Buffered plus in-flight length.
    pub fn writable_length(&self) -> usize {
        self.shared.state.lock().length()
    }

    pub fn writable_high_water_mark(&self) -> usize {
        self.shared.state.lock().high_water_mark
    }

    pub fn writable_need_drain(&self) -> bool {
        self.shared.state.lock().need_drain
    }

    pub fn writable_corked(&self) -> usize {
        self.shared.state.lock().corked
    }

    /// `true` once `end` was called.
    pub fn writable_ended(&self) -> bool {
        self.shared.state.lock().ending
    }

    pub fn writable_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    pub fn writable_object_mode(&self) -> bool {
        self.shared.state.lock().object_mode
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lifecycle.is_destroyed()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.shared.lifecycle.errored()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle.is_closed()
    }

    /// Resolves once no drain is pending.
    pub fn drained(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let writable = self.clone();
        poll_fn(move |cx| writable.poll_drained(cx))
    }

    fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let lifecycle = &self.shared.lifecycle;
        lifecycle.register(cx.waker());
        if lifecycle.is_destroyed() {
            return Poll::Ready(Err(StreamError::Destroyed("write")));
        }
        if self.shared.state.lock().need_drain {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    /// Resolves on `finish`, or with the error (or
    /// [`StreamError::PrematureClose`]) if the stream was destroyed first.
    pub fn finished(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let writable = self.clone();
        poll_fn(move |cx| {
            let lifecycle = &writable.shared.lifecycle;
            lifecycle.register(cx.waker());
            if writable.shared.state.lock().finished {
                return Poll::Ready(Ok(()));
            }
            if lifecycle.is_destroyed() {
                return Poll::Ready(Err(lifecycle
                    .errored()
                    .unwrap_or(StreamError::PrematureClose)));
            }
            Poll::Pending
        })
    }

    /// Resolves after `close`, with the error the stream was destroyed with.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        lifecycle::closed(self.shared.lifecycle.clone())
    }

    /// Claim the next commit: one entry, or everything buffered for
    /// vectored sinks.
    fn claim_batch(&self, vectored: bool) -> Option<(Vec<(T, Encoding)>, Vec<PendingWrite>)> {
        let mut state = self.shared.state.lock();
        if state.writing || state.buffer.is_empty() || state.corked > 0 {
            return None;
        }
        let count = if vectored { state.buffer.entry_count() } else { 1 };
        let mut chunks = Vec::with_capacity(count);
        let mut pending = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(entry) = state.buffer.pop_front() else {
                break;
            };
            state.in_flight_len += entry.size;
            chunks.push((entry.chunk, entry.encoding));
            pending.push(entry.meta);
        }
        state.writing = true;
        trace!(entries = chunks.len(), "commit started");
        Some((chunks, pending))
    }

    /// Record a successful commit, emit `drain` if due and resolve the
    /// completions that may fire now.
    fn commit_succeeded(&self, batch: Vec<PendingWrite>) {
        let (drain, ready) = {
            let mut state = self.shared.state.lock();
            state.writing = false;
            state.in_flight_len = 0;
            let empty = state.length() == 0;
            let drain = state.need_drain && !state.ending && empty;
            let mut ready = Vec::new();
            if drain {
                state.need_drain = false;
                ready.append(&mut state.parked);
                ready.extend(batch.into_iter().filter_map(|write| write.completion));
            } else {
                for write in batch {
                    if write.gated || !state.parked.is_empty() {
                        state.parked.extend(write.completion);
                    } else {
                        ready.extend(write.completion);
                    }
                }
                if state.ending && empty {
                    ready.append(&mut state.parked);
                }
            }
            (drain, ready)
        };
        if drain {
            trace!("emitting drain");
            self.shared.drain.emit(());
        }
        for tx in ready {
            let _ = tx.send(Ok(()));
        }
    }

    fn claim_finalize(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.ending
            || state.final_started
            || state.writing
            || !state.buffer.is_empty()
        {
            return false;
        }
        state.final_started = true;
        true
    }

    fn finish(&self) {
        let waiters = {
            let mut state = self.shared.state.lock();
            state.finished = true;
            std::mem::take(&mut state.end_waiters)
        };
        debug!("emitting finish");
        self.shared.finish.emit(());
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }
        self.shared.lifecycle.side_done(Side::Writable);
    }

    fn fail_pending(&self, error: Option<&StreamError>) {
        let (parked, buffered, waiters) = {
            let mut state = self.shared.state.lock();
            let parked = std::mem::take(&mut state.parked);
            let buffered: Vec<_> = state.buffer.drain().map(|entry| entry.meta).collect();
            (parked, buffered, std::mem::take(&mut state.end_waiters))
        };
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "failing buffered writes");
        }
        for tx in parked {
            let _ = tx.send(Ok(()));
        }
        for write in buffered {
            let err = error.cloned().unwrap_or(StreamError::Destroyed("write"));
            settle(write.completion, Err(err));
        }
        for tx in waiters {
            let err = error.cloned().unwrap_or(StreamError::Destroyed("end"));
            let _ = tx.send(Err(err));
        }
    }

    fn release(&self) {
        self.shared.state.lock().buffer.clear();
        self.shared.drain.clear();
        self.shared.finish.clear();
    }
}

impl<T: Chunk> Sink<T> for Writable<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_drained(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.is_destroyed() {
            return Err(StreamError::Destroyed("write"));
        }
        if self.writable_ended() {
            return Err(StreamError::WriteAfterEnd);
        }
        self.write(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let lifecycle = &self.shared.lifecycle;
        lifecycle.register(cx.waker());
        if lifecycle.is_destroyed() {
            return Poll::Ready(Err(StreamError::Destroyed("write")));
        }
        if self.writable_length() == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.closing.is_none() {
            if this.writable_finished() {
                return Poll::Ready(Ok(()));
            }
            this.closing = Some(this.end(None));
        }
        match this.closing.as_mut() {
            Some(closing) => Pin::new(closing).poll(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Outcome of one [`Writable::write_with`] call.
#[pin_project]
pub struct WriteCompletion {
    #[pin]
    rx: oneshot::Receiver<StreamResult<()>>,
    accepted: bool,
}

impl WriteCompletion {
    fn new(rx: oneshot::Receiver<StreamResult<()>>, accepted: bool) -> Self {
        Self { rx, accepted }
    }

    /// `false` when the caller should wait for `drain` before writing more.
    pub fn accepted(&self) -> bool {
        self.accepted
    }
}

impl Future for WriteCompletion {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project()
            .rx
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}

/// Outcome of [`Writable::end`]: resolves on `finish` or with the error.
#[pin_project]
pub struct EndCompletion {
    #[pin]
    rx: oneshot::Receiver<StreamResult<()>>,
}

impl EndCompletion {
    fn new(rx: oneshot::Receiver<StreamResult<()>>) -> Self {
        Self { rx }
    }
}

impl Future for EndCompletion {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project()
            .rx
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StreamError::TaskDropped)))
    }
}

enum WriteOp<S> {
    Start(PlatformBoxFutureStatic<(S, StreamResult<()>)>),
    Commit(
        PlatformBoxFutureStatic<(S, StreamResult<()>)>,
        Vec<PendingWrite>,
    ),
    Finalize(PlatformBoxFutureStatic<(S, StreamResult<()>)>),
}

/// Driver half of a writable: owns the sink and runs its primitives.
pub(crate) struct WriteEngine<T: Chunk, S> {
    writable: Writable<T>,
    controller: WritableController,
    sink: Option<S>,
    started: bool,
    op: Option<WriteOp<S>>,
}

impl<T: Chunk, S: WritableSink<T>> WriteEngine<T, S> {
    pub(crate) fn new(writable: Writable<T>, sink: S) -> Self {
        Self {
            controller: WritableController::new(writable.shared.lifecycle.clone()),
            writable,
            sink: Some(sink),
            started: false,
            op: None,
        }
    }

    fn poll_op(&mut self, cx: &mut Context<'_>) -> bool {
        let lifecycle = self.writable.shared.lifecycle.clone();
        let fut = match self.op.as_mut() {
            Some(WriteOp::Start(fut) | WriteOp::Commit(fut, _) | WriteOp::Finalize(fut)) => fut,
            None => return false,
        };
        let Poll::Ready((sink, result)) = fut.as_mut().poll(cx) else {
            return false;
        };
        self.sink = Some(sink);
        let Some(op) = self.op.take() else {
            return true;
        };

        match (op, result) {
            (WriteOp::Start(_), Ok(())) => {
                trace!("writable sink started");
                self.started = true;
            }
            (WriteOp::Commit(_, batch), Ok(())) if !lifecycle.is_destroyed() => {
                self.writable.commit_succeeded(batch);
            }
            (WriteOp::Commit(_, batch), Ok(())) => {
                {
                    let mut state = self.writable.shared.state.lock();
                    state.writing = false;
                    state.in_flight_len = 0;
                }
                for write in batch {
                    settle(write.completion, Err(lifecycle.error_or_destroyed("write")));
                }
            }
            (WriteOp::Commit(_, batch), Err(err)) => {
                debug!(error = %err, "commit failed");
                {
                    let mut state = self.writable.shared.state.lock();
                    state.writing = false;
                    state.in_flight_len = 0;
                }
                let parked = std::mem::take(&mut self.writable.shared.state.lock().parked);
                for tx in parked {
                    let _ = tx.send(Ok(()));
                }
                for write in batch {
                    settle(write.completion, Err(err.clone()));
                }
                lifecycle.destroy(Some(err));
            }
            (WriteOp::Finalize(_), Ok(())) if !lifecycle.is_destroyed() => self.writable.finish(),
            (WriteOp::Finalize(_), Ok(())) => {}
            (WriteOp::Start(_) | WriteOp::Finalize(_), Err(err)) => {
                debug!(error = %err, "writable sink failed");
                lifecycle.destroy(Some(err));
            }
        }
        true
    }

    fn begin(&mut self) -> bool {
        if self.op.is_some() {
            return false;
        }
        let Some(mut sink) = self.sink.take() else {
            return false;
        };
        let mut controller = self.controller.clone();

        if !self.started {
            self.op = Some(WriteOp::Start(Box::pin(async move {
                let result = sink.start(&mut controller).await;
                (sink, result)
            })));
            return true;
        }

        let vectored = sink.is_vectored();
        if let Some((mut chunks, batch)) = self.writable.claim_batch(vectored) {
            self.op = Some(WriteOp::Commit(
                Box::pin(async move {
                    let result = match (chunks.len(), chunks.pop()) {
                        (1, Some((chunk, encoding))) => {
                            sink.write(chunk, encoding, &mut controller).await
                        }
                        (_, Some(last)) => {
                            chunks.push(last);
                            sink.write_vectored(chunks, &mut controller).await
                        }
                        (_, None) => Ok(()),
                    };
                    (sink, result)
                }),
                batch,
            ));
            return true;
        }

        if self.writable.claim_finalize() {
            trace!("finalize started");
            self.op = Some(WriteOp::Finalize(Box::pin(async move {
                let result = sink.finalize(&mut controller).await;
                (sink, result)
            })));
            return true;
        }

        self.sink = Some(sink);
        false
    }
}

impl<T: Chunk, S: WritableSink<T>> Engine for WriteEngine<T, S> {
    fn poll_work(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progressed = self.poll_op(cx);
        if self.writable.is_destroyed() {
            return progressed;
        }
        if self.begin() {
            progressed = true;
            // A primitive that is ready right away is settled in this pass.
            progressed |= self.poll_op(cx);
        }
        progressed
    }

    fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    fn fail_pending(&mut self, error: Option<&StreamError>) {
        self.writable.fail_pending(error);
    }

    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> Option<PlatformBoxFutureStatic<StreamResult<()>>> {
        let mut sink = self.sink.take()?;
        Some(Box::pin(async move { sink.destroy(error).await }))
    }

    fn release(&mut self) {
        self.writable.release();
    }
}

pub struct WritableBuilder<T: Chunk, S> {
    sink: S,
    config: WritableConfig<T>,
    signal: Option<AbortSignal>,
    auto_destroy: bool,
}

impl<T: Chunk, S: WritableSink<T>> WritableBuilder<T, S> {
    fn new(sink: S) -> Self {
        Self {
            sink,
            config: WritableConfig::objects(),
            signal: None,
            auto_destroy: true,
        }
    }

    pub fn strategy<Q: QueuingStrategy<T> + MaybeSend + 'static>(mut self, strategy: Q) -> Self {
        self.config.set_strategy(strategy);
        self
    }

    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.config.set_high_water_mark(high_water_mark);
        self
    }

    /// Measure buffered writes in bytes instead of entries.
    pub fn byte_mode(mut self) -> Self
    where
        T: ByteChunk,
    {
        self.config = self.config.into_bytes();
        self
    }

    /// Encoding hint for writes that do not name one.
    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.config.set_default_encoding(encoding);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Destroy automatically after `finish` (default `true`).
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (Writable<T>, impl Future<Output = ()> + MaybeSend + 'static) {
        let lifecycle = SharedPtr::new(Lifecycle::new(false, true, self.auto_destroy));
        let writable = Writable::with_lifecycle(self.config, lifecycle.clone());
        if let Some(signal) = &self.signal {
            lifecycle::watch_signal(&lifecycle, signal);
        }
        let engine = WriteEngine::new(writable.clone(), self.sink);
        (writable, lifecycle::drive(lifecycle, engine))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> Writable<T>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> Writable<T>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
