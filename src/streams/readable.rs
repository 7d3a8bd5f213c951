use super::error::{StreamError, StreamResult};
use super::lifecycle::{self, Engine, Lifecycle, Side};
use super::observer::{ListenerId, Observers, once_listener};
use super::pipe::PipeLink;
use super::queue::ChunkQueue;
use super::signal::AbortSignal;
use super::{
    ByteChunk, ByteLengthQueuingStrategy, Chunk, CountQueuingStrategy, Encoding, QueuingStrategy,
    grown_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use futures::future::{self, poll_fn};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// Transport side of a readable: produces data on request.
pub trait ReadableSource<T: Chunk>: MaybeSend + Sized + 'static {
    /// Runs once before the first fill.
    fn start(
        &mut self,
        controller: &mut ReadableController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Fill request: push up to roughly `size` units through the controller.
    ///
    /// At most one fill is outstanding. A fill that pushes nothing is not
    /// repeated until the consumer asks for data again.
    fn read(
        &mut self,
        size: usize,
        controller: &mut ReadableController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Release resources; runs once during teardown.
    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = error;
        future::ready(Ok(())) // default no-op
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Undecided,
    Pull,
    Flowing,
}

#[derive(Debug, Clone, Copy)]
enum FlowSignal {
    Pause,
    Resume,
}

pub(crate) struct ReadableState<T: Chunk> {
    queue: ChunkQueue<T>,
    strategy: BoxedStrategy<T>,
    high_water_mark: usize,
    mode: ReadMode,
    paused: bool,
    ended: bool,
    end_emitted: bool,
    end_requested: bool,
    need_readable: bool,
    reading: bool,
    want_fill: bool,
    signals: VecDeque<FlowSignal>,
    pub(crate) pipes: Vec<SharedPtr<PipeLink<T>>>,
    pub(crate) awaiting_drain: HashSet<u64>,
}

impl<T: Chunk> ReadableState<T> {
    fn flowing_active(&self) -> bool {
        self.mode == ReadMode::Flowing && !self.paused
    }

    fn can_push_more(&self) -> bool {
        !self.ended && (self.queue.len() < self.high_water_mark || self.queue.is_empty())
    }

    fn take(&mut self, size: Option<usize>) -> Option<T> {
        if self.queue.is_empty() {
            return None;
        }
        if !self.queue.is_byte_mode() {
            return self.queue.pop_front().map(|entry| entry.chunk);
        }
        let available = self.queue.len();
        let n = match size {
            None => available,
            Some(n) if n <= available => n,
            Some(_) if self.ended => available,
            Some(_) => return None,
        };
        self.queue.take(n)
    }
}

/// Construction-time settings shared by readables and the readable half of
/// a duplex.
pub(crate) struct ReadableConfig<T> {
    queue: ChunkQueue<T>,
    strategy: BoxedStrategy<T>,
    high_water_mark: Option<usize>,
}

impl<T: Chunk> ReadableConfig<T> {
    pub(crate) fn objects() -> Self {
        Self {
            queue: ChunkQueue::new(),
            strategy: Box::new(CountQueuingStrategy::default()),
            high_water_mark: None,
        }
    }

    pub(crate) fn bytes() -> Self
    where
        T: ByteChunk,
    {
        Self {
            queue: ChunkQueue::bytes(),
            strategy: Box::new(ByteLengthQueuingStrategy::default()),
            high_water_mark: None,
        }
    }

    pub(crate) fn set_strategy<Q: QueuingStrategy<T> + MaybeSend + 'static>(&mut self, strategy: Q) {
        self.strategy = Box::new(strategy);
    }

    pub(crate) fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = Some(high_water_mark);
    }

    /// Switch to byte accounting, keeping an explicit high-water mark.
    pub(crate) fn into_bytes(self) -> Self
    where
        T: ByteChunk,
    {
        Self {
            high_water_mark: self.high_water_mark,
            ..Self::bytes()
        }
    }

    fn into_state(self) -> ReadableState<T> {
        let high_water_mark = self
            .high_water_mark
            .unwrap_or_else(|| self.strategy.high_water_mark());
        ReadableState {
            queue: self.queue,
            strategy: self.strategy,
            high_water_mark,
            mode: ReadMode::Undecided,
            paused: false,
            ended: false,
            end_emitted: false,
            end_requested: false,
            need_readable: false,
            reading: false,
            want_fill: false,
            signals: VecDeque::new(),
            pipes: Vec::new(),
            awaiting_drain: HashSet::new(),
        }
    }
}

pub(crate) struct ReadableShared<T: Chunk> {
    pub(crate) state: Mutex<ReadableState<T>>,
    data: Observers<T>,
    readable: Observers<()>,
    end: Observers<()>,
    pause: Observers<()>,
    resume: Observers<()>,
    pub(crate) lifecycle: SharedPtr<Lifecycle>,
}

/// Handle to the readable side of a stream. Clones share the same stream.
///
/// Consumption is either pull-driven ([`Readable::read`], or the
/// [`Stream`] impl) or flowing ([`Readable::on_data`], [`Readable::resume`],
/// piping). The first choice sticks.
pub struct Readable<T: Chunk> {
    pub(crate) shared: SharedPtr<ReadableShared<T>>,
    exhausted: bool,
}

impl<T: Chunk> Clone for Readable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            exhausted: false,
        }
    }
}

impl<T: Chunk> Readable<T> {
    pub(crate) fn with_lifecycle(config: ReadableConfig<T>, lifecycle: SharedPtr<Lifecycle>) -> Self {
        Self {
            shared: SharedPtr::new(ReadableShared {
                state: Mutex::new(config.into_state()),
                data: Observers::new(),
                readable: Observers::new(),
                end: Observers::new(),
                pause: Observers::new(),
                resume: Observers::new(),
                lifecycle,
            }),
            exhausted: false,
        }
    }

    /// Returns a builder for a readable fed by `source`
    pub fn builder<S: ReadableSource<T>>(source: S) -> ReadableBuilder<T, S> {
        ReadableBuilder::new(source)
    }

    /// Readable yielding the items of `iter`, one per fill.
    pub fn from_iter<I>(iter: I) -> ReadableBuilder<T, IteratorSource<I::IntoIter>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: MaybeSend + 'static,
    {
        ReadableBuilder::new(IteratorSource {
            iter: iter.into_iter(),
        })
    }

    /// Readable yielding the items of an async stream.
    pub fn from_stream<S>(stream: S) -> ReadableBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        ReadableBuilder::new(AsyncStreamSource { stream })
    }

    /// Hand a chunk to the stream, or `None` to signal end of data.
    ///
    /// Returns `false` once the buffered length reached the high-water mark;
    /// the producer should wait for the next fill request. Pushing after the
    /// end of data destroys the stream with [`StreamError::PushAfterEof`].
    pub fn push(&self, chunk: Option<T>) -> bool {
        match chunk {
            Some(chunk) => self.add_chunk(chunk, Encoding::default(), false),
            None => self.push_eof(),
        }
    }

    pub fn push_encoded(&self, chunk: T, encoding: Encoding) -> bool {
        self.add_chunk(chunk, encoding, false)
    }

    /// Put a chunk back at the front of the buffer.
    pub fn unshift(&self, chunk: T) -> bool {
        self.add_chunk(chunk, Encoding::default(), true)
    }

    fn push_eof(&self) -> bool {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.is_destroyed() {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if !state.ended {
                debug!(buffered = state.queue.len(), "readable reached end of data");
                state.ended = true;
            }
        }
        lifecycle.wake_driver();
        lifecycle.notify();
        false
    }

    fn add_chunk(&self, chunk: T, encoding: Encoding, front: bool) -> bool {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.is_destroyed() {
            return false;
        }
        let mut state = self.shared.state.lock();
        let misuse = if front {
            state.end_emitted.then_some(StreamError::UnshiftAfterEnd)
        } else {
            state.ended.then_some(StreamError::PushAfterEof)
        };
        if let Some(err) = misuse {
            drop(state);
            lifecycle.destroy(Some(err));
            return false;
        }
        if state.queue.is_byte_mode() && state.strategy.size(&chunk) == 0 {
            return state.can_push_more();
        }

        let was_empty = state.queue.is_empty();
        let size = state.strategy.size(&chunk);
        if front {
            state.queue.push_front(chunk, size, encoding, ());
        } else {
            state.queue.push_back(chunk, size, encoding, ());
        }
        if !state.ended {
            state.want_fill = true;
        }
        let accepted = (state.flowing_active() && was_empty) || state.can_push_more();
        drop(state);

        lifecycle.wake_driver();
        lifecycle.notify();
        accepted
    }

    /// Pull buffered data.
    ///
    /// `None` returns the next entry (object mode) or everything buffered
    /// (byte mode). `Some(n)` in byte mode returns exactly `n` bytes, or the
    /// remainder once the stream ended; `Some(0)` only requests a fill.
    /// `Ok(None)` means nothing is available yet, or nothing ever will be
    /// once the stream ended. Fails with [`StreamError::Destroyed`] after
    /// `destroy`; the cause stays available from [`Readable::errored`].
    pub fn read(&self, size: Option<usize>) -> StreamResult<Option<T>> {
        let lifecycle = &self.shared.lifecycle;
        let mut state = self.shared.state.lock();
        if lifecycle.is_destroyed() {
            return Err(StreamError::Destroyed("read"));
        }
        if state.mode == ReadMode::Flowing {
            return Err(StreamError::ModeConflict("read"));
        }
        state.mode = ReadMode::Pull;

        if let Some(n) = size {
            if n > state.high_water_mark {
                state.high_water_mark = grown_high_water_mark(n)?;
                trace!(high_water_mark = state.high_water_mark, "readable grew its high-water mark");
            }
        }
        if !state.ended {
            state.want_fill = true;
        }

        let chunk = match size {
            Some(0) => None,
            _ => state.take(size),
        };
        if chunk.is_none() || state.queue.is_empty() {
            state.need_readable = true;
        }
        if state.ended && state.queue.is_empty() {
            state.end_requested = true;
        }
        drop(state);

        lifecycle.wake_driver();
        if chunk.is_some() {
            lifecycle.notify();
        }
        Ok(chunk)
    }

    /// Switch to flowing mode and receive every chunk as it becomes
    /// available. Irreversible; fails once pull mode was selected.
    pub fn on_data<F>(&self, f: F) -> StreamResult<ListenerId>
    where
        F: FnMut(T) + MaybeSend + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.mode == ReadMode::Pull {
                return Err(StreamError::ModeConflict("on_data"));
            }
            if state.mode == ReadMode::Undecided {
                state.mode = ReadMode::Flowing;
                if !state.paused {
                    state.signals.push_back(FlowSignal::Resume);
                }
            }
            if !state.ended {
                state.want_fill = true;
            }
        }
        let id = self.shared.data.add(Box::new(f));
        self.shared.lifecycle.wake_driver();
        Ok(id)
    }

    pub fn on_end<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.end.add(Box::new(f))
    }

    /// Pull-mode notification that data (or the end of data) can be read.
    ///
    /// Fires once per transition from "nothing to read" to "something to
    /// read"; the observer is expected to call [`Readable::read`] until it
    /// returns `Ok(None)`. Selects pull mode, so it fails on a flowing stream.
    pub fn on_readable<F>(&self, f: F) -> StreamResult<ListenerId>
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.select_pull("on_readable")?;
        Ok(self.shared.readable.add(Box::new(f)))
    }

    pub fn once_readable<F>(&self, f: F) -> StreamResult<ListenerId>
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.select_pull("once_readable")?;
        Ok(self.shared.readable.add_once(once_listener(f)))
    }

    fn select_pull(&self, op: &'static str) -> StreamResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.mode == ReadMode::Flowing {
                return Err(StreamError::ModeConflict(op));
            }
            state.mode = ReadMode::Pull;
            state.need_readable = true;
            if !state.ended {
                state.want_fill = true;
            }
        }
        self.shared.lifecycle.wake_driver();
        Ok(())
    }

    pub fn once_end<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.shared.end.add_once(once_listener(f))
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

    pub fn on_pause<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.pause.add(Box::new(f))
    }

    pub fn on_resume<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.shared.resume.add(Box::new(f))
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

    /// Remove an observer registered on this stream.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.data.remove(id)
            || self.shared.readable.remove(id)
            || self.shared.end.remove(id)
            || self.shared.pause.remove(id)
            || self.shared.resume.remove(id)
            || self.shared.lifecycle.on_error.remove(id)
            || self.shared.lifecycle.on_close.remove(id)
    }

    #[cfg(test)]
    pub(crate) fn data_listener_count(&self) -> usize {
        self.shared.data.len()
    }

    /// Stop flowing delivery; chunks stay buffered.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.paused {
            state.paused = true;
            state.signals.push_back(FlowSignal::Pause);
            drop(state);
            self.shared.lifecycle.wake_driver();
        }
    }

    /// Resume flowing delivery, selecting flowing mode if undecided.
    pub fn resume(&self) -> StreamResult<()> {
        let mut state = self.shared.state.lock();
        match state.mode {
            ReadMode::Pull => return Err(StreamError::ModeConflict("resume")),
            ReadMode::Undecided => state.mode = ReadMode::Flowing,
            ReadMode::Flowing if !state.paused => return Ok(()),
            ReadMode::Flowing => {}
        }
        state.paused = false;
        state.signals.push_back(FlowSignal::Resume);
        if !state.ended {
            state.want_fill = true;
        }
        drop(state);
        self.shared.lifecycle.wake_driver();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Destroy the stream. Idempotent; only the first error is kept.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.shared.lifecycle.destroy(error);
    }

    pub fn readable_length(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn readable_high_water_mark(&self) -> usize {
        self.shared.state.lock().high_water_mark
    }

    pub fn readable_object_mode(&self) -> bool {
        !self.shared.state.lock().queue.is_byte_mode()
    }

    /// `true` once `end` was emitted.
    pub fn readable_ended(&self) -> bool {
        self.shared.state.lock().end_emitted
    }

    /// `None` while undecided, `Some(true)` while delivering, `Some(false)`
    /// when paused or in pull mode.
    pub fn readable_flowing(&self) -> Option<bool> {
        let state = self.shared.state.lock();
        match state.mode {
            ReadMode::Undecided if state.paused => Some(false),
            ReadMode::Undecided => None,
            ReadMode::Pull => Some(false),
            ReadMode::Flowing => Some(!state.paused),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lifecycle.is_destroyed()
    }

    /// EOF was pushed, whether or not `end` went out yet.
    pub(crate) fn is_eof(&self) -> bool {
        self.shared.state.lock().ended
    }

    /// Below the high-water mark, or empty.
    pub(crate) fn has_room(&self) -> bool {
        let state = self.shared.state.lock();
        state.queue.len() < state.high_water_mark || state.queue.is_empty()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.shared.lifecycle.errored()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle.is_closed()
    }

    /// Resolves once `end` was emitted, or with the error (or
    /// [`StreamError::PrematureClose`]) if the stream was destroyed first.
    pub fn ended(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let readable = self.clone();
        poll_fn(move |cx| {
            let lifecycle = &readable.shared.lifecycle;
            lifecycle.register(cx.waker());
            if readable.shared.state.lock().end_emitted {
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

    fn flush_signals(&self) -> bool {
        let signals: Vec<FlowSignal> = self.shared.state.lock().signals.drain(..).collect();
        for signal in &signals {
            match signal {
                FlowSignal::Pause => {
                    trace!("readable paused");
                    self.shared.pause.emit(());
                }
                FlowSignal::Resume => {
                    trace!("readable resumed");
                    self.shared.resume.emit(());
                }
            }
        }
        !signals.is_empty()
    }

    /// Hand buffered chunks to data observers while flowing.
    fn deliver(&self) -> bool {
        let lifecycle = &self.shared.lifecycle;
        let mut delivered = false;
        loop {
            let chunk = {
                let mut state = self.shared.state.lock();
                if !state.flowing_active() || lifecycle.is_destroyed() {
                    break;
                }
                let Some(entry) = state.queue.pop_front() else {
                    break;
                };
                if !state.ended {
                    state.want_fill = true;
                }
                entry.chunk
            };
            lifecycle.notify();
            self.shared.data.emit(chunk);
            delivered = true;
        }
        delivered
    }

    /// Tell pull-mode observers that `read` has something for them.
    fn maybe_emit_readable(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            let available = !state.queue.is_empty() || state.ended;
            if state.mode != ReadMode::Pull
                || !state.need_readable
                || !available
                || state.end_emitted
                || self.shared.readable.is_empty()
                || self.shared.lifecycle.is_destroyed()
            {
                return false;
            }
            state.need_readable = false;
        }
        trace!("readable has data");
        self.shared.readable.emit(());
        true
    }

    fn maybe_emit_end(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            let consumed = state.flowing_active() || state.end_requested;
            if !state.ended
                || state.end_emitted
                || !state.queue.is_empty()
                || !consumed
                || self.shared.lifecycle.is_destroyed()
            {
                return false;
            }
            state.end_emitted = true;
        }
        debug!("readable emitting end");
        self.shared.end.emit(());
        self.shared.lifecycle.side_done(Side::Readable);
        true
    }

    /// Claim the next fill, returning the size to request.
    fn claim_fill(&self) -> Option<usize> {
        let mut state = self.shared.state.lock();
        let below = state.queue.len() < state.high_water_mark || state.queue.is_empty();
        if state.ended || state.reading || !state.want_fill || !below {
            return None;
        }
        state.want_fill = false;
        state.reading = true;
        Some(state.high_water_mark)
    }

    fn release(&self) {
        {
            let mut state = self.shared.state.lock();
            state.queue.clear();
            state.pipes.clear();
            state.awaiting_drain.clear();
        }
        self.shared.data.clear();
        self.shared.readable.clear();
        self.shared.end.clear();
        self.shared.pause.clear();
        self.shared.resume.clear();
    }
}

impl<T: Chunk> Stream for Readable<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.exhausted {
            return Poll::Ready(None);
        }
        let lifecycle = &this.shared.lifecycle;
        lifecycle.register(cx.waker());
        if lifecycle.is_destroyed() {
            this.exhausted = true;
            let ended = this.shared.state.lock().ended;
            return Poll::Ready(match lifecycle.errored() {
                Some(err) => Some(Err(err)),
                None if ended => None,
                None => Some(Err(StreamError::PrematureClose)),
            });
        }
        match this.read(None) {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                let state = this.shared.state.lock();
                if state.ended && state.queue.is_empty() {
                    drop(state);
                    this.exhausted = true;
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
            Err(err) => {
                this.exhausted = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

/// Passed to [`ReadableSource`] primitives to feed the stream.
#[derive(Clone)]
pub struct ReadableController<T: Chunk> {
    readable: Readable<T>,
}

impl<T: Chunk> ReadableController<T> {
    pub(crate) fn new(readable: Readable<T>) -> Self {
        Self { readable }
    }

    /// Push a chunk; `false` asks the source to hold off.
    pub fn push(&self, chunk: T) -> bool {
        self.readable.push(Some(chunk))
    }

    pub fn push_encoded(&self, chunk: T, encoding: Encoding) -> bool {
        self.readable.push_encoded(chunk, encoding)
    }

    /// Signal end of data.
    pub fn end(&self) {
        self.readable.push(None);
    }

    /// Destroy the stream with `error`.
    pub fn error(&self, error: StreamError) {
        self.readable.destroy(Some(error));
    }

    /// Room left below the high-water mark; negative when over it.
    pub fn desired_size(&self) -> isize {
        let state = self.readable.shared.state.lock();
        state.high_water_mark as isize - state.queue.len() as isize
    }

    pub fn is_destroyed(&self) -> bool {
        self.readable.is_destroyed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOpKind {
    Start,
    Fill,
}

/// Driver half of a readable: owns the source and runs its primitives.
pub(crate) struct ReadEngine<T: Chunk, S> {
    readable: Readable<T>,
    controller: ReadableController<T>,
    source: Option<S>,
    started: bool,
    op: Option<(ReadOpKind, PlatformBoxFutureStatic<(S, StreamResult<()>)>)>,
}

impl<T: Chunk, S: ReadableSource<T>> ReadEngine<T, S> {
    pub(crate) fn new(readable: Readable<T>, source: S) -> Self {
        Self {
            controller: ReadableController::new(readable.clone()),
            readable,
            source: Some(source),
            started: false,
            op: None,
        }
    }

    fn begin_start(&mut self) -> bool {
        let Some(mut source) = self.source.take() else {
            return false;
        };
        let mut controller = self.controller.clone();
        self.op = Some((
            ReadOpKind::Start,
            Box::pin(async move {
                let result = source.start(&mut controller).await;
                (source, result)
            }),
        ));
        true
    }

    fn begin_fill(&mut self) -> bool {
        if !self.started || self.op.is_some() || self.source.is_none() {
            return false;
        }
        let Some(size) = self.readable.claim_fill() else {
            return false;
        };
        let Some(mut source) = self.source.take() else {
            return false;
        };
        trace!(size, "readable fill requested");
        let mut controller = self.controller.clone();
        let lifecycle = self.readable.shared.lifecycle.clone();
        self.op = Some((
            ReadOpKind::Fill,
            Box::pin(async move {
                let fill = source.read(size, &mut controller);
                let result = lifecycle::until_destroyed(lifecycle, fill)
                    .await
                    .unwrap_or(Ok(()));
                (source, result)
            }),
        ));
        true
    }
}

impl<T: Chunk, S: ReadableSource<T>> Engine for ReadEngine<T, S> {
    fn poll_work(&mut self, cx: &mut Context<'_>) -> bool {
        let lifecycle = self.readable.shared.lifecycle.clone();
        let mut progressed = false;

        if let Some((kind, fut)) = self.op.as_mut() {
            let kind = *kind;
            if let Poll::Ready((source, result)) = fut.as_mut().poll(cx) {
                self.op = None;
                self.source = Some(source);
                progressed = true;
                match kind {
                    ReadOpKind::Start => {
                        trace!("readable source started");
                        self.started = true;
                    }
                    ReadOpKind::Fill => self.readable.shared.state.lock().reading = false,
                }
                if let Err(err) = result {
                    debug!(error = %err, "readable source failed");
                    lifecycle.destroy(Some(err));
                }
            }
        }
        if lifecycle.is_destroyed() {
            return progressed;
        }
        if !self.started && self.op.is_none() {
            progressed |= self.begin_start();
        }

        progressed |= self.readable.flush_signals();
        progressed |= self.readable.deliver();
        progressed |= self.readable.maybe_emit_readable();
        progressed |= self.readable.maybe_emit_end();
        progressed |= self.begin_fill();
        progressed
    }

    fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    fn fail_pending(&mut self, _error: Option<&StreamError>) {}

    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> Option<PlatformBoxFutureStatic<StreamResult<()>>> {
        let mut source = self.source.take()?;
        Some(Box::pin(async move { source.destroy(error).await }))
    }

    fn release(&mut self) {
        self.readable.release();
    }
}

pub struct ReadableBuilder<T: Chunk, S> {
    source: S,
    config: ReadableConfig<T>,
    signal: Option<AbortSignal>,
    auto_destroy: bool,
}

impl<T: Chunk, S: ReadableSource<T>> ReadableBuilder<T, S> {
    fn new(source: S) -> Self {
        Self {
            source,
            config: ReadableConfig::objects(),
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

    /// Measure, coalesce and split chunks by bytes instead of counting them.
    pub fn byte_mode(mut self) -> Self
    where
        T: ByteChunk,
    {
        self.config = self.config.into_bytes();
        self
    }

    /// Destroy the stream with [`StreamError::Aborted`] when `signal` fires.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Destroy automatically after `end` (default `true`).
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (Readable<T>, impl Future<Output = ()> + MaybeSend + 'static) {
        let lifecycle = SharedPtr::new(Lifecycle::new(true, false, self.auto_destroy));
        let readable = Readable::with_lifecycle(self.config, lifecycle.clone());
        if let Some(signal) = &self.signal {
            lifecycle::watch_signal(&lifecycle, signal);
        }
        let engine = ReadEngine::new(readable.clone(), self.source);
        (readable, lifecycle::drive(lifecycle, engine))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> Readable<T>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> Readable<T>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// ----------- Source Implementations -----------

/// Source with no transport behind it; data arrives through
/// [`Readable::push`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PushSource;

impl<T: Chunk> ReadableSource<T> for PushSource {
    fn read(
        &mut self,
        _size: usize,
        _controller: &mut ReadableController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(()))
    }
}

impl<T: Chunk> Readable<T> {
    /// Readable fed only through [`Readable::push`].
    pub fn pushable() -> ReadableBuilder<T, PushSource> {
        ReadableBuilder::new(PushSource)
    }
}

pub struct IteratorSource<I> {
    iter: I,
}

impl<T: Chunk, I> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn read(
        &mut self,
        _size: usize,
        controller: &mut ReadableController<T>,
    ) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => {
                controller.push(item);
            }
            None => controller.end(),
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<T: Chunk, S> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn read(
        &mut self,
        _size: usize,
        controller: &mut ReadableController<T>,
    ) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => {
                controller.push(item);
            }
            None => controller.end(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_util::{Log, log, settle};
    use futures::TryStreamExt;

    #[tokio_localset_test::localset_test]
    async fn pull_mode_exact_byte_read() {
        let readable: Readable<String> = Readable::pushable()
            .byte_mode()
            .spawn(tokio::task::spawn_local);

        readable.push(Some("abc".to_string()));
        readable.push(Some("de".to_string()));
        readable.push(None);

        assert_eq!(readable.read(Some(4)).unwrap().as_deref(), Some("abcd"));
        assert_eq!(readable.read(None).unwrap().as_deref(), Some("e"));
        assert_eq!(readable.read(None).unwrap(), None);

        readable.ended().await.expect("end emitted");
        assert!(readable.readable_ended());
        readable.closed().await.expect("closed cleanly");
    }

    #[tokio_localset_test::localset_test]
    async fn byte_read_waits_for_enough_data() {
        let readable: Readable<Vec<u8>> = Readable::pushable()
            .byte_mode()
            .spawn(tokio::task::spawn_local);

        readable.push(Some(vec![1, 2]));
        assert_eq!(readable.read(Some(3)).unwrap(), None);
        readable.push(Some(vec![3, 4]));
        assert_eq!(readable.read(Some(3)).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(readable.readable_length(), 1);
    }

    #[tokio_localset_test::localset_test]
    async fn push_reports_backpressure_at_high_water_mark() {
        let (readable, _driver) = Readable::<u32>::pushable().high_water_mark(2).prepare();
        assert!(readable.push(Some(1)));
        assert!(!readable.push(Some(2)));
        assert!(!readable.push(Some(3)));
        assert_eq!(readable.readable_length(), 3);
    }

    #[tokio_localset_test::localset_test]
    async fn push_after_eof_destroys_with_protocol_error() {
        let readable = Readable::<u32>::pushable().spawn(tokio::task::spawn_local);
        readable.push(None);
        assert!(!readable.push(Some(1)));
        let err = readable.closed().await.unwrap_err();
        assert!(matches!(err, StreamError::PushAfterEof));
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolMisuse);
    }

    #[tokio_localset_test::localset_test]
    async fn flowing_mode_delivers_everything_then_end_then_close() {
        let events: Log = log();
        let readable = Readable::from_iter(vec![1, 2, 3]).spawn(tokio::task::spawn_local);

        let data_log = events.clone();
        readable
            .on_data(move |n: i32| data_log.lock().unwrap().push(format!("data:{n}")))
            .unwrap();
        let end_log = events.clone();
        readable.on_end(move |_| end_log.lock().unwrap().push("end".into()));
        let close_log = events.clone();
        readable.on_close(move |_| close_log.lock().unwrap().push("close".into()));

        readable.closed().await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["data:1", "data:2", "data:3", "end", "close"]
        );
    }

    #[tokio_localset_test::localset_test]
    async fn data_is_never_delivered_synchronously() {
        let events: Log = log();
        let readable = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        let data_log = events.clone();
        readable
            .on_data(move |n| data_log.lock().unwrap().push(format!("data:{n}")))
            .unwrap();

        assert!(readable.push(Some(7)));
        assert!(events.lock().unwrap().is_empty());
        settle().await;
        assert_eq!(*events.lock().unwrap(), vec!["data:7"]);
    }

    #[tokio_localset_test::localset_test]
    async fn mode_selection_is_one_way() {
        let pulled = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        pulled.read(None).unwrap();
        assert!(matches!(
            pulled.on_data(|_| {}),
            Err(StreamError::ModeConflict(_))
        ));
        assert!(matches!(pulled.resume(), Err(StreamError::ModeConflict(_))));
        assert_eq!(pulled.readable_flowing(), Some(false));

        let flowing = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        assert_eq!(flowing.readable_flowing(), None);
        flowing.on_data(|_| {}).unwrap();
        assert_eq!(flowing.readable_flowing(), Some(true));
        assert!(matches!(
            flowing.read(None),
            Err(StreamError::ModeConflict(_))
        ));
    }

    #[tokio_localset_test::localset_test]
    async fn pause_buffers_until_resume() {
        let events: Log = log();
        let readable = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        let data_log = events.clone();
        readable
            .on_data(move |n| data_log.lock().unwrap().push(format!("data:{n}")))
            .unwrap();
        let pause_log = events.clone();
        readable.on_pause(move |_| pause_log.lock().unwrap().push("pause".into()));
        let resume_log = events.clone();
        readable.on_resume(move |_| resume_log.lock().unwrap().push("resume".into()));
        settle().await;

        readable.pause();
        readable.push(Some(1));
        settle().await;
        assert!(readable.is_paused());
        assert_eq!(readable.readable_length(), 1);

        readable.resume().unwrap();
        settle().await;
        assert_eq!(readable.readable_length(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["resume", "pause", "resume", "data:1"]
        );
    }

    #[tokio_localset_test::localset_test]
    async fn unshift_puts_data_back_in_front() {
        let (readable, _driver) = Readable::<u8>::pushable().prepare();
        readable.push(Some(2));
        readable.unshift(1);
        assert_eq!(readable.read(None).unwrap(), Some(1));
        assert_eq!(readable.read(None).unwrap(), Some(2));
    }

    #[tokio_localset_test::localset_test]
    async fn large_reads_grow_the_high_water_mark() {
        let (readable, _driver) = Readable::<Vec<u8>>::pushable()
            .byte_mode()
            .high_water_mark(16)
            .prepare();
        readable.read(Some(100)).unwrap();
        assert_eq!(readable.readable_high_water_mark(), 128);
        assert!(matches!(
            readable.read(Some(crate::MAX_HIGH_WATER_MARK + 1)),
            Err(StreamError::OutOfRange { .. })
        ));
    }

    #[tokio_localset_test::localset_test]
    async fn fill_stops_at_high_water_mark_in_pull_mode() {
        let readable = Readable::from_iter(0..100u32)
            .high_water_mark(4)
            .spawn(tokio::task::spawn_local);
        assert_eq!(readable.read(None).unwrap(), None);
        settle().await;
        assert_eq!(readable.readable_length(), 4);
        assert_eq!(readable.read(None).unwrap(), Some(0));
    }

    #[tokio_localset_test::localset_test]
    async fn stream_impl_collects_all_items() {
        let readable = Readable::from_iter(vec!["a", "b", "c"]).spawn(tokio::task::spawn_local);
        let items: Vec<&str> = readable.clone().try_collect().await.unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
        readable.closed().await.unwrap();
    }

    #[tokio_localset_test::localset_test]
    async fn from_stream_forwards_async_items() {
        let upstream = futures::stream::iter(vec![1u8, 2, 3]);
        let readable = Readable::from_stream(upstream).spawn(tokio::task::spawn_local);
        let items: Vec<u8> = readable.try_collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio_localset_test::localset_test]
    async fn failing_source_destroys_with_transport_error() {
        struct Broken;

        impl ReadableSource<u8> for Broken {
            async fn read(
                &mut self,
                _size: usize,
                _controller: &mut ReadableController<u8>,
            ) -> StreamResult<()> {
                Err("disk on fire".into())
            }
        }

        let events: Log = log();
        let readable = Readable::builder(Broken).spawn(tokio::task::spawn_local);
        let error_log = events.clone();
        readable.on_error(move |err| error_log.lock().unwrap().push(format!("error:{err}")));
        let close_log = events.clone();
        readable.on_close(move |_| close_log.lock().unwrap().push("close".into()));

        assert_eq!(readable.read(None).unwrap(), None);
        let err = readable.closed().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransportFailure);
        assert_eq!(*events.lock().unwrap(), vec!["error:disk on fire", "close"]);
        assert!(matches!(readable.read(None), Err(StreamError::Destroyed("read"))));
        assert_eq!(readable.errored().map(|e| e.to_string()).as_deref(), Some("disk on fire"));
    }

    #[tokio_localset_test::localset_test]
    async fn destroy_is_at_most_once() {
        let events: Log = log();
        let readable = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        let close_log = events.clone();
        readable.on_close(move |_| close_log.lock().unwrap().push("close".into()));

        readable.destroy(Some("first".into()));
        readable.destroy(Some("second".into()));
        readable.destroy(None);

        let err = readable.closed().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
        settle().await;
        assert_eq!(*events.lock().unwrap(), vec!["close"]);
        assert!(!readable.push(Some(1)));
        let err = readable.read(None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Destroyed);
        assert_eq!(readable.errored().map(|e| e.to_string()).as_deref(), Some("first"));
    }

    #[tokio_localset_test::localset_test]
    async fn destroy_cancels_a_pending_fill_and_runs_source_destroy() {
        struct Stalled {
            destroyed: Log,
        }

        impl ReadableSource<u8> for Stalled {
            async fn read(
                &mut self,
                _size: usize,
                _controller: &mut ReadableController<u8>,
            ) -> StreamResult<()> {
                future::pending::<()>().await;
                Ok(())
            }

            async fn destroy(&mut self, error: Option<StreamError>) -> StreamResult<()> {
                self.destroyed
                    .lock()
                    .unwrap()
                    .push(format!("destroy:{}", error.is_none()));
                Ok(())
            }
        }

        let destroyed = log();
        let readable = Readable::builder(Stalled {
            destroyed: destroyed.clone(),
        })
        .spawn(tokio::task::spawn_local);
        readable.read(None).unwrap();
        settle().await;
        readable.destroy(None);
        readable.closed().await.unwrap();
        assert_eq!(*destroyed.lock().unwrap(), vec!["destroy:true"]);
    }

    #[tokio_localset_test::localset_test]
    async fn abort_signal_destroys_readable() {
        let controller = crate::AbortController::new();
        let readable = Readable::<u8>::pushable()
            .signal(controller.signal())
            .spawn(tokio::task::spawn_local);
        controller.abort(Some("shutdown".into()));
        let err = readable.closed().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Cancellation);
    }

    #[tokio_localset_test::localset_test]
    async fn auto_destroy_disabled_keeps_stream_open() {
        let readable = Readable::from_iter(vec![1u8])
            .auto_destroy(false)
            .spawn(tokio::task::spawn_local);
        readable.on_data(|_| {}).unwrap();
        readable.ended().await.unwrap();
        settle().await;
        assert!(!readable.is_destroyed());
        readable.destroy(None);
        readable.closed().await.unwrap();
    }

    #[tokio_localset_test::localset_test]
    async fn readable_observer_drives_pull_consumption() {
        let events: Log = log();
        let readable = Readable::<u32>::pushable().spawn(tokio::task::spawn_local);
        let consumer = readable.clone();
        let readable_log = events.clone();
        readable
            .on_readable(move |_| {
                readable_log.lock().unwrap().push("readable".into());
                while let Ok(Some(n)) = consumer.read(None) {
                    readable_log.lock().unwrap().push(format!("read:{n}"));
                }
            })
            .unwrap();
        let end_log = events.clone();
        readable.on_end(move |_| end_log.lock().unwrap().push("end".into()));

        settle().await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(readable.readable_flowing(), Some(false));

        readable.push(Some(1));
        readable.push(Some(2));
        settle().await;
        readable.push(Some(3));
        readable.push(None);
        readable.closed().await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["readable", "read:1", "read:2", "readable", "read:3", "end"]
        );
    }

    #[tokio_localset_test::localset_test]
    async fn readable_observer_rejects_a_flowing_stream() {
        let readable = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        readable.on_data(|_| {}).unwrap();
        assert!(matches!(
            readable.on_readable(|_| {}),
            Err(StreamError::ModeConflict("on_readable"))
        ));
    }

    #[tokio_localset_test::localset_test]
    async fn once_listeners_fire_a_single_time() {
        let events: Log = log();
        let readable = Readable::<u8>::pushable().spawn(tokio::task::spawn_local);
        let readable_log = events.clone();
        readable
            .once_readable(move |_| readable_log.lock().unwrap().push("readable".into()))
            .unwrap();
        let close_log = events.clone();
        readable.once_close(move |_| close_log.lock().unwrap().push("close".into()));
        let error_log = events.clone();
        readable.once_error(move |err| error_log.lock().unwrap().push(format!("error:{err}")));

        readable.push(Some(1));
        settle().await;
        assert_eq!(readable.read(None).unwrap(), Some(1));
        assert_eq!(readable.read(None).unwrap(), None);
        readable.push(Some(2));
        settle().await;

        readable.destroy(Some("gone".into()));
        readable.closed().await.unwrap_err();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["readable", "error:gone", "close"]
        );
    }
}
