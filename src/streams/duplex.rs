use super::error::{StreamError, StreamResult};
use super::lifecycle::{self, Engine, Lifecycle};
use super::observer::ListenerId;
use super::readable::{ReadEngine, Readable, ReadableConfig, ReadableSource};
use super::signal::AbortSignal;
use super::writable::{EndCompletion, WritableConfig, WritableSink, WriteEngine, Writable};
use super::{ByteChunk, Chunk, Encoding, QueuingStrategy};
use crate::platform::{MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use std::future::Future;
use std::task::Context;
use tracing::debug;

/// A readable and a writable side behind one lifecycle: destroying either
/// side destroys both, and `close` fires once for the pair.
///
/// `I` is what gets written in, `O` what gets read out.
pub struct Duplex<I: Chunk, O: Chunk> {
    readable: Readable<O>,
    writable: Writable<I>,
}

impl<I: Chunk, O: Chunk> Clone for Duplex<I, O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<I: Chunk, O: Chunk> Duplex<I, O> {
    pub(crate) fn from_parts(readable: Readable<O>, writable: Writable<I>) -> Self {
        Self { readable, writable }
    }

    /// Returns a builder for a duplex over an independent source and sink
    pub fn builder<R, W>(source: R, sink: W) -> DuplexBuilder<I, O, R, W>
    where
        R: ReadableSource<O>,
        W: WritableSink<I>,
    {
        DuplexBuilder::new(source, sink)
    }

    pub fn readable(&self) -> &Readable<O> {
        &self.readable
    }

    pub fn writable(&self) -> &Writable<I> {
        &self.writable
    }

    pub fn into_parts(self) -> (Readable<O>, Writable<I>) {
        (self.readable, self.writable)
    }

    pub fn write(&self, chunk: I) -> bool {
        self.writable.write(chunk)
    }

    pub fn end(&self, chunk: Option<I>) -> EndCompletion {
        self.writable.end(chunk)
    }

    pub fn push(&self, chunk: Option<O>) -> bool {
        self.readable.push(chunk)
    }

    pub fn read(&self, size: Option<usize>) -> StreamResult<Option<O>> {
        self.readable.read(size)
    }

    /// Destroy both sides. Idempotent; only the first error is kept.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.readable.destroy(error);
    }

    pub fn is_destroyed(&self) -> bool {
        self.readable.is_destroyed()
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.readable.errored()
    }

    pub fn on_error<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(StreamError) + MaybeSend + 'static,
    {
        self.readable.on_error(f)
    }

    pub fn on_close<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(()) + MaybeSend + 'static,
    {
        self.readable.on_close(f)
    }

    pub fn once_error<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(StreamError) + MaybeSend + 'static,
    {
        self.readable.once_error(f)
    }

    pub fn once_close<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(()) + MaybeSend + 'static,
    {
        self.readable.once_close(f)
    }

    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        self.readable.closed()
    }
}

/// Both engines of a duplex, driven by one driver.
pub(crate) struct DuplexEngine<R, W> {
    read: R,
    write: W,
}

impl<R: Engine, W: Engine> Engine for DuplexEngine<R, W> {
    fn poll_work(&mut self, cx: &mut Context<'_>) -> bool {
        let read = self.read.poll_work(cx);
        let write = self.write.poll_work(cx);
        read || write
    }

    fn is_busy(&self) -> bool {
        self.read.is_busy() || self.write.is_busy()
    }

    fn fail_pending(&mut self, error: Option<&StreamError>) {
        self.write.fail_pending(error);
        self.read.fail_pending(error);
    }

    fn destroy(
        &mut self,
        error: Option<StreamError>,
    ) -> Option<PlatformBoxFutureStatic<StreamResult<()>>> {
        let read = self.read.destroy(error.clone());
        let write = self.write.destroy(error);
        match (read, write) {
            (Some(read), Some(write)) => Some(Box::pin(async move {
                let (read, write) = futures::future::join(read, write).await;
                read.and(write)
            })),
            (read, write) => read.or(write),
        }
    }

    fn release(&mut self) {
        self.read.release();
        self.write.release();
    }
}

/// Lifecycle settings shared by duplex and transform builders.
pub(crate) struct DuplexOptions {
    pub(crate) allow_half_open: bool,
    pub(crate) signal: Option<AbortSignal>,
    pub(crate) auto_destroy: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            allow_half_open: true,
            signal: None,
            auto_destroy: true,
        }
    }
}

/// Wire both sides to one lifecycle and driver. `make` builds the
/// primitives once the readable handle exists.
pub(crate) fn assemble<I, O, R, W, F>(
    readable: ReadableConfig<O>,
    writable: WritableConfig<I>,
    options: DuplexOptions,
    make: F,
) -> (Duplex<I, O>, impl Future<Output = ()> + MaybeSend + 'static)
where
    I: Chunk,
    O: Chunk,
    R: ReadableSource<O>,
    W: WritableSink<I>,
    F: FnOnce(&Readable<O>) -> (R, W),
{
    let lifecycle = SharedPtr::new(Lifecycle::new(true, true, options.auto_destroy));
    let readable = Readable::with_lifecycle(readable, lifecycle.clone());
    let writable = Writable::with_lifecycle(writable, lifecycle.clone());
    if let Some(signal) = &options.signal {
        lifecycle::watch_signal(&lifecycle, signal);
    }
    if !options.allow_half_open {
        let writable = writable.clone();
        readable.on_end(move |_| {
            if !writable.writable_ended() {
                debug!("readable side ended, ending writable side");
                let _ = writable.end(None);
            }
        });
    }
    let (source, sink) = make(&readable);
    let engine = DuplexEngine {
        read: ReadEngine::new(readable.clone(), source),
        write: WriteEngine::new(writable.clone(), sink),
    };
    (
        Duplex::from_parts(readable, writable),
        lifecycle::drive(lifecycle, engine),
    )
}

pub struct DuplexBuilder<I: Chunk, O: Chunk, R, W> {
    source: R,
    sink: W,
    readable: ReadableConfig<O>,
    writable: WritableConfig<I>,
    options: DuplexOptions,
}

impl<I, O, R, W> DuplexBuilder<I, O, R, W>
where
    I: Chunk,
    O: Chunk,
    R: ReadableSource<O>,
    W: WritableSink<I>,
{
    fn new(source: R, sink: W) -> Self {
        Self {
            source,
            sink,
            readable: ReadableConfig::objects(),
            writable: WritableConfig::objects(),
            options: DuplexOptions::default(),
        }
    }

    pub fn readable_strategy<Q: QueuingStrategy<O> + MaybeSend + 'static>(mut self, strategy: Q) -> Self {
        self.readable.set_strategy(strategy);
        self
    }

    pub fn readable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.readable.set_high_water_mark(high_water_mark);
        self
    }

    pub fn readable_byte_mode(mut self) -> Self
    where
        O: ByteChunk,
    {
        self.readable = self.readable.into_bytes();
        self
    }

    pub fn writable_strategy<Q: QueuingStrategy<I> + MaybeSend + 'static>(mut self, strategy: Q) -> Self {
        self.writable.set_strategy(strategy);
        self
    }

    pub fn writable_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.writable.set_high_water_mark(high_water_mark);
        self
    }

    pub fn writable_byte_mode(mut self) -> Self
    where
        I: ByteChunk,
    {
        self.writable = self.writable.into_bytes();
        self
    }

    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.writable.set_default_encoding(encoding);
        self
    }

    /// Keep the writable side open after the readable side ended
    /// (default `true`).
    pub fn allow_half_open(mut self, allow: bool) -> Self {
        self.options.allow_half_open = allow;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.options.signal = Some(signal);
        self
    }

    /// Destroy automatically once both `end` and `finish` happened
    /// (default `true`).
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.options.auto_destroy = enabled;
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (Duplex<I, O>, impl Future<Output = ()> + MaybeSend + 'static) {
        let Self {
            source,
            sink,
            readable,
            writable,
            options,
        } = self;
        assemble(readable, writable, options, move |_| (source, sink))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, Ret>(self, spawn_fn: F) -> Duplex<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> Ret,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, Ret>(self, spawn_fn: &'static F) -> Duplex<I, O>
    where
        F: Fn(PlatformFuture<'static, ()>) -> Ret,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::readable::PushSource;
    use crate::streams::test_util::{Log, RecordingSink, log, settle};

    #[tokio_localset_test::localset_test]
    async fn sides_work_independently() {
        let sink = RecordingSink::new();
        let duplex: Duplex<&str, u32> =
            Duplex::builder(PushSource, sink.clone()).spawn(tokio::task::spawn_local);

        duplex.push(Some(1));
        duplex.write("out");
        settle().await;
        assert_eq!(duplex.read(None).unwrap(), Some(1));
        assert_eq!(sink.written(), vec!["out"]);
        assert!(!duplex.is_destroyed());
    }

    #[tokio_localset_test::localset_test]
    async fn error_on_one_side_destroys_both() {
        let events: Log = log();
        let sink = RecordingSink::new().fail_on("bad");
        let duplex: Duplex<&str, u32> =
            Duplex::builder(PushSource, sink).spawn(tokio::task::spawn_local);
        let close_log = events.clone();
        duplex.on_close(move |_| close_log.lock().unwrap().push("close".into()));

        duplex.write("bad");
        let err = duplex.closed().await.unwrap_err();
        assert_eq!(err.to_string(), "write failed: bad");
        assert!(duplex.readable().is_destroyed());
        assert!(!duplex.push(Some(1)));
        assert_eq!(*events.lock().unwrap(), vec!["close"]);
    }

    #[tokio_localset_test::localset_test]
    async fn auto_destroy_waits_for_both_sides() {
        let duplex: Duplex<&str, u32> = Duplex::builder(PushSource, RecordingSink::new())
            .spawn(tokio::task::spawn_local);
        duplex.readable().on_data(|_| {}).unwrap();
        duplex.push(None);
        duplex.readable().ended().await.unwrap();
        settle().await;
        assert!(!duplex.is_destroyed());

        duplex.end(None).await.unwrap();
        duplex.closed().await.unwrap();
    }

    #[tokio_localset_test::localset_test]
    async fn half_open_disabled_ends_writable_with_readable() {
        let duplex: Duplex<&str, u32> = Duplex::builder(PushSource, RecordingSink::new())
            .allow_half_open(false)
            .spawn(tokio::task::spawn_local);
        duplex.readable().on_data(|_| {}).unwrap();
        duplex.push(None);
        duplex.writable().finished().await.unwrap();
        duplex.closed().await.unwrap();
    }

    #[tokio_localset_test::localset_test]
    async fn half_open_disabled_with_writable_ending_first() {
        let sink = RecordingSink::new();
        let duplex: Duplex<&str, u32> = Duplex::builder(PushSource, sink.clone())
            .allow_half_open(false)
            .spawn(tokio::task::spawn_local);
        let errors: Log = log();
        let error_log = errors.clone();
        duplex.on_error(move |err| error_log.lock().unwrap().push(err.to_string()));

        duplex.write("last");
        duplex.end(None).await.unwrap();
        settle().await;
        assert!(duplex.writable().writable_finished());
        assert!(!duplex.readable().readable_ended());
        assert!(!duplex.is_destroyed());

        duplex.readable().on_data(|_| {}).unwrap();
        duplex.push(Some(9));
        duplex.push(None);
        duplex.readable().ended().await.unwrap();
        duplex.closed().await.unwrap();
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(sink.written(), vec!["last"]);
    }

    #[tokio_localset_test::localset_test]
    async fn destroy_runs_both_destroy_primitives() {
        let sink = RecordingSink::new();
        let duplex: Duplex<&str, u32> =
            Duplex::builder(PushSource, sink.clone()).spawn(tokio::task::spawn_local);
        duplex.destroy(Some("stop".into()));
        let err = duplex.closed().await.unwrap_err();
        assert_eq!(err.to_string(), "stop");
        assert!(sink.destroyed());
        assert!(duplex.writable().is_closed());
    }
}
