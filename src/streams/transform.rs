use super::duplex::{self, Duplex, DuplexOptions};
use super::error::{StreamError, StreamResult};
use super::readable::{PushSource, Readable, ReadableConfig};
use super::signal::AbortSignal;
use super::writable::{WritableConfig, WritableController, WritableSink};
use super::{ByteChunk, Chunk, Encoding, QueuingStrategy};
use crate::platform::{MaybeSend, PlatformFuture};
use futures::future::{self, poll_fn};
use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::task::Poll;
use tracing::{debug, trace};

/// Transformer trait
pub trait Transformer<I: Chunk, O: Chunk>: MaybeSend + Sized + 'static {
    /// Called once before the first chunk
    fn start(
        &mut self,
        controller: &mut TransformController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        encoding: Encoding,
        controller: &mut TransformController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called after the last chunk, before the readable side ends
    fn flush(
        &mut self,
        controller: &mut TransformController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }
}

/// Controller for transform operations
pub struct TransformController<O: Chunk> {
    readable: Readable<O>,
}

impl<O: Chunk> Clone for TransformController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
        }
    }
}

impl<O: Chunk> TransformController<O> {
    /// Push output to the readable side; `false` signals backpressure.
    pub fn push(&self, chunk: O) -> bool {
        self.readable.push(Some(chunk))
    }

    pub fn push_encoded(&self, chunk: O, encoding: Encoding) -> bool {
        self.readable.push_encoded(chunk, encoding)
    }

    /// Destroy both sides with `error`.
    pub fn error(&self, error: StreamError) {
        self.readable.destroy(Some(error));
    }

    /// End the readable side early. Later writes are accepted but dropped,
    /// and `flush` is skipped.
    pub fn terminate(&self) {
        debug!("transform terminated");
        self.readable.push(None);
    }

    /// Room left on the readable side; negative when over its high-water mark.
    pub fn desired_size(&self) -> isize {
        self.readable.readable_high_water_mark() as isize - self.readable.readable_length() as isize
    }

    pub fn is_destroyed(&self) -> bool {
        self.readable.is_destroyed()
    }
}

/// Commit primitive of a transform: runs the transformer and holds the
/// write until the readable side has room again.
struct TransformSink<I, O: Chunk, T> {
    transformer: T,
    controller: TransformController<O>,
    _input: PhantomData<fn(I)>,
}

impl<I: Chunk, O: Chunk, T: Transformer<I, O>> TransformSink<I, O, T> {
    fn room(&self) -> impl Future<Output = ()> + MaybeSend + 'static {
        let readable = self.controller.readable.clone();
        poll_fn(move |cx| {
            readable.shared.lifecycle.register(cx.waker());
            if readable.has_room() || readable.is_destroyed() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}

impl<I: Chunk, O: Chunk, T: Transformer<I, O>> WritableSink<I> for TransformSink<I, O, T> {
    async fn start(&mut self, _controller: &mut WritableController) -> StreamResult<()> {
        self.transformer.start(&mut self.controller).await
    }

    async fn write(
        &mut self,
        chunk: I,
        encoding: Encoding,
        _controller: &mut WritableController,
    ) -> StreamResult<()> {
        if self.controller.readable.is_eof() {
            trace!("transform already terminated, dropping chunk");
            return Ok(());
        }
        self.transformer
            .transform(chunk, encoding, &mut self.controller)
            .await?;
        self.room().await;
        Ok(())
    }

    async fn finalize(&mut self, _controller: &mut WritableController) -> StreamResult<()> {
        if self.controller.readable.is_eof() {
            return Ok(());
        }
        self.transformer.flush(&mut self.controller).await?;
        self.controller.readable.push(None);
        Ok(())
    }
}

/// A duplex whose readable side is fed by running every written chunk
/// through a [`Transformer`].
pub struct Transform<I: Chunk, O: Chunk> {
    inner: Duplex<I, O>,
}

impl<I: Chunk, O: Chunk> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: Chunk, O: Chunk> Deref for Transform<I, O> {
    type Target = Duplex<I, O>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<I: Chunk, O: Chunk> Transform<I, O> {
    /// Returns a builder for a transform around `transformer`
    pub fn builder<T: Transformer<I, O>>(transformer: T) -> TransformBuilder<I, O, T> {
        TransformBuilder::new(transformer)
    }

    pub fn into_duplex(self) -> Duplex<I, O> {
        self.inner
    }
}

impl<T: Chunk> Transform<T, T> {
    /// Transform that forwards every chunk unchanged.
    pub fn pass_through() -> TransformBuilder<T, T, IdentityTransformer<T>> {
        TransformBuilder::new(IdentityTransformer::new())
    }
}

pub struct TransformBuilder<I: Chunk, O: Chunk, T> {
    transformer: T,
    readable: ReadableConfig<O>,
    writable: WritableConfig<I>,
    options: DuplexOptions,
}

impl<I: Chunk, O: Chunk, T: Transformer<I, O>> TransformBuilder<I, O, T> {
    fn new(transformer: T) -> Self {
        Self {
            transformer,
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

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.options.signal = Some(signal);
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.options.auto_destroy = enabled;
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (Transform<I, O>, impl Future<Output = ()> + MaybeSend + 'static) {
        let Self {
            transformer,
            readable,
            writable,
            options,
        } = self;
        let (inner, driver) = duplex::assemble(readable, writable, options, move |readable| {
            let sink = TransformSink {
                transformer,
                controller: TransformController {
                    readable: readable.clone(),
                },
                _input: PhantomData,
            };
            (PushSource, sink)
        });
        (Transform { inner }, driver)
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> Transform<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> Transform<I, O>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

/// Identity transformer that passes chunks through unchanged
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn(T)>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Chunk> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        encoding: Encoding,
        controller: &mut TransformController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        controller.push_encoded(chunk, encoding);
        future::ready(Ok(()))
    }
}
