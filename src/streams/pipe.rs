//! Readable-to-writable wiring: forwards data, follows the destination's
//! backpressure, coordinates end of data and tears both ends down on error
//! or abort.
//!
//! Each `pipe` call creates one link, driven entirely by observers on the
//! two streams. A source with several links pauses while any destination
//! waits for `drain`.

use super::error::{StreamError, StreamResult};
use super::observer::ListenerId;
use super::readable::Readable;
use super::signal::AbortSignal;
use super::writable::Writable;
use super::Chunk;
use crate::platform::SharedPtr;
use futures::future;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// How a pipe behaves at the edges.
#[derive(Clone)]
pub struct PipeOptions {
    /// End the destination when the source ends (default `true`).
    pub end: bool,
    /// Destroy both ends with [`StreamError::Aborted`] when this fires.
    pub signal: Option<AbortSignal>,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            end: true,
            signal: None,
        }
    }
}

impl PipeOptions {
    /// Leave the destination open when the source ends.
    pub fn keep_open() -> Self {
        Self {
            end: false,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeState {
    Attached,
    Flowing,
    Paused,
    SourceEnded,
    DestinationErrored,
    Aborted,
    Detached,
}

struct LinkInner {
    state: PipeState,
    source_listeners: Vec<ListenerId>,
    dest_listeners: Vec<ListenerId>,
    abort: Option<(AbortSignal, ListenerId)>,
}

pub(crate) struct PipeLink<T: Chunk> {
    id: u64,
    dest: Writable<T>,
    inner: Mutex<LinkInner>,
}

impl<T: Chunk> PipeLink<T> {
    pub(crate) fn state(&self) -> PipeState {
        self.inner.lock().state
    }

    fn is_detached(&self) -> bool {
        self.state() == PipeState::Detached
    }

    fn transition(&self, next: PipeState) {
        let mut inner = self.inner.lock();
        if inner.state != PipeState::Detached && inner.state != next {
            trace!(pipe = self.id, from = ?inner.state, to = ?next, "pipe state change");
            inner.state = next;
        }
    }

    fn targets(&self, dest: &Writable<T>) -> bool {
        SharedPtr::ptr_eq(&self.dest.shared, &dest.shared)
    }
}

/// Pause `source` until the link's destination drains.
fn wait_for_drain<T: Chunk>(source: &Readable<T>, link: &PipeLink<T>) {
    if link.is_detached() {
        return;
    }
    source
        .shared
        .state
        .lock()
        .awaiting_drain
        .insert(link.id);
    link.transition(PipeState::Paused);
    debug!(pipe = link.id, "destination full, pausing source");
    source.pause();
    // The destination's driver may have drained before the wait was recorded.
    if !link.dest.writable_need_drain() {
        drained(source, link);
    }
}

fn drained<T: Chunk>(source: &Readable<T>, link: &PipeLink<T>) {
    if link.is_detached() {
        return;
    }
    let resume = {
        let mut state = source.shared.state.lock();
        state.awaiting_drain.remove(&link.id) && state.awaiting_drain.is_empty()
    };
    link.transition(PipeState::Flowing);
    if resume {
        debug!(pipe = link.id, "destination drained, resuming source");
        let _ = source.resume();
    }
}

/// Unsubscribe every listener of `link` and drop it from the source.
fn detach<T: Chunk>(source: &Readable<T>, link: &PipeLink<T>) {
    let (source_listeners, dest_listeners, abort) = {
        let mut inner = link.inner.lock();
        if inner.state == PipeState::Detached {
            return;
        }
        inner.state = PipeState::Detached;
        (
            std::mem::take(&mut inner.source_listeners),
            std::mem::take(&mut inner.dest_listeners),
            inner.abort.take(),
        )
    };
    for id in source_listeners {
        source.off(id);
    }
    for id in dest_listeners {
        link.dest.off(id);
    }
    if let Some((signal, id)) = abort {
        signal.off(id);
    }

    let (remaining, resume) = {
        let mut state = source.shared.state.lock();
        state.pipes.retain(|other| other.id != link.id);
        let released = state.awaiting_drain.remove(&link.id);
        (
            state.pipes.len(),
            released && state.awaiting_drain.is_empty(),
        )
    };
    debug!(pipe = link.id, remaining, "pipe detached");
    if source.is_destroyed() || source.readable_ended() {
        return;
    }
    if remaining == 0 {
        source.pause();
    } else if resume {
        let _ = source.resume();
    }
}

impl<T: Chunk> Readable<T> {
    /// Pipe into `dest` with default options.
    pub fn pipe(&self, dest: &Writable<T>) -> StreamResult<Writable<T>> {
        self.pipe_with(dest, PipeOptions::default())
    }

    /// Forward every chunk into `dest`, pausing while it needs a drain.
    ///
    /// Selects flowing mode, so it fails once the stream is being read in
    /// pull mode. Returns the destination for chaining.
    pub fn pipe_with(&self, dest: &Writable<T>, options: PipeOptions) -> StreamResult<Writable<T>> {
        let link = SharedPtr::new(PipeLink {
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            dest: dest.clone(),
            inner: Mutex::new(LinkInner {
                state: PipeState::Attached,
                source_listeners: Vec::new(),
                dest_listeners: Vec::new(),
                abort: None,
            }),
        });

        if let Some(signal) = &options.signal {
            if let Some(err) = signal.error() {
                debug!(pipe = link.id, "signal already aborted, destroying both ends");
                self.destroy(Some(err.clone()));
                dest.destroy(Some(err));
                return Ok(dest.clone());
            }
        }

        if self.readable_ended() {
            // `end` already went out and will not fire again.
            debug!(pipe = link.id, end = options.end, "source already ended");
            if options.end {
                let _ = dest.end(None);
            }
            return Ok(dest.clone());
        }

        let data = {
            let source = self.clone();
            let link = link.clone();
            self.on_data(move |chunk| {
                if link.is_detached() {
                    return;
                }
                if !link.dest.write(chunk) {
                    wait_for_drain(&source, &link);
                }
            })?
        };
        let end = {
            let source = self.clone();
            let link = link.clone();
            let end_dest = options.end;
            self.on_end(move |_| {
                link.transition(PipeState::SourceEnded);
                if end_dest {
                    debug!(pipe = link.id, "source ended, ending destination");
                    let _ = link.dest.end(None);
                } else {
                    detach(&source, &link);
                }
            })
        };
        let source_error = {
            let source = self.clone();
            let link = link.clone();
            self.on_error(move |err| {
                debug!(pipe = link.id, error = %err, "source failed, destroying destination");
                link.dest.destroy(Some(err));
                detach(&source, &link);
            })
        };
        let source_close = {
            let source = self.clone();
            let link = link.clone();
            self.on_close(move |_| detach(&source, &link))
        };
        let drain = {
            let source = self.clone();
            let link = link.clone();
            dest.on_drain(move |_| drained(&source, &link))
        };
        let dest_error = {
            let source = self.clone();
            let link = link.clone();
            dest.on_error(move |err| {
                link.transition(PipeState::DestinationErrored);
                debug!(pipe = link.id, error = %err, "destination failed, destroying source");
                source.destroy(Some(err));
                detach(&source, &link);
            })
        };
        let finish = {
            let source = self.clone();
            let link = link.clone();
            dest.on_finish(move |_| detach(&source, &link))
        };
        let dest_close = {
            let source = self.clone();
            let link = link.clone();
            dest.on_close(move |_| detach(&source, &link))
        };

        let abort = options.signal.map(|signal| {
            let source = self.clone();
            let target = link.clone();
            let id = signal.on_abort(move |err| {
                target.transition(PipeState::Aborted);
                debug!(pipe = target.id, "pipe aborted");
                source.destroy(Some(err.clone()));
                target.dest.destroy(Some(err));
                detach(&source, &target);
            });
            (signal, id)
        });

        {
            let mut inner = link.inner.lock();
            inner.source_listeners = vec![data, end, source_error, source_close];
            inner.dest_listeners = vec![drain, dest_error, finish, dest_close];
            inner.abort = abort;
        }
        self.shared.state.lock().pipes.push(link.clone());
        debug!(pipe = link.id, end = options.end, "pipe attached");

        if dest.writable_need_drain() {
            wait_for_drain(self, &link);
        } else {
            link.transition(PipeState::Flowing);
            self.resume()?;
        }
        Ok(dest.clone())
    }

    /// Detach the pipe into `dest`, or every pipe with `None`.
    pub fn unpipe(&self, dest: Option<&Writable<T>>) {
        let links: Vec<_> = self
            .shared
            .state
            .lock()
            .pipes
            .iter()
            .filter(|link| dest.is_none_or(|dest| link.targets(dest)))
            .cloned()
            .collect();
        for link in links {
            detach(self, &link);
        }
    }

    /// Pipe into `dest` and wait for the outcome: the destination's `finish`
    /// (or the source's `end` with `end: false`), or the first error.
    ///
    /// A source that closes before its end resolves
    /// [`StreamError::PrematureClose`] without touching the destination.
    pub async fn pipe_to(&self, dest: &Writable<T>, options: PipeOptions) -> StreamResult<()> {
        let signal = options.signal.clone();
        let end = options.end;
        self.pipe_with(dest, options)?;
        let outcome = async {
            if end {
                future::try_join(self.ended(), dest.finished())
                    .await
                    .map(|_| ())
            } else {
                self.ended().await
            }
        };
        match signal {
            Some(signal) => signal.wrap(outcome).await,
            None => outcome.await,
        }
    }
}

/// Pipe `source` into `dest` and wait until the destination finished.
///
/// Unlike a bare pipe, a source that closes before its end also fails the
/// destination, and any failure destroys both ends.
pub async fn pipeline<T: Chunk>(source: &Readable<T>, dest: &Writable<T>) -> StreamResult<()> {
    source.pipe(dest)?;
    let outcome = future::try_join(source.ended(), dest.finished())
        .await
        .map(|_| ());
    if let Err(err) = &outcome {
        debug!(error = %err, "pipeline failed");
        source.destroy(Some(err.clone()));
        dest.destroy(Some(err.clone()));
    }
    outcome
}
