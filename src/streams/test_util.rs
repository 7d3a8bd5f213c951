use super::error::StreamResult;
use super::writable::{WritableController, WritableSink};
use super::{Chunk, Encoding, StreamError};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Yield long enough for every spawned driver to go idle.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Debug output without the quotes around string chunks.
pub(crate) fn describe<T: Debug>(chunk: &T) -> String {
    format!("{chunk:?}").trim_matches('"').to_string()
}

struct Recorded<T> {
    written: Vec<T>,
    encodings: Vec<Encoding>,
    batches: Vec<Vec<T>>,
    started: usize,
    destroyed: bool,
}

/// Sink that records what it commits, with optional latency and failure.
pub(crate) struct RecordingSink<T> {
    recorded: Arc<Mutex<Recorded<T>>>,
    delay: usize,
    vectored: bool,
    fail_on: Option<T>,
    log: Option<Log>,
}

impl<T: Clone> Clone for RecordingSink<T> {
    fn clone(&self) -> Self {
        Self {
            recorded: self.recorded.clone(),
            delay: self.delay,
            vectored: self.vectored,
            fail_on: self.fail_on.clone(),
            log: self.log.clone(),
        }
    }
}

impl<T: Clone> RecordingSink<T> {
    pub(crate) fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded {
                written: Vec::new(),
                encodings: Vec::new(),
                batches: Vec::new(),
                started: 0,
                destroyed: false,
            })),
            delay: 0,
            vectored: false,
            fail_on: None,
            log: None,
        }
    }

    /// Yield `ticks` times inside every commit.
    pub(crate) fn with_delay(mut self, ticks: usize) -> Self {
        self.delay = ticks;
        self
    }

    pub(crate) fn vectored(mut self) -> Self {
        self.vectored = true;
        self
    }

    pub(crate) fn fail_on(mut self, chunk: T) -> Self {
        self.fail_on = Some(chunk);
        self
    }

    pub(crate) fn with_log(mut self, log: Log) -> Self {
        self.log = Some(log);
        self
    }

    pub(crate) fn written(&self) -> Vec<T> {
        self.recorded.lock().unwrap().written.clone()
    }

    pub(crate) fn encodings(&self) -> Vec<Encoding> {
        self.recorded.lock().unwrap().encodings.clone()
    }

    pub(crate) fn batches(&self) -> Vec<Vec<T>> {
        self.recorded.lock().unwrap().batches.clone()
    }

    /// Number of commits that began.
    pub(crate) fn started(&self) -> usize {
        self.recorded.lock().unwrap().started
    }

    pub(crate) fn destroyed(&self) -> bool {
        self.recorded.lock().unwrap().destroyed
    }

    fn note(&self, entry: String) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(entry);
        }
    }
}

impl<T: Chunk + Debug + PartialEq> RecordingSink<T> {
    async fn commit(&mut self, chunk: T, encoding: Encoding) -> StreamResult<()> {
        self.recorded.lock().unwrap().started += 1;
        for _ in 0..self.delay {
            tokio::task::yield_now().await;
        }
        if self.fail_on.as_ref() == Some(&chunk) {
            return Err(StreamError::from(format!("write failed: {}", describe(&chunk))));
        }
        self.note(format!("write:{}", describe(&chunk)));
        let mut recorded = self.recorded.lock().unwrap();
        recorded.written.push(chunk);
        recorded.encodings.push(encoding);
        Ok(())
    }
}

impl<T: Chunk + Debug + PartialEq> WritableSink<T> for RecordingSink<T> {
    async fn write(
        &mut self,
        chunk: T,
        encoding: Encoding,
        _controller: &mut WritableController,
    ) -> StreamResult<()> {
        self.commit(chunk, encoding).await
    }

    fn is_vectored(&self) -> bool {
        self.vectored
    }

    async fn write_vectored(
        &mut self,
        chunks: Vec<(T, Encoding)>,
        _controller: &mut WritableController,
    ) -> StreamResult<()> {
        let batch = chunks.iter().map(|(chunk, _)| chunk.clone()).collect();
        self.recorded.lock().unwrap().batches.push(batch);
        for (chunk, encoding) in chunks {
            self.commit(chunk, encoding).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self, _controller: &mut WritableController) -> StreamResult<()> {
        self.note("finalize".to_string());
        Ok(())
    }

    async fn destroy(&mut self, _error: Option<StreamError>) -> StreamResult<()> {
        self.recorded.lock().unwrap().destroyed = true;
        Ok(())
    }
}
