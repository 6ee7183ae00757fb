//! Readable/writable stream pair backing every procedure invocation.
//!
//! A `Readable` is the single-consumer queue of responses for one stream;
//! a `Writable` wraps the send path for requests. Both ends are cheap
//! clones of shared state so dispatch listeners and the caller can hold
//! the same stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use river_protocol::{RiverResult, error_codes};
use serde_json::Value;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("readable is closed")]
    ReadableClosed,
    #[error("readable is already locked")]
    AlreadyLocked,
    #[error("writable is closed")]
    WritableClosed,
}

// ---------------------------------------------------------------------------
// Readable
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ReadableState {
    queue: VecDeque<RiverResult>,
    closed: bool,
    broken: bool,
    broken_delivered: bool,
    locked: bool,
}

/// Async readable stream of procedure results.
///
/// Values are delivered in push order. Once closed and drained, reads
/// terminate. A broken readable yields exactly one synthesized
/// `READABLE_BROKEN` error and then terminates.
#[derive(Clone)]
pub struct Readable {
    inner: Arc<ReadableInner>,
}

struct ReadableInner {
    state: Mutex<ReadableState>,
    notify: Notify,
}

impl Default for Readable {
    fn default() -> Self {
        Readable::new()
    }
}

impl Readable {
    pub fn new() -> Self {
        Readable {
            inner: Arc::new(ReadableInner {
                state: Mutex::new(ReadableState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReadableState> {
        // The queue mutex is only held for non-blocking bookkeeping, so a
        // poisoned lock can only come from a panicking test assertion.
        self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enqueue a value and wake a waiting reader. Fails once closed.
    pub(crate) fn push(&self, value: RiverResult) -> Result<(), StreamError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(StreamError::ReadableClosed);
            }
            state.queue.push_back(value);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Close the stream. Fails if already closed; wakes all waiters.
    pub(crate) fn close(&self) -> Result<(), StreamError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(StreamError::ReadableClosed);
            }
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Close the stream if it is still open.
    pub(crate) fn close_if_open(&self) {
        let _ = self.close();
    }

    /// Break the stream, discarding all queued values.
    ///
    /// On an already-done stream this is a no-op; otherwise the next read
    /// yields exactly one synthesized `READABLE_BROKEN` error and the
    /// stream then reads as done.
    pub fn break_stream(&self) {
        {
            let mut state = self.lock_state();
            if state.closed && state.queue.is_empty() {
                return;
            }
            state.broken = true;
            state.locked = true;
            state.queue.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether iteration can still be acquired (not locked or broken).
    pub fn is_readable(&self) -> bool {
        let state = self.lock_state();
        !state.locked && !state.broken
    }

    /// Whether the stream is done: closed with nothing left to read.
    pub fn is_closed(&self) -> bool {
        let state = self.lock_state();
        state.closed && state.queue.is_empty()
    }

    /// Cooperative read of the next value.
    ///
    /// Returns `None` once the stream is done.
    pub async fn next(&self) -> Option<RiverResult> {
        loop {
            // Register interest before checking state so a close/break
            // landing in between cannot be missed.
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                if state.broken {
                    if state.broken_delivered {
                        return None;
                    }
                    state.broken_delivered = true;
                    return Some(RiverResult::err(
                        error_codes::READABLE_BROKEN,
                        "stream was broken",
                    ));
                }
                if let Some(value) = state.queue.pop_front() {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Acquire exclusive iteration over the stream.
    ///
    /// Fails if the stream is already locked by `iter`, `collect`, or a
    /// break.
    pub fn iter(&self) -> Result<ReadableIter, StreamError> {
        self.acquire_lock()?;
        Ok(ReadableIter {
            readable: self.clone(),
        })
    }

    /// Drain the stream to close, returning every value in order.
    ///
    /// Fails if the stream is already locked.
    pub async fn collect(&self) -> Result<Vec<RiverResult>, StreamError> {
        self.acquire_lock()?;
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value);
        }
        Ok(values)
    }

    fn acquire_lock(&self) -> Result<(), StreamError> {
        let mut state = self.lock_state();
        if state.locked {
            return Err(StreamError::AlreadyLocked);
        }
        state.locked = true;
        Ok(())
    }
}

/// Exclusive iterator over a [`Readable`].
pub struct ReadableIter {
    readable: Readable,
}

impl ReadableIter {
    pub async fn next(&mut self) -> Option<RiverResult> {
        self.readable.next().await
    }
}

// ---------------------------------------------------------------------------
// Writable
// ---------------------------------------------------------------------------

type WriteFn = Box<dyn Fn(Value) + Send + Sync>;
type CloseFn = Box<dyn FnOnce() + Send>;

struct WritableState {
    closed: bool,
    close_fn: Option<CloseFn>,
}

/// Writable stream of procedure requests.
///
/// Wraps a write callback and an at-most-once close callback.
#[derive(Clone)]
pub struct Writable {
    inner: Arc<WritableInner>,
}

struct WritableInner {
    write_fn: WriteFn,
    state: Mutex<WritableState>,
}

impl Writable {
    pub fn new(write_fn: impl Fn(Value) + Send + Sync + 'static, close_fn: Option<CloseFn>) -> Self {
        Writable {
            inner: Arc::new(WritableInner {
                write_fn: Box::new(write_fn),
                state: Mutex::new(WritableState {
                    closed: false,
                    close_fn,
                }),
            }),
        }
    }

    /// A pre-closed writable that drops everything, for short-circuited
    /// dispatches.
    pub(crate) fn sealed() -> Self {
        let writable = Writable::new(|_| {}, None);
        writable.seal();
        writable
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WritableState> {
        self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Write a value. Fails once closed.
    pub fn write(&self, value: Value) -> Result<(), StreamError> {
        if self.lock_state().closed {
            return Err(StreamError::WritableClosed);
        }
        (self.inner.write_fn)(value);
        Ok(())
    }

    /// Close the stream. Idempotent; the close callback runs at most once.
    pub fn close(&self) {
        let close_fn = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_fn.take()
        };
        if let Some(close_fn) = close_fn {
            close_fn();
        }
    }

    /// Close the stream, writing a final value first.
    pub fn close_with(&self, final_value: Value) {
        let close_fn = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_fn.take()
        };
        (self.inner.write_fn)(final_value);
        if let Some(close_fn) = close_fn {
            close_fn();
        }
    }

    /// Mark the stream closed without running the close callback.
    ///
    /// Used when the peer or the session already tore the stream down and
    /// no close envelope should go out.
    pub(crate) fn seal(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        state.close_fn = None;
    }

    pub fn is_writable(&self) -> bool {
        !self.lock_state().closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }
}
