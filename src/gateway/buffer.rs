//! Client-side stream buffering
//!
//! Decouples the upstream read rate from the client drain rate. A relay task
//! pulls from the upstream stream into a byte queue; the consumer side is a
//! `Stream` the HTTP response body polls.
//!
//! Policies:
//! - fixed: hard byte cap, upstream reads block when the client lags
//! - adaptive: the cap doubles while the client is slower than upstream and
//!   halves back once the client catches up

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::Notify;
use tracing::debug;

/// Adaptive cap bounds.
const ADAPTIVE_MIN_BYTES: usize = 512 * 1024;
const ADAPTIVE_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Queue drained below cap/4 counts as "caught up".
const SHRINK_DIVISOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Fixed,
    Adaptive,
}

struct RelayState {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    cap: usize,
    policy: Policy,
    finished: bool,
    error: Option<io::Error>,
    waker: Option<Waker>,
}

impl RelayState {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

pub struct BufferedRelay {
    state: Arc<Mutex<RelayState>>,
    space: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl BufferedRelay {
    pub fn adaptive<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Self::start(source, Policy::Adaptive, ADAPTIVE_MIN_BYTES)
    }

    pub fn fixed<S>(source: S, cap: usize) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Self::start(source, Policy::Fixed, cap.max(188))
    }

    fn start<S>(source: S, policy: Policy, cap: usize) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(RelayState {
            queue: VecDeque::new(),
            queued_bytes: 0,
            cap,
            policy,
            finished: false,
            error: None,
            waker: None,
        }));
        let space = Arc::new(Notify::new());

        let task = tokio::spawn(relay_task(source, state.clone(), space.clone()));
        Self { state, space, task }
    }
}

async fn relay_task<S>(source: S, state: Arc<Mutex<RelayState>>, space: Arc<Notify>)
where
    S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
    futures_util::pin_mut!(source);

    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                let len = chunk.len();
                loop {
                    {
                        let mut guard = state.lock().expect("relay lock poisoned");
                        if guard.queued_bytes + len <= guard.cap {
                            guard.queue.push_back(chunk);
                            guard.queued_bytes += len;
                            guard.wake();
                            break;
                        }
                        // Client is slower than upstream
                        if guard.policy == Policy::Adaptive && guard.cap < ADAPTIVE_MAX_BYTES {
                            guard.cap = (guard.cap * 2).min(ADAPTIVE_MAX_BYTES);
                            debug!(cap = guard.cap, "buffer grown");
                            continue;
                        }
                        guard.wake();
                    }
                    // Cap reached: wait for the consumer to drain
                    space.notified().await;
                }
            }
            Err(e) => {
                let mut guard = state.lock().expect("relay lock poisoned");
                guard.error = Some(e);
                guard.finished = true;
                guard.wake();
                return;
            }
        }
    }

    let mut guard = state.lock().expect("relay lock poisoned");
    guard.finished = true;
    guard.wake();
}

impl Stream for BufferedRelay {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut guard = this.state.lock().expect("relay lock poisoned");

        if let Some(chunk) = guard.queue.pop_front() {
            guard.queued_bytes -= chunk.len();

            // Caught up: relax an adaptively grown cap
            if guard.policy == Policy::Adaptive
                && guard.cap > ADAPTIVE_MIN_BYTES
                && guard.queued_bytes < guard.cap / SHRINK_DIVISOR
            {
                guard.cap = (guard.cap / 2).max(ADAPTIVE_MIN_BYTES);
                debug!(cap = guard.cap, "buffer shrunk");
            }

            drop(guard);
            this.space.notify_one();
            return Poll::Ready(Some(Ok(chunk)));
        }

        if let Some(error) = guard.error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        if guard.finished {
            return Poll::Ready(None);
        }

        guard.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for BufferedRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
