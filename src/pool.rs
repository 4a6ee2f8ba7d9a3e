//! Bounded outbound connection pool to the parent proxy.
//!
//! Connections are consumed, not returned: once handed to a caller by
//! `get()`, the pool no longer tracks them. This matches the fact that a
//! caller immediately writes a `CONNECT` or absolute-URI preamble onto the
//! socket, which makes it unsafe to reuse. A background task keeps the idle
//! queue topped up toward `min_size`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Anything readable/writable that the splice can drive; covers both plain
/// TCP and TLS-wrapped outbound sockets.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type Factory = Arc<dyn Fn() -> BoxFuture<Result<BoxedStream>> + Send + Sync>;

const REFILL_INTERVAL: Duration = Duration::from_millis(500);

/// An outbound socket to the parent proxy, handed to the caller exactly
/// once.
pub struct PooledConn {
    pub stream: BoxedStream,
    pub created_at: Instant,
}

struct PoolState {
    idle: VecDeque<PooledConn>,
    in_use_count: usize,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    factory: Factory,
    min_size: usize,
    max_size: usize,
}

/// A bounded pool of pre-established outbound connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Eagerly create `min_size` connections via `factory`. Fails with
    /// `UpstreamUnreachable` if none succeed. Spawns a background task that
    /// keeps the idle queue topped up toward `min_size`.
    pub async fn new(factory: Factory, min_size: usize, max_size: usize) -> Result<Self> {
        let mut idle = VecDeque::with_capacity(min_size);
        let mut failures = 0usize;
        for _ in 0..min_size {
            match factory().await {
                Ok(stream) => idle.push_back(PooledConn {
                    stream,
                    created_at: Instant::now(),
                }),
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "pool warmup connection failed");
                }
            }
        }
        if min_size > 0 && idle.is_empty() {
            return Err(Error::upstream_unreachable(
                "none of the pool warmup connections succeeded",
            ));
        }
        if failures > 0 {
            debug!(failures, requested = min_size, "partial pool warmup");
        }

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle,
                in_use_count: 0,
                shutdown: false,
            }),
            factory,
            min_size,
            max_size,
        });

        let refill_inner = inner.clone();
        tokio::spawn(async move {
            Pool::refill_loop(refill_inner).await;
        });

        Ok(Self { inner })
    }

    /// Hand out an idle connection, or open a fresh one up to `max_size`.
    pub async fn get(&self) -> Result<PooledConn> {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(Error::PoolExhausted);
            }
            if let Some(conn) = state.idle.pop_front() {
                state.in_use_count += 1;
                return Ok(conn);
            }
            if state.idle.len() + state.in_use_count >= self.inner.max_size {
                return Err(Error::PoolExhausted);
            }
            // Reserve the slot before dropping the lock so concurrent
            // callers racing the same headroom can't all pass this check
            // and drive `in_use_count` past `max_size`.
            state.in_use_count += 1;
        }

        match (self.inner.factory)().await {
            Ok(stream) => Ok(PooledConn {
                stream,
                created_at: Instant::now(),
            }),
            Err(e) => {
                let mut state = self.inner.state.lock();
                state.in_use_count -= 1;
                Err(e)
            }
        }
    }

    /// Close every idle connection and mark the pool shut down; subsequent
    /// `get()` calls fail with `PoolExhausted`.
    pub fn release_all(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        let closed = state.idle.len();
        state.idle.clear();
        debug!(closed, "pool released idle connections on shutdown");
    }

    async fn refill_loop(inner: Arc<PoolInner>) {
        let mut ticker = tokio::time::interval(REFILL_INTERVAL);
        loop {
            ticker.tick().await;
            let need = {
                let state = inner.state.lock();
                if state.shutdown {
                    return;
                }
                let live = state.idle.len() + state.in_use_count;
                if live < inner.min_size {
                    (inner.min_size - live).min(inner.max_size.saturating_sub(live))
                } else {
                    0
                }
            };
            for _ in 0..need {
                match (inner.factory)().await {
                    Ok(stream) => {
                        let mut state = inner.state.lock();
                        if state.shutdown {
                            return;
                        }
                        state.idle.push_back(PooledConn {
                            stream,
                            created_at: Instant::now(),
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "pool background refill connection failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    fn counting_factory(counter: Arc<AtomicUsize>, fail_after: usize) -> Factory {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n >= fail_after {
                    return Err(Error::upstream_unreachable("synthetic failure"));
                }
                let (a, _b) = duplex(64);
                Ok(Box::new(a) as BoxedStream)
            })
        })
    }

    #[tokio::test]
    async fn test_warmup_and_get() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(counting_factory(counter, 100), 2, 4).await.unwrap();
        let _c1 = pool.get().await.unwrap();
        let _c2 = pool.get().await.unwrap();
    }

    #[tokio::test]
    async fn test_warmup_failure_is_fatal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Pool::new(counting_factory(counter, 0), 2, 4).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pool_exhausted_past_max() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(counting_factory(counter, 100), 0, 1).await.unwrap();
        let _c1 = pool.get().await.unwrap();
        let result = pool.get().await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_release_all_fails_subsequent_get() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(counting_factory(counter, 100), 1, 4).await.unwrap();
        pool.release_all();
        let result = pool.get().await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }
}
