//! Reference-counted tunnelled connection
//!
//! Establishing the tunnel is slow (an SSH handshake plus pool warm-up), so the
//! manager keeps it open while anyone holds a [`ReleaseHandle`] and for an idle
//! window after the last one is dropped. Establishment is single-flight:
//! concurrent acquirers await the same attempt.
//!
//! Every teardown (idle expiry, dispose, failed establishment) bumps a
//! generation counter and resets the reference count. Handles and timers from
//! an older generation are ignored when they release or fire.

use super::TunnelConnector;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PendingConnect<C> =
    Shared<BoxFuture<'static, std::result::Result<Arc<Established<C>>, String>>>;

struct Established<C: TunnelConnector> {
    tunnel: C::Tunnel,
    connection: C::Connection,
    torn_down: AtomicBool,
}

enum Phase<C: TunnelConnector> {
    Idle,
    Connecting(PendingConnect<C>),
    Ready(Arc<Established<C>>),
}

struct State<C: TunnelConnector> {
    phase: Phase<C>,
    refs: usize,
    idle_timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner<C: TunnelConnector> {
    connector: Arc<C>,
    idle_timeout: Duration,
    state: Mutex<State<C>>,
}

/// Lazily established, idle-expiring connection to the legacy store
pub struct TunnelledConnectionManager<C: TunnelConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: TunnelConnector> Clone for TunnelledConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: TunnelConnector> TunnelledConnectionManager<C> {
    pub fn new(connector: C, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                idle_timeout,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    refs: 0,
                    idle_timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Live references in the current generation
    pub fn reference_count(&self) -> usize {
        self.inner.state.lock().refs
    }

    /// True once the tunnel and pool are up
    pub fn is_established(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Ready(_))
    }

    /// Take a reference to the connection, establishing it if needed
    ///
    /// Cancels any pending idle teardown. Fails with
    /// [`Error::ConnectionUnavailable`] if establishment fails or the manager
    /// is disposed while this call waits.
    pub async fn acquire(&self) -> Result<ReleaseHandle<C>> {
        let (pending, guard) = {
            let mut state = self.inner.state.lock();
            state.refs += 1;
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
                debug!("Idle teardown cancelled");
            }

            let guard = RefGuard {
                inner: Arc::clone(&self.inner),
                generation: state.generation,
            };

            let in_flight = match &state.phase {
                Phase::Ready(established) => {
                    return Ok(ReleaseHandle {
                        connection: established.connection.clone(),
                        guard,
                    });
                }
                Phase::Connecting(pending) => Some(pending.clone()),
                Phase::Idle => None,
            };

            let pending = match in_flight {
                Some(pending) => pending,
                None => {
                    info!("Establishing legacy store connection");
                    let pending = Inner::establish(Arc::clone(&self.inner.connector))
                        .boxed()
                        .shared();
                    state.phase = Phase::Connecting(pending.clone());
                    pending
                }
            };
            (pending, guard)
        };

        let outcome = pending.await;

        let mut state = self.inner.state.lock();
        if state.generation != guard.generation {
            return Err(Error::ConnectionUnavailable(
                "connection was torn down while establishing".to_string(),
            ));
        }

        match outcome {
            Ok(established) => {
                if matches!(state.phase, Phase::Connecting(_)) {
                    info!("Legacy store connection ready");
                    state.phase = Phase::Ready(Arc::clone(&established));
                }
                Ok(ReleaseHandle {
                    connection: established.connection.clone(),
                    guard,
                })
            }
            Err(message) => {
                warn!("Legacy store connection failed: {}", message);
                state.phase = Phase::Idle;
                state.generation += 1;
                state.refs = 0;
                Err(Error::ConnectionUnavailable(message))
            }
        }
    }

    /// Run `f` with the connection, releasing it on every exit path
    pub async fn with_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(C::Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire().await?;
        let result = f(handle.connection().clone()).await;
        drop(handle);
        result
    }

    /// Tear everything down now; safe to call any number of times
    ///
    /// The next `acquire` establishes from scratch.
    pub async fn dispose(&self) {
        let (phase, timer) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.refs = 0;
            (
                std::mem::replace(&mut state.phase, Phase::Idle),
                state.idle_timer.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        match phase {
            Phase::Idle => debug!("Connection manager already idle"),
            Phase::Ready(established) => {
                info!("Disposing legacy store connection");
                self.inner.teardown(&established).await;
            }
            Phase::Connecting(pending) => {
                info!("Disposing legacy store connection mid-establishment");
                if let Ok(established) = pending.await {
                    self.inner.teardown(&established).await;
                }
            }
        }
    }
}

impl<C: TunnelConnector> Inner<C> {
    async fn establish(
        connector: Arc<C>,
    ) -> std::result::Result<Arc<Established<C>>, String> {
        let tunnel = connector.open_tunnel().await.map_err(|e| e.to_string())?;
        debug!("Tunnel open, connecting pool");

        let connection = match connector.open_pool(&tunnel).await {
            Ok(connection) => connection,
            Err(e) => {
                connector.close_tunnel(&tunnel).await;
                return Err(e.to_string());
            }
        };

        Ok(Arc::new(Established {
            tunnel,
            connection,
            torn_down: AtomicBool::new(false),
        }))
    }

    /// Close pool then tunnel; runs at most once per established connection
    async fn teardown(&self, established: &Established<C>) {
        if established.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing legacy store pool");
        self.connector.close_pool(&established.connection).await;
        debug!("Closing tunnel");
        self.connector.close_tunnel(&established.tunnel).await;
        info!("Legacy store connection torn down");
    }

    fn release(inner: &Arc<Self>, generation: u64) {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }

        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 || !matches!(state.phase, Phase::Ready(_)) {
            return;
        }

        if let Some(previous) = state.idle_timer.take() {
            previous.abort();
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No runtime available; idle teardown not scheduled");
            return;
        };

        let weak = Arc::downgrade(inner);
        let idle = inner.idle_timeout;
        debug!("Last reference released, idle teardown in {:?}", idle);
        state.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            Self::expire(weak, generation).await;
        }));
    }

    async fn expire(weak: Weak<Self>, generation: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let established = {
            let mut state = inner.state.lock();
            if state.generation != generation || state.refs > 0 {
                return;
            }
            // Our own handle; dropping it does not cancel this task
            state.idle_timer = None;
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Ready(established) => {
                    state.generation += 1;
                    established
                }
                other => {
                    state.phase = other;
                    return;
                }
            }
        };

        info!("Legacy store connection idle, tearing down");
        inner.teardown(&established).await;
    }
}

struct RefGuard<C: TunnelConnector> {
    inner: Arc<Inner<C>>,
    generation: u64,
}

impl<C: TunnelConnector> Drop for RefGuard<C> {
    fn drop(&mut self) {
        Inner::release(&self.inner, self.generation);
    }
}

/// A live reference to the connection
///
/// Dropping the handle releases the reference.
pub struct ReleaseHandle<C: TunnelConnector> {
    connection: C::Connection,
    guard: RefGuard<C>,
}

impl<C: TunnelConnector> ReleaseHandle<C> {
    pub fn connection(&self) -> &C::Connection {
        &self.connection
    }

    /// Release explicitly; equivalent to dropping
    pub fn release(self) {}
}

impl<C: TunnelConnector> fmt::Debug for ReleaseHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("generation", &self.guard.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const IDLE: Duration = Duration::from_secs(300);

    #[derive(Default)]
    struct FakeConnector {
        tunnels: AtomicUsize,
        fail_tunnel: AtomicBool,
        log: Mutex<Vec<&'static str>>,
    }

    impl FakeConnector {
        fn log(&self) -> Vec<&'static str> {
            self.log.lock().clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.log.lock().iter().filter(|e| **e == entry).count()
        }
    }

    #[async_trait]
    impl TunnelConnector for FakeConnector {
        type Tunnel = usize;
        type Connection = usize;

        async fn open_tunnel(&self) -> Result<usize> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_tunnel.load(Ordering::SeqCst) {
                return Err(Error::ConnectionUnavailable("bastion refused".to_string()));
            }
            self.log.lock().push("open_tunnel");
            Ok(self.tunnels.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn open_pool(&self, tunnel: &usize) -> Result<usize> {
            self.log.lock().push("open_pool");
            Ok(*tunnel)
        }

        async fn close_pool(&self, _connection: &usize) {
            self.log.lock().push("close_pool");
        }

        async fn close_tunnel(&self, _tunnel: &usize) {
            self.log.lock().push("close_tunnel");
        }
    }

    fn manager() -> TunnelledConnectionManager<FakeConnector> {
        TunnelledConnectionManager::new(FakeConnector::default(), IDLE)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_connects_once() {
        let manager = manager();

        let handles = futures::future::join_all((0..5).map(|_| manager.acquire())).await;
        assert!(handles.iter().all(|h| h.is_ok()));

        assert_eq!(manager.connector().tunnels.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connector().count("open_pool"), 1);
        assert_eq!(manager.reference_count(), 5);
        assert!(manager.is_established());

        drop(handles);
        assert_eq!(manager.reference_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_teardown_runs_once_in_order() {
        let manager = manager();

        let handle = manager.acquire().await.unwrap();
        handle.release();

        tokio::time::sleep(IDLE + Duration::from_millis(1)).await;
        assert_eq!(
            manager.connector().log(),
            vec!["open_tunnel", "open_pool", "close_pool", "close_tunnel"]
        );
        assert!(!manager.is_established());

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(manager.connector().count("close_pool"), 1);
        assert_eq!(manager.connector().count("close_tunnel"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_window_cancels_teardown() {
        let manager = manager();

        manager.acquire().await.unwrap().release();
        tokio::time::sleep(IDLE / 2).await;

        manager.acquire().await.unwrap().release();
        tokio::time::sleep(IDLE / 2 + Duration::from_millis(1)).await;

        assert_eq!(manager.connector().count("close_pool"), 0);
        assert!(manager.is_established());
        assert_eq!(manager.connector().tunnels.load(Ordering::SeqCst), 1);

        tokio::time::sleep(IDLE).await;
        assert_eq!(manager.connector().count("close_pool"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_after_teardown_rebuilds() {
        let manager = manager();

        manager.acquire().await.unwrap().release();
        tokio::time::sleep(IDLE + Duration::from_millis(1)).await;
        assert!(!manager.is_established());

        let handle = manager.acquire().await.unwrap();
        assert_eq!(*handle.connection(), 2);
        assert_eq!(manager.connector().tunnels.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let manager = manager();
        manager.dispose().await;

        let handle = manager.acquire().await.unwrap();
        manager.dispose().await;
        manager.dispose().await;
        drop(handle);

        assert_eq!(manager.connector().count("close_pool"), 1);
        assert_eq!(manager.connector().count("close_tunnel"), 1);
        assert_eq!(manager.reference_count(), 0);

        // The stale handle must not schedule a teardown of nothing
        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(manager.connector().count("close_pool"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_connection_releases_on_error() {
        let manager = manager();

        let result: Result<()> = manager
            .with_connection(|connection| async move {
                assert_eq!(connection, 1);
                Err(Error::TransientExecution("duplicate key".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::TransientExecution(_))));
        assert_eq!(manager.reference_count(), 0);

        let rows = manager.with_connection(|c| async move { Ok(c * 10) }).await.unwrap();
        assert_eq!(rows, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_is_connection_unavailable() {
        let manager = manager();
        manager.connector().fail_tunnel.store(true, Ordering::SeqCst);

        let results = futures::future::join_all((0..3).map(|_| manager.acquire())).await;
        for result in &results {
            assert!(matches!(result, Err(Error::ConnectionUnavailable(_))));
        }
        drop(results);
        assert_eq!(manager.reference_count(), 0);
        assert!(!manager.is_established());

        manager.connector().fail_tunnel.store(false, Ordering::SeqCst);
        let handle = manager.acquire().await.unwrap();
        assert_eq!(*handle.connection(), 1);
    }
}
