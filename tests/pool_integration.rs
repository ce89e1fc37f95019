//! Integration tests for the session pool
//!
//! These drive the public API against the in-memory service and check the
//! pool's accounting in the scenarios that matter under load.

use htpool::pool::{ConnectionPool, Outcome, PoolConfig, PoolError, SessionKind};
use htpool::transport::MemoryService;
use htpool::{Config, Core};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pool(capacity: usize, overflow_limit: usize, acquire_timeout: Option<Duration>) -> (ConnectionPool, MemoryService) {
    let service = MemoryService::new();
    let config = PoolConfig {
        capacity,
        overflow_limit,
        connect_timeout: Duration::from_secs(1),
        acquire_timeout,
    };
    let pool = ConnectionPool::new(config, Arc::new(service.clone())).unwrap();
    (pool, service)
}

async fn wait_for_waiters(pool: &ConnectionPool, n: usize) {
    while pool.stats().waiting < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_overflow_then_block_then_poisoned_release_unblocks() {
    let (pool, service) = pool(2, 1, None);

    let (a, b, c) = tokio::join!(pool.acquire(), pool.acquire(), pool.acquire());
    let sessions = vec![a.unwrap(), b.unwrap(), c.unwrap()];

    let stats = pool.stats();
    assert_eq!(stats.pooled, 2);
    assert_eq!(stats.overflow, 1);
    assert_eq!(service.live_connections(), 3);

    // A fourth acquire blocks
    let fourth = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    wait_for_waiters(&pool, 1).await;
    assert!(!fourth.is_finished());

    // Release the overflow session as poisoned
    let (overflow, rest): (Vec<_>, Vec<_>) = sessions
        .into_iter()
        .partition(|s| pool.kind_of(s.id()) == Some(SessionKind::Overflow));
    let overflow = overflow.into_iter().next().unwrap();
    let overflow_id = overflow.id();
    pool.release(overflow, true).await.unwrap();

    // The overflow count is released once for the closed session and taken
    // again by the waiter, which opens a fresh session into the same slot
    let fresh = fourth.await.unwrap().unwrap();
    assert_ne!(fresh.id(), overflow_id);
    assert_eq!(service.stats().connects, 4);
    assert_eq!(service.stats().disconnects, 1);

    let stats = pool.stats();
    assert_eq!(stats.live(), 3);
    assert_eq!(stats.overflow, 1);
    assert_eq!(stats.total_discarded, 1);

    // Closing the fresh overflow session gives the slot up for good
    pool.release(fresh, false).await.unwrap();
    for session in rest {
        pool.release(session, false).await.unwrap();
    }
    assert_eq!(pool.stats().idle, 2);
    assert_eq!(pool.stats().overflow, 0);
    assert_eq!(service.live_connections(), 2);
}

#[tokio::test]
async fn test_poisoned_pooled_release_leaves_overflow_count() {
    let (pool, _service) = pool(1, 1, None);

    let pooled = pool.acquire().await.unwrap();
    let overflow = pool.acquire().await.unwrap();
    assert_eq!(pool.kind_of(pooled.id()), Some(SessionKind::Pooled));
    assert_eq!(pool.kind_of(overflow.id()), Some(SessionKind::Overflow));

    pool.release(pooled, true).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.overflow, 1);
    assert_eq!(stats.pooled, 0);

    // The overflow session takes the vacated pooled slot
    let id = overflow.id();
    pool.release(overflow, false).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.overflow, 0);
    assert_eq!(stats.pooled, 1);
    assert_eq!(stats.idle, 1);

    let again = pool.acquire().await.unwrap();
    assert_eq!(again.id(), id);
    pool.release(again, false).await.unwrap();
}

#[tokio::test]
async fn test_capacity_one_reuses_session() {
    let (pool, service) = pool(1, 0, None);

    let mut session = pool.acquire().await.unwrap();
    let id = session.id();
    session.open_namespace("metrics").await.unwrap();
    pool.release(session, false).await.unwrap();
    assert_eq!(pool.stats().idle, 1);

    let mut session = pool.acquire().await.unwrap();
    assert_eq!(session.id(), id);
    assert_eq!(service.stats().connects, 1);

    // The namespace handle survives the round trip through the pool
    session.open_namespace("metrics").await.unwrap();
    assert_eq!(service.stats().namespace_opens, 1);
    pool.release(session, false).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_session_checked_out() {
    let (pool, service) = pool(3, 0, None);

    let t = pool.acquire().await.unwrap();
    let u = pool.acquire().await.unwrap();
    let v = pool.acquire().await.unwrap();
    pool.release(u, false).await.unwrap();
    pool.release(v, false).await.unwrap();
    assert_eq!(pool.stats().idle, 2);

    pool.shutdown().await.unwrap();
    assert_eq!(service.live_connections(), 1);
    assert!(t.is_connected());
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

    // T is closed on release instead of being parked
    pool.release(t, false).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live(), 0);
    assert_eq!(service.live_connections(), 0);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let (pool, _service) = pool(1, 0, Some(Duration::from_millis(50)));

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted(_)));
    assert_eq!(pool.stats().waiting, 0);

    // A per-call override waits long enough for the release
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire_timeout(Some(Duration::from_secs(5))).await }
    });
    wait_for_waiters(&pool, 1).await;
    let id = held.id();
    pool.release(held, false).await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap().id(), id);
}

#[tokio::test]
async fn test_waiters_are_served_in_order() {
    let (pool, _service) = pool(1, 0, None);
    let held = pool.acquire().await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..3 {
        let task_pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let session = task_pool.acquire().await.unwrap();
            order.lock().unwrap().push(i);
            task_pool.release(session, false).await.unwrap();
        }));
        wait_for_waiters(&pool, i + 1).await;
    }

    pool.release(held, false).await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_sessions_bounded_under_load() {
    let (pool, service) = pool(3, 2, None);
    // A slow close widens the window between giving up a session and reusing its slot
    service.set_close_delay(Some(Duration::from_millis(1)));
    let limit = 5;
    let done = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicUsize::new(0));

    let monitor = tokio::spawn({
        let pool = pool.clone();
        let done = Arc::clone(&done);
        let peak = Arc::clone(&peak);
        async move {
            while !done.load(Ordering::Acquire) {
                peak.fetch_max(pool.stats().live(), Ordering::AcqRel);
                tokio::task::yield_now().await;
            }
        }
    });

    let mut workers = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let mut scope = pool.scope();
                let session = scope.acquire().await.unwrap();
                session.open_namespace("load").await.unwrap();
                tokio::task::yield_now().await;
                scope.release(Outcome::Normal).await.unwrap();
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    done.store(true, Ordering::Release);
    monitor.await.unwrap();

    assert!(peak.load(Ordering::Acquire) <= limit);
    assert!(service.stats().peak_connections <= limit);
    let stats = pool.stats();
    assert!(stats.live() <= limit);
    assert_eq!(stats.checked_out, 0);
    assert!(stats.idle <= 3);
    assert_eq!(service.stats().connects, stats.total_created);

    pool.shutdown().await.unwrap();
    assert_eq!(service.live_connections(), 0);
    assert!(service.open_namespaces().is_empty());
}

#[tokio::test]
async fn test_connect_failure_surfaces_and_frees_slot() {
    let (pool, service) = pool(1, 0, Some(Duration::from_millis(50)));

    service.refuse_connections(true);
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Connect(_)));
    assert_eq!(pool.stats().live(), 0);
    assert_eq!(pool.stats().failed_connects, 1);

    service.refuse_connections(false);
    let session = pool.acquire().await.unwrap();
    pool.release(session, false).await.unwrap();
}

#[tokio::test]
async fn test_severed_idle_sessions_are_replaced() {
    let (pool, service) = pool(2, 0, None);

    let mut session = pool.acquire().await.unwrap();
    let id = session.id();
    pool.release(session, false).await.unwrap();

    service.sever_all();
    session = pool.acquire().await.unwrap();
    assert_eq!(session.id(), id);

    // The first call on a severed connection is a transport fault
    let err = session.open_namespace("logs").await.unwrap_err();
    assert_eq!(Outcome::from_error(&err), Outcome::TransportFault);
    pool.release(session, true).await.unwrap();

    let fresh = pool.acquire().await.unwrap();
    assert_ne!(fresh.id(), id);
    pool.release(fresh, false).await.unwrap();
}

#[tokio::test]
async fn test_core_scopes_per_unit_of_work() {
    let service = MemoryService::new();
    let mut config = Config::default();
    config.pool.pool_size = 2;
    config.pool.max_overflow = 0;
    let core = Core::with_connector(config, Arc::new(service.clone())).unwrap();

    let mut first = core.scope();
    let mut second = core.scope();
    let a = first.acquire().await.unwrap().id();
    let b = second.acquire().await.unwrap().id();
    assert_ne!(a, b);
    assert_eq!(core.stats().checked_out, 2);

    first.release(Outcome::Normal).await.unwrap();
    second.release(Outcome::TransportFault).await.unwrap();
    assert_eq!(core.stats().idle, 1);

    core.shutdown().await.unwrap();
    assert_eq!(service.live_connections(), 0);
}
