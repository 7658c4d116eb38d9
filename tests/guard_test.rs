//! Integration tests for the lock guard: acquire, run, release, contention.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;
use workq_lock::{
    Error, FixedKey, JobArgs, LockGuard, LockKey, LockPolicy, LockRecord, LockStore, MemoryStore,
    PerformError, Performed,
};

fn args(values: &[serde_json::Value]) -> JobArgs {
    JobArgs::new(values.to_vec())
}

fn memory_guard(store: &MemoryStore) -> LockGuard {
    LockGuard::new(Arc::new(store.clone()))
}

/// Wait (bounded) until `cond` holds, yielding to spawned tasks meanwhile.
async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Policy that records every `job_locked` call.
#[derive(Clone, Default)]
struct Recording {
    locked: Arc<Mutex<Vec<(String, JobArgs)>>>,
}

impl Recording {
    fn calls(&self) -> Vec<(String, JobArgs)> {
        self.locked.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockPolicy for Recording {
    async fn job_locked(&self, identity: &str, args: &JobArgs) {
        self.locked
            .lock()
            .unwrap()
            .push((identity.to_string(), args.clone()));
    }
}

/// Store whose operations can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_acquire: AtomicBool,
    fail_delete: AtomicBool,
}

#[async_trait]
impl LockStore for FlakyStore {
    async fn set_if_absent(&self, key: &LockKey) -> workq_lock::Result<bool> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(Error::Other("connection refused".to_string()));
        }
        self.inner.set_if_absent(key).await
    }

    async fn delete(&self, key: &LockKey) -> workq_lock::Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Other("connection reset".to_string()));
        }
        self.inner.delete(key).await
    }

    async fn get(&self, key: &LockKey) -> workq_lock::Result<Option<LockRecord>> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: Option<&str>) -> workq_lock::Result<Vec<LockRecord>> {
        self.inner.list(prefix).await
    }

    fn max_key_len(&self) -> usize {
        64
    }
}

// ---------------------------------------------------------------------------
// Acquire / run / release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uncontended_invocation_runs_and_releases() {
    let store = MemoryStore::new();
    let guard = memory_guard(&store);
    let repo = args(&[json!("repo42")]);

    let performed = guard
        .perform("Sync", &repo, || async {
            assert!(store.contains(&LockKey::derive("Sync", &repo)).unwrap());
            Ok::<_, std::io::Error>(7)
        })
        .await
        .unwrap();

    assert_eq!(performed, Performed::Ran(7));
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn job_error_propagates_unchanged_and_lock_is_released() {
    // Scenario B
    let store = MemoryStore::new();
    let guard = memory_guard(&store);

    let err = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            Err::<(), _>(std::io::Error::other("disk full"))
        })
        .await
        .unwrap_err();

    assert!(!err.is_infrastructure());
    let job_err = err.into_job().expect("job error");
    assert_eq!(job_err.to_string(), "disk full");
    assert!(!store.contains(&LockKey::new(r#"lock:Sync-["repo42"]"#)).unwrap());
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn panicking_job_still_releases_lock() {
    let store = MemoryStore::new();
    let guard = memory_guard(&store);

    let handle = tokio::spawn(async move {
        guard
            .perform("Sync", &args(&[json!("repo42")]), || async {
                if true {
                    panic!("job blew up");
                }
                Ok::<(), std::io::Error>(())
            })
            .await
    });

    let joined = handle.await;
    assert!(joined.unwrap_err().is_panic());
    // Released before the panic left `perform`, not by a background task.
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn panic_is_resumed_after_release() {
    let store = MemoryStore::new();
    let guard = memory_guard(&store);

    let caught = AssertUnwindSafe(guard.perform("Sync", &args(&[json!("repo42")]), || async {
        if true {
            panic!("job blew up");
        }
        Ok::<(), std::io::Error>(())
    }))
    .catch_unwind()
    .await;

    let payload = caught.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"job blew up"));
    assert!(store.is_empty().unwrap());
}

#[test]
fn panic_on_current_thread_runtime_releases_before_shutdown() {
    let store = MemoryStore::new();
    let guard = memory_guard(&store);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(guard.perform("Sync", &args(&[json!("repo42")]), || async {
            if true {
                panic!("job blew up");
            }
            Ok::<(), std::io::Error>(())
        }))
    }));
    drop(rt);

    assert!(caught.is_err());
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn cancelled_job_still_releases_lock() {
    let store = MemoryStore::new();
    let guard = memory_guard(&store);
    let key = LockKey::derive("Sync", &args(&[json!("repo42")]));

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        guard.perform("Sync", &args(&[json!("repo42")]), || async {
            std::future::pending::<()>().await;
            Ok::<(), std::io::Error>(())
        }),
    )
    .await;

    assert!(timed_out.is_err());
    eventually(|| !store.contains(&key).unwrap()).await;
}

// ---------------------------------------------------------------------------
// Contention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_duplicate_calls_job_locked_instead_of_body() {
    // Scenario A
    let store = MemoryStore::new();
    let policy = Recording::default();
    let guard = memory_guard(&store).with_policy(policy.clone());
    let repo = args(&[json!("repo42")]);
    let ran = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let guard = guard.clone();
        let repo = repo.clone();
        let ran = Arc::clone(&ran);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            guard
                .perform("Sync", &repo, || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await.unwrap();
                    Ok::<_, std::io::Error>(())
                })
                .await
        })
    };

    eventually(|| ran.load(Ordering::SeqCst) == 1).await;

    let second = guard
        .perform("Sync", &repo, || async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap();
    assert!(second.is_locked());
    assert_eq!(policy.calls(), vec![("Sync".to_string(), repo.clone())]);

    gate.add_permits(1);
    assert_eq!(first.await.unwrap().unwrap(), Performed::Ran(()));

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!store.contains(&LockKey::new(r#"lock:Sync-["repo42"]"#)).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_invocations_runs() {
    const N: usize = 8;
    let store = MemoryStore::new();
    let policy = Recording::default();
    let guard = memory_guard(&store).with_policy(policy.clone());
    let ran = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let mut handles = Vec::new();
    for _ in 0..N {
        let guard = guard.clone();
        let ran = Arc::clone(&ran);
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            guard
                .perform("Sync", &args(&[json!("repo42")]), || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await.unwrap();
                    Ok::<_, std::io::Error>(())
                })
                .await
        }));
    }

    eventually(|| policy.calls().len() == N - 1).await;
    gate.add_permits(N);

    let mut ran_count = 0;
    let mut locked_count = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Performed::Ran(()) => ran_count += 1,
            Performed::Locked => locked_count += 1,
        }
    }

    assert_eq!(ran_count, 1);
    assert_eq!(locked_count, N - 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn distinct_args_do_not_contend() {
    // Scenario C
    let store = MemoryStore::new();
    let policy = Recording::default();
    let guard = memory_guard(&store).with_policy(policy.clone());
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let spawn = |repo: &'static str| {
        let guard = guard.clone();
        let gate = Arc::clone(&gate);
        let ran = Arc::clone(&ran);
        tokio::spawn(async move {
            guard
                .perform("Sync", &args(&[json!(repo)]), || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await.unwrap();
                    Ok::<_, std::io::Error>(repo)
                })
                .await
        })
    };

    let a = spawn("repo42");
    let b = spawn("repo99");

    eventually(|| ran.load(Ordering::SeqCst) == 2).await;
    assert_eq!(store.len().unwrap(), 2);
    gate.add_permits(2);

    assert_eq!(a.await.unwrap().unwrap(), Performed::Ran("repo42"));
    assert_eq!(b.await.unwrap().unwrap(), Performed::Ran("repo99"));
    assert!(policy.calls().is_empty());
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn overridden_key_makes_different_args_contend() {
    // Scenario D
    let store = MemoryStore::new();
    let guard = memory_guard(&store).with_policy(FixedKey::new("singleton"));
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicBool::new(false));

    let first = {
        let guard = guard.clone();
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            guard
                .perform("Sync", &args(&[json!("repo42")]), || async move {
                    started.store(true, Ordering::SeqCst);
                    let _permit = gate.acquire().await.unwrap();
                    Ok::<_, std::io::Error>(())
                })
                .await
        })
    };

    eventually(|| started.load(Ordering::SeqCst)).await;
    assert!(store.contains(&LockKey::new("singleton")).unwrap());

    let second = guard
        .perform("Sync", &args(&[json!("repo99")]), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap();
    assert!(second.is_locked());

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn contention_leaves_lock_state_alone() {
    let store = MemoryStore::new();
    let key = LockKey::derive("Sync", &args(&[json!("repo42")]));
    store.set_if_absent(&key).await.unwrap();
    let before = store.get(&key).await.unwrap();

    let guard = memory_guard(&store);
    let performed = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap();

    assert!(performed.is_locked());
    assert_eq!(store.get(&key).await.unwrap(), before);

    // Once the holder releases, the next invocation acquires normally.
    store.delete(&key).await.unwrap();
    let performed = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            Ok::<_, std::io::Error>("again")
        })
        .await
        .unwrap();
    assert_eq!(performed, Performed::Ran("again"));
}

// ---------------------------------------------------------------------------
// Infrastructure failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_failure_on_acquire_is_not_contention() {
    let store = Arc::new(FlakyStore::default());
    store.fail_acquire.store(true, Ordering::SeqCst);
    let policy = Recording::default();
    let guard = LockGuard::new(store.clone()).with_policy(policy.clone());
    let ran = AtomicBool::new(false);

    let err = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PerformError::Acquire { .. }));
    assert!(err.is_infrastructure());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(policy.calls().is_empty());
}

#[tokio::test]
async fn failed_release_after_success_reports_stuck_lock() {
    let store = Arc::new(FlakyStore::default());
    store.fail_delete.store(true, Ordering::SeqCst);
    let guard = LockGuard::new(store.clone());
    let key = LockKey::derive("Sync", &args(&[json!("repo42")]));

    let err = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    match err {
        PerformError::Release { key: stuck, .. } => assert_eq!(stuck, key),
        other => panic!("expected Release, got {other:?}"),
    }
    // Stuck until someone clears it.
    assert!(store.inner.contains(&key).unwrap());
    store.fail_delete.store(false, Ordering::SeqCst);
    store.delete(&key).await.unwrap();
    assert!(store.inner.is_empty().unwrap());
}

#[tokio::test]
async fn job_error_wins_over_failed_release() {
    let store = Arc::new(FlakyStore::default());
    store.fail_delete.store(true, Ordering::SeqCst);
    let guard = LockGuard::new(store.clone());

    let err = guard
        .perform("Sync", &args(&[json!("repo42")]), || async {
            Err::<(), _>(std::io::Error::other("boom"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.into_job().unwrap().to_string(), "boom");
    assert_eq!(store.inner.len().unwrap(), 1);
}

#[tokio::test]
async fn oversized_key_is_rejected_before_acquire() {
    let store = Arc::new(FlakyStore::default());
    let guard = LockGuard::new(store.clone());
    let long = "x".repeat(100);

    let err = guard
        .perform("Sync", &args(&[json!(long)]), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PerformError::InvalidKey(Error::InvalidKey(_))));
    assert!(store.inner.is_empty().unwrap());
}

#[tokio::test]
async fn guard_reports_policy_key() {
    let store = MemoryStore::new();
    let repo = args(&[json!("repo42")]);

    assert_eq!(
        memory_guard(&store).lock_key("Sync", &repo).as_str(),
        r#"lock:Sync-["repo42"]"#
    );
    assert_eq!(
        memory_guard(&store)
            .with_policy(FixedKey::new("singleton"))
            .lock_key("Sync", &repo)
            .as_str(),
        "singleton"
    );
}
