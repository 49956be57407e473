use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::broadcast;

use crate::AppError;
use crate::AppResult;

pub(crate) type SharedResult<V> = Result<V, Arc<AppError>>;

/// Collapses concurrent loads of the same key into a single in-flight call.
///
/// The first caller for a key becomes the leader and runs the load in a
/// detached task, so cancelling any caller never strands the others; every
/// caller waiting on the entry observes the leader's result. The entry
/// lives only while the load is in flight.
pub(crate) struct SingleFlight<V> {
    calls: Arc<DashMap<String, broadcast::Sender<SharedResult<V>>>>,
    forget_on_err: bool,
}

impl<V: Clone + Send + Sync + 'static> SingleFlight<V> {
    pub(crate) fn new(forget_on_err: bool) -> Self {
        SingleFlight {
            calls: Arc::new(DashMap::new()),
            forget_on_err,
        }
    }

    /// Runs `load` for `key` unless a load is already in flight, in which
    /// case the caller waits for that flight's result. The second tuple
    /// element is `true` when the result came from another caller's flight.
    pub(crate) async fn run<F, Fut>(&self, key: &str, load: F) -> (SharedResult<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<V>> + Send + 'static,
    {
        let mut load = Some(load);
        loop {
            if let Some(entry) = self.calls.get(key) {
                let mut rx = entry.value().subscribe();
                drop(entry);
                match rx.recv().await {
                    Ok(result) => return (result, true),
                    // the flight completed between lookup and subscribe
                    Err(_) => continue,
                }
            }

            let (tx, mut rx) = broadcast::channel(1);
            match self.calls.entry(key.to_string()) {
                Entry::Occupied(occupied) => {
                    // another caller led in the meantime, join its flight
                    let mut rx = occupied.get().subscribe();
                    drop(occupied);
                    match rx.recv().await {
                        Ok(result) => return (result, true),
                        Err(_) => continue,
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(tx.clone());
                }
            }

            let calls = self.calls.clone();
            let owned_key = key.to_string();
            let forget_on_err = self.forget_on_err;
            let fut = (load.take().expect("leader closure consumed twice"))();
            tokio::spawn(async move {
                // a panicking loader must still release the waiters and
                // remove the entry
                let result: SharedResult<V> = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(loaded) => loaded.map_err(Arc::new),
                    Err(_) => Err(Arc::new(AppError::Origin("origin loader panicked".into()))),
                };
                if result.is_err() && forget_on_err {
                    // let late arrivals restart instead of joining a doomed
                    // flight; current waiters still get this error below
                    calls.remove(&owned_key);
                    let _ = tx.send(result);
                } else {
                    let _ = tx.send(result);
                    calls.remove(&owned_key);
                }
            });

            return match rx.recv().await {
                Ok(result) => (result, false),
                Err(_) => (
                    Err(Arc::new(AppError::IllegalState(
                        "single-flight leader exited without a result".into(),
                    ))),
                    false,
                ),
            };
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn burst_runs_loader_once() {
        let flight = Arc::new(SingleFlight::<String>::new(false));
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let invocations = invocations.clone();
            tasks.push(tokio::spawn(async move {
                let (result, _) = flight
                    .run("expensive", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok("value".to_string())
                    })
                    .await;
                result.unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), "value");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_share_the_leader_error() {
        let flight = Arc::new(SingleFlight::<String>::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            tasks.push(tokio::spawn(async move {
                let (result, _) = flight
                    .run("broken", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(AppError::Origin("backend down".into()))
                    })
                    .await;
                result
            }));
        }

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("backend down"));
        }
    }

    #[tokio::test]
    async fn leader_cancellation_does_not_strand_followers() {
        let flight = Arc::new(SingleFlight::<u32>::new(false));

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(7)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("k", || async { Ok(0) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let (result, shared) = follower.await.unwrap();
        assert_eq!(result.unwrap(), 7);
        assert!(shared);
    }

    #[tokio::test]
    async fn panicking_loader_releases_waiters() {
        let flight = Arc::new(SingleFlight::<String>::new(false));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let flight = flight.clone();
            tasks.push(tokio::spawn(async move {
                let (result, _) = flight
                    .run("boom", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        panic!("loader bug");
                    })
                    .await;
                result
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("panicked"));
        }
        assert_eq!(flight.in_flight(), 0);

        // the key is usable again afterwards
        let (result, _) = flight.run("boom", || async { Ok("ok".to_string()) }).await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collapse() {
        let flight = Arc::new(SingleFlight::<String>::new(false));
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for key in ["a", "b"] {
            let flight = flight.clone();
            let invocations = invocations.clone();
            tasks.push(tokio::spawn(async move {
                let (result, _) = flight
                    .run(key, move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(key.to_string())
                    })
                    .await;
                result.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }
}
