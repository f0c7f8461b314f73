/*!
Request coalescing

Callers asking for the same key while a computation is in flight share that
computation's result instead of starting their own. Each flight runs on its
own task and removes its entry when it settles, so abandoned callers never
leave an entry behind and the next caller after completion runs fresh. A
flight whose task panicked is evicted by the first caller that observes it.
*/

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

/// The task driving a flight panicked or was cancelled
#[derive(Debug, Clone, Error)]
#[error("in-flight computation aborted")]
pub struct FlightAborted;

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

pub struct SingleFlight<K, T> {
    flights: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self { flights: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the flight for `key`, spawning it with `work` when none is running
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<T, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let registry = Arc::clone(&self.flights);
                    let owned_key = key.clone();
                    let fut = work();
                    // the entry is inserted below while the lock is still held,
                    // so the task's removal always finds its own entry
                    let handle = tokio::spawn(async move {
                        let result = fut.await;
                        registry.lock().remove(&owned_key);
                        result
                    });
                    let fresh = handle.map(|joined| joined.map_err(|_| FlightAborted)).boxed().shared();
                    flights.insert(key.clone(), fresh.clone());
                    fresh
                }
            }
        };

        let result = flight.clone().await;
        if result.is_err() {
            let mut flights = self.flights.lock();
            if flights.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
                flights.remove(&key);
            }
        }
        result
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}
