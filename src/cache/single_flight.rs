use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Keyed request coalescing: all callers of [`run`](Self::run) for the same
/// key while a flight is in progress await one shared future and observe the
/// same settled result. Slots are generation-tagged so that clearing a slot
/// after settlement (or via [`forget`](Self::forget)) can never remove a
/// successor flight for the same key.
pub struct SingleFlight<K, T, E> {
    flights: Mutex<HashMap<K, (u64, Flight<T, E>)>>,
    next_id: AtomicU64,
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-progress flight for `key`, or start one with `make`.
    pub async fn run<F>(&self, key: K, make: impl FnOnce() -> F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (id, flight) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = make().boxed().shared();
                    flights.insert(key.clone(), (id, flight.clone()));
                    (id, flight)
                }
            }
        };
        let result = flight.await;
        // First finisher clears the slot; the id guard keeps a slow caller
        // from evicting a newer flight started after a `forget`.
        let mut flights = self.flights.lock();
        if matches!(flights.get(&key), Some((slot_id, _)) if *slot_id == id) {
            flights.remove(&key);
        }
        result
    }

    /// Drop any in-flight reference for `key`; the next `run` starts fresh.
    pub fn forget(&self, key: &K) {
        self.flights.lock().remove(key);
    }

    #[cfg(test)]
    fn in_flight(&self, key: &K) -> bool {
        self.flights.lock().contains_key(key)
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
