//! DHT store/retrieve support (spec §4.4 "DHT"): closest-node selection and
//! the pending-retrieve wait/notify table. The `(key, value, kind)` ledger
//! itself lives in the block store's `map` table (spec §3 `store_value`);
//! this module supplies the node-selection and coordination logic the
//! overlay layers on top of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::ident::Identifier;

/// Number of closest node ids a `store(key, value)` fans out to (spec §4.4
/// "for each of `N_STORE = 3` closest node ids").
pub const N_STORE: usize = 3;

/// Return the `n` ids from `candidates` closest to `key` by XOR distance,
/// including `self_id` in the candidate pool (spec: "including self").
pub fn closest_nodes(candidates: &[Identifier], self_id: Identifier, key: &Identifier, n: usize) -> Vec<Identifier> {
    let mut all: Vec<Identifier> = candidates.to_vec();
    if !all.contains(&self_id) {
        all.push(self_id);
    }
    crate::ident::sort_by_distance(&mut all, key);
    all.truncate(n);
    all
}

/// Coalesces concurrent `retrieve(key)` calls for the same key onto one
/// wait (spec §5 "at most once per key"), and unblocks them when a `Value`
/// message arrives.
#[derive(Default)]
pub struct PendingRetrieves {
    waiters: Mutex<HashMap<Identifier, Arc<Notify>>>,
    results: Mutex<HashMap<Identifier, Vec<Identifier>>>,
}

impl PendingRetrieves {
    pub fn new() -> Self {
        PendingRetrieves::default()
    }

    /// Record an incoming `Value(key, value, ...)` and wake anyone waiting
    /// on `key`.
    pub async fn deliver(&self, key: Identifier, value: Identifier) {
        self.results.lock().await.entry(key).or_default().push(value);
        if let Some(notify) = self.waiters.lock().await.get(&key) {
            notify.notify_waiters();
        }
    }

    /// Wait up to `timeout` for at least one value to arrive for `key`,
    /// returning whatever has accumulated (possibly already present from an
    /// earlier concurrent retrieve).
    pub async fn wait(&self, key: Identifier, timeout: Duration) -> Vec<Identifier> {
        if let Some(values) = self.results.lock().await.get(&key) {
            if !values.is_empty() {
                return values.clone();
            }
        }
        let notify = {
            let mut waiters = self.waiters.lock().await;
            waiters.entry(key).or_insert_with(|| Arc::new(Notify::new())).clone()
        };
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        self.results.lock().await.get(&key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_nodes_includes_self_and_sorts() {
        let target = Identifier::ZERO;
        let self_id = Identifier([0x10; 32]);
        let others = vec![Identifier([0xff; 32]), Identifier([0x01; 32])];
        let closest = closest_nodes(&others, self_id, &target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0], Identifier([0x01; 32]));
    }

    #[tokio::test]
    async fn wait_unblocks_on_deliver() {
        let pending = Arc::new(PendingRetrieves::new());
        let key = crate::crypto::system_hash(b"k");
        let value = crate::crypto::system_hash(b"v");

        let waiter_pending = pending.clone();
        let waiter = tokio::spawn(async move { waiter_pending.wait(key, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending.deliver(key, value).await;

        let values = waiter.await.unwrap();
        assert_eq!(values, vec![value]);
    }

    #[tokio::test]
    async fn wait_times_out_with_empty_result_when_nothing_arrives() {
        let pending = PendingRetrieves::new();
        let key = crate::crypto::system_hash(b"never");
        let values = pending.wait(key, Duration::from_millis(20)).await;
        assert!(values.is_empty());
    }
}
