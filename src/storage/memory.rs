//! Deterministic in-process backend for engine tests.
//!
//! Models the shared parts of a real backend: one cluster-wide lock
//! namespace, and fire events broadcast to every attached instance's watch
//! stream after the delay elapses. No persistence and no resume.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::BackendStorage;
use super::ClosedSnafu;
use super::LockedSnafu;
use super::StorageError;
use super::WatchChan;
use super::WatchResponse;
use super::WATCH_CHANNEL_CAPACITY;

/// A fleet-shared fake backend; each [`MemoryCluster::storage`] call
/// attaches one process's view of it.
#[derive(Clone, Default)]
pub(crate) struct MemoryCluster {
    state: Arc<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    locks: Mutex<HashMap<String, u64>>,
    watchers: Mutex<Vec<mpsc::Sender<WatchResponse>>>,
    next_instance: AtomicU64,
}

impl MemoryCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn storage(&self) -> MemoryStorage {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.state.watchers.lock().push(tx.clone());
        MemoryStorage {
            instance: self.state.next_instance.fetch_add(1, Ordering::Relaxed),
            state: self.state.clone(),
            tx,
            held: Mutex::new(HashSet::new()),
            watch_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }
}

/// One process's handle on a [`MemoryCluster`].
pub(crate) struct MemoryStorage {
    instance: u64,
    state: Arc<ClusterState>,
    tx: mpsc::Sender<WatchResponse>,
    held: Mutex<HashSet<String>>,
    watch_rx: Mutex<Option<WatchChan>>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendStorage for MemoryStorage {
    async fn save(&self, key: &str, value: &str, delay: Duration) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }
        let state = self.state.clone();
        let key = key.to_string();
        let value = value.to_string();
        // Like the TTL backends, expiry granularity is whole seconds.
        let ttl = Duration::from_secs(delay.as_secs().max(1));
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let watchers: Vec<mpsc::Sender<WatchResponse>> = state.watchers.lock().clone();
            for watcher in watchers {
                let fire = WatchResponse {
                    key: key.clone(),
                    value: value.clone(),
                    time_now: Utc::now().timestamp(),
                };
                let _ = watcher.send(fire).await;
            }
        });
        Ok(())
    }

    fn watch(&self) -> Option<WatchChan> {
        self.watch_rx.lock().take()
    }

    async fn try_lock(&self, key: &str) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }
        if self.held.lock().contains(key) {
            return LockedSnafu.fail();
        }
        let mut locks = self.state.locks.lock();
        if locks.contains_key(key) {
            return LockedSnafu.fail();
        }
        locks.insert(key.to_string(), self.instance);
        drop(locks);
        self.held.lock().insert(key.to_string());
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<(), StorageError> {
        if !self.held.lock().remove(key) {
            return Ok(());
        }
        let mut locks = self.state.locks.lock();
        if locks.get(key) == Some(&self.instance) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let held: Vec<String> = {
            let mut held = self.held.lock();
            held.drain().collect()
        };
        {
            let mut locks = self.state.locks.lock();
            for key in held {
                if locks.get(&key) == Some(&self.instance) {
                    locks.remove(&key);
                }
            }
        }
        self.state.watchers.lock().retain(|w| !w.same_channel(&self.tx));
        Ok(())
    }
}
