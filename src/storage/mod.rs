//! Backend storage contract for the elastic job engine.
//!
//! A backend stores job envelopes under a TTL, produces a stream of fire
//! events when TTLs elapse, and provides cluster-wide non-blocking locks so
//! that exactly one process runs each fired job. Two backends ship with the
//! crate: [`etcd::EtcdStorage`] (lease expiry, resumable watch) and
//! [`redis::RedisStorage`] (keyspace notifications, lossy value retention).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use tokio::sync::mpsc;

pub mod etcd;
#[cfg(test)]
pub(crate) mod memory;
pub mod redis;

/// Prefix under which job keys (and redis expiry triggers) are stored.
pub const STORAGE_KEY_PREFIX: &str = "MultiCron/StoragePrefix";

/// etcd key holding the last observed watch revision as decimal digits.
pub const WATCH_REVISION_KEY: &str = "MultiCron/KeyForWatchReversion";

/// Buffer of the fire-event channel between a backend and its consumer.
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Errors produced by backend storage implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The lock is held, either by this process or by another session.
    #[snafu(display("already locked"))]
    Locked,

    /// An etcd request failed.
    #[snafu(display("etcd request failed: {source}"))]
    Etcd {
        /// Client error.
        source: etcd_client::Error,
    },

    /// A redis request failed.
    #[snafu(display("redis request failed: {source}"))]
    Redis {
        /// Client error.
        source: ::redis::RedisError,
    },

    /// The configured endpoint list is empty or an entry is malformed.
    #[snafu(display("invalid backend endpoint: {endpoint}"))]
    InvalidEndpoint {
        /// The offending endpoint, or a placeholder when none was given.
        endpoint: String,
    },

    /// Connecting to the backend did not finish within the dial timeout.
    #[snafu(display("timed out dialing {endpoint} after {timeout:?}"))]
    DialTimeout {
        /// Endpoint being dialed.
        endpoint: String,
        /// Configured dial timeout.
        timeout: Duration,
    },

    /// The backend has been closed.
    #[snafu(display("backend storage is closed"))]
    Closed,

    /// Shutdown released what it could but some steps failed.
    #[snafu(display("shutdown completed with errors: {reasons:?}"))]
    Shutdown {
        /// Messages of the individual failures.
        reasons: Vec<String>,
    },
}

impl StorageError {
    /// Whether this error means the per-job lock is held elsewhere.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// A fire event: a tracked key whose TTL has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    /// The logical job key, storage prefix stripped.
    pub key: String,
    /// The raw envelope string as originally saved. MAY be empty when the
    /// backend lost the value (redis retains values only for twice the
    /// delay).
    pub value: String,
    /// Receiver wall-clock fire time, seconds since the Unix epoch.
    pub time_now: i64,
}

/// The single-consumer stream of fire events produced by a backend.
pub type WatchChan = mpsc::Receiver<WatchResponse>;

/// Which backend a storage config addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// etcd: lease-expiry fires, resumable watch, session locks.
    #[default]
    Etcd,
    /// redis: keyspace-notification fires, redlock-style locks.
    Redis,
}

/// Connection settings shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend endpoints as `host:port`. etcd uses all of them; redis uses
    /// the first.
    pub endpoints: Vec<String>,
    /// Deadline applied to dialing and to individual storage requests.
    pub dial_timeout: Duration,
    /// Optional authentication user.
    pub username: Option<String>,
    /// Optional authentication password.
    pub password: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

/// Contract between the engine and a delay-notification store.
///
/// Implementations own their client, their fire-event channel, and a
/// per-process table of held locks. All operations are safe to call from
/// concurrent tasks, except that `try_lock`/`unlock` for one key must not
/// race within a single process (the engine's per-fire task serializes
/// them).
#[async_trait]
pub trait BackendStorage: Send + Sync + 'static {
    /// Store `value` addressable by `key` and arrange a fire event after
    /// `delay`.
    ///
    /// Re-saving a key overwrites both the value and the TTL. Fails if the
    /// backend rejects the write or the client is closed; a non-positive
    /// delay is rejected by the engine before it reaches the backend.
    async fn save(&self, key: &str, value: &str, delay: Duration) -> Result<(), StorageError>;

    /// Hand out the fire-event stream.
    ///
    /// The stream is created once per backend instance and closed by
    /// [`close`](Self::close). It has a single consumer: the first call
    /// returns it, every later call returns `None`.
    fn watch(&self) -> Option<WatchChan>;

    /// Attempt to acquire a cluster-wide, mutually-exclusive lock on `key`
    /// without blocking.
    ///
    /// Returns [`StorageError::Locked`] when this process already holds the
    /// lock or another process/session does. Any other error is surfaced
    /// verbatim.
    async fn try_lock(&self, key: &str) -> Result<(), StorageError>;

    /// Release a lock previously acquired with [`try_lock`](Self::try_lock).
    ///
    /// A no-op if this process does not hold the lock. Otherwise the lock is
    /// removed from the per-process table and released in the backend;
    /// backend release failures are returned.
    async fn unlock(&self, key: &str) -> Result<(), StorageError>;

    /// Release all held locks, close the fire stream and the client.
    ///
    /// Idempotent. Individual failures are aggregated into a single
    /// [`StorageError::Shutdown`].
    async fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_error_is_distinguishable() {
        let err = StorageError::Locked;
        assert!(err.is_locked());
        assert_eq!(err.to_string(), "already locked");

        let err = StorageError::Shutdown {
            reasons: vec!["lease revoke failed".to_string()],
        };
        assert!(!err.is_locked());
    }

    #[test]
    fn test_storage_kind_defaults_to_etcd() {
        assert_eq!(StorageKind::default(), StorageKind::Etcd);
    }
}
