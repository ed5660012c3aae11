//! redis-backed storage: keyspace-notification fires and redlock-style
//! locks.
//!
//! The server must be configured with `notify-keyspace-events` covering
//! expired events (`Ex`) so that database 0 publishes on
//! `__keyevent@0__:expired`. Expired events carry only the key, so `save`
//! writes two records: the prefixed expiry trigger with TTL = delay, and
//! the value key with TTL = 2·delay. The doubled retention still permits
//! loss for very short delays; a fire whose value key is already gone is
//! delivered with an empty value.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::BackendStorage;
use super::ClosedSnafu;
use super::DialTimeoutSnafu;
use super::InvalidEndpointSnafu;
use super::LockedSnafu;
use super::RedisSnafu;
use super::ShutdownSnafu;
use super::StorageConfig;
use super::StorageError;
use super::WatchChan;
use super::WatchResponse;
use super::STORAGE_KEY_PREFIX;
use super::WATCH_CHANNEL_CAPACITY;

/// Channel redis publishes expired-key events on for database 0.
const EXPIRED_EVENT_CHANNEL: &str = "__keyevent@0__:expired";

/// Fixed TTL of a distributed lock; a crashed holder releases after this.
const LOCK_TTL_SECS: u64 = 60;

/// Release only the lock we still own.
const RELEASE_LOCK_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;

/// [`BackendStorage`] on a single redis instance.
pub struct RedisStorage {
    conn: MultiplexedConnection,
    cancel: CancellationToken,
    lock_table: Mutex<HashMap<String, String>>,
    watch_rx: Mutex<Option<WatchChan>>,
    closed: AtomicBool,
}

impl RedisStorage {
    /// Connect to the first configured endpoint and start the expired-event
    /// subscription in the background.
    pub async fn connect(cfg: &StorageConfig) -> Result<Self, StorageError> {
        let endpoint = cfg
            .endpoints
            .first()
            .cloned()
            .unwrap_or_default();
        let (host, port) = parse_endpoint(&endpoint)?;

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: cfg.username.clone(),
                password: cfg.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info).context(RedisSnafu)?;

        let conn = dial(cfg, &endpoint, client.get_multiplexed_async_connection()).await?;
        let mut pubsub = dial(cfg, &endpoint, client.get_async_pubsub()).await?;
        pubsub.subscribe(EXPIRED_EVENT_CHANNEL).await.context(RedisSnafu)?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(subscription_loop(pubsub, conn.clone(), tx, cancel.clone()));

        Ok(Self {
            conn,
            cancel,
            lock_table: Mutex::new(HashMap::new()),
            watch_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return ClosedSnafu.fail();
        }
        Ok(())
    }
}

#[async_trait]
impl BackendStorage for RedisStorage {
    async fn save(&self, key: &str, value: &str, delay: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let trigger_key = format!("{STORAGE_KEY_PREFIX}{key}");
        let ttl_secs = delay.as_secs().max(1);

        let mut conn = self.conn.clone();
        // The expired event carries only the key, so the envelope lives
        // under a second record with twice the retention.
        let _: () = conn.set_ex(&trigger_key, "1", ttl_secs).await.context(RedisSnafu)?;
        let _: () = conn.set_ex(key, value, ttl_secs * 2).await.context(RedisSnafu)?;
        Ok(())
    }

    fn watch(&self) -> Option<WatchChan> {
        self.watch_rx.lock().take()
    }

    async fn try_lock(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.lock_table.lock().contains_key(key) {
            return LockedSnafu.fail();
        }

        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        if reply.is_none() {
            return LockedSnafu.fail();
        }
        self.lock_table.lock().insert(key.to_string(), token);
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let Some(token) = self.lock_table.lock().remove(key) else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut reasons = Vec::new();
        let held: Vec<(String, String)> = {
            let mut table = self.lock_table.lock();
            table.drain().collect()
        };
        let mut conn = self.conn.clone();
        for (key, token) in held {
            let released: Result<i64, _> = redis::Script::new(RELEASE_LOCK_SCRIPT)
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
            if let Err(err) = released {
                reasons.push(format!("unlock {key}: {err}"));
            }
        }

        // Stops the subscription task, which drops the pubsub connection
        // and closes the fire channel.
        self.cancel.cancel();

        if reasons.is_empty() {
            Ok(())
        } else {
            ShutdownSnafu { reasons }.fail()
        }
    }
}

/// Await a connection future under the configured dial timeout.
async fn dial<T>(
    cfg: &StorageConfig,
    endpoint: &str,
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, StorageError> {
    match tokio::time::timeout(cfg.dial_timeout, fut).await {
        Ok(result) => result.context(RedisSnafu),
        Err(_) => DialTimeoutSnafu {
            endpoint,
            timeout: cfg.dial_timeout,
        }
        .fail(),
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16), StorageError> {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return InvalidEndpointSnafu { endpoint }.fail();
    };
    let Ok(port) = port.parse::<u16>() else {
        return InvalidEndpointSnafu { endpoint }.fail();
    };
    if host.is_empty() {
        return InvalidEndpointSnafu { endpoint }.fail();
    }
    Ok((host.to_string(), port))
}

/// Forward expired-key events for our prefix into the fire channel,
/// fetching each value key as it goes (it may already be gone).
async fn subscription_loop(
    mut pubsub: redis::aio::PubSub,
    conn: MultiplexedConnection,
    tx: mpsc::Sender<WatchResponse>,
    cancel: CancellationToken,
) {
    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => {
                let Some(message) = message else { return };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "unreadable expired-event payload");
                        continue;
                    }
                };
                let Some(key) = payload.strip_prefix(STORAGE_KEY_PREFIX) else {
                    continue;
                };

                let mut conn = conn.clone();
                let value: Option<String> = conn.get(key).await.unwrap_or(None);
                let fire = WatchResponse {
                    key: key.to_string(),
                    value: value.unwrap_or_default(),
                    time_now: Utc::now().timestamp(),
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(fire) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
