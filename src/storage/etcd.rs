//! etcd-backed storage: lease-expiry fires, resumable watch, session locks.
//!
//! Every job key is written under [`STORAGE_KEY_PREFIX`] with a fresh lease
//! whose TTL equals the delay; etcd deletes the key on lease expiry and the
//! delete event (with the previous KV attached) becomes the fire. A
//! singleton resume key records the last observed watch revision so a
//! restarted process replays fires that expired while nobody was watching.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::EventType;
use etcd_client::PutOptions;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::WatchFilterType;
use etcd_client::WatchOptions;
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::BackendStorage;
use super::ClosedSnafu;
use super::EtcdSnafu;
use super::InvalidEndpointSnafu;
use super::LockedSnafu;
use super::ShutdownSnafu;
use super::StorageConfig;
use super::StorageError;
use super::WatchChan;
use super::WatchResponse;
use super::STORAGE_KEY_PREFIX;
use super::WATCH_CHANNEL_CAPACITY;
use super::WATCH_REVISION_KEY;

/// TTL of the session lease that lock keys attach to. A crashed process
/// loses the lease and with it every lock it held.
const SESSION_LEASE_TTL_SECS: i64 = 60;

/// TTL of the resume-key lease. A process down for longer than this loses
/// older pending fires.
const RESUME_LEASE_TTL_SECS: i64 = 60;

/// How often kept-alive leases are renewed.
const LEASE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// [`BackendStorage`] on an etcd cluster.
pub struct EtcdStorage {
    client: Client,
    cancel: CancellationToken,
    session_lease: i64,
    resume_lease: Arc<AtomicI64>,
    revision: Arc<AtomicI64>,
    lock_table: Mutex<HashSet<String>>,
    watch_rx: Mutex<Option<WatchChan>>,
    closed: AtomicBool,
}

impl EtcdStorage {
    /// Connect to the cluster, grant the session lease, and start the
    /// expiry watch in the background.
    pub async fn connect(cfg: &StorageConfig) -> Result<Self, StorageError> {
        if cfg.endpoints.is_empty() {
            return InvalidEndpointSnafu { endpoint: "<none>" }.fail();
        }

        let mut options = ConnectOptions::new()
            .with_connect_timeout(cfg.dial_timeout)
            .with_timeout(cfg.dial_timeout)
            .with_keep_alive(Duration::from_secs(1), Duration::from_millis(500));
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            options = options.with_user(user.as_str(), password.as_str());
        }

        let client = Client::connect(cfg.endpoints.clone(), Some(options)).await.context(EtcdSnafu)?;

        let mut lease_client = client.clone();
        let session = lease_client.lease_grant(SESSION_LEASE_TTL_SECS, None).await.context(EtcdSnafu)?;

        let cancel = CancellationToken::new();
        spawn_lease_keepalive(client.clone(), session.id(), cancel.clone());

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let revision = Arc::new(AtomicI64::new(0));
        let resume_lease = Arc::new(AtomicI64::new(0));
        tokio::spawn(watch_loop(
            client.clone(),
            tx,
            cancel.clone(),
            revision.clone(),
            resume_lease.clone(),
        ));

        Ok(Self {
            client,
            cancel,
            session_lease: session.id(),
            resume_lease,
            revision,
            lock_table: Mutex::new(HashSet::new()),
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
impl BackendStorage for EtcdStorage {
    async fn save(&self, key: &str, value: &str, delay: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = format!("{STORAGE_KEY_PREFIX}{key}");
        let ttl_secs = delay.as_secs().max(1) as i64;

        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await.context(EtcdSnafu)?;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
            .await
            .context(EtcdSnafu)?;
        Ok(())
    }

    fn watch(&self) -> Option<WatchChan> {
        self.watch_rx.lock().take()
    }

    async fn try_lock(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.lock_table.lock().contains(key) {
            return LockedSnafu.fail();
        }

        // Create the lock key only if nobody has: attaching it to the
        // session lease makes a crashed holder release automatically.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                "",
                Some(PutOptions::new().with_lease(self.session_lease)),
            )]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await.context(EtcdSnafu)?;
        if !resp.succeeded() {
            return LockedSnafu.fail();
        }
        self.lock_table.lock().insert(key.to_string());
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !self.lock_table.lock().remove(key) {
            return Ok(());
        }
        let mut client = self.client.clone();
        client.delete(key, None).await.context(EtcdSnafu)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut client = self.client.clone();

        // Final revision checkpoint before the watch loop is torn down.
        let revision = self.revision.load(Ordering::Acquire);
        let lease = self.resume_lease.load(Ordering::Acquire);
        let options = (lease != 0).then(|| PutOptions::new().with_lease(lease));
        if let Err(err) = client.put(WATCH_REVISION_KEY, revision.to_string(), options).await {
            debug!(error = %err, revision, "failed to write final watch revision checkpoint");
        }

        self.cancel.cancel();

        let mut reasons = Vec::new();
        let held: Vec<String> = {
            let mut table = self.lock_table.lock();
            table.drain().collect()
        };
        for key in held {
            if let Err(err) = client.delete(key.as_str(), None).await {
                reasons.push(format!("unlock {key}: {err}"));
            }
        }
        if let Err(err) = client.lease_revoke(self.session_lease).await {
            reasons.push(format!("revoke session lease: {err}"));
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            ShutdownSnafu { reasons }.fail()
        }
    }
}

/// Renew `lease` until cancelled or the keepalive channel fails.
fn spawn_lease_keepalive(client: Client, lease: i64, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut client = client;
        let (mut keeper, mut responses) = match client.lease_keep_alive(lease).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(lease, error = %err, "failed to start lease keepalive");
                return;
            }
        };
        let mut tick = tokio::time::interval(LEASE_KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(err) = keeper.keep_alive().await {
                        warn!(lease, error = %err, "lease keepalive send failed");
                        return;
                    }
                    match responses.message().await {
                        Ok(Some(_)) => {}
                        Ok(None) => return,
                        Err(err) => {
                            warn!(lease, error = %err, "lease keepalive recv failed");
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// Resolve the resume revision, open the prefix watch, and pump delete
/// events into the fire channel until cancelled.
async fn watch_loop(
    client: Client,
    tx: mpsc::Sender<WatchResponse>,
    cancel: CancellationToken,
    revision: Arc<AtomicI64>,
    resume_lease: Arc<AtomicI64>,
) {
    let mut client = client;

    let mut start_revision: i64 = 0;
    match client.get(WATCH_REVISION_KEY, None).await {
        Ok(resp) if !resp.kvs().is_empty() => {
            let kv = &resp.kvs()[0];
            start_revision = kv.value_str().ok().and_then(|v| v.trim().parse().ok()).unwrap_or(0);
            let lease = kv.lease();
            if lease != 0 {
                resume_lease.store(lease, Ordering::Release);
                spawn_lease_keepalive(client.clone(), lease, cancel.clone());
            }
        }
        Ok(_) => match client.lease_grant(RESUME_LEASE_TTL_SECS, None).await {
            Ok(grant) => {
                resume_lease.store(grant.id(), Ordering::Release);
                spawn_lease_keepalive(client.clone(), grant.id(), cancel.clone());
                if let Err(err) = client
                    .put(WATCH_REVISION_KEY, "0", Some(PutOptions::new().with_lease(grant.id())))
                    .await
                {
                    warn!(error = %err, "failed to create watch revision key");
                }
            }
            Err(err) => warn!(error = %err, "failed to grant lease for watch revision key"),
        },
        Err(err) => warn!(error = %err, "failed to read watch revision key"),
    }
    revision.store(start_revision, Ordering::Release);

    // Delete events only; the expired value rides in on the previous KV.
    let mut options = WatchOptions::new()
        .with_prefix()
        .with_filters(vec![WatchFilterType::NoPut])
        .with_prev_key();
    if start_revision > 0 {
        options = options.with_start_revision(start_revision + 1);
    }

    let (_watcher, mut stream) = match client.watch(STORAGE_KEY_PREFIX, Some(options)).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "failed to open expiry watch");
            return;
        }
    };

    loop {
        // Compact checkpoint: the revision recorded by the last delivered
        // fire is persisted before the next receive.
        checkpoint_revision(&mut client, &revision, &resume_lease).await;

        tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.message() => {
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(error = %err, "expiry watch stream failed");
                        return;
                    }
                };
                let header_revision = resp.header().map(|h| h.revision()).unwrap_or(0);
                for event in resp.events() {
                    if event.event_type() != EventType::Delete {
                        continue;
                    }
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let key = key.strip_prefix(STORAGE_KEY_PREFIX).unwrap_or(key).to_string();
                    let value = event
                        .prev_kv()
                        .and_then(|prev| prev.value_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let fire = WatchResponse {
                        key,
                        value,
                        time_now: Utc::now().timestamp(),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(fire) => {
                            if sent.is_err() {
                                return;
                            }
                            revision.store(header_revision, Ordering::Release);
                        }
                    }
                }
            }
        }
    }
}

async fn checkpoint_revision(client: &mut Client, revision: &AtomicI64, resume_lease: &AtomicI64) {
    let revision = revision.load(Ordering::Acquire);
    let lease = resume_lease.load(Ordering::Acquire);
    let options = (lease != 0).then(|| PutOptions::new().with_lease(lease));
    if let Err(err) = client.put(WATCH_REVISION_KEY, revision.to_string(), options).await {
        debug!(error = %err, revision, "failed to checkpoint watch revision");
    }
}
