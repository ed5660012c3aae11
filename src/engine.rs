//! The elastic job engine.
//!
//! One background task consumes the backend's fire stream and fans each
//! fire out to its own task. A per-fire distributed lock keyed on
//! `md5(key ‖ tag)` ensures that when several engine processes share a
//! backend, exactly one of them runs the job.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use snafu::ensure;
use snafu::ResultExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::DelayInPastSnafu;
use crate::error::EncodeJobSnafu;
use crate::error::JobError;
use crate::error::StorageInitSnafu;
use crate::error::StorageSnafu;
use crate::job::Handler;
use crate::job::Job;
use crate::metrics::current_trace_id;
use crate::metrics::JobMetrics;
use crate::registry::HandlerRegistry;
use crate::storage::etcd::EtcdStorage;
use crate::storage::redis::RedisStorage;
use crate::storage::BackendStorage;
use crate::storage::StorageConfig;
use crate::storage::StorageError;
use crate::storage::StorageKind;
use crate::storage::WatchChan;

/// Post-handler hold on the per-job lock. Expiry notifications fan out to
/// every watching peer, so the lock must still be held when the slowest
/// peer's event arrives; released right after a fast handler, a late peer
/// would acquire it and run the job a second time.
const LOCK_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Fire key that trips an injected panic in the dispatch loop, for
/// exercising the supervisor.
#[cfg(test)]
pub(crate) const PANIC_FIRE_KEY: &str = "__panic_dispatch__";

/// Configures and builds an [`ElasticJob`] engine.
#[derive(Default)]
pub struct ElasticJobBuilder {
    storage_kind: StorageKind,
    storage_config: StorageConfig,
    server_name: String,
    metrics_enabled: bool,
    metrics_namespace: String,
    backend: Option<Arc<dyn BackendStorage>>,
}

impl ElasticJobBuilder {
    /// Select the backend kind and its connection settings.
    pub fn storage(mut self, kind: StorageKind, config: StorageConfig) -> Self {
        self.storage_kind = kind;
        self.storage_config = config;
        self
    }

    /// Name reported in metric labels.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Register and report the Prometheus instruments.
    pub fn enable_metrics(mut self) -> Self {
        self.metrics_enabled = true;
        self
    }

    /// Namespace prefix for the Prometheus instruments (default none).
    pub fn metrics_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metrics_namespace = namespace.into();
        self
    }

    /// Use an already-constructed backend instead of connecting one from
    /// the storage settings.
    pub fn backend(mut self, backend: Arc<dyn BackendStorage>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Connect the backend and start the dispatch loop.
    pub async fn build(self) -> Result<ElasticJob, JobError> {
        let store: Arc<dyn BackendStorage> = match self.backend {
            Some(store) => store,
            None => match self.storage_kind {
                StorageKind::Etcd => {
                    Arc::new(EtcdStorage::connect(&self.storage_config).await.context(StorageInitSnafu)?)
                }
                StorageKind::Redis => {
                    Arc::new(RedisStorage::connect(&self.storage_config).await.context(StorageInitSnafu)?)
                }
            },
        };

        let watch = store.watch().ok_or(StorageError::Closed).context(StorageInitSnafu)?;

        let metrics = self.metrics_enabled.then(|| JobMetrics::new(&self.metrics_namespace));

        let inner = Arc::new(Inner {
            cancel: CancellationToken::new(),
            store,
            handlers: HandlerRegistry::new(),
            metrics,
            server_name: self.server_name,
            closed: AtomicBool::new(false),
        });
        spawn_dispatch(inner.clone(), Arc::new(AsyncMutex::new(watch)));

        Ok(ElasticJob { inner })
    }
}

/// Distributed delayed / periodic task executor.
///
/// Cheap to clone; all clones share the same backend, registry, and
/// dispatch loop. Obtain one through [`ElasticJob::builder`].
#[derive(Clone)]
pub struct ElasticJob {
    inner: Arc<Inner>,
}

struct Inner {
    cancel: CancellationToken,
    store: Arc<dyn BackendStorage>,
    handlers: HandlerRegistry,
    metrics: Option<JobMetrics>,
    server_name: String,
    closed: AtomicBool,
}

impl ElasticJob {
    /// Start configuring a new engine.
    pub fn builder() -> ElasticJobBuilder {
        ElasticJobBuilder::default()
    }

    /// Submit a job: the envelope is stored in the backend, which fires it
    /// back through the watch stream once `delay_time` is reached.
    ///
    /// Fails with [`JobError::DelayInPast`] when `delay_time` is not in the
    /// future; nothing is written in that case.
    pub async fn add_job(&self, job: &Job) -> Result<(), JobError> {
        self.inner.add_job(job).await
    }

    /// Register `handler` for fires carrying `tag`, replacing any previous
    /// registration for that tag.
    pub fn register_handler(&self, tag: impl Into<String>, handler: impl Handler) {
        self.inner.handlers.register(tag, Arc::new(handler));
    }

    /// Shut the engine down: stop the dispatch loop and close the backend
    /// (releasing held locks and, on etcd, checkpointing the resume state).
    ///
    /// Idempotent. In-flight fire tasks are not cancelled; they run to
    /// completion and release their locks.
    pub async fn close(&self) -> Result<(), JobError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.store.close().await.context(StorageSnafu)
    }
}

impl Inner {
    async fn add_job(&self, job: &Job) -> Result<(), JobError> {
        let value = job.marshal().context(EncodeJobSnafu)?;

        let delta_ms = job.delay_time * 1000 - Utc::now().timestamp_millis();
        ensure!(delta_ms > 0, DelayInPastSnafu);
        let delay = Duration::from_millis(delta_ms as u64);

        self.store.save(&job.key, &value, delay).await.context(StorageSnafu)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_add_total(&self.server_name, &job.key, &current_trace_id());
        }
        Ok(())
    }
}

/// Run the dispatch loop, relaunching it on a fresh task if it panics.
fn spawn_dispatch(inner: Arc<Inner>, watch: Arc<AsyncMutex<WatchChan>>) {
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(dispatch_loop(inner.clone(), watch.clone()));
            match task.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    error!("dispatch loop panicked, relaunching");
                    continue;
                }
                Err(_) => return,
            }
        }
    });
}

async fn dispatch_loop(inner: Arc<Inner>, watch: Arc<AsyncMutex<WatchChan>>) {
    let mut rx = watch.lock().await;
    loop {
        let fire = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(fire) => fire,
                None => return,
            },
        };

        info!(key = %fire.key, "received fire event");

        #[cfg(test)]
        if fire.key == PANIC_FIRE_KEY {
            panic!("injected dispatch panic");
        }

        let job = match Job::unmarshal(&fire.value) {
            Ok(job) => job,
            Err(err) => {
                error!(
                    key = %fire.key,
                    value = %fire.value,
                    timestamp = fire.time_now,
                    error = %err,
                    "cannot decode job envelope",
                );
                continue;
            }
        };

        let Some(handler) = inner.handlers.get(&job.tag) else {
            warn!(key = %fire.key, tag = %job.tag, "no handler registered for job tag");
            continue;
        };

        // Fan out; the loop keeps receiving without awaiting the fire.
        tokio::spawn(run_fire(inner.clone(), handler, job.clone()));

        if job.cycle {
            // Best effort: the envelope's delay_time is reused as-is, and a
            // missed window or shutdown breaks the chain.
            if let Err(err) = inner.add_job(&job).await {
                error!(key = %job.key, tag = %job.tag, error = %err, "failed to re-arm cyclic job");
            }
        }
    }
}

/// Execute one fire under the cluster-wide per-job lock.
async fn run_fire(inner: Arc<Inner>, handler: Arc<dyn Handler>, job: Job) {
    let digest = md5::compute(format!("{}{}", job.key, job.tag));
    let job_hash = hex::encode(digest.0);

    match inner.store.try_lock(&job_hash).await {
        Ok(()) => {}
        Err(err) if err.is_locked() => {
            info!(key = %job.key, "job is already running on another node");
            return;
        }
        Err(err) => {
            error!(key = %job.key, error = %err, "failed to acquire job lock");
            return;
        }
    }

    let started = Instant::now();
    if let Err(err) = handler.handle(job.clone()).await {
        error!(key = %job.key, tag = %job.tag, error = %err, "handler reported error");
    }
    let cost_seconds = started.elapsed().as_secs_f64();
    if let Some(metrics) = &inner.metrics {
        metrics.record_run_cost(&inner.server_name, &job.key, cost_seconds);
    }

    tokio::time::sleep(LOCK_SETTLE_DELAY).await;
    if let Err(err) = inner.store.unlock(&job_hash).await {
        error!(key = %job.key, error = %err, "failed to release job lock");
    }
}
