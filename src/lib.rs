//! Distributed delayed / periodic task executor.
//!
//! Jobs are stored in a backend (etcd or redis) under a TTL equal to their
//! delay; the backend's expiry notifications become fire events, and a
//! cluster-wide lock keyed on the job ensures exactly one engine process in
//! a fleet runs each fire.
//!
//! # Example
//!
//! ```ignore
//! use elastic_job::{ElasticJob, Job, StorageConfig, StorageKind};
//!
//! let engine = ElasticJob::builder()
//!     .storage(StorageKind::Etcd, StorageConfig {
//!         endpoints: vec!["127.0.0.1:2379".to_string()],
//!         ..Default::default()
//!     })
//!     .server_name("checkout")
//!     .build()
//!     .await?;
//!
//! engine.register_handler("RELEASE_STOCK", |job: Job| async move {
//!     println!("releasing stock for {}", job.key);
//!     Ok(())
//! });
//!
//! engine.add_job(&Job {
//!     key: "/checkout/10086".to_string(),
//!     delay_time: chrono::Utc::now().timestamp() + 30,
//!     cycle: false,
//!     tag: "RELEASE_STOCK".to_string(),
//!     args: Default::default(),
//! })
//! .await?;
//! ```
//!
//! Delivery is best effort: a fire is produced at most once per saved key,
//! cyclic jobs re-arm themselves only while the engine is up, and the redis
//! backend may deliver a fire whose value was already evicted. Handlers
//! must tolerate both.

#![warn(missing_docs)]

mod engine;
pub mod error;
pub mod global;
mod job;
pub mod metrics;
mod registry;
pub mod storage;

pub use engine::ElasticJob;
pub use engine::ElasticJobBuilder;
pub use error::JobError;
pub use job::Handler;
pub use job::Job;
pub use metrics::JobMetrics;
pub use storage::BackendStorage;
pub use storage::StorageConfig;
pub use storage::StorageError;
pub use storage::StorageKind;
pub use storage::WatchChan;
pub use storage::WatchResponse;
