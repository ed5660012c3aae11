//! Job envelope and handler types.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

/// A delayed (or periodic) task envelope.
///
/// The envelope is what callers submit and what handlers receive back once
/// the delay elapses. It travels through the backend as a JSON string, so
/// every field must survive a serialize/deserialize round trip.
///
/// Field names are capitalized on the wire so that envelopes written by
/// other implementations of the same protocol decode unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    /// Opaque identifier, conventionally `/service/id`. Unique per logical
    /// task instance in the cluster.
    pub key: String,
    /// Fire time as seconds since the Unix epoch (absolute, not relative).
    pub delay_time: i64,
    /// Re-arm the job after each fire, reusing this envelope.
    pub cycle: bool,
    /// Handler selector. A fire whose tag has no registered handler is
    /// logged and dropped.
    pub tag: String,
    /// Task arguments, carried opaquely to the handler.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Serialize the envelope to its JSON wire form.
    pub fn marshal(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// Fails if the payload is not a syntactically valid envelope. A
    /// missing `Args` document decodes to an empty map.
    pub fn unmarshal(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A callback invoked with the decoded envelope when a job fires.
///
/// Handlers run on their own task; returning an error only logs it, the
/// engine does not retry. Implement this for a type, or use any
/// `Fn(Job) -> Future` closure directly:
///
/// ```ignore
/// engine.register_handler("REPORT", |job: Job| async move {
///     println!("firing {}", job.key);
///     Ok(())
/// });
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Execute the fired job.
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        (self)(job).await
    }
}
