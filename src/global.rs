//! Optional process-wide engine.
//!
//! A convenience for applications that want one implicit engine; prefer
//! passing an [`ElasticJob`] handle explicitly.

use std::sync::OnceLock;

use crate::engine::ElasticJob;
use crate::engine::ElasticJobBuilder;
use crate::error::JobError;

static GLOBAL: OnceLock<ElasticJob> = OnceLock::new();

/// Build the process-wide engine from `builder`, exactly once.
///
/// Later calls are no-ops that return `Ok`. If two callers race, the
/// losing engine is closed and discarded.
pub async fn init_global(builder: ElasticJobBuilder) -> Result<(), JobError> {
    if GLOBAL.get().is_some() {
        return Ok(());
    }
    let engine = builder.build().await?;
    if GLOBAL.set(engine.clone()).is_err() {
        let _ = engine.close().await;
    }
    Ok(())
}

/// The process-wide engine.
///
/// # Panics
///
/// Panics when called before [`init_global`].
pub fn global() -> ElasticJob {
    GLOBAL
        .get()
        .cloned()
        .expect("global elastic job is not initialized; call init_global first")
}
