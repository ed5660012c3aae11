//! Error types for the elastic job engine.

use snafu::Snafu;

use crate::storage::StorageError;

/// Errors returned by the engine's public operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum JobError {
    /// The job's fire time is not in the future; nothing was written.
    #[snafu(display("delay_time must be in the future"))]
    DelayInPast,

    /// The job envelope could not be serialized.
    #[snafu(display("failed to encode job envelope: {source}"))]
    EncodeJob {
        /// Serializer error.
        source: serde_json::Error,
    },

    /// A backend request made on behalf of an engine operation failed.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// Backend error.
        source: StorageError,
    },

    /// The selected backend could not be brought up.
    #[snafu(display("storage init error: {source}"))]
    StorageInit {
        /// Backend error.
        source: StorageError,
    },
}
