use thiserror::Error;

/// Errors surfaced by the queue API itself: enqueue and direct store access.
///
/// Everything that goes wrong inside a worker cycle is reported through the
/// configured log sinks and the job row instead.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A payload or output value could not be serialized as JSON.
    #[error("failed to serialize job data")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Handler registration misuse.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("a handler is already registered for operation {0}")]
    DuplicateHandler(String),
}
