use thiserror::Error;

/// Failures starting or binding the worker.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker executable '{program}' not found")]
    BinaryNotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker was spawned without the named pipe attached.
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
}
