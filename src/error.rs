use thiserror::Error;

/// Error taxonomy for a replication run.
///
/// The split matters to the run loop: configuration problems abort before any
/// transfer starts, protocol problems abort only the connection, a missing
/// target definition skips one batch, and `AllTargetsExhausted` halts the
/// whole run because it signals a systemic capacity problem rather than a
/// per-item one.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every candidate location for a target sits at or below its minimum
    /// free-space threshold. Fatal for the run; the allocator returns this as
    /// a value and the top-level loop decides to halt.
    #[error("all locations for library {library} are below the specified minimum of {minimum}")]
    AllTargetsExhausted { library: String, minimum: String },

    /// An I/O failure copying or streaming one item. Logged and counted by
    /// the caller; never aborts the batch or the run.
    #[error("transfer failed for {path}: {source}")]
    Transfer {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True for conditions that must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::AllTargetsExhausted { .. }
        )
    }
}
