//! Error types for the relocation queue subsystem.

use thiserror::Error;

/// Errors surfaced by the relocation queue, its fetcher, and its relocators.
///
/// Most variants never reach a caller: transient fetch errors are retried
/// inside the fetcher, and cancellation unwinds silently. The variants here
/// are the ones the driver loop's error channel actually has to decide what
/// to do with.
#[derive(Error, Debug)]
pub enum DistributeError {
    /// The source fetcher exhausted its retry budget against the
    /// authoritative range→servers directory.
    #[error("source fetch failed for range: {0}")]
    SourceFetch(String),

    /// The external key-mover reported the destination as a removed
    /// server; the relocator retries from `Selecting`.
    #[error("move targeted a removed server")]
    MoveToRemovedServer,

    /// No healthy destination team could be found within the retry budget.
    #[error("no healthy destination team available after {attempts} attempts")]
    TeamUnavailable {
        /// Number of team-selection attempts made before giving up.
        attempts: u32,
    },

    /// The task was cancelled (superseded enqueue or shutdown). Not an
    /// operational failure; callers should not escalate this.
    #[error("relocation cancelled")]
    Cancelled,

    /// The relocator's external key-move or team-selection collaborator
    /// returned an error that isn't one of the recognized recoverable
    /// kinds above.
    #[error("relocator failed: {0}")]
    Relocator(String),

    /// Raised during a controlled shutdown; logged at info, never
    /// escalated.
    #[error("shutdown in progress: {0}")]
    Shutdown(String),

    /// A debug-only consistency check failed. Never returned in release
    /// builds; logged as a severe error rather than propagated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Configuration failed to parse or load.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DistributeError {
    /// Stable label for metrics, independent of the (free-form) message
    /// text carried in most variants.
    pub fn error_type(&self) -> &'static str {
        match self {
            DistributeError::SourceFetch(_) => "source_fetch",
            DistributeError::MoveToRemovedServer => "move_to_removed_server",
            DistributeError::TeamUnavailable { .. } => "team_unavailable",
            DistributeError::Cancelled => "cancelled",
            DistributeError::Relocator(_) => "relocator",
            DistributeError::Shutdown(_) => "shutdown",
            DistributeError::Validation(_) => "validation",
            DistributeError::Config(_) => "config",
        }
    }

    /// Whether this error is expected during controlled shutdown or
    /// cancellation and therefore should not be escalated to the core's
    /// error channel ("no error surfaced").
    pub fn is_benign(&self) -> bool {
        matches!(self, DistributeError::Cancelled | DistributeError::Shutdown(_))
    }
}

impl From<serde_json::Error> for DistributeError {
    fn from(err: serde_json::Error) -> Self {
        DistributeError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DistributeError>;
