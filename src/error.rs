//! Error types for the replacement controller.

use snafu::Snafu;

use crate::instance::InstanceId;

/// Result type for replacement operations.
pub type Result<T, E = ReplacementError> = std::result::Result<T, E>;

/// Boxed collaborator error crossing an async seam.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can abort a rolling replacement.
///
/// Collaborator failures are not retried here: the controller's optimistic
/// shadow state makes mid-flight recovery unsafe, so the surrounding
/// deployment supervisor decides whether to retry or abort.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReplacementError {
    /// Instance tracker call failed.
    #[snafu(display("instance tracker operation failed: {source}"))]
    TrackerFailure {
        /// Source error.
        source: CollaboratorError,
    },

    /// Kill service call failed.
    #[snafu(display("kill of instance {id} failed: {source}"))]
    KillFailure {
        /// Instance that could not be killed.
        id: InstanceId,
        /// Source error.
        source: CollaboratorError,
    },

    /// Launch queue call failed.
    #[snafu(display("launch of {count} instances failed: {source}"))]
    LaunchFailure {
        /// Number of instances requested.
        count: usize,
        /// Source error.
        source: CollaboratorError,
    },

    /// The controller fell behind the instance event bus.
    #[snafu(display("instance event bus lagged, {skipped} events lost"))]
    EventBusLagged {
        /// Number of events dropped by the broadcast channel.
        skipped: u64,
    },

    /// The deployment ended before the completion invariant held.
    #[snafu(display("deployment aborted: {reason}"))]
    DeploymentAborted {
        /// Why the deployment ended early.
        reason: String,
    },
}
