//! Error types and behavior classification.
//!
//! Sluice distinguishes error *kinds* by what the run loop does with them:
//! the suicide class restarts the capture, compacted revisions retry the
//! campaign, storage not-found is treated as empty data, and everything else
//! propagates to the process boundary.

use thiserror::Error;

/// Common Sluice error conditions.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Recoverable failure class: the capture must restart its run loop.
    /// Not an operator-visible failure.
    #[error("capture suicide, the run loop restarts")]
    CaptureSuicide,

    /// A revision observed while waiting in a campaign has been compacted.
    #[error("revision {revision} has been compacted; compaction floor is {floor}")]
    Compacted { revision: u64, floor: u64 },

    /// The coordination session reported itself done.
    #[error("coordination session is done")]
    SessionDone,

    /// The session lease expired or was revoked.
    #[error("lease {lease_id} expired or not found")]
    LeaseExpired { lease_id: i64 },

    /// Generic coordination-store API failure.
    #[error("coordination store api: {message}")]
    CoordApi { message: String },

    /// External storage write/delete/list failure.
    #[error("external storage api: {message}")]
    ExternalStorageApi { message: String },

    /// A read of a missing object. Callers treat this as empty, not fatal.
    #[error("file not found in external storage: {path}")]
    FileNotFound { path: String },

    /// Redo meta initialization failed; fatal to the current run, retried
    /// after the capture restarts.
    #[error("redo meta initialize: {0}")]
    RedoMetaInitialize(#[source] Box<SluiceError>),

    /// Serialization of a wire or storage payload failed.
    #[error("marshal failed: {message}")]
    MarshalFailed { message: String },

    /// Owner campaign failed.
    #[error("campaign owner: {0}")]
    CampaignOwner(#[source] Box<SluiceError>),

    /// Owner resignation failed.
    #[error("resign owner: {0}")]
    ResignOwner(#[source] Box<SluiceError>),

    /// Registering the capture in the coordination store failed.
    #[error("capture registration: {0}")]
    CaptureRegister(#[source] Box<SluiceError>),

    /// The capture has not been reset yet; its info is not available.
    #[error("capture is not initialized")]
    CaptureNotInitialized,

    /// This capture does not hold the owner key.
    #[error("this capture is not the owner")]
    NotOwner,

    /// No capture holds the owner key.
    #[error("no owner found in the cluster")]
    OwnerNotFound,

    /// A reactor finished normally; the tick loop exits without error.
    #[error("reactor finished")]
    ReactorFinished,

    /// Peer messaging transport failure.
    #[error("peer messaging: {message}")]
    PeerMessaging { message: String },

    /// The operation observed cancellation.
    #[error("operation canceled")]
    Canceled,

    /// The operation exceeded its deadline.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Rejected configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl SluiceError {
    /// Wrap a coordination-store failure message.
    pub fn coord_api(err: impl std::fmt::Display) -> Self {
        Self::CoordApi {
            message: err.to_string(),
        }
    }

    /// Wrap an external-storage failure message.
    pub fn storage_api(err: impl std::fmt::Display) -> Self {
        Self::ExternalStorageApi {
            message: err.to_string(),
        }
    }

    /// Wrap a serialization failure.
    pub fn marshal(err: impl std::fmt::Display) -> Self {
        Self::MarshalFailed {
            message: err.to_string(),
        }
    }

    /// Wrap a configuration failure.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Strip wrapper variants and return the innermost kind.
    pub fn root(&self) -> &SluiceError {
        match self {
            Self::CampaignOwner(inner)
            | Self::ResignOwner(inner)
            | Self::CaptureRegister(inner)
            | Self::RedoMetaInitialize(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether a read should treat this as "object absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::FileNotFound { .. })
    }

    /// Whether a campaign should be retried after a brief backoff.
    pub fn is_compacted(&self) -> bool {
        matches!(self.root(), Self::Compacted { .. })
    }

    /// Whether this error observed cancellation of the surrounding context.
    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Self::Canceled)
    }

    /// The restart class: suicide, cancellation, and deadline overruns make
    /// the outer run loop reset the capture and run again. Everything else
    /// terminates the process.
    pub fn restarts_capture(&self) -> bool {
        matches!(
            self.root(),
            Self::CaptureSuicide | Self::Canceled | Self::DeadlineExceeded
        )
    }
}

/// Result type using SluiceError.
pub type SluiceResult<T> = Result<T, SluiceError>;
