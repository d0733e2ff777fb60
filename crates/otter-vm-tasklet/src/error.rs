//! Tasklet error types
//!
//! None of these errors cross the capture/resume boundary as a value.
//! Accessors return them so that the engine can report a precise
//! invariant violation before failing fast.

use crate::tasklet::TaskletId;
use thiserror::Error;

/// Errors raised by tasklet buffers, the arena and the registry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskletError {
    /// A word or byte range fell outside a captured buffer
    #[error("offset {offset} (+{width}) is outside a {len} byte stack buffer")]
    OffsetOutOfBounds {
        /// Byte offset into the buffer
        offset: usize,
        /// Access width in bytes
        width: usize,
        /// Buffer length
        len: usize,
    },

    /// The walker reported a frame whose caller SP lies below its SP
    #[error("invalid frame extent: sp={sp:#x} end={end:#x}")]
    InvalidFrameExtent {
        /// Frame stack pointer
        sp: usize,
        /// Exclusive end of the frame data
        end: usize,
    },

    /// The return type cannot be delivered by the resume trampoline
    #[error("unsupported return type classification: {0}")]
    UnsupportedReturnType(&'static str),

    /// Handle refers to a tasklet that was already consumed or deleted
    #[error("stale tasklet handle {0:?}")]
    StaleTasklet(TaskletId),

    /// Only chain heads may be registered
    #[error("tasklet {0:?} is not the head of its chain")]
    NotChainHead(TaskletId),

    /// Chain head is already present in the live list
    #[error("tasklet {0:?} is already registered")]
    AlreadyRegistered(TaskletId),

    /// Chain head is not present in the live list
    #[error("tasklet {0:?} is not registered")]
    NotRegistered(TaskletId),

    /// Live list linkage is inconsistent
    #[error("corrupt tasklet registry: {0}")]
    CorruptRegistry(String),

    /// A configuration value could not be parsed
    #[error("invalid value {value:?} for {var}")]
    InvalidConfig {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// Result alias for tasklet operations
pub type TaskletResult<T> = Result<T, TaskletError>;

/// Report an invariant violation and fail fast.
///
/// Release builds are compiled with `panic = "abort"`, so this terminates
/// the process there.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(what: impl std::fmt::Display) -> ! {
    tracing::error!(target: "otter::tasklet", "tasklet invariant violated: {what}");
    panic!("tasklet invariant violated: {what}");
}

/// Extension for unwrapping results whose failure is an invariant violation
pub(crate) trait OrFatal<T> {
    /// Unwrap or fail fast
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for TaskletResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => invariant_violation(err),
        }
    }
}
