//! Green stack error types

use thiserror::Error;

/// Errors raised by the segmented stack allocator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GreenStackError {
    /// Segment size plus red zone does not form a valid allocation
    #[error("invalid stack segment size: {size} bytes plus {red_zone} byte red zone")]
    InvalidSegmentSize {
        /// Usable bytes requested
        size: usize,
        /// Red zone bytes
        red_zone: usize,
    },

    /// A grown frame returned past the first segment
    #[error("stack segment list underflow")]
    SegmentUnderflow,

    /// OS stack requested before the OS stack was snapshotted
    #[error("no OS stack snapshot for this green thread")]
    NoOsStack,

    /// Operation requires running on a green thread
    #[error("not running on a green thread")]
    NotInGreenThread,

    /// Thread is already running a green thread
    #[error("already running on a green thread")]
    AlreadyInGreenThread,

    /// The segment list is still the running stack
    #[error("green stack is still in use")]
    StackInUse,

    /// A configuration value could not be parsed
    #[error("invalid value {value:?} for {var}")]
    InvalidConfig {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// Result alias for green stack operations
pub type GreenStackResult<T> = Result<T, GreenStackError>;

/// Log and fail fast. Release builds abort on panic.
#[cold]
#[track_caller]
pub(crate) fn fatal(err: GreenStackError) -> ! {
    tracing::error!(target: "otter::green", %err, "green stack failure");
    panic!("green stack failure: {err}");
}
