use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmStateError>;

/// Sticky channel failure.
///
/// Stored by value inside [`crate::Channel`] once the first transport failure is observed, so it
/// must be cheap to clone and compare. The underlying `std::io::Error` is flattened into its kind
/// and message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transport error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("channel is not open for {0}")]
    WrongMode(&'static str),

    #[error("peek of {len} bytes at offset {offset} exceeds the channel buffer")]
    PeekTooLarge { len: usize, offset: usize },

    #[error("operation failed: {0}")]
    Failed(String),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmStateError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{name}: stream version {version_id} is newer than supported version {supported}")]
    VersionTooNew {
        name: &'static str,
        version_id: u32,
        supported: u32,
    },

    #[error("{name}: stream version {version_id} is older than minimum version {minimum}")]
    VersionTooOld {
        name: &'static str,
        version_id: u32,
        minimum: u32,
    },

    #[error("{info}: loaded value {found} does not match expected {expected}")]
    ValueMismatch {
        info: &'static str,
        expected: String,
        found: String,
    },

    #[error("{field}: element count {count} exceeds capacity {capacity}")]
    CountOverflow {
        field: &'static str,
        count: usize,
        capacity: usize,
    },

    #[error("{field}: cannot save a null pointer")]
    NullPointer { field: &'static str },

    #[error("{field}: expected null pointer marker, found {found:#04x}")]
    MissingNullMarker { field: &'static str, found: u8 },

    #[error("{parent}: unknown subsection {name:?}")]
    UnknownSubsection { parent: &'static str, name: String },

    #[error("{name}: {message}")]
    Hook { name: &'static str, message: String },
}

impl VmStateError {
    /// Convenience constructor for pre-load/post-load hooks rejecting restored state.
    pub fn hook(name: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            name,
            message: message.into(),
        }
    }
}
