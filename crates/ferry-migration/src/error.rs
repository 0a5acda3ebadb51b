use std::io;

use ferry_vmstate::{ChannelError, VmStateError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    VmState(#[from] VmStateError),

    #[error("not a migration stream (magic {0:#010x})")]
    BadMagic(u32),

    #[error("SaveVM v2 format is obsolete")]
    ObsoleteVersion,

    #[error("unsupported migration stream version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown section type {0:#04x}")]
    UnknownSectionType(u8),

    #[error("unknown section id {0}")]
    UnknownSectionId(u32),

    #[error("unknown section or instance '{idstr}' {instance_id}")]
    UnknownEntity { idstr: String, instance_id: u32 },

    #[error("unsupported version {version_id} for '{idstr}' v{supported}")]
    EntityVersionTooNew {
        idstr: String,
        version_id: u32,
        supported: u32,
    },

    #[error("'{idstr}' instance {instance_id} is already registered")]
    DuplicateEntity { idstr: String, instance_id: u32 },

    #[error("section name '{0}' does not fit a 1-byte length")]
    IdstrTooLong(String),

    #[error("no free instance id left for '{0}'")]
    InstanceIdExhausted(String),

    #[error("no free section id left")]
    SectionIdExhausted,

    #[error("state blocked by non-migratable device '{0}'")]
    Blocked(String),

    #[error("configuration section missing")]
    ConfigurationMissing,

    #[error("missing section footer for {idstr}")]
    MissingFooter { idstr: String },

    #[error("mismatched section id in footer for {idstr}: read {read:#x}, expected {expected:#x}")]
    FooterMismatch {
        idstr: String,
        read: u32,
        expected: u32,
    },

    #[error("corrupt RAM stream: {0}")]
    RamCorrupt(&'static str),

    #[error(transparent)]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("invalid snapshot name {0:?}")]
    InvalidSnapshotName(String),

    #[error("snapshot {0:?} not found")]
    SnapshotNotFound(String),

    #[error("{idstr}: {message}")]
    Entity { idstr: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MigrationError {
    /// Failure reported by an entity's own save or load handler.
    pub fn entity(idstr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Entity {
            idstr: idstr.into(),
            message: message.into(),
        }
    }
}
