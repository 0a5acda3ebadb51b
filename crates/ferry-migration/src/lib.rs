//! Machine-level save, restore and live migration.
//!
//! Components register their state in a [`Registry`]. [`save_vm_state`] and [`loadvm_state`]
//! move the whole machine through a [`ferry_vmstate::Channel`]; [`migrate`] does the same over an
//! async byte stream while the guest keeps running, with [`RamMigration`] streaming guest memory.

pub mod config;
pub mod error;
pub mod migration;
pub mod ram;
pub mod registry;
pub mod savevm;
pub mod snapshot;
pub mod xbzrle;

pub use crate::config::{MigrationParams, SaveVmConfig};
pub use crate::error::{MigrationError, Result};
pub use crate::migration::{incoming, migrate, MigrationStats};
pub use crate::ram::{
    GuestRam, RamMigration, RamMigrationOptions, RamStats, VecRam, XbzrleStats, RAM_IDSTR,
    RAM_VERSION_ID,
};
pub use crate::registry::{
    CompatEntry, InstanceId, IterationStatus, LiveSaveHandler, MachineSync, OpaqueId,
    RegisterOptions, Registered, Registry, SaveHandlers, SaveStateEntry, SaveStateHandler,
    VmStateObject,
};
pub use crate::savevm::{
    loadvm_state, save_device_state, save_vm_state, savevm_state_begin, savevm_state_blocked,
    savevm_state_cancel, savevm_state_cleanup, savevm_state_complete, savevm_state_iterate,
    savevm_state_pending, SectionType, VM_FILE_MAGIC, VM_FILE_VERSION, VM_FILE_VERSION_COMPAT,
};
pub use crate::snapshot::{delete_snapshot, list_snapshots, load_snapshot, save_snapshot};
pub use crate::xbzrle::{Encoded, XbzrleError};
