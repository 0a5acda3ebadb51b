//! Table of every stateful component of a machine.
//!
//! The machine builds one [`Registry`] at startup. Components register when they are constructed
//! and unregister when they are torn down; save and load walk the table in registration order.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ferry_vmstate::{Channel, VmStateDescription, VmStateDump};
use serde::Serialize;

use crate::config::SaveVmConfig;
use crate::error::{MigrationError, Result};

/// Identity of the state object behind an entry, used to match `unregister` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueId(usize);

impl OpaqueId {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Identity of the allocation behind `rc`.
    pub fn of<T: ?Sized>(rc: &Rc<T>) -> Self {
        Self(Rc::as_ptr(rc) as *const () as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceId {
    /// One past the highest instance already registered under the same name, or 0.
    Auto,
    Fixed(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Bus path of the owning device. When set, the entry is registered as `"{dev_path}/{idstr}"`
    /// and still answers to the bare `idstr` for streams produced before paths were used.
    pub dev_path: Option<String>,
    /// Additional instance id the entry answers to on load.
    pub alias_id: Option<u32>,
    /// Refuse to save or load while this entry is registered.
    pub no_migrate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    /// More data remains; call again.
    Continue,
    /// Everything has been sent.
    Complete,
}

/// Hand-written save/load pair for state that has no schema.
pub trait SaveStateHandler {
    fn save_state(&mut self, ch: &mut Channel);

    fn load_state(&mut self, ch: &mut Channel, version_id: u32) -> Result<()>;
}

/// State streamed incrementally while the guest keeps running.
///
/// `setup` runs once in the START section, `iterate` in each PART section and `complete` in the
/// END section after the guest has stopped. On load every section is handed to `load_state`.
pub trait LiveSaveHandler {
    fn setup(&mut self, ch: &mut Channel) -> Result<()>;

    fn iterate(&mut self, ch: &mut Channel) -> Result<IterationStatus>;

    fn complete(&mut self, ch: &mut Channel) -> Result<()>;

    /// Bytes still to be sent. Implementations may refresh their estimate when it falls below
    /// `max_size`.
    fn pending(&mut self, max_size: u64) -> u64 {
        let _ = max_size;
        0
    }

    fn is_active(&self) -> bool {
        true
    }

    /// A save failed before `complete`; drop any tracking state.
    fn cancel(&mut self) {}

    /// The save finished, successfully or not.
    fn cleanup(&mut self) {}

    fn load_state(&mut self, ch: &mut Channel, version_id: u32) -> Result<()>;
}

/// Schema-described state, type-erased so entries of different state types share one table.
pub trait VmStateObject {
    fn vmsd_name(&self) -> &'static str;

    fn version_id(&self) -> u32;

    fn is_unmigratable(&self) -> bool;

    fn is_needed(&self) -> bool;

    fn save(&self, ch: &mut Channel) -> ferry_vmstate::Result<()>;

    fn load(&self, ch: &mut Channel, version_id: u32) -> ferry_vmstate::Result<()>;

    fn dump(&self) -> VmStateDump;
}

/// A schema bound to the shared state it describes.
pub struct Registered<T: 'static> {
    pub vmsd: &'static VmStateDescription<T>,
    pub opaque: Rc<RefCell<T>>,
}

impl<T: 'static> VmStateObject for Registered<T> {
    fn vmsd_name(&self) -> &'static str {
        self.vmsd.name()
    }

    fn version_id(&self) -> u32 {
        self.vmsd.version_id()
    }

    fn is_unmigratable(&self) -> bool {
        self.vmsd.is_unmigratable()
    }

    fn is_needed(&self) -> bool {
        self.vmsd.is_needed(&self.opaque.borrow())
    }

    fn save(&self, ch: &mut Channel) -> ferry_vmstate::Result<()> {
        self.vmsd.save(ch, &mut self.opaque.borrow_mut())
    }

    fn load(&self, ch: &mut Channel, version_id: u32) -> ferry_vmstate::Result<()> {
        self.vmsd
            .load(ch, &mut self.opaque.borrow_mut(), version_id)
    }

    fn dump(&self) -> VmStateDump {
        self.vmsd.dump()
    }
}

pub enum SaveHandlers {
    VmState(Box<dyn VmStateObject>),
    Legacy(Box<dyn SaveStateHandler>),
    Live(Box<dyn LiveSaveHandler>),
}

impl fmt::Debug for SaveHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmState(obj) => f.debug_tuple("VmState").field(&obj.vmsd_name()).finish(),
            Self::Legacy(_) => f.write_str("Legacy"),
            Self::Live(_) => f.write_str("Live"),
        }
    }
}

/// Identity an entry also answers to when loading streams from builds without device paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatEntry {
    pub idstr: String,
    pub instance_id: u32,
}

#[derive(Debug)]
pub struct SaveStateEntry {
    idstr: String,
    instance_id: u32,
    alias_id: Option<u32>,
    version_id: u32,
    section_id: u32,
    handlers: SaveHandlers,
    opaque: OpaqueId,
    compat: Option<CompatEntry>,
    no_migrate: bool,
    // Set once a live entity has reported completion during the current iterate phase.
    completed: bool,
}

impl SaveStateEntry {
    pub fn idstr(&self) -> &str {
        &self.idstr
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn alias_id(&self) -> Option<u32> {
        self.alias_id
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn section_id(&self) -> u32 {
        self.section_id
    }

    pub fn compat(&self) -> Option<&CompatEntry> {
        self.compat.as_ref()
    }

    pub fn is_live(&self) -> bool {
        matches!(self.handlers, SaveHandlers::Live(_))
    }

    pub fn handlers(&self) -> &SaveHandlers {
        &self.handlers
    }

    pub(crate) fn handlers_mut(&mut self) -> &mut SaveHandlers {
        &mut self.handlers
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
    }

    /// Reason this entry blocks migration, if any.
    pub fn blocker(&self) -> Option<&str> {
        let unmigratable = match &self.handlers {
            SaveHandlers::VmState(obj) => obj.is_unmigratable(),
            _ => false,
        };
        (self.no_migrate || unmigratable).then_some(self.idstr.as_str())
    }

    fn matches(&self, idstr: &str, instance_id: u32) -> bool {
        self.idstr == idstr
            && (self.instance_id == instance_id || self.alias_id == Some(instance_id))
    }

    fn matches_compat(&self, idstr: &str, instance_id: u32) -> bool {
        match &self.compat {
            Some(compat) => {
                self.idstr.contains(idstr)
                    && compat.idstr == idstr
                    && (compat.instance_id == instance_id || self.alias_id == Some(instance_id))
            }
            None => false,
        }
    }
}

/// Hooks into the machine around save and load.
pub trait MachineSync {
    /// Pull CPU and other cached state into the registered state objects before the final save.
    fn synchronize_all_states(&mut self) {}

    /// Push freshly loaded state back into the machine.
    fn synchronize_all_post_init(&mut self) {}
}

#[derive(Debug, Serialize)]
struct EntityDump<'a> {
    idstr: &'a str,
    instance_id: u32,
    version_id: u32,
    vmstate: VmStateDump,
}

pub struct Registry {
    entries: Vec<SaveStateEntry>,
    next_section_id: u32,
    config: SaveVmConfig,
    machine: Option<Box<dyn MachineSync>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries)
            .field("next_section_id", &self.next_section_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(SaveVmConfig::default())
    }
}

impl Registry {
    pub fn new(config: SaveVmConfig) -> Self {
        Self {
            entries: Vec::new(),
            next_section_id: 0,
            config,
            machine: None,
        }
    }

    pub fn config(&self) -> &SaveVmConfig {
        &self.config
    }

    pub fn set_machine_sync(&mut self, machine: Box<dyn MachineSync>) {
        self.machine = Some(machine);
    }

    pub fn entries(&self) -> &[SaveStateEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [SaveStateEntry] {
        &mut self.entries
    }

    pub(crate) fn synchronize_all_states(&mut self) {
        if let Some(machine) = self.machine.as_mut() {
            machine.synchronize_all_states();
        }
    }

    pub(crate) fn synchronize_all_post_init(&mut self) {
        if let Some(machine) = self.machine.as_mut() {
            machine.synchronize_all_post_init();
        }
    }

    /// Register schema-described state under the schema's name.
    pub fn register_vmstate<T: 'static>(
        &mut self,
        instance_id: InstanceId,
        vmsd: &'static VmStateDescription<T>,
        opaque: Rc<RefCell<T>>,
        options: RegisterOptions,
    ) -> Result<u32> {
        let opaque_id = OpaqueId::of(&opaque);
        self.register(
            vmsd.name(),
            instance_id,
            vmsd.version_id(),
            SaveHandlers::VmState(Box::new(Registered { vmsd, opaque })),
            opaque_id,
            options,
        )
    }

    pub fn register_savevm(
        &mut self,
        idstr: &str,
        instance_id: InstanceId,
        version_id: u32,
        handler: Box<dyn SaveStateHandler>,
        opaque: OpaqueId,
        options: RegisterOptions,
    ) -> Result<u32> {
        self.register(
            idstr,
            instance_id,
            version_id,
            SaveHandlers::Legacy(handler),
            opaque,
            options,
        )
    }

    pub fn register_savevm_live(
        &mut self,
        idstr: &str,
        instance_id: InstanceId,
        version_id: u32,
        handler: Box<dyn LiveSaveHandler>,
        opaque: OpaqueId,
        options: RegisterOptions,
    ) -> Result<u32> {
        self.register(
            idstr,
            instance_id,
            version_id,
            SaveHandlers::Live(handler),
            opaque,
            options,
        )
    }

    /// Add an entry and return its section id.
    pub fn register(
        &mut self,
        idstr: &str,
        instance_id: InstanceId,
        version_id: u32,
        handlers: SaveHandlers,
        opaque: OpaqueId,
        options: RegisterOptions,
    ) -> Result<u32> {
        let (full_idstr, compat, instance_id) = match &options.dev_path {
            Some(path) => {
                let compat_instance = match instance_id {
                    InstanceId::Fixed(id) => id,
                    InstanceId::Auto => self.next_compat_instance_id(idstr)?,
                };
                let compat = CompatEntry {
                    idstr: idstr.to_string(),
                    instance_id: compat_instance,
                };
                (format!("{path}/{idstr}"), Some(compat), InstanceId::Auto)
            }
            None => (idstr.to_string(), None, instance_id),
        };

        if full_idstr.len() > u8::MAX as usize {
            return Err(MigrationError::IdstrTooLong(full_idstr));
        }

        let instance_id = match instance_id {
            InstanceId::Fixed(id) => {
                if self.entries.iter().any(|e| e.idstr == full_idstr && e.instance_id == id) {
                    return Err(MigrationError::DuplicateEntity {
                        idstr: full_idstr,
                        instance_id: id,
                    });
                }
                id
            }
            InstanceId::Auto => self.next_instance_id(&full_idstr)?,
        };

        let section_id = self.next_section_id;
        self.next_section_id = section_id
            .checked_add(1)
            .ok_or(MigrationError::SectionIdExhausted)?;

        tracing::debug!(
            idstr = %full_idstr,
            instance_id,
            version_id,
            section_id,
            "registered savevm entry"
        );

        self.entries.push(SaveStateEntry {
            idstr: full_idstr,
            instance_id,
            alias_id: options.alias_id,
            version_id,
            section_id,
            handlers,
            opaque,
            compat,
            no_migrate: options.no_migrate,
            completed: false,
        });
        Ok(section_id)
    }

    fn next_instance_id(&self, idstr: &str) -> Result<u32> {
        let last = self
            .entries
            .iter()
            .filter(|e| e.idstr == idstr)
            .map(|e| e.instance_id)
            .max();
        following_id(idstr, last)
    }

    fn next_compat_instance_id(&self, idstr: &str) -> Result<u32> {
        let last = self
            .entries
            .iter()
            .filter_map(|e| e.compat.as_ref())
            .filter(|c| c.idstr == idstr)
            .map(|c| c.instance_id)
            .max();
        following_id(idstr, last)
    }

    /// Remove every entry registered as `idstr` (under `dev_path`, if given) for `opaque`.
    pub fn unregister(&mut self, dev_path: Option<&str>, idstr: &str, opaque: OpaqueId) {
        let full_idstr = match dev_path {
            Some(path) => format!("{path}/{idstr}"),
            None => idstr.to_string(),
        };
        self.entries.retain(|e| {
            let remove = e.idstr == full_idstr && e.opaque == opaque;
            if remove {
                tracing::debug!(
                    idstr = %e.idstr,
                    instance_id = e.instance_id,
                    "unregistered savevm entry"
                );
            }
            !remove
        });
    }

    /// Remove the entries registered for `vmsd` over `opaque`.
    pub fn unregister_vmstate<T: 'static>(
        &mut self,
        vmsd: &'static VmStateDescription<T>,
        opaque: &Rc<RefCell<T>>,
    ) {
        let opaque = OpaqueId::of(opaque);
        self.entries.retain(|e| {
            let same_schema = match &e.handlers {
                SaveHandlers::VmState(obj) => obj.vmsd_name() == vmsd.name(),
                _ => false,
            };
            !(same_schema && e.opaque == opaque)
        });
    }

    /// Resolve a wire identity. Exact name matches (own instance id or alias) anywhere in the
    /// table win over compatibility-name matches.
    pub fn find(&self, idstr: &str, instance_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.matches(idstr, instance_id))
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e.matches_compat(idstr, instance_id))
            })
    }

    pub fn get(&self, index: usize) -> Option<&SaveStateEntry> {
        self.entries.get(index)
    }

    /// JSON description of every registered schema, in registration order.
    pub fn dump_vmstate_json(&self) -> serde_json::Result<String> {
        let dumps: Vec<EntityDump<'_>> = self
            .entries
            .iter()
            .filter_map(|e| match &e.handlers {
                SaveHandlers::VmState(obj) => Some(EntityDump {
                    idstr: &e.idstr,
                    instance_id: e.instance_id,
                    version_id: e.version_id,
                    vmstate: obj.dump(),
                }),
                _ => None,
            })
            .collect();
        serde_json::to_string_pretty(&dumps)
    }
}

fn following_id(idstr: &str, last: Option<u32>) -> Result<u32> {
    match last {
        None => Ok(0),
        Some(id) => id
            .checked_add(1)
            .ok_or_else(|| MigrationError::InstanceIdExhausted(idstr.to_string())),
    }
}
