//! Section framing and the save/load state machine.
//!
//! A stream is a header (magic, format version and optionally a configuration section) followed
//! by tagged sections until [`SectionType::EOF`]. Live entities contribute a START section in
//! [`savevm_state_begin`], any number of PART sections from [`savevm_state_iterate`] and one END
//! section in [`savevm_state_complete`]; every other entity contributes one FULL section at
//! completion. A plain snapshot runs all three phases back to back.

use std::fmt;
use std::sync::OnceLock;

use ferry_vmstate::{
    vmstate_single, vmstate_vbuffer, Channel, VmStateDescription, VmStateError, UINT32,
};

use crate::error::{MigrationError, Result};
use crate::registry::{IterationStatus, Registry, SaveHandlers, SaveStateEntry};

pub const VM_FILE_MAGIC: u32 = 0x5145_564d;
pub const VM_FILE_VERSION_COMPAT: u32 = 0x0000_0002;
pub const VM_FILE_VERSION: u32 = 0x0000_0003;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionType(pub u8);

impl SectionType {
    pub const EOF: SectionType = SectionType(0x00);
    pub const START: SectionType = SectionType(0x01);
    pub const PART: SectionType = SectionType(0x02);
    pub const END: SectionType = SectionType(0x03);
    pub const FULL: SectionType = SectionType(0x04);
    /// Only appears inside a section payload, see [`ferry_vmstate::VMSTATE_SUBSECTION`].
    pub const SUBSECTION: SectionType = SectionType(ferry_vmstate::VMSTATE_SUBSECTION);
    pub const CONFIGURATION: SectionType = SectionType(0x07);
    pub const FOOTER: SectionType = SectionType(0x7e);

    pub fn name(self) -> Option<&'static str> {
        match self {
            SectionType::EOF => Some("EOF"),
            SectionType::START => Some("START"),
            SectionType::PART => Some("PART"),
            SectionType::END => Some("END"),
            SectionType::FULL => Some("FULL"),
            SectionType::SUBSECTION => Some("SUBSECTION"),
            SectionType::CONFIGURATION => Some("CONFIGURATION"),
            SectionType::FOOTER => Some("FOOTER"),
            _ => None,
        }
    }

    /// START and FULL carry the entity identity; PART and END only the section id.
    pub fn has_identity(self) -> bool {
        self == SectionType::START || self == SectionType::FULL
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Default)]
struct ConfigurationState {
    len: u32,
    name: Vec<u8>,
    local: String,
}

fn vmstate_configuration() -> &'static VmStateDescription<ConfigurationState> {
    static VMSD: OnceLock<VmStateDescription<ConfigurationState>> = OnceLock::new();
    VMSD.get_or_init(|| {
        VmStateDescription::new("configuration", 1)
            .pre_save(|s: &mut ConfigurationState| {
                s.name = s.local.as_bytes().to_vec();
                s.len = u32::try_from(s.name.len())
                    .map_err(|_| {
                        VmStateError::hook("configuration", "machine name too long")
                    })?;
                Ok(())
            })
            .post_load(|s: &mut ConfigurationState, _| {
                if s.name != s.local.as_bytes() {
                    return Err(VmStateError::hook(
                        "configuration",
                        format!(
                            "machine type received is '{}' and local is '{}'",
                            String::from_utf8_lossy(&s.name),
                            s.local
                        ),
                    ));
                }
                Ok(())
            })
            .field(vmstate_single!(ConfigurationState, len, &UINT32))
            .field(vmstate_vbuffer!(ConfigurationState, name, len))
    })
}

fn configuration_state(registry: &Registry) -> ConfigurationState {
    ConfigurationState {
        local: registry.config().machine_name.clone(),
        ..ConfigurationState::default()
    }
}

fn save_header(registry: &Registry, ch: &mut Channel) -> Result<()> {
    ch.put_be32(VM_FILE_MAGIC);
    ch.put_be32(VM_FILE_VERSION);
    if registry.config().send_configuration {
        ch.put_u8(SectionType::CONFIGURATION.0);
        let mut state = configuration_state(registry);
        vmstate_configuration().save(ch, &mut state)?;
    }
    Ok(())
}

fn save_section_header(ch: &mut Channel, entry: &SaveStateEntry, section_type: SectionType) {
    tracing::trace!(
        section = %section_type,
        section_id = entry.section_id(),
        idstr = entry.idstr(),
        "section start"
    );
    ch.put_u8(section_type.0);
    ch.put_be32(entry.section_id());
    if section_type.has_identity() {
        ch.put_counted_string(entry.idstr());
        ch.put_be32(entry.instance_id());
        ch.put_be32(entry.version_id());
    }
}

fn save_section_footer(footers: bool, ch: &mut Channel, entry: &SaveStateEntry) {
    if footers {
        ch.put_u8(SectionType::FOOTER.0);
        ch.put_be32(entry.section_id());
    }
}

fn save_full_section(ch: &mut Channel, entry: &mut SaveStateEntry) -> Result<bool> {
    let needed = match entry.handlers() {
        SaveHandlers::VmState(obj) => obj.is_needed(),
        SaveHandlers::Legacy(_) => true,
        SaveHandlers::Live(_) => return Ok(false),
    };
    if !needed {
        return Ok(false);
    }

    save_section_header(ch, entry, SectionType::FULL);
    match entry.handlers_mut() {
        SaveHandlers::VmState(obj) => obj.save(ch)?,
        SaveHandlers::Legacy(handler) => handler.save_state(ch),
        SaveHandlers::Live(_) => {}
    }
    Ok(true)
}

/// Fails if any registered entity refuses to be migrated.
pub fn savevm_state_blocked(registry: &Registry) -> Result<()> {
    match registry.entries().iter().find_map(SaveStateEntry::blocker) {
        Some(idstr) => Err(MigrationError::Blocked(idstr.to_string())),
        None => Ok(()),
    }
}

/// Invoke every live entity's cancel callback.
pub fn savevm_state_cancel(registry: &mut Registry) {
    tracing::debug!("cancelling live state save");
    for entry in registry.entries_mut() {
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            handler.cancel();
        }
    }
}

/// Invoke every live entity's cleanup callback.
pub fn savevm_state_cleanup(registry: &mut Registry) {
    for entry in registry.entries_mut() {
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            handler.cleanup();
        }
    }
}

fn cancel_on_error<T>(registry: &mut Registry, result: Result<T>) -> Result<T> {
    if result.is_err() {
        savevm_state_cancel(registry);
    }
    result
}

/// Write the stream header and a START section for each active live entity.
///
/// On failure every live entity is cancelled before the error is returned.
pub fn savevm_state_begin(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    let result = begin(registry, ch);
    cancel_on_error(registry, result)
}

fn begin(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    save_header(registry, ch)?;

    let footers = registry.config().section_footers;
    for entry in registry.entries_mut() {
        entry.set_completed(false);
        let SaveHandlers::Live(handler) = entry.handlers() else {
            continue;
        };
        if !handler.is_active() {
            continue;
        }
        save_section_header(ch, entry, SectionType::START);
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            handler.setup(ch)?;
        }
        save_section_footer(footers, ch, entry);
        ch.check_error()?;
    }
    ch.check_error()?;
    Ok(())
}

/// Send one PART section per active live entity that has not yet finished, stopping at the rate
/// limit or at the first entity that still has data left.
///
/// Returns [`IterationStatus::Complete`] once every live entity has sent everything (or there
/// are none). On failure every live entity is cancelled before the error is returned.
pub fn savevm_state_iterate(registry: &mut Registry, ch: &mut Channel) -> Result<IterationStatus> {
    let result = iterate(registry, ch);
    cancel_on_error(registry, result)
}

fn iterate(registry: &mut Registry, ch: &mut Channel) -> Result<IterationStatus> {
    let footers = registry.config().section_footers;
    let mut status = IterationStatus::Complete;
    for entry in registry.entries_mut() {
        let SaveHandlers::Live(handler) = entry.handlers() else {
            continue;
        };
        if !handler.is_active() || entry.is_completed() {
            continue;
        }
        if ch.rate_limit_exceeded() {
            ch.check_error()?;
            return Ok(IterationStatus::Continue);
        }
        save_section_header(ch, entry, SectionType::PART);
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            status = handler.iterate(ch)?;
        }
        save_section_footer(footers, ch, entry);
        if status == IterationStatus::Complete {
            entry.set_completed(true);
        } else {
            // Later entities wait until this one has sent everything.
            break;
        }
    }
    ch.check_error()?;
    Ok(status)
}

/// Synchronize the machine, then write END for each live entity, FULL for every other needed
/// entity, and EOF.
///
/// On failure every live entity is cancelled before the error is returned.
pub fn savevm_state_complete(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    let result = complete(registry, ch);
    cancel_on_error(registry, result)
}

fn complete(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    registry.synchronize_all_states();

    let footers = registry.config().section_footers;
    for entry in registry.entries_mut() {
        let SaveHandlers::Live(handler) = entry.handlers() else {
            continue;
        };
        if !handler.is_active() {
            continue;
        }
        save_section_header(ch, entry, SectionType::END);
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            handler.complete(ch)?;
        }
        save_section_footer(footers, ch, entry);
        ch.check_error()?;
    }

    for entry in registry.entries_mut() {
        if save_full_section(ch, entry)? {
            save_section_footer(footers, ch, entry);
        }
    }

    ch.put_u8(SectionType::EOF.0);
    ch.flush();
    ch.check_error()?;
    Ok(())
}

/// Sum of the bytes every active live entity still has to send.
pub fn savevm_state_pending(registry: &mut Registry, max_size: u64) -> u64 {
    let mut pending = 0u64;
    for entry in registry.entries_mut() {
        if let SaveHandlers::Live(handler) = entry.handlers_mut() {
            if handler.is_active() {
                pending = pending.saturating_add(handler.pending(max_size));
            }
        }
    }
    pending
}

/// Save the whole machine in one go: begin, iterate until done, complete.
pub fn save_vm_state(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    savevm_state_blocked(registry)?;

    let result = (|| {
        savevm_state_begin(registry, ch)?;
        while savevm_state_iterate(registry, ch)? == IterationStatus::Continue {}
        savevm_state_complete(registry, ch)
    })();

    savevm_state_cleanup(registry);
    if let Err(err) = &result {
        tracing::warn!(%err, "error while writing VM state");
    }
    result
}

/// Save every non-live entity, without RAM or other live state.
pub fn save_device_state(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    save_header(registry, ch)?;
    registry.synchronize_all_states();

    let footers = registry.config().section_footers;
    for entry in registry.entries_mut() {
        if save_full_section(ch, entry)? {
            save_section_footer(footers, ch, entry);
        }
    }

    ch.put_u8(SectionType::EOF.0);
    ch.flush();
    ch.check_error()?;
    Ok(())
}

struct LoadRecord {
    section_id: u32,
    entry: usize,
    version_id: u32,
}

fn load_section(registry: &mut Registry, ch: &mut Channel, record: &LoadRecord) -> Result<()> {
    let Some(entry) = registry.entries_mut().get_mut(record.entry) else {
        return Err(MigrationError::UnknownSectionId(record.section_id));
    };
    let result = match entry.handlers_mut() {
        SaveHandlers::VmState(obj) => obj.load(ch, record.version_id).map_err(MigrationError::from),
        SaveHandlers::Legacy(handler) => handler.load_state(ch, record.version_id),
        SaveHandlers::Live(handler) => handler.load_state(ch, record.version_id),
    };
    if let Err(err) = &result {
        tracing::warn!(
            idstr = entry.idstr(),
            instance_id = entry.instance_id(),
            %err,
            "error while loading state"
        );
    }
    result
}

fn check_section_footer(registry: &Registry, ch: &mut Channel, record: &LoadRecord) -> Result<()> {
    if !registry.config().section_footers {
        return Ok(());
    }
    let idstr = registry
        .get(record.entry)
        .map(|e| e.idstr().to_string())
        .unwrap_or_default();
    let mark = ch.get_u8()?;
    if mark != SectionType::FOOTER.0 {
        return Err(MigrationError::MissingFooter { idstr });
    }
    let read = ch.get_be32()?;
    if read != record.section_id {
        return Err(MigrationError::FooterMismatch {
            idstr,
            read,
            expected: record.section_id,
        });
    }
    Ok(())
}

/// Load a stream produced by [`save_vm_state`], a live migration or [`save_device_state`].
///
/// Nothing is touched before the header checks out. Machine post-load synchronization only runs
/// if every section loaded.
pub fn loadvm_state(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    savevm_state_blocked(registry)?;

    let magic = ch.get_be32()?;
    if magic != VM_FILE_MAGIC {
        tracing::warn!(magic, "not a migration stream");
        return Err(MigrationError::BadMagic(magic));
    }
    let version = ch.get_be32()?;
    if version == VM_FILE_VERSION_COMPAT {
        return Err(MigrationError::ObsoleteVersion);
    }
    if version != VM_FILE_VERSION {
        return Err(MigrationError::UnsupportedVersion(version));
    }

    if registry.config().send_configuration {
        if ch.get_u8()? != SectionType::CONFIGURATION.0 {
            return Err(MigrationError::ConfigurationMissing);
        }
        let mut state = configuration_state(registry);
        vmstate_configuration().load(ch, &mut state, 0)?;
    }

    loadvm_state_main(registry, ch)?;
    ch.check_error()?;

    registry.synchronize_all_post_init();
    Ok(())
}

fn loadvm_state_main(registry: &mut Registry, ch: &mut Channel) -> Result<()> {
    let mut records: Vec<LoadRecord> = Vec::new();

    loop {
        let section_type = SectionType(ch.get_u8()?);
        match section_type {
            SectionType::EOF => return Ok(()),
            SectionType::START | SectionType::FULL => {
                let section_id = ch.get_be32()?;
                let idstr = ch.get_counted_string()?;
                let instance_id = ch.get_be32()?;
                let version_id = ch.get_be32()?;
                tracing::trace!(
                    section = %section_type,
                    section_id,
                    idstr = %idstr,
                    instance_id,
                    version_id,
                    "loading section"
                );

                let Some(entry) = registry.find(&idstr, instance_id) else {
                    tracing::warn!(idstr = %idstr, instance_id, "unknown section or instance");
                    return Err(MigrationError::UnknownEntity { idstr, instance_id });
                };
                let supported = registry.entries()[entry].version_id();
                if version_id > supported {
                    tracing::warn!(idstr = %idstr, version_id, supported, "unsupported version");
                    return Err(MigrationError::EntityVersionTooNew {
                        idstr,
                        version_id,
                        supported,
                    });
                }

                let record = LoadRecord {
                    section_id,
                    entry,
                    version_id,
                };
                load_section(registry, ch, &record)?;
                check_section_footer(registry, ch, &record)?;
                records.push(record);
            }
            SectionType::PART | SectionType::END => {
                let section_id = ch.get_be32()?;
                tracing::trace!(section = %section_type, section_id, "loading section");
                let Some(record) = records.iter().rev().find(|r| r.section_id == section_id) else {
                    tracing::warn!(section_id, "unknown section id");
                    return Err(MigrationError::UnknownSectionId(section_id));
                };
                load_section(registry, ch, record)?;
                check_section_footer(registry, ch, record)?;
            }
            other => {
                tracing::warn!(section_type = other.0, "unknown section type");
                return Err(MigrationError::UnknownSectionType(other.0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_type_names() {
        assert_eq!(SectionType::START.to_string(), "START");
        assert_eq!(SectionType(0x42).to_string(), "UNKNOWN(0x42)");
        assert!(SectionType::FULL.has_identity());
        assert!(!SectionType::END.has_identity());
    }
}
