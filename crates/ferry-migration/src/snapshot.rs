//! Named snapshots stored as files in a directory.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use ferry_vmstate::{Channel, ReaderTransport, SeekTransport};

use crate::error::{MigrationError, Result};
use crate::registry::Registry;
use crate::savevm::{loadvm_state, save_vm_state};

pub const SNAPSHOT_EXTENSION: &str = "vmstate";

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(MigrationError::InvalidSnapshotName(name.to_string()));
    }
    Ok(())
}

pub fn snapshot_path(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.join(format!("{name}.{SNAPSHOT_EXTENSION}")))
}

fn not_found(name: &str) -> impl FnOnce(io::Error) -> MigrationError + '_ {
    move |err| match err.kind() {
        io::ErrorKind::NotFound => MigrationError::SnapshotNotFound(name.to_string()),
        _ => MigrationError::Io(err),
    }
}

/// Save the whole machine as snapshot `name` in `dir`, replacing any snapshot of that name.
///
/// The stream is written to a temporary file first, so a failed save leaves an existing snapshot
/// intact.
pub fn save_snapshot(registry: &mut Registry, dir: &Path, name: &str) -> Result<PathBuf> {
    let path = snapshot_path(dir, name)?;
    let tmp = dir.join(format!("{name}.{SNAPSHOT_EXTENSION}.tmp"));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    let mut ch = Channel::new_writer(SeekTransport::new(file, 0));
    let saved = save_vm_state(registry, &mut ch);
    let closed = ch.close().map_err(MigrationError::from);

    if let Err(err) = saved.and(closed) {
        if let Err(rm_err) = fs::remove_file(&tmp) {
            tracing::debug!(path = %tmp.display(), %rm_err, "failed to remove partial snapshot");
        }
        return Err(err);
    }
    fs::rename(&tmp, &path)?;

    tracing::info!(name, path = %path.display(), "snapshot saved");
    Ok(path)
}

/// Restore the machine from snapshot `name` in `dir`.
pub fn load_snapshot(registry: &mut Registry, dir: &Path, name: &str) -> Result<()> {
    let path = snapshot_path(dir, name)?;
    let file = File::open(&path).map_err(not_found(name))?;
    let mut ch = Channel::new_reader(ReaderTransport::new(file));
    loadvm_state(registry, &mut ch)?;
    tracing::info!(name, "snapshot loaded");
    Ok(())
}

pub fn delete_snapshot(dir: &Path, name: &str) -> Result<()> {
    let path = snapshot_path(dir, name)?;
    fs::remove_file(&path).map_err(not_found(name))?;
    tracing::debug!(name, "snapshot deleted");
    Ok(())
}

/// Names of the snapshots in `dir`, sorted.
pub fn list_snapshots(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_with_separators_are_rejected() {
        let dir = Path::new("/snapshots");
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(snapshot_path(dir, bad), Err(MigrationError::InvalidSnapshotName(_))),
                "{bad:?}"
            );
        }
        assert_eq!(
            snapshot_path(dir, "before-upgrade").unwrap(),
            Path::new("/snapshots/before-upgrade.vmstate")
        );
    }

    #[test]
    fn missing_snapshot_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        assert!(matches!(
            load_snapshot(&mut registry, dir.path(), "nope"),
            Err(MigrationError::SnapshotNotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            delete_snapshot(dir.path(), "nope"),
            Err(MigrationError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn empty_machine_snapshot_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        save_snapshot(&mut registry, dir.path(), "b").unwrap();
        save_snapshot(&mut registry, dir.path(), "a").unwrap();
        assert_eq!(list_snapshots(dir.path()).unwrap(), vec!["a", "b"]);

        load_snapshot(&mut registry, dir.path(), "a").unwrap();
        delete_snapshot(dir.path(), "a").unwrap();
        assert_eq!(list_snapshots(dir.path()).unwrap(), vec!["b"]);
    }
}
