//! Small file helpers shared by the artifact writers

use crate::binding::Change;
use crate::error::{RegistryError, RegistryResult};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Read a file, treating a missing file as empty
pub(crate) fn read_or_empty(path: &Path) -> RegistryResult<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(RegistryError::io(
            format!("failed to read {}", path.display()),
            e,
        )),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Replace `path` with `data` via write-to-temp then rename
///
/// Readers never observe a half-written file. Permissions of an existing
/// file are carried over (sshd refuses group-writable `authorized_keys`).
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> RegistryResult<()> {
    let temp = temp_path(path);
    let context = || format!("failed to write {}", path.display());

    let mut file = File::create(&temp).map_err(|e| RegistryError::io(context(), e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| RegistryError::io(context(), e))?;
    drop(file);

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&temp, meta.permissions())
            .map_err(|e| RegistryError::io(context(), e))?;
    }

    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        RegistryError::io(context(), e)
    })
}

/// Write only when the content differs from what is on disk
pub(crate) fn write_if_changed(path: &Path, data: &[u8]) -> RegistryResult<Change> {
    match fs::read(path) {
        Ok(existing) if existing == data => return Ok(Change::Unchanged),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(RegistryError::io(
                format!("failed to read {}", path.display()),
                e,
            ))
        }
    }

    write_atomic(path, data)?;
    Ok(Change::Changed)
}
