//! Atomic file writes with explicit permissions
//!
//! The state document, the cluster credential file and the key-pair private
//! key are all written through [`write_atomic`]: the data goes to a sibling
//! temporary file which is fsynced, chmod-ed and then renamed over the target,
//! so readers never observe a half-written document.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Owner read/write
pub const MODE_PRIVATE: u32 = 0o600;

/// Owner read-only, for private key material
pub const MODE_READ_ONLY: u32 = 0o400;

/// Owner rwx, group/other rx
pub const MODE_EXECUTABLE: u32 = 0o755;

/// Atomically replace `path` with `contents` and set `mode`
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_sibling(path);

    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(MODE_PRIVATE)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(format!("write {}", path.display()), e)
    })
}

/// Create the parent directory of `path` if missing
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
    }
    Ok(())
}

/// Returns true if the file exists and any execute bit is set
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Set the permission bits of an existing file
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("chmod {}", path.display()), e))
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("remove {}", path.display()), e)),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ekstest".to_string());
    path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}
