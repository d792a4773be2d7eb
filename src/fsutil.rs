use crate::error::{SwitchError, SwitchResult};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use tempfile::NamedTempFile;

pub fn write_file_atomic(path: &Path, data: &[u8]) -> SwitchResult<()> {
    let parent = path.parent().ok_or_else(|| {
        SwitchError::io(
            format!("invalid target path: {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"),
        )
    })?;
    fs::create_dir_all(parent).map_err(|err| SwitchError::io_at("create dir", parent, err))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| SwitchError::io_at("create temp file in", parent, err))?;
    temp_file
        .write_all(data)
        .map_err(|err| SwitchError::io_at("write temp file for", path, err))?;
    set_private(temp_file.as_file());

    temp_file
        .persist(path)
        .map_err(|err| SwitchError::io_at("persist", path, err.error))?;
    Ok(())
}

pub fn copy_path(source: &Path, destination: &Path) -> SwitchResult<()> {
    let metadata =
        fs::symlink_metadata(source).map_err(|err| SwitchError::io_at("stat", source, err))?;
    if metadata.is_dir() {
        fs::create_dir_all(destination)
            .map_err(|err| SwitchError::io_at("create dir", destination, err))?;
        let entries =
            fs::read_dir(source).map_err(|err| SwitchError::io_at("read dir", source, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| SwitchError::io_at("read dir", source, err))?;
            copy_path(&entry.path(), &destination.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|err| SwitchError::io_at("create dir", parent, err))?;
    }
    fs::copy(source, destination).map_err(|err| {
        SwitchError::io(
            format!(
                "failed to copy {} -> {}",
                source.display(),
                destination.display()
            ),
            err,
        )
    })?;
    Ok(())
}

/// Removes a file or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> SwitchResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(SwitchError::io_at("stat", path, err)),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SwitchError::io_at("remove", path, err)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub exists: bool,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    pub fn of(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(metadata) => Self {
                exists: true,
                modified: metadata.modified().ok(),
            },
            Err(_) => Self {
                exists: false,
                modified: None,
            },
        }
    }

    pub fn changed_since(&self, earlier: &FileStamp) -> bool {
        self.exists && (!earlier.exists || self.modified != earlier.modified)
    }
}

#[cfg(unix)]
fn set_private(file: &fs::File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_private(_file: &fs::File) {}
