use crate::error::{SwitchError, SwitchResult};
use crate::fsutil::write_file_atomic;
use crate::models::Registry;
use std::fs;
use std::path::PathBuf;

/// Reads and writes `registry.json`. There is no file locking: two
/// processes saving at once can silently drop each other's changes.
pub struct RegistryStore {
    file_path: PathBuf,
}

impl RegistryStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub fn load(&self) -> SwitchResult<Registry> {
        if !self.file_path.exists() {
            return Ok(Registry::default());
        }

        let data = fs::read(&self.file_path)
            .map_err(|err| SwitchError::io_at("read", &self.file_path, err))?;
        let mut registry = serde_json::from_slice::<Registry>(&data).map_err(|err| {
            SwitchError::ParseError(format!("failed to parse registry.json: {}", err))
        })?;
        registry.normalize();
        Ok(registry)
    }

    pub fn save(&self, registry: &Registry) -> SwitchResult<()> {
        let data = serde_json::to_vec_pretty(registry).map_err(|err| {
            SwitchError::ParseError(format!("failed to encode registry.json: {}", err))
        })?;
        write_file_atomic(&self.file_path, &data)
    }

    /// Read-modify-write: reloads from disk, applies `change`, saves.
    pub fn update<T>(&self, change: impl FnOnce(&mut Registry) -> T) -> SwitchResult<(Registry, T)> {
        let mut registry = self.load()?;
        let output = change(&mut registry);
        registry.normalize();
        self.save(&registry)?;
        Ok((registry, output))
    }
}
