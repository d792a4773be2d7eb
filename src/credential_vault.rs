use crate::error::{SwitchError, SwitchResult};
use crate::fsutil::write_file_atomic;
use crate::secret_store::SecretStore;
use crate::settings::Settings;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const CREDENTIAL_BACKUP_FILE: &str = "credentials.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub service: String,
    pub account: String,
    /// Base64 of the raw secret bytes.
    pub secret: String,
}

pub struct CredentialVault {
    settings: Settings,
    store: Arc<dyn SecretStore>,
}

impl CredentialVault {
    pub fn new(settings: Settings, store: Arc<dyn SecretStore>) -> Self {
        Self { settings, store }
    }

    pub fn backup_path(&self, profile_id: &str) -> PathBuf {
        self.settings
            .profile_dir(profile_id)
            .join(CREDENTIAL_BACKUP_FILE)
    }

    pub fn has_backup(&self, profile_id: &str) -> bool {
        self.backup_path(profile_id).is_file()
    }

    /// Snapshots every namespaced secret into the profile's backup file,
    /// replacing any earlier snapshot. Returns the number of records written.
    pub fn backup(&self, profile_id: &str) -> SwitchResult<usize> {
        let mut records = Vec::new();
        for entry in self.store.list()? {
            let Some(secret) = self.store.get(&entry.service, &entry.account)? else {
                tracing::debug!(
                    "secret {}/{} vanished during backup",
                    entry.service,
                    entry.account
                );
                continue;
            };
            records.push(CredentialRecord {
                service: entry.service,
                account: entry.account,
                secret: STANDARD.encode(secret),
            });
        }

        let path = self.backup_path(profile_id);
        let data = serde_json::to_vec_pretty(&records)
            .map_err(|err| SwitchError::ParseError(format!("encode credential backup: {}", err)))?;
        write_file_atomic(&path, &data)?;
        tracing::info!(
            "backed up {} credential(s) for profile {}",
            records.len(),
            profile_id
        );
        Ok(records.len())
    }

    /// Replaces the live secret set with the profile's snapshot. Every
    /// currently namespaced secret is deleted before the snapshot is
    /// inserted, so a failure part way through leaves a partial set.
    pub fn restore(&self, profile_id: &str) -> SwitchResult<usize> {
        let records = self.read_backup(profile_id)?;

        for entry in self.store.list()? {
            self.store.delete(&entry.service, &entry.account)?;
        }
        for record in &records {
            let secret = STANDARD.decode(record.secret.as_bytes()).map_err(|err| {
                SwitchError::ParseError(format!(
                    "credential backup for {} has invalid secret {}/{}: {}",
                    profile_id, record.service, record.account, err
                ))
            })?;
            self.store.save(&record.service, &record.account, &secret)?;
        }
        tracing::info!(
            "restored {} credential(s) for profile {}",
            records.len(),
            profile_id
        );
        Ok(records.len())
    }

    /// Deletes every namespaced secret so the next login starts clean.
    pub fn clear_live(&self) -> SwitchResult<()> {
        for entry in self.store.list()? {
            self.store.delete(&entry.service, &entry.account)?;
        }
        Ok(())
    }

    fn read_backup(&self, profile_id: &str) -> SwitchResult<Vec<CredentialRecord>> {
        let path = self.backup_path(profile_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SwitchError::BackupNotFound(profile_id.to_string()))
            }
            Err(err) => return Err(SwitchError::io_at("read", &path, err)),
        };
        serde_json::from_slice(&data).map_err(|err| {
            SwitchError::ParseError(format!("invalid credential backup {}: {}", path.display(), err))
        })
    }
}
