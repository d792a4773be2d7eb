use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "switch.log";
const ROTATED_LOG_FILE_NAME: &str = "switch.log.1";
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    event: &'a str,
    #[serde(flatten)]
    fields: BTreeMap<&'a str, &'a str>,
}

impl<'a> EventRecord<'a> {
    /// Blank and missing values are left out of the record.
    fn new(event: &'a str, fields: &'a [(&'a str, Option<String>)]) -> Self {
        let fields = fields
            .iter()
            .filter_map(|(key, value)| {
                let value = value.as_deref()?.trim();
                (!value.is_empty()).then_some((*key, value))
            })
            .collect();
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            fields,
        }
    }
}

/// Append-only JSON-lines audit trail of account operations. Writing never
/// fails the caller.
pub struct EventLog {
    log_dir: PathBuf,
    max_log_bytes: u64,
}

impl EventLog {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            max_log_bytes: MAX_LOG_BYTES,
        }
    }

    pub fn write(&self, event: &str, fields: &[(&str, Option<String>)]) {
        if let Err(err) = self.append(&EventRecord::new(event, fields)) {
            tracing::debug!("event log write to {} failed: {}", self.log_dir.display(), err);
        }
    }

    fn append(&self, record: &EventRecord<'_>) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        fs::create_dir_all(&self.log_dir)?;
        let current = self.log_dir.join(LOG_FILE_NAME);
        if file_len(&current) > self.max_log_bytes {
            // Only one generation is kept.
            let rotated = self.log_dir.join(ROTATED_LOG_FILE_NAME);
            let _ = fs::remove_file(&rotated);
            fs::rename(&current, rotated)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&current)?;
        owner_only(&file);
        file.write_all(&line)
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0)
}

#[cfg(unix)]
fn owner_only(file: &fs::File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn owner_only(_file: &fs::File) {}

/// First 16 hex chars of the SHA-256 of `data`; `None` for empty input.
/// Lets the log tell credentials apart without recording them.
pub fn fingerprint(data: Option<&[u8]>) -> Option<String> {
    let data = data.filter(|data| !data.is_empty())?;
    let mut digest = hex::encode(Sha256::digest(data));
    digest.truncate(16);
    Some(digest)
}
