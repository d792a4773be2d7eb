use crate::error::{SwitchError, SwitchResult};
use crate::process::ProcessRunner;
use crate::settings::{Settings, CLAUDE_KEYCHAIN_NAMESPACE};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// `security` exits with errSecItemNotFound when a lookup misses.
const SECURITY_ITEM_NOT_FOUND: i32 = 44;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretEntry {
    pub service: String,
    pub account: String,
}

impl SecretEntry {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

pub trait SecretStore: Send + Sync {
    /// All entries whose service name starts with the store's namespace.
    fn list(&self) -> SwitchResult<Vec<SecretEntry>>;
    fn get(&self, service: &str, account: &str) -> SwitchResult<Option<Vec<u8>>>;
    /// Overwrites any existing value for the same key.
    fn save(&self, service: &str, account: &str, secret: &[u8]) -> SwitchResult<()>;
    /// Succeeds when the entry is already absent.
    fn delete(&self, service: &str, account: &str) -> SwitchResult<()>;
}

pub struct KeychainStore {
    namespace: String,
    security_executable: String,
    process_runner: ProcessRunner,
}

impl KeychainStore {
    pub fn new(
        namespace: impl Into<String>,
        security_executable: impl Into<String>,
        process_runner: ProcessRunner,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            security_executable: security_executable.into(),
            process_runner,
        }
    }

    fn run(&self, args: Vec<String>) -> crate::process::ProcessExecutionResult {
        (self.process_runner)(&self.security_executable, &args)
    }

    fn insert(&self, service: &str, account: &str, secret: &[u8]) -> SwitchResult<()> {
        let raw = std::str::from_utf8(secret).map_err(|_| {
            SwitchError::SecretStore(format!("secret for {} is not valid UTF-8", service))
        })?;
        let result = self.run(vec![
            "add-generic-password".to_string(),
            "-a".to_string(),
            account.to_string(),
            "-s".to_string(),
            service.to_string(),
            "-w".to_string(),
            raw.to_string(),
        ]);
        if result.status != 0 {
            return Err(SwitchError::SecretStore(format!(
                "failed to add keychain item {}/{}: {}",
                service,
                account,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

impl SecretStore for KeychainStore {
    fn list(&self) -> SwitchResult<Vec<SecretEntry>> {
        let result = self.run(vec!["dump-keychain".to_string()]);
        if result.status != 0 {
            return Err(SwitchError::SecretStore(format!(
                "failed to list keychain: {}",
                result.stderr.trim()
            )));
        }
        let mut entries = parse_dump_keychain(&result.stdout)
            .into_iter()
            .filter(|entry| entry.service.starts_with(&self.namespace))
            .collect::<Vec<_>>();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn get(&self, service: &str, account: &str) -> SwitchResult<Option<Vec<u8>>> {
        let result = self.run(vec![
            "find-generic-password".to_string(),
            "-s".to_string(),
            service.to_string(),
            "-a".to_string(),
            account.to_string(),
            "-w".to_string(),
        ]);
        if result.status == SECURITY_ITEM_NOT_FOUND || is_not_found_message(&result.stderr) {
            return Ok(None);
        }
        if result.status != 0 {
            return Err(SwitchError::SecretStore(format!(
                "failed to read keychain item {}/{}: {}",
                service,
                account,
                result.stderr.trim()
            )));
        }
        let trimmed = result.stdout.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.as_bytes().to_vec()))
    }

    fn save(&self, service: &str, account: &str, secret: &[u8]) -> SwitchResult<()> {
        self.delete(service, account)?;
        self.insert(service, account, secret)
    }

    fn delete(&self, service: &str, account: &str) -> SwitchResult<()> {
        let result = self.run(vec![
            "delete-generic-password".to_string(),
            "-s".to_string(),
            service.to_string(),
            "-a".to_string(),
            account.to_string(),
        ]);
        if result.status == 0
            || result.status == SECURITY_ITEM_NOT_FOUND
            || is_not_found_message(&result.stderr)
        {
            return Ok(());
        }
        Err(SwitchError::SecretStore(format!(
            "failed to delete keychain item {}/{}: {}",
            service,
            account,
            result.stderr.trim()
        )))
    }
}

fn is_not_found_message(stderr: &str) -> bool {
    stderr.to_lowercase().contains("could not be found")
}

fn parse_dump_keychain(text: &str) -> Vec<SecretEntry> {
    let mut entries = Vec::new();
    let mut class: Option<String> = None;
    let mut service: Option<String> = None;
    let mut account: Option<String> = None;

    let mut flush = |class: &Option<String>, service: &mut Option<String>, account: &mut Option<String>| {
        if class.as_deref() == Some("genp") {
            if let Some(service_name) = service.take() {
                entries.push(SecretEntry::new(
                    service_name,
                    account.take().unwrap_or_default(),
                ));
            }
        }
        *service = None;
        *account = None;
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("keychain:") {
            flush(&class, &mut service, &mut account);
            class = None;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("class:") {
            class = Some(rest.trim().trim_matches('"').to_string());
            continue;
        }
        if let Some(value) = blob_attribute(trimmed, "\"svce\"<blob>=") {
            service = Some(value);
        } else if let Some(value) = blob_attribute(trimmed, "\"acct\"<blob>=") {
            account = Some(value);
        }
    }
    flush(&class, &mut service, &mut account);
    entries
}

fn blob_attribute(line: &str, prefix: &str) -> Option<String> {
    let raw = line.strip_prefix(prefix)?;
    if raw == "<NULL>" {
        return None;
    }
    let quoted = raw.strip_prefix('"')?;
    let end = quoted.rfind('"')?;
    Some(quoted[..end].to_string())
}

/// The macOS keychain where one exists. Elsewhere the CLI keeps its OAuth
/// token in the credentials file, which travels with the managed config.
pub fn default_secret_store(settings: &Settings, process_runner: ProcessRunner) -> Arc<dyn SecretStore> {
    if cfg!(target_os = "macos") {
        Arc::new(KeychainStore::new(
            CLAUDE_KEYCHAIN_NAMESPACE,
            settings.security_executable.clone(),
            process_runner,
        ))
    } else {
        Arc::new(MemorySecretStore::new(CLAUDE_KEYCHAIN_NAMESPACE))
    }
}

/// In-process secret store. Used on platforms without a system keychain
/// (the CLI keeps its OAuth file under the managed config set there) and
/// as the fake in tests. Inserting an existing key fails, like the system
/// keychain does without `-U`.
#[derive(Default)]
pub struct MemorySecretStore {
    namespace: String,
    items: Mutex<BTreeMap<SecretEntry, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            items: Mutex::new(BTreeMap::new()),
        }
    }

    fn items(&self) -> SwitchResult<std::sync::MutexGuard<'_, BTreeMap<SecretEntry, Vec<u8>>>> {
        self.items
            .lock()
            .map_err(|_| SwitchError::SecretStore("secret store lock poisoned".to_string()))
    }

    pub fn insert_new(&self, service: &str, account: &str, secret: &[u8]) -> SwitchResult<()> {
        let mut items = self.items()?;
        let key = SecretEntry::new(service, account);
        if items.contains_key(&key) {
            return Err(SwitchError::SecretStore(format!(
                "duplicate item {}/{}",
                service, account
            )));
        }
        items.insert(key, secret.to_vec());
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<SecretEntry, Vec<u8>> {
        self.items().map(|items| items.clone()).unwrap_or_default()
    }
}

impl SecretStore for MemorySecretStore {
    fn list(&self) -> SwitchResult<Vec<SecretEntry>> {
        Ok(self
            .items()?
            .keys()
            .filter(|entry| entry.service.starts_with(&self.namespace))
            .cloned()
            .collect())
    }

    fn get(&self, service: &str, account: &str) -> SwitchResult<Option<Vec<u8>>> {
        Ok(self
            .items()?
            .get(&SecretEntry::new(service, account))
            .cloned())
    }

    fn save(&self, service: &str, account: &str, secret: &[u8]) -> SwitchResult<()> {
        self.delete(service, account)?;
        self.insert_new(service, account, secret)
    }

    fn delete(&self, service: &str, account: &str) -> SwitchResult<()> {
        self.items()?.remove(&SecretEntry::new(service, account));
        Ok(())
    }
}
