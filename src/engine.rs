use crate::config_archive::ConfigArchiver;
use crate::credential_vault::CredentialVault;
use crate::error::{SwitchError, SwitchResult};
use crate::event_log::{fingerprint, EventLog};
use crate::fsutil::{remove_path, FileStamp};
use crate::login::{find_login_url, CancelToken, LoginFlow, LoginRunner};
use crate::models::{Profile, Registry};
use crate::notifier::{LimitEvent, LimitNotifier, ScheduleInstruction};
use crate::process::{default_process_runner, default_url_opener, ProcessRunner};
use crate::registry_store::RegistryStore;
use crate::secret_store::{default_secret_store, SecretStore};
use crate::settings::{Settings, LIMIT_THRESHOLD_PERCENT};
use crate::usage_fetcher::{default_usage_client, load_live_credentials, RateLimitSource, UsageFetcher};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

const DEFAULT_PROFILE_NAME: &str = "Default";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    Limit(LimitEvent),
    Schedule(ScheduleInstruction),
    RegistryChanged,
    LoginUrl { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedState {
    pub profiles: Vec<Profile>,
    pub active_profile_id: Option<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl PublishedState {
    pub fn active(&self) -> Option<&Profile> {
        let active_id = self.active_profile_id.as_deref()?;
        self.profiles.iter().find(|profile| profile.id == active_id)
    }
}

pub struct EngineParts {
    pub settings: Settings,
    pub secrets: Arc<dyn SecretStore>,
    pub usage_source: Arc<dyn RateLimitSource>,
    pub login: Arc<dyn LoginFlow>,
}

enum AddMessage {
    LoginUrl(String),
    Finished(SwitchResult<()>),
}

/// A login started by `begin_add_account`, running on its own thread.
pub struct AddAccountTask {
    profile_id: String,
    cancel_token: CancelToken,
    login: Arc<dyn LoginFlow>,
    receiver: mpsc::Receiver<AddMessage>,
}

pub struct AddAccountOutcome {
    pub profile_id: String,
    pub login_urls: Vec<String>,
    pub result: SwitchResult<()>,
}

impl AddAccountTask {
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Stops polling and kills the login process. The outcome still has to
    /// be collected with `wait`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
        self.login.cancel();
    }

    pub fn wait(self) -> AddAccountOutcome {
        let mut login_urls = Vec::new();
        let mut result = Err(SwitchError::Cancelled);
        for message in self.receiver.iter() {
            match message {
                AddMessage::LoginUrl(url) => login_urls.push(url),
                AddMessage::Finished(finished) => {
                    result = finished;
                    break;
                }
            }
        }
        AddAccountOutcome {
            profile_id: self.profile_id,
            login_urls,
            result,
        }
    }
}

/// Owns the registry and sequences every switch, add, remove and refresh.
/// Calls are expected one at a time from a single owner; nothing here
/// guards against two processes mutating the same registry.
pub struct AccountManager {
    settings: Settings,
    registry_store: RegistryStore,
    secrets: Arc<dyn SecretStore>,
    vault: CredentialVault,
    archiver: ConfigArchiver,
    usage_source: Arc<dyn RateLimitSource>,
    login: Arc<dyn LoginFlow>,
    notifier: LimitNotifier,
    event_log: EventLog,
    clock: Clock,
    registry: Registry,
    outbox: Vec<EngineEvent>,
}

impl AccountManager {
    pub fn new(parts: EngineParts) -> SwitchResult<Self> {
        Self::with_clock(parts, Arc::new(Utc::now))
    }

    pub fn with_clock(parts: EngineParts, clock: Clock) -> SwitchResult<Self> {
        let EngineParts {
            settings,
            secrets,
            usage_source,
            login,
        } = parts;
        let registry_store = RegistryStore::new(settings.registry_path());
        let registry = registry_store.load()?;

        let mut manager = Self {
            vault: CredentialVault::new(settings.clone(), Arc::clone(&secrets)),
            archiver: ConfigArchiver::new(settings.clone()),
            event_log: EventLog::new(settings.log_dir()),
            notifier: LimitNotifier::new(LIMIT_THRESHOLD_PERCENT),
            settings,
            registry_store,
            secrets,
            usage_source,
            login,
            clock,
            registry,
            outbox: Vec::new(),
        };
        manager.rebuild_limit_state();
        Ok(manager)
    }

    /// Production wiring: system keychain, HTTPS usage client, real `claude`.
    pub fn open(settings: Settings) -> SwitchResult<Self> {
        let process_runner: ProcessRunner = Arc::new(default_process_runner);
        let secrets = default_secret_store(&settings, Arc::clone(&process_runner));
        let usage_source = Arc::new(UsageFetcher::new(
            settings.clone(),
            Arc::clone(&secrets),
            default_usage_client(settings.request_timeout),
            process_runner,
        ));
        let login = Arc::new(LoginRunner::new(settings.clone(), default_url_opener()));
        Self::new(EngineParts {
            settings,
            secrets,
            usage_source,
            login,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn rebuild_limit_state(&mut self) {
        let now = self.now();
        for profile in &self.registry.profiles {
            let Some(snapshot) = profile.rate_limit.as_ref() else {
                continue;
            };
            for instruction in self.notifier.rebuild(&profile.id, snapshot, now) {
                self.outbox.push(EngineEvent::Schedule(instruction));
            }
        }
    }

    pub fn state(&self) -> PublishedState {
        PublishedState {
            profiles: self.registry.profiles.clone(),
            active_profile_id: self.registry.active_profile_id.clone(),
            last_refreshed: self.registry.last_refreshed,
        }
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn reload(&mut self) -> SwitchResult<()> {
        self.registry = self.registry_store.load()?;
        Ok(())
    }

    fn mutate_registry<T>(&mut self, change: impl FnOnce(&mut Registry) -> T) -> SwitchResult<T> {
        let (registry, output) = self.registry_store.update(change)?;
        self.registry = registry;
        self.outbox.push(EngineEvent::RegistryChanged);
        Ok(output)
    }

    fn resolve(&self, name_or_id: &str) -> SwitchResult<Profile> {
        self.registry
            .resolve(name_or_id)
            .cloned()
            .ok_or_else(|| SwitchError::ProfileNotFound(name_or_id.to_string()))
    }

    fn has_live_credentials(&self) -> bool {
        let listed = match self.secrets.list() {
            Ok(entries) => !entries.is_empty(),
            Err(err) => {
                tracing::debug!("secret store listing failed: {}", err);
                false
            }
        };
        listed || self.settings.credentials_path().is_file()
    }

    fn backup_profile(&self, profile_id: &str) -> SwitchResult<()> {
        self.vault.backup(profile_id)?;
        self.archiver.backup(profile_id)?;
        Ok(())
    }

    /// First run: adopts an already logged-in CLI as the active profile.
    /// Returns the new profile's id.
    pub fn bootstrap(&mut self) -> SwitchResult<Option<String>> {
        self.reload()?;
        if !self.registry.profiles.is_empty() || !self.has_live_credentials() {
            return Ok(None);
        }

        let credentials = load_live_credentials(&self.settings, self.secrets.as_ref());
        let email = credentials.as_ref().and_then(|credentials| credentials.email());
        let mut profile = Profile::new(email.as_deref().unwrap_or(DEFAULT_PROFILE_NAME));
        profile.username = email;
        let profile_id = profile.id.clone();
        tracing::info!("adopting existing login as profile {}", profile.name);

        self.backup_profile(&profile_id)?;
        let now = self.now();
        self.mutate_registry(|registry| {
            registry.upsert(profile.clone());
            registry.set_active(&profile.id, now);
        })?;
        self.event_log.write(
            "account_added",
            &[
                ("profile_id", Some(profile_id.clone())),
                ("name", Some(profile.name.clone())),
                ("source", Some("bootstrap".to_string())),
            ],
        );
        Ok(Some(profile_id))
    }

    /// Makes `name_or_id` the live account. Returns false when it already
    /// was. The registry only changes after backup and restore succeed;
    /// a failure part way through is not rolled back.
    pub fn switch_to(&mut self, name_or_id: &str) -> SwitchResult<bool> {
        self.reload()?;
        let target = self.resolve(name_or_id)?;
        let current = self.registry.active().cloned();
        if current.as_ref().map(|profile| profile.id.as_str()) == Some(target.id.as_str()) {
            tracing::info!("{} is already active", target.name);
            return Ok(false);
        }

        let from = current.as_ref().map(|profile| profile.id.clone());
        self.event_log.write(
            "switch_started",
            &[("from", from.clone()), ("to", Some(target.id.clone()))],
        );
        if let Err(err) = self.swap_live_state(current.as_ref(), &target) {
            tracing::warn!("switch to {} failed: {}", target.name, err);
            self.event_log.write(
                "switch_failed",
                &[
                    ("from", from),
                    ("to", Some(target.id.clone())),
                    ("error", Some(err.to_string())),
                ],
            );
            return Err(err);
        }

        let now = self.now();
        self.mutate_registry(|registry| registry.set_active(&target.id, now))?;
        tracing::info!("switched to {}", target.display_label());
        self.event_log.write(
            "switch_completed",
            &[("from", from), ("to", Some(target.id.clone()))],
        );

        if let Err(err) = self.refresh_usage() {
            tracing::warn!("usage refresh after switch failed: {}", err);
        }
        Ok(true)
    }

    fn swap_live_state(&self, current: Option<&Profile>, target: &Profile) -> SwitchResult<()> {
        if let Some(current) = current {
            self.backup_profile(&current.id)?;
        }
        self.vault.restore(&target.id)?;
        self.archiver.restore(&target.id)?;
        Ok(())
    }

    /// Prepares a clean slate, registers a pending profile and starts the
    /// login on a background thread.
    pub fn begin_add_account(&mut self, name: &str) -> SwitchResult<AddAccountTask> {
        let name = validate_name(name)?;
        self.reload()?;

        if let Some(current) = self.registry.active().cloned() {
            self.backup_profile(&current.id)?;
        }
        self.archiver.clear()?;
        self.vault.clear_live()?;
        remove_path(&self.settings.credentials_path())?;

        let mut profile = Profile::new(&name);
        profile.authenticated = false;
        let profile_id = profile.id.clone();
        let now = self.now();
        self.mutate_registry(|registry| {
            registry.upsert(profile);
            registry.set_active(&profile_id, now);
        })?;
        tracing::info!("added pending profile {} ({})", name, profile_id);

        let cancel_token = CancelToken::new();
        let (sender, receiver) = mpsc::channel();
        let job = LoginJob {
            settings: self.settings.clone(),
            secrets: Arc::clone(&self.secrets),
            login: Arc::clone(&self.login),
            cancel_token: cancel_token.clone(),
            baseline: FileStamp::of(&self.settings.credentials_path()),
        };
        thread::spawn(move || {
            let result = job.run(&sender);
            let _ = sender.send(AddMessage::Finished(result));
        });

        Ok(AddAccountTask {
            profile_id,
            cancel_token,
            login: Arc::clone(&self.login),
            receiver,
        })
    }

    /// Applies a finished login. A cancelled login leaves the registry as
    /// it is; any other failure removes the pending profile.
    pub fn finish_add_account(&mut self, outcome: AddAccountOutcome) -> SwitchResult<Profile> {
        let AddAccountOutcome {
            profile_id,
            login_urls,
            result,
        } = outcome;
        for url in login_urls {
            self.outbox.push(EngineEvent::LoginUrl { url });
        }

        match result {
            Ok(()) => self.complete_add(&profile_id),
            Err(SwitchError::Cancelled) => {
                tracing::info!("add account cancelled for {}", profile_id);
                Err(SwitchError::Cancelled)
            }
            Err(err) => {
                tracing::warn!("add account failed: {}", err);
                self.discard_pending(&profile_id)?;
                self.event_log.write(
                    "account_add_failed",
                    &[
                        ("profile_id", Some(profile_id)),
                        ("error", Some(err.to_string())),
                    ],
                );
                Err(err)
            }
        }
    }

    pub fn add_account(&mut self, name: &str) -> SwitchResult<Profile> {
        let task = self.begin_add_account(name)?;
        let outcome = task.wait();
        self.finish_add_account(outcome)
    }

    fn complete_add(&mut self, profile_id: &str) -> SwitchResult<Profile> {
        self.reload()?;
        if !self.registry.contains(profile_id) {
            return Err(SwitchError::ProfileNotFound(profile_id.to_string()));
        }

        let credentials = load_live_credentials(&self.settings, self.secrets.as_ref());
        let username = credentials.as_ref().and_then(|credentials| credentials.email());
        let token_fingerprint = credentials
            .as_ref()
            .and_then(|credentials| credentials.access_token.as_deref())
            .and_then(|token| fingerprint(Some(token.as_bytes())));

        self.backup_profile(profile_id)?;
        let profile = self.mutate_registry(|registry| {
            let profile = registry.find_mut(profile_id)?;
            profile.authenticated = true;
            if username.is_some() {
                profile.username = username;
            }
            Some(profile.clone())
        })?;
        let profile = profile.ok_or_else(|| SwitchError::ProfileNotFound(profile_id.to_string()))?;

        tracing::info!("account {} is logged in", profile.display_label());
        self.event_log.write(
            "account_added",
            &[
                ("profile_id", Some(profile.id.clone())),
                ("name", Some(profile.name.clone())),
                ("username", profile.username.clone()),
                ("token_fingerprint", token_fingerprint),
            ],
        );
        if let Err(err) = self.refresh_usage() {
            tracing::warn!("usage refresh for new account failed: {}", err);
        }
        Ok(profile)
    }

    fn discard_pending(&mut self, profile_id: &str) -> SwitchResult<()> {
        self.reload()?;
        self.archiver.delete_profile(profile_id)?;
        if self.registry.contains(profile_id) {
            self.mutate_registry(|registry| {
                registry.remove(profile_id);
            })?;
        }
        Ok(())
    }

    pub fn remove_account(&mut self, name_or_id: &str) -> SwitchResult<Profile> {
        self.reload()?;
        let profile = self.resolve(name_or_id)?;
        if profile.is_active {
            return Err(SwitchError::ActiveProfile(profile.name));
        }

        self.archiver.delete_profile(&profile.id)?;
        self.mutate_registry(|registry| {
            registry.remove(&profile.id);
        })?;
        for instruction in self.notifier.forget(&profile.id) {
            self.outbox.push(EngineEvent::Schedule(instruction));
        }
        tracing::info!("removed account {}", profile.display_label());
        self.event_log.write(
            "account_removed",
            &[
                ("profile_id", Some(profile.id.clone())),
                ("name", Some(profile.name.clone())),
            ],
        );
        Ok(profile)
    }

    pub fn rename_account(&mut self, name_or_id: &str, new_name: &str) -> SwitchResult<Profile> {
        let new_name = validate_name(new_name)?;
        self.reload()?;
        let profile = self.resolve(name_or_id)?;
        let renamed = self.mutate_registry(|registry| {
            registry.find_mut(&profile.id).map(|found| {
                found.name = new_name.clone();
                found.clone()
            })
        })?;
        let renamed = renamed.ok_or_else(|| SwitchError::ProfileNotFound(profile.id.clone()))?;
        self.event_log.write(
            "account_renamed",
            &[
                ("profile_id", Some(renamed.id.clone())),
                ("from", Some(profile.name)),
                ("to", Some(renamed.name.clone())),
            ],
        );
        Ok(renamed)
    }

    /// Re-reads local stats and fetches rate limits for the active profile.
    /// A failed fetch keeps the previous snapshot and is returned after the
    /// local stats are saved.
    pub fn refresh_usage(&mut self) -> SwitchResult<()> {
        self.reload()?;
        let Some(active) = self.registry.active().cloned() else {
            tracing::debug!("no active profile to refresh");
            return Ok(());
        };

        let now = self.now();
        let usage = self
            .archiver
            .read_usage_stats(now.with_timezone(&Local).date_naive());
        let fetched = self.usage_source.fetch_usage();

        let transitions = match fetched.as_ref() {
            Ok(snapshot) => Some(self.notifier.observe(&active.id, snapshot, now)),
            Err(_) => None,
        };
        let snapshot = fetched.as_ref().ok().cloned();
        self.mutate_registry(|registry| {
            if let Some(profile) = registry.find_mut(&active.id) {
                if usage.is_some() {
                    profile.usage = usage;
                }
                if snapshot.is_some() {
                    profile.rate_limit = snapshot;
                }
            }
            registry.last_refreshed = Some(now);
        })?;

        if let Some(transitions) = transitions {
            for event in transitions.events {
                self.event_log.write(
                    "limit_event",
                    &[
                        ("profile_id", Some(event.profile_id.clone())),
                        ("window", Some(event.window.as_str().to_string())),
                        ("kind", Some(format!("{:?}", event.kind).to_lowercase())),
                    ],
                );
                self.outbox.push(EngineEvent::Limit(event));
            }
            for instruction in transitions.instructions {
                self.outbox.push(EngineEvent::Schedule(instruction));
            }
        }

        match fetched {
            Ok(snapshot) => {
                self.event_log.write(
                    "usage_refreshed",
                    &[
                        ("profile_id", Some(active.id.clone())),
                        ("session_used", Some(format!("{:.0}", snapshot.session_used))),
                        ("weekly_used", Some(format!("{:.0}", snapshot.weekly_used))),
                    ],
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!("rate limit fetch failed, keeping cached data: {}", err);
                self.event_log.write(
                    "usage_refresh_failed",
                    &[
                        ("profile_id", Some(active.id.clone())),
                        ("error", Some(err.to_string())),
                    ],
                );
                Err(err)
            }
        }
    }
}

struct LoginJob {
    settings: Settings,
    secrets: Arc<dyn SecretStore>,
    login: Arc<dyn LoginFlow>,
    cancel_token: CancelToken,
    baseline: FileStamp,
}

impl LoginJob {
    fn run(&self, sender: &mpsc::Sender<AddMessage>) -> SwitchResult<()> {
        let mut url_sent = false;
        let mut on_output = |line: &str| {
            tracing::debug!("login: {}", line);
            if url_sent {
                return;
            }
            if let Some(url) = find_login_url(line) {
                url_sent = true;
                let _ = sender.send(AddMessage::LoginUrl(url));
            }
        };
        self.login.start(&mut on_output)?;
        self.wait_for_credentials()
    }

    fn wait_for_credentials(&self) -> SwitchResult<()> {
        let credentials_path = self.settings.credentials_path();
        for attempt in 1..=self.settings.poll_attempts {
            if self.cancel_token.is_cancelled() {
                return Err(SwitchError::Cancelled);
            }
            if FileStamp::of(&credentials_path).changed_since(&self.baseline) {
                tracing::info!("credentials file updated after {} poll(s)", attempt);
                return Ok(());
            }
            match self.secrets.list() {
                Ok(entries) if !entries.is_empty() => {
                    tracing::info!("new keychain credentials after {} poll(s)", attempt);
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => tracing::debug!("secret store poll failed: {}", err),
            }
            tracing::debug!("no credentials yet (attempt {})", attempt);
            thread::sleep(self.settings.poll_interval);
        }
        if self.cancel_token.is_cancelled() {
            return Err(SwitchError::Cancelled);
        }
        Err(SwitchError::Timeout(format!(
            "no new credentials after {} attempts",
            self.settings.poll_attempts
        )))
    }
}

fn validate_name(name: &str) -> SwitchResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SwitchError::InvalidName("name must not be empty".to_string()));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(SwitchError::InvalidName(format!("{:?}", trimmed)));
    }
    Ok(trimmed.to_string())
}
