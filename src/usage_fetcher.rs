use crate::error::{SwitchError, SwitchResult};
use crate::models::{RateLimitSnapshot, UsageSource};
use crate::oauth::{json_instant, json_number, OAuthCredentials};
use crate::process::{locate_claude, ProcessRunner};
use crate::secret_store::SecretStore;
use crate::settings::{
    Settings, CLAUDE_KEYCHAIN_SERVICE_NAME, CLAUDE_OAUTH_BETA, CLAUDE_REQUIRED_SCOPE,
};
use crate::usage_text::parse_usage_report;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

/// `(endpoint, access_token) -> decoded JSON body`
pub type UsageClient = Arc<dyn Fn(&str, &str) -> SwitchResult<Value> + Send + Sync>;

pub trait RateLimitSource: Send + Sync {
    fn fetch_usage(&self) -> SwitchResult<RateLimitSnapshot>;
}

pub fn default_usage_client(timeout: Duration) -> UsageClient {
    Arc::new(move |endpoint: &str, access_token: &str| -> SwitchResult<Value> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SwitchError::RequestFailed(format!("build HTTP client: {}", err)))?;

        let response = client
            .get(endpoint)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("cswitch/", env!("CARGO_PKG_VERSION")))
            .header("anthropic-beta", CLAUDE_OAUTH_BETA)
            .bearer_auth(access_token)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    SwitchError::Timeout(format!("usage request to {}", endpoint))
                } else {
                    SwitchError::RequestFailed(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwitchError::RequestFailed(format!(
                "usage endpoint returned HTTP {}",
                status.as_u16()
            )));
        }
        response
            .json::<Value>()
            .map_err(|err| SwitchError::ParseError(format!("usage response: {}", err)))
    })
}

pub struct UsageFetcher {
    settings: Settings,
    store: Arc<dyn SecretStore>,
    usage_client: UsageClient,
    process_runner: ProcessRunner,
}

impl UsageFetcher {
    pub fn new(
        settings: Settings,
        store: Arc<dyn SecretStore>,
        usage_client: UsageClient,
        process_runner: ProcessRunner,
    ) -> Self {
        Self {
            settings,
            store,
            usage_client,
            process_runner,
        }
    }

    pub fn load_credentials(&self) -> Option<OAuthCredentials> {
        load_live_credentials(&self.settings, self.store.as_ref())
    }

    pub fn fetch_usage_at(&self, now: DateTime<Utc>) -> SwitchResult<RateLimitSnapshot> {
        let credentials = self.load_credentials();
        if let Some(credentials) = credentials.as_ref() {
            match credentials.usable_token(CLAUDE_REQUIRED_SCOPE, now) {
                Some(token) => match self.fetch_from_api(token, now) {
                    Ok(mut snapshot) => {
                        snapshot.rate_limit_tier = credentials.rate_limit_tier.clone();
                        snapshot.subscription_type = credentials.subscription_type.clone();
                        return Ok(snapshot);
                    }
                    Err(err) => {
                        tracing::warn!("usage API failed, falling back to claude CLI: {}", err)
                    }
                },
                None => tracing::info!(
                    "OAuth token missing {} scope or expired; using claude CLI",
                    CLAUDE_REQUIRED_SCOPE
                ),
            }
        }

        let mut snapshot = self.fetch_from_cli(now)?;
        if let Some(credentials) = credentials {
            snapshot.rate_limit_tier = credentials.rate_limit_tier;
            snapshot.subscription_type = credentials.subscription_type;
        }
        Ok(snapshot)
    }

    fn fetch_from_api(&self, token: &str, now: DateTime<Utc>) -> SwitchResult<RateLimitSnapshot> {
        let root = (self.usage_client)(&self.settings.usage_endpoint, token)?;
        parse_usage_response(&root, now)
    }

    fn fetch_from_cli(&self, now: DateTime<Utc>) -> SwitchResult<RateLimitSnapshot> {
        let claude = locate_claude(&self.settings)?;
        let executable = claude.to_string_lossy().to_string();
        let arguments = vec!["-p".to_string(), "/usage".to_string()];
        tracing::debug!("running {} -p /usage", executable);

        let result = (self.process_runner)(&executable, &arguments);
        if let Some(spawn_error) = result.spawn_error.as_ref() {
            return Err(SwitchError::LaunchFailed(spawn_error.clone()));
        }
        match parse_usage_report(&result.combined_output(), now) {
            Ok(snapshot) => Ok(snapshot),
            Err(_) if result.status != 0 => Err(SwitchError::ProcessFailed(result.status)),
            Err(err) => Err(err),
        }
    }
}

impl RateLimitSource for UsageFetcher {
    fn fetch_usage(&self) -> SwitchResult<RateLimitSnapshot> {
        self.fetch_usage_at(Utc::now())
    }
}

/// Live OAuth credentials: the keychain entry first, then the CLI's
/// credentials file.
pub fn load_live_credentials(settings: &Settings, store: &dyn SecretStore) -> Option<OAuthCredentials> {
    match load_keychain_credentials(store) {
        Ok(Some(credentials)) => return Some(credentials),
        Ok(None) => {}
        Err(err) => tracing::debug!("keychain credentials unavailable: {}", err),
    }

    let path = settings.credentials_path();
    match fs::read(&path) {
        Ok(data) => Some(OAuthCredentials::parse(&data)),
        Err(err) => {
            tracing::debug!("no credentials file at {}: {}", path.display(), err);
            None
        }
    }
}

fn load_keychain_credentials(store: &dyn SecretStore) -> SwitchResult<Option<OAuthCredentials>> {
    let entries = store.list()?;
    for entry in entries
        .iter()
        .filter(|entry| entry.service == CLAUDE_KEYCHAIN_SERVICE_NAME)
    {
        if let Some(data) = store.get(&entry.service, &entry.account)? {
            return Ok(Some(OAuthCredentials::parse(&data)));
        }
    }
    Ok(None)
}

pub fn parse_usage_response(root: &Value, now: DateTime<Utc>) -> SwitchResult<RateLimitSnapshot> {
    let (session_used, session_reset) = parse_usage_window(root.get("five_hour"));
    let Some(session_used) = session_used else {
        return Err(SwitchError::ParseError(
            "usage response has no five_hour window".to_string(),
        ));
    };
    let (weekly_used, weekly_reset) = parse_usage_window(root.get("seven_day"));

    let mut snapshot = RateLimitSnapshot::percent_scale(UsageSource::Api, now);
    snapshot.session_used = session_used;
    snapshot.session_reset = session_reset;
    snapshot.weekly_used = weekly_used.unwrap_or(0.0);
    snapshot.weekly_reset = weekly_reset;
    Ok(snapshot)
}

fn parse_usage_window(value: Option<&Value>) -> (Option<f64>, Option<DateTime<Utc>>) {
    let Some(Value::Object(window)) = value else {
        return (None, None);
    };
    let used = window.get("utilization").and_then(json_number);
    let reset_at = window.get("resets_at").and_then(json_instant);
    (used, reset_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessExecutionResult;
    use crate::secret_store::MemorySecretStore;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()
    }

    fn credentials(expires_at: DateTime<Utc>, scopes: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "claudeAiOauth": {
                "accessToken": "at-live",
                "expiresAt": expires_at.timestamp_millis(),
                "scopes": scopes,
                "subscriptionType": "pro",
                "rateLimitTier": "default_claude_max_5x"
            }
        }))
        .expect("encode")
    }

    fn api_body() -> Value {
        serde_json::json!({
            "five_hour": { "utilization": 37.5, "resets_at": "2026-10-19T20:00:00Z" },
            "seven_day": { "utilization": 81, "resets_at": "2026-10-24T07:00:00Z" },
            "seven_day_opus": null
        })
    }

    struct Harness {
        _temp: TempDir,
        fetcher: UsageFetcher,
        tokens: Arc<Mutex<Vec<String>>>,
        cli_calls: Arc<Mutex<usize>>,
    }

    fn build_harness(
        store: Arc<MemorySecretStore>,
        api: fn() -> SwitchResult<Value>,
        cli: fn() -> ProcessExecutionResult,
    ) -> Harness {
        let temp = TempDir::new().expect("temp dir");
        let binary = temp.path().join("bin/claude");
        fs::create_dir_all(binary.parent().expect("parent")).expect("mkdir");
        fs::write(&binary, "#!/bin/sh\n").expect("write");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        let mut settings = Settings::for_home(temp.path());
        settings.claude_executable = Some(binary);

        let tokens = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&tokens);
        let usage_client: UsageClient = Arc::new(move |_: &str, token: &str| {
            seen.lock().expect("tokens").push(token.to_string());
            api()
        });
        let cli_calls = Arc::new(Mutex::new(0));
        let calls = Arc::clone(&cli_calls);
        let runner: ProcessRunner = Arc::new(move |_: &str, arguments: &[String]| {
            assert_eq!(arguments, ["-p".to_string(), "/usage".to_string()]);
            *calls.lock().expect("calls") += 1;
            cli()
        });

        Harness {
            fetcher: UsageFetcher::new(settings, store, usage_client, runner),
            _temp: temp,
            tokens,
            cli_calls,
        }
    }

    fn keychain_with(data: &[u8]) -> Arc<MemorySecretStore> {
        let store = Arc::new(MemorySecretStore::new("Claude Code"));
        store
            .save(CLAUDE_KEYCHAIN_SERVICE_NAME, "tester", data)
            .expect("save");
        store
    }

    const CLI_OUTPUT: &str = "Current session\n10% used\nResets 11pm (UTC)\nCurrent week (all models)\n40% used\nResets Oct 24, 9am (UTC)\n";

    #[test]
    fn api_path_uses_keychain_token() {
        let store = keychain_with(&credentials(now() + chrono::Duration::hours(1), &["user:profile"]));
        let harness = build_harness(store, || Ok(api_body()), || ProcessExecutionResult::ok(CLI_OUTPUT));
        let snapshot = harness.fetcher.fetch_usage_at(now()).expect("fetch");

        assert_eq!(snapshot.source, UsageSource::Api);
        assert_eq!(snapshot.session_used, 37.5);
        assert_eq!(snapshot.weekly_used, 81.0);
        assert_eq!(
            snapshot.session_reset,
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 20, 0, 0).unwrap())
        );
        assert_eq!(snapshot.rate_limit_tier.as_deref(), Some("default_claude_max_5x"));
        assert_eq!(snapshot.subscription_type.as_deref(), Some("pro"));
        assert_eq!(*harness.tokens.lock().expect("tokens"), vec!["at-live".to_string()]);
        assert_eq!(*harness.cli_calls.lock().expect("calls"), 0);
    }

    #[test]
    fn api_failure_falls_back_to_cli() {
        let store = keychain_with(&credentials(now() + chrono::Duration::hours(1), &["user:profile"]));
        let harness = build_harness(
            store,
            || Err(SwitchError::RequestFailed("HTTP 500".to_string())),
            || ProcessExecutionResult::ok(CLI_OUTPUT),
        );
        let snapshot = harness.fetcher.fetch_usage_at(now()).expect("fetch");
        assert_eq!(snapshot.source, UsageSource::Cli);
        assert_eq!(snapshot.session_used, 10.0);
        assert_eq!(snapshot.weekly_used, 40.0);
        assert_eq!(*harness.cli_calls.lock().expect("calls"), 1);
    }

    #[test]
    fn undecodable_api_body_falls_back_to_cli() {
        let store = keychain_with(&credentials(now() + chrono::Duration::hours(1), &["user:profile"]));
        let harness = build_harness(
            store,
            || Ok(serde_json::json!({ "seven_day": { "utilization": 12 } })),
            || ProcessExecutionResult::ok(CLI_OUTPUT),
        );
        let snapshot = harness.fetcher.fetch_usage_at(now()).expect("fetch");
        assert_eq!(snapshot.source, UsageSource::Cli);
        assert_eq!(snapshot.session_used, 10.0);
        assert_eq!(*harness.tokens.lock().expect("tokens"), vec!["at-live".to_string()]);
        assert_eq!(*harness.cli_calls.lock().expect("calls"), 1);
    }

    #[test]
    fn expired_or_unscoped_token_skips_api() {
        let store = keychain_with(&credentials(now() - chrono::Duration::minutes(5), &["user:profile"]));
        let harness = build_harness(store, || Ok(api_body()), || ProcessExecutionResult::ok(CLI_OUTPUT));
        harness.fetcher.fetch_usage_at(now()).expect("fetch");
        assert!(harness.tokens.lock().expect("tokens").is_empty());

        let store = keychain_with(&credentials(now() + chrono::Duration::hours(1), &["user:inference"]));
        let harness = build_harness(store, || Ok(api_body()), || ProcessExecutionResult::ok(CLI_OUTPUT));
        harness.fetcher.fetch_usage_at(now()).expect("fetch");
        assert!(harness.tokens.lock().expect("tokens").is_empty());
    }

    #[test]
    fn credentials_file_is_used_when_keychain_is_empty() {
        let store = Arc::new(MemorySecretStore::new("Claude Code"));
        let harness = build_harness(store, || Ok(api_body()), || ProcessExecutionResult::ok(CLI_OUTPUT));
        let path = harness.fetcher.settings.credentials_path();
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, credentials(now() + chrono::Duration::hours(1), &["user:profile"]))
            .expect("write");

        let snapshot = harness.fetcher.fetch_usage_at(now()).expect("fetch");
        assert_eq!(snapshot.source, UsageSource::Api);
    }

    #[test]
    fn total_failure_surfaces_last_error() {
        let store = keychain_with(&credentials(now() + chrono::Duration::hours(1), &["user:profile"]));
        let harness = build_harness(
            store,
            || Err(SwitchError::RequestFailed("offline".to_string())),
            || ProcessExecutionResult::failed(3, "boom"),
        );
        let err = harness.fetcher.fetch_usage_at(now()).expect_err("both fail");
        assert!(matches!(err, SwitchError::ProcessFailed(3)));
    }

    #[test]
    fn response_without_five_hour_window_is_a_parse_error() {
        let err = parse_usage_response(&serde_json::json!({ "seven_day": {} }), now())
            .expect_err("missing window");
        assert!(matches!(err, SwitchError::ParseError(_)));
    }
}
