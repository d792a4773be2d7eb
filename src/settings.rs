use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CLAUDE_KEYCHAIN_SERVICE_NAME: &str = "Claude Code-credentials";
pub const CLAUDE_KEYCHAIN_NAMESPACE: &str = "Claude Code";
pub const CLAUDE_USAGE_ENDPOINT: &str = "https://api.anthropic.com/api/oauth/usage";
pub const CLAUDE_OAUTH_BETA: &str = "oauth-2025-04-20";
pub const CLAUDE_REQUIRED_SCOPE: &str = "user:profile";
pub const CLAUDE_OAUTH_HOSTS: &[&str] = &["claude.ai", "anthropic.com"];
pub const LIMIT_THRESHOLD_PERCENT: f64 = 100.0;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_POLL_ATTEMPTS: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedItem {
    pub relative_path: &'static str,
    pub kind: ManagedKind,
}

pub const MAIN_CONFIG_FILE: &str = ".claude.json";
pub const STATS_CACHE_FILE: &str = ".claude/stats-cache.json";
pub const SETTINGS_FILE: &str = ".claude/settings.json";
pub const CREDENTIALS_FILE: &str = ".claude/.credentials.json";
pub const SESSION_STATE_DIR: &str = ".claude/statsig";

pub const MANAGED_ITEMS: &[ManagedItem] = &[
    ManagedItem {
        relative_path: MAIN_CONFIG_FILE,
        kind: ManagedKind::File,
    },
    ManagedItem {
        relative_path: STATS_CACHE_FILE,
        kind: ManagedKind::File,
    },
    ManagedItem {
        relative_path: SETTINGS_FILE,
        kind: ManagedKind::File,
    },
    ManagedItem {
        relative_path: CREDENTIALS_FILE,
        kind: ManagedKind::File,
    },
    ManagedItem {
        relative_path: SESSION_STATE_DIR,
        kind: ManagedKind::Directory,
    },
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub home_dir: PathBuf,
    pub app_dir: PathBuf,
    pub usage_endpoint: String,
    pub security_executable: String,
    pub claude_executable: Option<PathBuf>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Settings {
    pub fn from_env(home_dir: PathBuf) -> Self {
        let app_dir = env_override("CSWITCH_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("cswitch")))
            .unwrap_or_else(|| home_dir.join(".cswitch"));
        let usage_endpoint =
            env_override("CLAUDE_CODE_USAGE_URL").unwrap_or_else(|| CLAUDE_USAGE_ENDPOINT.to_string());
        let security_executable =
            env_override("CSWITCH_SECURITY_BIN").unwrap_or_else(|| "/usr/bin/security".to_string());
        let claude_executable = env_override("CSWITCH_CLAUDE_BIN").map(PathBuf::from);

        Self {
            home_dir,
            app_dir,
            usage_endpoint,
            security_executable,
            claude_executable,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }

    pub fn for_home(home_dir: &Path) -> Self {
        Self {
            home_dir: home_dir.to_path_buf(),
            app_dir: home_dir.join(".cswitch"),
            usage_endpoint: CLAUDE_USAGE_ENDPOINT.to_string(),
            security_executable: "/usr/bin/security".to_string(),
            claude_executable: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.app_dir.join("registry.json")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.app_dir.join("profiles")
    }

    pub fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.profiles_dir().join(profile_id)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.app_dir.join("logs")
    }

    pub fn live_path(&self, relative: &str) -> PathBuf {
        self.home_dir.join(relative)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.live_path(CREDENTIALS_FILE)
    }

    pub fn claude_fallback_locations(&self) -> Vec<PathBuf> {
        vec![
            self.home_dir.join(".claude/local/claude"),
            self.home_dir.join(".local/bin/claude"),
            PathBuf::from("/usr/local/bin/claude"),
            PathBuf::from("/opt/homebrew/bin/claude"),
            self.home_dir.join(".npm-global/bin/claude"),
        ]
    }
}

pub fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_paths_live_under_app_dir() {
        let settings = Settings::for_home(Path::new("/home/tester"));
        assert_eq!(
            settings.registry_path(),
            PathBuf::from("/home/tester/.cswitch/registry.json")
        );
        assert_eq!(
            settings.profile_dir("abc"),
            PathBuf::from("/home/tester/.cswitch/profiles/abc")
        );
        assert_eq!(
            settings.credentials_path(),
            PathBuf::from("/home/tester/.claude/.credentials.json")
        );
    }

    #[test]
    fn managed_items_include_one_session_directory() {
        let directories = MANAGED_ITEMS
            .iter()
            .filter(|item| item.kind == ManagedKind::Directory)
            .map(|item| item.relative_path)
            .collect::<Vec<_>>();
        assert_eq!(directories, vec![SESSION_STATE_DIR]);
    }

    #[test]
    fn defaults_match_polling_budget() {
        let settings = Settings::for_home(Path::new("/tmp"));
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.poll_attempts, 150);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }
}
