use crate::error::{SwitchError, SwitchResult};
use crate::settings::Settings;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::Arc;

pub type ProcessRunner = Arc<dyn Fn(&str, &[String]) -> ProcessExecutionResult + Send + Sync>;
pub type UrlOpener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProcessExecutionResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub spawn_error: Option<String>,
}

impl ProcessExecutionResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            spawn_error: None,
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
            spawn_error: None,
        }
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

pub fn default_process_runner(executable: &str, arguments: &[String]) -> ProcessExecutionResult {
    match ProcessCommand::new(executable).args(arguments).output() {
        Ok(output) => ProcessExecutionResult {
            status: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            spawn_error: None,
        },
        Err(err) => ProcessExecutionResult {
            status: 1,
            stdout: String::new(),
            stderr: err.to_string(),
            spawn_error: Some(err.to_string()),
        },
    }
}

pub fn default_url_opener() -> UrlOpener {
    Arc::new(|url: &str| {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "explorer"
        } else {
            "xdg-open"
        };
        if let Err(err) = ProcessCommand::new(opener).arg(url).spawn() {
            tracing::warn!("failed to open browser with {}: {}", opener, err);
        }
    })
}

pub fn locate_claude(settings: &Settings) -> SwitchResult<PathBuf> {
    if let Some(explicit) = settings.claude_executable.as_ref() {
        if is_executable(explicit) {
            return Ok(explicit.clone());
        }
        tracing::warn!("configured claude binary is missing: {}", explicit.display());
    }
    if let Ok(found) = which::which("claude") {
        return Ok(found);
    }
    settings
        .claude_fallback_locations()
        .into_iter()
        .find(|candidate| is_executable(candidate))
        .ok_or(SwitchError::ClaudeNotFound)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
