use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("no backup found for profile {0}")]
    BackupNotFound(String),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("claude CLI not found in PATH or known install locations")]
    ClaudeNotFound,
    #[error("failed to launch claude: {0}")]
    LaunchFailed(String),
    #[error("claude exited with status {0}")]
    ProcessFailed(i32),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("secret store error: {0}")]
    SecretStore(String),
    #[error("cannot remove the active profile {0}; switch to another profile first")]
    ActiveProfile(String),
    #[error("invalid profile name: {0}")]
    InvalidName(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Usage(String),
}

impl SwitchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("failed to {} {}", action, path.display()), source)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::InvalidName(_) => 2,
            Self::ProcessFailed(code) if *code > 0 => *code,
            _ => 1,
        }
    }
}

pub type SwitchResult<T> = Result<T, SwitchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        assert_eq!(SwitchError::Usage("usage: cswitch list".into()).exit_code(), 2);
        assert_eq!(SwitchError::InvalidName(String::new()).exit_code(), 2);
    }

    #[test]
    fn process_failures_forward_child_status() {
        assert_eq!(SwitchError::ProcessFailed(3).exit_code(), 3);
        assert_eq!(SwitchError::ProcessFailed(-1).exit_code(), 1);
        assert_eq!(SwitchError::ClaudeNotFound.exit_code(), 1);
    }

    #[test]
    fn io_errors_carry_path_context() {
        let err = SwitchError::io_at(
            "read",
            Path::new("/tmp/registry.json"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(err.to_string(), "failed to read /tmp/registry.json: missing");
    }
}
