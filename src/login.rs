use crate::error::{SwitchError, SwitchResult};
use crate::process::{locate_claude, UrlOpener};
use crate::settings::{Settings, CLAUDE_OAUTH_HOSTS};
use crate::usage_text::strip_ansi;
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

pub trait LoginFlow: Send + Sync {
    /// Runs the interactive login to completion, handing each output line
    /// to `on_output`.
    fn start(&self, on_output: &mut dyn FnMut(&str)) -> SwitchResult<()>;
    /// Stops a running login. Does nothing when none is running.
    fn cancel(&self);
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct LoginRunner {
    settings: Settings,
    command: Option<(PathBuf, Vec<String>)>,
    url_opener: UrlOpener,
    child: Arc<Mutex<Option<Child>>>,
    cancelled: AtomicBool,
}

impl LoginRunner {
    pub fn new(settings: Settings, url_opener: UrlOpener) -> Self {
        Self {
            settings,
            command: None,
            url_opener,
            child: Arc::new(Mutex::new(None)),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Runs `program arguments` instead of `claude /login`.
    pub fn with_command(
        settings: Settings,
        program: PathBuf,
        arguments: Vec<String>,
        url_opener: UrlOpener,
    ) -> Self {
        Self {
            command: Some((program, arguments)),
            ..Self::new(settings, url_opener)
        }
    }

    fn resolve_command(&self) -> SwitchResult<(PathBuf, Vec<String>)> {
        if let Some(command) = self.command.as_ref() {
            return Ok(command.clone());
        }
        let claude = locate_claude(&self.settings)?;
        Ok((claude, vec!["/login".to_string()]))
    }

    fn spawn(&self) -> SwitchResult<mpsc::Receiver<String>> {
        let (program, arguments) = self.resolve_command()?;
        tracing::info!("starting login: {} {}", program.display(), arguments.join(" "));

        let mut child = ProcessCommand::new(&program)
            .args(&arguments)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SwitchError::LaunchFailed(format!("{}: {}", program.display(), err)))?;

        let (sender, receiver) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, sender.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, sender);
        }

        let mut slot = self
            .child
            .lock()
            .map_err(|_| SwitchError::LaunchFailed("login process lock poisoned".to_string()))?;
        *slot = Some(child);
        Ok(receiver)
    }

    fn wait(&self) -> SwitchResult<()> {
        let child = self
            .child
            .lock()
            .map_err(|_| SwitchError::LaunchFailed("login process lock poisoned".to_string()))?
            .take();
        let Some(mut child) = child else {
            return Err(SwitchError::Cancelled);
        };
        let status = child
            .wait()
            .map_err(|err| SwitchError::io("failed to wait for claude login", err))?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SwitchError::Cancelled);
        }
        if status.success() {
            return Ok(());
        }
        Err(SwitchError::ProcessFailed(status.code().unwrap_or(-1)))
    }
}

impl LoginFlow for LoginRunner {
    fn start(&self, on_output: &mut dyn FnMut(&str)) -> SwitchResult<()> {
        self.cancelled.store(false, Ordering::SeqCst);
        let receiver = self.spawn()?;

        let mut opened = false;
        for raw_line in receiver {
            let line = strip_ansi(&raw_line);
            on_output(&line);
            if opened {
                continue;
            }
            if let Some(url) = find_login_url(&line) {
                tracing::info!("opening login URL in browser");
                (self.url_opener)(&url);
                opened = true;
            }
        }

        self.wait()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let Ok(mut slot) = self.child.lock() else {
            return;
        };
        if let Some(child) = slot.as_mut() {
            if let Err(err) = child.kill() {
                tracing::debug!("login process already gone: {}", err);
            }
        }
    }
}

fn forward_lines<R: Read + Send + 'static>(source: R, sender: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn url_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"https://[^\s"'<>\)\]]+"#).expect("valid url regex"))
}

/// First `https` URL in `text` whose host belongs to the OAuth domains.
pub fn find_login_url(text: &str) -> Option<String> {
    url_regex()
        .find_iter(text)
        .map(|found| found.as_str().trim_end_matches(['.', ',']))
        .find(|candidate| is_oauth_host(candidate))
        .map(ToString::to_string)
}

fn is_oauth_host(candidate: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(candidate) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    CLAUDE_OAUTH_HOSTS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
}
