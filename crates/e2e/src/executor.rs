//! Process executor - runs the CLI under test and normalizes its output
//!
//! Every invocation gets the profile flag (when one applies) and the output
//! flag ahead of the caller's tokens, plus a fixed child environment, so the
//! result never depends on the shell that launched the harness. A non-zero
//! exit is data, not an error.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use twinrun_common::{Error, OutputFormat, Result};

use crate::payload::{self, Payload};
use crate::settings::HarnessSettings;

/// Exit code reported when the invocation hit its timeout
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when the CLI could not be started
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Time between SIGTERM and SIGKILL for a timed-out child
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Flags whose value is masked in logs
const SECRET_FLAGS: &[&str] = &["-p", "--password", "--secret-key", "--access-key"];

/// Where the CLI lives and how to start it
#[derive(Debug, Clone)]
pub struct CliLocation {
    /// Program that runs `entry`; `None` executes `entry` itself
    pub launcher: Option<String>,
    pub entry: PathBuf,
    pub working_dir: Option<PathBuf>,
}

/// Account credentials for a runner
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Vault secret, when it differs from the login password
    pub master_password: Option<String>,
}

/// Parameters shared by every invocation of one runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub api_url: String,
    pub profile: Option<String>,
    pub timeout: Duration,
    pub credentials: Option<Credentials>,
    pub cli: CliLocation,
    /// Vault secret used when neither the call nor the account supplies one
    pub secret_fallback: Option<String>,
}

impl RunnerConfig {
    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self {
            api_url: settings.api_url.clone(),
            profile: None,
            timeout: settings.cli_timeout(),
            credentials: None,
            cli: CliLocation {
                launcher: settings.cli.launcher.clone(),
                entry: settings.cli.entry.clone(),
                working_dir: settings.cli.working_dir.clone(),
            },
            secret_fallback: settings.master_password.clone(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-call profile selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOverride {
    Use(String),
    /// Run without any profile flag, e.g. to create or delete profiles
    Disable,
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub output: Option<OutputFormat>,
    pub timeout: Option<Duration>,
    pub profile: Option<ProfileOverride>,
    pub skip_json_parse: bool,
    pub master_password: Option<String>,
}

impl RunOptions {
    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_profile(mut self, name: impl Into<String>) -> Self {
        self.profile = Some(ProfileOverride::Use(name.into()));
        self
    }

    pub fn without_profile(mut self) -> Self {
        self.profile = Some(ProfileOverride::Disable);
        self
    }

    /// Keep the raw text only
    pub fn raw(mut self) -> Self {
        self.skip_json_parse = true;
        self
    }

    pub fn with_master_password(mut self, secret: impl Into<String>) -> Self {
        self.master_password = Some(secret.into());
        self
    }
}

/// Outcome of one CLI invocation
#[derive(Debug, Clone)]
pub struct ExecResult {
    stdout: String,
    stderr: String,
    exit_code: i32,
    json: Option<Value>,
    duration: Duration,
}

impl ExecResult {
    pub fn new(
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
        json: Option<Value>,
        duration: Duration,
    ) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            json,
            duration,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn payload(&self) -> Payload<'_> {
        Payload::classify(self.json.as_ref())
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Non-empty stdout and stderr joined by a newline
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether `needle` appears anywhere in stdout or stderr
    pub fn mentions(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    /// Best available description of a failure
    pub fn error_message(&self) -> String {
        if let Payload::Error(body) = self.payload() {
            return body.to_string();
        }
        if !self.stderr.trim().is_empty() {
            return self.stderr.trim().to_string();
        }
        if !self.stdout.trim().is_empty() {
            return self.stdout.trim().to_string();
        }
        "No error details available".to_string()
    }

    pub fn expect_success(&self) -> Result<&Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::assertion(format!(
                "CLI command failed (exit {}): {}",
                self.exit_code,
                self.error_message()
            )))
        }
    }

    pub fn expect_array(&self) -> Result<&[Value]> {
        self.expect_success()?;
        match self.payload() {
            Payload::Array(items) => Ok(items),
            other => Err(self.shape_error("array", other.kind())),
        }
    }

    pub fn expect_object(&self) -> Result<&Map<String, Value>> {
        self.expect_success()?;
        match self.payload() {
            Payload::Object(map) => Ok(map),
            other => Err(self.shape_error("object", other.kind())),
        }
    }

    fn shape_error(&self, wanted: &str, got: &str) -> Error {
        let json = self
            .json
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        Error::assertion(format!(
            "Expected JSON {} but got {}: {}\nstdout: {}",
            wanted,
            got,
            payload::preview(&json, 200),
            payload::preview(&self.stdout, 500)
        ))
    }

    /// Queued-task id acknowledged by this invocation, if any
    pub fn task_id(&self) -> Option<String> {
        if let Payload::Object(map) = self.payload() {
            for key in ["taskId", "task_id", "TaskId"] {
                if let Some(Value::String(id)) = map.get(key) {
                    return Some(id.clone());
                }
            }
        }
        payload::extract_task_id(&self.stdout).or_else(|| payload::extract_task_id(&self.stderr))
    }

    /// The same result marked as failed, with `note` appended to stderr
    pub fn into_failure(mut self, exit_code: i32, note: &str) -> Self {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(note);
        self.exit_code = if exit_code == 0 { 1 } else { exit_code };
        self
    }
}

/// Runs the CLI under test
#[derive(Debug, Clone)]
pub struct CliRunner {
    config: Arc<RunnerConfig>,
}

impl CliRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// A runner bound to `profile`, otherwise identical
    pub fn for_profile(&self, profile: impl Into<String>) -> Self {
        Self::new(self.config.as_ref().clone().with_profile(profile))
    }

    /// Profile flag, output flag, then the caller's tokens
    pub fn full_args<S: AsRef<str>>(&self, args: &[S], opts: &RunOptions) -> Vec<String> {
        let profile = match &opts.profile {
            Some(ProfileOverride::Use(name)) => Some(name.as_str()),
            Some(ProfileOverride::Disable) => None,
            None => self.config.profile.as_deref(),
        };
        let output = opts.output.unwrap_or_default();

        let mut full = Vec::with_capacity(args.len() + 4);
        if let Some(profile) = profile.filter(|p| !p.is_empty()) {
            full.push("--config".to_string());
            full.push(profile.to_string());
        }
        full.push("--output".to_string());
        full.push(output.as_str().to_string());
        full.extend(args.iter().map(|a| a.as_ref().to_string()));
        full
    }

    /// Vault secret for this call
    pub fn resolve_secret(&self, opts: &RunOptions) -> String {
        let creds = self.config.credentials.as_ref();
        opts.master_password
            .clone()
            .or_else(|| creds.and_then(|c| c.master_password.clone()))
            .or_else(|| creds.map(|c| c.password.clone()))
            .or_else(|| self.config.secret_fallback.clone())
            .unwrap_or_default()
    }

    /// Environment passed to the child
    pub fn child_env(&self, opts: &RunOptions) -> Vec<(&'static str, String)> {
        vec![
            ("REDIACC_API_URL", self.config.api_url.clone()),
            ("REDIACC_MASTER_PASSWORD", self.resolve_secret(opts)),
            ("REDIACC_EXPERIMENTAL", "1".to_string()),
            ("NO_COLOR", "1".to_string()),
            ("FORCE_COLOR", "0".to_string()),
        ]
    }

    /// Run the CLI. Never fails: spawn errors, timeouts and non-zero exits
    /// all come back as an `ExecResult`.
    pub async fn run<S: AsRef<str>>(&self, args: &[S], opts: RunOptions) -> ExecResult {
        let full_args = self.full_args(args, &opts);
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let start = Instant::now();

        info!("[CLI] {}", mask_secrets(&full_args).join(" "));

        let mut cmd = match &self.config.cli.launcher {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(&self.config.cli.entry);
                cmd
            }
            None => Command::new(&self.config.cli.entry),
        };
        cmd.args(&full_args)
            .envs(self.child_env(&opts))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.config.cli.working_dir {
            cmd.current_dir(dir);
        }

        let (stdout, stderr, exit_code) = match cmd.spawn() {
            Ok(child) => wait_with_timeout(child, timeout).await,
            Err(e) => {
                let program = self
                    .config
                    .cli
                    .launcher
                    .clone()
                    .unwrap_or_else(|| self.config.cli.entry.display().to_string());
                (
                    String::new(),
                    format!("failed to spawn {}: {}", program, e),
                    EXIT_SPAWN_FAILED,
                )
            }
        };

        if !stdout.trim().is_empty() {
            debug!("[STDOUT]\n{}", stdout);
        }
        if !stderr.trim().is_empty() {
            debug!("[STDERR]\n{}", stderr);
        }
        debug!("[EXIT] {}", exit_code);

        let json = if opts.skip_json_parse {
            None
        } else {
            payload::extract_json(&stdout)
        };

        ExecResult::new(stdout, stderr, exit_code, json, start.elapsed())
    }
}

/// Wait for `child`, terminating its process group if it outlives `timeout`.
async fn wait_with_timeout(mut child: Child, timeout: Duration) -> (String, String, i32) {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status.ok(), false),
        Err(_) => {
            warn!("CLI exceeded {:?}, terminating", timeout);
            (terminate(&mut child).await, true)
        }
    };

    let stdout = collect(stdout).await;
    let mut stderr = collect(stderr).await;

    let exit_code = if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("timed out after {} ms", timeout.as_millis()));
        EXIT_TIMEOUT
    } else {
        status.map(exit_code_of).unwrap_or(1)
    };

    (stdout, stderr, exit_code)
}

/// SIGTERM the child's group, then SIGKILL after the grace period
async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);
            if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
                return status.ok();
            }
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    let _ = child.start_kill();
    child.wait().await.ok()
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    // A grandchild outside the killed group could keep the pipe open.
    match tokio::time::timeout(KILL_GRACE, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

/// Copy of `args` with secret flag values replaced by `***`
pub fn mask_secrets(args: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut hide_next = false;

    for arg in args {
        if hide_next {
            masked.push("***".to_string());
            hide_next = false;
            continue;
        }
        match arg.split_once('=') {
            Some((flag, _)) if SECRET_FLAGS.contains(&flag) => {
                masked.push(format!("{}=***", flag));
            }
            _ => {
                hide_next = SECRET_FLAGS.contains(&arg.as_str());
                masked.push(arg.clone());
            }
        }
    }

    masked
}
