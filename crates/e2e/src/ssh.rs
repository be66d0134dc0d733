//! Out-of-band verification over SSH
//!
//! Every helper composes [`SshValidator::exec`] with a standard inspection
//! tool on the remote side and pattern-matches its output. A command that
//! fails or a pattern that is absent comes back as `false`, `None` or an
//! empty list, never as an error.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::executor::{EXIT_SPAWN_FAILED, EXIT_TIMEOUT};

/// Default timeout for one remote command
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection policy for disposable lab hosts
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=10",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// Outcome of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResult {
    stdout: String,
    stderr: String,
    code: i32,
    duration: Duration,
}

impl RemoteResult {
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Non-empty trimmed stdout lines
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Runs shell commands on one lab host
#[derive(Debug, Clone)]
pub struct SshValidator {
    host: String,
    user: String,
    key_path: PathBuf,
    program: PathBuf,
    docker_host: Option<String>,
    timeout: Duration,
}

impl SshValidator {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: impl AsRef<Path>) -> Self {
        let key = key_path.as_ref().to_string_lossy();
        Self {
            host: host.into(),
            user: user.into(),
            key_path: PathBuf::from(shellexpand::tilde(&key).as_ref()),
            program: PathBuf::from("ssh"),
            docker_host: None,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    /// Use a different `ssh` binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Route container commands to a specific Docker daemon socket
    pub fn with_docker_host(mut self, socket: impl Into<String>) -> Self {
        self.docker_host = Some(socket.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Full `ssh` argument list for `command`
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.push("-i".to_string());
        args.push(self.key_path.display().to_string());
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    pub async fn exec(&self, command: &str) -> RemoteResult {
        self.exec_with_timeout(command, self.timeout).await
    }

    pub async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> RemoteResult {
        let start = Instant::now();
        debug!("[SSH {}] {}", self.destination(), command);

        let mut cmd = Command::new(&self.program);
        cmd.args(self.ssh_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (stdout, stderr, code) = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => (
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                output.status.code().unwrap_or(255),
            ),
            Ok(Err(e)) => (
                String::new(),
                format!("failed to spawn {}: {}", self.program.display(), e),
                EXIT_SPAWN_FAILED,
            ),
            Err(_) => {
                warn!("SSH command on {} exceeded {:?}", self.host, timeout);
                (
                    String::new(),
                    format!("ssh command timed out after {} ms", timeout.as_millis()),
                    EXIT_TIMEOUT,
                )
            }
        };

        if code != 0 {
            debug!("[SSH {}] exit {}: {}", self.host, code, stderr.trim());
        }

        RemoteResult {
            stdout,
            stderr,
            code,
            duration: start.elapsed(),
        }
    }

    // Filesystem

    pub async fn file_exists(&self, path: &str) -> bool {
        self.exec(&format!("test -f {}", quote(path))).await.success()
    }

    pub async fn dir_exists(&self, path: &str) -> bool {
        self.exec(&format!("test -d {}", quote(path))).await.success()
    }

    /// Whether `path` is a mount point according to `/proc/mounts`
    pub async fn mount_exists(&self, path: &str) -> bool {
        let result = self.exec("cat /proc/mounts").await;
        result.success() && mounts_contain(result.stdout(), path)
    }

    pub async fn list_dir(&self, path: &str) -> Vec<String> {
        let result = self.exec(&format!("ls -1A {}", quote(path))).await;
        if result.success() {
            result.lines()
        } else {
            Vec::new()
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> bool {
        self.exec(&format!("printf '%s' {} > {}", quote(content), quote(path)))
            .await
            .success()
    }

    pub async fn create_random_file(&self, path: &str, size_kb: u64) -> bool {
        self.exec(&format!(
            "dd if=/dev/urandom of={} bs=1024 count={} status=none",
            quote(path),
            size_kb
        ))
        .await
        .success()
    }

    pub async fn remove_file(&self, path: &str) -> bool {
        self.exec(&format!("rm -f {}", quote(path))).await.success()
    }

    pub async fn file_size(&self, path: &str) -> Option<u64> {
        let result = self.exec(&format!("stat -c %s {}", quote(path))).await;
        if !result.success() {
            return None;
        }
        result.stdout().trim().parse().ok()
    }

    /// Hex SHA-256 of a remote file
    pub async fn sha256(&self, path: &str) -> Option<String> {
        let result = self.exec(&format!("sha256sum {}", quote(path))).await;
        if !result.success() {
            return None;
        }
        result
            .stdout()
            .split_whitespace()
            .next()
            .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .map(str::to_ascii_lowercase)
    }

    /// Whether the remote file's digest matches `expected`
    pub async fn verify_content(&self, path: &str, expected: &[u8]) -> bool {
        let local = hex::encode(Sha256::digest(expected));
        match self.sha256(path).await {
            Some(remote) => remote == local,
            None => false,
        }
    }

    // Containers

    fn docker(&self, args: &str) -> String {
        match &self.docker_host {
            Some(socket) => format!("sudo env DOCKER_HOST={} docker {}", quote(socket), args),
            None => format!("sudo docker {}", args),
        }
    }

    pub async fn container_running(&self, name: &str) -> bool {
        let cmd = self.docker(&format!(
            "ps --filter status=running --filter {} --format '{{{{.Names}}}}'",
            quote(&format!("name=^{}$", name))
        ));
        self.exec(&cmd).await.lines().iter().any(|l| l == name)
    }

    pub async fn container_exists(&self, name: &str) -> bool {
        let cmd = self.docker(&format!(
            "ps -a --filter {} --format '{{{{.Names}}}}'",
            quote(&format!("name=^{}$", name))
        ));
        self.exec(&cmd).await.lines().iter().any(|l| l == name)
    }

    /// `running`, `paused`, `exited`, ... or `None` if the container is unknown
    pub async fn container_state(&self, name: &str) -> Option<String> {
        let cmd = self.docker(&format!(
            "inspect --format '{{{{.State.Status}}}}' {}",
            quote(name)
        ));
        let result = self.exec(&cmd).await;
        if !result.success() {
            return None;
        }
        result.lines().into_iter().next()
    }

    // Block storage

    pub async fn rbd_list(&self, pool: &str) -> Vec<String> {
        let result = self.exec(&format!("sudo rbd ls {}", quote(pool))).await;
        if result.success() {
            result.lines()
        } else {
            Vec::new()
        }
    }

    /// Raw `rbd info` text for `pool/image`
    pub async fn rbd_info(&self, image: &str, pool: &str) -> Option<String> {
        let image_ref = format!("{}/{}", pool, image);
        let result = self.exec(&format!("sudo rbd info {}", quote(&image_ref))).await;
        result.success().then(|| result.stdout().to_string())
    }

    /// Rows of `rbd showmapped`, header excluded
    pub async fn rbd_show_mapped(&self) -> Vec<String> {
        let result = self.exec("sudo rbd showmapped").await;
        if !result.success() {
            return Vec::new();
        }
        without_header(result.lines(), "id")
    }

    /// Rows of `rbd snap ls`, header excluded
    pub async fn rbd_snap_list(&self, image: &str, pool: &str) -> Vec<String> {
        let image_ref = format!("{}/{}", pool, image);
        let result = self.exec(&format!("sudo rbd snap ls {}", quote(&image_ref))).await;
        if !result.success() {
            return Vec::new();
        }
        without_header(result.lines(), "snapid")
    }
}

/// Quote one token for a POSIX shell
pub fn quote(s: &str) -> String {
    shell_escape::escape(Cow::Borrowed(s)).into_owned()
}

/// Whether `/proc/mounts` text lists `path` as a mount point.
/// The kernel octal-escapes spaces, tabs and backslashes in that file.
fn mounts_contain(mounts: &str, path: &str) -> bool {
    let escaped = path
        .replace('\\', "\\134")
        .replace(' ', "\\040")
        .replace('\t', "\\011");
    let wanted = escaped.trim_end_matches('/');
    let wanted = if wanted.is_empty() { "/" } else { wanted };

    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == wanted)
}

fn without_header(lines: Vec<String>, first_column: &str) -> Vec<String> {
    lines
        .into_iter()
        .filter(|l| {
            !l.split_whitespace()
                .next()
                .map(|c| c.eq_ignore_ascii_case(first_column))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/rbd0 /mnt/rediacc/mounts/repo-1 ext4 rw,relatime 0 0
/dev/rbd1 /mnt/with\\040space ext4 rw,relatime 0 0
";

    #[test]
    fn fixed_connection_policy() {
        let ssh = SshValidator::new("10.0.0.11", "muscle", "/keys/id_ed25519");
        let args = ssh.ssh_args("uptime");
        let joined = args.join(" ");
        assert!(joined.contains("StrictHostKeyChecking=no"));
        assert!(joined.contains("UserKnownHostsFile=/dev/null"));
        assert!(joined.contains("ConnectTimeout=10"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("LogLevel=ERROR"));
        assert_eq!(
            &args[args.len() - 4..],
            &["-i", "/keys/id_ed25519", "muscle@10.0.0.11", "uptime"]
        );
    }

    #[test]
    fn mount_table_matching() {
        assert!(mounts_contain(MOUNTS, "/mnt/rediacc/mounts/repo-1"));
        assert!(mounts_contain(MOUNTS, "/mnt/rediacc/mounts/repo-1/"));
        assert!(mounts_contain(MOUNTS, "/mnt/with space"));
        assert!(!mounts_contain(MOUNTS, "/mnt/rediacc/mounts/repo"));
        assert!(!mounts_contain(MOUNTS, "/mnt/rediacc"));
    }

    #[test]
    fn quoting_neutralizes_shell_syntax() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("x'; rm -rf /"), "'x'\\''; rm -rf /'");
    }

    #[test]
    fn docker_commands_use_configured_socket() {
        let ssh = SshValidator::new("h", "u", "/k");
        assert_eq!(ssh.docker("info"), "sudo docker info");
        let ssh = ssh.with_docker_host("unix:///var/run/rediacc/docker-2816.sock");
        assert_eq!(
            ssh.docker("info"),
            "sudo env DOCKER_HOST='unix:///var/run/rediacc/docker-2816.sock' docker info"
        );
    }

    #[test]
    fn header_rows_are_dropped() {
        let rows = vec![
            "SNAPID  NAME   SIZE  PROTECTED".to_string(),
            "4       snap1  1 GiB yes".to_string(),
        ];
        assert_eq!(without_header(rows, "snapid"), vec!["4       snap1  1 GiB yes"]);
    }
}
