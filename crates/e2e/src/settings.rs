//! Harness settings
//!
//! Defaults, then an optional YAML file named by `E2E_CONFIG`, then
//! environment overrides. Every environment read goes through a lookup
//! function so tests can supply a map instead of mutating the process env.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use twinrun_common::{Error, Result};

const S3_VARS: [&str; 4] = [
    "E2E_S3_ENDPOINT",
    "E2E_S3_ACCESS_KEY",
    "E2E_S3_SECRET_KEY",
    "E2E_S3_BUCKET",
];

/// Top-level harness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Target API endpoint
    pub api_url: String,

    /// Per-invocation timeout in milliseconds
    pub cli_timeout_ms: u64,

    /// Per-test-case timeout in milliseconds
    pub test_timeout_ms: u64,

    /// How long provisioning waits for the API to answer, in milliseconds
    pub preflight_timeout_ms: u64,

    /// Domain used for generated account emails
    pub email_domain: String,

    /// Vault secret used when no account secret applies
    pub master_password: Option<String>,

    /// Location of the CLI under test
    pub cli: CliSettings,

    /// Lab machines for the local backend
    pub lab: LabSettings,

    /// Object storage used by backup tests
    pub s3: Option<S3Settings>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:7322/api".to_string(),
            cli_timeout_ms: 60_000,
            test_timeout_ms: 600_000,
            preflight_timeout_ms: 30_000,
            email_domain: "rediacc.test".to_string(),
            master_password: None,
            cli: CliSettings::default(),
            lab: LabSettings::default(),
            s3: None,
        }
    }
}

/// CLI launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Program that runs the entry point; `None` executes the entry directly
    pub launcher: Option<String>,

    /// CLI entry point
    pub entry: PathBuf,

    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            launcher: Some("node".to_string()),
            entry: PathBuf::from("dist/cli-bundle.cjs"),
            working_dir: None,
        }
    }
}

/// Lab machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabSettings {
    pub vm1_ip: Option<String>,
    pub vm2_ip: Option<String>,
    pub ssh_user: Option<String>,

    /// Private key path, `~` allowed
    pub ssh_key: String,

    /// Remote execution agent binary
    pub agent_path: Option<String>,

    /// Datastore root on the lab machines
    pub datastore: String,

    /// Hosts of the secondary storage-pool cluster
    pub ceph_nodes: Vec<String>,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            vm1_ip: None,
            vm2_ip: None,
            ssh_user: None,
            ssh_key: "~/.ssh/id_rsa".to_string(),
            agent_path: None,
            datastore: "/mnt/rediacc".to_string(),
            ceph_nodes: Vec::new(),
        }
    }
}

impl LabSettings {
    /// Why the local backend cannot run, if it cannot
    pub fn missing_reason(&self) -> Option<String> {
        let mut missing = Vec::new();
        if self.vm1_ip.is_none() {
            missing.push("E2E_VM1_IP");
        }
        if self.ssh_user.is_none() {
            missing.push("E2E_SSH_USER");
        }
        if missing.is_empty() {
            None
        } else {
            Some(format!("local backend not configured ({} unset)", missing.join(", ")))
        }
    }

    /// Key path with `~` expanded
    pub fn ssh_key_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.ssh_key).as_ref())
    }

    /// Whether the storage-pool host set is provisioned
    pub fn storage_pool_enabled(&self) -> bool {
        !self.ceph_nodes.is_empty()
    }
}

/// Object storage credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl HarnessSettings {
    /// Load from the process environment
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for every environment read
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match lookup("E2E_CONFIG").filter(|p| !p.is_empty()) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env(&lookup)?;
        Ok(settings)
    }

    /// Parse a YAML settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("E2E_API_URL") {
            self.api_url = url;
        }
        if let Some(ms) = var("E2E_CLI_TIMEOUT") {
            self.cli_timeout_ms = parse_millis("E2E_CLI_TIMEOUT", &ms)?;
        }
        if let Some(ms) = var("E2E_TEST_TIMEOUT") {
            self.test_timeout_ms = parse_millis("E2E_TEST_TIMEOUT", &ms)?;
        }
        // An explicitly empty launcher means "run the entry directly".
        if let Some(launcher) = lookup("E2E_CLI_LAUNCHER") {
            let launcher = launcher.trim().to_string();
            self.cli.launcher = (!launcher.is_empty()).then_some(launcher);
        }
        if let Some(entry) = var("E2E_CLI_ENTRY") {
            self.cli.entry = PathBuf::from(entry);
        }
        if let Some(password) = var("CLI_MASTER_PASSWORD") {
            self.master_password = Some(password);
        }

        if let Some(ip) = var("E2E_VM1_IP") {
            self.lab.vm1_ip = Some(ip);
        }
        if let Some(ip) = var("E2E_VM2_IP") {
            self.lab.vm2_ip = Some(ip);
        }
        if let Some(user) = var("E2E_SSH_USER") {
            self.lab.ssh_user = Some(user);
        }
        if let Some(key) = var("E2E_SSH_KEY") {
            self.lab.ssh_key = key;
        }
        if let Some(agent) = var("E2E_AGENT_PATH") {
            self.lab.agent_path = Some(agent);
        }
        if let Some(datastore) = var("E2E_DATASTORE") {
            self.lab.datastore = datastore;
        }
        if let Some(nodes) = var("E2E_CEPH_NODES") {
            self.lab.ceph_nodes = nodes
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
        }

        let s3: Vec<Option<String>> = S3_VARS.iter().map(|k| var(k)).collect();
        let present = s3.iter().filter(|v| v.is_some()).count();
        if present == S3_VARS.len() {
            let mut values = s3.into_iter().flatten();
            self.s3 = Some(S3Settings {
                endpoint: values.next().unwrap_or_default(),
                access_key: values.next().unwrap_or_default(),
                secret_key: values.next().unwrap_or_default(),
                bucket: values.next().unwrap_or_default(),
            });
        } else if present > 0 {
            let missing = S3_VARS
                .iter()
                .zip(&s3)
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| k.to_string())
                .collect();
            return Err(Error::MissingEnv(missing));
        }

        Ok(())
    }

    pub fn cli_timeout(&self) -> Duration {
        Duration::from_millis(self.cli_timeout_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_millis(self.preflight_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        Error::InvalidConfig(format!("{} must be milliseconds, got '{}'", key, value))
    })
}
