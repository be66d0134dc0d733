//! Backend implementations
//!
//! Hosted and local backends expose the same resource lifecycle through
//! different CLI verbs. Scenarios call the trait and never branch on mode.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use twinrun_common::{BackendMode, Error, Result};

use crate::command::{build_args, build_delete_args, Flags, NoDefaults, TeamOnly};
use crate::context::ExecutionContext;
use crate::executor::{ExecResult, RunOptions, EXIT_TIMEOUT};
use crate::payload::Payload;
use crate::ssh::SshValidator;

/// Resource families the lifecycle scenarios exercise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Repository,
    Machine,
}

impl ResourceKind {
    pub fn noun(&self) -> &'static str {
        match self {
            ResourceKind::Repository => "repository",
            ResourceKind::Machine => "machine",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.noun())
    }
}

/// Optional abilities a backend may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Out-of-band checks over SSH
    SshValidation,
    /// In-place repository resize
    Resize,
    /// Mutations acknowledged as queued tasks
    QueuedTasks,
}

/// Resource lifecycle operations, implemented once per backend
#[async_trait]
pub trait Backend: Send + Sync {
    fn mode(&self) -> BackendMode;

    fn team_name(&self) -> Option<&str> {
        None
    }

    fn region(&self) -> Option<&str> {
        None
    }

    fn ssh(&self) -> Option<&SshValidator> {
        None
    }

    /// Where a repository is mounted on the validated host, if reachable
    fn repository_mount(&self, _name: &str) -> Option<String> {
        None
    }

    fn supports(&self, capability: Capability) -> bool;

    async fn create(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult;

    async fn list(&self, ctx: &ExecutionContext, kind: ResourceKind) -> ExecResult;

    async fn inspect(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult;

    async fn mutate(
        &self,
        ctx: &ExecutionContext,
        kind: ResourceKind,
        name: &str,
    ) -> Result<ExecResult>;

    async fn delete(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult;

    async fn run_function(
        &self,
        ctx: &ExecutionContext,
        function: &str,
        params: &[(&str, &str)],
    ) -> ExecResult;

    /// Whether a list result contains `name`
    fn lists(&self, result: &ExecResult, name: &str) -> bool {
        listed_count(result, name) > 0
    }
}

/// How many entries of a list result carry `name`.
///
/// JSON arrays are matched on their string fields; an object wrapping a
/// single array is unwrapped; plain text is matched on whole tokens.
pub fn listed_count(result: &ExecResult, name: &str) -> usize {
    match result.payload() {
        Payload::Array(items) => count_in(items, name),
        Payload::Object(map) => map
            .values()
            .find_map(|v| v.as_array())
            .map(|items| count_in(items, name))
            .unwrap_or_else(|| text_count(&result.combined_output(), name)),
        _ => text_count(&result.combined_output(), name),
    }
}

fn count_in(items: &[Value], name: &str) -> usize {
    items.iter().filter(|item| names(item, name)).count()
}

fn names(item: &Value, name: &str) -> bool {
    match item {
        Value::String(s) => s == name,
        Value::Object(map) => map.values().any(|v| v.as_str() == Some(name)),
        _ => false,
    }
}

fn text_count(text: &str, name: &str) -> usize {
    text.lines()
        .filter(|line| {
            line.split(|c: char| c.is_whitespace() || "|,;\"'".contains(c))
                .any(|token| token == name)
        })
        .count()
}

fn params_to_flags(flags: Flags, params: &[(&str, &str)]) -> Flags {
    params.iter().fold(flags, |flags, (k, v)| {
        flags.set("param", format!("{}={}", k, v))
    })
}

/// Consecutive failed `queue trace` calls before a task is given up
const MAX_FAILED_TRACES: u32 = 3;

/// Team-scoped hosted API backend
#[derive(Debug, Clone)]
pub struct HostedBackend {
    team: String,
    region: String,
    bridge: String,
    poll_interval: Duration,
}

impl HostedBackend {
    pub fn new(team: impl Into<String>, region: impl Into<String>, bridge: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            region: region.into(),
            bridge: bridge.into(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Follow a queued-task acknowledgment to its terminal state
    async fn await_task(&self, ctx: &ExecutionContext, ack: ExecResult) -> ExecResult {
        let Some(task_id) = ack.task_id().filter(|_| ack.success()) else {
            return ack;
        };

        info!("waiting for task {}", task_id);
        let deadline = Instant::now() + ctx.timeout();
        let mut failed_traces = 0;

        loop {
            let trace = ctx.runner().queue_trace(&task_id).await;
            if !trace.success() {
                failed_traces += 1;
                if failed_traces >= MAX_FAILED_TRACES {
                    let code = trace.exit_code();
                    return trace.into_failure(
                        code,
                        &format!("queue trace for task {} failed {} times", task_id, failed_traces),
                    );
                }
            } else {
                failed_traces = 0;
            }

            if let Some(status) = task_status(&trace) {
                debug!("task {} status {}", task_id, status);
                match status.as_str() {
                    "COMPLETED" => return trace,
                    "FAILED" | "CANCELLED" => {
                        return trace.into_failure(1, &format!("task {} ended {}", task_id, status))
                    }
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                return trace.into_failure(
                    EXIT_TIMEOUT,
                    &format!(
                        "task {} not finished after {} s",
                        task_id,
                        ctx.timeout().as_secs()
                    ),
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// First `status` string found in a trace payload, upper-cased
pub fn task_status(trace: &ExecResult) -> Option<String> {
    fn find(value: &Value) -> Option<&str> {
        match value {
            Value::Object(map) => map
                .iter()
                .find(|(k, v)| k.eq_ignore_ascii_case("status") && v.is_string())
                .and_then(|(_, v)| v.as_str())
                .or_else(|| map.values().find_map(find)),
            Value::Array(items) => items.iter().find_map(find),
            _ => None,
        }
    }
    trace.json().and_then(find).map(str::to_ascii_uppercase)
}

#[async_trait]
impl Backend for HostedBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Hosted
    }

    fn team_name(&self) -> Option<&str> {
        Some(&self.team)
    }

    fn region(&self) -> Option<&str> {
        Some(&self.region)
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::QueuedTasks)
    }

    async fn create(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        let args = match kind {
            ResourceKind::Repository => ctx.args(&["repository", "create", name], &Flags::new()),
            ResourceKind::Machine => build_args(
                &["machine", "create", name],
                &TeamOnly(ctx),
                &Flags::new().set("bridge", self.bridge.as_str()),
            ),
        };
        let ack = ctx.runner().run(&args, RunOptions::default()).await;
        self.await_task(ctx, ack).await
    }

    async fn list(&self, ctx: &ExecutionContext, kind: ResourceKind) -> ExecResult {
        let args = build_args(&[kind.noun(), "list"], &TeamOnly(ctx), &Flags::new());
        ctx.runner().run(&args, RunOptions::default()).await
    }

    async fn inspect(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        let args = match kind {
            ResourceKind::Repository => build_args(
                &["repository", "vault", "get", name],
                &TeamOnly(ctx),
                &Flags::new(),
            ),
            ResourceKind::Machine => {
                build_args(&["machine", "health", name], &TeamOnly(ctx), &Flags::new())
            }
        };
        ctx.runner().run(&args, RunOptions::default()).await
    }

    async fn mutate(
        &self,
        _ctx: &ExecutionContext,
        kind: ResourceKind,
        _name: &str,
    ) -> Result<ExecResult> {
        Err(Error::Skipped(format!(
            "{} resize is not offered by the hosted backend",
            kind
        )))
    }

    async fn delete(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        let args = build_delete_args(
            &[kind.noun(), "delete", name],
            &TeamOnly(ctx),
            &Flags::new().switch("force", true),
        );
        let ack = ctx.runner().run(&args, RunOptions::default()).await;
        self.await_task(ctx, ack).await
    }

    async fn run_function(
        &self,
        ctx: &ExecutionContext,
        function: &str,
        params: &[(&str, &str)],
    ) -> ExecResult {
        let flags = params_to_flags(Flags::new().set("function", function), params);
        let args = ctx.args(&["queue", "create"], &flags);
        let ack = ctx.runner().run(&args, RunOptions::default()).await;
        self.await_task(ctx, ack).await
    }
}

/// SSH-driven lab backend
#[derive(Debug, Clone)]
pub struct LocalBackend {
    ssh: SshValidator,
    machines: Vec<String>,
    datastore: String,
    repository_size: String,
    resized_size: String,
}

impl LocalBackend {
    pub fn new(ssh: SshValidator, machines: Vec<String>, datastore: impl Into<String>) -> Self {
        Self {
            ssh,
            machines,
            datastore: datastore.into(),
            repository_size: "1G".to_string(),
            resized_size: "2G".to_string(),
        }
    }

    /// Machine aliases registered in the local profile
    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    /// Mount point of a repository on the lab machine
    pub fn mount_point(&self, repository: &str) -> String {
        format!("{}/mounts/{}", self.datastore.trim_end_matches('/'), repository)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    fn ssh(&self) -> Option<&SshValidator> {
        Some(&self.ssh)
    }

    fn repository_mount(&self, name: &str) -> Option<String> {
        Some(self.mount_point(name))
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::SshValidation | Capability::Resize)
    }

    async fn create(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        let args = match kind {
            ResourceKind::Repository => ctx.args(
                &["repository", "create", name],
                &Flags::new().set("size", self.repository_size.as_str()),
            ),
            ResourceKind::Machine => build_args(
                &["config", "add-machine", name],
                &NoDefaults,
                &Flags::new()
                    .set("ip", self.ssh.host())
                    .set("user", self.ssh.user())
                    .set("datastore", self.datastore.as_str()),
            ),
        };
        ctx.runner().run(&args, RunOptions::default()).await
    }

    async fn list(&self, ctx: &ExecutionContext, kind: ResourceKind) -> ExecResult {
        match kind {
            ResourceKind::Repository => {
                let args = ctx.args(&["repository", "list"], &Flags::new());
                ctx.runner().run(&args, RunOptions::default()).await
            }
            ResourceKind::Machine => ctx.runner().list_machines().await,
        }
    }

    async fn inspect(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        let args = match kind {
            ResourceKind::Repository => ctx.args(&["repository", "info", name], &Flags::new()),
            ResourceKind::Machine => build_args(
                &["run", "machine_ping"],
                &NoDefaults,
                &Flags::new().set("machine", name),
            ),
        };
        ctx.runner().run(&args, RunOptions::default()).await
    }

    async fn mutate(
        &self,
        ctx: &ExecutionContext,
        kind: ResourceKind,
        name: &str,
    ) -> Result<ExecResult> {
        match kind {
            ResourceKind::Repository => {
                let args = ctx.args(
                    &["repository", "resize", name],
                    &Flags::new().set("size", self.resized_size.as_str()),
                );
                Ok(ctx.runner().run(&args, RunOptions::default()).await)
            }
            ResourceKind::Machine => Err(Error::Skipped(
                "machine entries have nothing to resize".to_string(),
            )),
        }
    }

    async fn delete(&self, ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        match kind {
            ResourceKind::Repository => {
                let args = build_delete_args(&["repository", "delete", name], ctx, &Flags::new());
                ctx.runner().run(&args, RunOptions::default()).await
            }
            ResourceKind::Machine => ctx.runner().remove_machine(name).await,
        }
    }

    async fn run_function(
        &self,
        ctx: &ExecutionContext,
        function: &str,
        params: &[(&str, &str)],
    ) -> ExecResult {
        let flags = params_to_flags(Flags::new(), params);
        let args = ctx.args(&["run", function], &flags);
        ctx.runner().run(&args, RunOptions::default()).await
    }
}
