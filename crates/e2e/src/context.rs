//! Execution context - the unit every scenario runs against
//!
//! A context binds a runner, a default machine and a backend. Shared
//! scenario code only talks to the context; backend differences live behind
//! the [`Backend`] trait.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use twinrun_common::{BackendMode, Error, Result};

use crate::backend::{Backend, Capability, ResourceKind};
use crate::command::{build_args, ArgDefaults, Flags};
use crate::executor::{CliRunner, ExecResult};
use crate::ssh::SshValidator;

type Step = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Ordered teardown actions, each run inside its own error boundary
#[derive(Default)]
pub struct Teardown {
    steps: Vec<(String, Step)>,
}

/// What a teardown run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named step
    pub fn step<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((name.into(), Box::new(move || f().boxed())));
    }

    /// Move every step of `other` to the end of this chain
    pub fn append(&mut self, other: &mut Teardown) {
        self.steps.append(&mut other.steps);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run every step in order. A failing or panicking step is logged and
    /// the chain continues.
    pub async fn run(self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (name, step) in self.steps {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(step)) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            match outcome {
                Ok(Ok(())) => {
                    debug!("teardown '{}' done", name);
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    warn!("teardown '{}' failed: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("teardown '{}' panicked: {}", name, message);
                    report.failed.push((name, message));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown").field("steps", &self.names()).finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Turn a failed invocation into an error carrying its message
pub fn succeeded(result: &ExecResult) -> Result<()> {
    result.expect_success().map(|_| ())
}

/// A provisioned backend plus everything scenarios need to drive it
pub struct ExecutionContext {
    runner: CliRunner,
    machine: String,
    timeout: Duration,
    backend: Box<dyn Backend>,
    teardown: Mutex<Option<Teardown>>,
}

impl ExecutionContext {
    pub fn new(
        runner: CliRunner,
        machine: impl Into<String>,
        timeout: Duration,
        backend: Box<dyn Backend>,
        teardown: Teardown,
    ) -> Self {
        Self {
            runner,
            machine: machine.into(),
            timeout,
            backend,
            teardown: Mutex::new(Some(teardown)),
        }
    }

    pub fn runner(&self) -> &CliRunner {
        &self.runner
    }

    /// Default target machine
    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Default operation timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// Default team; hosted contexts only
    pub fn team_name(&self) -> Option<&str> {
        self.backend.team_name()
    }

    /// Bound SSH validator; local contexts only
    pub fn ssh(&self) -> Option<&SshValidator> {
        self.backend.ssh()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.backend.supports(capability)
    }

    /// Argument vector with this context's defaults
    pub fn args(&self, base: &[&str], flags: &Flags) -> Vec<String> {
        build_args(base, self, flags)
    }

    pub async fn create(&self, kind: ResourceKind, name: &str) -> ExecResult {
        self.backend.create(self, kind, name).await
    }

    pub async fn list(&self, kind: ResourceKind) -> ExecResult {
        self.backend.list(self, kind).await
    }

    pub async fn inspect(&self, kind: ResourceKind, name: &str) -> ExecResult {
        self.backend.inspect(self, kind, name).await
    }

    /// Backend-specific mutation (resize); `Err(Skipped)` where unsupported
    pub async fn mutate(&self, kind: ResourceKind, name: &str) -> Result<ExecResult> {
        self.backend.mutate(self, kind, name).await
    }

    pub async fn delete(&self, kind: ResourceKind, name: &str) -> ExecResult {
        self.backend.delete(self, kind, name).await
    }

    /// Whether `result` (a list) contains `name`
    pub fn lists(&self, result: &ExecResult, name: &str) -> bool {
        self.backend.lists(result, name)
    }

    /// Delete `name` if a listing shows it. Returns whether a delete
    /// succeeded. Never fails.
    pub async fn delete_if_exists(&self, kind: ResourceKind, name: &str) -> bool {
        let listed = self.list(kind).await;
        if listed.success() && !self.lists(&listed, name) {
            return false;
        }
        let deleted = self.delete(kind, name).await;
        if deleted.success() {
            info!("removed leftover {} '{}'", kind, name);
        }
        deleted.success()
    }

    pub async fn run_function(&self, function: &str, params: &[(&str, &str)]) -> ExecResult {
        self.backend.run_function(self, function, params).await
    }

    /// Run the teardown chain. Only the first call does anything.
    pub async fn cleanup(&self) -> Option<TeardownReport> {
        let teardown = self.teardown.lock().take()?;
        info!("cleaning up {} context ({} steps)", self.mode(), teardown.len());
        Some(teardown.run().await)
    }

    /// Whether cleanup has already run
    pub fn is_torn_down(&self) -> bool {
        self.teardown.lock().is_none()
    }
}

impl ArgDefaults for ExecutionContext {
    fn default_team(&self) -> Option<&str> {
        self.team_name()
    }

    fn default_machine(&self) -> Option<&str> {
        Some(&self.machine)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("mode", &self.mode())
            .field("machine", &self.machine)
            .field("team", &self.team_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Fail a scenario step with `message` unless `condition` holds
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::assertion(message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn every_step_runs_despite_failures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut teardown = Teardown::new();

        let h = hits.clone();
        teardown.step("delete machine", move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Err(Error::assertion("machine not found"))
        });
        teardown.step("logout", || async {
            let gone = true;
            if gone {
                panic!("session already gone");
            }
            Ok(())
        });
        let h = hits.clone();
        teardown.step("delete profile", move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = teardown.run().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(report.completed, vec!["delete profile"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "delete machine");
        assert!(report.failed[1].1.contains("session already gone"));
    }

    #[test]
    fn ensure_builds_assertion() {
        assert!(ensure(true, || unreachable!()).is_ok());
        let err = ensure(false, || "missing repo".into()).unwrap_err();
        assert_eq!(err.to_string(), "Assertion failed: missing repo");
    }
}
