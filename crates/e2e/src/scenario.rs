//! Scenario runner
//!
//! A [`Suite`] is an ordered list of independently reported cases run
//! against one [`ExecutionContext`]. A failing, panicking or timed-out case
//! is recorded and the next case still runs. Cases only exist in the suite
//! when their backend can run them; statically skipped cases are listed
//! with a reason so counts stay meaningful per backend.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use twinrun_common::{Error, Result};

use crate::context::{panic_message, ExecutionContext};
use crate::provision::Availability;

/// Body of one case
pub type CaseFn =
    Arc<dyn for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<()>> + Send + Sync>;

enum Entry {
    Case { name: String, body: CaseFn },
    Skip { name: String, reason: String },
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Case { name, .. } | Entry::Skip { name, .. } => name,
        }
    }
}

/// Named, ordered test cases sharing one context
pub struct Suite {
    name: String,
    timeout: Option<Duration>,
    entries: Vec<Entry>,
    after_all: Vec<CaseFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

/// Outcome of one case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub duration_ms: u64,
    /// Failure message or skip reason
    pub error: Option<String>,
}

/// Outcome of a whole suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub name: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<CaseResult>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            entries: Vec::new(),
            after_all: Vec::new(),
        }
    }

    /// Per-case timeout; defaults to the context's timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a case
    pub fn case<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.entries.push(Entry::Case {
            name: name.into(),
            body: Arc::new(body),
        });
        self
    }

    /// Register a case that is reported as skipped without running
    pub fn skip(&mut self, name: impl Into<String>, reason: impl Into<String>) -> &mut Self {
        self.entries.push(Entry::Skip {
            name: name.into(),
            reason: reason.into(),
        });
        self
    }

    /// Best-effort hook run after every case; errors are logged only
    pub fn after_all<F>(&mut self, hook: F) -> &mut Self
    where
        F: for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.after_all.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(Entry::name).collect()
    }

    /// Run every case in registration order
    pub async fn run(&self, ctx: &ExecutionContext) -> SuiteResult {
        let start = Instant::now();
        let timeout = self.timeout.unwrap_or_else(|| ctx.timeout());
        info!("Suite '{}' ({}): {} case(s)", self.name, ctx.mode(), self.entries.len());

        let mut results = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let result = match entry {
                Entry::Case { name, body } => run_case(name, body, ctx, timeout).await,
                Entry::Skip { name, reason } => skipped(name, reason),
            };
            log_case(&result);
            results.push(result);
        }

        for hook in &self.after_all {
            if let Err(e) = guarded(hook, ctx, timeout).await {
                warn!("after_all hook of '{}' failed: {}", self.name, e);
            }
        }

        SuiteResult::from_cases(&self.name, results, start.elapsed())
    }

    /// Report every case failed without running, e.g. after provisioning
    /// for the whole group broke
    pub fn report_failed(&self, message: &str) -> SuiteResult {
        for name in self.names() {
            error!("✗ {} - {}", name, message);
        }
        let results = self
            .entries
            .iter()
            .map(|entry| CaseResult {
                name: entry.name().to_string(),
                status: CaseStatus::Failed,
                duration_ms: 0,
                error: Some(message.to_string()),
            })
            .collect();
        SuiteResult::from_cases(&self.name, results, Duration::ZERO)
    }

    /// Run against a context, or report every case skipped when the backend
    /// is unavailable
    pub async fn run_or_skip(&self, ctx: Availability<&ExecutionContext>) -> SuiteResult {
        match ctx {
            Availability::Ready(ctx) => self.run(ctx).await,
            Availability::Disabled(reason) => {
                info!("Suite '{}' skipped: {}", self.name, reason);
                let results = self
                    .entries
                    .iter()
                    .map(|entry| skipped(entry.name(), &reason))
                    .collect();
                SuiteResult::from_cases(&self.name, results, Duration::ZERO)
            }
        }
    }
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("name", &self.name)
            .field("cases", &self.names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run one body with panic and timeout containment
async fn guarded(body: &CaseFn, ctx: &ExecutionContext, timeout: Duration) -> Result<()> {
    let panicked = |panic: Box<dyn std::any::Any + Send>| {
        Error::assertion(format!("panicked: {}", panic_message(panic.as_ref())))
    };

    let future = std::panic::catch_unwind(AssertUnwindSafe(|| body(ctx))).map_err(panicked)?;
    match tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => Err(panicked(panic)),
        Err(_) => Err(Error::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}

async fn run_case(
    name: &str,
    body: &CaseFn,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> CaseResult {
    debug!("Running case: {}", name);
    let start = Instant::now();

    let (status, error) = match guarded(body, ctx, timeout).await {
        Ok(()) => (CaseStatus::Passed, None),
        Err(Error::Skipped(reason)) => (CaseStatus::Skipped, Some(reason)),
        Err(e) => (CaseStatus::Failed, Some(e.to_string())),
    };

    CaseResult {
        name: name.to_string(),
        status,
        duration_ms: start.elapsed().as_millis() as u64,
        error,
    }
}

fn skipped(name: &str, reason: &str) -> CaseResult {
    CaseResult {
        name: name.to_string(),
        status: CaseStatus::Skipped,
        duration_ms: 0,
        error: Some(reason.to_string()),
    }
}

fn log_case(result: &CaseResult) {
    let detail = result.error.as_deref().unwrap_or("unknown error");
    match result.status {
        CaseStatus::Passed => info!("✓ {} ({} ms)", result.name, result.duration_ms),
        CaseStatus::Failed => error!("✗ {} - {}", result.name, detail),
        CaseStatus::Skipped => info!("○ {} - {}", result.name, detail),
    }
}

impl SuiteResult {
    fn from_cases(name: &str, results: Vec<CaseResult>, elapsed: Duration) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let (passed, failed, skipped) = (
            count(CaseStatus::Passed),
            count(CaseStatus::Failed),
            count(CaseStatus::Skipped),
        );
        let duration_ms = elapsed.as_millis() as u64;

        info!(
            "Suite '{}': {} passed, {} failed, {} skipped ({} ms)",
            name, passed, failed, skipped, duration_ms
        );

        Self {
            name: name.to_string(),
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn case(&self, name: &str) -> Option<&CaseResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Write this result to `<dir>/<suite name>.json`
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let file: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}.json", file));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!("Suite results written to: {}", path.display());
        Ok(path)
    }
}

/// Results of every suite in one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub suites: Vec<SuiteResult>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            suites: Vec::new(),
        }
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, suite: SuiteResult) {
        self.total += suite.total;
        self.passed += suite.passed;
        self.failed += suite.failed;
        self.skipped += suite.skipped;
        self.suites.push(suite);
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Write the summary to `<dir>/test-results.json`
    pub fn write_results(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("test-results.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, status: CaseStatus) -> CaseResult {
        CaseResult {
            name: name.into(),
            status,
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn suite_counts_each_status() {
        let result = SuiteResult::from_cases(
            "repository lifecycle",
            vec![
                case("create", CaseStatus::Passed),
                case("list", CaseStatus::Failed),
                case("resize", CaseStatus::Skipped),
            ],
            Duration::from_millis(5),
        );
        assert_eq!((result.total, result.passed, result.failed, result.skipped), (3, 1, 1, 1));
        assert!(!result.is_success());
        assert_eq!(result.case("list").unwrap().status, CaseStatus::Failed);
    }

    #[test]
    fn registration_order_is_kept() {
        let mut suite = Suite::new("order");
        suite
            .case("create", |_ctx| async { Ok(()) }.boxed())
            .skip("resize", "not offered")
            .case("delete", |_ctx| async { Ok(()) }.boxed());
        assert_eq!(suite.names(), vec!["create", "resize", "delete"]);
        assert_eq!(suite.len(), 3);
    }

    #[test]
    fn summary_accumulates_and_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = RunSummary::new();
        summary.push(SuiteResult::from_cases(
            "hosted/repository",
            vec![case("create", CaseStatus::Passed)],
            Duration::ZERO,
        ));
        summary.push(SuiteResult::from_cases(
            "local/repository",
            vec![case("create", CaseStatus::Skipped)],
            Duration::ZERO,
        ));
        assert_eq!((summary.total, summary.passed, summary.skipped), (2, 1, 1));
        assert!(summary.is_success());

        let path = summary.write_results(dir.path()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("\"status\": \"skipped\""));

        let suite_path = summary.suites[0].write_json(dir.path()).unwrap();
        assert!(suite_path.ends_with("hosted_repository.json"));
    }

    #[tokio::test]
    async fn disabled_backend_skips_every_case() {
        let mut suite = Suite::new("local only");
        suite
            .case("mount visible", |_ctx| async { Err(Error::assertion("ran")) }.boxed())
            .case("delete", |_ctx| async { Ok(()) }.boxed());

        let result = suite
            .run_or_skip(Availability::Disabled("E2E_VM1_IP not set".into()))
            .await;
        assert_eq!(result.skipped, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(result.results[0].error.as_deref(), Some("E2E_VM1_IP not set"));
    }
}
