//! Suites and the scenario library driven against an in-memory backend

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use twinrun_common::{BackendMode, Error, Result};
use twinrun_e2e::executor::CliLocation;
use twinrun_e2e::scenario::CaseStatus;
use twinrun_e2e::scenarios::{machine_lifecycle, repository_lifecycle, ScenarioOptions};
use twinrun_e2e::{
    Availability, Backend, Capability, CliRunner, ExecResult, ExecutionContext, Flags,
    ResourceKind, RunnerConfig, Suite, Teardown,
};

/// Resources shared between the backend and the test body
#[derive(Default)]
struct Store {
    repositories: Mutex<BTreeSet<String>>,
    machines: Mutex<BTreeSet<String>>,
    deletes: AtomicUsize,
    functions: Mutex<Vec<String>>,
}

/// Keeps resources in memory and answers like the CLI's JSON output
#[derive(Default, Clone)]
struct MemoryBackend {
    store: Arc<Store>,
    broken_delete: bool,
}

impl MemoryBackend {
    fn store(&self, kind: ResourceKind) -> &Mutex<BTreeSet<String>> {
        match kind {
            ResourceKind::Repository => &self.store.repositories,
            ResourceKind::Machine => &self.store.machines,
        }
    }

    fn key(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Repository => "repositoryName",
            ResourceKind::Machine => "machineName",
        }
    }
}

fn ok(value: Value) -> ExecResult {
    ExecResult::new(value.to_string(), "", 0, Some(value), Duration::ZERO)
}

fn failure(message: &str) -> ExecResult {
    let body = json!({"success": false, "error": {"message": message}});
    ExecResult::new(body.to_string(), "", 1, Some(body), Duration::ZERO)
}

#[async_trait]
impl Backend for MemoryBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    async fn create(&self, _ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        if self.store(kind).lock().insert(name.to_string()) {
            ok(json!({ Self::key(kind): name }))
        } else {
            failure("already exists")
        }
    }

    async fn list(&self, _ctx: &ExecutionContext, kind: ResourceKind) -> ExecResult {
        let items: Vec<Value> = self
            .store(kind)
            .lock()
            .iter()
            .map(|name| json!({ Self::key(kind): name }))
            .collect();
        ok(Value::Array(items))
    }

    async fn inspect(&self, _ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        if self.store(kind).lock().contains(name) {
            ok(json!({ Self::key(kind): name, "status": "ready" }))
        } else {
            failure("not found")
        }
    }

    async fn mutate(
        &self,
        _ctx: &ExecutionContext,
        _kind: ResourceKind,
        _name: &str,
    ) -> Result<ExecResult> {
        Err(Error::Skipped("resize not supported".to_string()))
    }

    async fn delete(&self, _ctx: &ExecutionContext, kind: ResourceKind, name: &str) -> ExecResult {
        self.store.deletes.fetch_add(1, Ordering::SeqCst);
        if self.broken_delete {
            return failure("storage busy");
        }
        if self.store(kind).lock().remove(name) {
            ok(json!({ "deleted": name }))
        } else {
            failure("not found")
        }
    }

    async fn run_function(
        &self,
        _ctx: &ExecutionContext,
        function: &str,
        _params: &[(&str, &str)],
    ) -> ExecResult {
        self.store.functions.lock().push(function.to_string());
        ok(json!({ "function": function }))
    }
}

/// A runner that is never invoked by the memory backend
fn idle_runner() -> CliRunner {
    CliRunner::new(RunnerConfig {
        api_url: "http://127.0.0.1:1/api".to_string(),
        profile: None,
        timeout: Duration::from_secs(1),
        credentials: None,
        cli: CliLocation {
            launcher: None,
            entry: PathBuf::from("/nonexistent/rdc"),
            working_dir: None,
        },
        secret_fallback: None,
    })
}

fn context(backend: MemoryBackend, teardown: Teardown) -> ExecutionContext {
    ExecutionContext::new(
        idle_runner(),
        "vm1",
        Duration::from_secs(5),
        Box::new(backend),
        teardown,
    )
}

fn statuses(result: &twinrun_e2e::SuiteResult) -> Vec<CaseStatus> {
    result.results.iter().map(|r| r.status).collect()
}

#[tokio::test]
async fn repository_lifecycle_passes_on_consistent_backend() {
    let backend = MemoryBackend::default();
    let store = backend.store.clone();
    let ctx = context(backend, Teardown::new());
    let options = ScenarioOptions::for_context(&ctx);
    assert_eq!(options, ScenarioOptions::default());

    let result = repository_lifecycle(&options).run(&ctx).await;

    assert!(result.is_success(), "{:?}", result.results);
    assert_eq!(result.total, 5);
    assert_eq!(result.passed, 5);
    assert!(store.repositories.lock().is_empty());
    // Nothing was left over, so cleanup did not delete again
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_delete_does_not_stop_later_cases() {
    let backend = MemoryBackend {
        broken_delete: true,
        ..Default::default()
    };
    let store = backend.store.clone();
    let ctx = context(backend, Teardown::new());

    let result = machine_lifecycle(&ScenarioOptions::default()).run(&ctx).await;

    assert_eq!(
        statuses(&result),
        vec![
            CaseStatus::Passed,
            CaseStatus::Passed,
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Failed,
            CaseStatus::Passed,
        ]
    );
    let absent = &result.results[4];
    assert!(absent.error.as_deref().unwrap().contains("still listed after delete"));
    // The suite's cleanup tried the leftover once more
    assert_eq!(store.deletes.load(Ordering::SeqCst), 2);
    assert_eq!(store.machines.lock().len(), 1);
    assert_eq!(*store.functions.lock(), vec!["machine_ping"]);
}

#[tokio::test]
async fn each_case_has_its_own_error_boundary() {
    let ctx = context(MemoryBackend::default(), Teardown::new());
    let mut suite = Suite::new("boundaries").with_timeout(Duration::from_millis(200));

    suite.case("passes", |_| async { Ok(()) }.boxed());
    suite.case("fails", |_| async { Err(Error::assertion("wrong count")) }.boxed());
    suite.case("skips itself", |_| {
        async { Err(Error::Skipped("no vault".to_string())) }.boxed()
    });
    suite.case("panics", |_| {
        async {
            let reason = "boom";
            if !reason.is_empty() {
                panic!("{}", reason);
            }
            Ok(())
        }
        .boxed()
    });
    suite.case("hangs", |_| {
        async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
        .boxed()
    });
    suite.skip("static skip", "not on this backend");
    suite.case("still runs", |ctx| {
        async move {
            let created = ctx.create(ResourceKind::Repository, "after-panic").await;
            twinrun_e2e::context::succeeded(&created)
        }
        .boxed()
    });

    let result = suite.run(&ctx).await;

    assert_eq!(
        statuses(&result),
        vec![
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Skipped,
            CaseStatus::Failed,
            CaseStatus::Failed,
            CaseStatus::Skipped,
            CaseStatus::Passed,
        ]
    );
    assert_eq!((result.passed, result.failed, result.skipped), (2, 3, 2));
    let error = |i: usize| result.results[i].error.clone().unwrap_or_default();
    assert_eq!(error(1), "Assertion failed: wrong count");
    assert_eq!(error(2), "no vault");
    assert!(error(3).contains("panicked: boom"));
    assert!(error(4).contains("timeout"));
    assert_eq!(error(5), "not on this backend");
    assert!(!result.is_success());
}

#[tokio::test]
async fn after_all_runs_even_when_cases_fail() {
    let ctx = context(MemoryBackend::default(), Teardown::new());
    let hooks = Arc::new(AtomicUsize::new(0));
    let mut suite = Suite::new("hooks");

    suite.case("fails", |_| async { Err(Error::assertion("nope")) }.boxed());
    let seen = hooks.clone();
    suite.after_all(move |_| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::assertion("hook errors are only logged"))
        }
        .boxed()
    });

    let result = suite.run(&ctx).await;
    assert_eq!(result.failed, 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_backend_skips_every_case() {
    let suite = repository_lifecycle(&ScenarioOptions::default());
    let result = suite
        .run_or_skip(Availability::Disabled("E2E_VM1_IP not set".to_string()))
        .await;

    assert_eq!(result.total, suite.len());
    assert_eq!(result.skipped, suite.len());
    assert!(result.is_success());
    assert!(result
        .results
        .iter()
        .all(|r| r.error.as_deref() == Some("E2E_VM1_IP not set")));
}

#[tokio::test]
async fn cleanup_runs_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut teardown = Teardown::new();
    let counter = runs.clone();
    teardown.step("delete profile", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let ctx = context(MemoryBackend::default(), teardown);

    assert!(!ctx.is_torn_down());
    let report = ctx.cleanup().await.unwrap();
    assert_eq!(report.completed, vec!["delete profile"]);
    assert!(ctx.is_torn_down());
    assert!(ctx.cleanup().await.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn local_context_has_no_team() {
    let ctx = context(MemoryBackend::default(), Teardown::new());

    assert_eq!(ctx.mode(), BackendMode::Local);
    assert!(ctx.team_name().is_none());
    assert!(ctx.ssh().is_none());
    assert_eq!(ctx.machine(), "vm1");

    let args = ctx.args(&["repository", "list"], &Flags::new());
    assert_eq!(args, vec!["repository", "list", "--machine", "vm1"]);
}
