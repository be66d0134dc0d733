//! Hosted and local backends, and provisioning, against a stateful fake CLI
//!
//! The script keeps its state in files next to itself and appends every
//! argument vector to `calls.log`, one line per invocation.

use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use twinrun_common::{BackendMode, Error, SubscriptionPlan};
use twinrun_e2e::executor::CliLocation;
use twinrun_e2e::provision::{provision, provision_hosted, provision_local, PRIMARY_MACHINE};
use twinrun_e2e::scenario::CaseStatus;
use twinrun_e2e::scenarios::{repository_lifecycle, ScenarioOptions};
use twinrun_e2e::settings::{CliSettings, LabSettings};
use twinrun_e2e::{
    CliRunner, ExecutionContext, HarnessSettings, HostedBackend, LocalBackend, ResourceKind,
    RunnerConfig, SshValidator, Teardown,
};

const FAKE_CLI: &str = r#"
STATE="$(dirname "$0")"
echo "$*" >> "$STATE/calls.log"
while [ $# -gt 0 ]; do
  case "$1" in
    --config|--output) shift 2 ;;
    *) break ;;
  esac
done
name="$3"
case "$1 $2" in
  "repository create")
    echo "$name" >> "$STATE/repos"
    echo "Task ID: 00aa-0001"
    ;;
  "repository list")
    case " $* " in
      *" --team "*|*" --machine "*)
        printf '['
        sep=''
        if [ -f "$STATE/repos" ]; then
          while read -r repo; do
            printf '%s{"repositoryName":"%s"}' "$sep" "$repo"
            sep=','
          done < "$STATE/repos"
        fi
        printf ']\n'
        ;;
      *)
        if [ -f "$STATE/plain-errors" ]; then
          echo "Error: Team name required" >&2
        else
          echo '{"success":false,"error":{"code":"VALIDATION","message":"Team name required. Use --team or set context."}}'
        fi
        exit 1
        ;;
    esac
    ;;
  "repository vault"|"repository info") echo '{"vault":"{}"}' ;;
  "repository resize") echo '{"resized":true}' ;;
  "repository delete")
    grep -vx "$name" "$STATE/repos" > "$STATE/repos.tmp"
    mv "$STATE/repos.tmp" "$STATE/repos"
    echo "Task ID: 00aa-0002"
    ;;
  "queue create") echo '{"taskId":"00aa-0003"}' ;;
  "queue trace")
    n=$(cat "$STATE/trace-$name" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > "$STATE/trace-$name"
    if [ -f "$STATE/trace-broken" ]; then
      echo "trace unavailable" >&2
      exit 1
    fi
    if [ "$n" -lt 2 ]; then
      echo "{\"taskId\":\"$name\",\"status\":\"PENDING\"}"
    else
      final=$(cat "$STATE/final-status" 2>/dev/null || echo COMPLETED)
      echo "{\"taskId\":\"$name\",\"status\":\"$final\"}"
    fi
    ;;
  "run machine_ping") echo '{"pong":true}' ;;
  "config init") echo "{\"created\":\"$name\"}" ;;
  "config delete") echo "{\"deleted\":\"$name\"}" ;;
  "config add-machine")
    if grep -qx "$name" "$STATE/fail-machines" 2>/dev/null; then
      echo '{"success":false,"error":{"message":"host unreachable"}}'
      exit 1
    fi
    echo "{\"added\":\"$name\"}"
    ;;
  "auth register"|"auth login"|"auth logout") echo '{"success":true}' ;;
  "auth activate")
    if [ -f "$STATE/fail-activate" ]; then
      echo '{"success":false,"error":{"code":"INVALID_CODE","message":"Activation code rejected"}}'
      exit 1
    fi
    echo '{"success":true}'
    ;;
  "team list") echo '[{"teamName":"Private Team"}]' ;;
  "region list") echo '[{"regionName":"Default Region"}]' ;;
  "bridge list") echo '[{"bridgeName":"Global Bridges"}]' ;;
  "machine create"|"machine delete") echo "{\"machineName\":\"$name\"}" ;;
  *) echo "unknown command $*" >&2; exit 2 ;;
esac
"#;

struct FakeCli {
    dir: TempDir,
}

impl FakeCli {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fake-cli.sh"), FAKE_CLI).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn location(&self) -> CliLocation {
        CliLocation {
            launcher: Some("sh".to_string()),
            entry: self.path().join("fake-cli.sh"),
            working_dir: Some(self.path().to_path_buf()),
        }
    }

    /// Create a marker or data file the script consults
    fn set(&self, file: &str, content: &str) {
        std::fs::write(self.path().join(file), content).unwrap();
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn called(&self, needle: &str) -> bool {
        self.calls().iter().any(|line| line.contains(needle))
    }

    fn runner(&self) -> CliRunner {
        CliRunner::new(RunnerConfig {
            api_url: "http://127.0.0.1:7322/api".to_string(),
            profile: Some("ctx-test".to_string()),
            timeout: Duration::from_secs(10),
            credentials: None,
            cli: self.location(),
            secret_fallback: None,
        })
    }

    fn hosted(&self, timeout: Duration) -> ExecutionContext {
        let backend = HostedBackend::new("Private Team", "Default Region", "Global Bridges")
            .with_poll_interval(Duration::from_millis(10));
        ExecutionContext::new(self.runner(), "m1", timeout, Box::new(backend), Teardown::new())
    }

    fn local(&self) -> ExecutionContext {
        let ssh = SshValidator::new("10.0.0.5", "tester", "/keys/lab");
        let backend = LocalBackend::new(ssh, vec![PRIMARY_MACHINE.to_string()], "/mnt/rediacc");
        ExecutionContext::new(
            self.runner(),
            PRIMARY_MACHINE,
            Duration::from_secs(10),
            Box::new(backend),
            Teardown::new(),
        )
    }

    fn settings(&self, api_url: &str) -> HarnessSettings {
        HarnessSettings {
            api_url: api_url.to_string(),
            cli_timeout_ms: 10_000,
            preflight_timeout_ms: 300,
            cli: CliSettings {
                launcher: Some("sh".to_string()),
                entry: self.path().join("fake-cli.sh"),
                working_dir: Some(self.path().to_path_buf()),
            },
            lab: LabSettings {
                vm1_ip: Some("10.0.0.5".to_string()),
                vm2_ip: Some("10.0.0.6".to_string()),
                ssh_user: Some("tester".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// HTTP endpoint that answers every request with 200
async fn serve_api() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    });
    format!("http://{}/api", addr)
}

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/api", addr)
}

// Hosted backend

#[tokio::test]
async fn hosted_repository_lifecycle_follows_queued_tasks() {
    let cli = FakeCli::new();
    let ctx = cli.hosted(Duration::from_secs(10));
    let options = ScenarioOptions::for_context(&ctx);
    assert!(options.team_scoped && options.queued_tasks);

    let result = repository_lifecycle(&options).run(&ctx).await;

    assert!(result.is_success(), "{:?}", result.results);
    assert_eq!(result.total, 6);

    let calls = cli.calls();
    let create = calls
        .iter()
        .find(|c| c.contains("repository create"))
        .unwrap();
    assert!(create.starts_with("--config ctx-test --output json repository create test-repo-lifecycle-"));
    assert!(create.ends_with("--team Private Team --machine m1"));

    // Listing and deleting name the team but not the machine
    let list = calls
        .iter()
        .find(|c| c.contains("repository list --team"))
        .unwrap();
    assert!(!list.contains("--machine"));
    let delete = calls.iter().find(|c| c.contains("repository delete")).unwrap();
    assert!(delete.ends_with("--team Private Team --force"));

    // Each acknowledged task was traced until it left PENDING
    assert_eq!(calls.iter().filter(|c| c.contains("queue trace 00aa-0001")).count(), 2);
    assert_eq!(calls.iter().filter(|c| c.contains("queue trace 00aa-0002")).count(), 2);
}

#[tokio::test]
async fn failed_task_fails_the_create() {
    let cli = FakeCli::new();
    cli.set("final-status", "FAILED");
    let ctx = cli.hosted(Duration::from_secs(10));

    let result = ctx.create(ResourceKind::Repository, "repo-x").await;

    assert!(!result.success());
    assert!(result.stderr().contains("task 00aa-0001 ended FAILED"));
}

#[tokio::test]
async fn broken_trace_gives_up_before_the_timeout() {
    let cli = FakeCli::new();
    cli.set("trace-broken", "");
    let ctx = cli.hosted(Duration::from_secs(60));
    let start = Instant::now();

    let result = ctx.create(ResourceKind::Repository, "repo-x").await;

    assert!(!result.success());
    assert!(result.stderr().contains("trace unavailable"));
    assert!(result.stderr().contains("queue trace for task 00aa-0001 failed 3 times"));
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn team_check_needs_a_structured_error() {
    let cli = FakeCli::new();
    cli.set("plain-errors", "");
    let ctx = cli.hosted(Duration::from_secs(10));

    let result = repository_lifecycle(&ScenarioOptions::for_context(&ctx))
        .run(&ctx)
        .await;

    let case = result.case("list without team is rejected").unwrap();
    assert_eq!(case.status, CaseStatus::Failed);
    assert!(case.error.as_deref().unwrap().contains("expected a structured error"));
    assert_eq!(result.failed, 1);
}

#[tokio::test]
async fn hosted_function_is_queued_and_awaited() {
    let cli = FakeCli::new();
    let ctx = cli.hosted(Duration::from_secs(10));

    let result = ctx.run_function("machine_ping", &[("verbose", "1")]).await;

    assert!(result.success(), "{}", result.error_message());
    assert!(cli.called(
        "queue create --team Private Team --machine m1 --function machine_ping --param verbose=1"
    ));
    assert!(cli.called("queue trace 00aa-0003"));
}

// Local backend

#[tokio::test]
async fn local_backend_targets_the_default_machine() {
    let cli = FakeCli::new();
    let ctx = cli.local();

    assert!(ctx.create(ResourceKind::Repository, "repo-l").await.success());
    assert!(ctx.mutate(ResourceKind::Repository, "repo-l").await.unwrap().success());
    assert!(ctx.inspect(ResourceKind::Machine, "vm1").await.success());
    assert!(ctx.run_function("machine_ping", &[]).await.success());
    assert!(matches!(
        ctx.mutate(ResourceKind::Machine, "vm1").await,
        Err(Error::Skipped(_))
    ));

    assert!(cli.called("repository create repo-l --machine vm1 --size 1G"));
    assert!(cli.called("repository resize repo-l --machine vm1 --size 2G"));
    assert!(cli.called("--output json run machine_ping --machine vm1"));
    // Local commands never poll for tasks
    assert!(!cli.called("queue trace"));
    assert_eq!(ctx.backend().repository_mount("repo-l").as_deref(), Some("/mnt/rediacc/mounts/repo-l"));
}

// Provisioning

#[tokio::test]
async fn local_provisioning_undoes_profile_when_a_machine_fails() {
    let cli = FakeCli::new();
    cli.set("fail-machines", "vm2\n");

    let err = provision_local(&cli.settings("http://127.0.0.1:7322/api"))
        .await
        .unwrap_err();

    match err {
        Error::Provisioning { step, message } => {
            assert_eq!(step, "add machine vm2");
            assert!(message.contains("host unreachable"));
        }
        other => panic!("expected provisioning error, got {:?}", other),
    }

    let calls = cli.calls();
    let added = calls.iter().position(|c| c.contains("config add-machine vm2")).unwrap();
    let deleted = calls.iter().position(|c| c.contains("config delete e2e-local-")).unwrap();
    assert!(deleted > added);
}

#[tokio::test]
async fn local_provisioning_registers_both_machines() {
    let cli = FakeCli::new();
    let ctx = provision_local(&cli.settings("http://127.0.0.1:7322/api"))
        .await
        .unwrap()
        .ready()
        .unwrap();

    assert_eq!(ctx.mode(), BackendMode::Local);
    assert_eq!(ctx.machine(), PRIMARY_MACHINE);
    assert!(ctx.team_name().is_none());
    assert_eq!(ctx.ssh().unwrap().host(), "10.0.0.5");
    assert!(cli.called("config add-machine vm1 --ip 10.0.0.5 --user tester --datastore /mnt/rediacc"));
    assert!(cli.called("config add-machine vm2 --ip 10.0.0.6"));

    let report = ctx.cleanup().await.unwrap();
    assert_eq!(report.completed, vec!["delete profile"]);
    assert!(cli.called("config delete e2e-local-"));
}

#[tokio::test]
async fn hosted_provisioning_resolves_defaults_and_tears_down_in_order() {
    let cli = FakeCli::new();
    let api = serve_api().await;

    let ctx = provision_hosted(&cli.settings(&api), SubscriptionPlan::Community)
        .await
        .unwrap();

    assert_eq!(ctx.mode(), BackendMode::Hosted);
    assert_eq!(ctx.team_name(), Some("Private Team"));
    assert!(ctx.ssh().is_none());
    assert!(ctx.machine().starts_with("e2e-machine-"));
    assert!(cli.called("auth activate"));
    assert!(cli.called("--code AAA111"));
    assert!(cli.called("bridge list --region Default Region"));

    let report = ctx.cleanup().await.unwrap();
    assert_eq!(report.completed, vec!["delete machine", "logout", "delete profile"]);
}

#[tokio::test]
async fn hosted_provisioning_names_the_failed_step() {
    let cli = FakeCli::new();
    cli.set("fail-activate", "");
    let api = serve_api().await;

    let err = provision_hosted(&cli.settings(&api), SubscriptionPlan::Community)
        .await
        .unwrap_err();

    match err {
        Error::Provisioning { step, message } => {
            assert_eq!(step, "activate");
            assert!(message.contains("Activation code rejected"));
        }
        other => panic!("expected provisioning error, got {:?}", other),
    }
    // The profile was removed; nothing past activation ran
    assert!(cli.called("config delete test-"));
    assert!(!cli.called("auth login"));
    assert!(!cli.called("auth logout"));
}

#[tokio::test]
async fn unreachable_api_fails_hosted_provisioning() {
    let cli = FakeCli::new();
    let settings = cli.settings(&closed_port_url());

    let err = provision(BackendMode::Hosted, &settings, SubscriptionPlan::Community)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "reach endpoint"));
    assert!(cli.calls().is_empty());
}

#[tokio::test]
async fn unconfigured_lab_is_disabled_not_failed() {
    let cli = FakeCli::new();
    let mut settings = cli.settings("http://127.0.0.1:7322/api");
    settings.lab.vm1_ip = None;

    let availability = provision(BackendMode::Local, &settings, SubscriptionPlan::Community)
        .await
        .unwrap();

    assert!(availability.reason().unwrap().contains("E2E_VM1_IP"));
    assert!(cli.calls().is_empty());
}
