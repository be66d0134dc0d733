//! Repository create, list, inspect, resize and delete

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use twinrun_common::{Error, Result};

use super::lifecycle::Lifecycle;
use super::{add_cleanup, add_step, require_ssh, ScenarioOptions};
use crate::backend::ResourceKind;
use crate::context::{ensure, ExecutionContext};
use crate::payload::{preview, Payload};
use crate::scenario::Suite;

const TEAM_REQUIRED: &str = "Team name required";

pub fn repository_lifecycle(options: &ScenarioOptions) -> Suite {
    let repo = Lifecycle::new(ResourceKind::Repository, "test-repo-lifecycle");
    let mut suite = Suite::new("repository lifecycle");

    add_step(&mut suite, "create repository", &repo, Lifecycle::create);
    add_step(&mut suite, "list contains repository once", &repo, Lifecycle::listed_once);
    add_step(&mut suite, "inspect repository", &repo, Lifecycle::inspect);
    if options.resize {
        add_step(&mut suite, "resize repository", &repo, Lifecycle::mutate);
    }
    if options.ssh_validation {
        add_step(&mut suite, "repository directory on machine", &repo, directory_present);
    }
    add_step(&mut suite, "delete repository", &repo, Lifecycle::delete);
    add_step(&mut suite, "list no longer contains repository", &repo, Lifecycle::absent);
    if options.ssh_validation {
        add_step(&mut suite, "repository not mounted after delete", &repo, mount_released);
    }
    if options.team_scoped {
        add_step(&mut suite, "list without team is rejected", &repo, list_requires_team);
    }

    add_cleanup(&mut suite, &repo, Lifecycle::remove_leftover);
    suite
}

fn mount_path(repo: &Lifecycle, ctx: &ExecutionContext) -> Result<String> {
    ctx.backend()
        .repository_mount(repo.name())
        .ok_or_else(|| Error::Skipped("backend exposes no repository mounts".to_string()))
}

fn directory_present<'a>(repo: Arc<Lifecycle>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let path = mount_path(&repo, ctx)?;
        let present = ssh.dir_exists(&path).await;
        ensure(present, || format!("{} missing on {}", path, ssh.host()))
    }
    .boxed()
}

fn mount_released<'a>(repo: Arc<Lifecycle>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let path = mount_path(&repo, ctx)?;
        let mounted = ssh.mount_exists(&path).await;
        ensure(!mounted, || format!("{} still mounted on {}", path, ssh.host()))
    }
    .boxed()
}

fn list_requires_team<'a>(_repo: Arc<Lifecycle>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let result = ctx.runner().repository_list(None).await;
        ensure(!result.success(), || {
            "repository list without a team unexpectedly succeeded".to_string()
        })?;
        let payload = result.payload();
        ensure(matches!(payload, Payload::Error(_)), || {
            format!(
                "expected a structured error, got {} payload: {}",
                payload.kind(),
                preview(&result.combined_output(), 200)
            )
        })?;
        let message = result.error_message();
        ensure(message.contains(TEAM_REQUIRED), || {
            format!("expected \"{}\" in error, got: {}", TEAM_REQUIRED, message)
        })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_options_add_team_check_only() {
        let options = ScenarioOptions {
            queued_tasks: true,
            team_scoped: true,
            ..Default::default()
        };
        let suite = repository_lifecycle(&options);
        assert_eq!(
            suite.names(),
            vec![
                "create repository",
                "list contains repository once",
                "inspect repository",
                "delete repository",
                "list no longer contains repository",
                "list without team is rejected",
            ]
        );
    }

    #[test]
    fn local_options_add_resize_and_ssh_checks() {
        let options = ScenarioOptions {
            ssh_validation: true,
            resize: true,
            machine_address: Some("10.0.0.11".into()),
            ..Default::default()
        };
        let names = repository_lifecycle(&options)
            .names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        assert_eq!(names.len(), 8);
        assert_eq!(names[3], "resize repository");
        assert_eq!(names[4], "repository directory on machine");
        assert!(!names.iter().any(|n| n.contains("without team")));
    }
}
