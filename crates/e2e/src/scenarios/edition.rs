//! Plan restrictions on the hosted backend

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use twinrun_common::{unique_name, Error, Result, SubscriptionPlan};

use super::{add_cleanup, add_step, ScenarioOptions};
use crate::context::{ensure, ExecutionContext};
use crate::edition::{
    expect_edition_error, expect_edition_success, is_feature_available, patterns, Feature, Limit,
    ResourceLimits,
};
use crate::executor::{ExecResult, RunOptions};
use crate::scenario::Suite;

const HOSTED_ONLY: &str = "edition restrictions are enforced by the hosted backend";

#[derive(Debug)]
struct EditionRun {
    plan: SubscriptionPlan,
    group: String,
    cluster: String,
    bridges: Mutex<Vec<String>>,
}

pub fn edition_restrictions(plan: SubscriptionPlan, options: &ScenarioOptions) -> Suite {
    let run = Arc::new(EditionRun {
        plan,
        group: unique_name("test-group"),
        cluster: unique_name("test-cluster"),
        bridges: Mutex::new(Vec::new()),
    });
    let mut suite = Suite::new(format!("edition restrictions ({})", plan));

    let groups = is_feature_available(Feature::PermissionGroups, plan);
    let ceph = is_feature_available(Feature::Ceph, plan);
    let bridge_limit = ResourceLimits::for_plan(plan).bridge_limit();

    if !options.team_scoped {
        let mut names = if groups {
            vec!["create permission group", "list shows permission group"]
        } else {
            vec!["permission group create is blocked"]
        };
        names.push(if ceph { "list ceph clusters" } else { "ceph cluster create is blocked" });
        names.push("bridge limit enforced");
        for name in names {
            suite.skip(name, HOSTED_ONLY);
        }
        return suite;
    }

    if groups {
        add_step(&mut suite, "create permission group", &run, create_group);
        add_step(&mut suite, "list shows permission group", &run, group_listed);
    } else {
        add_step(&mut suite, "permission group create is blocked", &run, group_blocked);
    }

    if ceph {
        add_step(&mut suite, "list ceph clusters", &run, clusters_listed);
    } else {
        add_step(&mut suite, "ceph cluster create is blocked", &run, cluster_blocked);
    }

    match bridge_limit {
        Limit::Bounded(_) => add_step(&mut suite, "bridge limit enforced", &run, bridge_limit_enforced),
        Limit::Unlimited => {
            suite.skip("bridge limit enforced", format!("{} has no bridge limit", plan));
        }
        Limit::Ambiguous => {
            suite.skip(
                "bridge limit enforced",
                format!(
                    "{} bridge limit is 0, which the API may read as unlimited rather than none",
                    plan
                ),
            );
        }
    }

    add_cleanup(&mut suite, &run, remove_created);
    suite
}

fn create_group<'a>(run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let args = ["permission", "group", "create", run.group.as_str()];
        expect_edition_success(&ctx.runner().run(&args, RunOptions::default()).await)
    }
    .boxed()
}

fn group_listed<'a>(run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let result = ctx
            .runner()
            .run(&["permission", "group", "list"], RunOptions::default())
            .await;
        expect_edition_success(&result)?;
        let found = result
            .expect_array()?
            .iter()
            .any(|g| g.get("permissionGroupName").and_then(|v| v.as_str()) == Some(run.group.as_str()));
        ensure(found, || format!("expected to find group \"{}\" in list", run.group))
    }
    .boxed()
}

fn group_blocked<'a>(run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let args = ["permission", "group", "create", run.group.as_str()];
        let result = ctx.runner().run(&args, RunOptions::default()).await;
        expect_edition_error(&result, 402, patterns::PERMISSION_GROUP_COMMUNITY)
    }
    .boxed()
}

fn clusters_listed<'a>(_run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let result = ctx
            .runner()
            .run(&["ceph", "cluster", "list"], RunOptions::default())
            .await;
        expect_edition_success(&result)
    }
    .boxed()
}

fn cluster_blocked<'a>(run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let args = ["ceph", "cluster", "create", run.cluster.as_str()];
        let result = ctx.runner().run(&args, RunOptions::default()).await;
        expect_edition_error(&result, 402, patterns::CEPH_NOT_AVAILABLE)
    }
    .boxed()
}

/// Create bridges up to the plan limit, then expect one more to be refused
fn bridge_limit_enforced<'a>(
    run: Arc<EditionRun>,
    ctx: &'a ExecutionContext,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let Limit::Bounded(limit) = ResourceLimits::for_plan(run.plan).bridge_limit() else {
            return Err(Error::Skipped(format!("{} has no bounded bridge limit", run.plan)));
        };
        let region = ctx
            .backend()
            .region()
            .ok_or_else(|| Error::Skipped(HOSTED_ONLY.to_string()))?;

        for i in 0..limit {
            let name = unique_name("test-bridge");
            let result = create_bridge(ctx, &name, region).await;
            expect_edition_success(&result).map_err(|e| {
                Error::assertion(format!("bridge {}/{} creation failed: {}", i + 1, limit, e))
            })?;
            run.bridges.lock().push(name);
        }

        let excess = unique_name("test-bridge-excess");
        let result = create_bridge(ctx, &excess, region).await;
        if result.success() {
            run.bridges.lock().push(excess);
        }
        expect_edition_error(&result, 402, patterns::BRIDGE_LIMIT_EXCEEDED)
    }
    .boxed()
}

async fn create_bridge(ctx: &ExecutionContext, name: &str, region: &str) -> ExecResult {
    let args = ["bridge", "create", name, "--region", region];
    ctx.runner().run(&args, RunOptions::default()).await
}

fn remove_created<'a>(run: Arc<EditionRun>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        if is_feature_available(Feature::PermissionGroups, run.plan) {
            let args = ["permission", "group", "delete", run.group.as_str(), "--force"];
            ctx.runner().run(&args, RunOptions::default()).await;
        }

        let bridges = std::mem::take(&mut *run.bridges.lock());
        if let Some(region) = ctx.backend().region() {
            for bridge in bridges {
                debug!("removing bridge {}", bridge);
                let args = ["bridge", "delete", bridge.as_str(), "--region", region];
                ctx.runner().run(&args, RunOptions::default()).await;
            }
        }
        Ok(())
    }
    .boxed()
}
