//! Create, list, inspect, mutate and delete steps shared by resource suites

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use twinrun_common::{unique_name, Result};

use crate::backend::{listed_count, ResourceKind};
use crate::context::{ensure, succeeded, ExecutionContext};

/// One resource driven through its lifecycle
#[derive(Debug)]
pub(crate) struct Lifecycle {
    kind: ResourceKind,
    name: String,
}

impl Lifecycle {
    pub(crate) fn new(kind: ResourceKind, prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            name: unique_name(prefix),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn create<'a>(self: Arc<Self>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        async move { succeeded(&ctx.create(self.kind, &self.name).await) }.boxed()
    }

    pub(crate) fn listed_once<'a>(
        self: Arc<Self>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let listed = ctx.list(self.kind).await;
            succeeded(&listed)?;
            let count = listed_count(&listed, &self.name);
            ensure(count == 1, || {
                format!("expected {} '{}' listed once, found {}", self.kind, self.name, count)
            })
        }
        .boxed()
    }

    pub(crate) fn inspect<'a>(self: Arc<Self>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        async move { succeeded(&ctx.inspect(self.kind, &self.name).await) }.boxed()
    }

    pub(crate) fn mutate<'a>(self: Arc<Self>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        async move { succeeded(&ctx.mutate(self.kind, &self.name).await?) }.boxed()
    }

    pub(crate) fn delete<'a>(self: Arc<Self>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        async move { succeeded(&ctx.delete(self.kind, &self.name).await) }.boxed()
    }

    pub(crate) fn absent<'a>(self: Arc<Self>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
        async move {
            let listed = ctx.list(self.kind).await;
            succeeded(&listed)?;
            ensure(!ctx.lists(&listed, &self.name), || {
                format!("{} '{}' still listed after delete", self.kind, self.name)
            })
        }
        .boxed()
    }

    /// Remove whatever a failed run left behind
    pub(crate) fn remove_leftover<'a>(
        self: Arc<Self>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.delete_if_exists(self.kind, &self.name).await;
            Ok(())
        }
        .boxed()
    }
}
