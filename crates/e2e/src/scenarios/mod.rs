//! Backend-agnostic scenario library
//!
//! Each builder returns a [`Suite`] whose cases are registered according to
//! [`ScenarioOptions`]. Optional steps are only registered when the backend
//! can run them. Resource names are drawn once per builder call.

mod edition;
mod lifecycle;
mod machine;
mod remote_file;
mod repository;

pub use edition::edition_restrictions;
pub use machine::machine_lifecycle;
pub use remote_file::remote_file_roundtrip;
pub use repository::repository_lifecycle;

use std::sync::Arc;

use futures::future::BoxFuture;

use twinrun_common::{Error, Result, SubscriptionPlan};

use crate::backend::Capability;
use crate::context::ExecutionContext;
use crate::provision::Availability;
use crate::scenario::Suite;
use crate::ssh::SshValidator;

/// What a context can do, read once before building suites
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioOptions {
    pub ssh_validation: bool,
    pub resize: bool,
    pub queued_tasks: bool,
    /// Resources live under a team
    pub team_scoped: bool,
    /// Address of the primary machine, when reachable over SSH
    pub machine_address: Option<String>,
    /// The storage-pool host set is provisioned
    pub storage_pool: bool,
}

impl ScenarioOptions {
    pub fn for_context(ctx: &ExecutionContext) -> Self {
        Self {
            ssh_validation: ctx.supports(Capability::SshValidation),
            resize: ctx.supports(Capability::Resize),
            queued_tasks: ctx.supports(Capability::QueuedTasks),
            team_scoped: ctx.team_name().is_some(),
            machine_address: ctx.ssh().map(|ssh| ssh.host().to_string()),
            storage_pool: false,
        }
    }

    /// Enable cases that need the storage-pool host set
    pub fn with_storage_pool(mut self, enabled: bool) -> Self {
        self.storage_pool = enabled;
        self
    }

    /// Options for a context that may not exist
    pub fn for_availability(ctx: &Availability<&ExecutionContext>) -> Self {
        match ctx {
            Availability::Ready(ctx) => Self::for_context(ctx),
            Availability::Disabled(_) => Self::default(),
        }
    }
}

/// Every library suite for one context
pub fn all_suites(options: &ScenarioOptions, plan: SubscriptionPlan) -> Vec<Suite> {
    vec![
        repository_lifecycle(options),
        machine_lifecycle(options),
        edition_restrictions(plan, options),
        remote_file_roundtrip(options),
    ]
}

/// The context's SSH validator, or a skip when it has none
pub(crate) fn require_ssh(ctx: &ExecutionContext) -> Result<&SshValidator> {
    ctx.ssh()
        .ok_or_else(|| Error::Skipped("no SSH validator bound to this context".to_string()))
}

/// One step of a scenario over shared per-suite state
pub(crate) type Step<S> = for<'a> fn(Arc<S>, &'a ExecutionContext) -> BoxFuture<'a, Result<()>>;

pub(crate) fn add_step<S>(suite: &mut Suite, name: &str, state: &Arc<S>, step: Step<S>)
where
    S: Send + Sync + 'static,
{
    let state = Arc::clone(state);
    suite.case(name, move |ctx| step(Arc::clone(&state), ctx));
}

pub(crate) fn add_cleanup<S>(suite: &mut Suite, state: &Arc<S>, step: Step<S>)
where
    S: Send + Sync + 'static,
{
    let state = Arc::clone(state);
    suite.after_all(move |ctx| step(Arc::clone(&state), ctx));
}
