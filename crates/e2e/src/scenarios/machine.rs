//! Machine registration lifecycle

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use twinrun_common::Result;

use super::lifecycle::Lifecycle;
use super::{add_cleanup, add_step, ScenarioOptions};
use crate::backend::ResourceKind;
use crate::context::{succeeded, ExecutionContext};
use crate::scenario::Suite;

/// Connectivity check run through the backend's function channel
const PING_FUNCTION: &str = "machine_ping";

/// Machines have no optional steps; both backends run the same cases
pub fn machine_lifecycle(_options: &ScenarioOptions) -> Suite {
    let machine = Lifecycle::new(ResourceKind::Machine, "test-machine-lifecycle");
    let mut suite = Suite::new("machine lifecycle");

    add_step(&mut suite, "create machine", &machine, Lifecycle::create);
    add_step(&mut suite, "list contains machine once", &machine, Lifecycle::listed_once);
    add_step(&mut suite, "inspect machine", &machine, Lifecycle::inspect);
    add_step(&mut suite, "delete machine", &machine, Lifecycle::delete);
    add_step(&mut suite, "list no longer contains machine", &machine, Lifecycle::absent);
    add_step(&mut suite, "default machine answers ping", &machine, ping_default);

    add_cleanup(&mut suite, &machine, Lifecycle::remove_leftover);
    suite
}

fn ping_default<'a>(_machine: Arc<Lifecycle>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move { succeeded(&ctx.run_function(PING_FUNCTION, &[]).await) }.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_steps_for_both_backends() {
        let hosted = machine_lifecycle(&ScenarioOptions {
            team_scoped: true,
            ..Default::default()
        });
        let local = machine_lifecycle(&ScenarioOptions {
            ssh_validation: true,
            ..Default::default()
        });
        assert_eq!(hosted.names(), local.names());
        assert_eq!(hosted.len(), 6);
        assert_eq!(hosted.names().last(), Some(&"default machine answers ping"));
    }
}
