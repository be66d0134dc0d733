//! Context provisioning for both backends
//!
//! Construction is all-or-nothing: a failed step undoes whatever was set up
//! so far and returns `Error::Provisioning` naming the step. A local backend
//! without lab configuration is `Availability::Disabled`, not an error.

use tracing::{info, warn};

use twinrun_common::{random_hex, unique_name, BackendMode, Error, Result, SubscriptionPlan};

use crate::backend::{HostedBackend, LocalBackend};
use crate::context::{succeeded, ExecutionContext, Teardown};
use crate::executor::{CliRunner, Credentials, ExecResult, RunnerConfig};
use crate::preflight::wait_for_api;
use crate::settings::HarnessSettings;
use crate::ssh::SshValidator;

/// Activation code the API accepts outside production
pub const CI_ACTIVATION_CODE: &str = "AAA111";

pub const DEFAULT_TEAM: &str = "Private Team";
pub const DEFAULT_REGION: &str = "Default Region";
pub const DEFAULT_BRIDGE: &str = "Global Bridges";

/// Alias of the primary lab machine in local profiles
pub const PRIMARY_MACHINE: &str = "vm1";
pub const SECONDARY_MACHINE: &str = "vm2";

/// Whether an optional backend can run
#[derive(Debug)]
pub enum Availability<T> {
    Ready(T),
    Disabled(String),
}

impl<T> Availability<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready(_))
    }

    pub fn as_ref(&self) -> Availability<&T> {
        match self {
            Availability::Ready(t) => Availability::Ready(t),
            Availability::Disabled(reason) => Availability::Disabled(reason.clone()),
        }
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Availability::Ready(t) => Some(t),
            Availability::Disabled(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Availability::Ready(_) => None,
            Availability::Disabled(reason) => Some(reason),
        }
    }
}

/// Disposable hosted identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAccount {
    pub organization: String,
    pub email: String,
    pub password: String,
    pub profile: String,
    pub plan: SubscriptionPlan,
}

impl TestAccount {
    pub fn generate(plan: SubscriptionPlan) -> Self {
        Self::generate_for(plan, "rediacc.test")
    }

    pub fn generate_for(plan: SubscriptionPlan, email_domain: &str) -> Self {
        let id = random_hex(4);
        Self {
            organization: format!("TestOrg-{}", id),
            email: format!("test-{}@{}", id, email_domain),
            password: format!("TestPass{}!", id),
            profile: format!("test-{}", id),
            plan,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.email.clone(),
            password: self.password.clone(),
            master_password: Some(self.password.clone()),
        }
    }
}

/// Run the partial teardown and report `step` as failed
async fn abort(teardown: Teardown, step: &str, message: String) -> Error {
    warn!("provisioning step '{}' failed, undoing {} step(s)", step, teardown.len());
    teardown.run().await;
    Error::provisioning(step, message)
}

fn first_name(result: &ExecResult, key: &str) -> Option<String> {
    result
        .json()
        .and_then(|v| v.as_array())
        .and_then(|items| items.iter().find_map(|item| item.get(key)?.as_str()))
        .map(str::to_string)
}

/// Resolve a default from a list command, falling back when the list is empty
async fn resolve(
    teardown: Teardown,
    step: &str,
    result: ExecResult,
    key: &str,
    fallback: &str,
) -> Result<(String, Teardown)> {
    if let Err(e) = result.expect_array() {
        return Err(abort(teardown, step, e.to_string()).await);
    }
    let name = first_name(&result, key).unwrap_or_else(|| fallback.to_string());
    info!("{}: {}", step, name);
    Ok((name, teardown))
}

/// Provision the context for `mode`. Only a local lab without
/// configuration is `Disabled`; an unreachable API is a provisioning error.
pub async fn provision(
    mode: BackendMode,
    settings: &HarnessSettings,
    plan: SubscriptionPlan,
) -> Result<Availability<ExecutionContext>> {
    match mode {
        BackendMode::Hosted => provision_hosted(settings, plan).await.map(Availability::Ready),
        BackendMode::Local => provision_local(settings).await,
    }
}

/// Build a hosted context backed by a fresh account on `plan`
pub async fn provision_hosted(
    settings: &HarnessSettings,
    plan: SubscriptionPlan,
) -> Result<ExecutionContext> {
    let account = TestAccount::generate_for(plan, &settings.email_domain);
    info!("provisioning hosted account {} ({})", account.email, plan);

    wait_for_api(&settings.api_url, settings.preflight_timeout())
        .await
        .map_err(|e| Error::provisioning("reach endpoint", e.to_string()))?;

    let base = CliRunner::new(RunnerConfig::from_settings(settings));

    let created = base.profile_init(&account.profile).await;
    if !created.success() {
        return Err(Error::provisioning("create profile", created.error_message()));
    }
    let mut teardown = Teardown::new();
    teardown_profile(&mut teardown, &base, &account.profile);

    let runner = CliRunner::new(
        RunnerConfig::from_settings(settings)
            .with_profile(&account.profile)
            .with_credentials(account.credentials()),
    );

    let registered = runner
        .register(&account.organization, &account.email, &account.password, Some(plan))
        .await;
    if !registered.success() {
        return Err(abort(teardown, "register", registered.error_message()).await);
    }

    let activated = runner
        .activate(&account.email, &account.password, CI_ACTIVATION_CODE)
        .await;
    if !activated.success() {
        return Err(abort(teardown, "activate", activated.error_message()).await);
    }

    let logged_in = runner.login().await;
    if !logged_in.success() {
        return Err(abort(teardown, "login", logged_in.error_message()).await);
    }

    let mut session = Teardown::new();
    {
        let runner = runner.clone();
        session.step("logout", move || async move { succeeded(&runner.logout().await) });
    }
    session.append(&mut teardown);
    let teardown = session;

    let teams = runner.team_list().await;
    let (team, teardown) = resolve(teardown, "resolve team", teams, "teamName", DEFAULT_TEAM).await?;

    let regions = runner.region_list().await;
    let (region, teardown) =
        resolve(teardown, "resolve region", regions, "regionName", DEFAULT_REGION).await?;

    let bridges = runner.bridge_list(&region).await;
    let (bridge, mut teardown) =
        resolve(teardown, "resolve bridge", bridges, "bridgeName", DEFAULT_BRIDGE).await?;

    let machine = unique_name("e2e-machine");
    let created = runner.machine_create(&machine, &team, &bridge).await;
    if !created.success() {
        return Err(abort(teardown, "create machine", created.error_message()).await);
    }

    // Machine goes first: it must be deleted while still logged in.
    let mut ordered = Teardown::new();
    {
        let runner = runner.clone();
        let (machine, team) = (machine.clone(), team.clone());
        ordered.step("delete machine", move || async move {
            succeeded(&runner.machine_delete(&machine, &team).await)
        });
    }
    ordered.append(&mut teardown);

    info!("hosted context ready: team={} machine={}", team, machine);
    Ok(ExecutionContext::new(
        runner,
        machine,
        settings.test_timeout(),
        Box::new(HostedBackend::new(team, region, bridge)),
        ordered,
    ))
}

fn teardown_profile(teardown: &mut Teardown, base: &CliRunner, profile: &str) {
    let base = base.clone();
    let profile = profile.to_string();
    teardown.step("delete profile", move || async move {
        succeeded(&base.profile_delete(&profile).await)
    });
}

/// Build a local context against the configured lab machines
pub async fn provision_local(settings: &HarnessSettings) -> Result<Availability<ExecutionContext>> {
    if let Some(reason) = settings.lab.missing_reason() {
        info!("{}", reason);
        return Ok(Availability::Disabled(reason));
    }
    let (Some(vm1), Some(user)) = (settings.lab.vm1_ip.clone(), settings.lab.ssh_user.clone())
    else {
        return Ok(Availability::Disabled("local backend not configured".to_string()));
    };

    let key = settings.lab.ssh_key_path();
    let profile = unique_name("e2e-local");
    info!("provisioning local profile {} for {}@{}", profile, user, vm1);

    let base = CliRunner::new(RunnerConfig::from_settings(settings));
    let created = base
        .profile_init_local(&profile, &key, settings.lab.agent_path.as_deref())
        .await;
    if !created.success() {
        return Err(Error::provisioning("create local profile", created.error_message()));
    }

    let mut teardown = Teardown::new();
    teardown_profile(&mut teardown, &base, &profile);

    let runner = base.for_profile(&profile);
    let datastore = settings.lab.datastore.as_str();
    let mut machines = Vec::new();

    let mut hosts = vec![(PRIMARY_MACHINE, vm1.clone())];
    if let Some(vm2) = &settings.lab.vm2_ip {
        hosts.push((SECONDARY_MACHINE, vm2.clone()));
    }
    for (alias, ip) in hosts {
        let added = runner.add_machine(alias, &ip, &user, None, Some(datastore)).await;
        if !added.success() {
            let step = format!("add machine {}", alias);
            return Err(abort(teardown, &step, added.error_message()).await);
        }
        machines.push(alias.to_string());
    }

    let ssh = SshValidator::new(vm1, user, &key);
    let backend = LocalBackend::new(ssh, machines, datastore);

    Ok(Availability::Ready(ExecutionContext::new(
        runner,
        PRIMARY_MACHINE,
        settings.test_timeout(),
        Box::new(backend),
        teardown,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_share_one_random_id() {
        let account = TestAccount::generate(SubscriptionPlan::Business);
        let id = account.profile.strip_prefix("test-").unwrap();
        assert_eq!(id.len(), 8);
        assert_eq!(account.organization, format!("TestOrg-{}", id));
        assert_eq!(account.email, format!("test-{}@rediacc.test", id));
        assert_eq!(account.password, format!("TestPass{}!", id));
        assert_eq!(account.plan, SubscriptionPlan::Business);
    }

    #[test]
    fn account_secret_doubles_as_vault_secret() {
        let account = TestAccount::generate(SubscriptionPlan::Community);
        let creds = account.credentials();
        assert_eq!(creds.master_password.as_deref(), Some(account.password.as_str()));
    }

    #[test]
    fn availability_accessors() {
        let ready: Availability<u8> = Availability::Ready(1);
        assert!(ready.is_ready());
        assert_eq!(ready.as_ref().ready(), Some(&1));

        let off: Availability<u8> = Availability::Disabled("no vm".into());
        assert_eq!(off.reason(), Some("no vm"));
        assert!(off.ready().is_none());
    }
}
