//! Domain verbs of the CLI under test

use std::path::Path;

use twinrun_common::SubscriptionPlan;

use crate::command::{build_args, build_delete_args, Flags, NoDefaults};
use crate::executor::{CliRunner, ExecResult, RunOptions};

impl CliRunner {
    // Auth

    /// Log in with the runner's credentials
    pub async fn login(&self) -> ExecResult {
        let (email, password) = match &self.config().credentials {
            Some(c) => (c.email.as_str(), c.password.as_str()),
            None => ("", ""),
        };
        let api_url = self.config().api_url.as_str();
        self.run(
            &["auth", "login", "--endpoint", api_url, "-e", email, "-p", password],
            RunOptions::default(),
        )
        .await
    }

    pub async fn logout(&self) -> ExecResult {
        self.run(&["auth", "logout"], RunOptions::default()).await
    }

    pub async fn register(
        &self,
        organization: &str,
        email: &str,
        password: &str,
        plan: Option<SubscriptionPlan>,
    ) -> ExecResult {
        let mut args = vec![
            "auth",
            "register",
            "--organization",
            organization,
            "-e",
            email,
            "-p",
            password,
            "--endpoint",
            self.config().api_url.as_str(),
        ];
        if let Some(plan) = &plan {
            args.push("--plan");
            args.push(plan.as_str());
        }
        self.run(&args, RunOptions::default()).await
    }

    pub async fn activate(&self, email: &str, password: &str, code: &str) -> ExecResult {
        let api_url = self.config().api_url.as_str();
        self.run(
            &[
                "auth", "activate", "-e", email, "-p", password, "--code", code, "--endpoint",
                api_url,
            ],
            RunOptions::default(),
        )
        .await
    }

    pub async fn auth_status(&self) -> ExecResult {
        self.run(&["auth", "status"], RunOptions::default().raw())
            .await
    }

    // Profiles

    /// Create a hosted profile. Runs without a profile flag.
    pub async fn profile_init(&self, name: &str) -> ExecResult {
        let api_url = self.config().api_url.as_str();
        self.run(
            &["config", "init", name, "--api-url", api_url],
            RunOptions::default().without_profile(),
        )
        .await
    }

    /// Create a local profile bound to an SSH key and optional agent binary
    pub async fn profile_init_local(
        &self,
        name: &str,
        ssh_key: &Path,
        agent_path: Option<&str>,
    ) -> ExecResult {
        let flags = Flags::new()
            .set("ssh-key", ssh_key.display().to_string())
            .opt("renet-path", agent_path);
        let args = build_args(&["config", "init", name], &NoDefaults, &flags);
        self.run(&args, RunOptions::default().without_profile())
            .await
    }

    /// Delete a profile; deleting a missing profile is not an error for callers
    pub async fn profile_delete(&self, name: &str) -> ExecResult {
        let args = build_delete_args(&["config", "delete", name], &NoDefaults, &Flags::new());
        self.run(&args, RunOptions::default().without_profile().raw())
            .await
    }

    pub async fn profile_show(&self) -> ExecResult {
        self.run(&["config", "show"], RunOptions::default()).await
    }

    // Local machines

    pub async fn add_machine(
        &self,
        name: &str,
        ip: &str,
        user: &str,
        port: Option<u16>,
        datastore: Option<&str>,
    ) -> ExecResult {
        let flags = Flags::new()
            .set("ip", ip)
            .set("user", user)
            .opt("port", port)
            .opt("datastore", datastore);
        let args = build_args(&["config", "add-machine", name], &NoDefaults, &flags);
        self.run(&args, RunOptions::default()).await
    }

    /// Remove a local machine entry. `config remove-machine` rejects `--force`.
    pub async fn remove_machine(&self, name: &str) -> ExecResult {
        let args = build_delete_args(&["config", "remove-machine", name], &NoDefaults, &Flags::new());
        self.run(&args, RunOptions::default()).await
    }

    pub async fn list_machines(&self) -> ExecResult {
        self.run(&["config", "machines"], RunOptions::default())
            .await
    }

    // Hosted resources

    pub async fn team_list(&self) -> ExecResult {
        self.run(&["team", "list"], RunOptions::default()).await
    }

    pub async fn region_list(&self) -> ExecResult {
        self.run(&["region", "list"], RunOptions::default()).await
    }

    pub async fn bridge_list(&self, region: &str) -> ExecResult {
        self.run(&["bridge", "list", "--region", region], RunOptions::default())
            .await
    }

    pub async fn machine_create(&self, name: &str, team: &str, bridge: &str) -> ExecResult {
        let flags = Flags::new().set("team", team).set("bridge", bridge);
        let args = build_args(&["machine", "create", name], &NoDefaults, &flags);
        self.run(&args, RunOptions::default()).await
    }

    pub async fn machine_delete(&self, name: &str, team: &str) -> ExecResult {
        let flags = Flags::new().set("team", team).switch("force", true);
        let args = build_delete_args(&["machine", "delete", name], &NoDefaults, &flags);
        self.run(&args, RunOptions::default()).await
    }

    /// List repositories; `team` may be omitted to exercise the server's validation
    pub async fn repository_list(&self, team: Option<&str>) -> ExecResult {
        let flags = Flags::new().opt("team", team);
        let args = build_args(&["repository", "list"], &NoDefaults, &flags);
        self.run(&args, RunOptions::default()).await
    }

    pub async fn queue_trace(&self, task_id: &str) -> ExecResult {
        self.run(&["queue", "trace", task_id], RunOptions::default())
            .await
    }

    pub async fn version(&self) -> ExecResult {
        self.run(&["--version"], RunOptions::default().raw()).await
    }
}
