//! twinrun E2E Harness
//!
//! This crate drives a CLI under test against two interchangeable backends
//! and runs the same scenarios on both:
//! - Spawns the CLI as a subprocess and normalizes its output
//! - Verifies lab machine state out of band over SSH
//! - Provisions disposable hosted accounts or local profiles
//! - Reports every scenario step independently
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Scenario Library (Suite)                  │
//! │    repository_lifecycle / machine_lifecycle / edition ...   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ExecutionContext                                           │
//! │    ├── runner: CliRunner          (process executor)        │
//! │    ├── backend: Box<dyn Backend>                            │
//! │    │     ├── HostedBackend { team, region, bridge }         │
//! │    │     └── LocalBackend  { ssh: SshValidator, machines }  │
//! │    └── teardown: Teardown         (runs at most once)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  provision_hosted(plan) / provision_local()                 │
//! │    register -> activate -> login -> resolve -> machine      │
//! │    profile -> add-machine vm1 [vm2]                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod command;
pub mod context;
pub mod edition;
pub mod executor;
pub mod payload;
pub mod preflight;
pub mod provision;
pub mod scenario;
pub mod scenarios;
pub mod settings;
pub mod ssh;
mod verbs;

pub use backend::{Backend, Capability, HostedBackend, LocalBackend, ResourceKind};
pub use command::{build_args, build_delete_args, ArgDefaults, Flags};
pub use context::{ExecutionContext, Teardown, TeardownReport};
pub use executor::{CliRunner, ExecResult, RunOptions, RunnerConfig};
pub use payload::Payload;
pub use provision::{provision_hosted, provision_local, Availability};
pub use scenario::{RunSummary, Suite, SuiteResult};
pub use scenarios::ScenarioOptions;
pub use settings::HarnessSettings;
pub use ssh::{RemoteResult, SshValidator};
