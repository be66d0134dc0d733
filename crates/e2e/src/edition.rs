//! Subscription-edition rules the hosted backend enforces
//!
//! The feature matrix and resource limits mirror what the API reports per
//! plan. Restricted operations fail with HTTP 402 or 429, which the CLI
//! surfaces as dedicated exit codes.

use serde_json::Value;

use twinrun_common::{Error, Result, SubscriptionPlan};

use crate::executor::ExecResult;
use crate::payload::{preview, Payload};

/// Exit code for HTTP 402 (plan or payment required)
pub const EXIT_PAYMENT_REQUIRED: i32 = 8;
/// Exit code for HTTP 429 (rate limited)
pub const EXIT_RATE_LIMITED: i32 = 9;

const DEBUG_PREVIEW: usize = 500;

/// Error message fragments the API returns for edition restrictions
pub mod patterns {
    pub const CEPH_NOT_AVAILABLE: &str = "only available for ENTERPRISE and BUSINESS";
    pub const CEPH_POOL_LIMIT_BUSINESS: &str = "Business plan customers are limited to 1 Ceph pool";
    pub const PERMISSION_GROUP_COMMUNITY: &str = "not available in the Community edition";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "Resource limit exceeded";
    pub const BRIDGE_LIMIT_EXCEEDED: &str = "Resource limit exceeded for customer bridges";
    pub const TOO_MANY_PENDING_ITEMS: &str = "too many pending queue items";
    pub const UPGRADE_REQUIRED: &str = "Please upgrade";
}

/// Plan-gated features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    PermissionGroups,
    Ceph,
    QueuePriority,
    AdvancedAnalytics,
    PrioritySupport,
    AuditLog,
    AdvancedQueue,
    CustomBranding,
    DedicatedAccount,
}

impl Feature {
    pub const ALL: [Feature; 9] = [
        Feature::PermissionGroups,
        Feature::Ceph,
        Feature::QueuePriority,
        Feature::AdvancedAnalytics,
        Feature::PrioritySupport,
        Feature::AuditLog,
        Feature::AdvancedQueue,
        Feature::CustomBranding,
        Feature::DedicatedAccount,
    ];

    /// Plans that include this feature
    pub fn plans(&self) -> &'static [SubscriptionPlan] {
        use SubscriptionPlan::*;
        match self {
            Feature::PermissionGroups
            | Feature::PrioritySupport
            | Feature::AuditLog
            | Feature::CustomBranding => &[Professional, Business, Enterprise],
            Feature::Ceph
            | Feature::QueuePriority
            | Feature::AdvancedAnalytics
            | Feature::AdvancedQueue => &[Business, Enterprise],
            Feature::DedicatedAccount => &[Enterprise],
        }
    }
}

pub fn is_feature_available(feature: Feature, plan: SubscriptionPlan) -> bool {
    feature.plans().contains(&plan)
}

pub fn plans_with(feature: Feature) -> Vec<SubscriptionPlan> {
    feature.plans().to_vec()
}

pub fn plans_without(feature: Feature) -> Vec<SubscriptionPlan> {
    SubscriptionPlan::ALL
        .into_iter()
        .filter(|plan| !is_feature_available(feature, *plan))
        .collect()
}

/// Interpretation of a plan limit value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Bounded(u32),
    Unlimited,
    /// Zero: documented as "none allowed" but the API has been seen to
    /// treat it as unlimited
    Ambiguous,
}

impl Limit {
    fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Limit::Ambiguous,
            n if n < 0 => Limit::Unlimited,
            n => Limit::Bounded(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }
}

/// Per-plan resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub bridges: u32,
    pub max_active_jobs: u32,
    pub max_reserved_jobs: u32,
    pub job_timeout_hours: u32,
    pub max_repository_size_gb: u32,
    pub max_pending_per_user: u32,
    pub max_tasks_per_machine: u32,
    pub max_jobs_per_month: u32,
    /// `None` when the plan has no pools at all, `-1` for unlimited
    pub ceph_pools_per_team: Option<i32>,
}

impl ResourceLimits {
    pub fn for_plan(plan: SubscriptionPlan) -> Self {
        match plan {
            SubscriptionPlan::Community => Self {
                bridges: 0,
                max_active_jobs: 1,
                max_reserved_jobs: 1,
                job_timeout_hours: 2,
                max_repository_size_gb: 10,
                max_pending_per_user: 5,
                max_tasks_per_machine: 1,
                max_jobs_per_month: 500,
                ceph_pools_per_team: None,
            },
            SubscriptionPlan::Professional => Self {
                bridges: 1,
                max_active_jobs: 5,
                max_reserved_jobs: 2,
                job_timeout_hours: 24,
                max_repository_size_gb: 100,
                max_pending_per_user: 10,
                max_tasks_per_machine: 2,
                max_jobs_per_month: 5000,
                ceph_pools_per_team: None,
            },
            SubscriptionPlan::Business => Self {
                bridges: 2,
                max_active_jobs: 20,
                max_reserved_jobs: 3,
                job_timeout_hours: 72,
                max_repository_size_gb: 500,
                max_pending_per_user: 20,
                max_tasks_per_machine: 3,
                max_jobs_per_month: 20000,
                ceph_pools_per_team: Some(1),
            },
            SubscriptionPlan::Enterprise => Self {
                bridges: 10,
                max_active_jobs: 60,
                max_reserved_jobs: 5,
                job_timeout_hours: 96,
                max_repository_size_gb: 1024,
                max_pending_per_user: 50,
                max_tasks_per_machine: 5,
                max_jobs_per_month: 100000,
                ceph_pools_per_team: Some(-1),
            },
        }
    }

    pub fn bridge_limit(&self) -> Limit {
        Limit::from_raw(i64::from(self.bridges))
    }

    pub fn ceph_pool_limit(&self) -> Option<Limit> {
        self.ceph_pools_per_team.map(|n| Limit::from_raw(i64::from(n)))
    }
}

/// Meaning of a CLI exit code under the hosted status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    PaymentRequired,
    RateLimited,
    Failure,
}

impl ExitKind {
    pub fn classify(code: i32) -> Self {
        match code {
            0 => ExitKind::Success,
            EXIT_PAYMENT_REQUIRED => ExitKind::PaymentRequired,
            EXIT_RATE_LIMITED => ExitKind::RateLimited,
            _ => ExitKind::Failure,
        }
    }
}

/// Exit code the CLI maps an HTTP status to
pub fn exit_code_for_status(status: u16) -> Option<i32> {
    match status {
        402 => Some(EXIT_PAYMENT_REQUIRED),
        429 => Some(EXIT_RATE_LIMITED),
        _ => None,
    }
}

fn restriction_message(result: &ExecResult) -> String {
    if let Payload::Error(body) = result.payload() {
        if let Some(message) = body.message {
            return message;
        }
    }
    if result.stderr().trim().is_empty() {
        result.stdout().to_string()
    } else {
        result.stderr().to_string()
    }
}

/// Check that `result` is an edition restriction with HTTP `status` and a
/// message containing `pattern` (case-insensitive)
pub fn expect_edition_error(result: &ExecResult, status: u16, pattern: &str) -> Result<()> {
    let expected = exit_code_for_status(status).ok_or_else(|| {
        Error::InvalidConfig(format!("HTTP {} has no exit code mapping", status))
    })?;

    if result.success() {
        return Err(Error::assertion(format!(
            "expected failure with HTTP {} (exit {}) but got success. stdout: {}",
            status,
            expected,
            preview(result.stdout(), DEBUG_PREVIEW)
        )));
    }
    if result.exit_code() != expected {
        return Err(Error::assertion(format!(
            "expected exit code {} (HTTP {}) but got {}: {}",
            expected,
            status,
            result.exit_code(),
            result.error_message()
        )));
    }

    let message = restriction_message(result);
    if !message.to_lowercase().contains(&pattern.to_lowercase()) {
        return Err(Error::assertion(format!(
            "expected error to contain \"{}\" but got: {}",
            pattern, message
        )));
    }
    Ok(())
}

/// Check that `result` succeeded, with enough output to diagnose if not
pub fn expect_edition_success(result: &ExecResult) -> Result<()> {
    if result.success() {
        return Ok(());
    }
    let json = result.json().map(Value::to_string).unwrap_or_else(|| "null".into());
    let message = restriction_message(result);
    Err(Error::assertion(format!(
        "expected success but got failure. Error: {}\nexitCode: {}\nstdout: {}\nstderr: {}\njson: {}",
        preview(&message, DEBUG_PREVIEW),
        result.exit_code(),
        preview(result.stdout(), DEBUG_PREVIEW),
        preview(result.stderr(), DEBUG_PREVIEW),
        preview(&json, DEBUG_PREVIEW)
    )))
}
