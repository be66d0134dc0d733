//! Core types for twinrun

use serde::{Deserialize, Serialize};

/// Which backend a context drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Multi-tenant API reached over HTTP
    Hosted,
    /// Lab machines driven over SSH by the execution agent
    Local,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::Hosted => write!(f, "hosted"),
            BackendMode::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hosted" | "cloud" => Ok(BackendMode::Hosted),
            "local" => Ok(BackendMode::Local),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown backend mode '{}'",
                other
            ))),
        }
    }
}

/// Output format requested from the CLI under test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
    Yaml,
    Csv,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Table => "table",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Csv => "csv",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription tier of a hosted test account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPlan {
    #[default]
    Community,
    Professional,
    Business,
    Enterprise,
}

impl SubscriptionPlan {
    pub const ALL: [SubscriptionPlan; 4] = [
        SubscriptionPlan::Community,
        SubscriptionPlan::Professional,
        SubscriptionPlan::Business,
        SubscriptionPlan::Enterprise,
    ];

    /// Plan label as the hosted API spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Community => "COMMUNITY",
            SubscriptionPlan::Professional => "PROFESSIONAL",
            SubscriptionPlan::Business => "BUSINESS",
            SubscriptionPlan::Enterprise => "ENTERPRISE",
        }
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionPlan {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionPlan::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidConfig(format!("unknown plan '{}'", s)))
    }
}
