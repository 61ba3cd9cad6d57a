//! Limit policy table.
//!
//! Every category maps to one immutable [`LimitPolicy`]. The table is built
//! once at startup from a deployment profile and may be overridden from YAML,
//! using either a bare map or a `policies:` section:
//!
//! ```yaml
//! policies:
//!   authentication:
//!     max_requests: 5
//!     window_secs: 900
//!     block_secs: 1800
//!   upload:
//!     max_requests: 20
//!     window_secs: 3600
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::category::Category;
use crate::error::{Result, TollgateError};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Upper bound on a policy window or block.
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(366 * DAY);

/// Deployment environment, which selects the policy for [`Category::Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Development,
    Testing,
    Production,
}

/// Quota for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub category: Category,
    /// Requests allowed within `window`, inclusive
    pub max_requests: u32,
    /// Trailing span over which requests are counted
    pub window: Duration,
    /// Lockout applied once the quota is exhausted; zero means no lockout
    pub block_duration: Duration,
}

impl LimitPolicy {
    pub fn new(category: Category, max_requests: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            category,
            max_requests,
            window,
            block_duration,
        }
    }

    /// Whether exhausting the quota locks the key out.
    pub fn blocks(&self) -> bool {
        !self.block_duration.is_zero()
    }

    /// Longest span this policy keeps state alive for.
    pub fn horizon(&self) -> Duration {
        self.window.max(self.block_duration)
    }
}

/// A policy as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub max_requests: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub block_secs: u64,
}

impl PolicyRule {
    fn into_policy(self, category: Category) -> LimitPolicy {
        LimitPolicy::new(
            category,
            self.max_requests,
            Duration::from_secs(self.window_secs),
            Duration::from_secs(self.block_secs),
        )
    }
}

impl From<&LimitPolicy> for PolicyRule {
    fn from(policy: &LimitPolicy) -> Self {
        Self {
            max_requests: policy.max_requests,
            window_secs: policy.window.as_secs(),
            block_secs: policy.block_duration.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicySection {
    policies: BTreeMap<Category, PolicyRule>,
}

/// The immutable category-to-policy mapping.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashMap<Category, LimitPolicy>,
}

impl PolicyTable {
    /// A table with no policies registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in policies for a deployment profile.
    pub fn builtin(profile: Profile) -> Self {
        let default_per_hour = match profile {
            Profile::Development => 100,
            Profile::Testing => 1000,
            Profile::Production => 60,
        };

        let rules = [
            (Category::Authentication, 5, 15 * MINUTE, 30 * MINUTE),
            (Category::Registration, 3, HOUR, HOUR),
            (Category::ApiRead, 1000, HOUR, 0),
            (Category::ApiWrite, 100, HOUR, 0),
            (Category::ApiDelete, 50, HOUR, 0),
            (Category::Upload, 20, HOUR, 0),
            (Category::PublicView, 2000, HOUR, 0),
            (Category::Default, default_per_hour, HOUR, 0),
        ];

        rules
            .into_iter()
            .fold(Self::empty(), |table, (category, max_requests, window, block)| {
                table.with_policy(LimitPolicy::new(
                    category,
                    max_requests,
                    Duration::from_secs(window),
                    Duration::from_secs(block),
                ))
            })
    }

    /// Register or replace the policy for its category.
    pub fn with_policy(mut self, policy: LimitPolicy) -> Self {
        self.policies.insert(policy.category, policy);
        self
    }

    /// Replace entries with the given rules.
    pub fn apply(&mut self, rules: &BTreeMap<Category, PolicyRule>) {
        for (category, rule) in rules {
            info!(
                category = %category,
                max_requests = rule.max_requests,
                window_secs = rule.window_secs,
                block_secs = rule.block_secs,
                "Overriding rate limit policy"
            );
            self.policies.insert(*category, rule.into_policy(*category));
        }
    }

    /// Parse policy overrides from YAML.
    pub fn parse_rules(yaml: &str) -> Result<BTreeMap<Category, PolicyRule>> {
        // Bare map first, then the `policies:` section form
        if let Ok(rules) = serde_yaml::from_str::<BTreeMap<Category, PolicyRule>>(yaml) {
            return Ok(rules);
        }

        serde_yaml::from_str::<PolicySection>(yaml)
            .map(|section| section.policies)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    /// Built-in policies for `profile` with YAML overrides applied.
    pub fn from_yaml(yaml: &str, profile: Profile) -> Result<Self> {
        let mut table = Self::builtin(profile);
        table.apply(&Self::parse_rules(yaml)?);
        Ok(table)
    }

    /// Built-in policies for `profile` with overrides loaded from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P, profile: Profile) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents, profile)
    }

    /// Look up the policy for a category.
    pub fn policy_for(&self, category: Category) -> Result<&LimitPolicy> {
        self.policies
            .get(&category)
            .ok_or_else(|| TollgateError::UnknownCategory(category.to_string()))
    }

    /// Check that every required category has a usable policy.
    pub fn validate(&self, required: &[Category]) -> Result<()> {
        for category in required {
            let policy = self.policy_for(*category)?;
            if policy.max_requests == 0 {
                return Err(TollgateError::Config(format!(
                    "policy for {} must allow at least one request",
                    category
                )));
            }
            if policy.window.is_zero() {
                return Err(TollgateError::Config(format!(
                    "policy for {} must have a non-zero window",
                    category
                )));
            }
            if policy.window > MAX_POLICY_DURATION || policy.block_duration > MAX_POLICY_DURATION {
                return Err(TollgateError::Config(format!(
                    "policy for {} has a window or block longer than {} days",
                    category,
                    MAX_POLICY_DURATION.as_secs() / DAY
                )));
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) over every category.
    pub fn validate_all(&self) -> Result<()> {
        self.validate(&Category::ALL)
    }

    /// The longest window or block duration in the table.
    pub fn longest_horizon(&self) -> Duration {
        self.policies
            .values()
            .map(LimitPolicy::horizon)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// The table in its configuration form, ordered by category.
    pub fn to_rules(&self) -> BTreeMap<Category, PolicyRule> {
        self.policies
            .iter()
            .map(|(category, policy)| (*category, PolicyRule::from(policy)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
