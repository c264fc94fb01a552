//! Rule persistence boundary.

pub mod memory;
pub mod postgres;

pub use memory::MemoryRuleRepository;
pub use postgres::PostgresRuleRepository;

use super::{Recurring, Rule, Schedule, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Repository failures.
#[derive(Debug, Error)]
pub enum RepoError {
    /// No visible rule under that id.
    #[error("rule not found: {id}")]
    NotFound {
        /// Requested id.
        id: String,
    },

    /// A rule with that id already exists.
    #[error("rule already exists: {id}")]
    Conflict {
        /// Conflicting id.
        id: String,
    },

    /// The backing store failed.
    #[error("storage failed: {reason}")]
    Storage {
        /// Driver diagnostic.
        reason: String,
    },

    /// A stored record does not decode.
    #[error("malformed record: {reason}")]
    Malformed {
        /// What failed to decode.
        reason: String,
    },
}

/// Sortable listing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    /// By rule name.
    Name,
    /// By creation time.
    CreatedAt,
    /// By last update time.
    #[default]
    UpdatedAt,
}

/// Listing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    /// Ascending.
    Asc,
    /// Descending.
    #[default]
    Desc,
}

/// Filtered, paginated listing parameters.
#[derive(Debug, Clone)]
pub struct ListFilter {
    /// Restrict to one tenant.
    pub domain: Option<String>,
    /// Restrict to rules triggered by this channel.
    pub input_channel: Option<String>,
    /// Restrict to an exact input topic pattern.
    pub input_topic: Option<String>,
    /// Restrict to rules with a channels output targeting this channel.
    pub output_channel: Option<String>,
    /// Restrict to a lifecycle state; `None` hides only deleted rules.
    pub status: Option<Status>,
    /// Restrict to rules carrying this tag.
    pub tag: Option<String>,
    /// Rules due at or before this instant.
    pub scheduled_before: Option<DateTime<Utc>>,
    /// Rules due at or after this instant.
    pub scheduled_after: Option<DateTime<Utc>>,
    /// Restrict to one recurrence policy.
    pub recurring: Option<Recurring>,
    /// Pagination offset.
    pub offset: u64,
    /// Pagination limit.
    pub limit: u64,
    /// Sort field.
    pub order: SortField,
    /// Sort direction.
    pub dir: SortDir,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            domain: None,
            input_channel: None,
            input_topic: None,
            output_channel: None,
            status: None,
            tag: None,
            scheduled_before: None,
            scheduled_after: None,
            recurring: None,
            offset: 0,
            limit: 100,
            order: SortField::default(),
            dir: SortDir::default(),
        }
    }
}

/// One page of rules plus the unpaginated total.
#[derive(Debug, Clone, Default)]
pub struct RulePage {
    /// Rules in this page.
    pub rules: Vec<Rule>,
    /// Total rules matching the filter.
    pub total: u64,
    /// Offset the page was cut at.
    pub offset: u64,
    /// Limit the page was cut with.
    pub limit: u64,
}

/// CRUD plus the narrow writes the engine needs.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Persists a new rule, assigning an id when none is given.
    async fn add_rule(&self, rule: Rule) -> Result<Rule, RepoError>;

    /// Fetches one visible rule.
    async fn view_rule(&self, id: &str) -> Result<Rule, RepoError>;

    /// Replaces a rule's definition (name, trigger, logic, outputs,
    /// metadata).
    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepoError>;

    /// Replaces a rule's tags.
    async fn update_rule_tags(&self, id: &str, tags: Vec<String>) -> Result<Rule, RepoError>;

    /// Replaces a rule's schedule.
    async fn update_rule_schedule(&self, id: &str, schedule: Schedule) -> Result<Rule, RepoError>;

    /// Moves a rule through its lifecycle.
    async fn update_rule_status(&self, id: &str, status: Status) -> Result<Rule, RepoError>;

    /// Narrow write used by the scheduler to advance (or clear) `next_due`.
    async fn update_rule_due(
        &self,
        id: &str,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError>;

    /// Hard-deletes a rule.
    async fn remove_rule(&self, id: &str) -> Result<(), RepoError>;

    /// Filtered, paginated listing; deleted rules only appear when asked
    /// for explicitly.
    async fn list_rules(&self, filter: ListFilter) -> Result<RulePage, RepoError>;
}
