//! In-memory rule repository for embedding and tests.

use super::{ListFilter, RepoError, RulePage, RuleRepository, SortDir, SortField};
use crate::rules::{Output, Rule, Schedule, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hash-map backed repository with the same visibility semantics as the
/// Postgres implementation.
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rules: Mutex<HashMap<String, Rule>>,
}

impl MemoryRuleRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_visible<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Rule) -> T,
    ) -> Result<T, RepoError> {
        let mut rules = self.rules.lock().expect("repository poisoned");
        match rules.get_mut(id) {
            Some(rule) if rule.status != Status::Deleted => Ok(apply(rule)),
            _ => Err(RepoError::NotFound { id: id.to_string() }),
        }
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn add_rule(&self, mut rule: Rule) -> Result<Rule, RepoError> {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        let mut rules = self.rules.lock().expect("repository poisoned");
        if rules.contains_key(&rule.id) {
            return Err(RepoError::Conflict {
                id: rule.id.clone(),
            });
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn view_rule(&self, id: &str) -> Result<Rule, RepoError> {
        self.with_visible(id, |rule| rule.clone())
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepoError> {
        self.with_visible(&rule.id.clone(), move |stored| {
            stored.name = rule.name;
            stored.input_channel = rule.input_channel;
            stored.input_topic = rule.input_topic;
            stored.logic = rule.logic;
            stored.outputs = rule.outputs;
            stored.metadata = rule.metadata;
            stored.updated_at = Some(Utc::now());
            stored.updated_by = rule.updated_by;
            stored.clone()
        })
    }

    async fn update_rule_tags(&self, id: &str, tags: Vec<String>) -> Result<Rule, RepoError> {
        self.with_visible(id, move |rule| {
            rule.tags = tags;
            rule.updated_at = Some(Utc::now());
            rule.clone()
        })
    }

    async fn update_rule_schedule(&self, id: &str, schedule: Schedule) -> Result<Rule, RepoError> {
        self.with_visible(id, move |rule| {
            rule.schedule = schedule;
            rule.updated_at = Some(Utc::now());
            rule.clone()
        })
    }

    async fn update_rule_status(&self, id: &str, status: Status) -> Result<Rule, RepoError> {
        self.with_visible(id, move |rule| {
            rule.status = status;
            rule.updated_at = Some(Utc::now());
            rule.clone()
        })
    }

    async fn update_rule_due(
        &self,
        id: &str,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        self.with_visible(id, move |rule| {
            rule.schedule.next_due = due;
        })
    }

    async fn remove_rule(&self, id: &str) -> Result<(), RepoError> {
        let mut rules = self.rules.lock().expect("repository poisoned");
        rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound { id: id.to_string() })
    }

    async fn list_rules(&self, filter: ListFilter) -> Result<RulePage, RepoError> {
        let rules = self.rules.lock().expect("repository poisoned");
        let mut matched: Vec<Rule> = rules
            .values()
            .filter(|rule| rule_matches_filter(rule, &filter))
            .cloned()
            .collect();

        sort_rules(&mut matched, filter.order, filter.dir);
        let total = matched.len() as u64;
        let rules = matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();

        Ok(RulePage {
            rules,
            total,
            offset: filter.offset,
            limit: filter.limit,
        })
    }
}

fn rule_matches_filter(rule: &Rule, filter: &ListFilter) -> bool {
    let status_ok = match filter.status {
        Some(status) => rule.status == status,
        None => rule.status != Status::Deleted,
    };
    status_ok
        && filter.domain.as_ref().is_none_or(|d| &rule.domain == d)
        && filter
            .input_channel
            .as_ref()
            .is_none_or(|c| &rule.input_channel == c)
        && filter
            .input_topic
            .as_ref()
            .is_none_or(|t| &rule.input_topic == t)
        && filter.output_channel.as_ref().is_none_or(|target| {
            rule.outputs
                .iter()
                .any(|o| matches!(o, Output::Channels { channel, .. } if channel == target))
        })
        && filter.tag.as_ref().is_none_or(|t| rule.tags.contains(t))
        && filter
            .scheduled_before
            .is_none_or(|t| rule.schedule.next_due.is_some_and(|due| due <= t))
        && filter
            .scheduled_after
            .is_none_or(|t| rule.schedule.next_due.is_some_and(|due| due >= t))
        && filter
            .recurring
            .is_none_or(|r| rule.schedule.recurring == r)
}

fn sort_rules(rules: &mut [Rule], order: SortField, dir: SortDir) {
    rules.sort_by(|a, b| {
        let ordering = match order {
            SortField::Name => a.name.cmp(&b.name),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        match dir {
            SortDir::Asc => ordering,
            SortDir::Desc => ordering.reverse(),
        }
    });
}
