//! The rule scheduler.
//!
//! A single ticker scans for due rules, advances their `next_due` under the
//! recurrence policy and submits each to the evaluator with a synthetic
//! message stamped at the scheduled time. Runs missed during downtime are
//! skipped, not replayed: each rule fires at most once per tick.

use super::engine::RulesService;
use super::repo::{ListFilter, RepoError, RuleRepository};
use super::{Recurring, Status};
use crate::message::Message;
use crate::time_provider::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upper bound on rules fired per tick.
const TICK_LIST_LIMIT: u64 = 10_000;

/// Periodic executor of scheduled rules.
pub struct Scheduler {
    repo: Arc<dyn RuleRepository>,
    service: Arc<RulesService>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Creates a scheduler ticking at `tick_interval`.
    pub fn new(
        repo: Arc<dyn RuleRepository>,
        service: Arc<RulesService>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            repo,
            service,
            clock,
            tick_interval,
        }
    }

    /// Runs until shutdown. Repository hiccups are logged and the ticker
    /// keeps going; the next tick retries naturally.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.tick_interval, "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = self.clock.sleep(self.tick_interval) => {}
            }
            if let Err(e) = self.tick_once().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// Executes one tick; returns how many rules fired.
    pub async fn tick_once(&self) -> Result<usize, RepoError> {
        let now = self.clock.now();
        let page = self
            .repo
            .list_rules(ListFilter {
                status: Some(Status::Enabled),
                scheduled_before: Some(now),
                limit: TICK_LIST_LIMIT,
                ..ListFilter::default()
            })
            .await?;

        let mut fired = 0;
        for rule in page.rules {
            let Some(due) = rule.schedule.next_due else {
                continue;
            };
            let next = advance_past(
                rule.schedule.recurring,
                due,
                rule.schedule.recurring_period,
                now,
            );
            if let Err(e) = self.repo.update_rule_due(&rule.id, next).await {
                error!(rule = %rule.id, error = %e, "next-due persist failed, skipping run");
                continue;
            }

            let message = Message {
                domain: rule.domain.clone(),
                channel: rule.input_channel.clone(),
                subtopic: String::new(),
                publisher: String::new(),
                protocol: String::new(),
                created: due.timestamp_nanos_opt().unwrap_or(i64::MAX),
                payload: Vec::new(),
            };
            debug!(rule = %rule.id, due = %due, "scheduled rule fired");
            Arc::clone(&self.service).evaluate_scheduled(rule, message);
            fired += 1;
        }
        Ok(fired)
    }
}

/// Next execution after `base`, rolled forward until it is in the future so
/// missed periods are skipped rather than replayed.
fn advance_past(
    recurring: Recurring,
    base: DateTime<Utc>,
    period: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut next = recurring.next_due(base, period)?;
    while next <= now {
        next = recurring.next_due(next, period)?;
    }
    Some(next)
}
