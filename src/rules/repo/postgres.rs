//! Postgres implementation of the rule repository.
//!
//! Schema lives in the migration system; queries use runtime binding so the
//! crate builds without a database around. Dynamic filters are assembled
//! with `QueryBuilder`, with the sort column constrained to a whitelist.

use super::{ListFilter, RepoError, RulePage, RuleRepository, SortDir, SortField};
use crate::rules::{Logic, LogicKind, Recurring, Rule, Schedule, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

const INSERT_RULE: &str = r"
INSERT INTO rules (
    id, domain_id, name, tags, input_channel, input_topic,
    logic_kind, logic_value, outputs,
    start_datetime, next_due, recurring, recurring_period,
    status, metadata, created_at, created_by, updated_at, updated_by
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19);
";

const SELECT_RULE: &str = r"
SELECT * FROM rules WHERE id = $1 AND status <> 2;
";

const UPDATE_RULE: &str = r"
UPDATE rules SET
    name = $2, input_channel = $3, input_topic = $4,
    logic_kind = $5, logic_value = $6, outputs = $7,
    metadata = $8, updated_at = $9, updated_by = $10
WHERE id = $1 AND status <> 2
RETURNING *;
";

const UPDATE_RULE_TAGS: &str = r"
UPDATE rules SET tags = $2, updated_at = $3
WHERE id = $1 AND status <> 2
RETURNING *;
";

const UPDATE_RULE_SCHEDULE: &str = r"
UPDATE rules SET
    start_datetime = $2, next_due = $3, recurring = $4, recurring_period = $5,
    updated_at = $6
WHERE id = $1 AND status <> 2
RETURNING *;
";

const UPDATE_RULE_STATUS: &str = r"
UPDATE rules SET status = $2, updated_at = $3
WHERE id = $1 AND status <> 2
RETURNING *;
";

const UPDATE_RULE_DUE: &str = r"
UPDATE rules SET next_due = $2 WHERE id = $1 AND status <> 2;
";

const DELETE_RULE: &str = r"
DELETE FROM rules WHERE id = $1;
";

/// Rule repository over a Postgres pool.
pub struct PostgresRuleRepository {
    pool: PgPool,
}

impl PostgresRuleRepository {
    /// Wraps an already-migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn rule_from_row(row: &PgRow) -> Result<Rule, RepoError> {
        let logic_kind: i16 = get(row, "logic_kind")?;
        let status: i16 = get(row, "status")?;
        let recurring: String = get(row, "recurring")?;
        let recurring_period: i32 = get(row, "recurring_period")?;
        let outputs: serde_json::Value = get(row, "outputs")?;

        Ok(Rule {
            id: get(row, "id")?,
            domain: get(row, "domain_id")?,
            name: get(row, "name")?,
            tags: get(row, "tags")?,
            input_channel: get(row, "input_channel")?,
            input_topic: get(row, "input_topic")?,
            logic: Logic {
                kind: LogicKind::try_from(logic_kind)
                    .map_err(|reason| RepoError::Malformed { reason })?,
                value: get(row, "logic_value")?,
            },
            outputs: serde_json::from_value(outputs).map_err(|e| RepoError::Malformed {
                reason: e.to_string(),
            })?,
            schedule: Schedule {
                start_datetime: get(row, "start_datetime")?,
                next_due: get(row, "next_due")?,
                recurring: recurring
                    .parse::<Recurring>()
                    .map_err(|reason| RepoError::Malformed { reason })?,
                recurring_period: u32::try_from(recurring_period.max(1)).unwrap_or(1),
            },
            status: Status::try_from(status).map_err(|reason| RepoError::Malformed { reason })?,
            metadata: get(row, "metadata")?,
            created_at: get(row, "created_at")?,
            created_by: get(row, "created_by")?,
            updated_at: get(row, "updated_at")?,
            updated_by: get(row, "updated_by")?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ListFilter) {
        match filter.status {
            Some(status) => {
                builder.push(" AND status = ").push_bind(i16::from(status));
            }
            None => {
                builder.push(" AND status <> 2");
            }
        }
        if let Some(domain) = &filter.domain {
            builder.push(" AND domain_id = ").push_bind(domain.clone());
        }
        if let Some(channel) = &filter.input_channel {
            builder
                .push(" AND input_channel = ")
                .push_bind(channel.clone());
        }
        if let Some(topic) = &filter.input_topic {
            builder.push(" AND input_topic = ").push_bind(topic.clone());
        }
        if let Some(target) = &filter.output_channel {
            builder.push(" AND outputs @> ").push_bind(serde_json::json!([
                {"type": "channels", "channel": target}
            ]));
        }
        if let Some(tag) = &filter.tag {
            builder
                .push(" AND ")
                .push_bind(tag.clone())
                .push(" = ANY(tags)");
        }
        if let Some(before) = filter.scheduled_before {
            builder
                .push(" AND next_due IS NOT NULL AND next_due <= ")
                .push_bind(before);
        }
        if let Some(after) = filter.scheduled_after {
            builder
                .push(" AND next_due IS NOT NULL AND next_due >= ")
                .push_bind(after);
        }
        if let Some(recurring) = filter.recurring {
            builder
                .push(" AND recurring = ")
                .push_bind(recurring.as_str());
        }
    }
}

#[async_trait]
impl RuleRepository for PostgresRuleRepository {
    #[instrument(skip(self, rule), fields(id = %rule.id))]
    async fn add_rule(&self, mut rule: Rule) -> Result<Rule, RepoError> {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        let outputs = serde_json::to_value(&rule.outputs).map_err(|e| RepoError::Malformed {
            reason: e.to_string(),
        })?;
        sqlx::query(INSERT_RULE)
            .bind(&rule.id)
            .bind(&rule.domain)
            .bind(&rule.name)
            .bind(&rule.tags)
            .bind(&rule.input_channel)
            .bind(&rule.input_topic)
            .bind(i16::from(rule.logic.kind))
            .bind(&rule.logic.value)
            .bind(outputs)
            .bind(rule.schedule.start_datetime)
            .bind(rule.schedule.next_due)
            .bind(rule.schedule.recurring.as_str())
            .bind(i32::try_from(rule.schedule.recurring_period).unwrap_or(i32::MAX))
            .bind(i16::from(rule.status))
            .bind(&rule.metadata)
            .bind(rule.created_at)
            .bind(&rule.created_by)
            .bind(rule.updated_at)
            .bind(&rule.updated_by)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, &rule.id))?;
        Ok(rule)
    }

    async fn view_rule(&self, id: &str) -> Result<Rule, RepoError> {
        let row = sqlx::query(SELECT_RULE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RepoError::NotFound { id: id.to_string() })?;
        Self::rule_from_row(&row)
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepoError> {
        let outputs = serde_json::to_value(&rule.outputs).map_err(|e| RepoError::Malformed {
            reason: e.to_string(),
        })?;
        let row = sqlx::query(UPDATE_RULE)
            .bind(&rule.id)
            .bind(&rule.name)
            .bind(&rule.input_channel)
            .bind(&rule.input_topic)
            .bind(i16::from(rule.logic.kind))
            .bind(&rule.logic.value)
            .bind(outputs)
            .bind(&rule.metadata)
            .bind(Utc::now())
            .bind(&rule.updated_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RepoError::NotFound {
                id: rule.id.clone(),
            })?;
        Self::rule_from_row(&row)
    }

    async fn update_rule_tags(&self, id: &str, tags: Vec<String>) -> Result<Rule, RepoError> {
        let row = sqlx::query(UPDATE_RULE_TAGS)
            .bind(id)
            .bind(&tags)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RepoError::NotFound { id: id.to_string() })?;
        Self::rule_from_row(&row)
    }

    async fn update_rule_schedule(&self, id: &str, schedule: Schedule) -> Result<Rule, RepoError> {
        let row = sqlx::query(UPDATE_RULE_SCHEDULE)
            .bind(id)
            .bind(schedule.start_datetime)
            .bind(schedule.next_due)
            .bind(schedule.recurring.as_str())
            .bind(i32::try_from(schedule.recurring_period).unwrap_or(i32::MAX))
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RepoError::NotFound { id: id.to_string() })?;
        Self::rule_from_row(&row)
    }

    async fn update_rule_status(&self, id: &str, status: Status) -> Result<Rule, RepoError> {
        let row = sqlx::query(UPDATE_RULE_STATUS)
            .bind(id)
            .bind(i16::from(status))
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RepoError::NotFound { id: id.to_string() })?;
        Self::rule_from_row(&row)
    }

    async fn update_rule_due(
        &self,
        id: &str,
        due: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        let affected = sqlx::query(UPDATE_RULE_DUE)
            .bind(id)
            .bind(due)
            .execute(&self.pool)
            .await
            .map_err(storage)?
            .rows_affected();
        if affected == 0 {
            return Err(RepoError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn remove_rule(&self, id: &str) -> Result<(), RepoError> {
        let affected = sqlx::query(DELETE_RULE)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?
            .rows_affected();
        if affected == 0 {
            return Err(RepoError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn list_rules(&self, filter: ListFilter) -> Result<RulePage, RepoError> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM rules WHERE 1=1");
        Self::push_filters(&mut count, &filter);
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?
            .try_get(0)
            .map_err(storage)?;

        let mut select = QueryBuilder::new("SELECT * FROM rules WHERE 1=1");
        Self::push_filters(&mut select, &filter);
        let column = match filter.order {
            SortField::Name => "name",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
        };
        let direction = match filter.dir {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };
        select.push(format!(" ORDER BY {column} {direction} NULLS LAST LIMIT "));
        select.push_bind(i64::try_from(filter.limit).unwrap_or(i64::MAX));
        select.push(" OFFSET ");
        select.push_bind(i64::try_from(filter.offset).unwrap_or(0));

        let rows = select.build().fetch_all(&self.pool).await.map_err(storage)?;
        let rules = rows
            .iter()
            .map(Self::rule_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RulePage {
            rules,
            total: u64::try_from(total).unwrap_or(0),
            offset: filter.offset,
            limit: filter.limit,
        })
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, RepoError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|e| RepoError::Malformed {
        reason: format!("column {column}: {e}"),
    })
}

fn storage(e: sqlx::Error) -> RepoError {
    RepoError::Storage {
        reason: e.to_string(),
    }
}

fn map_write_error(e: sqlx::Error, id: &str) -> RepoError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return RepoError::Conflict { id: id.to_string() };
        }
    }
    storage(e)
}
