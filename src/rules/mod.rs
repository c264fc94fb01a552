//! Rule records and their lifecycle.
//!
//! A rule couples a trigger (input channel + topic pattern, or a schedule)
//! with a script and an ordered list of typed outputs. Only enabled rules
//! are evaluated or scheduled; deleted rules are invisible everywhere.

pub mod engine;
pub mod lua;
pub mod outputs;
pub mod repo;
pub mod scheduler;
pub mod script;
pub mod wasm;

pub use engine::RulesService;
pub use outputs::Output;
pub use repo::{ListFilter, RulePage, RuleRepository};
pub use scheduler::Scheduler;

use crate::message::{Message, topic_matches};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Script engine selector; persisted as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicKind {
    /// Lua source evaluated in a fresh interpreter per message.
    #[default]
    Lua,
    /// Compiled WebAssembly module run in a sandbox per message.
    Wasm,
}

impl TryFrom<i16> for LogicKind {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Lua),
            1 => Ok(Self::Wasm),
            other => Err(format!("unknown logic kind {other}")),
        }
    }
}

impl From<LogicKind> for i16 {
    fn from(kind: LogicKind) -> Self {
        match kind {
            LogicKind::Lua => 0,
            LogicKind::Wasm => 1,
        }
    }
}

/// Script body plus its engine.
#[derive(Debug, Clone, Default)]
pub struct Logic {
    /// Which engine runs the script.
    pub kind: LogicKind,
    /// Lua source or WASM module bytes.
    pub value: Vec<u8>,
}

/// Rule lifecycle state; transitions are Enabled ⇄ Disabled → Deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Evaluated and scheduled.
    #[default]
    Enabled,
    /// Retained but inert.
    Disabled,
    /// Hidden from every default read path.
    Deleted,
}

impl TryFrom<i16> for Status {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Enabled),
            1 => Ok(Self::Disabled),
            2 => Ok(Self::Deleted),
            other => Err(format!("unknown status {other}")),
        }
    }
}

impl From<Status> for i16 {
    fn from(status: Status) -> Self {
        match status {
            Status::Enabled => 0,
            Status::Disabled => 1,
            Status::Deleted => 2,
        }
    }
}

/// Recurrence policy of a scheduled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurring {
    /// Fires once; no next execution.
    #[default]
    None,
    /// Every `period` hours.
    Hourly,
    /// Every `period` days.
    Daily,
    /// Every `period` weeks; weekday is preserved.
    Weekly,
    /// Every `period` calendar months; day-of-month clamps to shorter
    /// target months.
    Monthly,
}

impl Recurring {
    /// Next execution time after `from`, or `None` for non-recurring rules.
    pub fn next_due(&self, from: DateTime<Utc>, period: u32) -> Option<DateTime<Utc>> {
        let period = period.max(1);
        match self {
            Self::None => None,
            Self::Hourly => Some(from + Duration::hours(i64::from(period))),
            Self::Daily => Some(from + Duration::days(i64::from(period))),
            Self::Weekly => Some(from + Duration::weeks(i64::from(period))),
            Self::Monthly => from.checked_add_months(Months::new(period)),
        }
    }

    /// Stored text tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for Recurring {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown recurrence {other:?}")),
        }
    }
}

/// When and how often a rule fires on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// First scheduled execution.
    pub start_datetime: Option<DateTime<Utc>>,
    /// Next pending execution; cleared for exhausted non-recurring rules.
    pub next_due: Option<DateTime<Utc>>,
    /// Recurrence policy.
    pub recurring: Recurring,
    /// Periods per recurrence unit; at least 1.
    pub recurring_period: u32,
}

/// A persisted rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Identifier.
    pub id: String,
    /// Tenant scope.
    pub domain: String,
    /// Human name.
    pub name: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Channel whose messages trigger this rule.
    pub input_channel: String,
    /// Wildcard pattern matched against message subtopics; empty matches
    /// everything.
    pub input_topic: String,
    /// Script.
    pub logic: Logic,
    /// Ordered outputs run with the script result.
    pub outputs: Vec<outputs::Output>,
    /// Timer trigger.
    pub schedule: Schedule,
    /// Lifecycle state.
    pub status: Status,
    /// Arbitrary annotations.
    pub metadata: serde_json::Value,
    /// Audit: creation time.
    pub created_at: DateTime<Utc>,
    /// Audit: creator.
    pub created_by: String,
    /// Audit: last update time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Audit: last updater.
    pub updated_by: String,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            id: String::new(),
            domain: String::new(),
            name: String::new(),
            tags: Vec::new(),
            input_channel: String::new(),
            input_topic: String::new(),
            logic: Logic::default(),
            outputs: Vec::new(),
            schedule: Schedule::default(),
            status: Status::default(),
            metadata: serde_json::Value::Null,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            created_by: String::new(),
            updated_at: None,
            updated_by: String::new(),
        }
    }
}

impl Rule {
    /// Whether an inbound message triggers this rule.
    pub fn matches(&self, message: &Message) -> bool {
        self.status == Status::Enabled
            && self.domain == message.domain
            && self.input_channel == message.channel
            && topic_matches(&self.input_topic, &message.subtopic)
    }
}

/// Alarm raised by the alarms output; script-produced fields ride along.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Rule that raised the alarm.
    #[serde(default)]
    pub rule_id: String,
    /// Tenant scope of the triggering message.
    #[serde(default)]
    pub domain: String,
    /// Publisher of the triggering message.
    #[serde(default)]
    pub client_id: String,
    /// Channel of the triggering message.
    #[serde(default)]
    pub channel_id: String,
    /// Subtopic of the triggering message.
    #[serde(default)]
    pub subtopic: String,
    /// What was measured.
    #[serde(default)]
    pub measurement: String,
    /// Measured value, as the script rendered it.
    #[serde(default)]
    pub value: String,
    /// Unit of the measurement.
    #[serde(default)]
    pub unit: String,
    /// Threshold the value crossed.
    #[serde(default)]
    pub threshold: String,
    /// Script-supplied cause.
    #[serde(default)]
    pub cause: String,
    /// Severity, 0–255.
    #[serde(default)]
    pub severity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn none_never_recurs() {
        assert_eq!(Recurring::None.next_due(at(2025, 1, 1, 0), 1), None);
    }

    #[test]
    fn hourly_and_daily_advance_by_period() {
        assert_eq!(
            Recurring::Hourly.next_due(at(2025, 1, 1, 0), 6),
            Some(at(2025, 1, 1, 6))
        );
        assert_eq!(
            Recurring::Daily.next_due(at(2025, 1, 1, 0), 1),
            Some(at(2025, 1, 2, 0))
        );
    }

    #[test]
    fn weekly_preserves_weekday() {
        use chrono::Datelike;
        let from = at(2025, 1, 6, 9); // a Monday
        let next = Recurring::Weekly.next_due(from, 2).unwrap();
        assert_eq!(next, at(2025, 1, 20, 9));
        assert_eq!(next.weekday(), from.weekday());
    }

    #[test]
    fn monthly_clamps_to_shorter_month() {
        let from = at(2025, 1, 31, 12);
        assert_eq!(
            Recurring::Monthly.next_due(from, 1),
            Some(at(2025, 2, 28, 12))
        );
    }

    #[test]
    fn rule_matching_requires_enabled_domain_channel_topic() {
        let rule = Rule {
            domain: "d1".into(),
            input_channel: "ch1".into(),
            input_topic: "temperature.*".into(),
            status: Status::Enabled,
            ..Rule::default()
        };
        let message = Message {
            domain: "d1".into(),
            channel: "ch1".into(),
            subtopic: "temperature.kitchen".into(),
            ..Message::default()
        };
        assert!(rule.matches(&message));

        let disabled = Rule {
            status: Status::Disabled,
            ..rule.clone()
        };
        assert!(!disabled.matches(&message));

        let wrong_topic = Message {
            subtopic: "humidity".into(),
            ..message.clone()
        };
        assert!(!rule.matches(&wrong_topic));

        let wrong_domain = Message {
            domain: "d2".into(),
            ..message
        };
        assert!(!rule.matches(&wrong_domain));
    }

    #[test]
    fn logic_kind_round_trips_through_i16() {
        assert_eq!(LogicKind::try_from(0i16).unwrap(), LogicKind::Lua);
        assert_eq!(LogicKind::try_from(1i16).unwrap(), LogicKind::Wasm);
        assert!(LogicKind::try_from(9i16).is_err());
        assert_eq!(i16::from(LogicKind::Wasm), 1);
    }
}
