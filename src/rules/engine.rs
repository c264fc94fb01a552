//! The per-message evaluator.
//!
//! The engine subscribes to every channel subject. For each inbound message
//! it lists the enabled rules of the same domain and input channel, keeps
//! the ones whose topic pattern matches, and evaluates each in its own
//! task. Output errors are collected per rule and logged together; one
//! failing rule never interrupts another.

use super::outputs::{OutputContext, OutputError};
use super::repo::{ListFilter, RuleRepository};
use super::script::{ScriptError, ScriptOutcome};
use super::{LogicKind, Rule, Status, lua::LuaRunner, wasm::WasmRunner};
use crate::bus::{BusError, BusHandler, Delivery, MessageBus, Subscription};
use crate::config::RulesConfig;
use crate::message::{Message, topic_matches};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Subject pattern covering every channel message.
pub const ALL_CHANNELS: &str = "channel.>";

/// Upper bound on rules considered per message.
const EVAL_LIST_LIMIT: u64 = 10_000;

/// Evaluates rules against messages and runs their outputs.
pub struct RulesService {
    repo: Arc<dyn RuleRepository>,
    outputs: OutputContext,
    lua: LuaRunner,
    wasm: WasmRunner,
    max_payload_bytes: usize,
}

impl RulesService {
    /// Builds the service and its script runners.
    pub fn new(
        repo: Arc<dyn RuleRepository>,
        outputs: OutputContext,
        config: &RulesConfig,
    ) -> Result<Self, ScriptError> {
        let timeout = config.script_timeout.as_duration();
        Ok(Self {
            repo,
            outputs,
            lua: LuaRunner::new(timeout),
            wasm: WasmRunner::new(timeout)?,
            max_payload_bytes: config.max_payload_bytes,
        })
    }

    /// Subscribes the engine to all channel traffic.
    pub async fn start(
        service: Arc<Self>,
        bus: &dyn MessageBus,
    ) -> Result<Box<dyn Subscription>, BusError> {
        info!(subject = ALL_CHANNELS, "rules engine subscribing");
        bus.subscribe(ALL_CHANNELS, Arc::new(EngineHandler { service }))
            .await
    }

    /// Dispatches one message: match rules, fan out evaluations.
    pub async fn handle_message(self: Arc<Self>, message: Message) {
        if message.payload.len() > self.max_payload_bytes {
            debug!(
                channel = %message.channel,
                size = message.payload.len(),
                "payload above evaluation ceiling, dropped"
            );
            return;
        }

        let filter = ListFilter {
            domain: Some(message.domain.clone()),
            input_channel: Some(message.channel.clone()),
            status: Some(Status::Enabled),
            limit: EVAL_LIST_LIMIT,
            ..ListFilter::default()
        };
        let page = match self.repo.list_rules(filter).await {
            Ok(page) => page,
            Err(e) => {
                error!(channel = %message.channel, error = %e, "rule listing failed");
                return;
            }
        };

        for rule in page
            .rules
            .into_iter()
            .filter(|rule| topic_matches(&rule.input_topic, &message.subtopic))
        {
            let service = Arc::clone(&self);
            let message = message.clone();
            tokio::spawn(async move {
                service.evaluate_and_report(&rule, &message).await;
            });
        }
    }

    /// Evaluates one rule; returns the errors of the outputs that failed.
    pub async fn evaluate(
        &self,
        rule: &Rule,
        message: &Message,
    ) -> Result<Vec<OutputError>, ScriptError> {
        let outcome = match rule.logic.kind {
            LogicKind::Lua => self.lua.evaluate(&rule.logic.value, message).await?,
            LogicKind::Wasm => self.wasm.evaluate(&rule.logic.value, message).await?,
        };

        let ScriptOutcome::Value(result) = outcome else {
            debug!(rule = %rule.id, "script declined, outputs skipped");
            return Ok(Vec::new());
        };

        let mut failures = Vec::new();
        for output in &rule.outputs {
            if let Err(e) = output.run(&self.outputs, rule, message, &result).await {
                failures.push(e);
            }
        }
        Ok(failures)
    }

    /// Evaluates a rule fired by the scheduler with a synthetic message.
    pub fn evaluate_scheduled(self: Arc<Self>, rule: Rule, message: Message) {
        tokio::spawn(async move {
            self.evaluate_and_report(&rule, &message).await;
        });
    }

    async fn evaluate_and_report(&self, rule: &Rule, message: &Message) {
        match self.evaluate(rule, message).await {
            Ok(failures) if failures.is_empty() => {}
            Ok(failures) => {
                for failure in &failures {
                    warn!(rule = %rule.id, error = %failure, "output failed");
                }
            }
            Err(e) => {
                warn!(rule = %rule.id, error = %e, "rule evaluation failed");
            }
        }
    }
}

struct EngineHandler {
    service: Arc<RulesService>,
}

#[async_trait]
impl BusHandler for EngineHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        let message = Message::from_envelope(&delivery.payload).map_err(|e| {
            BusError::Malformed {
                reason: e.to_string(),
            }
        })?;
        Arc::clone(&self.service).handle_message(message).await;
        Ok(())
    }
}
