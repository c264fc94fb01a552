//! Rules engine integration: dispatch, evaluation, outputs.

mod common;

use common::{InMemoryBus, wait_until};
use edgebus::bus::MessageBusExt;
use edgebus::config::RulesConfig;
use edgebus::message::Message;
use edgebus::rules::outputs::{Output, OutputContext};
use edgebus::rules::repo::{MemoryRuleRepository, RuleRepository};
use edgebus::rules::{Alarm, Logic, LogicKind, Rule, RulesService, Status};
use std::sync::Arc;
use std::time::Duration;

const ALARM_SCRIPT: &[u8] = br#"
    if message.payload.t > 30 then
        return { measurement = "t", value = tostring(message.payload.t),
                 unit = "C", threshold = "30", cause = "high", severity = 90 }
    end
    return false
"#;

fn alarm_rule() -> Rule {
    Rule {
        id: "R".into(),
        domain: "d1".into(),
        name: "high temperature".into(),
        input_channel: "ch1".into(),
        input_topic: "temperature.*".into(),
        logic: Logic {
            kind: LogicKind::Lua,
            value: ALARM_SCRIPT.to_vec(),
        },
        outputs: vec![Output::Alarms {}],
        status: Status::Enabled,
        metadata: serde_json::json!({}),
        ..Rule::default()
    }
}

fn temperature_message(t: i64) -> Message {
    Message {
        domain: "d1".into(),
        channel: "ch1".into(),
        subtopic: "temperature.kitchen".into(),
        publisher: "p1".into(),
        protocol: "coap".into(),
        created: 1,
        payload: format!(r#"{{"t":{t}}}"#).into_bytes(),
    }
}

async fn service_with(
    bus: Arc<InMemoryBus>,
    rules: Vec<Rule>,
) -> (Arc<RulesService>, Arc<MemoryRuleRepository>) {
    let repo = Arc::new(MemoryRuleRepository::new());
    for rule in rules {
        repo.add_rule(rule).await.unwrap();
    }
    let ctx = OutputContext::new(bus, None);
    let service =
        Arc::new(RulesService::new(repo.clone(), ctx, &RulesConfig::default()).unwrap());
    (service, repo)
}

#[test_log::test(tokio::test)]
async fn matching_message_raises_alarm() {
    let bus = InMemoryBus::new();
    let (service, _repo) = service_with(bus.clone(), vec![alarm_rule()]).await;

    service.handle_message(temperature_message(45)).await;

    assert!(
        wait_until(
            || !bus.published_matching("alarms.>").is_empty(),
            Duration::from_secs(5),
        )
        .await,
        "expected an alarm publication"
    );

    let alarms = bus.published_matching("alarms.ch1.temperature.kitchen");
    assert_eq!(alarms.len(), 1);
    let alarm: Alarm = serde_json::from_slice(&alarms[0]).unwrap();
    assert_eq!(alarm.rule_id, "R");
    assert_eq!(alarm.channel_id, "ch1");
    assert_eq!(alarm.subtopic, "temperature.kitchen");
    assert_eq!(alarm.client_id, "p1");
    assert_eq!(alarm.value, "45");
    assert_eq!(alarm.severity, 90);
}

#[tokio::test]
async fn below_threshold_raises_nothing() {
    let bus = InMemoryBus::new();
    let (service, _repo) = service_with(bus.clone(), vec![alarm_rule()]).await;

    service.handle_message(temperature_message(20)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(bus.published_matching("alarms.>").is_empty());
}

#[tokio::test]
async fn false_return_short_circuits_every_output() {
    let bus = InMemoryBus::new();
    let mut rule = alarm_rule();
    rule.logic.value = b"return false".to_vec();
    rule.outputs = vec![
        Output::Alarms {},
        Output::Channels {
            channel: "ch2".into(),
            topic: String::new(),
        },
    ];
    let (service, _repo) = service_with(bus.clone(), vec![rule.clone()]).await;

    let failures = service
        .evaluate(&rule, &temperature_message(45))
        .await
        .unwrap();
    assert!(failures.is_empty());
    assert!(bus.published_subjects().is_empty());
}

#[tokio::test]
async fn one_failing_output_does_not_stop_the_next() {
    let bus = InMemoryBus::new();
    let mut rule = alarm_rule();
    rule.logic.value = br#"return {v = 1}"#.to_vec();
    rule.outputs = vec![
        // No SMTP relay is configured, so this output fails.
        Output::Email {
            to: vec!["ops@example.com".into()],
            subject: "alert".into(),
            content: "{{ result.v }}".into(),
        },
        Output::Channels {
            channel: "ch2".into(),
            topic: "derived".into(),
        },
    ];
    let (service, _repo) = service_with(bus.clone(), vec![rule.clone()]).await;

    let failures = service
        .evaluate(&rule, &temperature_message(45))
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);

    let republished = bus.published_matching("channel.ch2.derived");
    assert_eq!(republished.len(), 1);
    let message = Message::from_envelope(&republished[0]).unwrap();
    assert_eq!(message.publisher, "p1");
    assert_eq!(message.payload, br#"{"v":1}"#);
}

#[tokio::test]
async fn oversized_payloads_are_dropped_before_evaluation() {
    let bus = InMemoryBus::new();
    let (service, _repo) = service_with(bus.clone(), vec![alarm_rule()]).await;

    let mut message = temperature_message(45);
    message.payload = vec![b'x'; 100 * 1024 + 1];
    service.handle_message(message).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(bus.published_subjects().is_empty());
}

#[tokio::test]
async fn topic_pattern_gates_dispatch() {
    let bus = InMemoryBus::new();
    let (service, _repo) = service_with(bus.clone(), vec![alarm_rule()]).await;

    let mut message = temperature_message(45);
    message.subtopic = "humidity.kitchen".into();
    service.handle_message(message).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(bus.published_matching("alarms.>").is_empty());
}

#[test_log::test(tokio::test)]
async fn engine_subscription_evaluates_bus_traffic() {
    let bus = InMemoryBus::new();
    let (service, _repo) = service_with(bus.clone(), vec![alarm_rule()]).await;
    let _subscription = RulesService::start(service, bus.as_ref()).await.unwrap();

    bus.publish_message(&temperature_message(45)).await.unwrap();

    assert!(
        wait_until(
            || !bus.published_matching("alarms.>").is_empty(),
            Duration::from_secs(5),
        )
        .await,
        "bus-delivered message should trigger the rule"
    );
}

#[tokio::test]
async fn wasm_rule_feeds_outputs() {
    const MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "alloc") (param $len i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get $len
            i32.add
            global.set $heap
            local.get $ptr)
          (data (i32.const 0) "{\"ok\":true}")
          (func (export "logic") (param i32) (param i32) (result i64)
            i64.const 11))
    "#;

    let bus = InMemoryBus::new();
    let mut rule = alarm_rule();
    rule.logic = Logic {
        kind: LogicKind::Wasm,
        value: wat::parse_str(MODULE).unwrap(),
    };
    rule.outputs = vec![Output::Channels {
        channel: "ch2".into(),
        topic: String::new(),
    }];
    let (service, _repo) = service_with(bus.clone(), vec![rule.clone()]).await;

    let failures = service
        .evaluate(&rule, &temperature_message(45))
        .await
        .unwrap();
    assert!(failures.is_empty());

    let republished = bus.published_matching("channel.ch2");
    assert_eq!(republished.len(), 1);
    let message = Message::from_envelope(&republished[0]).unwrap();
    assert_eq!(message.payload, br#"{"ok":true}"#);
}
