//! Cross-module scenarios mirroring the concrete walkthroughs used to
//! seed this pipeline's test suite: call lifecycle via Delta3, and the
//! three SMDR correlation strategies.

use devlink_bridge::broker::CallEventMessage;
use devlink_bridge::delta3::{self, Detail, Party, Record};
use devlink_bridge::domain::{CallEventType, Direction, SmdrRecord};
use devlink_bridge::persist::{PersistBuffer, Store};
use devlink_bridge::resolver::AgentResolver;
use devlink_bridge::state_core::{StateCore, StateCoreEvent};

use devlink_bridge::correlation::CorrelationEngine;

fn party(eq_type: u32, number: &str, name: &str, id: &str, dir: &str) -> Party {
    Party {
        eq_type,
        number: number.to_string(),
        name: name.to_string(),
        id: id.to_string(),
        direction_hint: dir.to_string(),
    }
}

#[test]
fn s2_call_lifecycle_connected_then_lost() {
    let mut core = StateCore::new();
    let detail = Detail {
        call_id: "12345".into(),
        state_code: 2,
        stamp: 1_707_573_600,
        conn_stamp: 1_707_573_610,
        end_stamp: 0,
        account_code: String::new(),
        party_a: party(10, "2001", "Alice", "2001", "I"),
        party_b: party(5, "5550100", "", "T1", ""),
        targets: vec![],
    };

    let events = core.apply(&Record::Detail(detail), 1_707_573_610);
    assert!(events.iter().any(|e| matches!(e, StateCoreEvent::CallCreated(_))));

    let lost = devlink_bridge::delta3::CallLost {
        call_id: "12345".into(),
        cause: 16,
        stamp: 1_707_573_700,
    };
    let events = core.apply(&Record::CallLost(lost), 1_707_573_700);
    assert!(events.iter().any(|e| matches!(e, StateCoreEvent::CallEnded(_))));

    let call = core.call("12345").unwrap();
    assert_eq!(call.direction, Some(Direction::Inbound));
    assert!(call.answered);
    assert_eq!(call.answer_time, Some(1_707_573_610));
    assert_eq!(call.end_time, Some(1_707_573_700));
    assert!(call.end_time.unwrap() >= call.start_time.unwrap());
}

fn sample_smdr(call_id: Option<&str>, party1: &str, call_start: i64, account_code: Option<&str>) -> SmdrRecord {
    SmdrRecord {
        fields: vec![],
        call_start,
        connected_seconds: 100,
        ring_seconds: 5,
        hold_seconds: 10,
        park_seconds: 0,
        direction: Some(Direction::Inbound),
        both_internal: false,
        party1_device: party1.into(),
        party2_device: "T001".into(),
        account_code: account_code.map(str::to_string),
        call_id: call_id.map(str::to_string),
        call_charge: None,
        currency: None,
        external_targeting_cause: None,
        continuation: false,
        matched_call_id: None,
        reconciled: false,
        reconciled_at: None,
    }
}

#[test]
fn s3_smdr_match_by_id_enriches_existing_call() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let buffer = PersistBuffer::new(&store);
    let resolver = AgentResolver::new(&store).unwrap();
    let engine = CorrelationEngine::new(&store, &buffer, &resolver);

    let mut call = devlink_bridge::domain::Call::new("12345");
    call.start_time = Some(1_000);
    let (_, _) = buffer.upsert_call(&call).unwrap();
    engine
        .on_call_event(
            &CallEventMessage {
                call: call.clone(),
                event: devlink_bridge::domain::CallEvent {
                    call_id: "12345".into(),
                    event_type: CallEventType::Initiated,
                    timestamp: 1_000,
                    duration: None,
                    party: None,
                    agent_id: None,
                    agent_extension: None,
                    queue_name: None,
                    details: Default::default(),
                },
            },
            1_000,
        )
        .unwrap();

    engine
        .on_smdr_record(sample_smdr(Some("12345"), "E2001", 1_000, Some("ACCT001")), 1_010)
        .unwrap();

    let updated = store.get_call("12345").unwrap();
    assert_eq!(updated.duration, Some(115));
    assert_eq!(updated.talk_duration, Some(100));
    assert_eq!(updated.hold_duration, Some(10));
    assert_eq!(updated.account_code.as_deref(), Some("ACCT001"));
    assert_eq!(engine.stats().matched_count.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn s4_smdr_window_match_against_persisted_call() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let buffer = PersistBuffer::new(&store);
    let resolver = AgentResolver::new(&store).unwrap();
    let engine = CorrelationEngine::new(&store, &buffer, &resolver);

    let mut call = devlink_bridge::domain::Call::new("window-call");
    call.start_time = Some(1_707_566_407); // 2 seconds after smdr.call_start
    call.agent_extension = Some("1001".into());
    buffer.upsert_call(&call).unwrap();

    engine
        .on_smdr_record(sample_smdr(None, "E1001", 1_707_566_405, None), 1_707_566_410)
        .unwrap();

    assert_eq!(engine.stats().matched_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    let updated = store.get_call("window-call").unwrap();
    assert_eq!(updated.duration, Some(115));
}

#[test]
fn s5_smdr_no_match_creates_standalone_call() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let buffer = PersistBuffer::new(&store);
    let resolver = AgentResolver::new(&store).unwrap();
    let engine = CorrelationEngine::new(&store, &buffer, &resolver);

    engine
        .on_smdr_record(sample_smdr(None, "E9999", 5_000, None), 5_010)
        .unwrap();

    assert_eq!(engine.stats().unmatched_count.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn delta3_attribute_and_csv_forms_agree_on_common_fields() {
    let attribute_xml = r#"<Detail><Call CallID="99" State="2" Stamp="100" ConnStamp="110"/><PartyA EqType="10" Number="2001" Name="Alice" Id="2001" Dir="I"/><PartyB EqType="5" Number="555" Name="" Id="T1" Dir=""/></Detail>"#;
    let parsed = delta3::parse(attribute_xml).unwrap();
    let Record::Detail(detail) = parsed else {
        panic!("expected Detail record");
    };
    assert_eq!(detail.call_id, "99");
    assert_eq!(detail.state_code, 2);
    assert_eq!(detail.stamp, 100);
    assert_eq!(detail.conn_stamp, 110);
    assert_eq!(detail.party_a.number, "2001");
}
