//! End-to-end scenarios against real BPMN diagrams: linear flow, exclusive
//! split, parallel join, boundary timer, and a call-activity round trip.

use std::sync::Arc;
use std::time::Duration;

use bpmn_engine::{ManagerConfig, MapHandlerModule, ProcessManager};
use serde_json::{json, Value};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

const LINEAR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p1" name="linear">
    <startEvent id="s" name="start"/>
    <serviceTask id="t" name="Compute"/>
    <endEvent id="e" name="end"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="t"/>
    <sequenceFlow id="f2" sourceRef="t" targetRef="e"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn linear_process_runs_to_completion() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("Compute", |data| Ok(data)));
    manager.add_bpmn(LINEAR, handler).await.unwrap();

    let instance = manager.create_process("linear", "lin-1").await.unwrap();
    instance.trigger_event("start", Value::Null).await.unwrap();
    settle().await;

    let history = instance.current_history().await;
    assert!(history.finished_at.is_some());
    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "end");
    assert_eq!(history.open_non_gateway_count(), 0);
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("Compute", |data| Ok(data)));
    manager.add_bpmn(LINEAR, handler).await.unwrap();

    let instance = manager.create_process("linear", "lin-2").await.unwrap();
    instance.trigger_event("start", Value::Null).await.unwrap();
    settle().await;
    assert!(instance.trigger_event("start", Value::Null).await.is_err());
}

const EXCLUSIVE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p2" name="exclusive">
    <startEvent id="s" name="start"/>
    <exclusiveGateway id="gw" name="decide"/>
    <endEvent id="yes" name="yesEnd"/>
    <endEvent id="no" name="noEnd"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="gw"/>
    <sequenceFlow id="f2" name="toYes" sourceRef="gw" targetRef="yes"/>
    <sequenceFlow id="f3" name="toNo" sourceRef="gw" targetRef="no"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn exclusive_gateway_takes_first_truthy_branch() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(
        MapHandlerModule::new()
            .exclusive("decide", "toYes", |data| Ok(data["pick"] == "yes"))
            .exclusive("decide", "toNo", |data| Ok(data["pick"] != "yes")),
    );
    manager.add_bpmn(EXCLUSIVE, handler).await.unwrap();

    let instance = manager.create_process("exclusive", "ex-1").await.unwrap();
    instance.trigger_event("start", json!({ "pick": "no" })).await.unwrap();
    settle().await;

    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "noEnd");
}

const PARALLEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p3" name="parallel">
    <startEvent id="s" name="start"/>
    <parallelGateway id="split" name="split"/>
    <serviceTask id="a" name="BranchA"/>
    <serviceTask id="b" name="BranchB"/>
    <parallelGateway id="join" name="join"/>
    <endEvent id="e" name="end"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="split"/>
    <sequenceFlow id="f2" sourceRef="split" targetRef="a"/>
    <sequenceFlow id="f3" sourceRef="split" targetRef="b"/>
    <sequenceFlow id="f4" sourceRef="a" targetRef="join"/>
    <sequenceFlow id="f5" sourceRef="b" targetRef="join"/>
    <sequenceFlow id="f6" sourceRef="join" targetRef="e"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn parallel_gateway_waits_for_every_incoming_branch() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(
        MapHandlerModule::new()
            .on_arrive("BranchA", |data| Ok(data))
            .on_arrive("BranchB", |data| Ok(data)),
    );
    manager.add_bpmn(PARALLEL, handler).await.unwrap();

    let instance = manager.create_process("parallel", "par-1").await.unwrap();
    instance.trigger_event("start", Value::Null).await.unwrap();
    settle().await;

    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "end");
    let state = instance.current_state().await;
    assert!(!state.has_token_at("join"));
}

const TIMER_BOUNDARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p4" name="approval">
    <startEvent id="s" name="start"/>
    <userTask id="w" name="Approve"/>
    <boundaryEvent id="b" name="approveTimeout" attachedToRef="w">
      <timerEventDefinition/>
    </boundaryEvent>
    <endEvent id="e" name="end"/>
    <endEvent id="te" name="timedOut"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="w"/>
    <sequenceFlow id="f2" sourceRef="w" targetRef="e"/>
    <sequenceFlow id="f3" sourceRef="b" targetRef="te"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn boundary_timer_interrupts_the_wait_task() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().get_timeout("approveTimeout", || Ok(10.0)));
    manager.add_bpmn(TIMER_BOUNDARY, handler).await.unwrap();

    let instance = manager.create_process("approval", "app-1").await.unwrap();
    instance.trigger_event("start", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "timedOut");
    let state = instance.current_state().await;
    assert!(!state.has_token_at("Approve"));
}

#[tokio::test]
async fn completing_the_task_before_the_timer_wins() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().get_timeout("approveTimeout", || Ok(500.0)));
    manager.add_bpmn(TIMER_BOUNDARY, handler).await.unwrap();

    let instance = manager.create_process("approval", "app-2").await.unwrap();
    instance.trigger_event("start", Value::Null).await.unwrap();
    settle().await;
    instance.task_done("Approve", Value::Null).await;
    settle().await;

    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "end");
}

const PARENT_CHILD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p5" name="parent">
    <startEvent id="s" name="start"/>
    <callActivity id="c" name="DoChild" calledElement="child"/>
    <endEvent id="e" name="end"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="c"/>
    <sequenceFlow id="f2" sourceRef="c" targetRef="e"/>
  </process>

  <process id="p6" name="child">
    <startEvent id="cs" name="childStart"/>
    <serviceTask id="ct" name="ChildWork"/>
    <endEvent id="ce" name="childEnd"/>
    <sequenceFlow id="g1" sourceRef="cs" targetRef="ct"/>
    <sequenceFlow id="g2" sourceRef="ct" targetRef="ce"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn call_activity_round_trips_through_a_child_process() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("ChildWork", |data| Ok(data)));
    manager.add_bpmn(PARENT_CHILD, handler).await.unwrap();

    let instance = manager.create_process("parent", "par-child-1").await.unwrap();
    instance.trigger_event("start", json!({ "order": 1 })).await.unwrap();
    settle().await;

    let views = instance.current_views().await;
    assert_eq!(views.end_event.unwrap().name, "end");

    let history = instance.current_history().await;
    let call_entry = history.entries.iter().find(|e| e.name == "DoChild").unwrap();
    assert!(call_entry.subhistory.is_some());
    let child_history = call_entry.subhistory.as_ref().unwrap();
    assert!(child_history.entries.iter().any(|e| e.name == "childEnd"));
}

const CALL_ACTIVITY_WAITING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p7" name="reparent">
    <startEvent id="s" name="start"/>
    <callActivity id="c" name="DoChild" calledElement="rechild"/>
    <endEvent id="e" name="end"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="c"/>
    <sequenceFlow id="f2" sourceRef="c" targetRef="e"/>
  </process>

  <process id="p8" name="rechild">
    <startEvent id="cs" name="childStart"/>
    <userTask id="ct" name="ChildApprove"/>
    <endEvent id="ce" name="childEnd"/>
    <sequenceFlow id="g1" sourceRef="cs" targetRef="ct"/>
    <sequenceFlow id="g2" sourceRef="ct" targetRef="ce"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn call_activity_instance_survives_a_persist_load_round_trip() {
    let store: Arc<dyn bpmn_engine::PersistenceStore> = Arc::new(bpmn_engine::MemoryStore::new());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("ChildApprove", |data| Ok(data)));

    let manager = ProcessManager::new(ManagerConfig {
        store: Some(store.clone()),
        ..Default::default()
    });
    manager.add_bpmn(CALL_ACTIVITY_WAITING, handler.clone()).await.unwrap();

    let instance = manager.create_process("reparent", "reparent-1").await.unwrap();
    instance.trigger_event("start", json!({ "order": 7 })).await.unwrap();
    settle().await;

    // The child is parked at its wait task; the parent's call-activity
    // token is still open, so this is an in-flight call activity at the
    // moment it gets persisted.
    let state_before = instance.current_state().await;
    assert!(state_before.has_token_at("DoChild"));

    // A fresh manager against the same store, as if the process had
    // restarted: registering the definitions drains the queue and restores
    // every persisted instance, including its in-flight children.
    let manager2 = ProcessManager::new(ManagerConfig {
        store: Some(store.clone()),
        ..Default::default()
    });
    manager2.add_bpmn(CALL_ACTIVITY_WAITING, handler).await.unwrap();
    manager2.after_initialization().await;

    let restored = manager2.get("reparent-1").expect("root instance restored from the store");
    let restored_state = restored.current_state().await;
    assert!(restored_state.has_token_at("DoChild"));

    let restored_token = restored_state
        .tokens
        .iter()
        .find(|t| t.position == "DoChild")
        .unwrap();
    assert!(restored_token.called_process_id.is_some());

    // Re-persisting the restored instance round-trips the recreated child
    // back into the document as a nested substate, proving the child was
    // actually recreated and not just referenced by id.
    let document_again = restored.to_document().await;
    let call_token = document_again
        .state
        .tokens
        .iter()
        .find(|t| t.position == "DoChild")
        .unwrap();
    let substate = call_token.substate.as_ref().expect("child substate recreated on restore");
    assert!(substate.state.has_token_at("ChildApprove"));
}

#[tokio::test]
async fn find_by_property_matches_dot_paths() {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("Compute", |data| Ok(data)));
    manager.add_bpmn(LINEAR, handler).await.unwrap();

    let instance = manager.create_process("linear", "lin-prop-1").await.unwrap();
    instance.set_property("customer.tier", json!("gold")).await;

    let matches = manager
        .find_by_property(&[("customer.tier".to_string(), json!("gold"))])
        .await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].process_id, "lin-prop-1");

    let none = manager
        .find_by_property(&[("customer.tier".to_string(), json!("silver"))])
        .await;
    assert!(none.is_empty());
}
