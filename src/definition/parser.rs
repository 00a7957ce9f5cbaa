//! The out-of-scope "definition parser" component, implemented here as the
//! pure function the spec names: `parse(xml) -> Definitions | ErrorQueue`.
//!
//! Built the way the teacher's `diagram::reader` walks a BPMN file with
//! `quick_xml`, generalized to also read `messageFlow`, `participant` /
//! `collaboration`, `timerEventDefinition` and `callActivity`'s
//! `calledElement`/namespace/location, none of which the teacher's
//! single-process reader needs.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::ParseErrorItem;

use super::index::validate;
use super::model::{
    CollaborationDefinition, Definitions, FlowObject, FlowObjectKind, MessageFlow, Participant,
    ProcessDefinition, SequenceFlow,
};

/// Parses a BPMN 2.0 XML document into the in-memory definition graph.
///
/// Returns every accumulated violation of §3.1's invariants rather than
/// stopping at the first one; `Err` is only ever a non-empty queue.
pub fn parse(xml: &str) -> std::result::Result<Definitions, Vec<ParseErrorItem>> {
    let mut defs = parse_raw(xml).map_err(|e| {
        vec![ParseErrorItem::new("XML", "definitions", e.to_string())]
    })?;

    resolve_message_flow_endpoints(&mut defs);

    let mut errors = Vec::new();
    for process in &defs.processes {
        errors.extend(validate(process));
    }
    if errors.is_empty() { Ok(defs) } else { Err(errors) }
}

fn local_name(raw: &[u8]) -> String {
    match raw.iter().position(|&b| b == b':') {
        Some(pos) => String::from_utf8_lossy(&raw[pos + 1..]).into_owned(),
        None => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn attr(e: &BytesStart, key: &str) -> Option<String> {
    e.try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

#[derive(Default)]
struct ProcessBuilder {
    id: String,
    name: String,
    flow_objects: Vec<FlowObject>,
    sequence_flows: Vec<SequenceFlow>,
}

#[derive(Default)]
struct CollabBuilder {
    id: String,
    participants: Vec<Participant>,
    participant_process_ref_by_id: HashMap<String, String>,
    message_flows: Vec<(String, String, String)>, // (id, source_ref, target_ref)
}

fn parse_raw(xml: &str) -> quick_xml::Result<Definitions> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut processes: Vec<ProcessDefinition> = Vec::new();
    let mut collaboration: Option<CollaborationDefinition> = None;

    let mut current_process: Option<ProcessBuilder> = None;
    let mut current_collab: Option<CollabBuilder> = None;
    let mut pending_event: Option<FlowObject> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let local = local_name(e.name().as_ref());
                handle_start(
                    &local,
                    &e,
                    &mut current_process,
                    &mut current_collab,
                    &mut pending_event,
                );
            }
            Event::Empty(e) => {
                let local = local_name(e.name().as_ref());
                handle_start(
                    &local,
                    &e,
                    &mut current_process,
                    &mut current_collab,
                    &mut pending_event,
                );
                handle_end(
                    &local,
                    &mut current_process,
                    &mut current_collab,
                    &mut pending_event,
                    &mut processes,
                    &mut collaboration,
                );
            }
            Event::End(e) => {
                let local = local_name(e.name().as_ref());
                handle_end(
                    &local,
                    &mut current_process,
                    &mut current_collab,
                    &mut pending_event,
                    &mut processes,
                    &mut collaboration,
                );
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(Definitions { processes, collaboration })
}

fn handle_start(
    local: &str,
    e: &BytesStart,
    current_process: &mut Option<ProcessBuilder>,
    current_collab: &mut Option<CollabBuilder>,
    pending_event: &mut Option<FlowObject>,
) {
    match local {
        "process" => {
            let id = attr(e, "id").unwrap_or_default();
            let name = attr(e, "name").unwrap_or_else(|| id.clone());
            *current_process = Some(ProcessBuilder { id, name, ..Default::default() });
        }
        "collaboration" => {
            let id = attr(e, "id").unwrap_or_default();
            *current_collab = Some(CollabBuilder { id, ..Default::default() });
        }
        "participant" => {
            if let Some(collab) = current_collab {
                let id = attr(e, "id").unwrap_or_default();
                let name = attr(e, "name").unwrap_or_else(|| id.clone());
                let process_ref = attr(e, "processRef").unwrap_or_default();
                collab.participant_process_ref_by_id.insert(id, process_ref.clone());
                collab.participants.push(Participant { name, process_ref });
            }
        }
        "messageFlow" => {
            if let Some(collab) = current_collab {
                let id = attr(e, "id").unwrap_or_default();
                let source_ref = attr(e, "sourceRef").unwrap_or_default();
                let target_ref = attr(e, "targetRef").unwrap_or_default();
                collab.message_flows.push((id, source_ref, target_ref));
            }
        }
        "sequenceFlow" => {
            if let Some(process) = current_process {
                let id = attr(e, "id").unwrap_or_default();
                let name = attr(e, "name");
                let source_ref = attr(e, "sourceRef").unwrap_or_default();
                let target_ref = attr(e, "targetRef").unwrap_or_default();
                process.sequence_flows.push(SequenceFlow { id, name, source_ref, target_ref });
            }
        }
        "startEvent" => push_flow_object(current_process, e, FlowObjectKind::StartEvent),
        "endEvent" => push_flow_object(current_process, e, FlowObjectKind::EndEvent),
        "task" | "userTask" | "receiveTask" | "manualTask" => {
            push_flow_object(current_process, e, FlowObjectKind::Task { is_wait_task: true })
        }
        "serviceTask" | "scriptTask" | "sendTask" => {
            push_flow_object(current_process, e, FlowObjectKind::Task { is_wait_task: false })
        }
        "callActivity" => {
            let called_element = attr(e, "calledElement").unwrap_or_default();
            let (namespace, name) = match called_element.split_once(':') {
                Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
                None => (None, called_element),
            };
            let location = attr(e, "location");
            push_flow_object(
                current_process,
                e,
                FlowObjectKind::CallActivity {
                    called_element_name: name,
                    called_element_namespace: namespace,
                    location,
                },
            );
        }
        "exclusiveGateway" => push_flow_object(current_process, e, FlowObjectKind::ExclusiveGateway),
        "parallelGateway" => push_flow_object(current_process, e, FlowObjectKind::ParallelGateway),
        "intermediateCatchEvent" => {
            let id = attr(e, "id").unwrap_or_default();
            let name = attr(e, "name").unwrap_or_else(|| id.clone());
            *pending_event = Some(FlowObject {
                id,
                name,
                kind: FlowObjectKind::IntermediateCatchEvent { is_timer_event: false },
            });
        }
        "boundaryEvent" => {
            let id = attr(e, "id").unwrap_or_default();
            let name = attr(e, "name").unwrap_or_else(|| id.clone());
            let attached_to_ref = attr(e, "attachedToRef").unwrap_or_default();
            *pending_event = Some(FlowObject {
                id,
                name,
                kind: FlowObjectKind::BoundaryEvent { attached_to_ref, is_timer_event: false },
            });
        }
        "timerEventDefinition" => {
            if let Some(fo) = pending_event {
                match &mut fo.kind {
                    FlowObjectKind::IntermediateCatchEvent { is_timer_event }
                    | FlowObjectKind::BoundaryEvent { is_timer_event, .. } => *is_timer_event = true,
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn push_flow_object(current_process: &mut Option<ProcessBuilder>, e: &BytesStart, kind: FlowObjectKind) {
    if let Some(process) = current_process {
        let id = attr(e, "id").unwrap_or_default();
        let name = attr(e, "name").unwrap_or_else(|| id.clone());
        process.flow_objects.push(FlowObject { id, name, kind });
    }
}

fn handle_end(
    local: &str,
    current_process: &mut Option<ProcessBuilder>,
    current_collab: &mut Option<CollabBuilder>,
    pending_event: &mut Option<FlowObject>,
    processes: &mut Vec<ProcessDefinition>,
    collaboration: &mut Option<CollaborationDefinition>,
) {
    match local {
        "process" => {
            if let Some(p) = current_process.take() {
                processes.push(ProcessDefinition::new(
                    p.id,
                    p.name,
                    p.flow_objects,
                    p.sequence_flows,
                    Vec::new(),
                    Vec::new(),
                ));
            }
        }
        "collaboration" => {
            if let Some(c) = current_collab.take() {
                collaboration.replace(CollaborationDefinition {
                    id: c.id,
                    participants: c.participants,
                    message_flows: c
                        .message_flows
                        .into_iter()
                        .map(|(id, source_ref, target_ref)| MessageFlow {
                            id,
                            source_ref,
                            target_ref,
                            source_process_definition_id: None,
                            target_process_definition_id: None,
                        })
                        .collect(),
                });
            }
        }
        "intermediateCatchEvent" | "boundaryEvent" => {
            if let Some(fo) = pending_event.take()
                && let Some(process) = current_process
            {
                process.flow_objects.push(fo);
            }
        }
        _ => {}
    }
}

/// Resolves each collaboration message flow's source/target process
/// definition id by finding which pool (directly, or via the flow object it
/// references) owns the endpoint, then copies the resolved flows onto each
/// owning process so `ProcessInstance::send_message` can look them up
/// locally.
fn resolve_message_flow_endpoints(defs: &mut Definitions) {
    let Some(collab) = &defs.collaboration else { return };

    let participant_process_of = |endpoint: &str| -> Option<String> {
        if let Some(participant) = collab.participants.iter().find(|p| p.process_ref == endpoint) {
            return Some(participant.process_ref.clone());
        }
        defs.processes
            .iter()
            .find(|p| p.flow_objects.iter().any(|fo| fo.id == endpoint))
            .map(|p| p.id.clone())
    };

    let resolved: Vec<MessageFlow> = collab
        .message_flows
        .iter()
        .map(|mf| MessageFlow {
            id: mf.id.clone(),
            source_ref: mf.source_ref.clone(),
            target_ref: mf.target_ref.clone(),
            source_process_definition_id: participant_process_of(&mf.source_ref),
            target_process_definition_id: participant_process_of(&mf.target_ref),
        })
        .collect();

    for process in &mut defs.processes {
        process.message_flows = resolved
            .iter()
            .filter(|mf| {
                mf.source_process_definition_id.as_deref() == Some(process.id.as_str())
                    || mf.target_process_definition_id.as_deref() == Some(process.id.as_str())
            })
            .cloned()
            .collect();
        process.collaborating_participants = collab.participants.clone();
    }

    defs.collaboration = Some(CollaborationDefinition {
        id: collab.id.clone(),
        participants: collab.participants.clone(),
        message_flows: resolved,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
    <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p1" name="p1">
        <startEvent id="start" name="start" />
        <task id="t1" name="TaskA" />
        <endEvent id="end" name="end" />
        <sequenceFlow id="f1" sourceRef="start" targetRef="t1" />
        <sequenceFlow id="f2" sourceRef="t1" targetRef="end" />
      </process>
    </definitions>
    "#;

    #[test]
    fn parses_linear_process() {
        let defs = parse(LINEAR).expect("parse ok");
        assert_eq!(defs.processes.len(), 1);
        let p = &defs.processes[0];
        assert_eq!(p.flow_objects.len(), 3);
        assert!(p.start_event_named("start").is_some());
        assert!(p.wait_task_named("TaskA").is_some());
    }

    const BAD_EXCLUSIVE: &str = r#"
    <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p1" name="p1">
        <startEvent id="start" name="start" />
        <exclusiveGateway id="gw" name="gw" />
        <endEvent id="e1" name="e1" />
        <endEvent id="e2" name="e2" />
        <sequenceFlow id="f1" sourceRef="start" targetRef="gw" />
        <sequenceFlow id="f2" sourceRef="gw" targetRef="e1" />
        <sequenceFlow id="f3" sourceRef="gw" targetRef="e2" />
      </process>
    </definitions>
    "#;

    #[test]
    fn unnamed_exclusive_branches_are_rejected() {
        let errors = parse(BAD_EXCLUSIVE).expect_err("should fail validation");
        assert!(errors.iter().any(|e| e.code == "EXCLUSIVE_FLOW_NAME"));
    }

    const TIMER_BOUNDARY: &str = r#"
    <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p1" name="p1">
        <startEvent id="start" name="start" />
        <userTask id="w" name="W" />
        <boundaryEvent id="b" name="timeout" attachedToRef="w">
          <timerEventDefinition />
        </boundaryEvent>
        <endEvent id="end" name="end" />
        <endEvent id="bend" name="bend" />
        <sequenceFlow id="f1" sourceRef="start" targetRef="w" />
        <sequenceFlow id="f2" sourceRef="w" targetRef="end" />
        <sequenceFlow id="f3" sourceRef="b" targetRef="bend" />
      </process>
    </definitions>
    "#;

    #[test]
    fn boundary_timer_event_is_recognized() {
        let defs = parse(TIMER_BOUNDARY).expect("parse ok");
        let p = &defs.processes[0];
        let boundaries = p.boundary_events_of("w");
        assert_eq!(boundaries.len(), 1);
        assert!(matches!(
            boundaries[0].kind,
            FlowObjectKind::BoundaryEvent { is_timer_event: true, .. }
        ));
    }
}
