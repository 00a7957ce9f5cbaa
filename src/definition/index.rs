//! Lazily built lookup indices over a [`ProcessDefinition`], and the
//! parser-enforced invariants re-checked here at index build time.

use std::collections::{HashMap, HashSet};

use crate::error::{
    BOUNDARY_NOT_ON_WAIT_TASK, END_EVENT_NO_INCOMING, END_EVENT_OUTGOING, GATEWAY_CARDINALITY,
    EXCLUSIVE_FLOW_NAME, ParseErrorItem, START_EVENT_INCOMING, START_EVENT_NO_OUTGOING,
    UNIQUE_NAMES,
};

use super::model::{FlowObjectKind, ProcessDefinition};

#[derive(Debug, Default)]
pub struct DefinitionIndex {
    pub element_by_id: HashMap<String, usize>,
    pub seq_flow_by_source: HashMap<String, Vec<usize>>,
    pub seq_flow_by_target: HashMap<String, Vec<usize>>,
    pub msg_flow_by_source: HashMap<String, Vec<usize>>,
    pub msg_flow_by_target: HashMap<String, Vec<usize>>,
    pub boundary_events_by_attachment: HashMap<String, Vec<usize>>,
    pub name_to_id: HashMap<String, String>,
}

impl DefinitionIndex {
    pub fn build(def: &ProcessDefinition) -> Self {
        let mut index = DefinitionIndex::default();

        for (i, fo) in def.flow_objects.iter().enumerate() {
            index.element_by_id.insert(fo.id.clone(), i);
            index.name_to_id.insert(fo.name.clone(), fo.id.clone());
            if let FlowObjectKind::BoundaryEvent { attached_to_ref, .. } = &fo.kind {
                index
                    .boundary_events_by_attachment
                    .entry(attached_to_ref.clone())
                    .or_default()
                    .push(i);
            }
        }

        for (i, sf) in def.sequence_flows.iter().enumerate() {
            index
                .seq_flow_by_source
                .entry(sf.source_ref.clone())
                .or_default()
                .push(i);
            index
                .seq_flow_by_target
                .entry(sf.target_ref.clone())
                .or_default()
                .push(i);
        }

        for (i, mf) in def.message_flows.iter().enumerate() {
            index
                .msg_flow_by_source
                .entry(mf.source_ref.clone())
                .or_default()
                .push(i);
            index
                .msg_flow_by_target
                .entry(mf.target_ref.clone())
                .or_default()
                .push(i);
        }

        index
    }
}

/// Validates §3.1's invariants against a built definition, returning every
/// violation rather than stopping at the first one.
pub fn validate(def: &ProcessDefinition) -> Vec<ParseErrorItem> {
    let mut errors = Vec::new();
    let index = def.index();

    let mut seen_names = HashSet::new();
    for fo in &def.flow_objects {
        if !seen_names.insert(fo.name.clone()) {
            errors.push(ParseErrorItem::new(
                "DUPLICATE_NAME",
                fo.name.clone(),
                UNIQUE_NAMES,
            ));
        }
    }

    for fo in &def.flow_objects {
        let incoming = index.seq_flow_by_target.get(&fo.id).map(Vec::len).unwrap_or(0);
        let outgoing = index.seq_flow_by_source.get(&fo.id).map(Vec::len).unwrap_or(0);

        match &fo.kind {
            FlowObjectKind::StartEvent => {
                if incoming != 0 {
                    errors.push(ParseErrorItem::new("START_INCOMING", &fo.name, START_EVENT_INCOMING));
                }
                if outgoing == 0 {
                    errors.push(ParseErrorItem::new("START_NO_OUTGOING", &fo.name, START_EVENT_NO_OUTGOING));
                }
            }
            FlowObjectKind::EndEvent => {
                if outgoing != 0 {
                    errors.push(ParseErrorItem::new("END_OUTGOING", &fo.name, END_EVENT_OUTGOING));
                }
                if incoming == 0 {
                    errors.push(ParseErrorItem::new("END_NO_INCOMING", &fo.name, END_EVENT_NO_INCOMING));
                }
            }
            FlowObjectKind::ExclusiveGateway | FlowObjectKind::ParallelGateway => {
                if incoming < 2 && outgoing < 2 {
                    errors.push(ParseErrorItem::new("GATEWAY_CARDINALITY", &fo.name, GATEWAY_CARDINALITY));
                }
                if matches!(fo.kind, FlowObjectKind::ExclusiveGateway) && outgoing > 1 {
                    for flow in def.outgoing(&fo.id) {
                        if flow.name.as_deref().unwrap_or("").is_empty() {
                            errors.push(ParseErrorItem::new(
                                "EXCLUSIVE_FLOW_NAME",
                                &fo.name,
                                EXCLUSIVE_FLOW_NAME,
                            ));
                        }
                    }
                }
            }
            FlowObjectKind::BoundaryEvent { attached_to_ref, .. } => {
                if let Some(attached) = def.by_id(attached_to_ref)
                    && !attached.kind.is_wait_task()
                {
                    errors.push(ParseErrorItem::new(
                        "BOUNDARY_NOT_ON_WAIT_TASK",
                        &fo.name,
                        BOUNDARY_NOT_ON_WAIT_TASK,
                    ));
                }
            }
            _ => {}
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::model::{FlowObject, SequenceFlow};

    fn flow(id: &str, name: &str, kind: FlowObjectKind) -> FlowObject {
        FlowObject { id: id.into(), name: name.into(), kind }
    }

    fn seq(id: &str, source: &str, target: &str) -> SequenceFlow {
        SequenceFlow { id: id.into(), name: None, source_ref: source.into(), target_ref: target.into() }
    }

    #[test]
    fn start_event_with_incoming_flow_is_invalid() {
        let def = ProcessDefinition::new(
            "p1",
            "p1",
            vec![
                flow("s", "start", FlowObjectKind::StartEvent),
                flow("e", "end", FlowObjectKind::EndEvent),
            ],
            vec![seq("f1", "e", "s")],
            vec![],
            vec![],
        );
        let errors = validate(&def);
        assert!(errors.iter().any(|e| e.code == "START_INCOMING"));
    }

    #[test]
    fn valid_linear_process_has_no_errors() {
        let def = ProcessDefinition::new(
            "p1",
            "p1",
            vec![
                flow("s", "start", FlowObjectKind::StartEvent),
                flow("t", "TaskA", FlowObjectKind::Task { is_wait_task: true }),
                flow("e", "end", FlowObjectKind::EndEvent),
            ],
            vec![seq("f1", "s", "t"), seq("f2", "t", "e")],
            vec![],
            vec![],
        );
        assert!(validate(&def).is_empty());
    }
}
