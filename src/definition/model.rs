//! The immutable definition graph: `ProcessDefinition`, the `FlowObject`
//! tagged variant, sequence/message flows and participants.
//!
//! Ported from the teacher's prototype-chain flow-object hierarchy
//! (`FlowObject` → `Activity` → `Task`/`CallActivity`, `FlowObject` →
//! `EndEvent`, `FlowObject` → `Gateway` variants) into one tagged enum with a
//! common `{id, name}` header, per spec.md §9's explicit redesign note.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::index::DefinitionIndex;

/// The tag that determines a flow object's execution semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowObjectKind {
    StartEvent,
    EndEvent,
    /// `task`/`userTask`/`receiveTask`/`manualTask` (`is_wait_task = true`) or
    /// `serviceTask`/`scriptTask`/`sendTask` (`is_wait_task = false`).
    Task { is_wait_task: bool },
    CallActivity {
        called_element_name: String,
        called_element_namespace: Option<String>,
        location: Option<String>,
    },
    IntermediateCatchEvent { is_timer_event: bool },
    BoundaryEvent {
        attached_to_ref: String,
        is_timer_event: bool,
    },
    ExclusiveGateway,
    ParallelGateway,
}

impl FlowObjectKind {
    pub fn is_wait_task(&self) -> bool {
        matches!(self, FlowObjectKind::Task { is_wait_task: true })
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, FlowObjectKind::ExclusiveGateway | FlowObjectKind::ParallelGateway)
    }

    pub fn is_start_event(&self) -> bool {
        matches!(self, FlowObjectKind::StartEvent)
    }

    pub fn is_end_event(&self) -> bool {
        matches!(self, FlowObjectKind::EndEvent)
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(self, FlowObjectKind::BoundaryEvent { .. })
    }

    pub fn is_intermediate_catch_event(&self) -> bool {
        matches!(self, FlowObjectKind::IntermediateCatchEvent { .. })
    }

    pub fn is_call_activity(&self) -> bool {
        matches!(self, FlowObjectKind::CallActivity { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowObjectKind::StartEvent => "startEvent",
            FlowObjectKind::EndEvent => "endEvent",
            FlowObjectKind::Task { .. } => "task",
            FlowObjectKind::CallActivity { .. } => "callActivity",
            FlowObjectKind::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            FlowObjectKind::BoundaryEvent { .. } => "boundaryEvent",
            FlowObjectKind::ExclusiveGateway => "exclusiveGateway",
            FlowObjectKind::ParallelGateway => "parallelGateway",
        }
    }
}

/// Any BPMN node participating in control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowObject {
    pub id: String,
    pub name: String,
    pub kind: FlowObjectKind,
}

/// Internal control flow between two flow objects of the same process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub name: Option<String>,
    pub source_ref: String,
    pub target_ref: String,
}

/// Inter-process message wire between two pools in a collaboration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub source_process_definition_id: Option<String>,
    pub target_process_definition_id: Option<String>,
}

/// A pool in a collaboration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub process_ref: String,
}

/// A collaboration: a named set of participants linked by message flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationDefinition {
    pub id: String,
    pub participants: Vec<Participant>,
    pub message_flows: Vec<MessageFlow>,
}

/// An immutable, parsed process definition with lazily built lookup indices.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub flow_objects: Vec<FlowObject>,
    pub sequence_flows: Vec<SequenceFlow>,
    pub message_flows: Vec<MessageFlow>,
    pub collaborating_participants: Vec<Participant>,
    #[serde(skip)]
    index: OnceLock<DefinitionIndex>,
}

impl Clone for ProcessDefinition {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            flow_objects: self.flow_objects.clone(),
            sequence_flows: self.sequence_flows.clone(),
            message_flows: self.message_flows.clone(),
            collaborating_participants: self.collaborating_participants.clone(),
            index: OnceLock::new(),
        }
    }
}

impl ProcessDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        flow_objects: Vec<FlowObject>,
        sequence_flows: Vec<SequenceFlow>,
        message_flows: Vec<MessageFlow>,
        collaborating_participants: Vec<Participant>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            flow_objects,
            sequence_flows,
            message_flows,
            collaborating_participants,
            index: OnceLock::new(),
        }
    }

    pub fn index(&self) -> &DefinitionIndex {
        self.index.get_or_init(|| DefinitionIndex::build(self))
    }

    pub fn by_id(&self, id: &str) -> Option<&FlowObject> {
        self.index().element_by_id.get(id).map(|&i| &self.flow_objects[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&FlowObject> {
        self.index()
            .name_to_id
            .get(name)
            .and_then(|id| self.by_id(id))
    }

    pub fn start_event_named(&self, name: &str) -> Option<&FlowObject> {
        self.by_name(name).filter(|fo| fo.kind.is_start_event())
    }

    pub fn intermediate_catch_named(&self, name: &str) -> Option<&FlowObject> {
        self.by_name(name).filter(|fo| fo.kind.is_intermediate_catch_event())
    }

    pub fn boundary_named(&self, name: &str) -> Option<&FlowObject> {
        self.by_name(name).filter(|fo| fo.kind.is_boundary_event())
    }

    pub fn wait_task_named(&self, name: &str) -> Option<&FlowObject> {
        self.by_name(name).filter(|fo| fo.kind.is_wait_task())
    }

    pub fn outgoing(&self, flow_object_id: &str) -> Vec<&SequenceFlow> {
        self.index()
            .seq_flow_by_source
            .get(flow_object_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.sequence_flows[i])
            .collect()
    }

    pub fn incoming(&self, flow_object_id: &str) -> Vec<&SequenceFlow> {
        self.index()
            .seq_flow_by_target
            .get(flow_object_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.sequence_flows[i])
            .collect()
    }

    pub fn boundary_events_of(&self, activity_id: &str) -> Vec<&FlowObject> {
        self.index()
            .boundary_events_by_attachment
            .get(activity_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.flow_objects[i])
            .collect()
    }

    pub fn target_of(&self, flow: &SequenceFlow) -> Option<&FlowObject> {
        self.by_id(&flow.target_ref)
    }

    pub fn message_flow_by_target_process(&self, process_definition_id: &str) -> Option<&MessageFlow> {
        self.message_flows
            .iter()
            .find(|mf| mf.target_process_definition_id.as_deref() == Some(process_definition_id))
    }
}

/// The output of parsing: every top-level process plus the optional
/// collaboration wiring them together.
#[derive(Debug, Default)]
pub struct Definitions {
    pub processes: Vec<ProcessDefinition>,
    pub collaboration: Option<CollaborationDefinition>,
}

impl Definitions {
    pub fn by_name(&self, name: &str) -> Option<&ProcessDefinition> {
        self.processes.iter().find(|p| p.name == name)
    }
}
