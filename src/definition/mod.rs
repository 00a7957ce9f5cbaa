pub mod index;
pub mod model;
pub mod parser;

pub use index::DefinitionIndex;
pub use model::{
    CollaborationDefinition, Definitions, FlowObject, FlowObjectKind, MessageFlow, Participant,
    ProcessDefinition, SequenceFlow,
};
pub use parser::parse;
