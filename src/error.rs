use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("BPMN definition has {0} parse error(s): {1:?}")]
    Parse(usize, Vec<ParseErrorItem>),

    #[error("missing handler implementations: {0}")]
    MissingImplementations(String),

    #[error("duplicate participant name {0} in collaboration")]
    DuplicateParticipant(String),

    #[error("duplicate process id {0} found while loading persisted data")]
    DuplicatePersistedId(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("persistence store error: {0}")]
    Store(String),

    #[error("definition {0} not found")]
    UnknownDefinition(String),

    #[error("process {0} not found")]
    UnknownProcess(String),

    #[error("{0}")]
    Builder(String),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised while dispatching internal events against a running instance.
///
/// All but [`RuntimeError::BadTimeout`] and [`RuntimeError::BadCalledProcess`]
/// are routed through `defaultEventHandler` and leave the instance running.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("unknown event {0}")]
    UnknownEvent(String),

    #[error("process already started at {0}")]
    AlreadyStarted(String),

    #[error("no token executing at {0}")]
    NotExecuting(String),

    #[error("message flow {0} has no target process definition id (pool not executable)")]
    NoTarget(String),

    #[error("call activity {0} must resolve to exactly one start event")]
    BadCalledProcess(String),

    #[error("timer event {0} did not return a finite timeout")]
    BadTimeout(String),
}

impl RuntimeError {
    /// Programming errors that are fatal to the owning instance rather than
    /// recoverable via `defaultEventHandler`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::BadTimeout(_) | RuntimeError::BadCalledProcess(_)
        )
    }
}

/// One entry in a definition parse error queue.
#[derive(Debug, Clone, Serialize)]
pub struct ParseErrorItem {
    pub code: &'static str,
    pub element: String,
    pub message: String,
}

impl ParseErrorItem {
    pub fn new(code: &'static str, element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            element: element.into(),
            message: message.into(),
        }
    }
}

// ConfigError-family requirement strings, kept next to the enum the way the
// teacher keeps its BpmnRequirement messages.
pub(crate) const UNIQUE_NAMES: &str = "flow object names must be unique within a process";
pub(crate) const BOUNDARY_NOT_ON_WAIT_TASK: &str =
    "boundary events may only attach to wait-tasks";
pub(crate) const END_EVENT_OUTGOING: &str = "end events must have no outgoing sequence flow";
pub(crate) const START_EVENT_INCOMING: &str = "start events must have no incoming sequence flow";
pub(crate) const START_EVENT_NO_OUTGOING: &str =
    "start events must have at least one outgoing sequence flow";
pub(crate) const END_EVENT_NO_INCOMING: &str =
    "end events must have at least one incoming sequence flow";
pub(crate) const GATEWAY_CARDINALITY: &str =
    "exclusive/parallel gateways require at least two incoming or outgoing sequence flows";
pub(crate) const EXCLUSIVE_FLOW_NAME: &str =
    "exclusive gateway outgoing sequence flows must be named";
