//! # bpmn-engine
//!
//! A persisted, timer-driven BPMN 2.0 process execution engine. Parses a
//! BPMN 2.0 diagram into a [`definition::ProcessDefinition`], then runs one
//! or more live [`instance::ProcessInstance`]s against it, each its own
//! single-threaded token-flow machine driven by an internal event queue.
//!
//! - Wire up behavior with a [`handler::HandlerModule`] implementation; the
//!   flow graph itself comes entirely from the BPMN file.
//! - Call activities, boundary timers, message flows and gateways are all
//!   first-class token-flow operations, not bolt-ons.
//! - Persistence is pluggable via [`persistence::PersistenceStore`]; engine
//!   logic never assumes a particular backing store.
//! - An optional `server` feature exposes a REST façade over
//!   [`manager::ProcessManager`] ([`rest::router`]).
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bpmn_engine::{ManagerConfig, ProcessManager, MapHandlerModule};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     pretty_env_logger::init();
//!
//!     let manager = ProcessManager::new(ManagerConfig::default());
//!     let handler = Arc::new(
//!         MapHandlerModule::new().on_arrive("Count 1", |v| Ok(v)),
//!     );
//!     manager.add_bpmn(include_str!("../demos/order.bpmn"), handler).await?;
//!
//!     let instance = manager.create_process("order", "p-1").await?;
//!     instance.trigger_event("start", serde_json::Value::Null).await?;
//!     Ok(())
//! }
//! ```

pub mod definition;
pub mod error;
pub mod handler;
pub mod instance;
pub mod manager;
pub mod persistence;
#[cfg(feature = "server")]
pub mod rest;
pub mod state;
pub mod timer;

pub use definition::{
    CollaborationDefinition, Definitions, FlowObject, FlowObjectKind, MessageFlow, Participant,
    ProcessDefinition, SequenceFlow,
};
pub use error::{Error, Result, RuntimeError};
pub use handler::{HandlerModule, MapHandlerModule};
pub use instance::ProcessInstance;
pub use manager::{ManagerConfig, ProcessManager};
pub use persistence::{Document, MemoryStore, PersistenceStore};
pub use state::{ProcessHistory, ProcessState, Properties, Token, Views};
