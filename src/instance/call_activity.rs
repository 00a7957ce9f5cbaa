//! Call-activity entering/returning lifecycle (spec §4.1's `CallActivity`
//! variant) and the `location` resolution strategy spec §9's open question
//! leaves unspecified.
//!
//! The out-of-scope "handler module loader" is likewise abstracted behind
//! [`HandlerSource`] so a call activity's child can be handed a handler
//! module without this module reaching into the manager directly.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::definition::{FlowObject, FlowObjectKind, ProcessDefinition};
use crate::error::{Error, Result, RuntimeError};
use crate::handler::HandlerModule;
use crate::state::Token;

use super::{ParentLink, ProcessInstance};

#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn resolve(&self, called_element_name: &str, location: Option<&str>) -> Result<Arc<ProcessDefinition>>;
}

#[async_trait]
pub trait HandlerSource: Send + Sync {
    async fn resolve(&self, definition_name: &str) -> Result<Arc<dyn HandlerModule>>;
}

/// Resolves a call activity's `calledElementName` against a registry of
/// already-loaded definitions, ignoring `location` entirely. The default:
/// it composes with the process manager's own registry without any
/// filesystem coupling.
pub struct ByName {
    pub definitions: Arc<DashMap<String, Arc<ProcessDefinition>>>,
}

#[async_trait]
impl DefinitionSource for ByName {
    async fn resolve(&self, called_element_name: &str, _location: Option<&str>) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .get(called_element_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownDefinition(called_element_name.to_string()))
    }
}

/// Resolves the out-of-scope file-path loader: reads and parses a BPMN file
/// named by `location`, or `<base_dir>/<name>.bpmn` if `location` is unset.
pub struct ByPath {
    pub base_dir: PathBuf,
}

#[async_trait]
impl DefinitionSource for ByPath {
    async fn resolve(&self, called_element_name: &str, location: Option<&str>) -> Result<Arc<ProcessDefinition>> {
        let path = match location {
            Some(loc) => PathBuf::from(loc),
            None => self.base_dir.join(format!("{called_element_name}.bpmn")),
        };
        let xml = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Builder(format!("reading {}: {e}", path.display())))?;
        let definitions =
            crate::definition::parse(&xml).map_err(|errors| Error::Parse(errors.len(), errors))?;
        definitions
            .by_name(called_element_name)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| Error::UnknownDefinition(called_element_name.to_string()))
    }
}

/// Entering a call activity (spec §4.1): replace the plain arrival token
/// with a call-activity-tagged one, resolve and spawn the child, and
/// trigger its single start event.
pub(crate) async fn enter(instance: &ProcessInstance, fo: &FlowObject, data: Value) -> Result<()> {
    let FlowObjectKind::CallActivity { called_element_name, location, .. } = &fo.kind else {
        return Ok(());
    };

    let called_process_id = format!("{}::{}", instance.process_id, fo.name);

    {
        let mut inner = instance.inner.lock().await;
        inner.state.remove_one_at(&fo.name);
        inner.state.add(Token::call_activity(
            fo.name.clone(),
            instance.process_id.clone(),
            called_process_id.clone(),
        ));
    }

    let child_definition = instance
        .definition_source
        .resolve(called_element_name, location.as_deref())
        .await?;

    let start_events: Vec<&FlowObject> = child_definition
        .flow_objects
        .iter()
        .filter(|fo| fo.kind.is_start_event())
        .collect();
    if start_events.len() != 1 {
        return Err(RuntimeError::BadCalledProcess(fo.name.clone()).into());
    }
    let start_name = start_events[0].name.clone();

    let child_handler = instance.handler_source.resolve(&child_definition.name).await?;

    let child = ProcessInstance::spawn(
        called_process_id.clone(),
        child_definition,
        child_handler,
        None,
        instance.definition_source.clone(),
        instance.handler_source.clone(),
        Some(ParentLink {
            instance: instance.self_handle.clone(),
            call_activity_name: fo.name.clone(),
        }),
    );

    instance.called_processes.insert(called_process_id, child.clone());

    child.trigger_event(&start_name, data).await?;
    Ok(())
}

/// Returning from a call activity (spec §4.1): attach the finished child's
/// history as the call activity's `subhistory`, unregister it, and run the
/// default advance on the parent's call-activity flow object.
pub(crate) async fn return_from_call_activity(
    parent: &Arc<ProcessInstance>,
    child_process_id: &str,
    call_activity_name: &str,
    data: Value,
) {
    let Some(fo) = parent.definition.by_name(call_activity_name).cloned() else {
        return;
    };

    if let Some((_, child)) = parent.called_processes.remove(child_process_id) {
        let child_history = child.current_history().await;
        let mut inner = parent.inner.lock().await;
        if let Some(idx) = inner
            .open_entries
            .get(call_activity_name)
            .and_then(|entries| entries.last().copied())
            && let Some(entry) = inner.history.entries.get_mut(idx)
        {
            entry.subhistory = Some(Box::new(child_history));
        }
    }

    parent.emit_tokens(&fo, data, true).await;
}
