//! The process manager (spec §4.5): owns every registered definition and
//! handler module, the live instance cache, and the query operations the
//! REST façade and embedders call through.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::definition::{self, ProcessDefinition};
use crate::error::{Error, Result};
use crate::handler::HandlerModule;
use crate::instance::{ByName, DefinitionSource, HandlerSource, ProcessInstance};
use crate::persistence::PersistenceStore;
use crate::state::get_dot_path;

/// Ambient configuration: store selection, the call-activity definition
/// resolution strategy, and the REST bind address.
#[derive(Default)]
pub struct ManagerConfig {
    pub store: Option<Arc<dyn PersistenceStore>>,
    pub definition_source: Option<Arc<dyn DefinitionSource>>,
    pub bind_addr: Option<SocketAddr>,
}

struct PendingLoad {
    name: String,
    definition: Arc<ProcessDefinition>,
    handler: Arc<dyn HandlerModule>,
}

/// Resolves a called process's handler module from the manager's own
/// registry, by definition name.
struct RegistryHandlerSource {
    handlers: Arc<DashMap<String, Arc<dyn HandlerModule>>>,
}

#[async_trait]
impl HandlerSource for RegistryHandlerSource {
    async fn resolve(&self, definition_name: &str) -> Result<Arc<dyn HandlerModule>> {
        self.handlers
            .get(definition_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::MissingImplementations(definition_name.to_string()))
    }
}

pub struct ProcessManager {
    definitions: Arc<DashMap<String, Arc<ProcessDefinition>>>,
    handlers: Arc<DashMap<String, Arc<dyn HandlerModule>>>,
    cache: DashMap<String, Arc<ProcessInstance>>,
    store: Option<Arc<dyn PersistenceStore>>,
    definition_source: Arc<dyn DefinitionSource>,
    handler_source: Arc<dyn HandlerSource>,
    queue: Mutex<VecDeque<PendingLoad>>,
    draining: AtomicBool,
    ready: Notify,
    bind_addr: Option<SocketAddr>,
}

impl ProcessManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let definitions: Arc<DashMap<String, Arc<ProcessDefinition>>> = Arc::new(DashMap::new());
        let handlers: Arc<DashMap<String, Arc<dyn HandlerModule>>> = Arc::new(DashMap::new());
        let definition_source = config.definition_source.unwrap_or_else(|| {
            Arc::new(ByName { definitions: definitions.clone() }) as Arc<dyn DefinitionSource>
        });
        let handler_source: Arc<dyn HandlerSource> =
            Arc::new(RegistryHandlerSource { handlers: handlers.clone() });
        let bind_addr = config.bind_addr;

        Arc::new(Self {
            definitions,
            handlers,
            cache: DashMap::new(),
            store: config.store,
            definition_source,
            handler_source,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            ready: Notify::new(),
            bind_addr,
        })
    }

    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.bind_addr
    }

    /// `addBpmn*` (spec §4.5): parses and validates `xml`, registers every
    /// process it contains against `handler`, queues it, and kicks off the
    /// drain (rehydrating persisted instances) if not already running.
    pub async fn add_bpmn(&self, xml: &str, handler: Arc<dyn HandlerModule>) -> Result<()> {
        let parsed = definition::parse(xml).map_err(|errors| Error::Parse(errors.len(), errors))?;
        for process in parsed.processes {
            let name = process.name.clone();
            let arc_def = Arc::new(process);
            self.definitions.insert(name.clone(), arc_def.clone());
            self.handlers.insert(name.clone(), handler.clone());
            self.queue.lock().await.push_back(PendingLoad {
                name,
                definition: arc_def,
                handler: handler.clone(),
            });
        }
        self.drain_queue().await;
        Ok(())
    }

    async fn drain_queue(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(pending) = next else { break };
            let Some(store) = &self.store else { continue };

            match store.load_all(&pending.name).await {
                Ok(documents) => {
                    if documents.is_empty() {
                        pending.handler.done_loading().await;
                    }
                    let mut seen = std::collections::HashSet::new();
                    for document in documents {
                        if !seen.insert(document.process_id.clone()) {
                            log::error!(
                                "duplicate persisted process id {} for {} — fatal to the load",
                                document.process_id,
                                pending.name
                            );
                            continue;
                        }
                        match ProcessInstance::restore(
                            document.process_id.clone(),
                            pending.definition.clone(),
                            pending.handler.clone(),
                            Some(store.clone()),
                            self.definition_source.clone(),
                            self.handler_source.clone(),
                            document,
                        )
                        .await
                        {
                            Ok(instance) => {
                                self.cache.insert(instance.process_id.clone(), instance);
                            }
                            Err(e) => log::error!("failed to restore a {} instance: {e}", pending.name),
                        }
                    }
                }
                Err(e) => log::error!("loadAll failed for {}: {e}", pending.name),
            }
        }

        self.draining.store(false, Ordering::SeqCst);
        self.ready.notify_waiters();
    }

    /// `afterInitialization` (spec §4.5): parks the caller until every
    /// queued definition has finished loading.
    pub async fn after_initialization(&self) {
        loop {
            if !self.draining.load(Ordering::SeqCst) && self.queue.lock().await.is_empty() {
                return;
            }
            self.ready.notified().await;
        }
    }

    /// `createProcess` for a single `{id, name}` descriptor.
    pub async fn create_process(&self, name: &str, id: impl Into<String>) -> Result<Arc<ProcessInstance>> {
        self.after_initialization().await;
        let id = id.into();
        if self.cache.contains_key(&id) {
            return Err(Error::DuplicatePersistedId(id));
        }

        let definition = self
            .definitions
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownDefinition(name.to_string()))?;
        let handler = self
            .handlers
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::MissingImplementations(name.to_string()))?;

        // Re-checked after building the definition/handler lookups to catch
        // a concurrent create racing the same id (spec §4.5).
        if self.cache.contains_key(&id) {
            return Err(Error::DuplicatePersistedId(id));
        }

        let instance = ProcessInstance::spawn(
            id.clone(),
            definition,
            handler,
            self.store.clone(),
            self.definition_source.clone(),
            self.handler_source.clone(),
            None,
        );
        self.cache.insert(id, instance.clone());
        Ok(instance)
    }

    /// `createProcess` for a collaborating set: every descriptor is
    /// instantiated, then peers are wired by participant name.
    pub async fn create_collaboration(
        &self,
        descriptors: Vec<(String, String)>,
    ) -> Result<Vec<Arc<ProcessInstance>>> {
        self.after_initialization().await;
        for (_, id) in &descriptors {
            if self.cache.contains_key(id) {
                return Err(Error::DuplicatePersistedId(id.clone()));
            }
        }

        let mut instances = Vec::with_capacity(descriptors.len());
        for (name, id) in &descriptors {
            if self.cache.contains_key(id) {
                return Err(Error::DuplicatePersistedId(id.clone()));
            }
            let definition = self
                .definitions
                .get(name)
                .map(|e| e.value().clone())
                .ok_or_else(|| Error::UnknownDefinition(name.clone()))?;
            let handler = self
                .handlers
                .get(name)
                .map(|e| e.value().clone())
                .ok_or_else(|| Error::MissingImplementations(name.clone()))?;
            let instance = ProcessInstance::spawn(
                id.clone(),
                definition,
                handler,
                self.store.clone(),
                self.definition_source.clone(),
                self.handler_source.clone(),
                None,
            );
            self.cache.insert(id.clone(), instance.clone());
            instances.push((name.clone(), instance));
        }

        for (name, instance) in &instances {
            for (peer_name, peer) in &instances {
                if peer_name != name {
                    instance.register_participant(peer_name.clone(), peer);
                }
            }
        }

        Ok(instances.into_iter().map(|(_, instance)| instance).collect())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessInstance>> {
        self.cache.get(id).map(|entry| entry.value().clone())
    }

    /// `findByState` (spec §4.5).
    pub async fn find_by_state(&self, flow_object_name: &str) -> Vec<Arc<ProcessInstance>> {
        let mut result = Vec::new();
        for entry in self.cache.iter() {
            let instance = entry.value();
            if instance.current_state().await.has_token_at(flow_object_name) {
                result.push(instance.clone());
            }
        }
        result
    }

    /// `findByName` (spec §4.5).
    pub fn find_by_name(&self, name: &str, case_sensitive: bool) -> Vec<Arc<ProcessInstance>> {
        self.cache
            .iter()
            .filter(|entry| {
                let instance_def_name = &entry.value().definition.name;
                if case_sensitive {
                    instance_def_name == name
                } else {
                    instance_def_name.eq_ignore_ascii_case(name)
                }
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// `findByProperty` (spec §4.5): AND over every key; dot-separated keys
    /// descend into nested objects; equality is strict.
    pub async fn find_by_property(&self, query: &[(String, Value)]) -> Vec<Arc<ProcessInstance>> {
        let mut result = Vec::new();
        for entry in self.cache.iter() {
            let instance = entry.value();
            let properties = instance.get_properties().await;
            let matches = query
                .iter()
                .all(|(key, expected)| get_dot_path(&properties, key).as_ref() == Some(expected));
            if matches {
                result.push(instance.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MapHandlerModule;

    const LINEAR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
      <process id="p1" name="order">
        <startEvent id="s" name="start"/>
        <task id="t" name="TaskA"/>
        <endEvent id="e" name="end"/>
        <sequenceFlow id="f1" sourceRef="s" targetRef="t"/>
        <sequenceFlow id="f2" sourceRef="t" targetRef="e"/>
      </process>
    </definitions>"#;

    #[tokio::test]
    async fn create_process_rejects_duplicate_ids() {
        let manager = ProcessManager::new(ManagerConfig::default());
        manager.add_bpmn(LINEAR, Arc::new(MapHandlerModule::new())).await.unwrap();
        manager.create_process("order", "p-1").await.unwrap();
        let err = manager.create_process("order", "p-1").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn find_by_name_is_case_insensitive_by_default() {
        let manager = ProcessManager::new(ManagerConfig::default());
        manager.add_bpmn(LINEAR, Arc::new(MapHandlerModule::new())).await.unwrap();
        manager.create_process("order", "p-1").await.unwrap();
        assert_eq!(manager.find_by_name("ORDER", false).len(), 1);
        assert_eq!(manager.find_by_name("ORDER", true).len(), 0);
    }
}
