//! The process-instance runtime: the token-flow state machine described in
//! spec §4.1. One [`ProcessInstance`] owns one logical execution thread — a
//! `tokio::task` draining its own `mpsc` queue of [`events::InternalEvent`]s
//! — mirroring the teacher's single-pass `execute` loop but turned into an
//! explicit async state machine so instances can suspend on handler calls,
//! timers and persistence I/O without blocking their peers.

mod call_activity;
mod dispatch;
mod events;

pub use call_activity::{ByName, ByPath, DefinitionSource, HandlerSource};
pub use events::InternalEvent;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::definition::ProcessDefinition;
use crate::error::{Result, RuntimeError};
use crate::handler::HandlerModule;
use crate::persistence::{Document, PersistenceStore};
use crate::state::{ChildSnapshot, ProcessHistory, ProcessState, Properties, Views};
use crate::timer::PendingTimerEvents;

/// Non-owning link from a called (child) instance back to its parent, used
/// only to notify the parent when the call activity returns. Persistence
/// walks parent → child only; this is the other direction, and it is never
/// used to keep the parent alive.
pub(crate) struct ParentLink {
    pub instance: Weak<ProcessInstance>,
    pub call_activity_name: String,
}

/// The mutable part of an instance's state, held behind one lock so a single
/// event handler sees (and mutates) a consistent snapshot across its `.await`
/// points — the Rust rendering of "single logical execution thread".
pub(crate) struct Inner {
    pub properties: Properties,
    pub state: ProcessState,
    pub history: ProcessHistory,
    pub views: Views,
    pub timers: PendingTimerEvents,
    /// Open (unterminated) history-entry indices per flow object name,
    /// innermost first — supports a position holding several open entries at
    /// once (parallel-gateway arrivals).
    pub open_entries: HashMap<String, Vec<usize>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            properties: Properties::new(),
            state: ProcessState::default(),
            history: ProcessHistory::new(Utc::now()),
            views: Views::default(),
            timers: PendingTimerEvents::default(),
            open_entries: HashMap::new(),
        }
    }
}

/// Gate implementing spec §4.4's deferral protocol: while I/O is in flight,
/// events that would otherwise dispatch are stashed in FIFO order instead,
/// then replayed once the gate reopens.
#[derive(Default)]
pub(crate) struct DeferGate {
    deferring: AtomicBool,
    queue: StdMutex<VecDeque<InternalEvent>>,
}

impl DeferGate {
    fn begin(&self) {
        self.deferring.store(true, Ordering::SeqCst);
    }

    /// Reopens the gate and returns every event queued while it was shut, in
    /// enqueue order.
    fn end(&self) -> Vec<InternalEvent> {
        self.deferring.store(false, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    fn is_deferring(&self) -> bool {
        self.deferring.load(Ordering::SeqCst)
    }

    fn push(&self, event: InternalEvent) {
        self.queue.lock().unwrap().push_back(event);
    }
}

/// One running BPMN process instance.
pub struct ProcessInstance {
    pub process_id: String,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) handler: Arc<dyn HandlerModule>,
    pub(crate) store: Option<Arc<dyn PersistenceStore>>,
    pub(crate) definition_source: Arc<dyn DefinitionSource>,
    pub(crate) handler_source: Arc<dyn HandlerSource>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) self_handle: Weak<ProcessInstance>,
    pub(crate) participants: DashMap<String, Weak<ProcessInstance>>,
    pub(crate) called_processes: DashMap<String, Arc<ProcessInstance>>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) defer: DeferGate,
    pub(crate) tx: mpsc::UnboundedSender<InternalEvent>,
}

impl ProcessInstance {
    /// Spawns a fresh instance with empty state and starts its event loop.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        process_id: impl Into<String>,
        definition: Arc<ProcessDefinition>,
        handler: Arc<dyn HandlerModule>,
        store: Option<Arc<dyn PersistenceStore>>,
        definition_source: Arc<dyn DefinitionSource>,
        handler_source: Arc<dyn HandlerSource>,
        parent: Option<ParentLink>,
    ) -> Arc<Self> {
        Self::spawn_with_inner(
            process_id,
            definition,
            handler,
            store,
            definition_source,
            handler_source,
            parent,
            Inner::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn_with_inner(
        process_id: impl Into<String>,
        definition: Arc<ProcessDefinition>,
        handler: Arc<dyn HandlerModule>,
        store: Option<Arc<dyn PersistenceStore>>,
        definition_source: Arc<dyn DefinitionSource>,
        handler_source: Arc<dyn HandlerSource>,
        parent: Option<ParentLink>,
        inner: Inner,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = Arc::new_cyclic(|weak| ProcessInstance {
            process_id: process_id.into(),
            definition,
            handler,
            store,
            definition_source,
            handler_source,
            parent,
            self_handle: weak.clone(),
            participants: DashMap::new(),
            called_processes: DashMap::new(),
            inner: Mutex::new(inner),
            defer: DeferGate::default(),
            tx,
        });

        let loop_instance = instance.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                loop_instance.handle_event(event).await;
            }
        });

        instance
    }

    pub(crate) fn handle(&self) -> Arc<ProcessInstance> {
        self.self_handle
            .upgrade()
            .expect("instance always holds a strong reference to itself while its task is alive")
    }

    /// Appends to the dispatch queue, or to the defer queue if deferral is
    /// active. Never blocks: the channel is unbounded and the defer queue is
    /// a plain `Mutex`.
    pub(crate) fn emit(&self, event: InternalEvent) {
        if self.defer.is_deferring() {
            self.defer.push(event);
        } else {
            let _ = self.tx.send(event);
        }
    }

    pub(crate) fn begin_defer(&self) {
        self.defer.begin();
    }

    /// Reopens the gate and re-enqueues everything that piled up, preserving
    /// order — spec's "dispatched one-per-scheduler-tick".
    pub(crate) fn end_defer(&self) {
        for event in self.defer.end() {
            let _ = self.tx.send(event);
        }
    }

    pub async fn set_property(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.inner.lock().await;
        crate::state::set_dot_path(&mut inner.properties, &key.into(), value);
    }

    pub async fn get_property(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        crate::state::get_dot_path(&inner.properties, key)
    }

    pub async fn get_properties(&self) -> Properties {
        self.inner.lock().await.properties.clone()
    }

    pub async fn current_state(&self) -> ProcessState {
        self.inner.lock().await.state.clone()
    }

    pub async fn current_history(&self) -> ProcessHistory {
        self.inner.lock().await.history.clone()
    }

    pub async fn current_views(&self) -> Views {
        self.inner.lock().await.views.clone()
    }

    pub fn register_participant(&self, name: impl Into<String>, peer: &Arc<ProcessInstance>) {
        self.participants.insert(name.into(), Arc::downgrade(peer));
    }

    /// `triggerEvent` (spec §4.1). Resolves `name` against the definition in
    /// the exhaustive order the spec lists.
    pub async fn trigger_event(&self, name: &str, data: Value) -> Result<()> {
        if let Some(start) = self.definition.start_event_named(name) {
            let already = self.inner.lock().await.history.has_started(&start.name);
            if already {
                return Err(RuntimeError::AlreadyStarted(name.to_string()).into());
            }
            self.put_token_at(&start.clone(), data).await;
            return Ok(());
        }

        if let Some(catch) = self.definition.intermediate_catch_named(name) {
            let catch_name = catch.name.clone();
            let handle = self.handle();
            // Defers to the next scheduler tick so collaborating peers
            // observe a consistent published state (spec §5).
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                handle.emit(InternalEvent::IntermediateCatch { name: catch_name, data });
            });
            return Ok(());
        }

        if let Some(boundary) = self.definition.boundary_named(name) {
            self.emit(InternalEvent::BoundaryCatch { name: boundary.name.clone(), data });
            return Ok(());
        }

        if let Some(stripped) = name.strip_suffix("Done")
            && self.definition.wait_task_named(stripped).is_some()
        {
            self.task_done(stripped, data).await;
            return Ok(());
        }

        Err(RuntimeError::UnknownEvent(name.to_string()).into())
    }

    /// `taskDone` (spec §4.1).
    pub async fn task_done(&self, name: &str, data: Value) {
        self.emit(InternalEvent::ActivityEnd { name: name.to_string(), data });
    }

    /// `sendMessage` (spec §4.1). A bare string delegates to `triggerEvent`
    /// on self; otherwise resolves the message flow's target participant.
    pub async fn send_message_by_name(&self, event_name: &str, data: Value) -> Result<()> {
        self.trigger_event(event_name, data).await
    }

    pub async fn send_message_flow(&self, flow_id: &str, data: Value) -> Result<()> {
        let flow = self
            .definition
            .message_flows
            .iter()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| RuntimeError::NoTarget(flow_id.to_string()))?;
        let target_def_id = flow
            .target_process_definition_id
            .as_deref()
            .ok_or_else(|| RuntimeError::NoTarget(flow_id.to_string()))?;

        let target_name = self
            .participants
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .upgrade()
                    .is_some_and(|peer| peer.definition.id == target_def_id)
            })
            .map(|entry| entry.key().clone())
            .ok_or_else(|| RuntimeError::NoTarget(flow_id.to_string()))?;

        let peer = self
            .participants
            .get(&target_name)
            .and_then(|p| p.upgrade())
            .ok_or_else(|| RuntimeError::NoTarget(flow_id.to_string()))?;

        let target_flow_object = peer
            .definition
            .by_id(&flow.target_ref)
            .ok_or_else(|| RuntimeError::NoTarget(flow_id.to_string()))?;
        let target_name = target_flow_object.name.clone();
        peer.trigger_event(&target_name, data).await
    }

    /// Builds the persisted document for a main (root) instance, nesting
    /// every in-flight call activity's child state under its token.
    pub async fn to_document(&self) -> Document {
        let mut inner_guard = self.inner.lock().await;
        let mut state = inner_guard.state.clone();
        let mut history = inner_guard.history.clone();

        for token in state.tokens.iter_mut() {
            if let Some(called_id) = &token.called_process_id
                && let Some(child) = self.called_processes.get(called_id)
            {
                let snapshot = Box::pin(child.child_snapshot()).await;
                token.substate = Some(Box::new(snapshot));
            }
        }

        for (index, entry) in history.entries.iter_mut().enumerate() {
            if entry.subhistory.is_none()
                && let Some(token) = inner_guard.state.tokens.iter().find(|t| t.position == entry.name)
                && let Some(called_id) = &token.called_process_id
                && let Some(child) = self.called_processes.get(called_id)
            {
                let child_history = child.current_history().await;
                entry.subhistory = Some(Box::new(child_history));
            }
            let _ = index;
        }

        Document {
            process_name: self.definition.name.clone(),
            process_id: self.process_id.clone(),
            properties: inner_guard.properties.clone(),
            state,
            history,
            pending_timeouts: inner_guard.timers.snapshot(),
            views: inner_guard.views.clone(),
        }
    }

    async fn child_snapshot(&self) -> ChildSnapshot {
        let inner = self.inner.lock().await;
        ChildSnapshot {
            properties: inner.properties.clone(),
            state: inner.state.clone(),
            history: inner.history.clone(),
            pending_timeouts: inner.timers.snapshot(),
            views: inner.views.clone(),
        }
    }

    /// Restores a main instance from a persisted document: rehydrates state,
    /// history, properties and timers, recursively recreates child
    /// instances for every call-activity token, and reschedules every
    /// pending timer.
    #[allow(clippy::too_many_arguments)]
    pub async fn restore(
        process_id: impl Into<String>,
        definition: Arc<ProcessDefinition>,
        handler: Arc<dyn HandlerModule>,
        store: Option<Arc<dyn PersistenceStore>>,
        definition_source: Arc<dyn DefinitionSource>,
        handler_source: Arc<dyn HandlerSource>,
        document: Document,
    ) -> Result<Arc<Self>> {
        let mut inner = Inner::new();
        inner.properties = document.properties;
        inner.history = document.history;
        inner.views = document.views;
        inner.timers.restore_snapshot(document.pending_timeouts);

        let mut plain_tokens = Vec::with_capacity(document.state.tokens.len());
        let mut child_specs = Vec::new();
        for mut token in document.state.tokens {
            if let Some(substate) = token.substate.take() {
                child_specs.push((token.called_process_id.clone().unwrap_or_default(), *substate));
            }
            plain_tokens.push(token);
        }
        inner.state = ProcessState { tokens: plain_tokens };

        let instance = Self::spawn_with_inner(
            process_id,
            definition,
            handler,
            store,
            definition_source.clone(),
            handler_source.clone(),
            None,
            inner,
        );

        instance.reschedule_timers();

        for (called_process_id, snapshot) in child_specs {
            if let Some((_, call_activity_name)) = called_process_id.split_once("::") {
                let call_activity_name = call_activity_name.to_string();
                let Some(fo) = instance.definition.by_name(&call_activity_name) else {
                    log::warn!(
                        "restore: call activity '{call_activity_name}' no longer exists in \
                         definition '{}', dropping persisted child {called_process_id}",
                        instance.definition.name
                    );
                    continue;
                };
                let crate::definition::FlowObjectKind::CallActivity {
                    called_element_name,
                    location,
                    ..
                } = &fo.kind
                else {
                    log::warn!(
                        "restore: flow object '{call_activity_name}' in '{}' is no longer a call \
                         activity, dropping persisted child {called_process_id}",
                        instance.definition.name
                    );
                    continue;
                };
                let called_element_name = called_element_name.clone();
                let location = location.clone();

                match definition_source.resolve(&called_element_name, location.as_deref()).await {
                    Ok(child_def) => {
                        let child_handler = match handler_source.resolve(&child_def.name).await {
                            Ok(h) => h,
                            Err(e) => {
                                log::warn!(
                                    "restore: failed to resolve handler for called process \
                                     '{}' ({call_activity_name}): {e}",
                                    child_def.name
                                );
                                continue;
                            }
                        };
                        let child_inner = Inner {
                            properties: snapshot.properties,
                            state: snapshot.state,
                            history: snapshot.history,
                            views: snapshot.views,
                            timers: {
                                let mut timers = PendingTimerEvents::default();
                                timers.restore_snapshot(snapshot.pending_timeouts);
                                timers
                            },
                            open_entries: HashMap::new(),
                        };
                        let child = Self::spawn_with_inner(
                            called_process_id.clone(),
                            child_def,
                            child_handler,
                            None,
                            definition_source.clone(),
                            handler_source.clone(),
                            Some(ParentLink {
                                instance: Arc::downgrade(&instance),
                                call_activity_name,
                            }),
                            child_inner,
                        );
                        child.reschedule_timers();
                        instance.called_processes.insert(called_process_id, child);
                    }
                    Err(e) => {
                        log::warn!(
                            "restore: failed to resolve called element '{called_element_name}' \
                             for call activity '{call_activity_name}': {e}"
                        );
                    }
                }
            }
        }

        instance.handler.done_loading().await;
        Ok(instance)
    }

    fn reschedule_timers(&self) {
        let handle = self.handle();
        tokio::spawn(async move {
            let mut inner = handle.inner.lock().await;
            let mut timers = std::mem::take(&mut inner.timers);
            drop(inner);

            let fire_handle = handle.clone();
            timers.reschedule_all(move |name| {
                let handle = fire_handle.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    handle.fire_timer(&name).await;
                });
            });

            handle.inner.lock().await.timers = timers;
        });
    }
}
