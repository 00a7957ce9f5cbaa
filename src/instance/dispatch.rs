//! Event dispatch: `_emitTokens`/`_putTokenAt` (spec §4.1–4.3) and the
//! variant-specific advance behaviors.

use chrono::Utc;
use serde_json::Value;

use crate::definition::{FlowObject, FlowObjectKind, SequenceFlow};
use crate::error::{Error, RuntimeError};
use crate::state::{EventView, Token};

use super::call_activity;
use super::events::InternalEvent;
use super::ProcessInstance;

impl ProcessInstance {
    pub(crate) async fn handle_event(&self, event: InternalEvent) {
        match event {
            InternalEvent::TokenArrived { name, data } => self.on_token_arrived(&name, data).await,
            InternalEvent::ActivityEnd { name, data } => self.on_activity_end(&name, data).await,
            InternalEvent::IntermediateCatch { name, data } => self.on_intermediate_catch(&name, data).await,
            InternalEvent::BoundaryCatch { name, data } => self.on_boundary_catch(&name, data).await,
        }
    }

    /// `TOKEN_ARRIVED` (spec §4.1). Intermediate-catch events (timer or not)
    /// stop here and wait: a timer schedules its own wake, a plain catch
    /// waits for an external `triggerEvent`. Everything else runs the
    /// arrival handler and either stops (wait-task), delegates (call
    /// activity) or advances (`_emitTokens`).
    async fn on_token_arrived(&self, name: &str, data: Value) {
        let Some(fo) = self.definition.by_name(name).cloned() else {
            self.handler
                .default_event_handler("TOKEN_ARRIVED", name, "unknown flow object")
                .await;
            return;
        };

        if let FlowObjectKind::IntermediateCatchEvent { is_timer_event } = fo.kind {
            if is_timer_event {
                self.schedule_intermediate_timer(&fo).await;
            }
            return;
        }

        let result = self.handler.on_arrive(&fo.name, data).await;
        let data = match result {
            Ok(v) => v,
            Err(e) => {
                self.route_error(e).await;
                return;
            }
        };

        if fo.kind.is_wait_task() {
            self.register_boundary_timers(&fo).await;
            self.persist_checkpoint().await;
            return;
        }

        if fo.kind.is_call_activity() {
            self.register_boundary_timers(&fo).await;
            if let Err(e) = call_activity::enter(self, &fo, data).await {
                self.route_error(e).await;
            }
            return;
        }

        self.emit_tokens(&fo, data, false).await;
    }

    /// `ACTIVITY_END` (spec §4.1).
    async fn on_activity_end(&self, name: &str, data: Value) {
        let has_token = { self.inner.lock().await.state.has_token_at(name) };
        if !has_token {
            self.handler
                .default_event_handler("ACTIVITY_END", name, "no token executing at this position")
                .await;
            return;
        }

        let result = self.handler.on_task_done(name, data).await;
        let data = match result {
            Ok(v) => v,
            Err(e) => {
                self.route_error(e).await;
                return;
            }
        };

        let Some(fo) = self.definition.by_name(name).cloned() else {
            return;
        };
        self.emit_tokens(&fo, data, true).await;
    }

    /// `INTERMEDIATE_CATCH` (spec §4.1/§4.3).
    async fn on_intermediate_catch(&self, name: &str, data: Value) {
        let has_token = { self.inner.lock().await.state.has_token_at(name) };
        if !has_token {
            self.handler
                .default_event_handler("INTERMEDIATE_CATCH", name, "no token executing at this position")
                .await;
            return;
        }

        let result = self.handler.on_arrive(name, data).await;
        let data = match result {
            Ok(v) => v,
            Err(e) => {
                self.route_error(e).await;
                return;
            }
        };

        let Some(fo) = self.definition.by_name(name).cloned() else {
            return;
        };
        self.emit_tokens(&fo, data, false).await;
    }

    /// `BOUNDARY_CATCH` (spec §4.1).
    async fn on_boundary_catch(&self, name: &str, data: Value) {
        let Some(boundary) = self.definition.by_name(name).cloned() else {
            self.handler
                .default_event_handler("BOUNDARY_CATCH", name, "unknown boundary event")
                .await;
            return;
        };
        let FlowObjectKind::BoundaryEvent { attached_to_ref, .. } = &boundary.kind else {
            return;
        };
        let Some(attached) = self.definition.by_id(attached_to_ref).cloned() else {
            return;
        };

        let removed = {
            let mut inner = self.inner.lock().await;
            inner.state.remove_one_at(&attached.name)
        };
        if removed.is_none() {
            self.handler
                .default_event_handler("BOUNDARY_CATCH", name, "no token on attached activity")
                .await;
            return;
        }

        self.put_token_at(&boundary, data).await;
    }

    /// `_putTokenAt` (spec §4.2).
    pub(crate) async fn put_token_at(&self, fo: &FlowObject, data: Value) {
        let begin_at = Utc::now();
        let is_start = fo.kind.is_start_event();
        {
            let mut inner = self.inner.lock().await;
            inner.state.add(Token::new(fo.name.clone(), self.process_id.clone()));
            let idx = inner.history.begin(fo.name.clone(), fo.kind.as_str(), begin_at);
            inner.open_entries.entry(fo.name.clone()).or_default().push(idx);
            if is_start {
                inner.views.start_event = Some(EventView { name: fo.name.clone() });
            }
        }
        self.handler.on_begin(&fo.name, &data).await;
        self.emit(InternalEvent::TokenArrived { name: fo.name.clone(), data });
    }

    async fn complete_entry(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner.open_entries.get_mut(name).and_then(|v| v.pop()) {
            inner.history.end(idx, Utc::now());
        }
    }

    /// `_emitTokens` (spec §4.1), the universal advance primitive.
    pub(crate) async fn emit_tokens(&self, fo: &FlowObject, data: Value, returning_from_called_process: bool) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.remove_one_at(&fo.name);
        }

        if let FlowObjectKind::BoundaryEvent { attached_to_ref, .. } = &fo.kind
            && let Some(attached) = self.definition.by_id(attached_to_ref).cloned()
        {
            {
                let mut inner = self.inner.lock().await;
                inner.state.remove_all_at(&attached.name);
                for sibling in self.definition.boundary_events_of(attached_to_ref) {
                    inner.timers.clear(&sibling.name);
                }
            }
            self.complete_entry(&attached.name).await;
            self.handler.on_end(&attached.name, &data).await;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.timers.clear(&fo.name);
        }

        match &fo.kind {
            FlowObjectKind::ExclusiveGateway => self.advance_exclusive(fo, data).await,
            FlowObjectKind::ParallelGateway => self.advance_parallel(fo, data).await,
            FlowObjectKind::EndEvent => self.advance_end_event(fo, data).await,
            _ => self.advance_default(fo, data, returning_from_called_process).await,
        }
    }

    /// Default (task / catch event / boundary event / returning call
    /// activity): close the flow object's history entry, fire its end
    /// handler, then place a token on every outgoing flow's target.
    async fn advance_default(&self, fo: &FlowObject, data: Value, _returning_from_called_process: bool) {
        self.complete_entry(&fo.name).await;
        self.handler.on_end(&fo.name, &data).await;

        let outgoing: Vec<SequenceFlow> = self.definition.outgoing(&fo.id).into_iter().cloned().collect();
        for flow in outgoing {
            if let Some(target) = self.definition.target_of(&flow).cloned() {
                self.put_token_at(&target, data.clone()).await;
            }
        }
    }

    async fn advance_exclusive(&self, fo: &FlowObject, data: Value) {
        let outs: Vec<SequenceFlow> = self.definition.outgoing(&fo.id).into_iter().cloned().collect();

        if outs.len() == 1 {
            if let Some(target) = self.definition.target_of(&outs[0]).cloned() {
                self.put_token_at(&target, data).await;
            }
            return;
        }

        for flow in &outs {
            let flow_name = flow.name.clone().unwrap_or_default();
            let truthy = self
                .handler
                .exclusive_branch(&fo.name, &flow_name, data.clone())
                .await
                .unwrap_or(false);
            if truthy {
                if let Some(target) = self.definition.target_of(flow).cloned() {
                    self.put_token_at(&target, data).await;
                }
                return;
            }
        }

        log::warn!(
            "exclusive gateway {} had no truthy branch; instance quiesces at this position",
            fo.name
        );
    }

    async fn advance_parallel(&self, fo: &FlowObject, data: Value) {
        let incoming_count = self.definition.incoming(&fo.id).len();
        let count_now = {
            let mut inner = self.inner.lock().await;
            inner.state.add(Token::new(fo.name.clone(), self.process_id.clone()));
            inner.state.count_at(&fo.name)
        };

        if count_now < incoming_count {
            self.persist_checkpoint().await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state.remove_all_at(&fo.name);
        }

        let outgoing: Vec<SequenceFlow> = self.definition.outgoing(&fo.id).into_iter().cloned().collect();
        for flow in outgoing {
            if let Some(target) = self.definition.target_of(&flow).cloned() {
                self.put_token_at(&target, data.clone()).await;
            }
        }
    }

    async fn advance_end_event(&self, fo: &FlowObject, data: Value) {
        {
            let mut inner = self.inner.lock().await;
            inner.views.end_event = Some(EventView { name: fo.name.clone() });
        }
        self.complete_entry(&fo.name).await;
        self.handler.on_end(&fo.name, &data).await;

        if let Some(parent) = &self.parent
            && let Some(parent_instance) = parent.instance.upgrade()
        {
            call_activity::return_from_call_activity(&parent_instance, &self.process_id, &parent.call_activity_name, data).await;
            return;
        }

        self.on_process_end().await;
    }

    async fn on_process_end(&self) {
        {
            let mut inner = self.inner.lock().await;
            let created_at = inner.history.created_at;
            let now = Utc::now();
            inner.history.finish(now);
            inner.views.duration = Some((now - created_at).num_milliseconds());
        }
        self.persist_final().await;
    }

    async fn schedule_intermediate_timer(&self, fo: &FlowObject) {
        let timeout_ms = match self.handler.get_timeout(&fo.name).await {
            Ok(ms) if ms.is_finite() => ms as i64,
            _ => {
                self.route_error(RuntimeError::BadTimeout(fo.name.clone()).into()).await;
                return;
            }
        };
        let name = fo.name.clone();
        let fire_name = name.clone();
        let handle = self.handle();
        let mut inner = self.inner.lock().await;
        inner.timers.schedule(name, timeout_ms, move || {
            tokio::spawn(async move {
                handle.fire_timer(&fire_name).await;
            });
        });
    }

    pub(crate) async fn register_boundary_timers(&self, fo: &FlowObject) {
        let boundaries: Vec<FlowObject> = self.definition.boundary_events_of(&fo.id).into_iter().cloned().collect();
        for boundary in boundaries {
            let FlowObjectKind::BoundaryEvent { is_timer_event, .. } = &boundary.kind else {
                continue;
            };
            if !is_timer_event {
                continue;
            }
            let timeout_ms = match self.handler.get_timeout(&boundary.name).await {
                Ok(ms) if ms.is_finite() => ms as i64,
                _ => {
                    self.route_error(RuntimeError::BadTimeout(boundary.name.clone()).into()).await;
                    continue;
                }
            };
            let fire_name = boundary.name.clone();
            let handle = self.handle();
            let mut inner = self.inner.lock().await;
            inner.timers.schedule(boundary.name.clone(), timeout_ms, move || {
                tokio::spawn(async move {
                    handle.fire_timer(&fire_name).await;
                });
            });
        }
    }

    /// Invoked from a fired timer task: routes back onto the instance's own
    /// queue as the internal event the timer was standing in for.
    pub(crate) async fn fire_timer(&self, name: &str) {
        let Some(fo) = self.definition.by_name(name).cloned() else {
            return;
        };
        match &fo.kind {
            FlowObjectKind::IntermediateCatchEvent { is_timer_event: true } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.timers.clear(name);
                }
                self.emit(InternalEvent::IntermediateCatch { name: name.to_string(), data: Value::Null });
            }
            FlowObjectKind::BoundaryEvent { is_timer_event: true, .. } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.timers.clear(name);
                }
                self.emit(InternalEvent::BoundaryCatch { name: name.to_string(), data: Value::Null });
            }
            _ => {}
        }
    }

    /// Walks up non-owning parent links to the root (main) instance — only
    /// the root is ever persisted (spec §4.4: "children are nested").
    fn root_instance(&self) -> std::sync::Arc<ProcessInstance> {
        let mut current = self.handle();
        loop {
            let parent = current.parent.as_ref().and_then(|p| p.instance.upgrade());
            match parent {
                Some(p) => current = p,
                None => return current,
            }
        }
    }

    pub(crate) async fn persist_checkpoint(&self) {
        self.root_instance().persist_now().await;
    }

    async fn persist_now(&self) {
        let Some(store) = self.store.clone() else { return };
        self.begin_defer();
        let document = self.to_document().await;
        if let Err(e) = store.persist(document).await {
            log::error!("persist failed for {}: {e}", self.process_id);
        }
        self.handler.done_saving().await;
        self.end_defer();
    }

    async fn persist_final(&self) {
        self.persist_now().await;
        if let Some(store) = &self.store {
            let _ = store.close().await;
        }
    }

    pub(crate) async fn route_error(&self, err: Error) {
        if let Error::Runtime(rt) = &err {
            if rt.is_fatal() {
                self.handler.default_error_handler(&err).await;
            } else {
                self.handler.default_event_handler("RUNTIME_ERROR", "", &rt.to_string()).await;
            }
        } else {
            self.handler.default_error_handler(&err).await;
        }
    }
}
