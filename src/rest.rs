//! The REST façade (spec §6), feature-gated behind `server`. Thin `axum`
//! mapping onto [`crate::manager::ProcessManager`] operations, built on the
//! `axum`/`tower-http` stack the way an optional HTTP front end is bolted
//! onto a core library elsewhere in this pack.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::instance::ProcessInstance;
use crate::manager::ProcessManager;

/// Idempotency table for message delivery (spec §5/§6), re-architected from
/// the source's global `receivedMessageIds` singleton into an explicit,
/// injectable dependency.
pub trait IdempotencyStore: Send + Sync {
    /// Records `(process_name, id, message_name, message_id)` if unseen.
    /// Returns `true` on first sight, `false` if already recorded.
    fn record(&self, key: (String, String, String, String)) -> bool;
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    seen: DashMap<(String, String, String, String), ()>,
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn record(&self, key: (String, String, String, String)) -> bool {
        self.seen.insert(key, ()).is_none()
    }
}

#[derive(Clone)]
struct AppState {
    manager: Arc<ProcessManager>,
    idempotency: Arc<dyn IdempotencyStore>,
}

pub fn router(manager: Arc<ProcessManager>, idempotency: Arc<dyn IdempotencyStore>) -> Router {
    let state = AppState { manager, idempotency };
    Router::new()
        .route("/bpmnCollaborate", post(collaborate))
        .route("/{process_name}", post(create_process).get(list_instances))
        .route("/{process_name}/{start_event_name}", post(create_and_start))
        .route("/{process_name}/{id}", get(get_instance))
        .route(
            "/{process_name}/{id}/{message_name}/{message_id}",
            put(deliver_message),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Link {
    rel: &'static str,
    href: String,
}

#[derive(Serialize)]
struct InstanceView {
    id: String,
    name: String,
    link: Link,
    state: crate::state::ProcessState,
    history: crate::state::ProcessHistory,
    properties: crate::state::Properties,
}

async fn instance_view(instance: &Arc<ProcessInstance>) -> InstanceView {
    InstanceView {
        id: instance.process_id.clone(),
        name: instance.definition.name.clone(),
        link: Link {
            rel: "self",
            href: format!(
                "/{}/{}",
                urlencoding_escape(&instance.definition.name),
                urlencoding_escape(&instance.process_id)
            ),
        },
        state: instance.current_state().await,
        history: instance.current_history().await,
        properties: instance.get_properties().await,
    }
}

fn urlencoding_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<crate::error::ParseErrorItem>>,
}

fn error_response(err: Error) -> Response {
    let (status, body) = match err {
        Error::Parse(_, errors) => (
            StatusCode::BAD_REQUEST,
            ErrorBody { code: "BPMNParseError", message: "definition parse failed".into(), errors: Some(errors) },
        ),
        other => (
            StatusCode::BAD_REQUEST,
            ErrorBody { code: "BPMNExecutionError", message: other.to_string(), errors: None },
        ),
    };
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct CreateBody {
    #[serde(default)]
    properties: Option<Value>,
}

async fn create_process(
    State(state): State<AppState>,
    Path(process_name): Path<String>,
    body: Option<Json<CreateBody>>,
) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    match state.manager.create_process(&process_name, id).await {
        Ok(instance) => {
            if let Some(Json(CreateBody { properties: Some(Value::Object(props)) })) = body {
                for (k, v) in props {
                    instance.set_property(k, v).await;
                }
            }
            (StatusCode::CREATED, Json(instance_view(&instance).await)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn create_and_start(
    State(state): State<AppState>,
    Path((process_name, start_event_name)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let data = body.map(|Json(v)| v).unwrap_or(Value::Null);
    match state.manager.create_process(&process_name, id).await {
        Ok(instance) => {
            if let Err(e) = instance.trigger_event(&start_event_name, data).await {
                return error_response(e);
            }
            (StatusCode::CREATED, Json(instance_view(&instance).await)).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ProcessDescriptor {
    name: String,
    id: String,
    #[serde(rename = "startEventName")]
    start_event_name: Option<String>,
}

#[derive(Deserialize)]
struct CollaborateBody {
    #[serde(rename = "processDescriptors")]
    process_descriptors: Vec<ProcessDescriptor>,
}

async fn collaborate(State(state): State<AppState>, Json(body): Json<CollaborateBody>) -> Response {
    let descriptors: Vec<(String, String)> = body
        .process_descriptors
        .iter()
        .map(|d| (d.name.clone(), d.id.clone()))
        .collect();

    match state.manager.create_collaboration(descriptors).await {
        Ok(instances) => {
            for (descriptor, instance) in body.process_descriptors.iter().zip(instances.iter()) {
                if let Some(start_event_name) = &descriptor.start_event_name
                    && let Err(e) = instance.trigger_event(start_event_name, Value::Null).await
                {
                    return error_response(e);
                }
            }
            let mut views = Vec::with_capacity(instances.len());
            for instance in &instances {
                views.push(instance_view(instance).await);
            }
            (StatusCode::CREATED, Json(views)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_instance(State(state): State<AppState>, Path((_process_name, id)): Path<(String, String)>) -> Response {
    match state.manager.get(&id) {
        Some(instance) => (StatusCode::OK, Json(instance_view(&instance).await)).into_response(),
        None => error_response(Error::UnknownProcess(id)),
    }
}

async fn list_instances(
    State(state): State<AppState>,
    Path(process_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let instances = if let Some(flow_object_name) = query.get("state") {
        state
            .manager
            .find_by_state(flow_object_name)
            .await
            .into_iter()
            .filter(|i| i.definition.name == process_name)
            .collect::<Vec<_>>()
    } else if query.is_empty() {
        state.manager.find_by_name(&process_name, true)
    } else {
        let props: Vec<(String, Value)> = query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        state
            .manager
            .find_by_property(&props)
            .await
            .into_iter()
            .filter(|i| i.definition.name == process_name)
            .collect::<Vec<_>>()
    };

    let mut views = Vec::with_capacity(instances.len());
    for instance in &instances {
        views.push(instance_view(instance).await);
    }
    (StatusCode::OK, Json(views)).into_response()
}

async fn deliver_message(
    State(state): State<AppState>,
    Path((process_name, id, message_name, message_id)): Path<(String, String, String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let Some(instance) = state.manager.get(&id) else {
        return error_response(Error::UnknownProcess(id));
    };

    let key = (process_name, id, message_name.clone(), message_id);
    let first_delivery = state.idempotency.record(key);

    if !first_delivery {
        return (StatusCode::OK, Json(instance_view(&instance).await)).into_response();
    }

    let data = body.map(|Json(v)| v).unwrap_or(Value::Null);
    if let Err(e) = instance.trigger_event(&message_name, data).await {
        return error_response(e);
    }

    (StatusCode::CREATED, Json(instance_view(&instance).await)).into_response()
}

/// Binds and serves the router until the process is terminated. A thin
/// wrapper so embedders don't need to reach for `axum`/`tokio::net`
/// themselves.
pub async fn serve(manager: Arc<ProcessManager>, idempotency: Arc<dyn IdempotencyStore>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let app = router(manager, idempotency);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
