//! REST façade scenarios (spec §6), only compiled with `--features server`.

#![cfg(feature = "server")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bpmn_engine::rest::{router, MemoryIdempotencyStore};
use bpmn_engine::{ManagerConfig, MapHandlerModule, ProcessManager};
use tower::ServiceExt;

const LINEAR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p1" name="linear">
    <startEvent id="s" name="start"/>
    <serviceTask id="t" name="Compute"/>
    <endEvent id="e" name="end"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="t"/>
    <sequenceFlow id="f2" sourceRef="t" targetRef="e"/>
  </process>
</definitions>"#;

async fn test_app() -> axum::Router {
    let manager = ProcessManager::new(ManagerConfig::default());
    let handler = Arc::new(MapHandlerModule::new().on_arrive("Compute", |data| Ok(data)));
    manager.add_bpmn(LINEAR, handler).await.unwrap();
    router(manager, Arc::new(MemoryIdempotencyStore::default()))
}

#[tokio::test]
async fn create_and_start_returns_201_with_view() {
    let app = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/linear/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn message_delivery_is_idempotent() {
    let app = test_app().await;
    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/linear")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let body = axum::body::to_bytes(create.into_body(), usize::MAX).await.unwrap();
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let id = view["id"].as_str().unwrap().to_string();

    let uri = format!("/linear/{id}/start/msg-1");
    let first = app
        .clone()
        .oneshot(Request::builder().method("PUT").uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app
        .oneshot(Request::builder().method("PUT").uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
}
