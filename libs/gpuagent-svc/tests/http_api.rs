// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Service-boundary tests: requests through the router against an agent on
//! the simulated backend.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use gpuagent::smi::sim::SimSmi;
use gpuagent::smi::SmiAdapter;
use gpuagent::{Agent, AgentConfig};
use gpuagent_svc::{router, AppState};
use tower::ServiceExt;

fn app(sim: SimSmi) -> (Router, Arc<Agent>) {
    let smi: Arc<dyn SmiAdapter> = Arc::new(sim);
    let agent = Arc::new(Agent::init(AgentConfig::fast(), smi).expect("agent init"));
    (router(AppState::new(agent.clone())), agent)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_gpu_count() {
    let (app, agent) = app(SimSmi::new(2));
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["healthy"], true);
    assert_eq!(json["num_gpus"], 2);
    agent.shutdown();
}

#[tokio::test]
async fn test_gpu_create_conflict_and_read() {
    let (app, agent) = app(SimSmi::new(1));
    let key = "1eff74a1-0000-1000-807e-1746627a9cd7";

    let response = app
        .clone()
        .oneshot(post_json("/api/gpu", serde_json::json!({ "key": key })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // duplicate create fails with ENTRY_EXISTS
    let response = app
        .clone()
        .oneshot(post_json("/api/gpu", serde_json::json!({ "key": key })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "ENTRY_EXISTS");

    let response = app
        .clone()
        .oneshot(get(&format!("/api/gpu/{key}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["spec"]["key"], key);
    agent.shutdown();
}

#[tokio::test]
async fn test_gpu_read_unknown_key_is_404() {
    let (app, agent) = app(SimSmi::new(1));
    let response = app
        .oneshot(get("/api/gpu/00000000-0000-0000-0000-000000000001"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "ENTRY_NOT_FOUND");
    agent.shutdown();
}

#[tokio::test]
async fn test_update_validation_rejects_overdrive() {
    let (app, agent) = app(SimSmi::new(1));
    let key = agent.gpu_read_all()[0].spec.key.to_string();

    let response = app
        .oneshot(put_json(
            &format!("/api/gpu/{key}"),
            serde_json::json!({ "key": key, "overdrive_level": 21 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_ARG");
    agent.shutdown();
}

#[tokio::test]
async fn test_delete_watched_gpu_conflicts() {
    let (app, agent) = app(SimSmi::new(1));
    let gpu_key = agent.gpu_read_all()[0].spec.key.to_string();
    let watch_key = "2eff74a1-0000-0000-807e-000000000001";

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/gpuwatch",
            serde_json::json!({
                "key": watch_key,
                "gpu": [gpu_key],
                "attrs": ["gpu_clock", "power_usage"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(delete(&format!("/api/gpu/{gpu_key}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "IN_USE");

    // drop the watch group, then the GPU delete goes through
    let response = app
        .clone()
        .oneshot(delete(&format!("/api/gpuwatch/{watch_key}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(delete(&format!("/api/gpu/{gpu_key}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    agent.shutdown();
}

#[tokio::test]
async fn test_watch_create_requires_known_gpus() {
    let (app, agent) = app(SimSmi::new(1));
    let response = app
        .oneshot(post_json(
            "/api/gpuwatch",
            serde_json::json!({
                "key": "2eff74a1-0000-0000-807e-000000000002",
                "gpu": ["00000000-0000-0000-0000-0000000000aa"],
                "attrs": ["gpu_clock"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    agent.shutdown();
}

#[tokio::test]
async fn test_bad_pages_are_bundled_by_sixteen() {
    let (app, agent) = app(SimSmi::new(1).with_bad_pages(35));
    let response = app.oneshot(get("/api/badpages")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let bundles = json.as_array().expect("array of bundles");
    assert_eq!(bundles.len(), 3);
    assert_eq!(bundles[0].as_array().unwrap().len(), 16);
    assert_eq!(bundles[1].as_array().unwrap().len(), 16);
    assert_eq!(bundles[2].as_array().unwrap().len(), 3);
    agent.shutdown();
}

#[tokio::test]
async fn test_event_generate_then_read() {
    let (app, agent) = app(SimSmi::new(1));
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events/generate",
            serde_json::json!({ "gpu_ids": [0], "events": ["ring_hang"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/events")).await.unwrap();
    let json = body_json(response).await;
    let events = json.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["id"], "ring_hang");
    agent.shutdown();
}

#[tokio::test]
async fn test_topology_lists_peers() {
    let (app, agent) = app(SimSmi::new(2));
    let response = app.oneshot(get("/api/topology")).await.unwrap();
    let json = body_json(response).await;
    let devices = json.as_array().unwrap();
    assert_eq!(devices.len(), 2);
    for device in devices {
        assert_eq!(device["peer_devices"].as_array().unwrap().len(), 1);
        assert_eq!(device["peer_devices"][0]["link_type"], "xgmi");
    }
    agent.shutdown();
}
