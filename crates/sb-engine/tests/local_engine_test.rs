use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::header, http::StatusCode, routing::post, Json, Router};
use futures_util::StreamExt;
use sb_core::types::GenerationParams;
use sb_engine::{Engine, EngineError, GenerationRequest, LocalEngine};

type Captured = Arc<Mutex<Vec<serde_json::Value>>>;

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    body.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
    for d in deltas {
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": d}}]})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn start_fake_server(status: StatusCode) -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(captured): State<Captured>, Json(body): Json<serde_json::Value>| async move {
                    captured.lock().unwrap().push(body);
                    if status != StatusCode::OK {
                        return (status, [(header::CONTENT_TYPE, "text/plain")], "model not loaded".to_string());
                    }
                    (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        sse_body(&["The ", "answer ", "is 42."]),
                    )
                },
            ),
        )
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

#[tokio::test]
async fn streams_deltas_from_openai_compatible_server() {
    let (url, captured) = start_fake_server(StatusCode::OK).await;
    let engine = LocalEngine::new(url, "tiny", None, Duration::from_secs(5)).unwrap();

    let request = GenerationRequest::new("You are terse.", "question?").with_params(GenerationParams {
        temperature: Some(0.2),
        stop: Some(vec!["</s>".into()]),
        ..Default::default()
    });
    let stream = engine.stream(&request).await.unwrap();
    let deltas: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
    assert_eq!(deltas, vec!["The ", "answer ", "is 42."]);

    let bodies = captured.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["model"], "tiny");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "You are terse.");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["stop"][0], "</s>");
}

#[tokio::test]
async fn non_success_status_is_an_api_error() {
    let (url, _captured) = start_fake_server(StatusCode::SERVICE_UNAVAILABLE).await;
    let engine = LocalEngine::new(url, "tiny", None, Duration::from_secs(5)).unwrap();

    let err = match engine.stream(&GenerationRequest::new("", "hi")).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    match err {
        EngineError::Api { status, message } => {
            assert_eq!(status, 503);
            assert!(message.contains("model not loaded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_an_http_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let engine = LocalEngine::new(format!("http://{addr}"), "tiny", None, Duration::from_secs(2)).unwrap();
    let result = engine.stream(&GenerationRequest::new("", "hi")).await;
    assert!(matches!(result, Err(EngineError::Http(_)) | Err(EngineError::Timeout)));
}
