//! Scripted axum server for exercising the hub and blob clients.

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct CannedResponse {
    status: u16,
    body: String,
}

impl CannedResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::new(status, "")
    }
}

#[derive(Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Path and query as sent
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct Script {
    responses: VecDeque<CannedResponse>,
    requests: VecDeque<RecordedRequest>,
}

pub struct TestServer {
    addr: std::net::SocketAddr,
    script: Arc<Mutex<Script>>,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Oldest request not yet inspected.
    pub fn next_request(&self) -> RecordedRequest {
        self.script
            .lock()
            .requests
            .pop_front()
            .expect("no request recorded")
    }
}

async fn respond(
    State(script): State<Arc<Mutex<Script>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let mut script = script.lock();
    script.requests.push_back(RecordedRequest {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        body,
    });
    match script.responses.pop_front() {
        Some(canned) => (
            StatusCode::from_u16(canned.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            canned.body,
        ),
        None => (StatusCode::NOT_IMPLEMENTED, "no canned response left".to_string()),
    }
}

/// Answer every request, whatever its route, with the next canned response.
pub async fn serve(responses: Vec<CannedResponse>) -> TestServer {
    let script = Arc::new(Mutex::new(Script {
        responses: responses.into(),
        requests: VecDeque::new(),
    }));
    let app = axum::Router::new()
        .fallback(respond)
        .with_state(script.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, script }
}

/// An address nothing is listening on.
pub async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
