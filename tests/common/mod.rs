//! Throw-away worker hosts for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;

/// How a stub worker answers its status and download surfaces
#[derive(Clone)]
pub struct Stub {
    pub status_code: u16,
    pub status_body: String,
    pub status_delay: Duration,
    pub download_code: u16,
    pub download_body: String,
    pub download_delay: Duration,
    pub download_hits: Arc<AtomicUsize>,
    pub last_api_key: Arc<Mutex<Option<String>>>,
}

impl Stub {
    /// Online worker that downloads `filename` successfully
    pub fn online(filename: &str) -> Self {
        Stub {
            status_code: 200,
            status_body: r#"{"status": "online", "service": "civitai-downloader"}"#.to_string(),
            status_delay: Duration::ZERO,
            download_code: 200,
            download_body: serde_json::json!({
                "success": true,
                "message": "Model downloaded successfully",
                "filename": filename,
                "path": format!("models/Lora/{}", filename),
                "model_name": "Test Model",
                "version_name": "v1.0",
            })
            .to_string(),
            download_delay: Duration::ZERO,
            download_hits: Arc::new(AtomicUsize::new(0)),
            last_api_key: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing(code: u16, detail: &str) -> Self {
        Stub {
            download_code: code,
            download_body: serde_json::json!({ "detail": detail }).to_string(),
            ..Stub::online("unused.safetensors")
        }
    }

    pub fn with_status(mut self, code: u16, body: &str) -> Self {
        self.status_code = code;
        self.status_body = body.to_string();
        self
    }

    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn with_download_body(mut self, body: &str) -> Self {
        self.download_body = body.to_string();
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn hits(&self) -> usize {
        self.download_hits.load(Ordering::SeqCst)
    }

    pub fn last_api_key(&self) -> Option<String> {
        self.last_api_key.lock().unwrap().clone()
    }
}

async fn stub_status(State(stub): State<Stub>) -> (StatusCode, String) {
    tokio::time::sleep(stub.status_delay).await;
    (StatusCode::from_u16(stub.status_code).unwrap(), stub.status_body.clone())
}

async fn stub_download(
    State(stub): State<Stub>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, String) {
    stub.download_hits.fetch_add(1, Ordering::SeqCst);
    *stub.last_api_key.lock().unwrap() = body
        .get("api_key")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    tokio::time::sleep(stub.download_delay).await;
    (StatusCode::from_u16(stub.download_code).unwrap(), stub.download_body.clone())
}

/// Serve `stub` on an ephemeral port and return its base address
pub async fn spawn_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/civitai/status", get(stub_status))
        .route("/civitai/download", post(stub_download))
        .with_state(stub);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Address of a port nothing is listening on
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
