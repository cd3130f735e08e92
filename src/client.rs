use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::model::{DownloadOutcome, DownloadRequest, DownloadSuccess, Failure, HealthState};
use crate::registry::Endpoint;

pub const DEFAULT_STATUS_PATH: &str = "/civitai/status";
pub const DEFAULT_DOWNLOAD_PATH: &str = "/civitai/download";

/// Talks to the status and download surfaces of worker hosts.
///
/// Holds no per-call state; one instance is shared by every concurrent probe
/// and download in a fan-out.
#[derive(Clone)]
pub struct WorkerClient {
    client: Client,
    status_path: String,
    download_path: String,
}

#[derive(Serialize)]
struct DownloadBody<'a> {
    url: &'a str,
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Deserialize)]
struct DownloadBodyResponse {
    success: Option<bool>,
    message: Option<String>,
    filename: Option<String>,
    path: Option<String>,
    #[serde(alias = "modelName")]
    model_name: Option<String>,
    #[serde(alias = "versionName")]
    version_name: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
    message: Option<String>,
    error: Option<String>,
}

impl WorkerClient {
    pub fn new() -> Self {
        Self::with_paths(DEFAULT_STATUS_PATH, DEFAULT_DOWNLOAD_PATH)
    }

    pub fn with_paths(status_path: &str, download_path: &str) -> Self {
        WorkerClient {
            client: Client::new(),
            status_path: status_path.to_string(),
            download_path: download_path.to_string(),
        }
    }

    /// Single point-in-time liveness check. No retries.
    pub async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> HealthState {
        let url = endpoint.url_for(&self.status_path);

        let exchange = async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                tracing::debug!("Probe of {} failed: {}", endpoint.name, e);
                return HealthState::Unreachable;
            }
            Err(_) => {
                tracing::debug!("Probe of {} timed out after {:?}", endpoint.name, timeout);
                return HealthState::Unreachable;
            }
        };

        if !status.is_success() {
            tracing::debug!("Probe of {} answered {}", endpoint.name, status);
            return HealthState::Offline;
        }

        match serde_json::from_str::<StatusBody>(&body) {
            Ok(parsed) if is_online_status(&parsed.status) => HealthState::Online,
            _ => {
                tracing::debug!("Probe of {} returned an unrecognised body", endpoint.name);
                HealthState::Offline
            }
        }
    }

    /// Ask one worker to download the model. Never retried here.
    pub async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: &DownloadRequest,
        timeout: Duration,
    ) -> DownloadOutcome {
        let url = endpoint.url_for(&self.download_path);
        let body = DownloadBody {
            url: request.source_url(),
            api_key: request.credential(),
        };

        let exchange = async {
            let response = self.client.post(&url).json(&body).send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Failure::timeout().into(),
            Ok(Err(e)) => transport_failure(&e).into(),
            Ok(Ok((status, text))) => interpret_download_response(status, &text),
        }
    }
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn is_online_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "online" | "ready" | "ok"
    )
}

fn transport_failure(e: &reqwest::Error) -> Failure {
    if e.is_timeout() {
        Failure::timeout()
    } else if e.is_connect() {
        Failure::transport(format!("connection failed: {}", e))
    } else {
        Failure::transport(format!("request failed: {}", e))
    }
}

/// Map a worker reply onto an outcome. Non-2xx and explicit `success: false`
/// are application failures; a 2xx without the required fields is malformed.
fn interpret_download_response(status: StatusCode, text: &str) -> DownloadOutcome {
    let code = status.as_u16();

    if !status.is_success() {
        return Failure::application(code, error_message(status, text)).into();
    }

    let body: DownloadBodyResponse = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(e) => {
            return Failure::malformed(code, format!("response body is not valid JSON: {}", e)).into()
        }
    };

    if body.success == Some(false) {
        let message = body
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "download rejected by worker".to_string());
        return Failure::application(code, message).into();
    }

    let filename = match non_empty(body.filename) {
        Some(v) => v,
        None => return missing_field(code, "filename"),
    };
    let storage_path = match non_empty(body.path) {
        Some(v) => v,
        None => return missing_field(code, "path"),
    };
    let model_name = match body.model_name {
        Some(v) => v,
        None => return missing_field(code, "model_name"),
    };
    let version_name = match body.version_name {
        Some(v) => v,
        None => return missing_field(code, "version_name"),
    };

    DownloadOutcome::Success(DownloadSuccess {
        filename,
        storage_path,
        model_name,
        version_name,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn missing_field(code: u16, field: &str) -> DownloadOutcome {
    Failure::malformed(code, format!("response missing required field `{}`", field)).into()
}

fn error_message(status: StatusCode, text: &str) -> String {
    if let Ok(body) = serde_json::from_str::<ErrorBody>(text) {
        let detail = body.detail.and_then(|d| match d {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        if let Some(message) = detail.or(body.message).or(body.error) {
            if !message.trim().is_empty() {
                return message;
            }
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('{') {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}
