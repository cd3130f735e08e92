//! Value types passed between the coordinator and its callers

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// `...?modelVersionId=789`
static VERSION_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]modelVersionId=(\d+)").expect("Invalid version id regex"));

/// `.../models/123456[/slug]`
static MODEL_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/models/(\d+)(?:[/?#]|$)").expect("Invalid model id regex"));

pub const TIMEOUT_MESSAGE: &str = "timeout";
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Which catalog entry a source URL points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelRef {
    pub model_id: Option<u64>,
    pub version_id: Option<u64>,
}

impl ModelRef {
    pub fn parse(url: &str) -> Option<Self> {
        let version_id: Option<u64> = VERSION_ID_REGEX
            .captures(url)
            .and_then(|c| c[1].parse().ok());
        let model_id: Option<u64> = MODEL_ID_REGEX
            .captures(url)
            .and_then(|c| c[1].parse().ok());

        if model_id.is_none() && version_id.is_none() {
            None
        } else {
            Some(ModelRef { model_id, version_id })
        }
    }
}

/// A validated "download this catalog model" request
#[derive(Clone)]
pub struct DownloadRequest {
    source_url: String,
    credential: Option<String>,
    host: String,
    model_ref: ModelRef,
}

impl DownloadRequest {
    pub fn new(source_url: &str, credential: Option<&str>) -> Result<Self> {
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(FleetError::InvalidRequest("source URL must not be empty".to_string()));
        }

        let url = Url::parse(source_url).map_err(|e| {
            FleetError::InvalidRequest(format!("source URL '{}' is not valid: {}", source_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FleetError::InvalidRequest(format!(
                "unsupported source URL scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| FleetError::InvalidRequest("source URL has no host".to_string()))?
            .to_ascii_lowercase();

        let model_ref = ModelRef::parse(source_url).ok_or_else(|| {
            FleetError::InvalidRequest(format!(
                "could not extract a model id from '{}'",
                source_url
            ))
        })?;

        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(DownloadRequest {
            source_url: source_url.to_string(),
            credential,
            host,
            model_ref,
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn model_ref(&self) -> ModelRef {
        self.model_ref
    }

    /// Fill in the credential only when the caller did not supply one
    pub fn with_default_credential(mut self, default: Option<&str>) -> Self {
        if self.credential.is_none() {
            self.credential = default
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
        }
        self
    }

    /// True if the source host equals one of `allowed` or is a subdomain of
    /// one. An empty allow-list accepts every host.
    pub fn host_allowed(&self, allowed: &[String]) -> bool {
        allowed.is_empty()
            || allowed.iter().any(|a| {
                let a = a.trim().to_ascii_lowercase();
                self.host == a || self.host.ends_with(&format!(".{}", a))
            })
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("source_url", &self.source_url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("model_ref", &self.model_ref)
            .finish()
    }
}

/// Liveness of one endpoint at the instant it was probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Online,
    /// Answered, but not with a well-formed online response
    Offline,
    /// Could not be reached at all
    Unreachable,
}

impl HealthState {
    pub fn is_online(&self) -> bool {
        matches!(self, HealthState::Online)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub address: String,
    pub state: HealthState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSuccess {
    pub filename: String,
    pub storage_path: String,
    pub model_name: String,
    pub version_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unreachable host, connection reset, timeout
    Transport,
    /// The worker answered and refused or failed the download
    Application,
    /// The worker claimed success but the body was unusable
    Malformed,
    /// Abandoned by cancellation or the fleet deadline
    Cancelled,
    /// Skipped because a health probe found the endpoint not online
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub status_code: Option<u16>,
    pub message: String,
}

impl Failure {
    pub fn transport(message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::Transport,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::transport(TIMEOUT_MESSAGE)
    }

    pub fn cancelled() -> Self {
        Failure {
            kind: FailureKind::Cancelled,
            status_code: None,
            message: CANCELLED_MESSAGE.to_string(),
        }
    }

    pub fn unavailable(state: HealthState) -> Self {
        let message = match state {
            HealthState::Unreachable => "endpoint unreachable",
            _ => "endpoint offline",
        };
        Failure {
            kind: FailureKind::Unavailable,
            status_code: None,
            message: message.to_string(),
        }
    }

    pub fn application(status_code: u16, message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::Application,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    pub fn malformed(status_code: u16, message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::Malformed,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// 400/401/403/404: the worker refused this particular request
    pub fn is_rejection(&self) -> bool {
        matches!(self.status_code, Some(400 | 401 | 403 | 404))
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(429)
    }

    /// 500/503/504: the worker or the catalog behind it failed
    pub fn is_server_error(&self) -> bool {
        matches!(self.status_code, Some(500 | 503 | 504))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Per-endpoint result of one download attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    Success(DownloadSuccess),
    Failure(Failure),
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadOutcome::Failure(f) if f.kind == FailureKind::Cancelled)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, DownloadOutcome::Failure(f) if f.kind == FailureKind::Transport)
    }

    pub fn success(&self) -> Option<&DownloadSuccess> {
        match self {
            DownloadOutcome::Success(s) => Some(s),
            DownloadOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            DownloadOutcome::Success(_) => None,
            DownloadOutcome::Failure(f) => Some(f),
        }
    }
}

impl From<Failure> for DownloadOutcome {
    fn from(failure: Failure) -> Self {
        DownloadOutcome::Failure(failure)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub endpoint: String,
    #[serde(flatten)]
    pub outcome: DownloadOutcome,
}

/// Outcomes of one fan-out, one entry per targeted endpoint in the order the
/// endpoints were targeted
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub operation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub entries: Vec<ReportEntry>,
}

impl FleetReport {
    pub fn get(&self, endpoint: &str) -> Option<&DownloadOutcome> {
        self.entries
            .iter()
            .find(|e| e.endpoint == endpoint)
            .map(|e| &e.outcome)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.endpoint.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DownloadOutcome)> {
        self.entries.iter().map(|e| (e.endpoint.as_str(), &e.outcome))
    }

    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_success()).count()
    }

    pub fn all_failed(&self) -> bool {
        self.success_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref_from_model_page() {
        let r = ModelRef::parse("https://civitai.com/models/123456").unwrap();
        assert_eq!(r.model_id, Some(123456));
        assert_eq!(r.version_id, None);

        let r = ModelRef::parse("https://civitai.com/models/123456/some-lora-name").unwrap();
        assert_eq!(r.model_id, Some(123456));
    }

    #[test]
    fn test_model_ref_from_version_query() {
        let r = ModelRef::parse("https://civitai.com/models/123456?modelVersionId=789").unwrap();
        assert_eq!(r.model_id, Some(123456));
        assert_eq!(r.version_id, Some(789));
    }

    #[test]
    fn test_model_ref_missing() {
        assert!(ModelRef::parse("https://civitai.com/user/someone").is_none());
        assert!(ModelRef::parse("https://civitai.com/models/abc").is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            DownloadRequest::new("   ", None),
            Err(FleetError::InvalidRequest(_))
        ));
        assert!(DownloadRequest::new("civitai.com/models/1", None).is_err());
        assert!(DownloadRequest::new("ftp://civitai.com/models/1", None).is_err());
        assert!(DownloadRequest::new("https://civitai.com/images/1", None).is_err());

        let req = DownloadRequest::new("https://Civitai.com/models/1", Some("  ")).unwrap();
        assert_eq!(req.host(), "civitai.com");
        assert_eq!(req.credential(), None);
    }

    #[test]
    fn test_default_credential_only_fills_gaps() {
        let req = DownloadRequest::new("https://civitai.com/models/1", None)
            .unwrap()
            .with_default_credential(Some("saved-key"));
        assert_eq!(req.credential(), Some("saved-key"));

        let req = DownloadRequest::new("https://civitai.com/models/1", Some("user-key"))
            .unwrap()
            .with_default_credential(Some("saved-key"));
        assert_eq!(req.credential(), Some("user-key"));
    }

    #[test]
    fn test_debug_redacts_credential() {
        let req = DownloadRequest::new("https://civitai.com/models/1", Some("secret-key")).unwrap();
        let printed = format!("{:?}", req);
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_host_allow_list() {
        let req = DownloadRequest::new("https://www.civitai.com/models/1", None).unwrap();
        assert!(req.host_allowed(&[]));
        assert!(req.host_allowed(&["civitai.com".to_string()]));
        assert!(!req.host_allowed(&["huggingface.co".to_string()]));

        let req = DownloadRequest::new("https://notcivitai.com/models/1", None).unwrap();
        assert!(!req.host_allowed(&["civitai.com".to_string()]));
    }

    #[test]
    fn test_failure_status_classes() {
        assert!(Failure::application(403, "forbidden").is_rejection());
        assert!(Failure::application(429, "slow down").is_rate_limited());
        assert!(Failure::application(504, "timeout upstream").is_server_error());
        assert!(!Failure::timeout().is_server_error());
        assert_eq!(Failure::timeout().message, "timeout");
        assert_eq!(Failure::cancelled().status_code, None);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = DownloadOutcome::Failure(Failure::application(404, "File not found"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["kind"], "application");
        assert_eq!(json["status_code"], 404);
    }
}
