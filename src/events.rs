use serde::Serialize;
use uuid::Uuid;

use crate::model::DownloadOutcome;

#[derive(Clone, Debug, Serialize)]
pub struct FleetEvent {
    pub operation_id: Uuid,
    pub endpoint: String,
    pub status: String, // "dispatched", "completed", "failed", "cancelled"
    pub outcome: Option<DownloadOutcome>,
}

impl FleetEvent {
    pub fn dispatched(operation_id: Uuid, endpoint: &str) -> Self {
        FleetEvent {
            operation_id,
            endpoint: endpoint.to_string(),
            status: "dispatched".to_string(),
            outcome: None,
        }
    }

    pub fn settled(operation_id: Uuid, endpoint: &str, outcome: &DownloadOutcome) -> Self {
        let status = if outcome.is_success() {
            "completed"
        } else if outcome.is_cancelled() {
            "cancelled"
        } else {
            "failed"
        };
        FleetEvent {
            operation_id,
            endpoint: endpoint.to_string(),
            status: status.to_string(),
            outcome: Some(outcome.clone()),
        }
    }
}
