use serde::{Deserialize, Serialize};

use crate::jobs::JobId;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub file_path: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Set when a job was created but could not be queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            job_id: None,
        }
    }
}
