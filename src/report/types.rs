use crate::runner::state::RunSummary;
use serde::{Deserialize, Serialize};

/// Contents of `results.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub generated_at: String,
    #[serde(flatten)]
    pub summary: RunSummary,
}

impl TestResults {
    pub fn new(summary: &RunSummary) -> Self {
        Self {
            generated_at: chrono::Local::now().to_rfc3339(),
            summary: summary.clone(),
        }
    }
}
