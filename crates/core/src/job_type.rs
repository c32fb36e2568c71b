//! The closed set of job types understood by the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Which pipeline a job is routed to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DocumentIngest,
    PlanSummary,
    TradeScopeExtract,
    TenderScopeDoc,
    Qna,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::DocumentIngest,
        JobType::PlanSummary,
        JobType::TradeScopeExtract,
        JobType::TenderScopeDoc,
        JobType::Qna,
    ];

    /// Stable wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DocumentIngest => "document_ingest",
            JobType::PlanSummary => "plan_summary",
            JobType::TradeScopeExtract => "trade_scope_extract",
            JobType::TenderScopeDoc => "tender_scope_doc",
            JobType::Qna => "qna",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_job_type(s))
    }
}
