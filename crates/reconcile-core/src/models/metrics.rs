use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{ReferenceDate, TaskCategory};

/// Inclusive bounds on the execution date of history rows.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<ReferenceDate>,
    pub to: Option<ReferenceDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: ReferenceDate, to: ReferenceDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub runs: u64,
    pub successful_runs: u64,
    pub average_elapsed_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub range: DateRange,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub timed_out_runs: u64,
    pub average_elapsed_seconds: f64,
    pub average_success_rate: f64,
    pub total_records_processed: u64,
    pub by_category: BTreeMap<TaskCategory, CategoryMetrics>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}
