//! Metrics for site adapters
//!
//! Tracks success rates, error counts and latency per site family so an
//! operator can spot a family whose layout changed.

use crate::error::{Classify, FailureKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FamilyMetrics {
    pub family: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub average_response_time_ms: f64,
    pub total_response_time_ms: u64,
    pub unreachable_count: u64,
    pub structure_errors: u64,
    pub timeout_count: u64,
}

impl FamilyMetrics {
    pub fn new(family: String) -> Self {
        Self {
            family,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            average_response_time_ms: 0.0,
            total_response_time_ms: 0,
            unreachable_count: 0,
            structure_errors: 0,
            timeout_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.successful_requests as f64 / self.total_requests as f64) * 100.0
        }
    }

    pub fn record_success(&mut self, response_time: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.last_success = Some(Utc::now());

        let response_ms = response_time.as_millis() as u64;
        self.total_response_time_ms += response_ms;
        self.average_response_time_ms =
            self.total_response_time_ms as f64 / self.successful_requests as f64;
    }

    pub fn record_failure(&mut self, kind: FailureKind, error: String) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.last_failure = Some(Utc::now());

        match kind {
            FailureKind::Timeout => self.timeout_count += 1,
            FailureKind::Structure => self.structure_errors += 1,
            FailureKind::Unreachable => self.unreachable_count += 1,
            FailureKind::Other => {}
        }
        self.last_error = Some(error);
    }
}

/// Per-family metrics shared by the scheduler and the processor
#[derive(Default)]
pub struct MetricsTracker {
    metrics: Mutex<HashMap<String, FamilyMetrics>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FamilyMetrics>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_success(&self, family: &str, response_time: Duration) {
        let mut metrics = self.lock();
        let entry = metrics
            .entry(family.to_string())
            .or_insert_with(|| FamilyMetrics::new(family.to_string()));
        entry.record_success(response_time);

        log::debug!(
            "[{}] Success - Response time: {}ms - Success rate: {:.2}%",
            family,
            response_time.as_millis(),
            entry.success_rate()
        );
    }

    pub fn record_failure(&self, family: &str, kind: FailureKind, error: String) {
        let mut metrics = self.lock();
        let entry = metrics
            .entry(family.to_string())
            .or_insert_with(|| FamilyMetrics::new(family.to_string()));
        entry.record_failure(kind, error.clone());

        log::warn!(
            "[{}] Failure ({}) - Error: {} - Success rate: {:.2}%",
            family,
            kind.as_str(),
            error,
            entry.success_rate()
        );
    }

    pub fn get_metrics(&self, family: &str) -> Option<FamilyMetrics> {
        self.lock().get(family).cloned()
    }

    /// All families, worst success rate first.
    pub fn get_all_metrics(&self) -> Vec<FamilyMetrics> {
        let mut all: Vec<FamilyMetrics> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.success_rate().total_cmp(&b.success_rate()));
        all
    }

    pub fn log_summary(&self) {
        for m in self.get_all_metrics() {
            log::info!(
                "[{}] {} requests, {:.2}% ok, avg {:.0}ms, {} unreachable, {} structure, {} timeouts",
                m.family,
                m.total_requests,
                m.success_rate(),
                m.average_response_time_ms,
                m.unreachable_count,
                m.structure_errors,
                m.timeout_count
            );
        }
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&*self.lock()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Time an adapter call and record the outcome under `family`
pub async fn track_request<F, T, E>(tracker: &MetricsTracker, family: &str, operation: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Classify,
{
    let start = Instant::now();
    let result = operation.await;
    let duration = start.elapsed();

    match &result {
        Ok(_) => tracker.record_success(family, duration),
        Err(e) => tracker.record_failure(family, e.failure_kind(), e.to_string()),
    }

    result
}
