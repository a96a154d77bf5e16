//! Readiness Module
//!
//! Probes the coordination store and reports its member count. A store that cannot be
//! reached makes the replica not ready; the error is always returned to the caller.

use crate::context::ServiceContext;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Readiness of the coordination dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadinessStatus {
    Ready,
    NotReady,
}

/// Outcome of one readiness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub status: ReadinessStatus,
    pub member_count: Option<usize>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
    pub uptime_seconds: u64,
}

pub struct ReadinessMonitor {
    context: Arc<ServiceContext>,
    start_time: Instant,
    last_report: RwLock<Option<ReadinessReport>>,
}

impl ReadinessMonitor {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self {
            context,
            start_time: Instant::now(),
            last_report: RwLock::new(None),
        }
    }

    /// Number of members in the coordination cluster
    pub async fn check_ready(&self) -> Result<usize> {
        let members = self.context.client().member_count().await?;
        debug!("etcd number of members: {}", members);
        Ok(members)
    }

    /// Run `check_ready` and record the result as the latest report
    pub async fn probe(&self) -> (ReadinessReport, Result<usize>) {
        let started = Instant::now();
        let result = self.check_ready().await;

        let (status, member_count, message) = match &result {
            Ok(members) => (ReadinessStatus::Ready, Some(*members), None),
            Err(e) => {
                warn!("etcd is not ready or not accessible: {}", e);
                (ReadinessStatus::NotReady, None, Some(e.to_string()))
            }
        };

        let report = ReadinessReport {
            status,
            member_count,
            message,
            checked_at: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        *self.last_report.write().await = Some(report.clone());
        (report, result)
    }

    /// Most recent probe result, if any probe has run
    pub async fn last_report(&self) -> Option<ReadinessReport> {
        self.last_report.read().await.clone()
    }
}
