//! Admission Audit Trail
//!
//! Every gate decision is recorded with the deciding stage and a stable
//! outcome code. Writes are fire-and-forget: a failing audit store is logged
//! and never blocks or fails the request.

use crate::tenant::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome code recorded when a stage lets the request through
pub const PASSED: &str = "PASSED";

/// Deadline for one audit write unless configured otherwise
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Pipeline stage that made a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    TokenVerifier,
    TenantResolver,
    LicenseGate,
    RateLimiter,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenVerifier => "token_verifier",
            Self::TenantResolver => "tenant_resolver",
            Self::LicenseGate => "license_gate",
            Self::RateLimiter => "rate_limiter",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub correlation_id: String,
    pub tenant_id: Option<TenantId>,
    pub stage: Stage,
    /// `PASSED` or the rejection code
    pub outcome: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn passed(&self) -> bool {
        self.outcome == PASSED
    }
}

/// Audit errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only audit store
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Writes audit records to the tracing pipeline
#[derive(Debug, Default)]
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        info!(
            target: "guestgate::audit",
            audit_id = %record.id,
            correlation_id = %record.correlation_id,
            tenant_id = ?record.tenant_id,
            stage = %record.stage,
            outcome = %record.outcome,
            detail = %record.detail,
            "admission decision"
        );
        Ok(())
    }
}

/// In-memory audit store (for testing and development)
#[derive(Debug, Default)]
pub struct InMemoryAuditWriter {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records for one correlation id, in write order
    pub fn for_correlation(&self, correlation_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditWriter for InMemoryAuditWriter {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

/// Fire-and-forget front end for an [`AuditWriter`]
#[derive(Clone)]
pub struct AuditSink {
    writer: Arc<dyn AuditWriter>,
    pending: Arc<PendingWrites>,
    write_timeout: Duration,
}

impl AuditSink {
    pub fn new(writer: Arc<dyn AuditWriter>) -> Self {
        Self {
            writer,
            pending: Arc::new(PendingWrites::default()),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Abandon writes that take longer than `timeout`
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Record a decision. Returns immediately; the write happens on a
    /// spawned task. Must be called from within a Tokio runtime.
    pub fn record(
        &self,
        correlation_id: &str,
        tenant_id: Option<TenantId>,
        stage: Stage,
        outcome: &str,
        detail: impl Into<String>,
    ) {
        metrics::counter!(
            "guestgate_admission_decisions_total",
            "stage" => stage.as_str(),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        let record = AuditRecord {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.to_string(),
            tenant_id,
            stage,
            outcome: outcome.to_string(),
            detail: detail.into(),
            recorded_at: Utc::now(),
        };

        let writer = Arc::clone(&self.writer);
        let pending = Arc::clone(&self.pending);
        let write_timeout = self.write_timeout;
        let timeout_ms = u64::try_from(write_timeout.as_millis()).unwrap_or(u64::MAX);
        pending.count.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let audit_id = record.id;
            let correlation_id = record.correlation_id.clone();
            match tokio::time::timeout(write_timeout, writer.append(record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        %audit_id,
                        %correlation_id,
                        error = %e,
                        "audit write failed; record dropped"
                    )
                }
                Err(_) => warn!(
                    %audit_id,
                    %correlation_id,
                    timeout_ms,
                    "audit write timed out; record dropped"
                ),
            }
            if pending.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                pending.idle.notify_waiters();
            }
        });
    }

    /// Number of writes still in flight
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Wait until every write issued so far has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Like [`flush`](Self::flush), giving up after `deadline`. Returns
    /// whether every write finished.
    pub async fn flush_within(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.flush()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingAuditWriter, StalledAuditWriter};

    #[tokio::test]
    async fn test_records_decision() {
        let writer = Arc::new(InMemoryAuditWriter::new());
        let sink = AuditSink::new(writer.clone());
        let tenant = Uuid::new_v4();

        sink.record(
            "corr-1",
            Some(tenant),
            Stage::LicenseGate,
            "QUOTA_EXCEEDED",
            "existing=100",
        );
        sink.flush().await;

        let records = writer.for_correlation("corr-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Stage::LicenseGate);
        assert_eq!(records[0].outcome, "QUOTA_EXCEEDED");
        assert_eq!(records[0].tenant_id, Some(tenant));
        assert!(!records[0].passed());
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let sink = AuditSink::new(Arc::new(FailingAuditWriter));

        sink.record("corr-2", None, Stage::TokenVerifier, PASSED, "");
        sink.flush().await;

        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_is_abandoned_after_deadline() {
        let sink = AuditSink::new(Arc::new(StalledAuditWriter))
            .with_write_timeout(Duration::from_secs(2));

        for stage in [Stage::TokenVerifier, Stage::TenantResolver, Stage::LicenseGate] {
            sink.record("corr-3", None, stage, PASSED, "");
        }
        assert_eq!(sink.pending(), 3);

        assert!(sink.flush_within(Duration::from_secs(5)).await);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_within_gives_up() {
        let sink = AuditSink::new(Arc::new(StalledAuditWriter))
            .with_write_timeout(Duration::from_secs(60));

        sink.record("corr-4", None, Stage::RateLimiter, PASSED, "");

        assert!(!sink.flush_within(Duration::from_secs(1)).await);
        assert_eq!(sink.pending(), 1);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let sink = AuditSink::new(Arc::new(TracingAuditWriter));
        sink.flush().await;
    }
}
