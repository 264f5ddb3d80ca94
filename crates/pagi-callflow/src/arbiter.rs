//! TransferArbiter: the single call site of the external transfer.
//!
//! Fires only when `transfer_requested && !transfer_executed` and no attempt is in
//! flight. The PBX call runs as a spawned task; its result is written back to the
//! session under the call's lock, so a failure leaves `transfer_executed = false`
//! for the next qualifying event to retry.

use crate::error::TransferError;
use crate::session::{CallPhase, CallSession, META_TRANSFER_LAST_ERROR};
use crate::store::SessionHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// What the PBX bridge is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub request_id: Uuid,
    pub call_id: String,
    /// 1-based attempt number for this call.
    pub attempt: u32,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// External transfer collaborator. Implement for the PBX bridge in use.
#[async_trait::async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<(), TransferError>;
}

/// Placeholder executor: logs the request and reports success. For replay and dry runs.
#[derive(Debug, Default)]
pub struct LoggingTransferExecutor;

#[async_trait::async_trait]
impl TransferExecutor for LoggingTransferExecutor {
    async fn transfer(&self, request: &TransferRequest) -> Result<(), TransferError> {
        info!(
            call_id = %request.call_id,
            attempt = request.attempt,
            "[DRY RUN] Transfer to operator"
        );
        Ok(())
    }
}

/// POSTs the request as JSON to a PBX bridge. Any non-2xx answer is a rejection.
#[derive(Debug, Clone)]
pub struct WebhookTransferExecutor {
    pub url: String,
    client: reqwest::Client,
}

impl WebhookTransferExecutor {
    pub fn new(url: impl Into<String>) -> Result<Self, TransferError> {
        Self::with_timeout(url, Duration::from_secs(10))
    }

    /// `timeout` bounds the whole request; hitting it counts as an unreachable PBX.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Build from `PAGI_CALLFLOW_TRANSFER_WEBHOOK_URL`; `None` when unset or empty.
    pub fn from_env() -> Option<Result<Self, TransferError>> {
        std::env::var("PAGI_CALLFLOW_TRANSFER_WEBHOOK_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }
}

#[async_trait::async_trait]
impl TransferExecutor for WebhookTransferExecutor {
    async fn transfer(&self, request: &TransferRequest) -> Result<(), TransferError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransferError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

/// Final state of one dispatched transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Executed,
    Failed(TransferError),
}

/// What `trigger_if_needed` did.
#[derive(Debug)]
pub enum TriggerOutcome {
    NotRequested,
    AlreadyExecuted,
    InFlight,
    AttemptsExhausted,
    Dispatched(JoinHandle<TransferStatus>),
}

pub struct TransferArbiter {
    executor: Arc<dyn TransferExecutor>,
    max_attempts: u32,
}

impl TransferArbiter {
    pub fn new(executor: Arc<dyn TransferExecutor>, max_attempts: u32) -> Self {
        Self {
            executor,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Dispatch the transfer for `session` if, and only if, one is owed.
    ///
    /// `session` must be the guard obtained from `handle`; the spawned task re-acquires
    /// the same lock to record the result.
    pub fn trigger_if_needed(
        &self,
        handle: &SessionHandle,
        session: &mut CallSession,
    ) -> TriggerOutcome {
        if !session.transfer_requested {
            return TriggerOutcome::NotRequested;
        }
        if session.transfer_executed {
            return TriggerOutcome::AlreadyExecuted;
        }
        if session.transfer_in_flight {
            return TriggerOutcome::InFlight;
        }
        if session.transfer_attempts >= self.max_attempts {
            return TriggerOutcome::AttemptsExhausted;
        }

        session.transfer_in_flight = true;
        session.transfer_attempts += 1;
        let request = TransferRequest {
            request_id: Uuid::new_v4(),
            call_id: session.call_id.clone(),
            attempt: session.transfer_attempts,
            reason: session
                .meta
                .get(crate::session::META_AUTO_HANDOFF_REASON)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            requested_at: Utc::now(),
        };
        info!(
            call_id = %request.call_id,
            attempt = request.attempt,
            request_id = %request.request_id,
            "📞 Dispatching transfer"
        );

        let executor = Arc::clone(&self.executor);
        let handle = handle.clone();
        let task = tokio::spawn(async move {
            let result = executor.transfer(&request).await;
            let mut session = handle.lock().await;
            record_result(&mut session, result)
        });
        TriggerOutcome::Dispatched(task)
    }
}

fn record_result(session: &mut CallSession, result: Result<(), TransferError>) -> TransferStatus {
    session.transfer_in_flight = false;
    match result {
        Ok(()) => {
            session.transfer_executed = true;
            session.meta.remove(META_TRANSFER_LAST_ERROR);
            // The call now belongs to the operator: HANDOFF_DONE ticks over to END.
            if session.phase == CallPhase::HandoffDone {
                session.phase = CallPhase::End;
            }
            info!(call_id = %session.call_id, "✅ Transfer executed");
            TransferStatus::Executed
        }
        Err(e) => {
            warn!(
                call_id = %session.call_id,
                attempt = session.transfer_attempts,
                error = %e,
                "Transfer failed; will retry on next event"
            );
            session
                .meta
                .insert(META_TRANSFER_LAST_ERROR.to_string(), e.to_string().into());
            TransferStatus::Failed(e)
        }
    }
}
