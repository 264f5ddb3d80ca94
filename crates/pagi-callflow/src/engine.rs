//! CallflowEngine: the event entry point shared by every call handler.
//!
//! Cheap to clone; all clones share one store. Per call, events are serialized on the
//! session lock and processed in arrival order. Across calls nothing is shared besides
//! the store map, so concurrent calls never block each other beyond a map shard.

use crate::arbiter::{TransferArbiter, TransferExecutor, TriggerOutcome};
use crate::config::CallflowConfig;
use crate::error::{CallflowError, CallflowResult};
use crate::events::{CallEvent, RecognitionEvent, TurnOutput};
use crate::intent::TurnInput;
use crate::phase::{ConversationPhaseMachine, PhaseStep};
use crate::session::{CallPhase, CallSession};
use crate::store::{SessionHandle, SessionStore};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

struct EngineInner {
    store: SessionStore,
    machine: ConversationPhaseMachine,
    arbiter: TransferArbiter,
    tombstone_ttl: chrono::Duration,
}

#[derive(Clone)]
pub struct CallflowEngine {
    inner: Arc<EngineInner>,
}

impl CallflowEngine {
    pub fn new(config: &CallflowConfig, executor: Arc<dyn TransferExecutor>) -> Self {
        info!(
            unclear_threshold = config.unclear_streak_threshold,
            not_heard_threshold = config.not_heard_streak_threshold,
            max_transfer_attempts = config.max_transfer_attempts,
            "📞 Callflow engine ready"
        );
        Self {
            inner: Arc::new(EngineInner {
                store: SessionStore::new(),
                machine: ConversationPhaseMachine::from_config(config),
                arbiter: TransferArbiter::new(executor, config.max_transfer_attempts),
                tombstone_ttl: config.tombstone_ttl(),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Route one event. `Ok(None)` means the event was a no-op (interim result,
    /// late event for a finished call, hang-up).
    pub async fn dispatch(&self, event: CallEvent) -> CallflowResult<Option<TurnOutput>> {
        if event.call_id().trim().is_empty() {
            return Err(CallflowError::InvalidEvent("empty call_id".to_string()));
        }
        match event {
            CallEvent::CallStarted { call_id } => self.call_started(&call_id).await,
            CallEvent::Utterance(recognition) => self.handle_utterance(recognition).await,
            CallEvent::Hangup { call_id } => {
                self.hangup(&call_id);
                Ok(None)
            }
            CallEvent::RecognitionFailed { call_id, reason } => {
                self.recognition_failed(&call_id, &reason).await
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn call_started(&self, call_id: &str) -> CallflowResult<Option<TurnOutput>> {
        let Some(handle) = self.session_for(call_id)? else {
            return Ok(None);
        };
        let mut session = handle.lock().await;
        let step = self.inner.machine.greet(&mut session);
        Ok(Some(self.finish(&handle, &mut session, step)))
    }

    #[instrument(skip(self, event), fields(call_id = %event.call_id, is_final = event.is_final))]
    pub async fn handle_utterance(
        &self,
        event: RecognitionEvent,
    ) -> CallflowResult<Option<TurnOutput>> {
        if event.call_id.trim().is_empty() {
            return Err(CallflowError::InvalidEvent("empty call_id".to_string()));
        }
        if !event.is_final {
            debug!("Interim result ignored");
            return Ok(None);
        }
        let Some(handle) = self.session_for(&event.call_id)? else {
            return Ok(None);
        };
        let mut session = handle.lock().await;
        if session.phase == CallPhase::End {
            debug!("Utterance after END ignored");
            return Ok(None);
        }
        let input = TurnInput::new(event.recognized_text, event.coarse_intent);
        let step = self.inner.machine.step(&mut session, &input);
        Ok(Some(self.finish(&handle, &mut session, step)))
    }

    #[instrument(skip(self))]
    pub async fn recognition_failed(
        &self,
        call_id: &str,
        reason: &str,
    ) -> CallflowResult<Option<TurnOutput>> {
        let Some(handle) = self.session_for(call_id)? else {
            return Ok(None);
        };
        let mut session = handle.lock().await;
        if session.phase == CallPhase::End {
            return Ok(None);
        }
        if !reason.is_empty() {
            session
                .meta
                .insert("recognition_failure".to_string(), reason.to_string().into());
        }
        let step = self.inner.machine.on_recognition_failure(&mut session);
        Ok(Some(self.finish(&handle, &mut session, step)))
    }

    /// Release the call. Late events for it become no-ops. Returns whether a live
    /// session was released.
    pub fn hangup(&self, call_id: &str) -> bool {
        let released = self.inner.store.remove(call_id).is_some();
        info!(call_id = %call_id, released, "Call hung up");
        released
    }

    /// Release every session that has reached END and forget hung-up calls older than
    /// `tombstone_ttl_secs`. Sessions busy with a turn are left for the next sweep.
    /// Returns how many sessions were released.
    pub fn sweep_ended(&self) -> usize {
        let pruned = self.inner.store.prune_terminated(self.inner.tombstone_ttl);
        if pruned > 0 {
            debug!(count = pruned, "Pruned call tombstones");
        }

        let ended: Vec<String> = self
            .inner
            .store
            .active_call_ids()
            .into_iter()
            .filter(|id| {
                self.inner
                    .store
                    .get(id)
                    .and_then(|h| h.try_phase())
                    .map_or(false, |phase| phase == CallPhase::End)
            })
            .collect();
        for id in &ended {
            self.inner.store.remove(id);
        }
        if !ended.is_empty() {
            debug!(count = ended.len(), "Swept ended calls");
        }
        ended.len()
    }

    pub async fn snapshot(&self, call_id: &str) -> Option<CallSession> {
        let handle = self.inner.store.get(call_id)?;
        Some(handle.snapshot().await)
    }

    /// Live handle for `call_id`, or `None` when the call already hung up.
    fn session_for(&self, call_id: &str) -> CallflowResult<Option<SessionHandle>> {
        match self.inner.store.get_or_create(call_id) {
            Ok(handle) => Ok(Some(handle)),
            Err(CallflowError::CallTerminated(_)) => {
                debug!(call_id = %call_id, "Event for terminated call ignored");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Post-step bookkeeping, still under the call's lock: transfer trigger, END
    /// obligation, invariant audit.
    fn finish(
        &self,
        handle: &SessionHandle,
        session: &mut CallSession,
        mut step: PhaseStep,
    ) -> TurnOutput {
        let transfer_task = match self.inner.arbiter.trigger_if_needed(handle, session) {
            TriggerOutcome::Dispatched(task) => Some(task),
            TriggerOutcome::AttemptsExhausted => {
                debug!(call_id = %session.call_id, "Transfer attempts exhausted");
                None
            }
            _ => None,
        };
        self.inner.machine.enforce_end_obligation(session, &mut step);
        for violation in session.invariant_violations() {
            error!(call_id = %session.call_id, %violation, "Session invariant violated");
        }

        TurnOutput {
            call_id: session.call_id.clone(),
            phase: session.phase,
            handoff_state: session.handoff_state,
            templates: step.templates,
            transfer_dispatched: transfer_task.is_some(),
            disconnect_after_ms: step.disconnect_after.map(|d| d.as_millis() as u64),
            forced: step.forced,
            transfer_task,
        }
    }
}
