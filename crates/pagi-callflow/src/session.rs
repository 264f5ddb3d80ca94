//! Per-call state record.

use crate::intent::CoarseIntent;
use crate::templates::TemplateId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position of the call in the overall conversation script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallPhase {
    Entry,
    EntryConfirm,
    Qa,
    AfterFollowup,
    Closing,
    Handoff,
    HandoffConfirmWait,
    HandoffDone,
    End,
}

impl CallPhase {
    /// Phases owned by the handoff dialogue; the misunderstanding guard stays out of these.
    pub fn is_handoff(&self) -> bool {
        matches!(
            self,
            Self::Handoff | Self::HandoffConfirmWait | Self::HandoffDone
        )
    }
}

/// Sub-state of the "shall I transfer you?" dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffState {
    #[default]
    Idle,
    Confirming,
    Done,
}

/// Auxiliary audit facts (auto-handoff reason, streak at trigger time, ...).
pub type SessionMeta = BTreeMap<String, serde_json::Value>;

pub const META_AUTO_HANDOFF_REASON: &str = "auto_handoff_reason";
pub const META_AUTO_HANDOFF_STREAK: &str = "auto_handoff_streak";
/// Classifier label of a turn the guard turned into a handoff request.
pub const META_CLASSIFIED_INTENT: &str = "classified_intent";
pub const META_HANDOFF_OUTCOME: &str = "handoff_outcome";
pub const META_TRANSFER_LAST_ERROR: &str = "transfer_last_error";

/// One active call. Owned by the `SessionStore`; mutated only under the call's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub phase: CallPhase,
    pub last_intent: Option<CoarseIntent>,
    pub handoff_state: HandoffState,
    pub handoff_retry_count: u32,
    pub unclear_streak: u32,
    pub not_heard_streak: u32,
    pub transfer_requested: bool,
    pub transfer_executed: bool,
    pub handoff_completed: bool,
    pub handoff_prompt_sent: bool,
    pub last_templates: Vec<TemplateId>,
    pub meta: SessionMeta,

    /// A transfer task has been dispatched and has not reported back yet.
    pub transfer_in_flight: bool,
    /// Number of times the external transfer has been attempted.
    pub transfer_attempts: u32,
    pub disconnect_scheduled: bool,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            phase: CallPhase::Entry,
            last_intent: None,
            handoff_state: HandoffState::Idle,
            handoff_retry_count: 0,
            unclear_streak: 0,
            not_heard_streak: 0,
            transfer_requested: false,
            transfer_executed: false,
            handoff_completed: false,
            handoff_prompt_sent: false,
            last_templates: Vec::new(),
            meta: SessionMeta::new(),
            transfer_in_flight: false,
            transfer_attempts: 0,
            disconnect_scheduled: false,
            turn_count: 0,
            created_at: Utc::now(),
        }
    }

    /// The END obligation: the call leaves either through an executed transfer or a
    /// scheduled disconnect.
    pub fn end_obligation_met(&self) -> bool {
        (self.transfer_requested && self.transfer_executed) || self.disconnect_scheduled
    }

    /// Every invariant that does not currently hold.
    pub fn invariant_violations(&self) -> Vec<InvariantViolation> {
        let mut out = Vec::new();
        if self.transfer_executed && !self.transfer_requested {
            out.push(InvariantViolation::ExecutedWithoutRequest);
        }
        if self.handoff_retry_count > 0 && self.handoff_state != HandoffState::Confirming {
            out.push(InvariantViolation::RetryOutsideConfirming);
        }
        if self.phase == CallPhase::End && !self.end_obligation_met() {
            out.push(InvariantViolation::StuckEnd);
        }
        if self.transfer_in_flight && self.transfer_executed {
            out.push(InvariantViolation::InFlightAfterExecuted);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    ExecutedWithoutRequest,
    RetryOutsideConfirming,
    /// phase = END with neither an executed transfer nor a scheduled disconnect.
    StuckEnd,
    InFlightAfterExecuted,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExecutedWithoutRequest => "transfer_executed without transfer_requested",
            Self::RetryOutsideConfirming => "handoff_retry_count > 0 outside CONFIRMING",
            Self::StuckEnd => "phase END without executed transfer or scheduled disconnect",
            Self::InFlightAfterExecuted => "transfer in flight after it already executed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_clean() {
        let s = CallSession::new("call-1");
        assert_eq!(s.phase, CallPhase::Entry);
        assert_eq!(s.handoff_state, HandoffState::Idle);
        assert_eq!(s.unclear_streak + s.not_heard_streak + s.handoff_retry_count, 0);
        assert!(!s.transfer_requested && !s.transfer_executed);
        assert!(s.invariant_violations().is_empty());
    }

    #[test]
    fn test_stuck_end_is_reported() {
        let mut s = CallSession::new("call-2");
        s.phase = CallPhase::End;
        s.transfer_requested = true;
        assert_eq!(s.invariant_violations(), vec![InvariantViolation::StuckEnd]);
        s.disconnect_scheduled = true;
        assert!(s.invariant_violations().is_empty());
    }

    #[test]
    fn test_retry_outside_confirming_is_reported() {
        let mut s = CallSession::new("call-3");
        s.handoff_retry_count = 1;
        s.handoff_state = HandoffState::Done;
        assert!(s
            .invariant_violations()
            .contains(&InvariantViolation::RetryOutsideConfirming));
    }
}
