//! MisunderstandingGuard: when repeated recognition failures should force a handoff.
//!
//! Pure policy over the streak counters. The verdict is advisory; the phase machine
//! still routes the forced turn through the handoff dialogue.

use crate::config::{CallflowConfig, ForcedRejectionPolicy};
use crate::intent::CoarseIntent;
use crate::session::HandoffState;
use serde::{Deserialize, Serialize};

/// Why an automatic handoff fired, kept in the session meta for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceReason {
    AutoUnclear,
    AutoNotHeard,
    /// The recognizer stream itself failed.
    AsrFailure,
}

impl ForceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoUnclear => "auto_unclear",
            Self::AutoNotHeard => "auto_not_heard",
            Self::AsrFailure => "asr_failure",
        }
    }
}

/// Guard output: whether to force, plus the audit facts when it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardVerdict {
    pub force: bool,
    pub reason: Option<ForceReason>,
    /// Streak value at trigger time.
    pub streak: u32,
}

impl GuardVerdict {
    fn pass() -> Self {
        Self {
            force: false,
            reason: None,
            streak: 0,
        }
    }

    fn forced(reason: ForceReason, streak: u32) -> Self {
        Self {
            force: true,
            reason: Some(reason),
            streak,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MisunderstandingGuard {
    pub unclear_threshold: u32,
    pub not_heard_threshold: u32,
    pub reprompt_threshold: u32,
    pub rejection_policy: ForcedRejectionPolicy,
}

impl Default for MisunderstandingGuard {
    fn default() -> Self {
        Self::from_config(&CallflowConfig::default())
    }
}

impl MisunderstandingGuard {
    pub fn from_config(config: &CallflowConfig) -> Self {
        Self {
            unclear_threshold: config.unclear_streak_threshold.max(1),
            not_heard_threshold: config.not_heard_streak_threshold.max(1),
            reprompt_threshold: config.not_heard_reprompt_threshold,
            rejection_policy: config.forced_handoff_rejection,
        }
    }

    /// True only when a streak reached its threshold, no confirmation is already pending,
    /// and the caller is not already talking about the handoff.
    pub fn should_force_handoff(
        &self,
        unclear_streak: u32,
        not_heard_streak: u32,
        handoff_state: HandoffState,
        intent: CoarseIntent,
    ) -> GuardVerdict {
        if handoff_state == HandoffState::Confirming || intent.is_handoff_related() {
            return GuardVerdict::pass();
        }
        if unclear_streak >= self.unclear_threshold {
            return GuardVerdict::forced(ForceReason::AutoUnclear, unclear_streak);
        }
        if not_heard_streak >= self.not_heard_threshold {
            return GuardVerdict::forced(ForceReason::AutoNotHeard, not_heard_streak);
        }
        GuardVerdict::pass()
    }

    /// Whether a not-heard turn should speak "sorry, I couldn't hear you" rather than
    /// keep listening silently. Applies below the handoff threshold too.
    pub fn should_force_reprompt(&self, not_heard_streak: u32, handoff_state: HandoffState) -> bool {
        if handoff_state == HandoffState::Confirming {
            return false;
        }
        not_heard_streak >= self.reprompt_threshold
    }

    /// Whether an unambiguous rejection in the triggering utterance skips the forced prompt.
    pub fn rejection_skips_prompt(&self) -> bool {
        self.rejection_policy == ForcedRejectionPolicy::Immediate
    }
}
