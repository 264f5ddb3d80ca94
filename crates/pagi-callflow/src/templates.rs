//! Template selection: resolved decision → ordered speech-template identifiers.
//!
//! Pure and side-effect free. The selection also says what happens to the
//! failure streaks, so the streak bookkeeping lives next to the template choice
//! that implies it.

use crate::handoff::HandoffOutcome;
use crate::intent::CoarseIntent;
use crate::session::{CallPhase, HandoffState};
use serde::{Deserialize, Serialize};

/// Opaque key of a pre-recorded or synthesized phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    EntryGreeting,
    EntryPrompt,
    SalesCheck,
    SalesDecline,
    GreetingReply,
    InquiryAnswer,
    SalesPolicy,
    Acknowledge,
    FollowupPrompt,
    GoAheadPrompt,
    ClosingPrompt,
    Goodbye,
    HandoffConfirm,
    AutoHandoffConfirm,
    HandoffReconfirm,
    TransferNotice,
    HoldNotice,
    DeclineAck,
    AlreadyConnecting,
    TransferFailed,
    RecognitionApology,
    NotHeardReprompt,
    UnclearReprompt,
}

impl TemplateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntryGreeting => "entry_greeting",
            Self::EntryPrompt => "entry_prompt",
            Self::SalesCheck => "sales_check",
            Self::SalesDecline => "sales_decline",
            Self::GreetingReply => "greeting_reply",
            Self::InquiryAnswer => "inquiry_answer",
            Self::SalesPolicy => "sales_policy",
            Self::Acknowledge => "acknowledge",
            Self::FollowupPrompt => "followup_prompt",
            Self::GoAheadPrompt => "go_ahead_prompt",
            Self::ClosingPrompt => "closing_prompt",
            Self::Goodbye => "goodbye",
            Self::HandoffConfirm => "handoff_confirm",
            Self::AutoHandoffConfirm => "auto_handoff_confirm",
            Self::HandoffReconfirm => "handoff_reconfirm",
            Self::TransferNotice => "transfer_notice",
            Self::HoldNotice => "hold_notice",
            Self::DeclineAck => "decline_ack",
            Self::AlreadyConnecting => "already_connecting",
            Self::TransferFailed => "transfer_failed",
            Self::RecognitionApology => "recognition_apology",
            Self::NotHeardReprompt => "not_heard_reprompt",
            Self::UnclearReprompt => "unclear_reprompt",
        }
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the phase machine decided this turn, before it is turned into speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Call just connected.
    EntryGreeting,
    /// "How can I help you?"
    EntryPrompt,
    /// "Are you calling with a sales offer?"
    SalesCheck,
    SalesDecline,
    Answer(CoarseIntent),
    /// Caller said they have more to ask.
    InviteQuestion,
    ClosingPrompt,
    Goodbye,
    HandoffPrompt { forced: bool },
    Handoff(HandoffOutcome),
    AlreadyConnecting,
    /// Transfer requested but not yet confirmed by the PBX.
    TransferPending,
    TransferFailed,
    RecognitionFailure,
    NotHeard { reprompt: bool },
    Unclear,
    /// Nothing to say (e.g. the call already left for an operator).
    Silent,
}

impl Resolution {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::NotHeard { .. } | Self::Unclear)
    }
}

/// Effect of a selection on one failure streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakChange {
    Keep,
    Increment,
    Reset,
}

impl StreakChange {
    pub fn apply(self, current: u32) -> u32 {
        match self {
            Self::Keep => current,
            Self::Increment => current.saturating_add(1),
            Self::Reset => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSelection {
    pub templates: Vec<TemplateId>,
    pub unclear: StreakChange,
    pub not_heard: StreakChange,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSelector;

impl TemplateSelector {
    pub fn new() -> Self {
        Self
    }

    /// Map a resolution, spoken in `phase` with the handoff sub-state `handoff_state`,
    /// to templates and streak changes.
    pub fn select(
        &self,
        phase: CallPhase,
        handoff_state: HandoffState,
        resolution: Resolution,
    ) -> TemplateSelection {
        use TemplateId::*;

        let templates = match resolution {
            Resolution::EntryGreeting => vec![EntryGreeting],
            Resolution::EntryPrompt => vec![EntryPrompt],
            Resolution::SalesCheck => vec![SalesCheck],
            Resolution::SalesDecline => vec![SalesDecline, Goodbye],
            Resolution::Answer(intent) => vec![answer_template(intent), FollowupPrompt],
            Resolution::InviteQuestion => vec![GoAheadPrompt],
            Resolution::ClosingPrompt => vec![ClosingPrompt],
            Resolution::Goodbye => vec![Goodbye],
            Resolution::HandoffPrompt { forced: true } => vec![AutoHandoffConfirm],
            Resolution::HandoffPrompt { forced: false } => vec![HandoffConfirm],
            Resolution::Handoff(outcome) => Self::handoff_templates(outcome),
            Resolution::AlreadyConnecting => {
                if handoff_state == HandoffState::Done && phase == CallPhase::HandoffDone {
                    vec![AlreadyConnecting, HoldNotice]
                } else {
                    vec![AlreadyConnecting]
                }
            }
            Resolution::TransferPending => vec![HoldNotice],
            Resolution::TransferFailed => vec![TransferFailed, Goodbye],
            Resolution::RecognitionFailure => vec![RecognitionApology, TransferNotice, HoldNotice],
            Resolution::NotHeard { reprompt: true } => {
                let mut t = vec![NotHeardReprompt];
                t.extend(pending_question(phase));
                t
            }
            Resolution::NotHeard { reprompt: false } => Vec::new(),
            Resolution::Unclear => {
                let mut t = vec![UnclearReprompt];
                t.extend(pending_question(phase));
                t
            }
            Resolution::Silent => Vec::new(),
        };

        let (unclear, not_heard) = match resolution {
            Resolution::NotHeard { .. } => (StreakChange::Reset, StreakChange::Increment),
            Resolution::Unclear => (StreakChange::Increment, StreakChange::Reset),
            Resolution::Silent => (StreakChange::Keep, StreakChange::Keep),
            _ => (StreakChange::Reset, StreakChange::Reset),
        };

        TemplateSelection {
            templates,
            unclear,
            not_heard,
        }
    }

    /// Templates for a resolved handoff confirmation turn.
    pub fn handoff_templates(outcome: HandoffOutcome) -> Vec<TemplateId> {
        match outcome {
            HandoffOutcome::Accepted | HandoffOutcome::SafeDefaultAccepted => {
                vec![TemplateId::TransferNotice, TemplateId::HoldNotice]
            }
            HandoffOutcome::Declined => vec![TemplateId::DeclineAck, TemplateId::Goodbye],
            HandoffOutcome::DeclinedContinue => {
                vec![TemplateId::DeclineAck, TemplateId::FollowupPrompt]
            }
            HandoffOutcome::Reprompt => vec![TemplateId::HandoffReconfirm],
        }
    }
}

fn answer_template(intent: CoarseIntent) -> TemplateId {
    match intent {
        CoarseIntent::Greeting => TemplateId::GreetingReply,
        CoarseIntent::Inquiry => TemplateId::InquiryAnswer,
        CoarseIntent::SalesTopic => TemplateId::SalesPolicy,
        _ => TemplateId::Acknowledge,
    }
}

/// The question still waiting for an answer in `phase`, re-asked after a failed turn.
fn pending_question(phase: CallPhase) -> Option<TemplateId> {
    match phase {
        CallPhase::EntryConfirm => Some(TemplateId::SalesCheck),
        CallPhase::AfterFollowup => Some(TemplateId::FollowupPrompt),
        CallPhase::Closing => Some(TemplateId::ClosingPrompt),
        CallPhase::HandoffConfirmWait => Some(TemplateId::HandoffReconfirm),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_selection_resets_streaks() {
        let sel = TemplateSelector::new().select(
            CallPhase::Qa,
            HandoffState::Idle,
            Resolution::Answer(CoarseIntent::Inquiry),
        );
        assert_eq!(sel.templates, vec![TemplateId::InquiryAnswer, TemplateId::FollowupPrompt]);
        assert_eq!(sel.unclear.apply(5), 0);
        assert_eq!(sel.not_heard.apply(3), 0);
    }

    #[test]
    fn test_failure_selection_counts_consecutively() {
        let selector = TemplateSelector::new();
        let unclear = selector.select(CallPhase::Closing, HandoffState::Idle, Resolution::Unclear);
        assert_eq!(
            unclear.templates,
            vec![TemplateId::UnclearReprompt, TemplateId::ClosingPrompt]
        );
        assert_eq!(unclear.unclear.apply(1), 2);
        assert_eq!(unclear.not_heard.apply(1), 0);

        let not_heard = selector.select(
            CallPhase::Qa,
            HandoffState::Idle,
            Resolution::NotHeard { reprompt: true },
        );
        assert_eq!(not_heard.templates, vec![TemplateId::NotHeardReprompt]);
        assert_eq!(not_heard.not_heard.apply(0), 1);
        assert_eq!(not_heard.unclear.apply(1), 0);
    }

    #[test]
    fn test_handoff_outcomes_map_to_fixed_templates() {
        assert_eq!(
            TemplateSelector::handoff_templates(HandoffOutcome::Accepted),
            vec![TemplateId::TransferNotice, TemplateId::HoldNotice]
        );
        assert_eq!(
            TemplateSelector::handoff_templates(HandoffOutcome::Declined),
            vec![TemplateId::DeclineAck, TemplateId::Goodbye]
        );
        assert_eq!(TemplateId::AutoHandoffConfirm.as_str(), "auto_handoff_confirm");
        assert_eq!(
            serde_json::to_string(&TemplateId::HoldNotice).unwrap(),
            "\"hold_notice\""
        );
    }
}
