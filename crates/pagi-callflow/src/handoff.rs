//! HandoffStateMachine: resolves the caller's reply to "shall I transfer you?".
//!
//! `decide` is pure. It proposes a transfer; it never performs one. Resolution order
//! for the current utterance:
//!
//! 1. affirmative marker followed by a topic shift ("yes, but how much...") → ambiguous
//! 2. hedged answer ("sure, whatever", "i guess") → ambiguous
//! 3. a yes and a no in the same reply ("yes... no") → ambiguous
//! 4. explicit negative intent or a clear negative marker → NO
//! 5. explicit affirmative intent or a clean affirmative marker → YES
//! 6. anything else → ambiguous: re-prompt once, then default to YES
//!
//! Affirmative and negative markers compete longest-match-first, so "no" inside
//! "no problem" is not a rejection.
//!
//! The safe default in 6 prefers a human over looping a caller who cannot give a
//! clear second answer.

use crate::config::{CallflowConfig, HandoffLexicon};
use crate::intent::CoarseIntent;
use crate::lexicon::{normalize, resolve_overlaps, tokenize, PhraseSet, Span};
use crate::session::{CallPhase, HandoffState, SessionMeta, META_HANDOFF_OUTCOME};
use crate::templates::{TemplateId, TemplateSelector};
use serde::{Deserialize, Serialize};

const MAX_REPLY_AUDIT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffOutcome {
    /// Clear yes: request the transfer.
    Accepted,
    /// Second ambiguous reply: transfer anyway.
    SafeDefaultAccepted,
    /// Clear no: say goodbye and end the call.
    Declined,
    /// Clear no, call continues with the follow-up question.
    DeclinedContinue,
    /// First ambiguous reply: ask again.
    Reprompt,
}

impl HandoffOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::SafeDefaultAccepted => "safe_default_accepted",
            Self::Declined => "declined",
            Self::DeclinedContinue => "declined_continue",
            Self::Reprompt => "reprompt",
        }
    }

    pub fn requests_transfer(&self) -> bool {
        matches!(self, Self::Accepted | Self::SafeDefaultAccepted)
    }
}

/// Why a reply could not be taken at face value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambiguity {
    AffirmativeWithTopicShift,
    HedgedAnswer,
    /// Both an agreement and a rejection.
    MixedAnswer,
    Unrecognized,
}

impl Ambiguity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AffirmativeWithTopicShift => "affirmative_with_topic_shift",
            Self::HedgedAnswer => "hedged_answer",
            Self::MixedAnswer => "mixed_answer",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// How one utterance reads, before retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Affirmative,
    Negative,
    Ambiguous(Ambiguity),
}

/// Proposed effect of one confirmation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffDecision {
    pub outcome: HandoffOutcome,
    pub templates: Vec<TemplateId>,
    pub handoff_state: HandoffState,
    /// `None` keeps the current phase.
    pub phase: Option<CallPhase>,
    pub retry_count: u32,
    pub request_transfer: bool,
    pub handoff_completed: bool,
    /// Move toward END (schedules the auto-disconnect).
    pub end_call: bool,
    pub meta: SessionMeta,
}

#[derive(Debug, Clone)]
pub struct HandoffStateMachine {
    affirmative: PhraseSet,
    topic_shift: PhraseSet,
    hedges: PhraseSet,
    negative: PhraseSet,
    decline_ends_call: bool,
}

impl Default for HandoffStateMachine {
    fn default() -> Self {
        Self::from_config(&CallflowConfig::default())
    }
}

impl HandoffStateMachine {
    pub fn from_config(config: &CallflowConfig) -> Self {
        Self::new(&config.handoff, config.decline_ends_call)
    }

    pub fn new(lexicon: &HandoffLexicon, decline_ends_call: bool) -> Self {
        Self {
            affirmative: PhraseSet::new(&lexicon.affirmative),
            topic_shift: PhraseSet::new(&lexicon.topic_shift),
            hedges: PhraseSet::new(&lexicon.hedges),
            negative: PhraseSet::new(&lexicon.negative),
            decline_ends_call,
        }
    }

    /// Resolve one reply while a confirmation is pending. Never fails: unrecognized
    /// intents and empty text fall through to the ambiguous branch.
    pub fn decide(
        &self,
        intent: CoarseIntent,
        raw_text: &str,
        normalized_text: &str,
        retry_count: u32,
    ) -> HandoffDecision {
        let renormalized;
        let normalized = if normalized_text.is_empty() && !raw_text.trim().is_empty() {
            renormalized = normalize(raw_text);
            renormalized.as_str()
        } else {
            normalized_text
        };

        let reading = self.read(intent, &tokenize(normalized));
        let outcome = match reading {
            Reading::Negative if self.decline_ends_call => HandoffOutcome::Declined,
            Reading::Negative => HandoffOutcome::DeclinedContinue,
            Reading::Affirmative => HandoffOutcome::Accepted,
            Reading::Ambiguous(_) if retry_count == 0 => HandoffOutcome::Reprompt,
            Reading::Ambiguous(_) => HandoffOutcome::SafeDefaultAccepted,
        };

        let mut meta = SessionMeta::new();
        meta.insert(META_HANDOFF_OUTCOME.to_string(), outcome.as_str().into());
        if let Reading::Ambiguous(cause) = reading {
            meta.insert("handoff_ambiguity".to_string(), cause.as_str().into());
        }
        let reply: String = raw_text.chars().take(MAX_REPLY_AUDIT_CHARS).collect();
        meta.insert("handoff_reply".to_string(), reply.into());

        self.decision_for(outcome, meta)
    }

    /// Classify one tokenized reply, applying steps 1 to 5 of the resolution order.
    pub fn read(&self, intent: CoarseIntent, tokens: &[&str]) -> Reading {
        let hedges = self.hedges.find_all(tokens);
        // A negative inside a hedge ("i don't know") is not a rejection.
        let negatives: Vec<Span> = self
            .negative
            .find_all(tokens)
            .into_iter()
            .filter(|n| !hedges.iter().any(|h| h.overlaps(n)))
            .collect();
        let affirmatives: Vec<Span> = self
            .affirmative
            .find_all(tokens)
            .into_iter()
            .filter(|a| !hedges.iter().any(|h| h.overlaps(a)))
            .collect();
        let (affirmatives, negatives) = resolve_overlaps(affirmatives, negatives);
        let shifts = self.topic_shift.find_all(tokens);
        let affirmative_intent = matches!(
            intent,
            CoarseIntent::HandoffYes | CoarseIntent::HandoffRequest
        );

        // 1. "yes, but ..." starts a new question rather than confirming.
        if let Some(first) = affirmatives.first() {
            if shifts.iter().any(|s| s.start >= first.end) {
                return Reading::Ambiguous(Ambiguity::AffirmativeWithTopicShift);
            }
        } else if affirmative_intent && negatives.is_empty() && !shifts.is_empty() {
            return Reading::Ambiguous(Ambiguity::AffirmativeWithTopicShift);
        }

        // 2. Hedged agreement.
        if !hedges.is_empty() && negatives.is_empty() {
            return Reading::Ambiguous(Ambiguity::HedgedAnswer);
        }

        let agrees = affirmative_intent || !affirmatives.is_empty();
        let rejects = intent == CoarseIntent::HandoffNo || !negatives.is_empty();
        match (agrees, rejects) {
            // 3. Contradictory reply; hanging up on a caller who also said yes is not safe.
            (true, true) => return Reading::Ambiguous(Ambiguity::MixedAnswer),
            // 4. Rejection.
            (false, true) => return Reading::Negative,
            // 5. Agreement.
            (true, false) => return Reading::Affirmative,
            (false, false) => {}
        }

        Reading::Ambiguous(Ambiguity::Unrecognized)
    }

    fn decision_for(&self, outcome: HandoffOutcome, meta: SessionMeta) -> HandoffDecision {
        let templates = TemplateSelector::handoff_templates(outcome);
        match outcome {
            HandoffOutcome::Accepted | HandoffOutcome::SafeDefaultAccepted => HandoffDecision {
                outcome,
                templates,
                handoff_state: HandoffState::Done,
                phase: Some(CallPhase::HandoffDone),
                retry_count: 0,
                request_transfer: true,
                handoff_completed: true,
                end_call: false,
                meta,
            },
            HandoffOutcome::Declined => HandoffDecision {
                outcome,
                templates,
                handoff_state: HandoffState::Done,
                phase: Some(CallPhase::End),
                retry_count: 0,
                request_transfer: false,
                handoff_completed: true,
                end_call: true,
                meta,
            },
            HandoffOutcome::DeclinedContinue => HandoffDecision {
                outcome,
                templates,
                handoff_state: HandoffState::Done,
                phase: Some(CallPhase::AfterFollowup),
                retry_count: 0,
                request_transfer: false,
                handoff_completed: true,
                end_call: false,
                meta,
            },
            HandoffOutcome::Reprompt => HandoffDecision {
                outcome,
                templates,
                handoff_state: HandoffState::Confirming,
                phase: None,
                retry_count: 1,
                request_transfer: false,
                handoff_completed: false,
                end_call: false,
                meta,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(sm: &HandoffStateMachine, intent: CoarseIntent, text: &str, retry: u32) -> HandoffDecision {
        sm.decide(intent, text, &normalize(text), retry)
    }

    #[test]
    fn test_yes_but_pricing_is_not_a_transfer() {
        let sm = HandoffStateMachine::default();
        for intent in [CoarseIntent::HandoffYes, CoarseIntent::Unknown, CoarseIntent::Inquiry] {
            let d = decide(&sm, intent, "yes, but what about pricing", 0);
            assert_eq!(d.outcome, HandoffOutcome::Reprompt);
            assert_eq!(d.handoff_state, HandoffState::Confirming);
            assert!(!d.request_transfer);
            assert_eq!(d.retry_count, 1);
            assert_eq!(d.phase, None);
            assert_eq!(
                d.meta.get("handoff_ambiguity").and_then(|v| v.as_str()),
                Some("affirmative_with_topic_shift")
            );
        }
    }

    #[test]
    fn test_two_ambiguous_replies_default_to_transfer() {
        let sm = HandoffStateMachine::default();
        let first = decide(&sm, CoarseIntent::Unknown, "umm...", 0);
        assert_eq!(first.handoff_state, HandoffState::Confirming);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.templates, vec![TemplateId::HandoffReconfirm]);

        let second = decide(&sm, CoarseIntent::Unknown, "well, maybe", first.retry_count);
        assert_eq!(second.outcome, HandoffOutcome::SafeDefaultAccepted);
        assert_eq!(second.handoff_state, HandoffState::Done);
        assert!(second.request_transfer);
        assert!(second.handoff_completed);
        assert_eq!(second.retry_count, 0);
        assert_eq!(second.phase, Some(CallPhase::HandoffDone));
    }

    #[test]
    fn test_clear_yes_requests_transfer() {
        let sm = HandoffStateMachine::default();
        let d = decide(&sm, CoarseIntent::HandoffYes, "Yes please.", 0);
        assert_eq!(d.outcome, HandoffOutcome::Accepted);
        assert_eq!(d.templates, vec![TemplateId::TransferNotice, TemplateId::HoldNotice]);
        assert!(d.request_transfer && d.handoff_completed && !d.end_call);

        // The label can be wrong; a clean affirmative in the text still counts.
        let d = decide(&sm, CoarseIntent::Unknown, "okay connect me", 0);
        assert_eq!(d.outcome, HandoffOutcome::Accepted);
    }

    #[test]
    fn test_clear_no_ends_call() {
        let sm = HandoffStateMachine::default();
        let d = decide(&sm, CoarseIntent::Unknown, "No thank you", 1);
        assert_eq!(d.outcome, HandoffOutcome::Declined);
        assert_eq!(d.handoff_state, HandoffState::Done);
        assert_eq!(d.phase, Some(CallPhase::End));
        assert_eq!(d.templates, vec![TemplateId::DeclineAck, TemplateId::Goodbye]);
        assert!(d.end_call && d.handoff_completed && !d.request_transfer);
        assert_eq!(d.retry_count, 0);

        let d = decide(&sm, CoarseIntent::HandoffNo, "", 0);
        assert_eq!(d.outcome, HandoffOutcome::Declined);
    }

    #[test]
    fn test_hedges_are_ambiguous() {
        let sm = HandoffStateMachine::default();
        for text in ["sure, whatever", "well, I guess so", "I don't know"] {
            let reading = sm.read(CoarseIntent::HandoffYes, &tokenize(&normalize(text)));
            assert_eq!(reading, Reading::Ambiguous(Ambiguity::HedgedAnswer), "{}", text);
        }
        // A hedge does not mask a real rejection.
        let reading = sm.read(CoarseIntent::Unknown, &tokenize(&normalize("maybe not now")));
        assert_eq!(reading, Reading::Negative);
    }

    #[test]
    fn test_agreement_with_incidental_no_is_not_a_decline() {
        let sm = HandoffStateMachine::default();
        for text in ["yes, no problem", "yes please, don't hang up", "sure, I don't mind"] {
            let d = decide(&sm, CoarseIntent::HandoffYes, text, 0);
            assert_eq!(d.outcome, HandoffOutcome::Accepted, "{}", text);
            assert!(d.request_transfer && !d.end_call, "{}", text);
        }
    }

    #[test]
    fn test_yes_and_no_together_reprompts() {
        let sm = HandoffStateMachine::default();
        let d = decide(&sm, CoarseIntent::Unknown, "yes... no", 0);
        assert_eq!(d.outcome, HandoffOutcome::Reprompt);
        assert_eq!(
            d.meta.get("handoff_ambiguity").and_then(|v| v.as_str()),
            Some("mixed_answer")
        );
        // The classifier's yes against a spoken no is just as unclear.
        let d = decide(&sm, CoarseIntent::HandoffYes, "no", 0);
        assert_eq!(d.outcome, HandoffOutcome::Reprompt);
        assert!(!d.end_call);
        // Second time round the safe default still connects.
        let d = decide(&sm, CoarseIntent::HandoffYes, "no", 1);
        assert_eq!(d.outcome, HandoffOutcome::SafeDefaultAccepted);
    }

    #[test]
    fn test_decline_can_continue_call() {
        let sm = HandoffStateMachine::new(&HandoffLexicon::default(), false);
        let d = decide(&sm, CoarseIntent::HandoffNo, "no", 0);
        assert_eq!(d.outcome, HandoffOutcome::DeclinedContinue);
        assert_eq!(d.phase, Some(CallPhase::AfterFollowup));
        assert!(!d.end_call);
    }

    #[test]
    fn test_empty_input_never_panics_and_reprompts() {
        let sm = HandoffStateMachine::default();
        let d = sm.decide(CoarseIntent::from_label("???"), "", "", 0);
        assert_eq!(d.outcome, HandoffOutcome::Reprompt);
        // Un-normalized callers still get matched.
        let d = sm.decide(CoarseIntent::Unknown, "YES!", "", 0);
        assert_eq!(d.outcome, HandoffOutcome::Accepted);
    }

    #[test]
    fn test_retry_only_survives_while_confirming() {
        let sm = HandoffStateMachine::default();
        let replies = ["", "yes", "no", "yes but how much", "sure whatever", "hmm", "cancel"];
        let intents = [
            CoarseIntent::Unknown,
            CoarseIntent::HandoffYes,
            CoarseIntent::HandoffNo,
            CoarseIntent::NotHeard,
        ];
        for text in replies {
            for intent in intents {
                for retry in 0..3 {
                    let d = decide(&sm, intent, text, retry);
                    if d.retry_count > 0 {
                        assert_eq!(d.handoff_state, HandoffState::Confirming);
                    }
                    assert_eq!(d.request_transfer, d.outcome.requests_transfer());
                }
            }
        }
    }
}
