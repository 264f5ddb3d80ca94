//! ConversationPhaseMachine: drives one call through its phases, one final utterance
//! at a time.
//!
//! Each turn is planned first and applied second. The plan is what the utterance
//! would do on its own; the misunderstanding guard then looks at the streaks that
//! plan would produce and may replace it with a forced handoff. Only then is the
//! session mutated, templates selected and streaks written back.
//!
//! ```text
//! ENTRY ──► ENTRY_CONFIRM ──► QA ◄──► AFTER_FOLLOWUP ──► CLOSING ──► END
//!   │            │            │             │               │
//!   └────────────┴────────────┴─────┬───────┴───────────────┘
//!                                   ▼
//!                HANDOFF ──► HANDOFF_CONFIRM_WAIT ──► HANDOFF_DONE ──► END
//! ```

use crate::config::{CallflowConfig, KeywordSets};
use crate::guard::{ForceReason, GuardVerdict, MisunderstandingGuard};
use crate::handoff::{HandoffDecision, HandoffOutcome, HandoffStateMachine, Reading};
use crate::intent::{CoarseIntent, TurnInput};
use crate::lexicon::resolve_overlaps;
use crate::session::{
    CallPhase, CallSession, HandoffState, META_AUTO_HANDOFF_REASON, META_AUTO_HANDOFF_STREAK,
    META_CLASSIFIED_INTENT,
};
use crate::templates::{Resolution, TemplateId, TemplateSelector};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What one processed turn produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStep {
    pub resolution: Resolution,
    pub templates: Vec<TemplateId>,
    pub phase: CallPhase,
    pub forced: Option<ForceReason>,
    /// Set when this turn entered END through the disconnect path.
    pub disconnect_after: Option<Duration>,
}

/// Intended effect of a turn, before any mutation.
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    /// Move to (or stay in) `next` and speak `resolution`.
    Respond { next: CallPhase, resolution: Resolution },
    /// Leave through END.
    End(Resolution),
    BeginHandoff { forced: bool },
    Resolve(HandoffDecision),
}

impl Plan {
    fn failure(&self) -> Option<Resolution> {
        match self {
            Plan::Respond { resolution, .. } if resolution.is_failure() => Some(*resolution),
            _ => None,
        }
    }
}

pub struct ConversationPhaseMachine {
    keywords: KeywordSets,
    guard: MisunderstandingGuard,
    handoff: HandoffStateMachine,
    selector: TemplateSelector,
    disconnect_delay: Duration,
    max_transfer_attempts: u32,
}

impl Default for ConversationPhaseMachine {
    fn default() -> Self {
        Self::from_config(&CallflowConfig::default())
    }
}

impl ConversationPhaseMachine {
    pub fn from_config(config: &CallflowConfig) -> Self {
        Self {
            keywords: KeywordSets::from_config(config),
            guard: MisunderstandingGuard::from_config(config),
            handoff: HandoffStateMachine::from_config(config),
            selector: TemplateSelector::new(),
            disconnect_delay: config.auto_disconnect_delay(),
            max_transfer_attempts: config.max_transfer_attempts.max(1),
        }
    }

    pub fn disconnect_delay(&self) -> Duration {
        self.disconnect_delay
    }

    /// Opening line for a freshly connected call. A repeated start notification is silent.
    pub fn greet(&self, session: &mut CallSession) -> PhaseStep {
        if session.phase == CallPhase::Entry
            && session.turn_count == 0
            && session.last_templates.is_empty()
        {
            self.speak(session, Resolution::EntryGreeting)
        } else {
            debug!(call_id = %session.call_id, "Duplicate call start ignored");
            self.speak(session, Resolution::Silent)
        }
    }

    /// Process one final utterance.
    pub fn step(&self, session: &mut CallSession, input: &TurnInput) -> PhaseStep {
        if session.phase == CallPhase::End {
            debug!(call_id = %session.call_id, "Utterance after END ignored");
            return self.speak(session, Resolution::Silent);
        }
        session.turn_count += 1;
        session.last_intent = Some(input.intent);

        let plan = self.route(session, input);
        let verdict = self.check_guard(session, input, &plan);
        match verdict {
            Some(verdict) => {
                // The turn is handled as a handoff request; keep what the classifier said.
                session.last_intent = Some(CoarseIntent::HandoffRequest);
                session.meta.insert(
                    META_CLASSIFIED_INTENT.to_string(),
                    input.intent.as_str().into(),
                );
                let reason = verdict.reason;
                let plan = self.forced_plan(session, input, verdict);
                let mut step = self.apply(session, plan);
                step.forced = reason;
                step
            }
            None => self.apply(session, plan),
        }
    }

    /// The recognizer stream broke: hand the caller to a human without asking.
    pub fn on_recognition_failure(&self, session: &mut CallSession) -> PhaseStep {
        if session.phase == CallPhase::End || session.transfer_executed {
            return self.speak(session, Resolution::Silent);
        }
        if session.transfer_requested {
            // A transfer is already owed; report on it instead of re-arming.
            session.phase = CallPhase::HandoffDone;
            let plan = self.route_handoff_done(session, CoarseIntent::HandoffRequest);
            return self.apply(session, plan);
        }

        warn!(call_id = %session.call_id, phase = ?session.phase, "🎙️ Recognition failed, forcing transfer");
        session
            .meta
            .insert(META_AUTO_HANDOFF_REASON.to_string(), ForceReason::AsrFailure.as_str().into());
        session.transfer_requested = true;
        session.handoff_state = HandoffState::Done;
        session.handoff_retry_count = 0;
        session.handoff_completed = true;
        session.phase = CallPhase::HandoffDone;
        let mut step = self.speak(session, Resolution::RecognitionFailure);
        step.forced = Some(ForceReason::AsrFailure);
        step
    }

    /// Last line of defense: a session in END that owes neither a transfer nor a
    /// disconnect gets its disconnect scheduled now. Returns true if it had to.
    pub fn enforce_end_obligation(&self, session: &mut CallSession, step: &mut PhaseStep) -> bool {
        if session.phase != CallPhase::End || session.end_obligation_met() {
            return false;
        }
        error!(
            call_id = %session.call_id,
            "END reached without transfer or disconnect; scheduling disconnect"
        );
        session.disconnect_scheduled = true;
        step.phase = CallPhase::End;
        step.disconnect_after = Some(self.disconnect_delay);
        true
    }

    fn route(&self, session: &CallSession, input: &TurnInput) -> Plan {
        match session.phase {
            CallPhase::Entry => self.route_entry(session, input),
            CallPhase::EntryConfirm => self.route_entry_confirm(session, input),
            CallPhase::Qa => self.route_qa(session, input),
            CallPhase::AfterFollowup => self.route_after_followup(session, input),
            CallPhase::Closing => self.route_closing(session, input),
            CallPhase::Handoff | CallPhase::HandoffConfirmWait => match session.handoff_state {
                HandoffState::Confirming => Plan::Resolve(self.handoff.decide(
                    input.intent,
                    &input.raw_text,
                    &input.normalized,
                    session.handoff_retry_count,
                )),
                // No question pending; ask it.
                HandoffState::Idle => Plan::BeginHandoff { forced: false },
                HandoffState::Done => self.route_handoff_done(session, input.intent),
            },
            CallPhase::HandoffDone => self.route_handoff_done(session, input.intent),
            CallPhase::End => Plan::Respond {
                next: CallPhase::End,
                resolution: Resolution::Silent,
            },
        }
    }

    /// Checks shared by every non-handoff phase: silence, explicit handoff request, hang-up wish.
    fn route_common(&self, session: &CallSession, input: &TurnInput) -> Option<Plan> {
        if input.is_not_heard() {
            let projected = session.not_heard_streak.saturating_add(1);
            let reprompt = self.guard.should_force_reprompt(projected, session.handoff_state);
            return Some(Plan::Respond {
                next: session.phase,
                resolution: Resolution::NotHeard { reprompt },
            });
        }
        match input.intent {
            CoarseIntent::HandoffRequest => Some(Plan::BeginHandoff { forced: false }),
            CoarseIntent::EndCall => Some(Plan::End(Resolution::Goodbye)),
            _ => None,
        }
    }

    fn route_entry(&self, session: &CallSession, input: &TurnInput) -> Plan {
        if let Some(plan) = self.route_common(session, input) {
            return plan;
        }
        let tokens = input.tokens();
        if input.intent == CoarseIntent::SalesTopic || self.keywords.entry_trigger.matches(&tokens) {
            return Plan::Respond {
                next: CallPhase::EntryConfirm,
                resolution: Resolution::SalesCheck,
            };
        }
        match input.intent {
            CoarseIntent::Unknown => Plan::Respond {
                next: CallPhase::Entry,
                resolution: Resolution::Unclear,
            },
            CoarseIntent::Greeting => Plan::Respond {
                next: CallPhase::Qa,
                resolution: Resolution::EntryPrompt,
            },
            _ => self.route_qa(session, input),
        }
    }

    fn route_entry_confirm(&self, session: &CallSession, input: &TurnInput) -> Plan {
        if let Some(plan) = self.route_common(session, input) {
            return plan;
        }
        let (yes, no) = self.yes_no(
            matches!(input.intent, CoarseIntent::HandoffYes | CoarseIntent::SalesTopic),
            input,
        );
        match (yes, no) {
            (true, false) => Plan::End(Resolution::SalesDecline),
            (false, true) => Plan::Respond {
                next: CallPhase::Qa,
                resolution: Resolution::EntryPrompt,
            },
            _ if input.intent == CoarseIntent::Inquiry => self.route_qa(session, input),
            _ => Plan::Respond {
                next: CallPhase::EntryConfirm,
                resolution: Resolution::Unclear,
            },
        }
    }

    fn route_qa(&self, session: &CallSession, input: &TurnInput) -> Plan {
        if let Some(plan) = self.route_common(session, input) {
            return plan;
        }
        match input.intent {
            CoarseIntent::Unknown => Plan::Respond {
                next: session.phase,
                resolution: Resolution::Unclear,
            },
            intent => Plan::Respond {
                next: CallPhase::AfterFollowup,
                resolution: Resolution::Answer(intent),
            },
        }
    }

    fn route_after_followup(&self, session: &CallSession, input: &TurnInput) -> Plan {
        if let Some(plan) = self.route_common(session, input) {
            return plan;
        }
        let tokens = input.tokens();
        if input.intent == CoarseIntent::HandoffNo
            || self.keywords.negative_closing.matches(&tokens)
        {
            return Plan::Respond {
                next: CallPhase::Closing,
                resolution: Resolution::ClosingPrompt,
            };
        }
        match input.intent {
            CoarseIntent::Inquiry | CoarseIntent::Greeting | CoarseIntent::SalesTopic => {
                Plan::Respond {
                    next: CallPhase::AfterFollowup,
                    resolution: Resolution::Answer(input.intent),
                }
            }
            CoarseIntent::HandoffYes => Plan::Respond {
                next: CallPhase::Qa,
                resolution: Resolution::InviteQuestion,
            },
            _ if self.keywords.closing_yes.matches(&tokens) => Plan::Respond {
                next: CallPhase::Qa,
                resolution: Resolution::InviteQuestion,
            },
            _ => Plan::Respond {
                next: CallPhase::AfterFollowup,
                resolution: Resolution::Unclear,
            },
        }
    }

    fn route_closing(&self, session: &CallSession, input: &TurnInput) -> Plan {
        if let Some(plan) = self.route_common(session, input) {
            return plan;
        }
        let (yes, no) = self.yes_no(input.intent == CoarseIntent::HandoffYes, input);
        match (yes, no) {
            (true, false) => Plan::BeginHandoff { forced: false },
            (false, true) => Plan::End(Resolution::Goodbye),
            _ if matches!(input.intent, CoarseIntent::Inquiry | CoarseIntent::SalesTopic) => {
                Plan::Respond {
                    next: CallPhase::AfterFollowup,
                    resolution: Resolution::Answer(input.intent),
                }
            }
            _ => Plan::Respond {
                next: CallPhase::Closing,
                resolution: Resolution::Unclear,
            },
        }
    }

    /// Yes/no reading of a reply to a closed question. Keyword hits compete longest-match
    /// first, so "no, that's ok" is a plain no even though "ok" alone means yes.
    fn yes_no(&self, yes_intent: bool, input: &TurnInput) -> (bool, bool) {
        let tokens = input.tokens();
        let (yes_spans, no_spans) = resolve_overlaps(
            self.keywords.closing_yes.find_all(&tokens),
            self.keywords.closing_no.find_all(&tokens),
        );
        (
            yes_intent || !yes_spans.is_empty(),
            input.intent == CoarseIntent::HandoffNo || !no_spans.is_empty(),
        )
    }

    /// Transfer already decided; the caller is waiting for the PBX.
    fn route_handoff_done(&self, session: &CallSession, intent: CoarseIntent) -> Plan {
        let asked_again = intent == CoarseIntent::HandoffRequest;
        if session.transfer_executed {
            let resolution = if asked_again {
                Resolution::AlreadyConnecting
            } else {
                Resolution::Silent
            };
            return Plan::End(resolution);
        }
        if session.transfer_in_flight {
            let resolution = if asked_again {
                Resolution::AlreadyConnecting
            } else {
                Resolution::TransferPending
            };
            return Plan::Respond {
                next: CallPhase::HandoffDone,
                resolution,
            };
        }
        if session.transfer_requested {
            if session.transfer_attempts >= self.max_transfer_attempts {
                return Plan::End(Resolution::TransferFailed);
            }
            // The arbiter retries after this turn.
            return Plan::Respond {
                next: CallPhase::HandoffDone,
                resolution: Resolution::TransferPending,
            };
        }
        Plan::End(Resolution::Goodbye)
    }

    /// Projected-streak guard check. Never consulted inside the handoff dialogue.
    fn check_guard(
        &self,
        session: &CallSession,
        input: &TurnInput,
        plan: &Plan,
    ) -> Option<GuardVerdict> {
        if session.phase.is_handoff() || session.phase == CallPhase::End {
            return None;
        }
        let (unclear, not_heard) = match plan.failure()? {
            Resolution::Unclear => (session.unclear_streak.saturating_add(1), 0),
            Resolution::NotHeard { .. } => (0, session.not_heard_streak.saturating_add(1)),
            _ => return None,
        };
        let verdict =
            self.guard
                .should_force_handoff(unclear, not_heard, session.handoff_state, input.intent);
        verdict.force.then_some(verdict)
    }

    fn forced_plan(&self, session: &mut CallSession, input: &TurnInput, verdict: GuardVerdict) -> Plan {
        if let Some(reason) = verdict.reason {
            info!(
                call_id = %session.call_id,
                reason = reason.as_str(),
                streak = verdict.streak,
                "⚠️ Misunderstanding streak, forcing handoff"
            );
            session
                .meta
                .insert(META_AUTO_HANDOFF_REASON.to_string(), reason.as_str().into());
            session
                .meta
                .insert(META_AUTO_HANDOFF_STREAK.to_string(), verdict.streak.into());
        }
        if self.guard.rejection_skips_prompt()
            && self.handoff.read(input.intent, &input.tokens()) == Reading::Negative
        {
            session
                .meta
                .insert("auto_handoff_rejected".to_string(), true.into());
            return Plan::End(Resolution::Handoff(HandoffOutcome::Declined));
        }
        Plan::BeginHandoff { forced: true }
    }

    fn apply(&self, session: &mut CallSession, plan: Plan) -> PhaseStep {
        match plan {
            Plan::Respond { next, resolution } => {
                if next != session.phase {
                    debug!(call_id = %session.call_id, from = ?session.phase, to = ?next, "Phase transition");
                }
                session.phase = next;
                self.speak(session, resolution)
            }
            Plan::End(resolution) => {
                session.phase = CallPhase::End;
                let mut step = self.speak(session, resolution);
                self.enter_end(session, &mut step);
                step
            }
            Plan::BeginHandoff { forced } => self.begin_handoff(session, forced),
            Plan::Resolve(decision) => self.apply_decision(session, decision),
        }
    }

    fn begin_handoff(&self, session: &mut CallSession, forced: bool) -> PhaseStep {
        if session.transfer_requested || session.transfer_executed {
            // Already on the way to an operator; acknowledge without re-arming.
            return self.speak(session, Resolution::AlreadyConnecting);
        }
        let reentry = session.handoff_state == HandoffState::Done;
        session.handoff_state = HandoffState::Confirming;
        session.handoff_retry_count = 0;
        session.handoff_completed = false;
        session.phase = CallPhase::Handoff;
        let mut step = self.speak(session, Resolution::HandoffPrompt { forced });
        // The prompt is out; wait for the answer.
        session.handoff_prompt_sent = true;
        session.phase = CallPhase::HandoffConfirmWait;
        step.phase = session.phase;
        info!(call_id = %session.call_id, forced, reentry, "Handoff confirmation asked");
        step
    }

    fn apply_decision(&self, session: &mut CallSession, decision: HandoffDecision) -> PhaseStep {
        info!(
            call_id = %session.call_id,
            outcome = decision.outcome.as_str(),
            retry = session.handoff_retry_count,
            "Handoff reply resolved"
        );
        session.handoff_state = decision.handoff_state;
        session.handoff_retry_count = decision.retry_count;
        if decision.request_transfer {
            session.transfer_requested = true;
        }
        if decision.handoff_completed {
            session.handoff_completed = true;
        }
        session.meta.extend(decision.meta);
        if let Some(phase) = decision.phase {
            session.phase = phase;
        }
        let mut step = self.speak(session, Resolution::Handoff(decision.outcome));
        if decision.end_call || session.phase == CallPhase::End {
            session.phase = CallPhase::End;
            self.enter_end(session, &mut step);
        }
        step
    }

    /// Entering END: schedule the hang-up unless the call already left via transfer.
    fn enter_end(&self, session: &mut CallSession, step: &mut PhaseStep) {
        step.phase = CallPhase::End;
        if session.transfer_requested && session.transfer_executed {
            return;
        }
        session.disconnect_scheduled = true;
        step.disconnect_after = Some(self.disconnect_delay);
        info!(call_id = %session.call_id, delay_ms = self.disconnect_delay.as_millis() as u64, "Call ending, disconnect scheduled");
    }

    fn speak(&self, session: &mut CallSession, resolution: Resolution) -> PhaseStep {
        let selection = self
            .selector
            .select(session.phase, session.handoff_state, resolution);
        session.unclear_streak = selection.unclear.apply(session.unclear_streak);
        session.not_heard_streak = selection.not_heard.apply(session.not_heard_streak);
        if !selection.templates.is_empty() {
            session.last_templates = selection.templates.clone();
        }
        PhaseStep {
            resolution,
            templates: selection.templates,
            phase: session.phase,
            forced: None,
            disconnect_after: None,
        }
    }
}
