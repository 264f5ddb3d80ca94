//! Inbound call events and the per-turn output handed to the TTS/telephony side.

use crate::arbiter::TransferStatus;
use crate::guard::ForceReason;
use crate::intent::CoarseIntent;
use crate::session::{CallPhase, HandoffState};
use crate::templates::TemplateId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One recognition result from the ASR collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub call_id: String,
    /// Empty for a "could not hear" outcome.
    #[serde(default)]
    pub recognized_text: String,
    /// Only final results drive transitions.
    pub is_final: bool,
    #[serde(default)]
    pub coarse_intent: CoarseIntent,
}

impl RecognitionEvent {
    pub fn new(call_id: impl Into<String>, text: impl Into<String>, intent: CoarseIntent) -> Self {
        Self {
            call_id: call_id.into(),
            recognized_text: text.into(),
            is_final: true,
            coarse_intent: intent,
        }
    }

    pub fn interim(mut self) -> Self {
        self.is_final = false;
        self
    }
}

/// Everything the surrounding system can tell the core about a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    CallStarted {
        call_id: String,
    },
    Utterance(RecognitionEvent),
    Hangup {
        call_id: String,
    },
    /// The recognizer stream itself broke.
    RecognitionFailed {
        call_id: String,
        #[serde(default)]
        reason: String,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            Self::CallStarted { call_id }
            | Self::Hangup { call_id }
            | Self::RecognitionFailed { call_id, .. } => call_id,
            Self::Utterance(event) => &event.call_id,
        }
    }
}

/// Result of one processed event.
#[derive(Debug, Serialize)]
pub struct TurnOutput {
    pub call_id: String,
    pub phase: CallPhase,
    pub handoff_state: HandoffState,
    /// Ordered template identifiers to speak.
    pub templates: Vec<TemplateId>,
    pub transfer_dispatched: bool,
    /// Ask the PBX to hang up after this delay.
    pub disconnect_after_ms: Option<u64>,
    /// Set when the misunderstanding guard or a recognizer failure forced the handoff.
    pub forced: Option<ForceReason>,
    /// Completion of the transfer dispatched this turn, if any.
    #[serde(skip)]
    pub transfer_task: Option<JoinHandle<TransferStatus>>,
}

impl TurnOutput {
    pub fn disconnect_after(&self) -> Option<Duration> {
        self.disconnect_after_ms.map(Duration::from_millis)
    }

    /// Wait for the transfer dispatched this turn to report back.
    pub async fn transfer_result(&mut self) -> Option<TransferStatus> {
        let task = self.transfer_task.take()?;
        task.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_event_json_shape() {
        let event: CallEvent = serde_json::from_str(
            r#"{"type":"utterance","call_id":"c1","recognized_text":"hi","is_final":true,"coarse_intent":"GREETING"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            CallEvent::Utterance(RecognitionEvent::new("c1", "hi", CoarseIntent::Greeting))
        );
        assert_eq!(event.call_id(), "c1");

        let event: CallEvent =
            serde_json::from_str(r#"{"type":"utterance","call_id":"c2","is_final":true}"#).unwrap();
        match event {
            CallEvent::Utterance(e) => {
                assert!(e.recognized_text.is_empty());
                assert_eq!(e.coarse_intent, CoarseIntent::Unknown);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event: CallEvent =
            serde_json::from_str(r#"{"type":"recognition_failed","call_id":"c3"}"#).unwrap();
        assert_eq!(event.call_id(), "c3");
    }
}
