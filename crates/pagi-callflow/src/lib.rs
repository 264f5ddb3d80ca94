//! # PAGI Callflow - Call Conversation Phases & Operator Handoff
//!
//! Decides, turn by turn, what an automated phone agent says next and when a caller
//! is handed to a human operator. Audio, recognition and speech synthesis live
//! elsewhere; this crate consumes recognition events and emits template ids plus
//! transfer / disconnect actions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CallflowEngine                          │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ SessionStore │→ │ PhaseMachine     │→ │  Template    │  │
//! │  │ (per-call    │  │  ├ Misunderstand │  │  Selector    │  │
//! │  │  lock)       │  │  │   Guard       │  └──────────────┘  │
//! │  └──────────────┘  │  └ HandoffState  │         ↓          │
//! │                    │     Machine      │  ┌──────────────┐  │
//! │                    └──────────────────┘→ │  Transfer    │  │
//! │                                          │  Arbiter     │  │
//! │                                          └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The arbiter is the only component that calls the PBX; everything else only
//! records intent.

pub mod arbiter;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod handoff;
pub mod intent;
pub mod lexicon;
pub mod phase;
pub mod session;
pub mod store;
pub mod templates;

pub use arbiter::{
    LoggingTransferExecutor, TransferArbiter, TransferExecutor, TransferRequest, TransferStatus,
    TriggerOutcome, WebhookTransferExecutor,
};
pub use config::{CallflowConfig, ForcedRejectionPolicy, HandoffLexicon, KeywordSets};
pub use engine::CallflowEngine;
pub use error::{CallflowError, CallflowResult, TransferError};
pub use events::{CallEvent, RecognitionEvent, TurnOutput};
pub use guard::{ForceReason, GuardVerdict, MisunderstandingGuard};
pub use handoff::{HandoffDecision, HandoffOutcome, HandoffStateMachine};
pub use intent::{CoarseIntent, TurnInput};
pub use phase::{ConversationPhaseMachine, PhaseStep};
pub use session::{CallPhase, CallSession, HandoffState, InvariantViolation};
pub use store::{SessionHandle, SessionStore};
pub use templates::{Resolution, TemplateId, TemplateSelector};
