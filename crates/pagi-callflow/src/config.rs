//! Call-flow configuration, loaded once per client/tenant.
//!
//! Precedence (lowest first): built-in defaults → `PAGI_CALLFLOW_CONFIG` file (or
//! `config/callflow.toml`) → `<client_id>.toml` in the directory named after that file
//! (`config/callflow/` by default) → `PAGI_CALLFLOW_*` env.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PAGI_CALLFLOW_UNCLEAR_STREAK_THRESHOLD | 2 | Consecutive "could not understand" turns before auto-handoff. |
//! | PAGI_CALLFLOW_NOT_HEARD_STREAK_THRESHOLD | 2 | Consecutive "could not hear" turns before auto-handoff. |
//! | PAGI_CALLFLOW_NOT_HEARD_REPROMPT_THRESHOLD | 1 | Not-heard streak at which "could not hear you" is spoken. |
//! | PAGI_CALLFLOW_AUTO_DISCONNECT_DELAY_MS | 5000 | Delay before the PBX hangs up after a goodbye. |
//! | PAGI_CALLFLOW_FORCED_HANDOFF_REJECTION | confirm | `confirm` \| `immediate` (see [`ForcedRejectionPolicy`]). |
//! | PAGI_CALLFLOW_DECLINE_ENDS_CALL | true | A "no" to the handoff question ends the call. |
//! | PAGI_CALLFLOW_MAX_TRANSFER_ATTEMPTS | 2 | Failed transfers tolerated before giving up. |
//! | PAGI_CALLFLOW_TOMBSTONE_TTL_SECS | 3600 | How long a hung-up call id keeps ignoring late events. |
//! | PAGI_CALLFLOW_ENTRY_TRIGGER_KEYWORDS | (list) | Comma separated; same for the other keyword sets. |
//! | PAGI_CALLFLOW_HANDOFF__HEDGES | (list) | Comma separated; also `__AFFIRMATIVE`, `__NEGATIVE`, `__TOPIC_SHIFT`. |

use crate::lexicon::PhraseSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/callflow.toml";
const ENV_PREFIX: &str = "PAGI_CALLFLOW";

/// What happens when an automatically forced handoff meets an unambiguous rejection
/// in the very utterance that tripped the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedRejectionPolicy {
    /// Always speak the handoff prompt and take one confirmation turn.
    #[default]
    Confirm,
    /// Skip the prompt and end the call politely.
    Immediate,
}

/// Marker phrases used to resolve replies to "shall I transfer you?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffLexicon {
    #[serde(default = "default_affirmative")]
    pub affirmative: Vec<String>,
    #[serde(default = "default_topic_shift")]
    pub topic_shift: Vec<String>,
    #[serde(default = "default_hedges")]
    pub hedges: Vec<String>,
    #[serde(default = "default_negative")]
    pub negative: Vec<String>,
}

impl Default for HandoffLexicon {
    fn default() -> Self {
        Self {
            affirmative: default_affirmative(),
            topic_shift: default_topic_shift(),
            hedges: default_hedges(),
            negative: default_negative(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallflowConfig {
    /// Phrases that mark an opening as a likely sales call (ENTRY → ENTRY_CONFIRM).
    #[serde(default = "default_entry_triggers")]
    pub entry_trigger_keywords: Vec<String>,
    #[serde(default = "default_closing_yes")]
    pub closing_yes_keywords: Vec<String>,
    #[serde(default = "default_closing_no")]
    pub closing_no_keywords: Vec<String>,
    /// "Nothing else" style answers to the follow-up question (AFTER_FOLLOWUP → CLOSING).
    #[serde(default = "default_negative_closing")]
    pub negative_closing_keywords: Vec<String>,
    #[serde(default = "default_streak_threshold")]
    pub unclear_streak_threshold: u32,
    #[serde(default = "default_streak_threshold")]
    pub not_heard_streak_threshold: u32,
    #[serde(default = "default_reprompt_threshold")]
    pub not_heard_reprompt_threshold: u32,
    #[serde(default = "default_disconnect_delay_ms")]
    pub auto_disconnect_delay_ms: u64,
    #[serde(default)]
    pub forced_handoff_rejection: ForcedRejectionPolicy,
    #[serde(default = "default_true")]
    pub decline_ends_call: bool,
    #[serde(default = "default_max_transfer_attempts")]
    pub max_transfer_attempts: u32,
    /// Age after which `sweep_ended` forgets a hung-up call id.
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,
    #[serde(default)]
    pub handoff: HandoffLexicon,
}

impl Default for CallflowConfig {
    fn default() -> Self {
        Self {
            entry_trigger_keywords: default_entry_triggers(),
            closing_yes_keywords: default_closing_yes(),
            closing_no_keywords: default_closing_no(),
            negative_closing_keywords: default_negative_closing(),
            unclear_streak_threshold: default_streak_threshold(),
            not_heard_streak_threshold: default_streak_threshold(),
            not_heard_reprompt_threshold: default_reprompt_threshold(),
            auto_disconnect_delay_ms: default_disconnect_delay_ms(),
            forced_handoff_rejection: ForcedRejectionPolicy::default(),
            decline_ends_call: true,
            max_transfer_attempts: default_max_transfer_attempts(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
            handoff: HandoffLexicon::default(),
        }
    }
}

impl CallflowConfig {
    /// Load the shared configuration (no client overlay).
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::build(None)
    }

    /// Load the configuration for one client: shared file, then the client's overlay.
    pub fn load_for_client(client_id: &str) -> Result<Self, config::ConfigError> {
        Self::build(Some(client_id))
    }

    /// `config/callflow.toml` → `config/callflow/<client_id>.toml`.
    fn client_overlay_path(base_path: &Path, client_id: &str) -> PathBuf {
        base_path
            .with_extension("")
            .join(format!("{}.toml", client_id))
    }

    /// Parse a TOML document on top of the defaults (no file or env lookup).
    pub fn from_toml_str(source: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn build(client_id: Option<&str>) -> Result<Self, config::ConfigError> {
        let base_path = std::env::var("PAGI_CALLFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut builder = config::Config::builder()
            .add_source(config::File::from(base_path.as_path()).required(false));
        if let Some(id) = client_id {
            let overlay = Self::client_overlay_path(&base_path, id);
            builder = builder.add_source(config::File::from(overlay.as_path()).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("entry_trigger_keywords")
                    .with_list_parse_key("closing_yes_keywords")
                    .with_list_parse_key("closing_no_keywords")
                    .with_list_parse_key("negative_closing_keywords")
                    .with_list_parse_key("handoff.affirmative")
                    .with_list_parse_key("handoff.topic_shift")
                    .with_list_parse_key("handoff.hedges")
                    .with_list_parse_key("handoff.negative"),
            )
            .build()?
            .try_deserialize()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn auto_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.auto_disconnect_delay_ms)
    }

    pub fn tombstone_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.tombstone_ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

/// Keyword sets compiled to phrase matchers, built once per engine.
#[derive(Debug, Clone)]
pub struct KeywordSets {
    pub entry_trigger: PhraseSet,
    pub closing_yes: PhraseSet,
    pub closing_no: PhraseSet,
    pub negative_closing: PhraseSet,
}

impl KeywordSets {
    pub fn from_config(config: &CallflowConfig) -> Self {
        Self {
            entry_trigger: PhraseSet::new(&config.entry_trigger_keywords),
            closing_yes: PhraseSet::new(&config.closing_yes_keywords),
            closing_no: PhraseSet::new(&config.closing_no_keywords),
            negative_closing: PhraseSet::new(&config.negative_closing_keywords),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_streak_threshold() -> u32 {
    2
}

fn default_reprompt_threshold() -> u32 {
    1
}

fn default_disconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_transfer_attempts() -> u32 {
    2
}

fn default_tombstone_ttl_secs() -> u64 {
    3_600
}

fn default_entry_triggers() -> Vec<String> {
    strings(&[
        "calling from",
        "on behalf of",
        "i'd like to introduce",
        "we offer",
        "special offer",
        "business proposal",
        "sales",
    ])
}

fn default_closing_yes() -> Vec<String> {
    strings(&["yes", "yeah", "yep", "sure", "please", "ok", "okay", "that would be great"])
}

fn default_closing_no() -> Vec<String> {
    strings(&["no", "nope", "no thanks", "no thank you", "not necessary", "i'm fine", "that's ok"])
}

fn default_negative_closing() -> Vec<String> {
    strings(&[
        "that's all",
        "that's it",
        "nothing else",
        "no more questions",
        "i'm good",
        "no",
        "nope",
        "no thanks",
    ])
}

fn default_affirmative() -> Vec<String> {
    strings(&[
        "yes",
        "no problem",
        "of course",
        "yeah",
        "yep",
        "sure",
        "please",
        "ok",
        "okay",
        "go ahead",
        "connect me",
        "transfer me",
        "put me through",
    ])
}

fn default_topic_shift() -> Vec<String> {
    strings(&[
        "but",
        "before that",
        "actually",
        "wait",
        "what",
        "how",
        "why",
        "when",
        "where",
        "which",
        "price",
        "pricing",
        "cost",
        "how much",
        "fee",
        "fees",
        "feature",
        "features",
        "plan",
    ])
}

fn default_hedges() -> Vec<String> {
    strings(&[
        "i guess",
        "i suppose",
        "whatever",
        "maybe",
        "perhaps",
        "kind of",
        "sort of",
        "not sure",
        "i don't know",
        "dunno",
        "if you want",
        "i think so",
    ])
}

fn default_negative() -> Vec<String> {
    strings(&[
        "no",
        "nope",
        "don't transfer",
        "do not transfer",
        "don't connect me",
        "not now",
        "no thanks",
        "no thank you",
        "never mind",
        "nevermind",
        "cancel",
        "not necessary",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = CallflowConfig::default();
        assert_eq!(cfg.unclear_streak_threshold, 2);
        assert_eq!(cfg.not_heard_streak_threshold, 2);
        assert_eq!(cfg.auto_disconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.forced_handoff_rejection, ForcedRejectionPolicy::Confirm);
        assert!(cfg.decline_ends_call);
    }

    #[test]
    fn test_from_toml_overrides_only_given_keys() {
        let cfg = CallflowConfig::from_toml_str(
            r#"
            unclear_streak_threshold = 3
            forced_handoff_rejection = "immediate"
            closing_no_keywords = ["no way"]

            [handoff]
            hedges = ["meh"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.unclear_streak_threshold, 3);
        assert_eq!(cfg.not_heard_streak_threshold, 2);
        assert_eq!(cfg.forced_handoff_rejection, ForcedRejectionPolicy::Immediate);
        assert_eq!(cfg.closing_no_keywords, vec!["no way".to_string()]);
        assert_eq!(cfg.handoff.hedges, vec!["meh".to_string()]);
        assert_eq!(cfg.handoff.negative, default_negative());
    }

    #[test]
    fn test_file_source_and_toml_render() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "auto_disconnect_delay_ms = 1500").unwrap();
        let cfg: CallflowConfig = config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.auto_disconnect_delay_ms, 1500);

        let rendered = cfg.to_toml_string().unwrap();
        assert!(rendered.contains("auto_disconnect_delay_ms = 1500"));
        assert_eq!(CallflowConfig::from_toml_str(&rendered).unwrap(), cfg);
    }

    // The only test that touches PAGI_CALLFLOW_* variables.
    #[test]
    fn test_client_overlay_and_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("callflow.toml");
        std::fs::write(
            &base,
            "unclear_streak_threshold = 3\ndecline_ends_call = false\nmax_transfer_attempts = 3\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("callflow")).unwrap();
        let mut overlay = std::fs::File::create(dir.path().join("callflow").join("acme.toml")).unwrap();
        writeln!(overlay, "unclear_streak_threshold = 4").unwrap();
        writeln!(overlay, "[handoff]").unwrap();
        writeln!(overlay, "hedges = [\"meh\"]").unwrap();
        drop(overlay);

        let vars = [
            ("PAGI_CALLFLOW_CONFIG", base.to_string_lossy().into_owned()),
            ("PAGI_CALLFLOW_CLOSING_NO_KEYWORDS", "nah,no way".to_string()),
            ("PAGI_CALLFLOW_MAX_TRANSFER_ATTEMPTS", "4".to_string()),
            ("PAGI_CALLFLOW_HANDOFF__NEGATIVE", "stop,hang up".to_string()),
        ];
        for (key, value) in &vars {
            std::env::set_var(key, value);
        }
        let client = CallflowConfig::load_for_client("acme");
        let shared = CallflowConfig::load();
        let missing = CallflowConfig::load_for_client("nobody");
        for (key, _) in &vars {
            std::env::remove_var(key);
        }

        let client = client.unwrap();
        assert_eq!(client.unclear_streak_threshold, 4);
        assert!(!client.decline_ends_call);
        assert_eq!(client.max_transfer_attempts, 4);
        assert_eq!(client.closing_no_keywords, vec!["nah".to_string(), "no way".to_string()]);
        assert_eq!(client.handoff.hedges, vec!["meh".to_string()]);
        assert_eq!(
            client.handoff.negative,
            vec!["stop".to_string(), "hang up".to_string()]
        );
        assert_eq!(client.closing_yes_keywords, default_closing_yes());

        let shared = shared.unwrap();
        assert_eq!(shared.unclear_streak_threshold, 3);
        assert_eq!(shared.max_transfer_attempts, 4);
        assert_eq!(shared.handoff.hedges, default_hedges());

        // No overlay file for this client: base plus env only.
        assert_eq!(missing.unwrap().unclear_streak_threshold, 3);
    }
}
