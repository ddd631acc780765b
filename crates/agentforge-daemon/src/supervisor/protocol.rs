//! NDJSON protocol spoken with agent subprocesses.
//!
//! Agents write [`AgentMessage`] lines to stdout; the supervisor answers
//! requests with [`AgentReply`] lines on the agent's stdin.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use agentforge_core::PolicyTier;
use agentforge_core::model::{AgentState, FeatureId, NewFeatureSpec, ReleaseOutcome};

/// Message from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    State {
        state: AgentState,
        #[serde(default)]
        detail: Option<String>,
    },
    CommandRequest {
        request_id: String,
        command: String,
    },
    AccessRequest {
        request_id: String,
        path: PathBuf,
        #[serde(default)]
        write: bool,
    },
    FeatureResult {
        feature_id: FeatureId,
        outcome: ReleaseOutcome,
    },
    /// Initializer only.
    CreateFeatures { features: Vec<NewFeatureSpec> },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

/// Reply written to an agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    CommandDecision {
        request_id: String,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<PolicyTier>,
    },
    AccessDecision {
        request_id: String,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    FeaturesCreated { feature_ids: Vec<FeatureId> },
    Error { message: String },
}

impl AgentReply {
    /// One NDJSON line without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode reply: {e}"}}"#)
        })
    }
}

/// Classified stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutLine {
    Message(AgentMessage),
    /// JSON object that is not a valid message.
    Malformed(String),
    /// Free text.
    Text(String),
}

pub fn parse_line(agent_id: &str, line: &str) -> StdoutLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return StdoutLine::Text(line.to_string());
    }
    match serde_json::from_str::<AgentMessage>(trimmed) {
        Ok(message) => StdoutLine::Message(message),
        Err(e) => {
            debug!(agent_id, error = %e, "Malformed agent message");
            StdoutLine::Malformed(e.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_and_requests() {
        assert_eq!(
            parse_line("a", r#"{"type":"state","state":"working","detail":"editing"}"#),
            StdoutLine::Message(AgentMessage::State {
                state: AgentState::Working,
                detail: Some("editing".into())
            })
        );
        assert_eq!(
            parse_line("a", r#"{"type":"command_request","request_id":"r1","command":"ls -la"}"#),
            StdoutLine::Message(AgentMessage::CommandRequest {
                request_id: "r1".into(),
                command: "ls -la".into()
            })
        );
        assert_eq!(
            parse_line("a", r#"{"type":"feature_result","feature_id":4,"outcome":"passing"}"#),
            StdoutLine::Message(AgentMessage::FeatureResult {
                feature_id: 4,
                outcome: ReleaseOutcome::Passing
            })
        );
    }

    #[test]
    fn create_features_accepts_bulk_specs() {
        let line = r#"{"type":"create_features","features":[{"name":"a"},{"name":"b","depends_on_indices":[0]}]}"#;
        let StdoutLine::Message(AgentMessage::CreateFeatures { features }) = parse_line("a", line)
        else {
            panic!("expected create_features");
        };
        assert_eq!(features.len(), 2);
        assert_eq!(features[1].depends_on_indices, vec![0]);
    }

    #[test]
    fn classifies_text_and_garbage() {
        assert!(matches!(parse_line("a", "compiling..."), StdoutLine::Text(_)));
        assert!(matches!(
            parse_line("a", r#"{"type":"teleport"}"#),
            StdoutLine::Malformed(_)
        ));
    }

    #[test]
    fn reply_lines_are_tagged() {
        let line = AgentReply::CommandDecision {
            request_id: "r1".into(),
            allowed: false,
            reason: Some("blocked".into()),
            tier: Some(PolicyTier::HardcodedBlock),
        }
        .to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "command_decision");
        assert_eq!(value["allowed"], false);
        assert!(!line.contains('\n'));
    }
}
