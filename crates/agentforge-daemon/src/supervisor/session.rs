//! Per-agent I/O tasks: the stdin writer and the stdout/stderr readers that
//! answer agent requests.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use agentforge_core::model::AgentKind;
use agentforge_core::{Decision, ErrorKind, OrchestratorEvent, SandboxPolicy};

use super::Inner;
use super::backoff::{RateLimitSignal, detect_rate_limit};
use super::protocol::{AgentMessage, AgentReply, StdoutLine, parse_line};

/// Forward queued lines to the agent's stdin until the channel closes or the
/// pipe breaks.
pub(super) async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}

/// Queue a reply for the stdin writer. Never waits: a full queue drops the
/// reply. Returns whether it was queued.
pub(super) fn queue_reply(
    tx: &mpsc::Sender<String>,
    agent_id: &str,
    reply: &AgentReply,
) -> bool {
    match tx.try_send(reply.to_line()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(agent_id, "Agent is not reading replies, dropping reply");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(agent_id, "Agent stdin closed, dropping reply");
            false
        }
    }
}

/// State needed to answer one agent's requests.
pub(super) struct AgentSession {
    pub(super) inner: Arc<Inner>,
    pub(super) agent_id: String,
    pub(super) kind: AgentKind,
    pub(super) initializer: bool,
    pub(super) sandbox: SandboxPolicy,
    pub(super) stdin_tx: mpsc::Sender<String>,
}

impl AgentSession {
    /// Consume stdout until EOF. Returns the last rate limit seen.
    pub(super) async fn read_stdout<R>(self, stdout: R) -> Option<RateLimitSignal>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(stdout).lines();
        let mut rate_limit = None;
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_line(&self.agent_id, &line) {
                StdoutLine::Message(message) => {
                    if let AgentMessage::Log { message: text, .. } = &message
                        && let Some(signal) = detect_rate_limit(text)
                    {
                        rate_limit = Some(signal);
                    }
                    self.handle(message).await;
                }
                StdoutLine::Malformed(err) => {
                    self.reply(AgentReply::Error {
                        message: format!("malformed message: {err}"),
                    });
                }
                StdoutLine::Text(text) => {
                    debug!(agent_id = %self.agent_id, "stdout: {}", text);
                    if let Some(signal) = detect_rate_limit(&text) {
                        rate_limit = Some(signal);
                    }
                }
            }
        }
        rate_limit
    }

    fn reply(&self, reply: AgentReply) {
        queue_reply(&self.stdin_tx, &self.agent_id, &reply);
    }

    async fn handle(&self, message: AgentMessage) {
        match message {
            AgentMessage::State { state, detail } => {
                self.inner.set_state(&self.agent_id, state, detail).await;
            }
            AgentMessage::CommandRequest {
                request_id,
                command,
            } => self.handle_command(request_id, command),
            AgentMessage::AccessRequest {
                request_id,
                path,
                write,
            } => {
                let reply = match self.sandbox.check_access(&path, write) {
                    Ok(()) => AgentReply::AccessDecision {
                        request_id,
                        allowed: true,
                        reason: None,
                    },
                    Err(violation) => {
                        warn!(
                            agent_id = %self.agent_id,
                            kind = violation.kind().as_str(),
                            path = %violation.path.display(),
                            reason = %violation.reason,
                            "Sandbox access denied"
                        );
                        self.inner.events.publish(OrchestratorEvent::SandboxViolation {
                            agent_id: self.agent_id.clone(),
                            path: violation.path.display().to_string(),
                            reason: violation.reason.clone(),
                        });
                        AgentReply::AccessDecision {
                            request_id,
                            allowed: false,
                            reason: Some(violation.to_string()),
                        }
                    }
                };
                self.reply(reply);
            }
            AgentMessage::FeatureResult {
                feature_id,
                outcome,
            } => {
                match self
                    .inner
                    .claims
                    .release_held(&self.agent_id, feature_id, outcome)
                    .await
                {
                    Ok(feature) => info!(
                        agent_id = %self.agent_id,
                        feature_id,
                        status = %feature.status,
                        "Feature result recorded"
                    ),
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, feature_id, error = %e, "Rejected feature result");
                        self.reply(AgentReply::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
            AgentMessage::CreateFeatures { features } => {
                if !self.initializer {
                    self.reply(AgentReply::Error {
                        message: "only the initializer agent may create features".to_string(),
                    });
                    return;
                }
                let reply = match self.inner.claims.create_bulk(features).await {
                    Ok(created) => {
                        info!(agent_id = %self.agent_id, count = created.len(), "Initializer created features");
                        AgentReply::FeaturesCreated {
                            feature_ids: created.iter().map(|f| f.id).collect(),
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, error = %e, "Feature batch rejected");
                        AgentReply::Error {
                            message: e.to_string(),
                        }
                    }
                };
                self.reply(reply);
            }
            AgentMessage::Log { level, message } => {
                let agent_id = &self.agent_id;
                let kind = self.kind.as_str();
                match level.as_deref() {
                    Some("error") => error!(agent_id, kind, "{}", message),
                    Some("warn" | "warning") => warn!(agent_id, kind, "{}", message),
                    Some("debug" | "trace") => debug!(agent_id, kind, "{}", message),
                    _ => info!(agent_id, kind, "{}", message),
                }
            }
        }
    }

    fn handle_command(&self, request_id: String, command: String) {
        let reply = match self.inner.policy.evaluate(&command) {
            Decision::Allow { tier, .. } => {
                debug!(agent_id = %self.agent_id, command = %command, tier = tier.as_str(), "Command allowed");
                AgentReply::CommandDecision {
                    request_id,
                    allowed: true,
                    reason: None,
                    tier: Some(tier),
                }
            }
            Decision::Deny { reason, tier, .. } => {
                warn!(
                    agent_id = %self.agent_id,
                    kind = ErrorKind::PolicyDenied.as_str(),
                    command = %command,
                    reason = %reason,
                    "Command denied"
                );
                self.inner.events.publish(OrchestratorEvent::CommandDenied {
                    agent_id: self.agent_id.clone(),
                    command,
                    tier,
                    reason: reason.clone(),
                });
                AgentReply::CommandDecision {
                    request_id,
                    allowed: false,
                    reason: Some(reason),
                    tier,
                }
            }
        };
        self.reply(reply);
    }
}

/// Log stderr lines and watch them for rate limits.
pub(super) async fn read_stderr<R>(agent_id: String, stderr: R) -> Option<RateLimitSignal>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut rate_limit = None;
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(agent_id = %agent_id, "stderr: {}", line);
        if let Some(signal) = detect_rate_limit(&line) {
            rate_limit = Some(signal);
        }
    }
    rate_limit
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn error_reply(message: &str) -> AgentReply {
        AgentReply::Error {
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn full_stdin_queue_drops_reply_without_waiting() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(queue_reply(&tx, "agent", &error_reply("first")));
        assert!(!queue_reply(&tx, "agent", &error_reply("second")));

        let queued = rx.recv().await.unwrap();
        assert!(queued.contains("first"));
        assert!(rx.try_recv().is_err());
        assert!(queue_reply(&tx, "agent", &error_reply("third")));
    }

    #[test]
    fn closed_stdin_drops_reply() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!queue_reply(&tx, "agent", &error_reply("late")));
    }
}
