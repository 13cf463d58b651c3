use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gauntlet_types::{HarnessError, Result};

/// Request/response transport to the target agent's message endpoint.
///
/// Implementations must not cache or share conversational state; the
/// context id is the only correlation between calls.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn send(&self, context_id: &str, text: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub base_url: String,
    /// Path of the message endpoint on the target.
    pub message_path: String,
    /// Per-call timeout. Expiry means "peer is slow or wedged", which is
    /// fatal to the attempt but not to the run.
    pub call_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9004".to_string(),
            message_path: "/message".to_string(),
            call_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Serialize)]
struct PeerRequest<'a> {
    context_id: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
struct PeerReply {
    context_id: String,
    text: String,
}

/// HTTP peer channel. Every call uses a client with connection pooling
/// disabled so a kept-alive socket can never serve a response correlated
/// with the wrong context; correctness over throughput.
pub struct HttpPeerChannel {
    config: PeerConfig,
    client: reqwest::Client,
}

impl HttpPeerChannel {
    pub fn new(config: PeerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| HarnessError::Transport(format!("failed to build client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn for_port(port: u16, message_path: &str, call_timeout: Duration) -> Result<Self> {
        Self::new(PeerConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            message_path: message_path.to_string(),
            call_timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            normalize_path(&self.config.message_path)
        )
    }
}

#[async_trait]
impl PeerChannel for HttpPeerChannel {
    async fn send(&self, context_id: &str, text: &str) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::CONNECTION, "close")
            .json(&PeerRequest {
                context_id,
                message: text,
            })
            .send()
            .await
            .map_err(classify_send_error)?;

        if !response.status().is_success() {
            return Err(HarnessError::Transport(format!(
                "peer returned status {}",
                response.status()
            )));
        }

        let reply: PeerReply = response
            .json()
            .await
            .map_err(|e| HarnessError::Transport(format!("peer reply unreadable: {e}")))?;

        // A reply correlated with another conversation means the transport
        // served us someone else's turn; treat it as fatal to the attempt.
        if reply.context_id != context_id {
            return Err(HarnessError::Transport(format!(
                "peer replied for context {} while {} was in flight",
                reply.context_id, context_id
            )));
        }

        tracing::debug!(
            context_id,
            reply_chars = reply.text.chars().count(),
            "peer reply received"
        );
        Ok(reply.text)
    }
}

fn classify_send_error(error: reqwest::Error) -> HarnessError {
    if error.is_timeout() {
        HarnessError::Timeout(format!("peer call timed out: {error}"))
    } else {
        HarnessError::Transport(format!("peer unreachable: {error}"))
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_and_path() {
        let channel = HttpPeerChannel::new(PeerConfig {
            base_url: "http://127.0.0.1:9004/".to_string(),
            message_path: "message".to_string(),
            call_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(channel.endpoint(), "http://127.0.0.1:9004/message");
    }

    #[test]
    fn request_serializes_context_and_message() {
        let body = serde_json::to_value(PeerRequest {
            context_id: "atk-1",
            message: "hello",
        })
        .unwrap();
        assert_eq!(body["context_id"], "atk-1");
        assert_eq!(body["message"], "hello");
    }

    #[tokio::test]
    async fn unreachable_peer_is_transport_error() {
        // Port 1 is never listening locally.
        let channel =
            HttpPeerChannel::for_port(1, "/message", Duration::from_millis(250)).unwrap();
        let err = channel.send("atk-1", "hi").await.unwrap_err();
        assert!(matches!(err, HarnessError::Transport(_)));
    }
}
