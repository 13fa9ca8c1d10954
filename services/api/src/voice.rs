//! Conversational-voice provider client (ElevenLabs Conversational AI).
//!
//! Obtains the single-use signed streaming URL for each session and builds
//! the session-initiation payload.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::CallError;
use crate::ws::protocol::SessionInit;

const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";

/// Client for the conversational-voice provider.
#[async_trait]
pub trait VoiceAgent: Send + Sync {
    /// Fetches a fresh signed WebSocket URL. Signed URLs are single-use and
    /// time-limited, so this must be called once per session and never cached.
    async fn signed_endpoint(&self) -> Result<String, CallError>;

    /// Builds the session-initiation message.
    ///
    /// Override fields are accepted but not sent: most provider agent
    /// configurations reject prompt/greeting overrides as a policy violation,
    /// so the safe contract is a minimal payload that lets the agent's own
    /// preconfigured persona govern the conversation.
    fn session_init(
        &self,
        custom_prompt: Option<&str>,
        first_message: Option<&str>,
    ) -> SessionInit;
}

pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: String,
    agent_id: String,
}

impl ElevenLabsClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.elevenlabs_api_key.clone(),
            agent_id: config.elevenlabs_agent_id.clone(),
        }
    }
}

#[async_trait]
impl VoiceAgent for ElevenLabsClient {
    async fn signed_endpoint(&self) -> Result<String, CallError> {
        let response = self
            .http
            .get(format!(
                "{}/convai/conversation/get_signed_url",
                ELEVENLABS_API_BASE
            ))
            .query(&[("agent_id", self.agent_id.as_str())])
            .header("xi-api-key", &self.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(CallError::gateway)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CallError::Auth(format!(
                "signed URL request rejected with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(CallError::Gateway(format!(
                "signed URL request failed with status {status}"
            )));
        }

        let body: Value = response.json().await.map_err(CallError::gateway)?;
        let url = signed_url_from_json(&body)?;
        info!("Obtained signed streaming URL from voice provider");
        Ok(url)
    }

    fn session_init(
        &self,
        custom_prompt: Option<&str>,
        first_message: Option<&str>,
    ) -> SessionInit {
        if custom_prompt.is_some() || first_message.is_some() {
            debug!("Ignoring prompt/greeting overrides; agent defaults apply");
        }
        SessionInit::default()
    }
}

fn signed_url_from_json(body: &Value) -> Result<String, CallError> {
    body["signed_url"]
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CallError::Gateway("no signed URL in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_url_extracted_from_response() {
        let body = json!({"signed_url": "wss://api.elevenlabs.io/v1/convai/conversation?token=abc"});
        assert_eq!(
            signed_url_from_json(&body).unwrap(),
            "wss://api.elevenlabs.io/v1/convai/conversation?token=abc"
        );
    }

    #[test]
    fn missing_or_empty_signed_url_is_a_gateway_error() {
        assert!(matches!(
            signed_url_from_json(&json!({})),
            Err(CallError::Gateway(_))
        ));
        assert!(matches!(
            signed_url_from_json(&json!({"signed_url": ""})),
            Err(CallError::Gateway(_))
        ));
    }
}
