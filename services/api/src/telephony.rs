//! Telephony gateway client (Twilio REST API).
//!
//! Places outbound calls, fetches call metadata for reconciliation, and
//! validates phone numbers. No retry policy lives at this layer; callers
//! decide what a failure means for them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::CallError;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";
const TWILIO_LOOKUP_BASE: &str = "https://lookups.twilio.com/v1";

/// Final (or current) provider-side state of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMetadata {
    pub status: String,
    pub duration_seconds: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Outbound-call initiator and status client against the telephony provider.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Initiates an outbound call that fetches its instructions from
    /// `instructions_url` on answer. Returns the provider call id.
    async fn place_call(
        &self,
        to_number: &str,
        instructions_url: &str,
    ) -> Result<String, CallError>;

    /// Idempotent read of a call's duration, status, and timestamps.
    async fn fetch_call_metadata(
        &self,
        provider_call_id: &str,
    ) -> Result<CallMetadata, CallError>;

    /// Hangs up a live call by updating it to completed.
    async fn terminate_call(&self, provider_call_id: &str) -> Result<(), CallError>;

    /// Best-effort number validation: provider lookup first, permissive
    /// local format check if the lookup is unavailable.
    async fn validate_number(&self, number: &str) -> Result<String, CallError>;
}

pub struct TwilioGateway {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    ring_timeout_secs: u32,
}

impl TwilioGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from_number: config.twilio_from_number.clone(),
            ring_timeout_secs: config.ring_timeout_secs,
        }
    }

    fn calls_url(&self, suffix: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls{}.json",
            TWILIO_API_BASE, self.account_sid, suffix
        )
    }
}

#[async_trait]
impl TelephonyGateway for TwilioGateway {
    async fn place_call(
        &self,
        to_number: &str,
        instructions_url: &str,
    ) -> Result<String, CallError> {
        let ring_timeout = self.ring_timeout_secs.to_string();
        let params: Vec<(&str, &str)> = vec![
            ("To", to_number),
            ("From", &self.from_number),
            ("Url", instructions_url),
            ("Method", "POST"),
            ("Timeout", &ring_timeout),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
            ("Record", "false"),
        ];

        let response = self
            .http
            .post(self.calls_url(""))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(CallError::gateway)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(CallError::gateway)?;
        if !status.is_success() {
            return Err(CallError::Gateway(format!(
                "call placement rejected ({}): {}",
                status,
                body["message"].as_str().unwrap_or("no detail")
            )));
        }

        let call_sid = body["sid"]
            .as_str()
            .ok_or_else(|| CallError::Gateway("no call sid in response".into()))?
            .to_string();
        info!(%call_sid, to = %to_number, "Outbound call initiated");
        Ok(call_sid)
    }

    async fn fetch_call_metadata(
        &self,
        provider_call_id: &str,
    ) -> Result<CallMetadata, CallError> {
        let response = self
            .http
            .get(self.calls_url(&format!("/{provider_call_id}")))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(CallError::gateway)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CallError::NotFound(provider_call_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(CallError::Gateway(format!(
                "call fetch failed with status {}",
                response.status()
            )));
        }

        let body: Value = response.json().await.map_err(CallError::gateway)?;
        Ok(metadata_from_json(&body))
    }

    async fn terminate_call(&self, provider_call_id: &str) -> Result<(), CallError> {
        let response = self
            .http
            .post(self.calls_url(&format!("/{provider_call_id}")))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(CallError::gateway)?;

        if !response.status().is_success() {
            return Err(CallError::Gateway(format!(
                "call termination failed with status {}",
                response.status()
            )));
        }
        info!(call_sid = %provider_call_id, "Call terminated");
        Ok(())
    }

    async fn validate_number(&self, number: &str) -> Result<String, CallError> {
        let lookup = self
            .http
            .get(format!("{}/PhoneNumbers/{}", TWILIO_LOOKUP_BASE, number))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await;

        match lookup {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.map_err(CallError::gateway)?;
                let formatted = body["phone_number"].as_str().unwrap_or(number).to_string();
                Ok(formatted)
            }
            _ => {
                warn!(%number, "Number lookup unavailable, using local format check");
                if basic_format_ok(number) {
                    Ok(number.to_string())
                } else {
                    Err(CallError::Gateway(format!(
                        "'{number}' is not a valid phone number"
                    )))
                }
            }
        }
    }
}

/// Permissive local fallback check: leading "+" and a minimum length.
pub fn basic_format_ok(number: &str) -> bool {
    number.starts_with('+') && number.len() >= 10
}

/// Extracts call metadata from the provider's call resource JSON. Duration
/// arrives as a decimal string, timestamps as RFC 2822.
pub fn metadata_from_json(body: &Value) -> CallMetadata {
    let duration_seconds = body["duration"]
        .as_str()
        .and_then(|d| d.parse::<i32>().ok());
    let parse_time = |key: &str| {
        body[key]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    CallMetadata {
        status: body["status"].as_str().unwrap_or("unknown").to_string(),
        duration_seconds,
        started_at: parse_time("start_time"),
        ended_at: parse_time("end_time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_format_requires_plus_and_length() {
        assert!(basic_format_ok("+15550002222"));
        assert!(basic_format_ok("+919876543210"));
        assert!(!basic_format_ok("15550002222"));
        assert!(!basic_format_ok("+1555"));
        assert!(!basic_format_ok(""));
    }

    #[test]
    fn metadata_parses_completed_call() {
        let body = json!({
            "sid": "CA0123456789abcdef",
            "status": "completed",
            "duration": "312",
            "start_time": "Sat, 29 Aug 2026 10:00:05 +0000",
            "end_time": "Sat, 29 Aug 2026 10:05:17 +0000",
            "direction": "outbound-api"
        });

        let meta = metadata_from_json(&body);
        assert_eq!(meta.status, "completed");
        assert_eq!(meta.duration_seconds, Some(312));
        let started = meta.started_at.expect("start_time should parse");
        let ended = meta.ended_at.expect("end_time should parse");
        assert_eq!((ended - started).num_seconds(), 312);
    }

    #[test]
    fn metadata_tolerates_unanswered_call() {
        // A no-answer call has no duration or end time yet.
        let body = json!({
            "sid": "CA0123456789abcdef",
            "status": "no-answer",
            "duration": null,
            "start_time": null,
            "end_time": null
        });

        let meta = metadata_from_json(&body);
        assert_eq!(meta.status, "no-answer");
        assert_eq!(meta.duration_seconds, None);
        assert!(meta.started_at.is_none());
        assert!(meta.ended_at.is_none());
    }

    #[test]
    fn metadata_defaults_unknown_status() {
        let meta = metadata_from_json(&json!({}));
        assert_eq!(meta.status, "unknown");
    }
}
