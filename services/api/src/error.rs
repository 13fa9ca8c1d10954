//! Error taxonomy shared by the provider clients, the store, and the bridge.

/// Failures surfaced by the call pipeline.
///
/// The gateway layer does not distinguish transient from permanent provider
/// failures; retry policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Outbound call placement or status-fetch failure at the telephony
    /// provider, including credential and invalid-number rejections.
    #[error("telephony gateway error: {0}")]
    Gateway(String),

    /// Credential or signing failure against the voice-AI provider.
    #[error("voice provider auth error: {0}")]
    Auth(String),

    /// A provider call id the provider does not know about.
    #[error("unknown provider call id: {0}")]
    NotFound(String),

    /// Internal bridge fault: malformed frame or unexpected state.
    #[error("stream session fault: {0}")]
    Session(String),

    /// Transcript or sentiment write failure.
    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl CallError {
    /// Wraps an HTTP-layer failure talking to a provider.
    pub fn gateway(err: impl std::fmt::Display) -> Self {
        CallError::Gateway(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_layer() {
        let err = CallError::Gateway("connection refused".into());
        assert_eq!(
            err.to_string(),
            "telephony gateway error: connection refused"
        );

        let err = CallError::NotFound("CA123".into());
        assert_eq!(err.to_string(), "unknown provider call id: CA123");
    }

    #[test]
    fn sqlx_errors_become_persistence_failures() {
        let err: CallError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CallError::Persistence(_)));
    }
}
