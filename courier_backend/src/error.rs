use thiserror::Error;

/// Failure of a configuration-store or broadcast-log operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration store is unavailable")]
    Unavailable,
    #[error("configuration store error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast start message is empty")]
    EmptyStartMessage,
    #[error("broadcast target list is empty")]
    NoTargets,
    #[error("a broadcast run is already in progress")]
    AlreadyRunning,
}

impl BroadcastError {
    /// True for failures detected before any send was attempted because of
    /// the current broadcast settings.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BroadcastError::EmptyStartMessage | BroadcastError::NoTargets
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing required credentials: {}", .0.join(", "))]
pub struct MissingCredentials(pub Vec<&'static str>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_lists_every_name() {
        let err = MissingCredentials(vec!["TELEGRAM_BOT_TOKEN", "LLM_API_KEY"]);
        assert_eq!(
            err.to_string(),
            "missing required credentials: TELEGRAM_BOT_TOKEN, LLM_API_KEY"
        );
    }

    #[test]
    fn only_settings_failures_are_preconditions() {
        assert!(BroadcastError::NoTargets.is_precondition());
        assert!(BroadcastError::EmptyStartMessage.is_precondition());
        assert!(!BroadcastError::AlreadyRunning.is_precondition());
    }
}
