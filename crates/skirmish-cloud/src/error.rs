#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("request to {target} failed: {message}")]
    Transport { target: String, message: String },
    #[error("request to {target} returned HTTP {status}")]
    Status { target: String, status: u16 },
    #[error("failed to decode response from {target}: {message}")]
    Decode { target: String, message: String },
    #[error("backend authentication failed: {message}")]
    Auth { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(
        "unknown operation '{name}' for provider {provider}; known operations: {}",
        .known.join(", ")
    )]
    UnknownOperation {
        provider: String,
        name: String,
        known: Vec<String>,
    },
    #[error("provider {provider} has not been initialised")]
    NotInitialised { provider: String },
    #[error("run cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::{BackendError, CloudError};

    #[test]
    fn unknown_operation_lists_known_names() {
        let err = CloudError::UnknownOperation {
            provider: "google".to_string(),
            name: "reboot".to_string(),
            known: vec!["instance".to_string(), "ingress".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "unknown operation 'reboot' for provider google; known operations: instance, ingress"
        );
    }

    #[test]
    fn backend_errors_pass_through_transparently() {
        let err = CloudError::from(BackendError::Status {
            target: "zones".to_string(),
            status: 403,
        });
        assert_eq!(err.to_string(), "request to zones returned HTTP 403");
    }
}
